use anyhow::Context as _;

use crate::config::Config;
use crate::formats::BookStructure;
use crate::gemini::{self, ContentModel, GenerateRequest, Part};
use crate::ledger;
use crate::pdf::PdfDocument;
use crate::retry::RetryPolicy;
use crate::workspace::BookPaths;

pub const OPERATION: &str = "structure analysis";

fn prompt(title: &str) -> String {
    format!(
        r#"Analyze the attached PDF of the book "{title}" and describe its structure as JSON with exactly this shape:

{{
  "cover_page": {{"page_number": 1}},
  "table_of_contents": {{
    "start_page": 2,
    "end_page": 3,
    "entries": [{{"title": "...", "page_number": 5, "level": 1}}]
  }},
  "chapters": [
    {{
      "title": "...",
      "start_page": 5,
      "end_page": 20,
      "level": 1,
      "subchapters": [{{"title": "...", "start_page": 6, "end_page": 9, "level": 2, "subchapters": []}}]
    }}
  ],
  "back_cover": {{"page_number": 120}}
}}

Rules:
- Every page number is the position of the page inside this PDF file, starting at 1. Ignore page numbers printed on the pages.
- Chapters are listed in reading order. A chapter may end on the page where the next one starts when there is no clean page break.
- Keep every title exactly as written in the book, in its original language.
- Use level 1 for top-level chapters and increase it for each level of nesting.
- Output only the JSON object."#
    )
}

/// Sends the whole PDF to the model and parses the returned layout.
///
/// Transport failures are retried straight away up to `num_retries` times.
/// An answer that is not valid structure JSON is fatal.
pub async fn analyze(
    model: &dyn ContentModel,
    pdf_bytes: &[u8],
    title: &str,
    config: &Config,
) -> anyhow::Result<BookStructure> {
    let request = GenerateRequest::new(
        &config.model,
        0.1,
        vec![Part::pdf(pdf_bytes), Part::text(prompt(title))],
    )
    .json_response();
    let policy = RetryPolicy::immediate(config.num_retries);

    tracing::info!(title, bytes = pdf_bytes.len(), "analyzing book structure");
    let response = gemini::invoke(model, &request, &policy, OPERATION, false).await?;
    let structure = parse_structure(response.text())?;
    tracing::info!(chapters = structure.chapters.len(), "structure analysis complete");
    Ok(structure)
}

pub fn parse_structure(raw: &str) -> anyhow::Result<BookStructure> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).context("parse book structure json")
}

/// The cached structure for this book, analyzing the PDF only when no cache
/// exists yet.
pub async fn load_or_analyze(
    paths: &BookPaths,
    pdf_path: &std::path::Path,
    model: &dyn ContentModel,
    config: &Config,
) -> anyhow::Result<BookStructure> {
    let cache = paths.structure_json();
    if let Some(structure) = ledger::read_json::<BookStructure>(&cache)
        .await
        .with_context(|| format!("read: {}", cache.display()))?
    {
        tracing::info!(path = %cache.display(), "using cached book structure");
        return Ok(structure);
    }

    let bytes = tokio::fs::read(pdf_path)
        .await
        .with_context(|| format!("read pdf: {}", pdf_path.display()))?;
    let structure = analyze(model, &bytes, &paths.title, config).await?;

    if let Ok(pdf) = PdfDocument::load(&bytes) {
        for problem in structure.problems(pdf.page_count()) {
            tracing::warn!(%problem, "suspicious book structure");
        }
    }

    ledger::write_json_atomic(&cache, &structure)
        .await
        .with_context(|| format!("write: {}", cache.display()))?;
    tracing::info!(path = %cache.display(), "saved book structure");
    Ok(structure)
}
