//! EPUB translation: unpacks an existing EPUB, translates its titles and
//! documents one resumable unit at a time, and packs the result again.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::completion;
use crate::config::Config;
use crate::epub::{self, NavEntry};
use crate::error::PipelineError;
use crate::formats::{TranslatedChapter, TranslatedHtmlFile, TranslationProgress};
use crate::gemini::{self, ContentModel, GenerateRequest, Part};
use crate::ledger::{self, JsonFileLedger, LedgerStore as _};
use crate::workspace::BookPaths;

/// Chapter titles sent per title-translation request.
pub const TITLE_BATCH_SIZE: usize = 10;

static RE_LIST_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\s*").expect("valid regex"));

pub struct Translator<'a> {
    pub model: &'a dyn ContentModel,
    pub config: &'a Config,
    pub paths: &'a BookPaths,
}

impl Translator<'_> {
    /// Translates `input_epub` from `config.source_language` to
    /// `config.target_language` and returns the new archive's path.
    pub async fn run(&self, input_epub: &Path, resume: bool) -> anyhow::Result<PathBuf> {
        let ledger = JsonFileLedger::<TranslationProgress>::new(self.paths.translation_progress());
        if ledger.exists() && !resume {
            anyhow::bail!(
                "translation progress already exists at {}; rerun with --resume to continue it",
                ledger.path().display()
            );
        }
        let mut progress = ledger
            .load_or_seed(TranslationProgress::default)
            .await
            .context("load translation progress")?;

        let extract_dir = self.paths.extract_dir();
        let work_dir = self.paths.translated_dir();
        if !progress.working_copy_created || !work_dir.is_dir() || !extract_dir.is_dir() {
            if !input_epub.is_file() {
                return Err(PipelineError::MissingInput(format!(
                    "input EPUB not found: {}",
                    input_epub.display()
                ))
                .into());
            }
            if progress.working_copy_created {
                tracing::warn!(dir = %work_dir.display(), "working copy missing; translating every document again");
                progress.restart_documents();
            }
            prepare_working_copy(input_epub, &extract_dir, &work_dir)?;
            progress.working_copy_created = true;
            ledger.save(&progress).await?;
        }

        let ncx_rel = find_file(&extract_dir, "toc.ncx")?.ok_or_else(|| PipelineError::MissingFile {
            path: extract_dir.join("toc.ncx"),
        })?;
        let original_ncx_path = extract_dir.join(&ncx_rel);
        let original_ncx = fs::read_to_string(&original_ncx_path)
            .with_context(|| format!("read: {}", original_ncx_path.display()))?;
        let nav = epub::parse_ncx(&original_ncx)?;
        let ncx_dir = ncx_rel.parent().map(Path::to_path_buf).unwrap_or_default();
        tracing::info!(
            entries = nav.len(),
            from = %self.config.source_language,
            to = %self.config.target_language,
            "translating epub"
        );

        if !progress.book_title_translated {
            let title = match self.config.target_title.as_deref().map(str::trim) {
                Some(title) if !title.is_empty() => {
                    tracing::info!(title, "using configured target title");
                    title.to_owned()
                }
                _ => self.translate_book_title().await?,
            };
            tracing::info!(original = %self.paths.title, translated = %title, "book title");
            progress.translated_book_title = title;
            progress.book_title_translated = true;
            ledger.save(&progress).await?;
        }

        if !progress.toc_translated {
            progress.translated_chapters = self.translate_nav_titles(&nav).await?;
            progress.toc_translated = true;
            ledger.save(&progress).await?;
        }

        if track_extra_documents(&mut progress, &extract_dir, &nav)? {
            ledger.save(&progress).await?;
        }

        if !progress.toc_ncx_updated {
            let rewritten = epub::rewrite_ncx_labels(&original_ncx, |src| {
                let name = base_name(src);
                progress
                    .translated_chapters
                    .iter()
                    .find(|c| base_name(&c.src) == name)
                    .map(|c| c.title.clone())
            })?;
            ledger::write_file_atomic(&work_dir.join(&ncx_rel), rewritten.as_bytes()).await?;
            progress.toc_ncx_updated = true;
            ledger.save(&progress).await?;
        }

        if !progress.content_opf_updated {
            self.update_package_title(&work_dir, &progress.translated_book_title)
                .await?;
            progress.content_opf_updated = true;
            ledger.save(&progress).await?;
        }

        let mut previous: Option<String> = None;
        let mut done_sources: HashSet<String> = HashSet::new();
        for position in 0..progress.translated_chapters.len() {
            let chapter = progress.translated_chapters[position].clone();
            let Some(rel) = locate(&extract_dir, &ncx_dir, &chapter.src)? else {
                tracing::warn!(src = %chapter.src, "chapter document not found; skipping");
                continue;
            };
            let path = work_dir.join(&rel);
            if progress.chapter_done(position) {
                tracing::info!(position, title = %chapter.title, "chapter already translated; skipping");
                done_sources.insert(chapter.src.clone());
                previous = self.carry(&path);
                continue;
            }
            if done_sources.contains(&chapter.src) {
                // Several nav entries may point into one document.
                progress.mark_chapter_translated(position);
                ledger.save(&progress).await?;
                continue;
            }

            tracing::info!(
                position = position + 1,
                total = progress.translated_chapters.len(),
                original = %chapter.original_title,
                translated = %chapter.title,
                "translating chapter"
            );
            let translated = self
                .translate_document(
                    &extract_dir.join(&rel),
                    &chapter.title,
                    &progress.translated_book_title,
                    previous.as_deref(),
                )
                .await
                .with_context(|| format!("translate chapter {}", chapter.src))?;
            ledger::write_file_atomic(&path, translated.as_bytes()).await?;
            progress.mark_chapter_translated(position);
            ledger.save(&progress).await?;
            done_sources.insert(chapter.src);
            previous = Some(translated);
        }

        for position in 0..progress.translated_html_files.len() {
            let file = progress.translated_html_files[position].clone();
            let path = work_dir.join(&file.src);
            if progress.html_done(position) {
                tracing::info!(src = %file.src, "document already translated; skipping");
                previous = self.carry(&path);
                continue;
            }
            let source = extract_dir.join(&file.src);
            if !source.is_file() {
                tracing::warn!(src = %file.src, "document not found; skipping");
                continue;
            }

            tracing::info!(
                position = position + 1,
                total = progress.translated_html_files.len(),
                src = %file.src,
                "translating additional document"
            );
            let translated = self
                .translate_document(
                    &source,
                    &file.title,
                    &progress.translated_book_title,
                    previous.as_deref(),
                )
                .await
                .with_context(|| format!("translate document {}", file.src))?;
            ledger::write_file_atomic(&path, translated.as_bytes()).await?;
            progress.mark_html_translated(position);
            ledger.save(&progress).await?;
            previous = Some(translated);
        }

        let out = self.paths.translated_epub(
            &progress.translated_book_title,
            &epub::guess_lang_tag(&self.config.target_language),
        );
        epub::write_archive(&work_dir, &out).context("write translated epub")?;
        tracing::info!(path = %out.display(), "translated epub written");
        Ok(out)
    }

    fn carry(&self, path: &Path) -> Option<String> {
        if self.config.previous_content_limit == 0 {
            return None;
        }
        fs::read_to_string(path).ok()
    }

    async fn translate_book_title(&self) -> anyhow::Result<String> {
        let prompt = format!(
            "Translate the following book title from {} to {}.\n\
             Only return the translated title without any explanations or additional text.\n\n\
             Book title: {}",
            self.config.source_language, self.config.target_language, self.paths.title
        );
        let request = GenerateRequest::new(&self.config.model, 0.1, vec![Part::text(prompt)]);
        let response = gemini::invoke(
            self.model,
            &request,
            &self.config.retry_policy(),
            "book title translation",
            self.config.use_streaming,
        )
        .await?;
        let title = response.text().trim().to_owned();
        if title.is_empty() {
            tracing::warn!("empty title translation; keeping the original title");
            return Ok(self.paths.title.clone());
        }
        Ok(title)
    }

    /// One record per navigation entry, translated in numbered batches.
    async fn translate_nav_titles(&self, nav: &[NavEntry]) -> anyhow::Result<Vec<TranslatedChapter>> {
        let mut out = Vec::with_capacity(nav.len());
        for (batch_no, batch) in nav.chunks(TITLE_BATCH_SIZE).enumerate() {
            let titles: Vec<String> = batch.iter().map(|e| e.label.clone()).collect();
            let mut listing = String::new();
            for (j, title) in titles.iter().enumerate() {
                listing.push_str(&format!("{}. {}\n", j + 1, title));
            }
            let prompt = format!(
                "Translate the following chapter titles from {} to {}.\n\
                 Return only the translated titles, one per line, numbered as in the original list.\n\n{}",
                self.config.source_language, self.config.target_language, listing
            );
            let request = GenerateRequest::new(&self.config.model, 0.1, vec![Part::text(prompt)]);
            let operation = format!("chapter title translation (batch {})", batch_no + 1);
            let response = gemini::invoke(
                self.model,
                &request,
                &self.config.retry_policy(),
                &operation,
                self.config.use_streaming,
            )
            .await?;

            let translated = merge_title_batch(&titles, response.text());
            for (entry, title) in batch.iter().zip(translated) {
                out.push(TranslatedChapter {
                    title,
                    src: entry.src.clone(),
                    original_title: entry.label.clone(),
                    translated: false,
                });
            }
        }
        Ok(out)
    }

    async fn update_package_title(&self, work_dir: &Path, title: &str) -> anyhow::Result<()> {
        let Some(opf_rel) = find_file(work_dir, "content.opf")? else {
            tracing::warn!("content.opf not found; package title left unchanged");
            return Ok(());
        };
        let path = work_dir.join(opf_rel);
        let opf = fs::read_to_string(&path).with_context(|| format!("read: {}", path.display()))?;
        match epub::replace_opf_title(&opf, title) {
            Some(updated) => ledger::write_file_atomic(&path, updated.as_bytes()).await,
            None => {
                tracing::warn!(path = %path.display(), "no dc:title in package document");
                Ok(())
            }
        }
    }

    /// Translates the document at `source`, which is always the untouched
    /// extracted copy so a rerun never feeds translated text back in.
    async fn translate_document(
        &self,
        source: &Path,
        title: &str,
        book_title: &str,
        previous: Option<&str>,
    ) -> anyhow::Result<String> {
        let html =
            fs::read_to_string(source).with_context(|| format!("read: {}", source.display()))?;
        let context = completion::context_excerpt(previous, self.config.previous_content_limit)
            .map(|excerpt| {
                format!(
                    "Previous chapter content (for context only, do not translate this again):\n{excerpt}\n\n"
                )
            })
            .unwrap_or_default();
        let prompt = document_prompt(
            &self.config.source_language,
            &self.config.target_language,
            book_title,
            title,
            &context,
        );
        let request = GenerateRequest::new(
            &self.config.model,
            0.2,
            vec![Part::text(prompt), Part::text(html)],
        );
        let operation = format!("HTML translation for {title}");
        let translated = completion::generate_html(
            self.model,
            &request,
            &self.config.retry_policy(),
            &operation,
            self.config.use_streaming,
        )
        .await?;
        Ok(epub::ensure_xhtml_void_tags(&translated))
    }
}

/// Pairs each original title with its line of the model's numbered answer.
/// Titles the answer does not cover keep their original text.
pub fn merge_title_batch(originals: &[String], answer: &str) -> Vec<String> {
    let lines: Vec<String> = answer
        .trim()
        .lines()
        .map(|line| RE_LIST_NUMBER.replace(line.trim(), "").trim().to_owned())
        .filter(|line| !line.is_empty())
        .collect();
    if lines.len() < originals.len() {
        tracing::warn!(
            expected = originals.len(),
            received = lines.len(),
            "short title batch; keeping original titles for the rest"
        );
    }
    originals
        .iter()
        .enumerate()
        .map(|(i, original)| lines.get(i).cloned().unwrap_or_else(|| original.clone()))
        .collect()
}

/// Adds a pending record for every HTML document the navigation map does not
/// cover. Returns whether anything was added.
fn track_extra_documents(
    progress: &mut TranslationProgress,
    extract_dir: &Path,
    nav: &[NavEntry],
) -> anyhow::Result<bool> {
    let chapter_names: HashSet<&str> = nav.iter().map(|e| base_name(&e.src)).collect();
    let tracked: HashSet<String> = progress
        .translated_html_files
        .iter()
        .map(|f| f.src.clone())
        .collect();

    let mut added = false;
    for rel in html_documents(extract_dir)? {
        if chapter_names.contains(base_name(&rel)) || tracked.contains(&rel) {
            continue;
        }
        let title = format!("Additional content: {}", base_name(&rel));
        progress.translated_html_files.push(TranslatedHtmlFile {
            src: rel,
            translated: false,
            title,
        });
        added = true;
    }
    if added {
        tracing::info!(
            documents = progress.translated_html_files.len(),
            "tracking documents outside the navigation map"
        );
    }
    Ok(added)
}

/// Every `*.htm*` file under `root`, as `/`-separated relative paths.
fn html_documents(root: &Path) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    for path in epub::list_files_sorted(root)? {
        let is_html = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.to_ascii_lowercase().starts_with("htm") || e.eq_ignore_ascii_case("xhtml"));
        if is_html {
            out.push(relative(root, &path)?);
        }
    }
    Ok(out)
}

/// Unpacks `input` into `extract_dir` and mirrors it into `work_dir`. Sources
/// are always read from `extract_dir`; translations land in `work_dir`.
fn prepare_working_copy(input: &Path, extract_dir: &Path, work_dir: &Path) -> anyhow::Result<()> {
    for dir in [extract_dir, work_dir] {
        if dir.exists() {
            fs::remove_dir_all(dir).with_context(|| format!("remove stale dir: {}", dir.display()))?;
        }
    }
    epub::extract_archive(input, extract_dir)?;
    for path in epub::list_files_sorted(extract_dir)? {
        let rel = path
            .strip_prefix(extract_dir)
            .with_context(|| format!("strip prefix: {}", path.display()))?;
        let dest = work_dir.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create dir: {}", parent.display()))?;
        }
        fs::copy(&path, &dest).with_context(|| format!("copy to {}", dest.display()))?;
    }
    tracing::info!(input = %input.display(), dir = %work_dir.display(), "working copy created");
    Ok(())
}

/// The first file named `name` under `root`, relative to `root`.
fn find_file(root: &Path, name: &str) -> anyhow::Result<Option<PathBuf>> {
    for path in epub::list_files_sorted(root)? {
        if path.file_name().is_some_and(|n| n == name) {
            return Ok(Some(path.strip_prefix(root).unwrap_or(&path).to_path_buf()));
        }
    }
    Ok(None)
}

/// Resolves a navigation `src` against the NCX directory, falling back to a
/// search by file name. The result is relative to `root`.
fn locate(root: &Path, ncx_dir: &Path, src: &str) -> anyhow::Result<Option<PathBuf>> {
    let direct = ncx_dir.join(src);
    if root.join(&direct).is_file() {
        return Ok(Some(direct));
    }
    find_file(root, base_name(src))
}

fn relative(root: &Path, path: &Path) -> anyhow::Result<String> {
    Ok(path
        .strip_prefix(root)
        .with_context(|| format!("strip prefix: {}", path.display()))?
        .to_string_lossy()
        .replace('\\', "/"))
}

fn base_name(src: &str) -> &str {
    src.rsplit('/').next().unwrap_or(src)
}

fn document_prompt(
    source: &str,
    target: &str,
    book_title: &str,
    title: &str,
    context: &str,
) -> String {
    format!(
        r#"Translate the HTML document that follows this message from {source} to {target}.

Book title: {book_title}
Chapter title: {title}

Response format:
- Begin directly with <?xml, <!DOCTYPE html> or <html>.
- Return only the raw HTML, not JSON or markdown, with no code fences and no commentary.

Translation rules:
1. Keep every tag, attribute and the document structure exactly as they are.
2. Translate only the text between tags, plus alt and title attributes.
3. Keep class names, ids, image references and links unchanged.
4. Make the translation accurate and natural in {target}.
5. Use the standard {target} form of names of people, places and works where one exists.

{context}Return only the translated HTML."#
    )
}
