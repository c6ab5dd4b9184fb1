//! Pulls a well-formed HTML document out of raw model output.
//!
//! Models wrap answers in code fences, JSON envelopes or chatty preambles, and
//! long answers may be cut off mid-document. [`clean_html`] strips the
//! wrapping and either returns the document or reports that the output is an
//! unfinished prefix that needs a continuation.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::SanitizeError;

static RE_FULL_DOCUMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)(?:<\?xml.*?\?>\s*)?(?:<!DOCTYPE[^>]*>\s*)?<html.*?>.*?</html>")
        .expect("valid regex")
});
static RE_BODY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<body.*?>.*?</body>").expect("valid regex"));
static RE_DIV: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<div.*?>.*?</div>").expect("valid regex"));

static RE_OPEN_HTML: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<html.*?>").expect("valid regex"));
static RE_OPEN_BODY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<body.*?>").expect("valid regex"));
static RE_OPEN_DIV: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<div.*?>").expect("valid regex"));

static RE_FENCE_HTML: Lazy<Regex> = Lazy::new(|| Regex::new(r"```html\s*").expect("valid regex"));
static RE_FENCE_TRAILING: Lazy<Regex> = Lazy::new(|| Regex::new(r"```\s*$").expect("valid regex"));
static RE_FENCE_ANY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```[a-zA-Z]*\s*").expect("valid regex"));
static RE_BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{2,}").expect("valid regex"));

const PREVIEW_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cleaned {
    Complete(String),
    /// The output opens a document but never closes it.
    Partial(String),
}

pub fn clean_html(raw: &str, previous_partial: Option<&str>) -> Result<Cleaned, SanitizeError> {
    let stitched;
    let mut text = raw;
    if let Some(previous) = previous_partial {
        if RE_FULL_DOCUMENT.is_match(raw) {
            tracing::info!("continuation returned a complete document; using it alone");
        } else {
            stitched = format!("{previous}{raw}");
            text = &stitched;
        }
    }

    let text = unwrap_json(text);
    let text = strip_fences(&text);

    let found = RE_FULL_DOCUMENT
        .find(&text)
        .or_else(|| RE_BODY.find(&text))
        .or_else(|| RE_DIV.find(&text));

    let Some(found) = found else {
        if RE_OPEN_HTML.is_match(&text)
            || RE_OPEN_BODY.is_match(&text)
            || RE_OPEN_DIV.is_match(&text)
        {
            tracing::warn!(chars = text.len(), "output is an unfinished document");
            return Ok(Cleaned::Partial(text));
        }
        tracing::error!("no HTML structure found in model output");
        tracing::debug!(preview = %preview(&text), "unparseable output");
        return Err(SanitizeError::NoStructure);
    };

    let html = found.as_str().trim();
    if html.is_empty() {
        return Err(SanitizeError::Empty);
    }
    Ok(Cleaned::Complete(html.to_owned()))
}

/// Accepts `"..."` or `{"html": "..."}` envelopes; anything else is returned
/// unchanged.
fn unwrap_json(text: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::String(inner)) => inner,
        Ok(serde_json::Value::Object(map)) => match map.get("html") {
            Some(serde_json::Value::String(inner)) => inner.clone(),
            _ => text.to_owned(),
        },
        _ => text.to_owned(),
    }
}

fn strip_fences(text: &str) -> String {
    let text = RE_FENCE_HTML.replace_all(text, "");
    let text = RE_FENCE_TRAILING.replace_all(&text, "");
    RE_FENCE_ANY.replace_all(&text, "").into_owned()
}

/// Head and tail of `text`, for logs.
pub fn preview(text: &str) -> String {
    let squeezed = RE_BLANK_RUNS.replace_all(text, "\n");
    let count = squeezed.chars().count();
    if count <= PREVIEW_CHARS * 2 {
        return squeezed.into_owned();
    }
    let head: String = squeezed.chars().take(PREVIEW_CHARS).collect();
    let tail: String = squeezed.chars().skip(count - PREVIEW_CHARS).collect();
    format!("{head}\n ... \n{tail}")
}
