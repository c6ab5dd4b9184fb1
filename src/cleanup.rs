use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::Context as _;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::epub;

static RE_IMG_SRC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<img\b[^>]*?\bsrc\s*=\s*["']\.\./images/([^"']+)["']"#).expect("valid regex")
});
static RE_XLINK_HREF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"xlink:href\s*=\s*["']images/([^"']+)["']"#).expect("valid regex")
});
static RE_OPF_COVER_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<item\b[^>]*\bid\s*=\s*["']cover["'][^>]*\bhref\s*=\s*["']images/([^"']+)["']"#)
        .expect("valid regex")
});

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub kept: Vec<String>,
    pub removed: Vec<String>,
}

/// Image file names referenced by the documents under `epub_dir`: chapter
/// `<img>` tags, the title page's SVG image and the package's cover item.
pub fn referenced_images(epub_dir: &Path) -> anyhow::Result<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    if !epub_dir.is_dir() {
        return Ok(out);
    }
    for path in epub::list_files_sorted(epub_dir)? {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let patterns: Vec<&Regex> = match ext.as_str() {
            "html" | "htm" | "xhtml" => vec![&*RE_IMG_SRC, &*RE_XLINK_HREF],
            "opf" => vec![&*RE_OPF_COVER_ITEM],
            _ => continue,
        };
        let text = fs::read_to_string(&path)
            .with_context(|| format!("read document: {}", path.display()))?;
        for re in patterns {
            out.extend(re.captures_iter(&text).map(|caps| caps[1].to_owned()));
        }
    }
    Ok(out)
}

/// Deletes files in `epub_dir/images` that no document references. Failed
/// deletions are logged and skipped.
pub fn remove_unreferenced_images(epub_dir: &Path) -> anyhow::Result<CleanupReport> {
    let images_dir = epub_dir.join("images");
    let mut report = CleanupReport::default();
    if !images_dir.is_dir() {
        return Ok(report);
    }
    let referenced = referenced_images(epub_dir)?;

    let mut names: Vec<String> = fs::read_dir(&images_dir)
        .with_context(|| format!("read dir: {}", images_dir.display()))?
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();

    for name in names {
        if referenced.contains(&name) {
            report.kept.push(name);
            continue;
        }
        let path = images_dir.join(&name);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(image = %name, "removed unreferenced image");
                report.removed.push(name);
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove unreferenced image");
            }
        }
    }
    Ok(report)
}
