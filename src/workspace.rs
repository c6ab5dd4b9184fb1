use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::epub;
use crate::pdf::PdfDocument;

/// `(max side in px, JPEG quality, grayscale)`, mildest first.
const COMPRESSION_LADDER: [(u32, u8, bool); 3] =
    [(1600, 60, false), (1200, 40, false), (1000, 30, true)];

/// On-disk layout of everything produced for one book:
///
/// ```text
/// <output_dir>/<title>/
///   input.pdf  input_original.pdf  book_structure.json
///   generation_progress.json  translation_progress.json
///   logs/process.log
///   epub/{mimetype, META-INF/, content.opf, toc.ncx, stylesheet.css,
///         titlepage.xhtml, text/, images/}
///   extract/  translated/
///   <title>.epub  <translated title>.epub
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookPaths {
    pub title: String,
    pub root: PathBuf,
}

impl BookPaths {
    pub fn new(output_dir: &Path, title: &str) -> Self {
        Self {
            title: title.to_owned(),
            root: output_dir.join(safe_file_name(title)),
        }
    }

    pub fn input_pdf(&self) -> PathBuf {
        self.root.join("input.pdf")
    }

    pub fn original_pdf(&self) -> PathBuf {
        self.root.join("input_original.pdf")
    }

    pub fn structure_json(&self) -> PathBuf {
        self.root.join("book_structure.json")
    }

    pub fn generation_progress(&self) -> PathBuf {
        self.root.join("generation_progress.json")
    }

    pub fn translation_progress(&self) -> PathBuf {
        self.root.join("translation_progress.json")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("logs").join("process.log")
    }

    pub fn epub_dir(&self) -> PathBuf {
        self.root.join("epub")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.epub_dir().join("images")
    }

    pub fn text_dir(&self) -> PathBuf {
        self.epub_dir().join("text")
    }

    pub fn chapter_file(&self, index: usize) -> PathBuf {
        self.epub_dir().join(epub::chapter_href(index))
    }

    pub fn epub_output(&self) -> PathBuf {
        self.root.join(format!("{}.epub", safe_file_name(&self.title)))
    }

    pub fn extract_dir(&self) -> PathBuf {
        self.root.join("extract")
    }

    pub fn translated_dir(&self) -> PathBuf {
        self.root.join("translated")
    }

    /// Archive for a translation. A title that would land on
    /// [`Self::epub_output`] gets the target language tag appended.
    pub fn translated_epub(&self, translated_title: &str, lang_tag: &str) -> PathBuf {
        let name = safe_file_name(translated_title);
        if name == safe_file_name(&self.title) {
            return self
                .root
                .join(format!("{name}.{}.epub", safe_file_name(lang_tag)));
        }
        self.root.join(format!("{name}.epub"))
    }
}

/// `title` with path separators and other characters that are unsafe in file
/// names replaced by `_`.
pub fn safe_file_name(title: &str) -> String {
    let cleaned: String = title
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_owned();
    if cleaned.is_empty() {
        "book".to_owned()
    } else {
        cleaned
    }
}

/// Copies `input` into the book directory once. Inputs larger than
/// `threshold_bytes` are kept as `input_original.pdf` and the working copy is
/// recompressed. Returns the working copy.
pub fn prepare_input(paths: &BookPaths, input: &Path, threshold_bytes: u64) -> anyhow::Result<PathBuf> {
    let working = paths.input_pdf();
    if working.is_file() {
        tracing::info!(path = %working.display(), "using existing working copy of input");
        return Ok(working);
    }
    if !input.is_file() {
        anyhow::bail!("input PDF not found: {}", input.display());
    }
    fs::create_dir_all(&paths.root)
        .with_context(|| format!("create book dir: {}", paths.root.display()))?;

    let bytes = fs::read(input).with_context(|| format!("read input: {}", input.display()))?;
    let size = bytes.len() as u64;
    let to_write = if size > threshold_bytes {
        tracing::info!(
            size_mb = size / (1024 * 1024),
            threshold_mb = threshold_bytes / (1024 * 1024),
            "input exceeds size threshold; compressing"
        );
        fs::write(paths.original_pdf(), &bytes)
            .with_context(|| format!("write backup: {}", paths.original_pdf().display()))?;
        match compress_pdf(&bytes, threshold_bytes) {
            Ok(Some(smaller)) => smaller,
            Ok(None) => {
                tracing::warn!("compression did not shrink the input; using it as is");
                bytes
            }
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "compression failed; using input as is");
                bytes
            }
        }
    } else {
        bytes
    };

    let tmp = working.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, &to_write).with_context(|| format!("write: {}", tmp.display()))?;
    fs::rename(&tmp, &working)
        .with_context(|| format!("rename to {}", working.display()))?;
    tracing::info!(path = %working.display(), bytes = to_write.len(), "prepared input");
    Ok(working)
}

/// Walks the compression ladder until the result fits under `threshold_bytes`.
/// Returns the smallest result, or `None` if nothing beat the original.
pub fn compress_pdf(original: &[u8], threshold_bytes: u64) -> anyhow::Result<Option<Vec<u8>>> {
    let mut best: Option<Vec<u8>> = None;
    for (max_side, quality, grayscale) in COMPRESSION_LADDER {
        let mut doc = PdfDocument::load(original)?;
        let rewritten = doc.recompress_images(max_side, quality, grayscale);
        let bytes = doc.to_bytes()?;
        tracing::info!(
            max_side,
            quality,
            grayscale,
            images = rewritten,
            bytes = bytes.len(),
            "compression attempt"
        );
        let current_best = best.as_ref().map_or(original.len(), Vec::len);
        if bytes.len() < current_best {
            best = Some(bytes);
        }
        if best
            .as_ref()
            .is_some_and(|b| b.len() as u64 <= threshold_bytes)
        {
            break;
        }
    }
    Ok(best)
}
