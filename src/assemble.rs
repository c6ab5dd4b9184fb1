//! EPUB assembly: turns an analyzed PDF into an unpacked EPUB tree and then
//! an archive, one resumable stage at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::cleanup;
use crate::completion;
use crate::config::Config;
use crate::epub::{self, CoverImage, PackageMetadata};
use crate::formats::{BookStructure, Chapter, GenerationProgress, UnitRecord};
use crate::gemini::{ContentModel, GenerateRequest, Part};
use crate::ledger::{self, JsonFileLedger, LedgerStore as _};
use crate::pdf::PdfDocument;
use crate::workspace::BookPaths;

/// Pages of context added on each side of a chapter's range.
pub const PAGE_MARGIN: u32 = 3;
const IMAGE_QUALITY: u8 = 95;
const FALLBACK_COVER_SIZE: (u32, u32) = (600, 800);

static RE_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"<div class="image-placeholder" id="([^"]+)" data-page="(\d+)" data-description="([^"]*)"\s*(?:/>|>\s*</div>)"#,
    )
    .expect("valid regex")
});

/// Everything one assembly run reads. The model and config are shared with
/// the other pipelines.
pub struct Assembler<'a> {
    pub model: &'a dyn ContentModel,
    pub config: &'a Config,
    pub paths: &'a BookPaths,
    pub structure: &'a BookStructure,
}

impl Assembler<'_> {
    /// Builds (or finishes building) the EPUB for `pdf_path` and returns the
    /// archive path.
    ///
    /// Without `resume` an existing progress file is an error, so a previous
    /// run's state is never clobbered by accident.
    pub async fn run(&self, pdf_path: &Path, resume: bool) -> anyhow::Result<PathBuf> {
        let ledger = JsonFileLedger::<GenerationProgress>::new(self.paths.generation_progress());
        if ledger.exists() && !resume {
            anyhow::bail!(
                "generation progress already exists at {}; rerun with --resume to continue it",
                ledger.path().display()
            );
        }
        let mut progress = ledger
            .load_or_seed(|| GenerationProgress::seeded(self.structure))
            .await
            .context("load generation progress")?;
        if self.backfill(&mut progress) {
            ledger.save(&progress).await?;
        }

        let pdf_bytes = tokio::fs::read(pdf_path)
            .await
            .with_context(|| format!("read pdf: {}", pdf_path.display()))?;
        let pdf = PdfDocument::load(&pdf_bytes)
            .with_context(|| format!("load pdf: {}", pdf_path.display()))?;
        let lang = epub::guess_lang_tag(&self.config.source_language);
        let epub_dir = self.paths.epub_dir();

        tracing::info!(
            title = %self.paths.title,
            pages = pdf.page_count(),
            chapters = self.structure.chapters.len(),
            "assembling epub"
        );

        let mimetype = epub_dir.join("mimetype");
        if !trusted(progress.mimetype_created, &mimetype, "mimetype") {
            write_text(&mimetype, epub::MIMETYPE).await?;
            progress.mimetype_created = true;
            ledger.save(&progress).await?;
        }

        let container = epub_dir.join("META-INF").join("container.xml");
        if !trusted(progress.container_xml_created, &container, "container") {
            write_text(&container, &epub::render_container_xml()).await?;
            progress.container_xml_created = true;
            ledger.save(&progress).await?;
        }

        let cover_present = progress.cover_image_filename.is_empty()
            || self
                .paths
                .images_dir()
                .join(&progress.cover_image_filename)
                .is_file();
        if !progress.cover_extracted || !cover_present {
            if progress.cover_extracted {
                tracing::warn!(stage = "cover", "cover image recorded as done is missing; extracting again");
            }
            progress.cover_image_filename = self.extract_cover(&pdf).await?;
            progress.cover_extracted = true;
            ledger.save(&progress).await?;
        }

        let titlepage = epub_dir.join(epub::TITLEPAGE_FILE);
        if !trusted(progress.cover_html_created, &titlepage, "titlepage") {
            let html = self.render_titlepage(&progress.cover_image_filename, &lang);
            write_text(&titlepage, &html).await?;
            progress.cover_html_created = true;
            ledger.save(&progress).await?;
        }

        let stylesheet = epub_dir.join(epub::STYLESHEET_FILE);
        if !trusted(progress.stylesheet_created, &stylesheet, "stylesheet") {
            write_text(&stylesheet, epub::STYLESHEET).await?;
            progress.stylesheet_created = true;
            ledger.save(&progress).await?;
        }

        let ncx = epub_dir.join("toc.ncx");
        if !trusted(progress.toc_ncx_created, &ncx, "toc.ncx") {
            let xml = epub::render_toc_ncx(
                &self.paths.title,
                &progress.book_uuid,
                &lang,
                &progress.chapter_titles,
            );
            write_text(&ncx, &xml).await?;
            progress.toc_ncx_created = true;
            ledger.save(&progress).await?;
        }

        let toc_html = epub_dir.join(epub::TOC_HTML_FILE);
        if !trusted(progress.toc_html_created, &toc_html, "toc.html") {
            let html = self.toc_document(&pdf, &progress.chapter_titles, &lang).await?;
            write_text(&toc_html, &html).await?;
            progress.toc_html_created = true;
            ledger.save(&progress).await?;
        }

        let mut previous: Option<String> = None;
        for (i, chapter) in self.structure.chapters.iter().enumerate() {
            let index = i + 1;
            let path = self.paths.chapter_file(index);
            if progress.chapter_done(index) {
                if path.is_file() {
                    tracing::info!(chapter = index, title = %chapter.title, "chapter already generated; skipping");
                    if self.config.previous_content_limit > 0 {
                        previous = tokio::fs::read_to_string(&path).await.ok();
                    }
                    continue;
                }
                tracing::warn!(
                    chapter = index,
                    path = %path.display(),
                    "chapter recorded as done is missing; regenerating"
                );
                progress.unmark_chapter(index);
                ledger.save(&progress).await?;
            }
            if progress.content_opf_created {
                // The manifest lists the images chapters reference.
                progress.content_opf_created = false;
                ledger.save(&progress).await?;
                tracing::info!(chapter = index, "package document will be rendered again");
            }

            let html = self
                .generate_chapter(&pdf, index, chapter, previous.as_deref())
                .await
                .with_context(|| format!("generate chapter {index} ({})", chapter.title))?;
            write_text(&path, &html).await?;
            progress.mark_chapter_generated(index, &chapter.title);
            ledger.save(&progress).await?;
            tracing::info!(chapter = index, path = %path.display(), "chapter written");
            previous = Some(html);
        }

        let opf = epub_dir.join("content.opf");
        if !trusted(progress.content_opf_created, &opf, "content.opf") {
            let xml = self.render_package(&progress, &lang)?;
            write_text(&opf, &xml).await?;
            progress.content_opf_created = true;
            ledger.save(&progress).await?;
        }

        match cleanup::remove_unreferenced_images(&epub_dir) {
            Ok(report) => tracing::info!(
                kept = report.kept.len(),
                removed = report.removed.len(),
                "image cleanup done"
            ),
            Err(err) => tracing::warn!(error = %format!("{err:#}"), "image cleanup failed"),
        }

        let out = self.paths.epub_output();
        epub::write_archive(&epub_dir, &out).context("write epub archive")?;
        tracing::info!(path = %out.display(), "epub written");
        Ok(out)
    }

    /// Fills fields an older or hand-edited progress file may lack. Returns
    /// whether anything changed.
    fn backfill(&self, progress: &mut GenerationProgress) -> bool {
        let mut changed = false;
        if progress.chapters.is_empty() && !self.structure.chapters.is_empty() {
            let records: Vec<UnitRecord> = self
                .structure
                .chapters
                .iter()
                .enumerate()
                .map(|(i, chapter)| UnitRecord {
                    index: i + 1,
                    title: chapter.title.clone(),
                    generated: progress.chapter_done(i + 1),
                })
                .collect();
            progress.chapters = records;
            changed = true;
        }
        if progress.chapter_titles.is_empty() {
            progress.chapter_titles = self
                .structure
                .chapters
                .iter()
                .map(|c| c.title.clone())
                .collect();
            changed = true;
        }
        if progress.book_uuid.is_empty() {
            progress.book_uuid = uuid::Uuid::new_v4().to_string();
            changed = true;
        }
        changed
    }

    /// Saves the largest image on the cover page as `images/cover.jpg`.
    /// Returns the file name, or an empty string when the page has no usable
    /// image.
    async fn extract_cover(&self, pdf: &PdfDocument) -> anyhow::Result<String> {
        let page = self
            .structure
            .cover_page_number()
            .clamp(1, pdf.page_count().max(1));
        let Some(image) = pdf.largest_image(page) else {
            tracing::warn!(page, "no image on cover page; using a text title page");
            return Ok(String::new());
        };
        let jpeg = match pdf.image_jpeg(&image, IMAGE_QUALITY) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                tracing::warn!(page, error = %format!("{err:#}"), "cover image could not be decoded");
                return Ok(String::new());
            }
        };
        let path = self.paths.images_dir().join(epub::COVER_IMAGE_FILE);
        ledger::write_file_atomic(&path, &jpeg).await?;
        tracing::info!(page, width = image.width, height = image.height, "cover extracted");
        Ok(epub::COVER_IMAGE_FILE.to_owned())
    }

    fn render_titlepage(&self, cover_file: &str, lang: &str) -> String {
        let href = format!("images/{cover_file}");
        let cover = (!cover_file.is_empty()).then(|| {
            let path = self.paths.images_dir().join(cover_file);
            let (width, height) = image::image_dimensions(&path).unwrap_or_else(|err| {
                tracing::warn!(path = %path.display(), error = %err, "cover size unknown");
                FALLBACK_COVER_SIZE
            });
            (width, height)
        });
        epub::render_titlepage(
            &self.paths.title,
            self.config.author.as_deref(),
            lang,
            cover.map(|(width, height)| CoverImage {
                href: &href,
                width,
                height,
            }),
        )
    }

    /// The contents page: converted from the PDF's own table of contents when
    /// the structure names one, otherwise rendered from the chapter titles.
    async fn toc_document(
        &self,
        pdf: &PdfDocument,
        chapter_titles: &[String],
        lang: &str,
    ) -> anyhow::Result<String> {
        let Some(toc) = &self.structure.table_of_contents else {
            tracing::info!("no table of contents in the book; rendering one");
            return Ok(epub::render_toc_html(&self.paths.title, lang, chapter_titles));
        };

        let mut cropped = pdf
            .crop(toc.start_page, toc.end_page)
            .with_context(|| format!("crop toc pages {}-{}", toc.start_page, toc.end_page))?;
        let bytes = cropped.to_bytes()?;
        let request = GenerateRequest::new(
            &self.config.model,
            0.1,
            vec![
                Part::pdf(&bytes),
                Part::text(toc_prompt(
                    &self.paths.title,
                    chapter_titles,
                    &self.config.source_language,
                )),
            ],
        );
        let html = completion::generate_html(
            self.model,
            &request,
            &self.config.retry_policy(),
            "table of contents",
            self.config.use_streaming,
        )
        .await?;
        Ok(epub::ensure_xhtml_void_tags(&html))
    }

    async fn generate_chapter(
        &self,
        pdf: &PdfDocument,
        index: usize,
        chapter: &Chapter,
        previous: Option<&str>,
    ) -> anyhow::Result<String> {
        let first = chapter.start_page.saturating_sub(PAGE_MARGIN).max(1);
        let last = chapter.end_page.saturating_add(PAGE_MARGIN);
        let mut cropped = pdf.crop(first, last).with_context(|| {
            format!(
                "crop pages {}-{} for chapter {index}",
                chapter.start_page, chapter.end_page
            )
        })?;
        let last = first + cropped.page_count().saturating_sub(1);
        let bytes = cropped.to_bytes()?;
        tracing::info!(
            chapter = index,
            title = %chapter.title,
            first,
            last,
            bytes = bytes.len(),
            "generating chapter"
        );

        let mut parts = vec![Part::pdf(&bytes)];
        if let Some(excerpt) =
            completion::context_excerpt(previous, self.config.previous_content_limit)
        {
            parts.push(Part::text(format!(
                "Previous chapter content (for context only, do not convert it again):\n{excerpt}\n\n"
            )));
        }
        parts.push(Part::text(chapter_prompt(
            &self.paths.title,
            index,
            chapter,
            (first, last),
            &self.config.source_language,
        )));
        let request = GenerateRequest::new(&self.config.model, 0.1, parts);

        let operation = format!("chapter {index}");
        let html = completion::generate_html(
            self.model,
            &request,
            &self.config.retry_policy(),
            &operation,
            self.config.use_streaming,
        )
        .await?;

        let (html, images) = resolve_placeholders(&html, index, cropped.page_count(), |page, nth| {
            let candidate = cropped.illustrations(page).get(nth).copied()?;
            match cropped.image_jpeg(&candidate, IMAGE_QUALITY) {
                Ok(jpeg) => Some(jpeg),
                Err(err) => {
                    tracing::warn!(chapter = index, page, error = %format!("{err:#}"), "illustration could not be decoded");
                    None
                }
            }
        });
        for (name, jpeg) in &images {
            ledger::write_file_atomic(&self.paths.images_dir().join(name), jpeg).await?;
        }
        if !images.is_empty() {
            tracing::info!(chapter = index, images = images.len(), "chapter images extracted");
        }
        Ok(epub::ensure_xhtml_void_tags(&html))
    }

    fn render_package(&self, progress: &GenerationProgress, lang: &str) -> anyhow::Result<String> {
        let epub_dir = self.paths.epub_dir();
        let images_dir = self.paths.images_dir();
        let mut images: Vec<String> = cleanup::referenced_images(&epub_dir)?
            .into_iter()
            .filter(|name| images_dir.join(name).is_file())
            .collect();
        // The cover item leads so readers pick it up first.
        if let Some(pos) = images.iter().position(|n| n == epub::COVER_IMAGE_FILE) {
            let cover = images.remove(pos);
            images.insert(0, cover);
        }
        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let meta = PackageMetadata {
            title: &self.paths.title,
            author: self.config.author.as_deref(),
            uuid: &progress.book_uuid,
            lang,
            date: &date,
        };
        Ok(epub::render_content_opf(
            &meta,
            self.structure.chapters.len(),
            &images,
        ))
    }
}

/// A done flag only counts while its artifact is still on disk.
fn trusted(done: bool, artifact: &Path, stage: &str) -> bool {
    if done && !artifact.is_file() {
        tracing::warn!(stage, path = %artifact.display(), "artifact recorded as done is missing; regenerating");
        return false;
    }
    done
}

async fn write_text(path: &Path, text: &str) -> anyhow::Result<()> {
    ledger::write_file_atomic(path, text.as_bytes()).await
}

/// Swaps every image placeholder for an `<img>` tag when `image_for(page,
/// nth)` yields JPEG bytes for the `nth` placeholder seen on that 1-based
/// page. Unresolvable placeholders stay as they are. Returns the new markup
/// and the image files to write, named `chapter_{index}_img_{n}.jpg`.
pub fn resolve_placeholders(
    html: &str,
    index: usize,
    page_count: u32,
    mut image_for: impl FnMut(u32, usize) -> Option<Vec<u8>>,
) -> (String, Vec<(String, Vec<u8>)>) {
    let mut out = String::with_capacity(html.len());
    let mut images = Vec::new();
    let mut seen_on_page: HashMap<u32, usize> = HashMap::new();
    let mut last = 0;

    for caps in RE_PLACEHOLDER.captures_iter(html) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&html[last..whole.start()]);
        last = whole.end();

        let relative: u32 = caps[2].parse().unwrap_or(0);
        let page = relative.min(page_count.saturating_sub(1)) + 1;
        let nth = seen_on_page.entry(page).or_insert(0);
        let found = image_for(page, *nth);
        *nth += 1;

        match found {
            Some(jpeg) => {
                let name = format!("chapter_{index}_img_{}.jpg", images.len() + 1);
                out.push_str(&format!(
                    r#"<img src="../images/{name}" alt="{}" class="chapter-image" />"#,
                    &caps[3]
                ));
                images.push((name, jpeg));
            }
            None => {
                tracing::warn!(chapter = index, placeholder = &caps[1], page, "no illustration found for placeholder");
                out.push_str(whole.as_str());
            }
        }
    }
    out.push_str(&html[last..]);
    (out, images)
}

fn chapter_prompt(
    book_title: &str,
    index: usize,
    chapter: &Chapter,
    (first, last): (u32, u32),
    language: &str,
) -> String {
    let mut sections = String::new();
    for sub in &chapter.subchapters {
        sections.push_str(&format!(
            "- {} (pages {}-{})\n",
            sub.title, sub.start_page, sub.end_page
        ));
    }
    if sections.is_empty() {
        sections.push_str("- (none listed)\n");
    }

    format!(
        r#"You are converting one chapter of the book "{book_title}" into an EPUB document.

The attached PDF contains pages {first}-{last} of the book. Chapter {index}, "{title}", runs from page {start} to page {end}. The other pages are context only; do not convert them.

Known sections of this chapter:
{sections}
Requirements:
- Output one complete XHTML document that starts with <?xml version="1.0" encoding="utf-8"?> and an <html xmlns="http://www.w3.org/1999/xhtml"> root, puts the chapter title in <title>, and links the stylesheet with <link rel="stylesheet" type="text/css" href="../stylesheet.css" />.
- Transcribe the chapter text faithfully in {language}. Do not summarize, translate or add commentary.
- Use <h1> for the chapter title, <h2> and <h3> for sections, <p> for paragraphs, lists for lists, <table> for tables and <blockquote> for quotations. Use the classes of the stylesheet below where they fit.
- Where the chapter shows an illustration, photo, chart or diagram, insert exactly
  <div class="image-placeholder" id="img-N" data-page="P" data-description="DESC"></div>
  where N counts placeholders from 1, P is the 0-based index of the page inside the attached PDF, and DESC is a short description of the image.
- Close every void element (<br />, <img />, <hr />).
- Output only the document, without code fences.

Stylesheet:
{stylesheet}"#,
        title = chapter.title,
        start = chapter.start_page,
        end = chapter.end_page,
        stylesheet = epub::STYLESHEET,
    )
}

fn toc_prompt(book_title: &str, chapter_titles: &[String], language: &str) -> String {
    let mut files = String::new();
    for (i, title) in chapter_titles.iter().enumerate() {
        files.push_str(&format!("- chapter_{}.html: {}\n", i + 1, title));
    }
    format!(
        r#"The attached PDF pages are the table of contents of the book "{book_title}".

Convert them into one XHTML document in {language}:
- Start with <?xml version="1.0" encoding="utf-8"?> and an <html xmlns="http://www.w3.org/1999/xhtml"> root, and link the stylesheet with <link rel="stylesheet" type="text/css" href="../stylesheet.css" />.
- Put the entries in <nav class="toc"> as nested <ol> lists, giving each <li> the class level-1, level-2 or level-3 for its depth.
- Link every entry that starts a chapter to its file below. Entries inside a chapter link to that chapter's file.
- Keep titles exactly as printed. Drop printed page numbers.
- Output only the document, without code fences.

Chapter files:
{files}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLACEHOLDER_A: &str = r#"<div class="image-placeholder" id="img-1" data-page="3" data-description="A map"></div>"#;
    const PLACEHOLDER_B: &str = r#"<div class="image-placeholder" id="img-2" data-page="3" data-description="A chart"></div>"#;
    const PLACEHOLDER_C: &str = r#"<div class="image-placeholder" id="img-3" data-page="9" data-description="Late"></div>"#;

    #[test]
    fn placeholders_take_successive_images_of_their_page() {
        let html = format!("<p>a</p>{PLACEHOLDER_A}<p>b</p>{PLACEHOLDER_B}<p>c</p>{PLACEHOLDER_C}");
        let mut asked = Vec::new();
        let (out, images) = resolve_placeholders(&html, 4, 5, |page, nth| {
            asked.push((page, nth));
            // Page 4 holds one illustration; page 5 holds one.
            (nth == 0).then(|| vec![page as u8])
        });

        assert_eq!(asked, vec![(4, 0), (4, 1), (5, 0)]);
        assert_eq!(
            images,
            vec![
                ("chapter_4_img_1.jpg".to_owned(), vec![4]),
                ("chapter_4_img_2.jpg".to_owned(), vec![5]),
            ]
        );
        assert!(out.contains(
            r#"<img src="../images/chapter_4_img_1.jpg" alt="A map" class="chapter-image" />"#
        ));
        assert!(out.contains(PLACEHOLDER_B), "unresolved placeholder stays");
        assert!(out.contains(
            r#"<img src="../images/chapter_4_img_2.jpg" alt="Late" class="chapter-image" />"#
        ));
        assert!(out.starts_with("<p>a</p>"));
    }

    #[test]
    fn markup_without_placeholders_is_unchanged() {
        let html = "<html><body><p>plain</p></body></html>";
        let (out, images) = resolve_placeholders(html, 1, 3, |_, _| panic!("no lookups expected"));
        assert_eq!(out, html);
        assert!(images.is_empty());
    }

    #[test]
    fn chapter_prompt_names_ranges_and_placeholder_format() {
        let chapter = Chapter {
            title: "第一章".to_owned(),
            start_page: 5,
            end_page: 9,
            level: 1,
            subchapters: vec![Chapter {
                title: "節".to_owned(),
                start_page: 6,
                end_page: 7,
                level: 2,
                subchapters: Vec::new(),
            }],
        };
        let prompt = chapter_prompt("本", 1, &chapter, (2, 12), "Japanese");
        assert!(prompt.contains("pages 2-12"));
        assert!(prompt.contains("from page 5 to page 9"));
        assert!(prompt.contains("- 節 (pages 6-7)"));
        assert!(prompt.contains(r#"data-page="P""#));
        assert!(prompt.contains(".chapter-image"));
    }
}
