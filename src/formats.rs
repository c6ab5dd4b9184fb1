use serde::{Deserialize, Serialize};

/// Page layout of a source PDF as reported by the structure analysis.
/// Page numbers are 1-based positions in the PDF file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookStructure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_page: Option<PageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_of_contents: Option<TableOfContents>,
    pub chapters: Vec<Chapter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back_cover: Option<PageRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRef {
    pub page_number: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableOfContents {
    pub start_page: u32,
    pub end_page: u32,
    #[serde(default)]
    pub entries: Vec<TocEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TocEntry {
    pub title: String,
    pub page_number: u32,
    #[serde(default = "top_level")]
    pub level: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    pub start_page: u32,
    pub end_page: u32,
    #[serde(default = "top_level")]
    pub level: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subchapters: Vec<Chapter>,
}

fn top_level() -> u32 {
    1
}

impl BookStructure {
    pub fn cover_page_number(&self) -> u32 {
        self.cover_page.map(|p| p.page_number).unwrap_or(1).max(1)
    }

    /// Human-readable complaints about ranges that break the page-numbering
    /// invariants. The pipeline clamps such ranges instead of refusing them.
    pub fn problems(&self, page_count: u32) -> Vec<String> {
        fn walk(chapters: &[Chapter], page_count: u32, out: &mut Vec<String>) {
            for chapter in chapters {
                if chapter.start_page == 0 || chapter.end_page < chapter.start_page {
                    out.push(format!(
                        "chapter {:?} has range {}..{}",
                        chapter.title, chapter.start_page, chapter.end_page
                    ));
                }
                if chapter.end_page > page_count {
                    out.push(format!(
                        "chapter {:?} ends at page {} of {page_count}",
                        chapter.title, chapter.end_page
                    ));
                }
                if chapter.level == 0 {
                    out.push(format!("chapter {:?} has level 0", chapter.title));
                }
                walk(&chapter.subchapters, page_count, out);
            }
        }

        let mut out = Vec::new();
        walk(&self.chapters, page_count, &mut out);
        for pair in self.chapters.windows(2) {
            if pair[1].start_page < pair[0].start_page {
                out.push(format!(
                    "chapter {:?} starts before the preceding chapter {:?}",
                    pair[1].title, pair[0].title
                ));
            }
        }
        out
    }
}

/// One generated or translated document tracked by a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    /// 1-based chapter number.
    pub index: usize,
    pub title: String,
    pub generated: bool,
}

/// Resumable state of the EPUB assembly for one book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationProgress {
    pub mimetype_created: bool,
    pub container_xml_created: bool,
    pub cover_extracted: bool,
    pub cover_html_created: bool,
    pub stylesheet_created: bool,
    pub toc_ncx_created: bool,
    pub toc_html_created: bool,
    pub content_opf_created: bool,
    pub processed_chapters: Vec<usize>,
    /// Highest chapter number known to be finished; -1 before the first.
    pub last_processed_chapter_index: i64,
    pub cover_image_filename: String,
    pub chapter_titles: Vec<String>,
    pub book_uuid: String,
    pub chapters: Vec<UnitRecord>,
}

impl Default for GenerationProgress {
    fn default() -> Self {
        Self {
            mimetype_created: false,
            container_xml_created: false,
            cover_extracted: false,
            cover_html_created: false,
            stylesheet_created: false,
            toc_ncx_created: false,
            toc_html_created: false,
            content_opf_created: false,
            processed_chapters: Vec::new(),
            last_processed_chapter_index: -1,
            cover_image_filename: String::new(),
            chapter_titles: Vec::new(),
            book_uuid: String::new(),
            chapters: Vec::new(),
        }
    }
}

impl GenerationProgress {
    /// Fresh state with one pending record per top-level chapter.
    pub fn seeded(structure: &BookStructure) -> Self {
        let chapters: Vec<UnitRecord> = structure
            .chapters
            .iter()
            .enumerate()
            .map(|(i, chapter)| UnitRecord {
                index: i + 1,
                title: chapter.title.clone(),
                generated: false,
            })
            .collect();
        Self {
            chapter_titles: chapters.iter().map(|c| c.title.clone()).collect(),
            book_uuid: uuid::Uuid::new_v4().to_string(),
            chapters,
            ..Self::default()
        }
    }

    /// True when either the per-chapter flag or the legacy cursor says
    /// chapter `index` (1-based) is finished.
    pub fn chapter_done(&self, index: usize) -> bool {
        let flagged = self
            .chapters
            .iter()
            .any(|c| c.index == index && c.generated);
        flagged
            || self.processed_chapters.contains(&index)
            || (index as i64) <= self.last_processed_chapter_index
    }

    pub fn mark_chapter_generated(&mut self, index: usize, title: &str) {
        match self.chapters.iter_mut().find(|c| c.index == index) {
            Some(record) => record.generated = true,
            None => self.chapters.push(UnitRecord {
                index,
                title: title.to_owned(),
                generated: true,
            }),
        }
        if !self.processed_chapters.contains(&index) {
            self.processed_chapters.push(index);
        }
        self.last_processed_chapter_index = self.last_processed_chapter_index.max(index as i64);
    }

    /// Forgets that chapter `index` was finished, e.g. after its file vanished.
    pub fn unmark_chapter(&mut self, index: usize) {
        if let Some(record) = self.chapters.iter_mut().find(|c| c.index == index) {
            record.generated = false;
        }
        self.processed_chapters.retain(|i| *i != index);
        if (index as i64) <= self.last_processed_chapter_index {
            self.last_processed_chapter_index = index as i64 - 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslatedChapter {
    /// Translated title; equal to `original_title` until translated.
    pub title: String,
    /// Document path as written in the NCX, without fragment.
    pub src: String,
    pub original_title: String,
    pub translated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslatedHtmlFile {
    pub src: String,
    pub translated: bool,
    pub title: String,
}

/// Resumable state of one EPUB translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationProgress {
    pub working_copy_created: bool,
    pub book_title_translated: bool,
    pub translated_book_title: String,
    pub toc_translated: bool,
    pub toc_ncx_updated: bool,
    pub content_opf_updated: bool,
    pub translated_chapters: Vec<TranslatedChapter>,
    pub translated_html_files: Vec<TranslatedHtmlFile>,
    /// 0-based position in `translated_chapters`; -1 before the first.
    pub last_processed_chapter_index: i64,
    /// 0-based position in `translated_html_files`; -1 before the first.
    pub last_processed_html_index: i64,
}

impl Default for TranslationProgress {
    fn default() -> Self {
        Self {
            working_copy_created: false,
            book_title_translated: false,
            translated_book_title: String::new(),
            toc_translated: false,
            toc_ncx_updated: false,
            content_opf_updated: false,
            translated_chapters: Vec::new(),
            translated_html_files: Vec::new(),
            last_processed_chapter_index: -1,
            last_processed_html_index: -1,
        }
    }
}

impl TranslationProgress {
    pub fn chapter_done(&self, position: usize) -> bool {
        self.translated_chapters
            .get(position)
            .is_some_and(|c| c.translated)
            || (position as i64) <= self.last_processed_chapter_index
    }

    pub fn mark_chapter_translated(&mut self, position: usize) {
        if let Some(chapter) = self.translated_chapters.get_mut(position) {
            chapter.translated = true;
        }
        self.last_processed_chapter_index = self.last_processed_chapter_index.max(position as i64);
    }

    /// Forgets every per-document result while keeping translated titles,
    /// for when the working copy had to be unpacked again.
    pub fn restart_documents(&mut self) {
        self.toc_ncx_updated = false;
        self.content_opf_updated = false;
        for chapter in &mut self.translated_chapters {
            chapter.translated = false;
        }
        for file in &mut self.translated_html_files {
            file.translated = false;
        }
        self.last_processed_chapter_index = -1;
        self.last_processed_html_index = -1;
    }

    pub fn html_done(&self, position: usize) -> bool {
        self.translated_html_files
            .get(position)
            .is_some_and(|f| f.translated)
            || (position as i64) <= self.last_processed_html_index
    }

    pub fn mark_html_translated(&mut self, position: usize) {
        if let Some(file) = self.translated_html_files.get_mut(position) {
            file.translated = true;
        }
        self.last_processed_html_index = self.last_processed_html_index.max(position as i64);
    }
}
