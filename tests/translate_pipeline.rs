mod gemini_stub;

use std::fs;
use std::io::Read as _;
use std::path::{Path, PathBuf};

use gemini_stub::{GeminiStub, GeminiStubConfig};
use pdf2epub::epub::{self, PackageMetadata};
use pdf2epub::formats::TranslationProgress;
use predicates::prelude::*;

const CHAPTER_TITLES: [&str; 3] = ["第一章", "第二章", "第三章"];

/// Writes a small Japanese EPUB: title page, contents, three chapters and a
/// notes page that the navigation map does not mention.
fn write_source_epub(path: &Path) -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let root = temp.path();
    let titles: Vec<String> = CHAPTER_TITLES.iter().map(|t| (*t).to_owned()).collect();

    let write = |rel: &str, text: &str| -> anyhow::Result<()> {
        let target = root.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, text)?;
        Ok(())
    };
    write("mimetype", epub::MIMETYPE)?;
    write("META-INF/container.xml", &epub::render_container_xml())?;
    write("stylesheet.css", epub::STYLESHEET)?;
    write(
        "titlepage.xhtml",
        &epub::render_titlepage("テスト本", Some("著者"), "ja", None),
    )?;
    write("text/toc.html", &epub::render_toc_html("テスト本", "ja", &titles))?;
    write(
        "toc.ncx",
        &epub::render_toc_ncx("テスト本", "0000-test", "ja", &titles),
    )?;
    write(
        "content.opf",
        &epub::render_content_opf(
            &PackageMetadata {
                title: "テスト本",
                author: Some("著者"),
                uuid: "0000-test",
                lang: "ja",
                date: "2024-01-01",
            },
            titles.len(),
            &[],
        ),
    )?;
    for (i, title) in titles.iter().enumerate() {
        write(
            &epub::chapter_href(i + 1),
            &format!(
                "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<html xmlns=\"http://www.w3.org/1999/xhtml\"><head><title>{title}</title></head><body><h1>{title}</h1><p>本文 {}</p></body></html>\n",
                i + 1
            ),
        )?;
    }
    write(
        "text/notes.html",
        "<html xmlns=\"http://www.w3.org/1999/xhtml\"><body><p>注記</p></body></html>\n",
    )?;

    epub::write_archive(root, path)
}

struct Workspace {
    _temp: tempfile::TempDir,
    dir: PathBuf,
}

impl Workspace {
    fn new(stub: &GeminiStub, extra_config: &str) -> anyhow::Result<Self> {
        let temp = tempfile::TempDir::new()?;
        let dir = temp.path().to_path_buf();
        write_source_epub(&dir.join("source.epub"))?;
        fs::write(
            dir.join("config.yaml"),
            format!(
                "google_api_key: test-key\n\
                 title: Test Book\n\
                 api_base_url: {}\n\
                 output_dir: {}\n\
                 max_backoff_seconds: 0\n\
                 previous_content_limit: 100\n\
                 use_streaming: true\n\
                 {extra_config}",
                stub.base_url,
                dir.join("out").display()
            ),
        )?;
        Ok(Self { _temp: temp, dir })
    }

    fn book_dir(&self) -> PathBuf {
        self.dir.join("out").join("Test Book")
    }

    fn translate(&self, resume: bool) -> assert_cmd::assert::Assert {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("pdf2epub");
        cmd.current_dir(&self.dir).env_remove("RUST_LOG").args([
            "translate",
            "-i",
            "source.epub",
            "-c",
            "config.yaml",
            "-s",
            "Japanese",
            "-t",
            "English",
        ]);
        if resume {
            cmd.arg("-r");
        }
        cmd.assert()
    }
}

fn read_entry(epub: &Path, name: &str) -> anyhow::Result<String> {
    let mut archive = zip::ZipArchive::new(fs::File::open(epub)?)?;
    let mut out = String::new();
    archive.by_name(name)?.read_to_string(&mut out)?;
    Ok(out)
}

#[test]
fn translate_rewrites_titles_and_documents() -> anyhow::Result<()> {
    let stub = GeminiStub::spawn(GeminiStubConfig {
        short_title_batches: true,
        ..GeminiStubConfig::default()
    });
    let ws = Workspace::new(&stub, "")?;

    ws.translate(false)
        .success()
        .stdout(predicate::str::contains("Translated Title.epub"));

    let calls = stub.calls();
    assert_eq!(calls[0], "book title");
    assert_eq!(calls[1], "titles");
    // Five navigation documents plus the notes page.
    assert_eq!(stub.count("translate"), 6);

    let out = ws.book_dir().join("Translated Title.epub");
    let ncx = read_entry(&out, "toc.ncx")?;
    assert!(ncx.contains("<text>EN 第一章</text>"));
    assert!(ncx.contains("<text>EN 第二章</text>"));
    assert!(ncx.contains("<text>第三章</text>"), "short batch keeps the original");

    let opf = read_entry(&out, "content.opf")?;
    assert!(opf.contains("<dc:title>Translated Title</dc:title>"));

    assert!(read_entry(&out, "text/chapter_2.html")?.contains("<p>[EN] 本文 2</p>"));
    assert!(read_entry(&out, "text/notes.html")?.contains("<p>[EN] 注記</p>"));

    let progress: TranslationProgress =
        serde_json::from_slice(&fs::read(ws.book_dir().join("translation_progress.json"))?)?;
    assert!(progress.translated_chapters.iter().all(|c| c.translated));
    assert_eq!(progress.translated_html_files.len(), 1);
    assert_eq!(
        progress.translated_html_files[0].title,
        "Additional content: notes.html"
    );
    assert!(progress.translated_html_files[0].translated);

    let first = fs::read(&out)?;
    ws.translate(true).success();
    assert_eq!(stub.calls().len(), calls.len(), "resume has nothing left to do");
    assert_eq!(fs::read(&out)?, first);
    Ok(())
}

#[test]
fn resumed_translation_starts_from_the_original_text() -> anyhow::Result<()> {
    let stub = GeminiStub::spawn(GeminiStubConfig::default());
    let ws = Workspace::new(&stub, "")?;
    ws.translate(false).success();
    let translations = stub.count("translate");

    // The last chapter's document was written but its ledger entry was not.
    let ledger_path = ws.book_dir().join("translation_progress.json");
    let mut progress: TranslationProgress = serde_json::from_slice(&fs::read(&ledger_path)?)?;
    let last = progress.translated_chapters.len() - 1;
    assert!(progress.translated_chapters[last].src.ends_with("chapter_3.html"));
    progress.translated_chapters[last].translated = false;
    progress.last_processed_chapter_index = last as i64 - 1;
    fs::write(&ledger_path, serde_json::to_vec_pretty(&progress)?)?;

    ws.translate(true).success();
    assert_eq!(stub.count("translate"), translations + 1);

    let chapter = fs::read_to_string(ws.book_dir().join("translated").join("text").join("chapter_3.html"))?;
    assert!(chapter.contains("<p>[EN] 本文 3</p>"), "{chapter}");
    assert!(!chapter.contains("[EN] [EN]"), "{chapter}");
    Ok(())
}

#[test]
fn translation_with_the_same_title_keeps_the_generated_epub() -> anyhow::Result<()> {
    let stub = GeminiStub::spawn(GeminiStubConfig::default());
    let ws = Workspace::new(&stub, "target_title: Test Book\n")?;
    fs::create_dir_all(ws.book_dir())?;
    let generated = ws.book_dir().join("Test Book.epub");
    fs::write(&generated, b"generated archive")?;

    ws.translate(false)
        .success()
        .stdout(predicate::str::contains("Test Book.en.epub"));
    assert_eq!(fs::read(&generated)?, b"generated archive");
    assert!(read_entry(&ws.book_dir().join("Test Book.en.epub"), "content.opf")?
        .contains("<dc:title>Test Book</dc:title>"));
    Ok(())
}

#[test]
fn configured_target_title_skips_the_title_request() -> anyhow::Result<()> {
    let stub = GeminiStub::spawn(GeminiStubConfig::default());
    let ws = Workspace::new(&stub, "target_title: My English Book\n")?;

    ws.translate(false).success();
    assert_eq!(stub.count("book title"), 0);
    assert!(ws.book_dir().join("My English Book.epub").is_file());
    Ok(())
}

#[test]
fn epub_without_navigation_map_is_rejected() -> anyhow::Result<()> {
    let stub = GeminiStub::spawn(GeminiStubConfig::default());
    let ws = Workspace::new(&stub, "")?;

    let bare = tempfile::TempDir::new()?;
    fs::write(bare.path().join("chapter.html"), "<html><body><p>x</p></body></html>")?;
    epub::write_archive(bare.path(), &ws.dir.join("source.epub"))?;

    ws.translate(false)
        .failure()
        .stderr(predicate::str::contains("toc.ncx"));
    assert!(stub.calls().is_empty());
    Ok(())
}
