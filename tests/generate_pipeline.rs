mod gemini_stub;
mod pdf_fixture;

use std::fs;
use std::io::Read as _;
use std::path::{Path, PathBuf};

use gemini_stub::{GeminiStub, GeminiStubConfig};
use pdf2epub::formats::GenerationProgress;
use pdf_fixture::FixtureImage;
use predicates::prelude::*;

/// Cover on page 1, three chapters, and an illustration on page 3 next to a
/// decorative icon.
const STRUCTURE: &str = r#"{
  "cover_page": {"page_number": 1},
  "chapters": [
    {"title": "第一章 はじまり", "start_page": 2, "end_page": 3, "level": 1},
    {"title": "第二章 つづき", "start_page": 4, "end_page": 5, "level": 1},
    {"title": "第三章 おわり", "start_page": 6, "end_page": 8, "level": 1}
  ]
}"#;

struct Book {
    _temp: tempfile::TempDir,
    dir: PathBuf,
}

impl Book {
    fn new(stub: &GeminiStub, streaming: bool) -> anyhow::Result<Self> {
        let temp = tempfile::TempDir::new()?;
        let dir = temp.path().to_path_buf();
        fs::write(
            dir.join("book.pdf"),
            pdf_fixture::book_pdf(
                8,
                &[
                    FixtureImage { page: 1, width: 300, height: 400 },
                    FixtureImage { page: 3, width: 40, height: 40 },
                    FixtureImage { page: 3, width: 240, height: 180 },
                ],
            ),
        )?;
        let book = Self { _temp: temp, dir };
        book.write_config(stub, streaming)?;
        Ok(book)
    }

    /// Points the book's config at `stub`.
    fn write_config(&self, stub: &GeminiStub, streaming: bool) -> anyhow::Result<()> {
        let dir = &self.dir;
        fs::write(
            dir.join("config.yaml"),
            format!(
                "google_api_key: test-key\n\
                 title: Test Book\n\
                 author: Tester\n\
                 source_language: Japanese\n\
                 api_base_url: {}\n\
                 output_dir: {}\n\
                 num_retries: 3\n\
                 max_backoff_seconds: 0\n\
                 previous_content_limit: 200\n\
                 use_streaming: {streaming}\n",
                stub.base_url,
                dir.join("out").display()
            ),
        )?;
        Ok(())
    }

    fn book_dir(&self) -> PathBuf {
        self.dir.join("out").join("Test Book")
    }

    fn generate(&self, resume: bool) -> assert_cmd::assert::Assert {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("pdf2epub");
        cmd.current_dir(&self.dir)
            .env_remove("RUST_LOG")
            .args(["generate", "-i", "book.pdf", "-c", "config.yaml"]);
        if resume {
            cmd.arg("-r");
        }
        cmd.assert()
    }
}

fn entry_names(epub: &Path) -> anyhow::Result<Vec<String>> {
    let mut archive = zip::ZipArchive::new(fs::File::open(epub)?)?;
    let mut names = Vec::new();
    for i in 0..archive.len() {
        names.push(archive.by_index(i)?.name().to_owned());
    }
    Ok(names)
}

fn read_entry(epub: &Path, name: &str) -> anyhow::Result<String> {
    let mut archive = zip::ZipArchive::new(fs::File::open(epub)?)?;
    let mut out = String::new();
    archive.by_name(name)?.read_to_string(&mut out)?;
    Ok(out)
}

#[test]
fn generate_builds_a_complete_epub() -> anyhow::Result<()> {
    let stub = GeminiStub::spawn(GeminiStubConfig {
        structure_json: STRUCTURE.to_owned(),
        chapter_one_placeholder_page: Some(2),
        fail_first: 2,
        ..GeminiStubConfig::default()
    });
    let book = Book::new(&stub, true)?;

    book.generate(false)
        .success()
        .stdout(predicate::str::contains("Test Book.epub"));

    assert_eq!(
        stub.calls(),
        vec!["structure", "chapter 1", "chapter 2", "chapter 3"]
    );

    let epub = book.book_dir().join("Test Book.epub");
    let mut archive = zip::ZipArchive::new(fs::File::open(&epub)?)?;
    {
        let first = archive.by_index(0)?;
        assert_eq!(first.name(), "mimetype");
        assert_eq!(first.compression(), zip::CompressionMethod::Stored);
    }
    for i in 1..archive.len() {
        let entry = archive.by_index(i)?;
        assert_ne!(entry.name(), "mimetype");
        assert_eq!(entry.compression(), zip::CompressionMethod::Deflated, "{}", entry.name());
    }

    let names = entry_names(&epub)?;
    for expected in [
        "META-INF/container.xml",
        "content.opf",
        "toc.ncx",
        "stylesheet.css",
        "titlepage.xhtml",
        "text/toc.html",
        "text/chapter_1.html",
        "text/chapter_2.html",
        "text/chapter_3.html",
        "images/cover.jpg",
        "images/chapter_1_img_1.jpg",
    ] {
        assert!(names.iter().any(|n| n == expected), "missing {expected}: {names:?}");
    }

    let chapter_1 = read_entry(&epub, "text/chapter_1.html")?;
    assert!(chapter_1.contains(
        r#"<img src="../images/chapter_1_img_1.jpg" alt="A figure" class="chapter-image" />"#
    ));
    assert!(chapter_1.contains("<br />"));
    assert!(!chapter_1.contains("```"));

    let opf = read_entry(&epub, "content.opf")?;
    assert!(opf.contains("<dc:title>Test Book</dc:title>"));
    assert!(opf.contains("<dc:language>ja</dc:language>"));
    assert!(opf.contains(r#"href="images/cover.jpg""#));
    assert!(opf.contains(r#"href="images/chapter_1_img_1.jpg""#));

    let ncx = read_entry(&epub, "toc.ncx")?;
    assert!(ncx.contains("第二章 つづき"));
    assert!(ncx.contains("表紙"));

    let titlepage = read_entry(&epub, "titlepage.xhtml")?;
    assert!(titlepage.contains(r#"xlink:href="images/cover.jpg""#));

    assert!(book.book_dir().join("logs").join("process.log").is_file());
    Ok(())
}

#[test]
fn resume_generates_only_missing_chapters_and_is_idempotent() -> anyhow::Result<()> {
    let stub = GeminiStub::spawn(GeminiStubConfig {
        structure_json: STRUCTURE.to_owned(),
        ..GeminiStubConfig::default()
    });
    let book = Book::new(&stub, false)?;
    let book_dir = book.book_dir();
    fs::create_dir_all(book_dir.join("epub").join("text"))?;
    fs::write(book_dir.join("book_structure.json"), STRUCTURE)?;

    let structure = serde_json::from_str(STRUCTURE)?;
    let mut progress = GenerationProgress::seeded(&structure);
    progress.mark_chapter_generated(2, "第二章 つづき");
    fs::write(
        book_dir.join("generation_progress.json"),
        serde_json::to_vec_pretty(&progress)?,
    )?;
    let chapter_2 = book_dir.join("epub").join("text").join("chapter_2.html");
    let handwritten = "<html xmlns=\"http://www.w3.org/1999/xhtml\"><body><p>kept by hand</p></body></html>";
    fs::write(&chapter_2, handwritten)?;

    book.generate(false)
        .failure()
        .stderr(predicate::str::contains("--resume"));
    assert!(stub.calls().is_empty());

    book.generate(true).success();
    assert_eq!(stub.calls(), vec!["chapter 1", "chapter 3"]);
    assert_eq!(fs::read_to_string(&chapter_2)?, handwritten);

    let epub = book_dir.join("Test Book.epub");
    let first_epub = fs::read(&epub)?;
    let first_ledger = fs::read(book_dir.join("generation_progress.json"))?;
    let ledger: GenerationProgress = serde_json::from_slice(&first_ledger)?;
    assert!((1..=3).all(|i| ledger.chapter_done(i)));
    assert!(ledger.content_opf_created);

    book.generate(true).success();
    assert_eq!(stub.calls().len(), 2, "nothing is regenerated");
    assert_eq!(fs::read(&epub)?, first_epub);
    assert_eq!(fs::read(book_dir.join("generation_progress.json"))?, first_ledger);
    Ok(())
}

#[test]
fn deleted_chapter_is_regenerated_on_resume() -> anyhow::Result<()> {
    let stub = GeminiStub::spawn(GeminiStubConfig {
        structure_json: STRUCTURE.to_owned(),
        ..GeminiStubConfig::default()
    });
    let book = Book::new(&stub, false)?;
    book.generate(false).success();
    assert_eq!(stub.calls().len(), 4);

    fs::remove_file(book.book_dir().join("epub").join("text").join("chapter_3.html"))?;
    book.generate(true).success();
    assert_eq!(stub.calls().last().map(String::as_str), Some("chapter 3"));
    assert_eq!(stub.calls().len(), 5);
    Ok(())
}

#[test]
fn structure_toc_is_converted_by_the_model() -> anyhow::Result<()> {
    let structure = r#"{
      "cover_page": {"page_number": 1},
      "table_of_contents": {"start_page": 2, "end_page": 2, "entries": [
        {"title": "One", "page_number": 3, "level": 1}
      ]},
      "chapters": [{"title": "One", "start_page": 3, "end_page": 4, "level": 1}]
    }"#;
    let stub = GeminiStub::spawn(GeminiStubConfig {
        structure_json: structure.to_owned(),
        ..GeminiStubConfig::default()
    });
    let book = Book::new(&stub, false)?;
    book.generate(false).success();
    assert_eq!(stub.calls(), vec!["structure", "toc", "chapter 1"]);

    let toc = fs::read_to_string(book.book_dir().join("epub").join("text").join("toc.html"))?;
    assert!(toc.contains(r#"<a href="chapter_1.html">One</a>"#));
    Ok(())
}

#[test]
fn regenerated_chapter_refreshes_the_package_manifest() -> anyhow::Result<()> {
    let first = GeminiStub::spawn(GeminiStubConfig {
        structure_json: STRUCTURE.to_owned(),
        ..GeminiStubConfig::default()
    });
    let book = Book::new(&first, false)?;
    book.generate(false).success();
    let opf_path = book.book_dir().join("epub").join("content.opf");
    assert!(!fs::read_to_string(&opf_path)?.contains("chapter_1_img_1.jpg"));

    fs::remove_file(book.book_dir().join("epub").join("text").join("chapter_1.html"))?;
    let second = GeminiStub::spawn(GeminiStubConfig {
        structure_json: STRUCTURE.to_owned(),
        chapter_one_placeholder_page: Some(2),
        ..GeminiStubConfig::default()
    });
    book.write_config(&second, false)?;
    book.generate(true).success();
    assert_eq!(second.calls(), vec!["chapter 1"]);

    let epub = book.book_dir().join("Test Book.epub");
    assert!(read_entry(&epub, "text/chapter_1.html")?.contains("chapter_1_img_1.jpg"));
    assert!(read_entry(&epub, "content.opf")?.contains(r#"href="images/chapter_1_img_1.jpg""#));
    let ledger: GenerationProgress =
        serde_json::from_slice(&fs::read(book.book_dir().join("generation_progress.json"))?)?;
    assert!(ledger.content_opf_created);
    Ok(())
}

#[test]
fn failing_chapter_halts_the_run_and_resume_starts_there() -> anyhow::Result<()> {
    let failing = GeminiStub::spawn(GeminiStubConfig {
        structure_json: STRUCTURE.to_owned(),
        fail_chapter: Some(2),
        ..GeminiStubConfig::default()
    });
    let book = Book::new(&failing, false)?;
    book.generate(false)
        .failure()
        .stderr(predicate::str::contains("chapter 2"));
    assert_eq!(failing.calls(), vec!["structure", "chapter 1"]);

    let ledger_path = book.book_dir().join("generation_progress.json");
    let ledger: GenerationProgress = serde_json::from_slice(&fs::read(&ledger_path)?)?;
    assert!(ledger.chapter_done(1));
    assert!(!ledger.chapter_done(2));
    assert!(!ledger.chapter_done(3));
    assert!(!book.book_dir().join("epub").join("text").join("chapter_2.html").exists());
    assert!(!book.book_dir().join("Test Book.epub").exists());

    let healthy = GeminiStub::spawn(GeminiStubConfig {
        structure_json: STRUCTURE.to_owned(),
        ..GeminiStubConfig::default()
    });
    book.write_config(&healthy, false)?;
    book.generate(true).success();
    assert_eq!(healthy.calls(), vec!["chapter 2", "chapter 3"]);
    Ok(())
}

#[test]
fn chapter_written_without_its_ledger_entry_is_generated_once_more() -> anyhow::Result<()> {
    let stub = GeminiStub::spawn(GeminiStubConfig {
        structure_json: STRUCTURE.to_owned(),
        ..GeminiStubConfig::default()
    });
    let book = Book::new(&stub, false)?;
    book.generate(false).success();
    let text_dir = book.book_dir().join("epub").join("text");
    let chapter_1 = fs::read(text_dir.join("chapter_1.html"))?;

    // Crash between writing chapter 2 and recording it.
    let ledger_path = book.book_dir().join("generation_progress.json");
    let mut ledger: GenerationProgress = serde_json::from_slice(&fs::read(&ledger_path)?)?;
    ledger.unmark_chapter(2);
    fs::write(&ledger_path, serde_json::to_vec_pretty(&ledger)?)?;
    fs::write(text_dir.join("chapter_2.html"), "<html><body><p>half writ")?;

    book.generate(true).success();
    assert_eq!(&stub.calls()[4..], ["chapter 2"]);
    assert!(fs::read_to_string(text_dir.join("chapter_2.html"))?.contains("Body of chapter 2."));
    assert_eq!(fs::read(text_dir.join("chapter_1.html"))?, chapter_1);
    Ok(())
}
