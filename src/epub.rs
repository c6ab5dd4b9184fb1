//! EPUB 2 packaging: XML renderers for the skeleton documents, the archive
//! writer/reader, and the small NCX/OPF edits needed after translation.

use std::fs::{self, File};
use std::io::{Cursor, Write as _};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use once_cell::sync::Lazy;
use quick_xml::events::{BytesText, Event};
use quick_xml::{Reader, Writer};
use regex::Regex;
use zip::write::SimpleFileOptions;

pub const MIMETYPE: &str = "application/epub+zip";
pub const TITLEPAGE_FILE: &str = "titlepage.xhtml";
pub const TOC_HTML_FILE: &str = "text/toc.html";
pub const STYLESHEET_FILE: &str = "stylesheet.css";
pub const COVER_IMAGE_FILE: &str = "cover.jpg";

/// Shared by every generated document. Chapter prompts embed it so the model
/// only uses classes that exist here.
pub const STYLESHEET: &str = r#"@charset "utf-8";
@namespace h "http://www.w3.org/1999/xhtml";

body {
  font-family: serif;
  line-height: 1.8;
  margin: 0 auto;
  padding: 0 1em;
}
h1 {
  text-align: center;
  font-size: 1.8em;
  margin: 1em 0 1.5em;
  padding-bottom: 0.4em;
  border-bottom: 2px solid #ccc;
}
h2 { font-size: 1.4em; margin: 2em 0 0.8em; border-bottom: 1px solid #ddd; }
h3 { font-size: 1.15em; margin: 1.6em 0 0.6em; }
p { margin: 0 0 1em; text-indent: 1em; text-align: justify; }
img.chapter-image { display: block; max-width: 100%; height: auto; margin: 1.5em auto; }
.image-placeholder { margin: 1.5em 0; padding: 1em; border: 1px dashed #ccc; color: #888; }
.footnotes { margin-top: 3em; padding-top: 1em; border-top: 1px solid #ccc; font-size: 0.9em; }
nav.toc ol { list-style: none; padding-left: 0; }
nav.toc li { margin: 0.4em 0; }
nav.toc li.level-2 { padding-left: 1.5em; }
nav.toc li.level-3 { padding-left: 3em; }
"#;

static RE_DC_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)(<dc:title[^>]*>)(.*?)(</dc:title>)").expect("valid regex"));

pub fn chapter_href(index: usize) -> String {
    format!("text/chapter_{index}.html")
}

/// Maps a language name or tag from the config to a BCP-47 tag.
pub fn guess_lang_tag(language: &str) -> String {
    let raw = language.trim();
    if raw.is_empty() {
        return "und".to_owned();
    }
    let looks_like_tag = raw.len() <= 35
        && (raw.contains('-') || raw.contains('_'))
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if looks_like_tag {
        return raw.replace('_', "-");
    }

    const KNOWN: &[(&str, &[&str])] = &[
        ("ja", &["ja", "japanese", "日本"]),
        ("zh", &["zh", "chinese", "中文", "中国"]),
        ("en", &["en", "english", "英"]),
        ("ko", &["ko", "korean", "한국"]),
        ("fr", &["fr", "french", "français"]),
        ("de", &["de", "german", "deutsch"]),
        ("es", &["es", "spanish", "español"]),
    ];
    let lower = raw.to_lowercase();
    for (tag, names) in KNOWN {
        if names
            .iter()
            .any(|name| lower == *name || (name.len() > 2 && lower.contains(name)))
        {
            return (*tag).to_owned();
        }
    }
    "und".to_owned()
}

/// Labels of the cover and contents entries in the navigation map.
pub fn nav_labels(lang_tag: &str) -> (&'static str, &'static str) {
    if lang_tag == "ja" || lang_tag.starts_with("ja-") {
        ("表紙", "目次")
    } else {
        ("Cover", "Contents")
    }
}

pub fn render_container_xml() -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(
        "<container version=\"1.0\" xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\">\n",
    );
    out.push_str("  <rootfiles>\n");
    out.push_str(
        "    <rootfile full-path=\"content.opf\" media-type=\"application/oebps-package+xml\"/>\n",
    );
    out.push_str("  </rootfiles>\n");
    out.push_str("</container>\n");
    out
}

#[derive(Debug, Clone, Copy)]
pub struct CoverImage<'a> {
    /// Path relative to the EPUB root.
    pub href: &'a str,
    pub width: u32,
    pub height: u32,
}

pub fn render_titlepage(
    title: &str,
    author: Option<&str>,
    lang: &str,
    cover: Option<CoverImage<'_>>,
) -> String {
    let (cover_label, _) = nav_labels(lang);
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" xml:lang=\"{}\" lang=\"{}\">\n",
        xml_escape(lang),
        xml_escape(lang)
    ));
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(cover_label)));
    out.push_str("  <meta http-equiv=\"Content-Type\" content=\"text/html; charset=utf-8\" />\n");
    out.push_str(&format!(
        "  <link rel=\"stylesheet\" type=\"text/css\" href=\"{STYLESHEET_FILE}\" />\n"
    ));
    out.push_str("  <style type=\"text/css\">@page { padding: 0; margin: 0; } body { text-align: center; padding: 0; margin: 0; }</style>\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    match cover {
        Some(image) => {
            out.push_str("  <div>\n");
            out.push_str(&format!(
                "    <svg xmlns=\"http://www.w3.org/2000/svg\" xmlns:xlink=\"http://www.w3.org/1999/xlink\" version=\"1.1\" width=\"100%\" height=\"100%\" viewBox=\"0 0 {w} {h}\" preserveAspectRatio=\"none\">\n",
                w = image.width,
                h = image.height
            ));
            out.push_str(&format!(
                "      <image width=\"{}\" height=\"{}\" xlink:href=\"{}\"/>\n",
                image.width,
                image.height,
                xml_escape(image.href)
            ));
            out.push_str("    </svg>\n");
            out.push_str("  </div>\n");
        }
        None => {
            out.push_str(&format!("  <h1>{}</h1>\n", xml_escape(title)));
            if let Some(author) = author {
                out.push_str(&format!("  <p class=\"author\">{}</p>\n", xml_escape(author)));
            }
        }
    }
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

pub fn render_toc_ncx(title: &str, uuid: &str, lang: &str, chapter_titles: &[String]) -> String {
    let (cover_label, contents_label) = nav_labels(lang);
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(
        "<!DOCTYPE ncx PUBLIC \"-//NISO//DTD ncx 2005-1//EN\" \"http://www.daisy.org/z3986/2005/ncx-2005-1.dtd\">\n",
    );
    out.push_str(&format!(
        "<ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\" xml:lang=\"{}\">\n",
        xml_escape(lang)
    ));
    out.push_str("  <head>\n");
    out.push_str(&format!(
        "    <meta name=\"dtb:uid\" content=\"urn:uuid:{}\"/>\n",
        xml_escape(uuid)
    ));
    out.push_str("    <meta name=\"dtb:depth\" content=\"1\"/>\n");
    out.push_str("    <meta name=\"dtb:totalPageCount\" content=\"0\"/>\n");
    out.push_str("    <meta name=\"dtb:maxPageNumber\" content=\"0\"/>\n");
    out.push_str("  </head>\n");
    out.push_str(&format!(
        "  <docTitle><text>{}</text></docTitle>\n",
        xml_escape(title)
    ));
    out.push_str("  <navMap>\n");

    let mut entries: Vec<(String, &str, String)> = vec![
        ("cover".to_owned(), cover_label, TITLEPAGE_FILE.to_owned()),
        ("toc".to_owned(), contents_label, TOC_HTML_FILE.to_owned()),
    ];
    for (i, chapter_title) in chapter_titles.iter().enumerate() {
        entries.push((format!("chapter_{}", i + 1), chapter_title.as_str(), chapter_href(i + 1)));
    }
    for (order, (id, label, src)) in entries.iter().enumerate() {
        out.push_str(&format!(
            "    <navPoint id=\"{}\" playOrder=\"{}\">\n",
            xml_escape(id),
            order + 1
        ));
        out.push_str(&format!(
            "      <navLabel><text>{}</text></navLabel>\n",
            xml_escape(label)
        ));
        out.push_str(&format!("      <content src=\"{}\"/>\n", xml_escape(src)));
        out.push_str("    </navPoint>\n");
    }
    out.push_str("  </navMap>\n");
    out.push_str("</ncx>\n");
    out
}

/// A plain contents page linking every chapter, for books whose PDF has no
/// table of contents to convert.
pub fn render_toc_html(title: &str, lang: &str, chapter_titles: &[String]) -> String {
    let (_, contents_label) = nav_labels(lang);
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" xml:lang=\"{}\" lang=\"{}\">\n",
        xml_escape(lang),
        xml_escape(lang)
    ));
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(contents_label)));
    out.push_str(&format!(
        "  <link rel=\"stylesheet\" type=\"text/css\" href=\"../{STYLESHEET_FILE}\" />\n"
    ));
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(&format!("  <h1>{}</h1>\n", xml_escape(title)));
    out.push_str("  <nav class=\"toc\">\n");
    out.push_str(&format!("    <h2>{}</h2>\n", xml_escape(contents_label)));
    out.push_str("    <ol>\n");
    for (i, chapter_title) in chapter_titles.iter().enumerate() {
        out.push_str(&format!(
            "      <li class=\"level-1\"><a href=\"chapter_{}.html\">{}</a></li>\n",
            i + 1,
            xml_escape(chapter_title)
        ));
    }
    out.push_str("    </ol>\n");
    out.push_str("  </nav>\n");
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

#[derive(Debug, Clone)]
pub struct PackageMetadata<'a> {
    pub title: &'a str,
    pub author: Option<&'a str>,
    pub uuid: &'a str,
    pub lang: &'a str,
    /// `YYYY-MM-DD`.
    pub date: &'a str,
}

/// `images` are file names under `images/`; the cover image, if present, is
/// declared as the book cover.
pub fn render_content_opf(
    meta: &PackageMetadata<'_>,
    chapter_count: usize,
    images: &[String],
) -> String {
    let (cover_label, contents_label) = nav_labels(meta.lang);
    let has_cover_image = images.iter().any(|img| img == COVER_IMAGE_FILE);

    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(
        "<package xmlns=\"http://www.idpf.org/2007/opf\" unique-identifier=\"bookid\" version=\"2.0\">\n",
    );
    out.push_str(
        "  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\" xmlns:opf=\"http://www.idpf.org/2007/opf\">\n",
    );
    out.push_str(&format!("    <dc:title>{}</dc:title>\n", xml_escape(meta.title)));
    if let Some(author) = meta.author {
        out.push_str(&format!(
            "    <dc:creator opf:role=\"aut\">{}</dc:creator>\n",
            xml_escape(author)
        ));
    }
    out.push_str(&format!(
        "    <dc:language>{}</dc:language>\n",
        xml_escape(meta.lang)
    ));
    out.push_str(&format!(
        "    <dc:identifier id=\"bookid\" opf:scheme=\"UUID\">urn:uuid:{}</dc:identifier>\n",
        xml_escape(meta.uuid)
    ));
    out.push_str(&format!("    <dc:date>{}</dc:date>\n", xml_escape(meta.date)));
    if has_cover_image {
        out.push_str("    <meta name=\"cover\" content=\"cover\"/>\n");
    }
    out.push_str("  </metadata>\n");

    out.push_str("  <manifest>\n");
    out.push_str("    <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\"/>\n");
    out.push_str(&format!(
        "    <item id=\"css\" href=\"{STYLESHEET_FILE}\" media-type=\"text/css\"/>\n"
    ));
    out.push_str(&format!(
        "    <item id=\"titlepage\" href=\"{TITLEPAGE_FILE}\" media-type=\"application/xhtml+xml\"/>\n"
    ));
    out.push_str(&format!(
        "    <item id=\"toc\" href=\"{TOC_HTML_FILE}\" media-type=\"application/xhtml+xml\"/>\n"
    ));
    for i in 1..=chapter_count {
        out.push_str(&format!(
            "    <item id=\"chapter_{i}\" href=\"{}\" media-type=\"application/xhtml+xml\"/>\n",
            chapter_href(i)
        ));
    }
    let mut image_no = 0;
    for image in images {
        let id = if image == COVER_IMAGE_FILE {
            "cover".to_owned()
        } else {
            image_no += 1;
            format!("image_{image_no}")
        };
        out.push_str(&format!(
            "    <item id=\"{}\" href=\"images/{}\" media-type=\"{}\"/>\n",
            id,
            xml_escape(image),
            media_type_for_asset(image)
        ));
    }
    out.push_str("  </manifest>\n");

    out.push_str("  <spine toc=\"ncx\">\n");
    out.push_str("    <itemref idref=\"titlepage\"/>\n");
    out.push_str("    <itemref idref=\"toc\"/>\n");
    for i in 1..=chapter_count {
        out.push_str(&format!("    <itemref idref=\"chapter_{i}\"/>\n"));
    }
    out.push_str("  </spine>\n");

    out.push_str("  <guide>\n");
    out.push_str(&format!(
        "    <reference type=\"cover\" title=\"{}\" href=\"{TITLEPAGE_FILE}\"/>\n",
        xml_escape(cover_label)
    ));
    out.push_str(&format!(
        "    <reference type=\"toc\" title=\"{}\" href=\"{TOC_HTML_FILE}\"/>\n",
        xml_escape(contents_label)
    ));
    out.push_str("  </guide>\n");
    out.push_str("</package>\n");
    out
}

pub fn media_type_for_asset(rel_path: &str) -> &'static str {
    let ext = Path::new(rel_path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "css" => "text/css",
        "html" | "htm" | "xhtml" => "application/xhtml+xml",
        "ncx" => "application/x-dtbncx+xml",
        _ => "application/octet-stream",
    }
}

/// Rewrites `<img ...>`-style void elements as `<img ... />` so the document
/// parses as XHTML. Everything else is copied through unchanged.
pub fn ensure_xhtml_void_tags(html: &str) -> String {
    const VOID_TAGS: &[&str] = &[
        "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
        "source", "track", "wbr",
    ];

    let mut out = String::with_capacity(html.len() + 16);
    let mut rest = html;
    while let Some(lt) = rest.find('<') {
        out.push_str(&rest[..lt]);
        let tag_and_after = &rest[lt..];
        let Some(len) = tag_len(tag_and_after) else {
            out.push_str(tag_and_after);
            return out;
        };
        let tag = &tag_and_after[..len];
        rest = &tag_and_after[len..];

        let name: String = tag[1..]
            .chars()
            .take_while(char::is_ascii_alphabetic)
            .collect::<String>()
            .to_ascii_lowercase();
        let inner = &tag[..len - 1];
        if VOID_TAGS.contains(&name.as_str()) && !inner.trim_end().ends_with('/') {
            out.push_str(inner.trim_end());
            out.push_str(" />");
        } else {
            out.push_str(tag);
        }
    }
    out.push_str(rest);
    out
}

/// Byte length of the tag starting at `s[0] == '<'`, honouring quoted
/// attribute values. `None` when the tag never closes.
fn tag_len(s: &str) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, b) in s.bytes().enumerate().skip(1) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return Some(i + 1),
            None => {}
        }
    }
    None
}

pub fn xml_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Every regular file under `dir`, sorted by path. Dot files (leftover temp
/// files from an interrupted write) are skipped.
pub fn list_files_sorted(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in
            fs::read_dir(&current).with_context(|| format!("read dir: {}", current.display()))?
        {
            let entry = entry.with_context(|| format!("list dir: {}", current.display()))?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let file_type = entry.file_type().context("read entry type")?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Zips `src_dir` into `out_path`: `mimetype` first and stored, every other
/// file deflated in path order with a fixed timestamp, so identical trees
/// give identical archives. The archive is built next to the target and
/// renamed into place.
pub fn write_archive(src_dir: &Path, out_path: &Path) -> anyhow::Result<()> {
    let parent = out_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("create epub parent dir: {}", parent.display()))?;
    let tmp_path = parent.join("temp.zip");

    let stored = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);
    let deflated = stored.compression_method(zip::CompressionMethod::Deflated);

    let file = File::create(&tmp_path)
        .with_context(|| format!("create archive: {}", tmp_path.display()))?;
    let mut zip = zip::ZipWriter::new(file);

    zip.start_file("mimetype", stored)
        .context("epub start_file mimetype")?;
    zip.write_all(MIMETYPE.as_bytes())
        .context("epub write mimetype")?;

    for path in list_files_sorted(src_dir)? {
        let rel = path
            .strip_prefix(src_dir)
            .with_context(|| format!("strip prefix: {}", path.display()))?
            .to_string_lossy()
            .replace('\\', "/");
        if rel == "mimetype" {
            continue;
        }
        let mut f = File::open(&path).with_context(|| format!("open: {}", path.display()))?;
        zip.start_file(rel.as_str(), deflated)
            .with_context(|| format!("epub start_file: {rel}"))?;
        std::io::copy(&mut f, &mut zip).with_context(|| format!("epub write: {rel}"))?;
    }
    zip.finish().context("epub finish zip")?;

    fs::rename(&tmp_path, out_path)
        .with_context(|| format!("rename archive to {}", out_path.display()))?;
    Ok(())
}

pub fn extract_archive(epub_path: &Path, dest: &Path) -> anyhow::Result<()> {
    let file =
        File::open(epub_path).with_context(|| format!("open epub: {}", epub_path.display()))?;
    let mut archive = zip::ZipArchive::new(file).context("read epub archive")?;
    fs::create_dir_all(dest).with_context(|| format!("create dir: {}", dest.display()))?;
    archive
        .extract(dest)
        .with_context(|| format!("extract epub into {}", dest.display()))?;
    Ok(())
}

/// One `navPoint` of an NCX navigation map, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavEntry {
    pub label: String,
    /// `content/@src` with any `#fragment` removed.
    pub src: String,
}

pub fn parse_ncx(xml: &str) -> anyhow::Result<Vec<NavEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();

    let mut entries: Vec<NavEntry> = Vec::new();
    // Index into `entries` for every open navPoint.
    let mut open: Vec<usize> = Vec::new();
    let mut in_label = false;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf).context("parse ncx")? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"navPoint" => {
                    open.push(entries.len());
                    entries.push(NavEntry {
                        label: String::new(),
                        src: String::new(),
                    });
                }
                b"navLabel" => in_label = true,
                b"text" => in_text = in_label,
                b"content" => set_src(&e, &open, &mut entries)?,
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"content" => {
                set_src(&e, &open, &mut entries)?;
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"navPoint" => {
                    open.pop();
                }
                b"navLabel" => in_label = false,
                b"text" => in_text = false,
                _ => {}
            },
            Event::Text(t) if in_text => {
                if let Some(&idx) = open.last() {
                    entries[idx].label.push_str(&t.unescape().context("ncx label")?);
                }
            }
            Event::CData(t) if in_text => {
                if let Some(&idx) = open.last() {
                    entries[idx].label.push_str(&String::from_utf8_lossy(&t));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    for entry in &mut entries {
        entry.label = entry.label.trim().to_owned();
    }
    Ok(entries)
}

fn set_src(
    e: &quick_xml::events::BytesStart<'_>,
    open: &[usize],
    entries: &mut [NavEntry],
) -> anyhow::Result<()> {
    let (Some(&idx), Some(attr)) = (open.last(), e.try_get_attribute("src").context("ncx src")?)
    else {
        return Ok(());
    };
    let src = attr.unescape_value().context("ncx src value")?;
    let src = src.split('#').next().unwrap_or_default();
    entries[idx].src = src.to_owned();
    Ok(())
}

/// Replaces the label of every navPoint for which `new_label(src)` returns a
/// value. All other markup is written back untouched.
pub fn rewrite_ncx_labels(
    xml: &str,
    new_label: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<String> {
    let entries = parse_ncx(xml)?;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut buf = Vec::new();

    let mut next_point = 0usize;
    let mut open: Vec<usize> = Vec::new();
    let mut in_label = false;
    let mut in_text = false;
    let mut replaced_current = false;

    loop {
        buf.clear();
        let event = reader.read_event_into(&mut buf).context("parse ncx")?;
        match &event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"navPoint" => {
                    open.push(next_point);
                    next_point += 1;
                }
                b"navLabel" => in_label = true,
                b"text" if in_label => {
                    in_text = true;
                    replaced_current = false;
                }
                _ => {}
            },
            Event::End(e) => match e.local_name().as_ref() {
                b"navPoint" => {
                    open.pop();
                }
                b"navLabel" => in_label = false,
                b"text" => in_text = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }

        let replacement = match &event {
            Event::Text(_) | Event::CData(_) if in_text => open
                .last()
                .and_then(|&idx| entries.get(idx))
                .and_then(|entry| new_label(&entry.src)),
            _ => None,
        };
        match replacement {
            Some(label) => {
                // A label split over several text nodes collapses into one.
                if !replaced_current {
                    writer
                        .write_event(Event::Text(BytesText::new(&label)))
                        .context("write ncx")?;
                    replaced_current = true;
                }
            }
            None => writer.write_event(event).context("write ncx")?,
        }
    }

    String::from_utf8(writer.into_inner().into_inner()).context("ncx is not utf-8")
}

/// Swaps the text of the first `<dc:title>` element. `None` when the
/// document has no title element.
pub fn replace_opf_title(opf: &str, title: &str) -> Option<String> {
    if !RE_DC_TITLE.is_match(opf) {
        return None;
    }
    let escaped = xml_escape(title);
    Some(
        RE_DC_TITLE
            .replacen(opf, 1, |caps: &regex::Captures<'_>| {
                format!("{}{}{}", &caps[1], escaped, &caps[3])
            })
            .into_owned(),
    )
}
