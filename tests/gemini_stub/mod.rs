use std::io::Read as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct GeminiStubConfig {
    /// Answer to the structure analysis request.
    pub structure_json: String,
    /// `data-page` of an image placeholder emitted in chapter 1.
    pub chapter_one_placeholder_page: Option<u32>,
    /// Requests answered with 503 before the stub starts behaving.
    pub fail_first: usize,
    /// Drop the last line of every numbered title answer.
    pub short_title_batches: bool,
    /// Chapter whose conversion always fails with a 500.
    pub fail_chapter: Option<u32>,
}

/// A Gemini REST stand-in that recognizes each pipeline request by its
/// prompt and records what it was asked for.
pub struct GeminiStub {
    pub base_url: String,
    calls: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

#[allow(dead_code)]
impl GeminiStub {
    pub fn spawn(config: GeminiStubConfig) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start gemini stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}");

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&calls);
        let failures = AtomicUsize::new(0);

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let url = request.url().to_string();
                let streaming = url.contains(":streamGenerateContent");
                if request.method() != &tiny_http::Method::Post
                    || !(streaming || url.contains(":generateContent"))
                {
                    let _ = request.respond(
                        tiny_http::Response::from_string("not found").with_status_code(404),
                    );
                    continue;
                }

                if failures.fetch_add(1, Ordering::SeqCst) < config.fail_first {
                    let _ = request.respond(
                        tiny_http::Response::from_string(
                            r#"{"error":{"code":503,"message":"overloaded"}}"#,
                        )
                        .with_status_code(503),
                    );
                    continue;
                }

                let mut body = String::new();
                if request.as_reader().read_to_string(&mut body).is_err() {
                    let _ = request.respond(
                        tiny_http::Response::from_string("invalid request body")
                            .with_status_code(400),
                    );
                    continue;
                }
                let parsed: Value = match serde_json::from_str(&body) {
                    Ok(value) => value,
                    Err(_) => {
                        let _ = request.respond(
                            tiny_http::Response::from_string("invalid json").with_status_code(400),
                        );
                        continue;
                    }
                };

                let (kind, text) = match answer(&config, &parsed) {
                    Some(found) => found,
                    None => {
                        let _ = request.respond(
                            tiny_http::Response::from_string("unknown prompt mode")
                                .with_status_code(400),
                        );
                        continue;
                    }
                };
                if config
                    .fail_chapter
                    .is_some_and(|n| kind == format!("chapter {n}"))
                {
                    let _ = request.respond(
                        tiny_http::Response::from_string(
                            r#"{"error":{"code":500,"message":"internal"}}"#,
                        )
                        .with_status_code(500),
                    );
                    continue;
                }
                recorded.lock().expect("lock calls").push(kind);

                let response = if streaming {
                    let (head, tail) = split_in_half(&text);
                    let mut sse = String::new();
                    for piece in [head, tail] {
                        sse.push_str(&format!("data: {}\r\n\r\n", chunk(piece)));
                    }
                    tiny_http::Response::from_string(sse).with_header(
                        tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"text/event-stream"[..])
                            .expect("build header"),
                    )
                } else {
                    tiny_http::Response::from_string(chunk(&text).to_string()).with_header(
                        tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                            .expect("build header"),
                    )
                };
                let _ = request.respond(response.with_status_code(200));
            }
        });

        Self {
            base_url,
            calls,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Request kinds answered so far, in order: `structure`, `toc`,
    /// `chapter N`, `book title`, `titles`, `translate`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock calls").clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == kind).count()
    }
}

impl Drop for GeminiStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn chunk(text: &str) -> Value {
    serde_json::json!({
        "candidates": [
            { "content": { "role": "model", "parts": [ { "text": text } ] } }
        ]
    })
}

fn split_in_half(text: &str) -> (&str, &str) {
    let mut mid = text.len() / 2;
    while !text.is_char_boundary(mid) {
        mid += 1;
    }
    text.split_at(mid)
}

fn text_parts(parsed: &Value) -> Vec<String> {
    parsed
        .get("contents")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|content| content.get("parts").and_then(Value::as_array))
        .flatten()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .map(str::to_owned)
        .collect()
}

fn answer(config: &GeminiStubConfig, parsed: &Value) -> Option<(String, String)> {
    let mime = parsed
        .pointer("/generationConfig/responseMimeType")
        .and_then(Value::as_str);
    if mime == Some("application/json") {
        return Some(("structure".to_owned(), config.structure_json.clone()));
    }

    let parts = text_parts(parsed);
    let prompt = parts.join("\n");
    if prompt.contains("Translate the HTML document") {
        let html = parts.last()?.replace("<p>", "<p>[EN] ");
        return Some(("translate".to_owned(), html));
    }
    if prompt.contains("Translate the following book title") {
        return Some(("book title".to_owned(), "Translated Title\n".to_owned()));
    }
    if prompt.contains("Translate the following chapter titles") {
        let mut lines: Vec<String> = prompt
            .lines()
            .filter_map(|line| {
                let (number, title) = line.trim().split_once(". ")?;
                number.parse::<u32>().ok()?;
                Some(format!("{number}. EN {title}"))
            })
            .collect();
        if config.short_title_batches {
            lines.pop();
        }
        return Some(("titles".to_owned(), lines.join("\n")));
    }
    if prompt.contains("table of contents of the book") {
        let html = r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title>Contents</title></head><body><nav class="toc"><ol><li class="level-1"><a href="chapter_1.html">One</a></li></ol></nav></body></html>"#;
        return Some(("toc".to_owned(), html.to_owned()));
    }
    if prompt.contains("You are converting one chapter") {
        let number: u32 = prompt
            .split("Chapter ")
            .skip(1)
            .find_map(|rest| rest.split(',').next()?.parse().ok())?;
        let placeholder = match (number, config.chapter_one_placeholder_page) {
            (1, Some(page)) => format!(
                r#"<div class="image-placeholder" id="img-1" data-page="{page}" data-description="A figure"></div>"#
            ),
            _ => String::new(),
        };
        let html = format!(
            r#"```html
<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title>Chapter {number}</title><link rel="stylesheet" type="text/css" href="../stylesheet.css" /></head><body><h1>Chapter {number}</h1><p>Body of chapter {number}.<br></p>{placeholder}</body></html>
```"#
        );
        return Some((format!("chapter {number}"), html));
    }
    None
}
