use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::Context as _;
use tracing_subscriber::Layer as _;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Used when `RUST_LOG` is unset.
    pub level: String,
    pub file: Option<FileLogOptions>,
}

#[derive(Debug, Clone)]
pub struct FileLogOptions {
    pub path: PathBuf,
    pub max_bytes: u64,
    pub retention: Duration,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            file: None,
        }
    }
}

/// Where this process is logging to. Handed to the pipelines so failures can
/// point at the log file.
#[derive(Debug, Clone, Default)]
pub struct LogHandle {
    pub log_file: Option<PathBuf>,
}

pub fn init(options: &LogOptions) -> anyhow::Result<LogHandle> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&options.level))
        .context("build log filter")?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(io::stderr)
        .with_filter(filter);

    let (file_layer, log_file) = match &options.file {
        Some(file) => {
            let writer = RotatingFile::open(file).context("open log file")?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(writer))
                .with_filter(LevelFilter::DEBUG);
            (Some(layer), Some(file.path.clone()))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(LogHandle { log_file })
}

/// Appends to `path`, moving it aside as `path.<unix-millis>` once it grows past
/// `max_bytes`. Rotated files older than the retention window are deleted.
struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    retention: Duration,
    file: File,
    written: u64,
}

impl RotatingFile {
    fn open(options: &FileLogOptions) -> io::Result<Self> {
        if let Some(parent) = options.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&options.path)?;
        let written = file.metadata()?.len();
        let mut out = Self {
            path: options.path.clone(),
            max_bytes: options.max_bytes.max(1),
            retention: options.retention,
            file,
            written,
        };
        if out.written >= out.max_bytes {
            out.rotate()?;
        }
        Ok(out)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let stamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let rotated = PathBuf::from(format!("{}.{stamp}", self.path.display()));
        fs::rename(&self.path, &rotated)?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        // Runs inside the subscriber's writer, so failures go straight to the
        // file instead of through `tracing`.
        for (path, err) in remove_expired(&self.path, self.retention) {
            let line = format!(
                "WARN pdf2epub::logging: failed to remove expired log path={} error={err}\n",
                path.display()
            );
            self.file.write_all(line.as_bytes())?;
            self.written += line.len() as u64;
        }
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_bytes && self.written > 0 {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Deletes rotated copies of `path` older than `retention` and returns the
/// ones that could not be removed.
fn remove_expired(path: &Path, retention: Duration) -> Vec<(PathBuf, io::Error)> {
    let mut failures = Vec::new();
    let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
        return failures;
    };
    let prefix = format!("{}.", name.to_string_lossy());
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            failures.push((dir.to_path_buf(), err));
            return failures;
        }
    };
    let now = SystemTime::now();
    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().to_string();
        if !file_name.starts_with(&prefix) {
            continue;
        }
        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > retention);
        if expired {
            let path = entry.path();
            if let Err(err) = fs::remove_file(&path) {
                failures.push((path, err));
            }
        }
    }
    failures
}
