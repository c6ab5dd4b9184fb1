//! Entry points behind each subcommand: load the config, set up logging for
//! the book, then drive the pipelines in order.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;

use crate::assemble::Assembler;
use crate::cli::{AnalyzeArgs, CommonArgs, ConvertArgs, GenerateArgs, LanguageArgs, TranslateArgs};
use crate::config::Config;
use crate::formats::BookStructure;
use crate::gemini::GeminiClient;
use crate::logging::{self, FileLogOptions, LogHandle, LogOptions};
use crate::structure;
use crate::translate::Translator;
use crate::workspace::{self, BookPaths};

/// What every subcommand needs once started.
struct Session {
    config: Config,
    paths: BookPaths,
    client: GeminiClient,
    log: LogHandle,
}

impl Session {
    fn open(common: &CommonArgs, languages: Option<&LanguageArgs>) -> anyhow::Result<Self> {
        let mut config = Config::load(&common.config)?;
        if let Some(languages) = languages {
            config = config.with_languages(
                languages.source_lang.clone(),
                languages.target_lang.clone(),
            );
        }
        let title = config.book_title(&common.input);
        let paths = BookPaths::new(&config.output_dir, &title);

        let log = logging::init(&LogOptions {
            level: config.log_level.clone(),
            file: config.log_file.then(|| FileLogOptions {
                path: paths.log_file(),
                max_bytes: config.log_max_bytes,
                retention: Duration::from_secs(config.log_retention_days * 24 * 60 * 60),
            }),
        })
        .context("init logging")?;

        if config.title.as_deref().is_none_or(|t| t.trim().is_empty()) {
            tracing::warn!(title = %title, "no title in config; using input file name");
        }
        tracing::info!(
            title = %title,
            dir = %paths.root.display(),
            log = ?log.log_file,
            "book workspace"
        );

        let client = GeminiClient::from_config(&config)?;
        Ok(Self {
            config,
            paths,
            client,
            log,
        })
    }

    /// Logs a failed run with the place to look for details.
    fn report<T>(&self, result: anyhow::Result<T>) -> anyhow::Result<T> {
        if let Err(err) = &result {
            tracing::error!(
                error = %format!("{err:#}"),
                log = ?self.log.log_file,
                "run stopped; rerun with --resume to continue"
            );
        }
        result
    }

    async fn structure(&self, input: &Path) -> anyhow::Result<(PathBuf, BookStructure)> {
        let threshold = self.config.compress_threshold_mb * 1024 * 1024;
        let pdf = workspace::prepare_input(&self.paths, input, threshold).context("prepare input")?;
        let structure = structure::load_or_analyze(&self.paths, &pdf, &self.client, &self.config)
            .await
            .context("structure analysis")?;
        Ok((pdf, structure))
    }

    async fn generate(&self, input: &Path, resume: bool) -> anyhow::Result<PathBuf> {
        let (pdf, structure) = self.structure(input).await?;
        Assembler {
            model: &self.client,
            config: &self.config,
            paths: &self.paths,
            structure: &structure,
        }
        .run(&pdf, resume)
        .await
        .context("generate epub")
    }

    async fn translate(&self, epub: &Path, resume: bool) -> anyhow::Result<PathBuf> {
        Translator {
            model: &self.client,
            config: &self.config,
            paths: &self.paths,
        }
        .run(epub, resume)
        .await
        .context("translate epub")
    }
}

pub async fn analyze(args: AnalyzeArgs) -> anyhow::Result<()> {
    let session = Session::open(&args.common, None)?;
    let (_, structure) = session.report(session.structure(&args.common.input).await)?;
    println!("{}", session.paths.structure_json().display());
    println!(
        "chapters: {}, table of contents: {}",
        structure.chapters.len(),
        if structure.table_of_contents.is_some() { "yes" } else { "no" }
    );
    for (i, chapter) in structure.chapters.iter().enumerate() {
        println!(
            "  {:>3}. {} (pages {}-{})",
            i + 1,
            chapter.title,
            chapter.start_page,
            chapter.end_page
        );
    }
    Ok(())
}

pub async fn generate(args: GenerateArgs) -> anyhow::Result<()> {
    let session = Session::open(&args.common, None)?;
    let out = session.report(session.generate(&args.common.input, args.resume).await)?;
    println!("{}", out.display());
    Ok(())
}

pub async fn translate(args: TranslateArgs) -> anyhow::Result<()> {
    let session = Session::open(&args.common, Some(&args.languages))?;
    let out = session.report(session.translate(&args.common.input, args.resume).await)?;
    println!("{}", out.display());
    Ok(())
}

pub async fn run(args: ConvertArgs) -> anyhow::Result<()> {
    let session = Session::open(&args.common, Some(&args.languages))?;
    let epub = session.report(session.generate(&args.common.input, args.resume).await)?;
    println!("{}", epub.display());
    if args.translate {
        let translated = session.report(session.translate(&epub, args.resume).await)?;
        println!("{}", translated.display());
    }
    Ok(())
}
