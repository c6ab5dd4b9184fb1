use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about = "Convert PDF books to EPUB with Gemini, and translate EPUBs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Analyze the book structure of a PDF (cached per book).
    Analyze(AnalyzeArgs),
    /// Build an EPUB from a PDF.
    Generate(GenerateArgs),
    /// Translate an EPUB into another language.
    Translate(TranslateArgs),
    /// Analyze, generate and optionally translate in one run.
    Convert(ConvertArgs),
}

#[derive(Debug, Args)]
pub struct CommonArgs {
    /// Source file: a PDF, or an EPUB for `translate`.
    #[arg(short, long)]
    pub input: PathBuf,

    /// YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,
}

#[derive(Debug, Args)]
pub struct LanguageArgs {
    /// Source language (overrides `source_language`).
    #[arg(short = 's', long = "source-lang")]
    pub source_lang: Option<String>,

    /// Target language (overrides `target_language`).
    #[arg(short = 't', long = "target-lang")]
    pub target_lang: Option<String>,
}

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Continue from the saved progress instead of refusing to run.
    #[arg(short, long)]
    pub resume: bool,
}

#[derive(Debug, Args)]
pub struct TranslateArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Continue from the saved progress instead of refusing to run.
    #[arg(short, long)]
    pub resume: bool,

    #[command(flatten)]
    pub languages: LanguageArgs,
}

#[derive(Debug, Args)]
pub struct ConvertArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Continue from the saved progress instead of refusing to run.
    #[arg(short, long)]
    pub resume: bool,

    /// Also translate the generated EPUB.
    #[arg(long)]
    pub translate: bool,

    #[command(flatten)]
    pub languages: LanguageArgs,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn short_flags_parse() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "pdf2epub", "translate", "-i", "book.epub", "-c", "c.yaml", "-r", "-s", "Japanese",
            "-t", "English",
        ])?;
        let Command::Translate(args) = cli.command else {
            anyhow::bail!("expected translate");
        };
        assert_eq!(args.common.input, PathBuf::from("book.epub"));
        assert_eq!(args.common.config, PathBuf::from("c.yaml"));
        assert!(args.resume);
        assert_eq!(args.languages.source_lang.as_deref(), Some("Japanese"));
        assert_eq!(args.languages.target_lang.as_deref(), Some("English"));
        Ok(())
    }

    #[test]
    fn config_defaults_to_config_yaml() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["pdf2epub", "generate", "--input", "a.pdf"])?;
        let Command::Generate(args) = cli.command else {
            anyhow::bail!("expected generate");
        };
        assert_eq!(args.common.config, PathBuf::from("config.yaml"));
        assert!(!args.resume);
        Ok(())
    }
}
