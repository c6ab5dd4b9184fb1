use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    let cli = pdf2epub::cli::Cli::parse();

    match cli.command {
        pdf2epub::cli::Command::Analyze(args) => {
            pdf2epub::convert::analyze(args).await.context("analyze")?;
        }
        pdf2epub::cli::Command::Generate(args) => {
            pdf2epub::convert::generate(args).await.context("generate")?;
        }
        pdf2epub::cli::Command::Translate(args) => {
            pdf2epub::convert::translate(args).await.context("translate")?;
        }
        pdf2epub::cli::Command::Convert(args) => {
            pdf2epub::convert::run(args).await.context("convert")?;
        }
    }

    Ok(())
}
