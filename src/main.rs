use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use east_crnn::{ExtractConfig, ExtractError, ExtractorBuilder};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

#[derive(Parser)]
#[command(name = "east-crnn")]
#[command(about = "Extract text from every image in a directory with EAST + CRNN", long_about = None)]
struct Cli {
    /// Directory walked recursively for images; results land next to them
    #[arg(short, long = "extraction_dir")]
    extraction_dir: PathBuf,
}

fn run(cli: Cli) -> Result<(), ExtractError> {
    if !cli.extraction_dir.exists() {
        return Err(ExtractError::MissingDirectory(cli.extraction_dir));
    }

    let config = ExtractConfig::from_env()?;
    config.validate()?;
    let extractor = ExtractorBuilder::from_config(&config).build()?;

    let summary = extractor.extract_dir(&cli.extraction_dir)?;
    println!("{summary}");
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
