//! noceg-signatures - locate and classify CEG-protected call sites.
//!
//! Reads a 32-bit executable, writes the catalog the injected resolver and
//! the patcher consume, and saves an ASLR-disabled copy when the image asks
//! for a dynamic base.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use bytesize::ByteSize;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use noceg::resolver::CATALOG_FILE;
use noceg::{logging, AnalysisContext, BinaryImage, ProgressInfo, ProgressStage, SignatureSet};

/// Locate CEG-protected functions and write the resolver catalog.
#[derive(Parser)]
#[command(name = "noceg-signatures")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// 32-bit executable to analyze
    binary: PathBuf,

    /// Catalog output path (default: noceg.json beside the binary)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// JSON file overriding the built-in signature tables
    #[arg(short, long)]
    signatures: Option<PathBuf>,
}

fn beside(binary: &Path, name: &str) -> PathBuf {
    binary.with_file_name(name)
}

fn progress_bar() -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}

fn main() -> anyhow::Result<()> {
    logging::init_cli();
    let cli = Cli::parse();

    let signatures = match &cli.signatures {
        Some(path) => SignatureSet::load(path)
            .with_context(|| format!("loading signatures from {}", path.display()))?,
        None => SignatureSet::default(),
    };

    let image = BinaryImage::read(&cli.binary)
        .with_context(|| format!("reading {}", cli.binary.display()))?;
    info!(
        path = %cli.binary.display(),
        size = %ByteSize::b(image.bytes().len() as u64),
        code = %ByteSize::b(image.code_size as u64),
        "loaded image"
    );

    let pb = progress_bar()?;
    let pb_clone = pb.clone();
    let context = AnalysisContext::new(image, signatures).with_progress(Box::new(
        move |info: &ProgressInfo| {
            let pct = if info.total > 0 {
                (info.current as f64 / info.total as f64 * 100.0) as u64
            } else {
                0
            };
            let msg = match info.stage {
                ProgressStage::Classifying => format!(
                    "{} - {} of {}",
                    info.stage.name(),
                    ByteSize::b(info.current as u64),
                    ByteSize::b(info.total as u64)
                ),
                ProgressStage::CollectingChecks | ProgressStage::Complete => {
                    format!("{} - {} call sites", info.stage.name(), info.call_sites)
                }
                _ => info.stage.name().to_string(),
            };
            pb_clone.set_position(pct);
            pb_clone.set_message(msg);
        },
    ));

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| beside(&cli.binary, CATALOG_FILE));
    let export = context.export(&cli.binary, &output);
    pb.finish_and_clear();
    let export = export.with_context(|| format!("analyzing {}", cli.binary.display()))?;
    export.report.log_summary();

    Ok(())
}
