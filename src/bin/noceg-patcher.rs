//! noceg-patcher - write captured CEG values into the executable.

use std::path::PathBuf;

use anyhow::{bail, Context};
use bytesize::ByteSize;
use clap::Parser;
use tracing::info;

use noceg::resolver::CATALOG_FILE;
use noceg::{logging, Catalog, PatchSet, Patcher};

/// Patch CEG-protected functions using a resolved catalog.
#[derive(Parser)]
#[command(name = "noceg-patcher")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Executable to patch
    binary: PathBuf,

    /// Catalog to read (default: noceg.json beside the binary)
    #[arg(short, long)]
    catalog: Option<PathBuf>,

    /// Patched output (default: <stem>_noceg<ext> beside the binary)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    logging::init_cli();
    let cli = Cli::parse();

    let catalog_path = cli
        .catalog
        .unwrap_or_else(|| cli.binary.with_file_name(CATALOG_FILE));
    let catalog = Catalog::load(&catalog_path)
        .with_context(|| format!("loading catalog {}", catalog_path.display()))?;

    let patches = PatchSet::from_catalog(&catalog);
    if patches.is_empty() {
        bail!("catalog {} yields no patches", catalog_path.display());
    }
    info!(patches = patches.len(), unresolved = catalog.unresolved_count(), "loaded catalog");

    let mut patcher = Patcher::read(&cli.binary)
        .with_context(|| format!("reading {}", cli.binary.display()))?;
    info!(
        size = %ByteSize::b(patcher.bytes().len() as u64),
        image_base = format_args!("0x{:08x}", patcher.image_base()),
        "loaded image"
    );

    let stats = patcher.apply(&patches);
    if stats.applied == 0 {
        bail!("none of the {} patches map into {}", patches.len(), cli.binary.display());
    }

    let output = cli
        .output
        .unwrap_or_else(|| Patcher::output_path(&cli.binary));
    patcher
        .save(&output)
        .with_context(|| format!("writing {}", output.display()))?;
    info!(path = %output.display(), applied = stats.applied, "wrote patched image");

    Ok(())
}
