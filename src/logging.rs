//! Tracing setup for the command-line tools and the injected resolver.

use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Log to stderr. `RUST_LOG` overrides the default `info` level.
pub fn init_cli() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter())
        .try_init();
}

/// Log to `path`, truncating it. Used inside the host process, which has no console.
pub fn init_file(path: &Path) -> Result<()> {
    let file = File::create(path)?;
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_thread_ids(true)
                .with_writer(Mutex::new(file)),
        )
        .with(filter())
        .try_init();
    Ok(())
}
