//! # noceg
//!
//! Locates CEG-protected call sites in 32-bit executables, resolves the values
//! they compute inside the running process and patches them out of the file.
//!
//! ## Overview
//!
//! The work is split across three stages that share one JSON catalog:
//!
//! 1. `noceg-signatures` scans the code section for CEG routines, classifies
//!    every protected call site and writes `noceg.json`
//! 2. This library, injected into the game as a DLL, runs each unresolved
//!    entry under a breakpoint and records the value it produces
//! 3. `noceg-patcher` rewrites the protected functions to return the captured
//!    values directly
//!
//! ## Usage as DLL
//!
//! Built for 32-bit Windows, loading the DLL into the host starts the resolver
//! from `DllMain`. The catalog and `noceg.log` live next to the host executable.

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod pe;
pub mod scanner;
pub mod signatures;
pub mod catalog;
pub mod classifier;
pub mod analysis;
pub mod patcher;
pub mod memory;
pub mod breakpoint;
pub mod process;
pub mod resolver;
pub mod logging;

pub use analysis::{
    AnalysisContext, AnalysisReport, Export, ProgressCallback, ProgressInfo, ProgressStage,
};
pub use catalog::{Catalog, CatalogEntry, CatalogSlot, Category, CegVersion, EntryRecord};
pub use error::{Error, Result};
pub use patcher::{PatchSet, Patcher};
pub use pe::BinaryImage;
pub use resolver::{Resolver, ResolverConfig, RunOutcome};
pub use signatures::SignatureSet;

// DLL entry point for the injected resolver
#[cfg(all(target_os = "windows", target_arch = "x86"))]
#[no_mangle]
pub extern "system" fn DllMain(
    _hinst_dll: *mut std::ffi::c_void,
    fdw_reason: u32,
    _lpv_reserved: *mut std::ffi::c_void,
) -> i32 {
    const DLL_PROCESS_ATTACH: u32 = 1;

    if fdw_reason == DLL_PROCESS_ATTACH {
        // Resolution has to finish before the host's own code runs, so it
        // happens on the loader thread.
        resolver::windows::attach();
    }

    1 // TRUE
}
