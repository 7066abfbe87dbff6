//! Offline analysis of a CEG binary.
//!
//! This module ties the loader, scanner and classifier together:
//! 1. Detect the CEG generation from the old-version trampoline
//! 2. Locate the init and terminate anchors
//! 3. Collect register-thread candidates and protected entry points
//! 4. Classify every protected call site
//! 5. Collect integrity and test-secret functions
//! 6. Produce the catalog

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::catalog::{Catalog, CatalogSlot, Category, CegVersion};
use crate::classifier::{Classification, Classifier};
use crate::error::{Error, Result};
use crate::pe::BinaryImage;
use crate::scanner;
use crate::signatures::{SignatureSet, OLD_VERSION_WINDOW};

/// Progress stage during analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressStage {
    DetectingVersion,
    LocatingAnchors,
    CollectingCandidates,
    Classifying,
    CollectingChecks,
    Complete,
}

impl ProgressStage {
    /// Get a human-readable name for the stage.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DetectingVersion => "Detecting CEG version",
            Self::LocatingAnchors => "Locating init/terminate",
            Self::CollectingCandidates => "Collecting protected functions",
            Self::Classifying => "Classifying call sites",
            Self::CollectingChecks => "Collecting integrity checks",
            Self::Complete => "Complete",
        }
    }
}

/// Progress information during analysis.
#[derive(Clone, Debug)]
pub struct ProgressInfo {
    /// Current stage.
    pub stage: ProgressStage,
    /// Bytes walked so far in the current stage.
    pub current: usize,
    /// Bytes to walk in the current stage.
    pub total: usize,
    /// Protected call sites found so far.
    pub call_sites: usize,
}

/// Progress callback type.
pub type ProgressCallback = Box<dyn Fn(&ProgressInfo) + Send + Sync>;

/// Everything the classifier command learns about a binary.
#[derive(Clone, Debug)]
pub struct AnalysisReport {
    pub version: CegVersion,
    pub init: u32,
    pub terminate: u32,
    /// Zero when no register-thread function was referenced.
    pub register_thread: u32,
    pub classification: Classification,
    /// Protected entry points found by signature.
    pub protected_candidates: usize,
    pub integrity: Vec<u32>,
    pub test_secret: Vec<u32>,
}

impl AnalysisReport {
    /// Fresh catalog: every entry unresolved, no restart requested.
    pub fn to_catalog(&self) -> Catalog {
        Catalog {
            init: self.init,
            register_thread: self.register_thread,
            terminate: self.terminate,
            version: self.version,
            entries: self
                .classification
                .entries()
                .into_iter()
                .map(CatalogSlot::Entry)
                .collect(),
            should_restart: false,
            integrity: self.integrity.clone(),
            test_secret: self.test_secret.clone(),
        }
    }

    /// Log anchors and per-category counts.
    pub fn log_summary(&self) {
        info!(address = format_args!("0x{:08x}", self.init), "CEG init function");
        info!(address = format_args!("0x{:08x}", self.terminate), "CEG terminate function");
        if self.register_thread != 0 {
            info!(
                address = format_args!("0x{:08x}", self.register_thread),
                "CEG register thread function"
            );
        }
        for category in Category::ALL {
            let count = self.classification.unique_functions(category);
            if count > 0 {
                info!(count, "CEG protected {} functions", category.name());
            }
        }
        if !self.integrity.is_empty() {
            info!(count = self.integrity.len(), "CEG integrity functions");
        }
        if !self.test_secret.is_empty() {
            info!(count = self.test_secret.len(), "CEG test secret functions");
        }
    }
}

/// What [`AnalysisContext::export`] produced.
#[derive(Debug)]
pub struct Export {
    pub report: AnalysisReport,
    /// Path of the ASLR-disabled copy, when one was needed.
    pub no_aslr: Option<PathBuf>,
}

/// Owns one analysis run: the image, the signature tables and progress reporting.
pub struct AnalysisContext {
    image: BinaryImage,
    signatures: SignatureSet,
    progress: Option<ProgressCallback>,
}

impl AnalysisContext {
    pub fn new(image: BinaryImage, signatures: SignatureSet) -> Self {
        Self {
            image,
            signatures,
            progress: None,
        }
    }

    /// Set a progress callback.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn image(&self) -> &BinaryImage {
        &self.image
    }

    fn report(&self, stage: ProgressStage, current: usize, total: usize, call_sites: usize) {
        if let Some(ref cb) = self.progress {
            cb(&ProgressInfo {
                stage,
                current,
                total,
                call_sites,
            });
        }
    }

    /// Code offsets to virtual addresses.
    fn to_va(&self, offsets: impl IntoIterator<Item = usize>) -> Vec<u32> {
        offsets
            .into_iter()
            .map(|o| self.image.code_va(o as u32))
            .collect()
    }

    /// Run the analysis and write its results next to `source`.
    ///
    /// The catalog goes to `catalog_path` first. Only then, for an image with
    /// ASLR enabled, the `_noaslr` copy is written. A failed analysis writes
    /// nothing.
    pub fn export(&self, source: &Path, catalog_path: &Path) -> Result<Export> {
        let report = self.run()?;
        report.to_catalog().save(catalog_path)?;
        info!(path = %catalog_path.display(), "wrote catalog");

        let no_aslr = if self.image.aslr_enabled {
            let path = self.image.save_without_aslr(source)?;
            warn!(path = %path.display(), "ASLR was enabled; wrote a copy with it disabled");
            Some(path)
        } else {
            None
        };
        Ok(Export { report, no_aslr })
    }

    /// Run every analysis stage.
    pub fn run(&self) -> Result<AnalysisReport> {
        let code = self.image.code();
        let sigs = &self.signatures;
        debug!(code_size = code.len(), "analyzing code section");

        self.report(ProgressStage::DetectingVersion, 0, code.len(), 0);
        let old_version = scanner::find_pattern(
            &sigs.old_version_marker,
            scanner::region(code, 0, OLD_VERSION_WINDOW),
        )
        .is_some();
        if old_version {
            warn!("older CEG version found");
        }

        self.report(ProgressStage::LocatingAnchors, 0, code.len(), 0);
        let (_, init) = scanner::find_first_of(&sigs.init, code)
            .ok_or(Error::MissingAnchor { name: "init" })?;
        let (_, terminate) = scanner::find_first_of(&sigs.terminate, code)
            .ok_or(Error::MissingAnchor { name: "terminate" })?;

        self.report(ProgressStage::CollectingCandidates, 0, code.len(), 0);
        let register_candidates: HashSet<u32> =
            scanner::find_all_patterns(&sigs.register_thread, code)
                .into_iter()
                .map(|o| o as u32)
                .collect();
        let protected: HashSet<u32> = scanner::find_all_patterns(&sigs.protect, code)
            .into_iter()
            .map(|o| o as u32)
            .collect();
        debug!(
            register_candidates = register_candidates.len(),
            protected = protected.len(),
            "collected candidates"
        );

        let classification = if protected.is_empty() {
            warn!("no CEG protected functions found");
            Classification::default()
        } else {
            let classifier = Classifier::new(&self.image, sigs, old_version);
            let mut result = classifier.classify(&protected, &register_candidates, |current, total| {
                self.report(ProgressStage::Classifying, current, total, 0)
            });
            let pruned = result.reconcile();
            if pruned > 0 {
                debug!(pruned, "dropped stolen (v2) keys classified elsewhere");
            }
            result
        };

        self.report(ProgressStage::CollectingChecks, 0, code.len(), classification.call_sites);
        let integrity = self.to_va(scanner::find_all_patterns(&sigs.integrity, code));
        let test_secret = self.to_va(scanner::find_all_patterns(&sigs.test_secret, code));

        self.report(
            ProgressStage::Complete,
            code.len(),
            code.len(),
            classification.call_sites,
        );

        Ok(AnalysisReport {
            version: if old_version {
                CegVersion::Old
            } else {
                CegVersion::New
            },
            init: self.image.code_va(init as u32),
            terminate: self.image.code_va(terminate as u32),
            register_thread: classification
                .register_thread
                .map(|o| self.image.code_va(o))
                .unwrap_or(0),
            protected_candidates: protected.len(),
            classification,
            integrity,
            test_secret,
        })
    }
}
