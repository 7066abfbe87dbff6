//! Byte signatures used to locate CEG library functions.
//!
//! The built-in tables cover the CEG builds seen so far. A JSON signature file
//! can replace any subset of them; fields omitted from the file keep their
//! built-in value.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::scanner::Pattern;

/// Window, in bytes, for forward finalize and backward prologue scans.
pub const SCAN_WINDOW: usize = 300;

/// Window at the start of the code span searched for the old-version marker.
pub const OLD_VERSION_WINDOW: usize = 0x20;

/// `push ecx; mov eax, imm32; call eax; pop ecx; jmp eax` trampoline of old CEG builds.
pub const OLD_VERSION_MARKER: &str = "51 B8 ?? ?? ?? ?? FF D0 59 FF E0";

/// A finalize epilogue and the distance from its match to the breakpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeSignature {
    pub pattern: String,
    pub offset: u32,
}

impl FinalizeSignature {
    fn new(pattern: &str, offset: u32) -> Self {
        Self {
            pattern: pattern.to_string(),
            offset,
        }
    }
}

fn default_finalize() -> Vec<FinalizeSignature> {
    vec![
        FinalizeSignature::new(
            "E8 ?? ?? ?? ?? 8D ?? ?? ?? ?? ?? E8 ?? ?? ?? ?? 8B 0D ?? ?? ?? ?? 8B",
            16,
        ),
        FinalizeSignature::new("E8 ?? ?? ?? ?? 8D ?? ?? E8 ?? ?? ?? ?? 8B 0D ?? ?? ?? ?? 8B", 13),
        FinalizeSignature::new(
            "E8 ?? ?? ?? ?? 8D ?? ?? ?? E8 ?? ?? ?? ?? 8B 0D ?? ?? ?? ?? 8B",
            14,
        ),
        FinalizeSignature::new("E8 ?? ?? ?? ?? 8D ?? ?? E8 ?? ?? ?? ?? 5F", 13),
        FinalizeSignature::new("E8 ?? ?? ?? ?? 8D ?? ?? ?? ?? ?? E8 ?? ?? ?? ?? 5F", 16),
        FinalizeSignature::new("E8 ?? ?? ?? ?? 8D ?? ?? ?? E8 ?? ?? ?? ?? 5F", 14),
    ]
}

fn strings(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| p.to_string()).collect()
}

/// Every signature table the classifier consults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureSet {
    /// Marker of an older CEG build, searched near the start of the code.
    pub old_version_marker: String,
    /// Library init; first pattern that matches wins.
    pub init: Vec<String>,
    /// Library terminate; first pattern that matches wins.
    pub terminate: Vec<String>,
    /// Register-thread candidates; all matches.
    pub register_thread: Vec<String>,
    /// Protected entry points; all matches.
    pub protect: Vec<String>,
    /// Integrity checks; all matches.
    pub integrity: Vec<String>,
    /// Test-secret functions; all matches.
    pub test_secret: Vec<String>,
    /// Finalize epilogues in priority order.
    pub finalize: Vec<FinalizeSignature>,
}

impl Default for SignatureSet {
    fn default() -> Self {
        Self {
            old_version_marker: OLD_VERSION_MARKER.to_string(),
            init: strings(&[
                "55 8B EC 83 E4 F8 81 EC ?? ?? ?? ?? 53 56 57 E8 ?? ?? ?? ?? 85 C0 0F 84",
                "55 8B EC 81 EC ?? ?? ?? ?? 53 56 57 E8 ?? ?? ?? ?? 85 C0 0F 84",
                "55 8B EC 83 EC ?? 53 56 57 E8 ?? ?? ?? ?? 85 C0 0F 84",
            ]),
            terminate: strings(&[
                "55 8B EC 51 56 8B 35 ?? ?? ?? ?? 85 F6 74 ?? 8B 06",
                "56 8B 35 ?? ?? ?? ?? 85 F6 74 ?? 8B 06 8B CE FF 50",
            ]),
            register_thread: strings(&[
                "55 8B EC 83 EC ?? 56 E8 ?? ?? ?? ?? 8B F0 85 F6 74 ?? 6A",
                "55 8B EC 51 56 E8 ?? ?? ?? ?? 8B F0 85 F6 74 ?? 6A",
            ]),
            protect: strings(&[
                "55 8B EC 83 EC ?? 53 56 57 8B 3D ?? ?? ?? ?? 8B F1 6A",
                "55 8B EC 81 EC ?? ?? ?? ?? 53 56 57 8B 3D ?? ?? ?? ?? 8B F1",
                "55 8B EC 6A FF 68 ?? ?? ?? ?? 64 A1 ?? ?? ?? ?? 50 83 EC ?? 53 56 57 A1 ?? ?? ?? ?? 33 C5 50 8D 45 F4 64 A3 ?? ?? ?? ?? 8B F1 8B 3D",
            ]),
            integrity: strings(&[
                "55 8B EC 83 EC ?? 53 56 8B 75 08 57 85 F6 74 ?? 8B 7D 0C 85 FF 74",
            ]),
            test_secret: strings(&[
                "55 8B EC 83 EC ?? 56 8B 75 08 85 F6 74 ?? 83 3E 00 74",
            ]),
            finalize: default_finalize(),
        }
    }
}

impl SignatureSet {
    /// Load a signature file, filling omitted tables from the built-in defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let set: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Signatures(format!("{}: {}", path.display(), e)))?;
        set.validate()?;
        debug!(path = %path.display(), "loaded signature file");
        Ok(set)
    }

    /// Compile every pattern once so a bad signature file is reported up front.
    pub fn validate(&self) -> Result<()> {
        let tables = [
            &self.init,
            &self.terminate,
            &self.register_thread,
            &self.protect,
            &self.integrity,
            &self.test_secret,
        ];
        for pattern in tables.into_iter().flatten() {
            Pattern::parse(pattern)?;
        }
        for finalize in &self.finalize {
            Pattern::parse(&finalize.pattern)?;
        }
        Pattern::parse(&self.old_version_marker)?;
        Ok(())
    }
}
