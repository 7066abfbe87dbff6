//! Error types for noceg.

use thiserror::Error;

/// Crate-wide result.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while analyzing, resolving or patching a CEG binary.
#[derive(Error, Debug)]
pub enum Error {
    #[error("binary content is empty")]
    EmptyImage,

    #[error("missing MZ signature at offset 0x{0:X}")]
    InvalidDosSignature(usize),

    #[error("missing PE signature at offset 0x{0:X}")]
    InvalidPeSignature(usize),

    #[error("unsupported machine type: 0x{0:X} (expected a 32-bit image)")]
    UnsupportedMachine(u16),

    #[error("headers truncated: need {expected} bytes, file has {actual}")]
    HeadersTooSmall { expected: usize, actual: usize },

    #[error("image base is null")]
    NullImageBase,

    #[error("image has no sections")]
    NoSections,

    #[error("raw data pointer of the first section is null")]
    NullRawPointer,

    #[error("virtual size of the first section is null")]
    NullVirtualSize,

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("required CEG function '{name}' not found")]
    MissingAnchor { name: &'static str },

    #[error("catalog is malformed: {0}")]
    Catalog(#[from] serde_json::Error),

    #[error("signature file is malformed: {0}")]
    Signatures(String),

    #[error("CEG init function at 0x{0:08X} reported failure")]
    InitRejected(u32),

    #[error("a breakpoint is already armed at 0x{0:08X}")]
    BreakpointAlreadyArmed(u32),

    #[error("failed to change page protection at 0x{0:08X}")]
    ProtectionChangeFailed(u32),

    #[error("restart mutex could not be acquired")]
    MutexUnavailable,

    #[error("failed to relaunch host executable: {0}")]
    RelaunchFailed(String),

    #[cfg(target_os = "windows")]
    #[error("Win32 call failed: {0}")]
    WindowsApi(#[from] windows::core::Error),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}
