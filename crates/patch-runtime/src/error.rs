//! Error types for the patch-runtime crate
//!
//! Recoverable failures are explicit results; the whole pending batch is
//! discarded before any byte is written. Protocol violations (dangling key
//! references, unbalanced disables, double patches) are not represented here:
//! they indicate a loading/unloading bug elsewhere and the crate panics
//! rather than continue toward an unpatched jump into unmapped memory.

use thiserror::Error;

/// Patch-runtime errors
#[derive(Debug, Clone, Error)]
pub enum PatchError {
    #[error(
        "target {target:#x} unreachable from site {site:#x}: \
         displacement exceeds the {width}-bit branch encoding"
    )]
    EncodingRange { site: usize, target: usize, width: u32 },

    #[error("{what} address {addr:#x} is not aligned to {align} bytes")]
    Misaligned {
        what: &'static str,
        addr: usize,
        align: usize,
    },

    #[error("image layout invalid: {reason}")]
    Layout { reason: String },

    #[error("code region allocation failed: {reason}")]
    Alloc { reason: String },

    #[error("no attached image with id {id}")]
    UnknownImage { id: u64 },

    #[error(transparent)]
    Table(#[from] jump_table::TableError),
}

/// Result type alias for patch-runtime operations
pub type PatchResult<T> = Result<T, PatchError>;
