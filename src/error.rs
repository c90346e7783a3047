//! Error conditions callers may want to tell apart.
//!
//! Everything in the crate returns [`anyhow::Result`]; the variants below are
//! raised through it so they can be recovered with
//! `err.downcast_ref::<ConvertError>()` even after context has been attached.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("{0} compressed archives are not supported")]
    UnsupportedCompression(&'static str),

    #[error("{entry:?} is outside of {root:?}")]
    ContainmentViolation { entry: PathBuf, root: PathBuf },

    #[error("invalid hardlink {path:?} -> {target:?}")]
    InvalidHardlink { path: PathBuf, target: PathBuf },

    #[error("invalid symlink {path:?} -> {target:?}")]
    InvalidSymlink { path: PathBuf, target: PathBuf },

    #[error("unsupported tar entry type {kind} for {path:?}")]
    UnsupportedEntryType { path: PathBuf, kind: String },

    #[error("too many levels of symbolic links resolving {0:?}")]
    TooManyLinks(PathBuf),

    #[error("invalid image JSON, no rootfs key")]
    MissingRootFs,

    #[error("image {config} lists {layers} layers but its rootfs has {diff_ids} diff ids")]
    LayerCountMismatch {
        config: String,
        layers: usize,
        diff_ids: usize,
    },

    #[error("invalid digest {digest}: {reason}")]
    InvalidDigest { digest: String, reason: String },

    #[error("blob {expected} has digest {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("blob {digest} is {actual} bytes, descriptor says {expected}")]
    SizeMismatch {
        digest: String,
        expected: u64,
        actual: u64,
    },

    #[error("destination {0:?} exists")]
    DestinationExists(PathBuf),
}
