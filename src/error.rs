//! Error taxonomy for the image pipeline.
//!
//! Each variant corresponds to one failure class with its own retry policy:
//! remote lookup and transfer failures are retryable by the caller, integrity
//! and corruption failures are fatal, and the metadata races (`AlreadyExists`,
//! `NotFound`) are normally absorbed by the pipeline's fallback paths.

use thiserror::Error;

use crate::digest::{ChainId, Digest};

/// A type-erased error source, used where the underlying failure is opaque
/// (network transports, archive parsers, external snapshotters).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors reported by the image pipeline.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid image reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },
    #[error("failed to resolve {reference}")]
    Resolve {
        reference: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to fetch {digest}")]
    Fetch {
        digest: Digest,
        #[source]
        source: BoxError,
    },
    #[error("digest mismatch: expected {expected}, found {found}")]
    DigestMismatch { expected: Digest, found: Digest },
    #[error("unsupported media type {media_type:?} for {digest}")]
    UnsupportedMediaType { digest: Digest, media_type: String },
    #[error("malformed content {digest}")]
    Malformed {
        digest: Digest,
        #[source]
        source: BoxError,
    },
    #[error("no manifest in {digest} matches platform {platform}")]
    NoMatchingManifest { digest: Digest, platform: String },
    #[error("failed to unpack layer {digest}")]
    Unpack {
        digest: Digest,
        #[source]
        source: BoxError,
    },
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("failed to remove reference {reference} of image {image}")]
    Removal {
        reference: String,
        image: ChainId,
        #[source]
        source: BoxError,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Whether retrying the whole operation may succeed.
    ///
    /// Only remote failures qualify; integrity and corruption errors must not
    /// be papered over by retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Resolve { .. } | Self::Fetch { .. })
    }
}

/// Result type used throughout the public API.
pub type Result<T, E = Error> = std::result::Result<T, E>;
