//! Pulling container images into content-addressed local storage.
//!
//! An image is fetched as a graph of blobs (index, manifest, config, layers)
//! into a [`content::ContentStore`], its layers are applied into snapshots
//! keyed by chain ID, and the result is recorded as an
//! [`metadata::ImageRecord`].  Blobs and snapshots are shared between all
//! images that contain them.

pub mod content;
pub mod digest;
pub mod dispatch;
pub mod error;
pub mod manifest;
pub mod metadata;
pub mod oci_layout;
pub mod reference;
pub mod refs;
pub mod remote;
pub mod service;
pub mod skopeo;
pub mod snapshot;
pub mod unpack;

pub(crate) mod util;

#[cfg(any(test, feature = "test"))]
pub mod test;

pub use digest::{ChainId, Digest};
pub use error::{Error, Result};
pub use reference::{normalize, Reference};
pub use service::{ImageService, Options, PullResult, RemoveOutcome};
