//! Remote content sources.
//!
//! A [`Resolver`] turns a normalized [`Reference`] into the descriptor of the
//! content it names plus a [`Fetcher`] that can deliver the bytes of that
//! descriptor and of everything reachable from it.  Resolvers never write to
//! local storage.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{bail, Result};
use log::trace;
use serde_json::json;

use crate::{
    digest::Digest,
    manifest::{ContentDescriptor, Platform},
    reference::{Reference, Target},
};

/// Delivers the bytes of content descriptors.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, desc: &ContentDescriptor) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// The outcome of resolving a reference.
#[derive(Debug)]
pub struct Resolved<F> {
    /// The name the content was resolved as.
    pub name: String,
    /// The root of the content graph.
    pub descriptor: ContentDescriptor,
    /// The digest the source itself knows the root by, when the source hands
    /// out converted content (and `descriptor` therefore differs).
    pub remote_digest: Option<Digest>,
    pub fetcher: F,
}

/// Looks up references at a remote source.
pub trait Resolver: Send + Sync {
    type Fetcher: Fetcher + 'static;

    fn resolve(
        &self,
        reference: &Reference,
    ) -> impl Future<Output = Result<Resolved<Self::Fetcher>>> + Send;
}

#[derive(Debug, Default)]
struct RegistryState {
    blobs: HashMap<Digest, (String, Vec<u8>)>,
    tags: HashMap<String, ContentDescriptor>,
    remote_digests: HashMap<String, Digest>,
    failing: HashSet<Digest>,
    stalled: HashSet<Digest>,
    corrupted: HashMap<Digest, Vec<u8>>,
    fetches: HashMap<Digest, usize>,
}

/// An in-process content source.
///
/// Useful for seeding a store from content built locally and for exercising
/// the pull pipeline.  Clones share the same state.  Fetches are counted per
/// digest, and individual blobs can be made to fail, to hang or to return
/// wrong bytes.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a blob and return its descriptor.
    pub fn add_blob(&self, media_type: &str, data: impl Into<Vec<u8>>) -> ContentDescriptor {
        let data = data.into();
        let desc = ContentDescriptor::for_bytes(media_type, &data);
        self.state()
            .blobs
            .insert(desc.digest.clone(), (media_type.to_string(), data));
        desc
    }

    fn add_json(&self, media_type: &str, value: &serde_json::Value) -> ContentDescriptor {
        self.add_blob(media_type, value.to_string())
    }

    /// Point `reference` at `desc`.
    pub fn tag(&self, reference: &Reference, desc: &ContentDescriptor) {
        self.state().tags.insert(reference.to_string(), desc.clone());
    }

    /// Report `digest` as the source's own digest of what `reference`
    /// resolves to, like a registry whose manifests get converted on the way.
    pub fn report_digest(&self, reference: &Reference, digest: &Digest) {
        self.state()
            .remote_digests
            .insert(reference.to_string(), digest.clone());
    }

    /// Add an image config and manifest over `layers`, which must already
    /// have been added, and tag the manifest as `reference`.
    pub fn push_image(
        &self,
        reference: &Reference,
        layers: &[ContentDescriptor],
    ) -> ContentDescriptor {
        let manifest = self.add_manifest(layers, &Platform::host());
        self.tag(reference, &manifest);
        manifest
    }

    /// Add an OCI image config and manifest over `layers` without tagging it.
    pub fn add_manifest(
        &self,
        layers: &[ContentDescriptor],
        platform: &Platform,
    ) -> ContentDescriptor {
        let diff_ids: Vec<String> = layers.iter().map(|l| l.digest.to_string()).collect();
        let config = self.add_json(
            "application/vnd.oci.image.config.v1+json",
            &json!({
                "architecture": platform.architecture,
                "os": platform.os,
                "config": {},
                "rootfs": { "type": "layers", "diff_ids": diff_ids },
            }),
        );
        self.add_json(
            "application/vnd.oci.image.manifest.v1+json",
            &json!({
                "schemaVersion": 2,
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "config": config,
                "layers": layers,
            }),
        )
    }

    /// Add an index over per-platform manifests and tag it as `reference`.
    pub fn push_index(
        &self,
        reference: &Reference,
        manifests: &[(ContentDescriptor, Platform)],
    ) -> ContentDescriptor {
        let entries: Vec<_> = manifests
            .iter()
            .map(|(desc, platform)| {
                let mut entry = json!(desc);
                entry["platform"] = json!({
                    "os": platform.os,
                    "architecture": platform.architecture,
                });
                if let Some(variant) = &platform.variant {
                    entry["platform"]["variant"] = json!(variant);
                }
                entry
            })
            .collect();
        let index = self.add_json(
            "application/vnd.oci.image.index.v1+json",
            &json!({
                "schemaVersion": 2,
                "mediaType": "application/vnd.oci.image.index.v1+json",
                "manifests": entries,
            }),
        );
        self.tag(reference, &index);
        index
    }

    /// Make every fetch of `digest` fail.
    pub fn fail_fetch(&self, digest: &Digest) {
        self.state().failing.insert(digest.clone());
    }

    /// Make every fetch of `digest` wait until [`Self::heal`].
    pub fn stall(&self, digest: &Digest) {
        self.state().stalled.insert(digest.clone());
    }

    /// Serve `data` instead of the real bytes of `digest`.
    pub fn corrupt(&self, digest: &Digest, data: impl Into<Vec<u8>>) {
        self.state().corrupted.insert(digest.clone(), data.into());
    }

    /// Undo [`Self::fail_fetch`], [`Self::stall`] and [`Self::corrupt`].
    ///
    /// Fetches already stalled stay stalled.
    pub fn heal(&self, digest: &Digest) {
        let mut state = self.state();
        state.failing.remove(digest);
        state.stalled.remove(digest);
        state.corrupted.remove(digest);
    }

    /// How often `digest` has been fetched.
    pub fn fetch_count(&self, digest: &Digest) -> usize {
        self.state().fetches.get(digest).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.state().fetches.values().sum()
    }
}

impl Fetcher for MemoryRegistry {
    async fn fetch(&self, desc: &ContentDescriptor) -> Result<Vec<u8>> {
        let stalled = {
            let mut state = self.state();
            *state.fetches.entry(desc.digest.clone()).or_default() += 1;
            state.stalled.contains(&desc.digest)
        };
        trace!("memory fetch {}", desc.digest);
        if stalled {
            std::future::pending::<()>().await;
        }

        let state = self.state();
        if state.failing.contains(&desc.digest) {
            bail!("Injected failure fetching {}", desc.digest);
        }
        if let Some(data) = state.corrupted.get(&desc.digest) {
            return Ok(data.clone());
        }
        match state.blobs.get(&desc.digest) {
            Some((_, data)) => Ok(data.clone()),
            None => bail!("Blob {} not found", desc.digest),
        }
    }
}

impl Resolver for MemoryRegistry {
    type Fetcher = MemoryRegistry;

    async fn resolve(&self, reference: &Reference) -> Result<Resolved<Self::Fetcher>> {
        let (descriptor, remote_digest) = {
            let state = self.state();
            let descriptor = match reference.target() {
                Target::Tag(_) => state.tags.get(&reference.to_string()).cloned(),
                Target::Digest(digest) => state.blobs.get(digest).map(|(media_type, data)| {
                    ContentDescriptor::for_bytes(media_type.as_str(), data)
                }),
            };
            let remote_digest = state.remote_digests.get(&reference.to_string()).cloned();
            (descriptor, remote_digest)
        };
        let Some(descriptor) = descriptor else {
            bail!("{reference} not found");
        };

        Ok(Resolved {
            name: reference.to_string(),
            descriptor,
            remote_digest,
            fetcher: self.clone(),
        })
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::reference::normalize;

    #[tokio::test]
    async fn test_memory_registry() {
        let registry = MemoryRegistry::new();
        let layer = registry.add_blob("application/vnd.oci.image.layer.v1.tar", b"layer".to_vec());
        let reference = normalize("registry.example/app:v1").unwrap();
        let manifest = registry.push_image(&reference, &[layer.clone()]);

        let resolved = registry.resolve(&reference).await.unwrap();
        assert_eq!(resolved.name, "registry.example/app:v1");
        assert_eq!(resolved.descriptor, manifest);

        let by_digest = normalize(&format!("registry.example/app@{}", manifest.digest)).unwrap();
        assert_eq!(registry.resolve(&by_digest).await.unwrap().descriptor, manifest);

        assert!(registry
            .resolve(&normalize("registry.example/app:v2").unwrap())
            .await
            .is_err());

        assert_eq!(resolved.fetcher.fetch(&layer).await.unwrap(), b"layer");
        assert_eq!(registry.fetch_count(&layer.digest), 1);

        registry.fail_fetch(&layer.digest);
        assert!(registry.fetch(&layer).await.is_err());
        registry.heal(&layer.digest);
        assert!(registry.fetch(&layer).await.is_ok());
        assert_eq!(registry.fetch_count(&layer.digest), 3);
        assert_eq!(registry.total_fetches(), 3);
        assert_eq!(resolved.remote_digest, None);

        let converted = Digest::sha256(b"as the registry has it");
        registry.report_digest(&reference, &converted);
        let resolved = registry.resolve(&reference).await.unwrap();
        assert_eq!(resolved.descriptor, manifest);
        assert_eq!(resolved.remote_digest, Some(converted));
    }

    #[tokio::test]
    async fn test_stalled_fetch() {
        let registry = MemoryRegistry::new();
        let layer = registry.add_blob("application/vnd.oci.image.layer.v1.tar", b"layer".to_vec());
        registry.stall(&layer.digest);

        let fetch = registry.fetch(&layer);
        tokio::pin!(fetch);
        tokio::select! {
            biased;
            _ = &mut fetch => panic!("stalled fetch completed"),
            _ = tokio::task::yield_now() => {}
        }
        assert_eq!(registry.fetch_count(&layer.digest), 1);

        registry.heal(&layer.digest);
        assert_eq!(registry.fetch(&layer).await.unwrap(), b"layer");
    }
}
