//! Resolving and fetching from an OCI image layout directory.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, trace};
use oci_spec::image::{ImageIndex, ANNOTATION_REF_NAME};

use crate::{
    manifest::ContentDescriptor,
    reference::{Reference, Target},
    remote::{Fetcher, Resolved, Resolver},
};

/// A [`Resolver`] over an [OCI image layout] on the local filesystem.
///
/// Tags are looked up through the `org.opencontainers.image.ref.name`
/// annotation of the entries in `index.json`, which may hold either a bare tag
/// or a full reference.  Digest references name an `index.json` entry.
///
/// [OCI image layout]: https://github.com/opencontainers/image-spec/blob/main/image-layout.md
#[derive(Debug, Clone)]
pub struct OciLayoutResolver {
    dir: PathBuf,
}

impl OciLayoutResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn index(&self) -> Result<ImageIndex> {
        let path = self.dir.join("index.json");
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Reading {}", path.display()))?;
        ImageIndex::from_reader(&data[..]).with_context(|| format!("Parsing {}", path.display()))
    }
}

fn ref_name_matches(name: &str, reference: &Reference) -> bool {
    match reference.target() {
        Target::Tag(tag) => {
            name == tag.as_str()
                || Some(name) == reference.repo_tag().as_deref()
                || name == reference.to_string()
        }
        Target::Digest(_) => false,
    }
}

impl Resolver for OciLayoutResolver {
    type Fetcher = OciLayoutFetcher;

    async fn resolve(&self, reference: &Reference) -> Result<Resolved<OciLayoutFetcher>> {
        let index = self.index().await?;

        let mut found = None;
        for entry in index.manifests() {
            let name = entry
                .annotations()
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_REF_NAME));
            let matched = match reference.target() {
                Target::Digest(digest) => entry.digest().to_string() == digest.to_string(),
                Target::Tag(_) => name.is_some_and(|n| ref_name_matches(n, reference)),
            };
            if matched {
                trace!("{reference} matched {}", entry.digest());
                found = Some(ContentDescriptor::from_oci(entry)?);
                break;
            }
        }
        let Some(descriptor) = found else {
            bail!("{reference} not found in {}", self.dir.display());
        };
        debug!("resolved {reference} to {}", descriptor.digest);

        Ok(Resolved {
            name: format!("oci:{}:{reference}", self.dir.display()),
            descriptor,
            remote_digest: None,
            fetcher: OciLayoutFetcher {
                dir: self.dir.clone(),
            },
        })
    }
}

/// Reads blobs from `blobs/<alg>/<hex>` of a layout.
#[derive(Debug)]
pub struct OciLayoutFetcher {
    dir: PathBuf,
}

impl Fetcher for OciLayoutFetcher {
    async fn fetch(&self, desc: &ContentDescriptor) -> Result<Vec<u8>> {
        let path = self
            .dir
            .join("blobs")
            .join(desc.digest.algorithm().id())
            .join(desc.digest.hex());
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Reading {}", path.display()))
    }
}
