//! Content graph nodes: descriptors, media types and manifest parsing.
//!
//! Only media types on an explicit allow-list are accepted.  OCI types are
//! matched through [`oci_spec::image::MediaType`]; the Docker schema2 types
//! share the OCI JSON shapes and are matched by name.

use core::{fmt, str::FromStr};

use anyhow::Context;
use oci_spec::image::{Arch, Descriptor, ImageIndex, ImageManifest, MediaType, Os};
use serde::{Deserialize, Serialize};

use crate::{
    digest::Digest,
    error::{Error, Result},
};

pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const DOCKER_FOREIGN_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

/// How a layer blob is compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

/// The role of a node in the content graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Index,
    Manifest,
    Config,
    Layer(Compression),
}

impl NodeKind {
    /// Classify a media type, or `None` if it isn't on the allow-list.
    pub fn classify(media_type: &str) -> Option<Self> {
        let kind = match MediaType::from(media_type) {
            MediaType::ImageIndex => Self::Index,
            MediaType::ImageManifest => Self::Manifest,
            MediaType::ImageConfig => Self::Config,
            MediaType::ImageLayer | MediaType::ImageLayerNonDistributable => {
                Self::Layer(Compression::None)
            }
            MediaType::ImageLayerGzip | MediaType::ImageLayerNonDistributableGzip => {
                Self::Layer(Compression::Gzip)
            }
            MediaType::ImageLayerZstd | MediaType::ImageLayerNonDistributableZstd => {
                Self::Layer(Compression::Zstd)
            }
            MediaType::Other(other) => match other.as_str() {
                DOCKER_MANIFEST_LIST => Self::Index,
                DOCKER_MANIFEST => Self::Manifest,
                DOCKER_CONFIG => Self::Config,
                DOCKER_LAYER_GZIP | DOCKER_FOREIGN_LAYER_GZIP => Self::Layer(Compression::Gzip),
                _ => return None,
            },
            _ => return None,
        };
        Some(kind)
    }

    /// Indexes and manifests reference further content.
    pub fn has_children(self) -> bool {
        matches!(self, Self::Index | Self::Manifest)
    }
}

/// A typed pointer to a blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentDescriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
}

impl ContentDescriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
        }
    }

    /// Describe `data` under the given media type.
    pub fn for_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self::new(media_type, Digest::sha256(data), data.len() as u64)
    }

    /// Convert an OCI descriptor, validating its digest.
    pub fn from_oci(desc: &Descriptor) -> anyhow::Result<Self> {
        let digest = desc
            .digest()
            .to_string()
            .parse()
            .with_context(|| format!("Parsing descriptor digest {}", desc.digest()))?;
        Ok(Self::new(desc.media_type().to_string(), digest, desc.size()))
    }

    /// Convert into an OCI descriptor, for APIs that speak oci-spec types.
    pub fn to_oci(&self) -> anyhow::Result<Descriptor> {
        let value = serde_json::to_value(self)?;
        serde_json::from_value(value).context("Converting descriptor")
    }

    /// Classify this descriptor's media type, failing for anything not on the
    /// allow-list.
    pub fn kind(&self) -> Result<NodeKind> {
        NodeKind::classify(&self.media_type).ok_or_else(|| Error::UnsupportedMediaType {
            digest: self.digest.clone(),
            media_type: self.media_type.clone(),
        })
    }
}

/// An operating system and CPU architecture pair, as named by OCI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Platform {
    /// The platform this process runs on.
    pub fn host() -> Self {
        Self {
            os: Os::default().to_string(),
            architecture: Arch::default().to_string(),
            variant: None,
        }
    }

    /// Whether an index entry with the given platform applies here.
    ///
    /// Entries without a platform always apply.  A variant is only compared
    /// when both sides name one.
    pub fn matches(&self, other: Option<&oci_spec::image::Platform>) -> bool {
        let Some(other) = other else {
            return true;
        };
        if other.os().to_string() != self.os
            || other.architecture().to_string() != self.architecture
        {
            return false;
        }
        match (&self.variant, other.variant()) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::host()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(os), Some(architecture), variant, None)
                if !os.is_empty() && !architecture.is_empty() =>
            {
                Ok(Self {
                    os: os.to_string(),
                    architecture: architecture.to_string(),
                    variant: variant.filter(|v| !v.is_empty()).map(str::to_string),
                })
            }
            _ => anyhow::bail!("Invalid platform {s:?}, expected os/arch[/variant]"),
        }
    }
}

fn malformed(digest: &Digest, err: impl Into<anyhow::Error>) -> Error {
    let err: anyhow::Error = err.into();
    Error::Malformed {
        digest: digest.clone(),
        source: err.into(),
    }
}

/// Parse a manifest blob.
pub fn parse_manifest(desc: &ContentDescriptor, data: &[u8]) -> Result<ImageManifest> {
    ImageManifest::from_reader(data).map_err(|e| malformed(&desc.digest, e))
}

/// Parse an index or manifest list blob.
pub fn parse_index(desc: &ContentDescriptor, data: &[u8]) -> Result<ImageIndex> {
    ImageIndex::from_reader(data).map_err(|e| malformed(&desc.digest, e))
}

/// The ordered layer descriptors of a manifest.
pub fn manifest_layers(
    desc: &ContentDescriptor,
    manifest: &ImageManifest,
) -> Result<Vec<ContentDescriptor>> {
    manifest
        .layers()
        .iter()
        .map(|layer| ContentDescriptor::from_oci(layer).map_err(|e| malformed(&desc.digest, e)))
        .collect()
}

/// The config descriptor of a manifest.
pub fn manifest_config(
    desc: &ContentDescriptor,
    manifest: &ImageManifest,
) -> Result<ContentDescriptor> {
    ContentDescriptor::from_oci(manifest.config()).map_err(|e| malformed(&desc.digest, e))
}

/// The index entries that apply to `platform`, in index order.
pub fn index_manifests(
    desc: &ContentDescriptor,
    index: &ImageIndex,
    platform: &Platform,
) -> Result<Vec<ContentDescriptor>> {
    index
        .manifests()
        .iter()
        .filter(|entry| platform.matches(entry.platform().as_ref()))
        .map(|entry| ContentDescriptor::from_oci(entry).map_err(|e| malformed(&desc.digest, e)))
        .collect()
}

/// The children of a content node that a pull must fetch.
///
/// Manifests yield their config followed by their layers; indexes yield the
/// entries matching `platform`.  Leaves have no children.
pub fn children(
    desc: &ContentDescriptor,
    kind: NodeKind,
    data: &[u8],
    platform: &Platform,
) -> Result<Vec<ContentDescriptor>> {
    match kind {
        NodeKind::Manifest => {
            let manifest = parse_manifest(desc, data)?;
            let mut children = vec![manifest_config(desc, &manifest)?];
            children.extend(manifest_layers(desc, &manifest)?);
            Ok(children)
        }
        NodeKind::Index => {
            let index = parse_index(desc, data)?;
            index_manifests(desc, &index, platform)
        }
        NodeKind::Config | NodeKind::Layer(_) => Ok(vec![]),
    }
}
