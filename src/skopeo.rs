//! Resolving and fetching from container registries through skopeo.

use std::process::Command;

use anyhow::{Context, Result};
use containers_image_proxy::{ImageProxy, ImageProxyConfig, OpenedImage};
use log::{debug, warn};
use oci_spec::image::MediaType;
use tokio::io::AsyncReadExt;

use crate::{
    digest::Digest,
    manifest::ContentDescriptor,
    reference::Reference,
    remote::{Fetcher, Resolved, Resolver},
};

/// A [`Resolver`] for `docker://` references, backed by `skopeo
/// experimental-image-proxy`.
///
/// Skopeo picks the manifest for the host platform from multi-platform
/// images and converts it to OCI form, so the root of every resolved graph is
/// an OCI image manifest.
#[derive(Debug, Clone, Default)]
pub struct SkopeoResolver {
    /// Ask skopeo to skip TLS verification.
    pub insecure: bool,
    /// Run skopeo through `podman unshare`.
    pub unshare: bool,
}

impl SkopeoResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn config(&self) -> ImageProxyConfig {
        let skopeo_cmd = self.unshare.then(|| {
            let mut cmd = Command::new("podman");
            cmd.args(["unshare", "skopeo"]);
            cmd
        });
        ImageProxyConfig {
            skopeo_cmd,
            insecure_skip_tls_verification: self.insecure.then_some(true),
            ..ImageProxyConfig::default()
        }
    }
}

/// Fetches the blobs of one opened image.
#[derive(Debug)]
pub struct SkopeoFetcher {
    proxy: ImageProxy,
    img: OpenedImage,
    manifest: ContentDescriptor,
    raw_manifest: Vec<u8>,
}

impl Resolver for SkopeoResolver {
    type Fetcher = SkopeoFetcher;

    async fn resolve(&self, reference: &Reference) -> Result<Resolved<SkopeoFetcher>> {
        let imgref = format!("docker://{reference}");
        let proxy = ImageProxy::new_with_config(self.config()).await?;
        let img = proxy
            .open_image(&imgref)
            .await
            .with_context(|| format!("Opening {imgref}"))?;
        let (remote_digest, raw_manifest) = proxy
            .fetch_manifest_raw_oci(&img)
            .await
            .context("Fetching manifest")?;

        // the manifest may have been converted; address it by what we got
        let manifest =
            ContentDescriptor::for_bytes(MediaType::ImageManifest.to_string(), &raw_manifest);
        debug!(
            "{imgref}: remote digest {remote_digest}, local manifest {}",
            manifest.digest
        );
        let remote_digest = match remote_digest.parse::<Digest>() {
            Ok(digest) => Some(digest),
            Err(err) => {
                warn!("{imgref}: ignoring remote digest {remote_digest}: {err}");
                None
            }
        };

        Ok(Resolved {
            name: imgref,
            descriptor: manifest.clone(),
            remote_digest,
            fetcher: SkopeoFetcher {
                proxy,
                img,
                manifest,
                raw_manifest,
            },
        })
    }
}

impl Fetcher for SkopeoFetcher {
    async fn fetch(&self, desc: &ContentDescriptor) -> Result<Vec<u8>> {
        if desc.digest == self.manifest.digest {
            return Ok(self.raw_manifest.clone());
        }

        let descriptor = desc.to_oci()?;
        let (reader, driver) = self
            .proxy
            .get_descriptor(&self.img, &descriptor)
            .await
            .with_context(|| format!("Requesting {}", desc.digest))?;

        // See https://github.com/containers/containers-image-proxy-rs/issues/71
        let mut reader = reader.take(desc.size);
        let read = async move {
            let mut data = Vec::with_capacity(desc.size as usize);
            reader.read_to_end(&mut data).await?;
            anyhow::Ok(data)
        };
        let (data, driver) = tokio::join!(read, driver);
        let _: () = driver?;
        data.with_context(|| format!("Reading {}", desc.digest))
    }
}
