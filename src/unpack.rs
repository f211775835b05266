//! Turning an ordered layer list into a committed snapshot.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use log::{debug, trace};
use tokio::io::{AsyncRead, BufReader};
use tokio_util::io::SyncIoBridge;

use crate::{
    content::ContentStore,
    digest::{ChainId, Digest},
    error::{Error, Result},
    manifest::{Compression, ContentDescriptor, NodeKind},
    snapshot::Snapshotter,
    util::KeyedLocks,
};

/// Wrap a layer blob in the decoder for its compression, yielding the tar
/// changeset.
fn decoder(
    blob: tokio::fs::File,
    compression: Compression,
) -> Box<dyn AsyncRead + Unpin + Send> {
    let buf = BufReader::new(blob);
    match compression {
        Compression::None => Box::new(buf),
        Compression::Gzip => Box::new(GzipDecoder::new(buf)),
        Compression::Zstd => Box::new(ZstdDecoder::new(buf)),
    }
}

fn unpack_error(digest: &Digest, err: anyhow::Error) -> Error {
    Error::Unpack {
        digest: digest.clone(),
        source: err.into(),
    }
}

/// Applies layers from the [`ContentStore`] through a [`Snapshotter`].
///
/// Work on one chain ID is serialized; a second unpack of the same chain
/// waits for the first and then finds the snapshot present.
#[derive(Debug)]
pub struct Unpacker<S> {
    content: Arc<ContentStore>,
    snapshotter: Arc<S>,
    locks: Arc<KeyedLocks>,
}

impl<S: Snapshotter> Unpacker<S> {
    pub fn new(content: Arc<ContentStore>, snapshotter: Arc<S>) -> Self {
        Self {
            content,
            snapshotter,
            locks: Arc::default(),
        }
    }

    pub fn snapshotter(&self) -> &Arc<S> {
        &self.snapshotter
    }

    /// Materialize `layers` (bottom first) and return their chain ID.
    ///
    /// All layer blobs must already be in the content store.  Prefix chains
    /// that already have a snapshot are reused.
    pub async fn unpack(&self, layers: &[ContentDescriptor]) -> Result<ChainId> {
        let digests: Vec<Digest> = layers.iter().map(|l| l.digest.clone()).collect();
        let chain = ChainId::for_prefixes(&digests);
        let Some(top) = chain.last().cloned() else {
            return Err(anyhow!("Image has no layers").into());
        };

        if self.snapshotter.exists(&top)? {
            debug!("snapshot {top} already present");
            return Ok(top);
        }

        for (idx, layer) in layers.iter().enumerate() {
            let id = chain[idx].clone();
            if self.snapshotter.exists(&id)? {
                trace!("reusing snapshot {id}");
                continue;
            }
            let parent = idx.checked_sub(1).map(|p| chain[p].clone());

            let NodeKind::Layer(compression) = layer.kind()? else {
                return Err(Error::UnsupportedMediaType {
                    digest: layer.digest.clone(),
                    media_type: layer.media_type.clone(),
                });
            };
            let blob = self.content.open_async(&layer.digest).await?;
            // decoded on the blocking thread as the snapshotter reads it
            let mut changeset = SyncIoBridge::new(decoder(blob, compression));

            debug!("applying layer {} as {id}", layer.digest);
            let snapshotter = Arc::clone(&self.snapshotter);
            let locks = Arc::clone(&self.locks);
            let key = id.to_string();
            tokio::task::spawn_blocking(move || {
                locks.with_lock(&key, || {
                    if snapshotter.exists(&id)? {
                        return Ok(());
                    }
                    snapshotter.apply(&id, parent.as_ref(), &mut changeset)
                })
            })
            .await
            .context("Joining layer unpack")?
            .map_err(|e| unpack_error(&layer.digest, e))?;
        }

        Ok(top)
    }
}
