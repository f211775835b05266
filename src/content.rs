//! The content-addressed blob store.
//!
//! Blobs live at `blobs/<algorithm>/<hex>` and are published with a no-clobber
//! link of a fully written temporary file, so a blob is either absent or
//! complete.  Published blobs are never modified; the store never deletes
//! anything either, that is left to the garbage collector.

use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use fn_error_context::context;
use log::trace;
use tempfile::NamedTempFile;

use crate::{
    digest::Digest,
    error::{Error, Result},
    util::NotFoundFilter,
};

#[derive(Debug)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open (creating if needed) a blob store rooted at `root`.
    #[context("Opening content store at {}", root.display())]
    pub fn open(root: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join(digest.algorithm().id())
            .join(digest.hex())
    }

    pub fn has(&self, digest: &Digest) -> bool {
        self.path(digest).is_file()
    }

    /// The stored size of a blob, if present.
    pub fn size(&self, digest: &Digest) -> Result<Option<u64>> {
        let meta = fs::metadata(self.path(digest))
            .filter_not_found()
            .with_context(|| format!("Checking blob {digest}"))?;
        Ok(meta.map(|m| m.len()))
    }

    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        fs::read(self.path(digest))
            .filter_not_found()
            .with_context(|| format!("Reading blob {digest}"))?
            .ok_or_else(|| Error::NotFound(format!("blob {digest}")))
    }

    /// Store `data` under `digest`.
    ///
    /// Returns `true` if this call published the blob and `false` if it was
    /// already present.  Fails with [`Error::DigestMismatch`] if `data` (or
    /// the blob already on disk) doesn't hash to `digest`.
    pub fn put(&self, digest: &Digest, data: &[u8]) -> Result<bool> {
        digest.verify(data)?;

        if self.has(digest) {
            // the existing copy has to be intact too
            let existing = self.get(digest)?;
            digest.verify(&existing)?;
            trace!("blob {digest} already present");
            return Ok(false);
        }

        let written = self.publish(digest, data)?;
        if written {
            trace!("stored blob {digest} ({} bytes)", data.len());
        }
        Ok(written)
    }

    #[context("Publishing blob {}", digest)]
    fn publish(&self, digest: &Digest, data: &[u8]) -> anyhow::Result<bool> {
        let dir = self.root.join(digest.algorithm().id());
        fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::with_prefix_in(".tmp-", &dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_data()?;

        match tmp.persist_noclobber(self.path(digest)) {
            Ok(_) => Ok(true),
            // another writer published the same bytes first
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err.error.into()),
        }
    }

    /// [`Self::put`] on the blocking thread pool.
    pub async fn put_async(self: &Arc<Self>, digest: Digest, data: Vec<u8>) -> Result<bool> {
        let self_ = Arc::clone(self);
        tokio::task::spawn_blocking(move || self_.put(&digest, &data))
            .await
            .context("Joining blob writer")?
    }

    /// Open a blob for streaming reads.
    pub async fn open_async(&self, digest: &Digest) -> Result<tokio::fs::File> {
        tokio::fs::File::open(self.path(digest))
            .await
            .filter_not_found()
            .with_context(|| format!("Opening blob {digest}"))?
            .ok_or_else(|| Error::NotFound(format!("blob {digest}")))
    }

    /// [`Self::get`] on the blocking thread pool.
    pub async fn get_async(self: &Arc<Self>, digest: Digest) -> Result<Vec<u8>> {
        let self_ = Arc::clone(self);
        tokio::task::spawn_blocking(move || self_.get(&digest))
            .await
            .context("Joining blob reader")?
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::tempdir;

    #[test]
    fn test_put_get() {
        let tmp = tempdir();
        let store = ContentStore::open(&tmp.path().join("blobs")).unwrap();
        let digest = Digest::sha256(b"hello");

        assert!(!store.has(&digest));
        assert!(store.get(&digest).unwrap_err().is_not_found());
        assert_eq!(store.size(&digest).unwrap(), None);

        assert!(store.put(&digest, b"hello").unwrap());
        assert!(store.has(&digest));
        assert_eq!(store.get(&digest).unwrap(), b"hello");
        assert_eq!(store.size(&digest).unwrap(), Some(5));
        assert!(tmp
            .path()
            .join("blobs/sha256")
            .join(digest.hex())
            .is_file());

        // second put is a no-op
        assert!(!store.put(&digest, b"hello").unwrap());
    }

    #[test]
    fn test_put_mismatch() {
        let tmp = tempdir();
        let store = ContentStore::open(tmp.path()).unwrap();
        let digest = Digest::sha256(b"hello");

        assert!(matches!(
            store.put(&digest, b"tampered"),
            Err(Error::DigestMismatch { .. })
        ));
        assert!(!store.has(&digest));
    }

    #[test]
    fn test_corrupt_existing_blob() {
        let tmp = tempdir();
        let store = ContentStore::open(tmp.path()).unwrap();
        let digest = Digest::sha256(b"hello");
        store.put(&digest, b"hello").unwrap();

        let path = tmp.path().join("sha256").join(digest.hex());
        fs::write(&path, b"bitrot").unwrap();

        assert!(matches!(
            store.put(&digest, b"hello"),
            Err(Error::DigestMismatch { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_put() {
        let tmp = tempdir();
        let store = Arc::new(ContentStore::open(tmp.path()).unwrap());
        let data = vec![7u8; 64 * 1024];
        let digest = Digest::sha256(&data);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let (digest, data) = (digest.clone(), data.clone());
            tasks.spawn(async move { store.put_async(digest, data).await });
        }
        let mut published = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap().unwrap() {
                published += 1;
            }
        }

        assert_eq!(published, 1);
        assert_eq!(store.get_async(digest).await.unwrap(), data);
    }
}
