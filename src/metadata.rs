//! Per-image metadata records, keyed by chain ID.
//!
//! Records are JSON files under `metadata/<hex>.json`.  A record is created
//! with a no-clobber publish and replaced atomically on update.  All
//! read-modify-write sequences on one chain ID go through a per-key lock, so
//! concurrent pulls of the same image never lose each other's tags.

use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use fn_error_context::context;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{
    digest::ChainId,
    error::{Error, Result},
    util::{KeyedLocks, NotFoundFilter},
};

/// What is known locally about one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub id: ChainId,
    /// `name:tag` references, in the order they were first pulled.
    pub repo_tags: Vec<String>,
    /// `name@digest` references.
    pub repo_digests: Vec<String>,
    /// Compressed size of the content, in bytes.
    pub size: u64,
}

fn insert_unique(list: &mut Vec<String>, value: &str) -> bool {
    if list.iter().any(|v| v == value) {
        false
    } else {
        list.push(value.to_string());
        true
    }
}

impl ImageRecord {
    pub fn new(id: ChainId, size: u64) -> Self {
        Self {
            id,
            repo_tags: vec![],
            repo_digests: vec![],
            size,
        }
    }

    /// Add a repo tag and repo digest, ignoring ones already present.
    pub fn add_references(&mut self, repo_tag: Option<&str>, repo_digest: Option<&str>) {
        if let Some(tag) = repo_tag {
            insert_unique(&mut self.repo_tags, tag);
        }
        if let Some(digest) = repo_digest {
            insert_unique(&mut self.repo_digests, digest);
        }
    }

    /// Drop a repo tag; returns whether it was present.
    pub fn remove_tag(&mut self, repo_tag: &str) -> bool {
        let before = self.repo_tags.len();
        self.repo_tags.retain(|t| t != repo_tag);
        self.repo_tags.len() != before
    }

    /// Every tag and digest referencing this image.
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.repo_tags
            .iter()
            .chain(self.repo_digests.iter())
            .map(String::as_str)
    }
}

#[derive(Debug)]
pub struct ImageMetadataStore {
    dir: PathBuf,
    locks: KeyedLocks,
}

impl ImageMetadataStore {
    #[context("Opening metadata store at {}", dir.display())]
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            locks: KeyedLocks::default(),
        })
    }

    fn path(&self, id: &ChainId) -> PathBuf {
        self.dir.join(format!("{}.json", id.hex()))
    }

    /// Run `f` holding the lock for `id`.  Blocks the calling thread.
    pub(crate) fn with_lock<T>(&self, id: &ChainId, f: impl FnOnce() -> T) -> T {
        self.locks.with_lock(id.hex(), f)
    }

    pub fn get(&self, id: &ChainId) -> Result<Option<ImageRecord>> {
        let Some(data) = fs::read(self.path(id))
            .filter_not_found()
            .with_context(|| format!("Reading metadata for {id}"))?
        else {
            return Ok(None);
        };
        let record =
            serde_json::from_slice(&data).with_context(|| format!("Parsing metadata for {id}"))?;
        Ok(Some(record))
    }

    #[context("Writing metadata for {}", record.id)]
    fn write(&self, record: &ImageRecord, clobber: bool) -> anyhow::Result<bool> {
        let mut tmp = NamedTempFile::with_prefix_in(".tmp-", &self.dir)?;
        serde_json::to_writer(&mut tmp, record)?;
        tmp.flush()?;
        let path = self.path(&record.id);
        if clobber {
            tmp.persist(path)?;
            return Ok(true);
        }
        match tmp.persist_noclobber(path) {
            Ok(_) => Ok(true),
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err.error.into()),
        }
    }

    /// Store a new record; [`Error::AlreadyExists`] if one exists for its ID.
    pub fn create(&self, record: &ImageRecord) -> Result<()> {
        if self.write(record, false)? {
            debug!("created metadata for {}", record.id);
            Ok(())
        } else {
            Err(Error::AlreadyExists(format!("image {}", record.id)))
        }
    }

    /// Atomically modify the record for `id` and return the new version.
    pub fn update(
        &self,
        id: &ChainId,
        mutate: impl FnOnce(&mut ImageRecord),
    ) -> Result<ImageRecord> {
        self.with_lock(id, || self.update_locked(id, mutate))
    }

    pub(crate) fn update_locked(
        &self,
        id: &ChainId,
        mutate: impl FnOnce(&mut ImageRecord),
    ) -> Result<ImageRecord> {
        let mut record = self
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("image {id}")))?;
        mutate(&mut record);
        record.id = id.clone();
        self.write(&record, true)?;
        Ok(record)
    }

    /// Remove the record for `id`; [`Error::NotFound`] if there is none.
    pub fn delete(&self, id: &ChainId) -> Result<()> {
        self.with_lock(id, || self.delete_locked(id))
    }

    pub(crate) fn delete_locked(&self, id: &ChainId) -> Result<()> {
        match fs::remove_file(self.path(id)) {
            Ok(()) => {
                debug!("deleted metadata for {id}");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(format!("image {id}")))
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("Deleting metadata for {id}"))
                .into()),
        }
    }

    /// All records, ordered by ID.
    pub fn list(&self) -> Result<Vec<ImageRecord>> {
        let mut records = vec![];
        let entries = fs::read_dir(&self.dir).context("Listing metadata")?;
        for entry in entries {
            let entry = entry.context("Listing metadata")?;
            let name = entry.file_name();
            let Some(hex) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            let algorithm = if hex.len() == 128 { "sha512" } else { "sha256" };
            let Ok(id) = format!("{algorithm}:{hex}").parse::<ChainId>() else {
                warn!("ignoring stray metadata file {name:?}");
                continue;
            };
            match self.get(&id) {
                Ok(Some(record)) => records.push(record),
                // raced with a delete
                Ok(None) => {}
                Err(err) => warn!("skipping unreadable metadata file {name:?}: {err}"),
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    /// Record that `id` was pulled as `repo_tag` / `repo_digest`.
    ///
    /// Creates the record on the first pull of `id`; otherwise (including when
    /// a concurrent pull created it first) appends the references.
    pub fn create_or_update(
        &self,
        id: &ChainId,
        size: u64,
        repo_tag: Option<&str>,
        repo_digest: Option<&str>,
    ) -> Result<ImageRecord> {
        self.with_lock(id, || {
            self.create_or_update_locked(id, size, repo_tag, repo_digest)
        })
    }

    pub(crate) fn create_or_update_locked(
        &self,
        id: &ChainId,
        size: u64,
        repo_tag: Option<&str>,
        repo_digest: Option<&str>,
    ) -> Result<ImageRecord> {
        let append = |record: &mut ImageRecord| record.add_references(repo_tag, repo_digest);

        if self.get(id)?.is_none() {
            let mut record = ImageRecord::new(id.clone(), size);
            append(&mut record);
            match self.create(&record) {
                Ok(()) => return Ok(record),
                Err(err) if err.is_already_exists() => {
                    debug!("metadata for {id} appeared concurrently");
                }
                Err(err) => return Err(err),
            }
        }
        self.update_locked(id, append)
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, thread};

    use similar_asserts::assert_eq;

    use super::*;
    use crate::{digest::Digest, test::tempdir};

    fn chain(name: &str) -> ChainId {
        ChainId::of(&[Digest::sha256(name.as_bytes())]).unwrap()
    }

    #[test]
    fn test_crud() {
        let tmp = tempdir();
        let store = ImageMetadataStore::open(tmp.path()).unwrap();
        let id = chain("a");

        assert_eq!(store.get(&id).unwrap(), None);
        assert!(store.update(&id, |_| {}).unwrap_err().is_not_found());
        assert!(store.delete(&id).unwrap_err().is_not_found());

        let mut record = ImageRecord::new(id.clone(), 10);
        record.add_references(Some("r/a:v1"), Some("r/a@sha256:00"));
        store.create(&record).unwrap();
        assert!(store.create(&record).unwrap_err().is_already_exists());
        assert_eq!(store.get(&id).unwrap(), Some(record.clone()));

        let updated = store
            .update(&id, |r| r.add_references(Some("r/a:v2"), None))
            .unwrap();
        assert_eq!(updated.repo_tags, vec!["r/a:v1", "r/a:v2"]);
        assert_eq!(store.list().unwrap(), vec![updated]);

        store.delete(&id).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_list_skips_unreadable() {
        let tmp = tempdir();
        let store = ImageMetadataStore::open(tmp.path()).unwrap();
        let record = ImageRecord::new(chain("a"), 1);
        store.create(&record).unwrap();

        fs::write(tmp.path().join(format!("{}.json", "0".repeat(64))), "garbage").unwrap();
        fs::create_dir(tmp.path().join(format!("{}.json", chain("b").hex()))).unwrap();
        fs::write(tmp.path().join("notes.json"), "{}").unwrap();

        assert_eq!(store.list().unwrap(), vec![record]);
        assert!(store.get(&chain("b")).is_err());
    }

    #[test]
    fn test_record_json() {
        let record = ImageRecord::new(chain("a"), 3);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["repoTags"], serde_json::json!([]));
        assert_eq!(json["id"], record.id.to_string());
    }

    #[test]
    fn test_create_or_update_dedups() {
        let tmp = tempdir();
        let store = ImageMetadataStore::open(tmp.path()).unwrap();
        let id = chain("a");

        for _ in 0..3 {
            store
                .create_or_update(&id, 10, Some("r/a:v1"), Some("r/a@d"))
                .unwrap();
        }
        let record = store
            .create_or_update(&id, 10, Some("r/a:v2"), Some("r/a@d"))
            .unwrap();
        assert_eq!(record.repo_tags, vec!["r/a:v1", "r/a:v2"]);
        assert_eq!(record.repo_digests, vec!["r/a@d"]);
    }

    #[test]
    fn test_concurrent_create_or_update() {
        let tmp = tempdir();
        let store = Arc::new(ImageMetadataStore::open(tmp.path()).unwrap());
        let id = chain("a");

        let threads: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                let id = id.clone();
                thread::spawn(move || {
                    let tag = format!("r/a:v{i}");
                    store.create_or_update(&id, 10, Some(&tag), None).unwrap();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.repo_tags.len(), 16);
    }

    #[test]
    fn test_remove_tag() {
        let mut record = ImageRecord::new(chain("a"), 0);
        record.add_references(Some("r/a:v1"), Some("r/a@d"));
        record.add_references(Some("r/a:v2"), None);
        assert!(record.remove_tag("r/a:v1"));
        assert!(!record.remove_tag("r/a:v1"));
        assert_eq!(record.references().collect::<Vec<_>>(), vec!["r/a:v2", "r/a@d"]);
    }
}
