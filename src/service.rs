//! The image service: pulling images into the local stores and removing them
//! again.
//!
//! A repository directory holds every store:
//!
//! ```text
//! blobs/<alg>/<hex>          content, by digest
//! refs/<sha256 of name>      repo tag / repo digest -> root descriptor
//! snapshots/<alg>/<hex>/     unpacked filesystems, by chain ID
//! metadata/<hex>.json        image records, by chain ID
//! ```
//!
//! The service holds a shared `flock()` on the repository while open.  An
//! external garbage collector takes the exclusive lock to reclaim blobs and
//! snapshots that no ref or record reaches.
//!
//! Locks are taken in a fixed order: repo tag locks (sorted), then the image
//! record lock.  Anything that writes or deletes a tag ref, or moves a tag
//! between records, holds that tag's lock.

use std::{
    fs,
    os::fd::OwnedFd,
    path::Path,
    sync::Arc,
    thread::available_parallelism,
};

use anyhow::Context;
use fn_error_context::context;
use log::{debug, info, warn};
use oci_spec::image::{ImageConfiguration, ImageManifest};
use rustix::fs::{flock, open, FlockOperation, Mode, OFlags};

use crate::{
    content::ContentStore,
    digest::ChainId,
    dispatch::{fetch_graph, FetchStats},
    error::{Error, Result},
    manifest::{self, ContentDescriptor, NodeKind, Platform},
    metadata::{ImageMetadataStore, ImageRecord},
    reference::{normalize, Reference, Target},
    refs::RefStore,
    remote::Resolver,
    snapshot::{DirSnapshotter, Snapshotter},
    unpack::Unpacker,
    util::KeyedLocks,
};

/// Shortest bare hex string accepted as an image ID prefix.
const MIN_ID_PREFIX: usize = 12;

/// Tunables for an [`ImageService`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Upper bound on blobs fetched at the same time within one pull.
    pub max_concurrent_fetches: usize,
    /// Which manifest to pick from multi-platform images.
    pub platform: Platform,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: available_parallelism().map(|n| n.get()).unwrap_or(4),
            platform: Platform::host(),
        }
    }
}

/// The outcome of a successful pull.
#[derive(Debug, Clone)]
pub struct PullResult {
    /// The local image ID (the chain ID of its layers).
    pub image_ref: ChainId,
    /// The image record after the pull.
    pub record: ImageRecord,
    /// The root descriptor the reference resolved to.
    pub descriptor: ContentDescriptor,
    pub stats: FetchStats,
}

/// The outcome of a removal.  All variants are successes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Nothing matched the reference.
    NotFound,
    /// Only the given tag was dropped; the image keeps its other tags.
    Untagged { id: ChainId, record: ImageRecord },
    /// The image record and all its references are gone.
    Deleted { id: ChainId },
}

/// An image manifest selected from the content store, with what it took to
/// reach it.
struct SelectedManifest {
    descriptor: ContentDescriptor,
    manifest: ImageManifest,
    /// Sizes of the root and any index levels above the manifest.
    path_size: u64,
}

/// A record found by local resolution, and the reference that found it if
/// it was found by name.
struct LocalMatch {
    record: ImageRecord,
    reference: Option<Reference>,
}

/// Pulls, lists and removes images in one repository.
#[derive(Debug)]
pub struct ImageService<R, S = DirSnapshotter> {
    repository: OwnedFd,
    content: Arc<ContentStore>,
    refs: Arc<RefStore>,
    metadata: Arc<ImageMetadataStore>,
    tags: Arc<KeyedLocks>,
    unpacker: Unpacker<S>,
    resolver: R,
    options: Options,
}

impl<R, S> Drop for ImageService<R, S> {
    fn drop(&mut self) {
        if let Err(err) = flock(&self.repository, FlockOperation::Unlock) {
            warn!("unlocking repository: {err}");
        }
    }
}

#[context("Locking repository at {}", path.display())]
fn lock_repository(path: &Path) -> anyhow::Result<OwnedFd> {
    fs::create_dir_all(path)?;
    // O_PATH isn't enough for flock()
    let repository = open(
        path,
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
        Mode::empty(),
    )?;
    flock(&repository, FlockOperation::LockShared)?;
    Ok(repository)
}

impl<R: Resolver> ImageService<R> {
    /// Open (creating if needed) the repository at `path`, snapshotting to
    /// plain directories.
    pub fn open_path(path: impl AsRef<Path>, resolver: R) -> Result<Self> {
        Self::open_path_with_options(path, resolver, Options::default())
    }

    pub fn open_path_with_options(
        path: impl AsRef<Path>,
        resolver: R,
        options: Options,
    ) -> Result<Self> {
        let path = path.as_ref();
        let snapshotter = DirSnapshotter::open(&path.join("snapshots"))?;
        Self::with_snapshotter(path, resolver, snapshotter, options)
    }
}

impl<R: Resolver, S: Snapshotter> ImageService<R, S> {
    /// Open the repository at `path` with a custom snapshotter.
    pub fn with_snapshotter(
        path: impl AsRef<Path>,
        resolver: R,
        snapshotter: S,
        options: Options,
    ) -> Result<Self> {
        let path = path.as_ref();
        let repository = lock_repository(path)?;
        let content = Arc::new(ContentStore::open(&path.join("blobs"))?);
        let refs = Arc::new(RefStore::open(&path.join("refs"))?);
        let metadata = Arc::new(ImageMetadataStore::open(&path.join("metadata"))?);
        let unpacker = Unpacker::new(Arc::clone(&content), Arc::new(snapshotter));

        Ok(Self {
            repository,
            content,
            refs,
            metadata,
            tags: Arc::default(),
            unpacker,
            resolver,
            options,
        })
    }

    pub fn content(&self) -> &Arc<ContentStore> {
        &self.content
    }

    pub fn refs(&self) -> &RefStore {
        &self.refs
    }

    pub fn metadata(&self) -> &ImageMetadataStore {
        &self.metadata
    }

    pub fn snapshotter(&self) -> &Arc<S> {
        self.unpacker.snapshotter()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Follow indexes down from `root` to the image manifest for the
    /// configured platform.  Everything on the way must be stored already.
    fn select_manifest(&self, root: &ContentDescriptor) -> Result<SelectedManifest> {
        let mut desc = root.clone();
        let mut path_size = 0;
        loop {
            let data = self.content.get(&desc.digest)?;
            match desc.kind()? {
                NodeKind::Manifest => {
                    let manifest = manifest::parse_manifest(&desc, &data)?;
                    return Ok(SelectedManifest {
                        descriptor: desc,
                        manifest,
                        path_size,
                    });
                }
                NodeKind::Index => {
                    let index = manifest::parse_index(&desc, &data)?;
                    let entries = manifest::index_manifests(&desc, &index, &self.options.platform)?;
                    let Some(entry) = entries.into_iter().next() else {
                        return Err(Error::NoMatchingManifest {
                            digest: desc.digest,
                            platform: self.options.platform.to_string(),
                        });
                    };
                    debug!("selected {} from index {}", entry.digest, desc.digest);
                    path_size += desc.size;
                    desc = entry;
                }
                NodeKind::Config | NodeKind::Layer(_) => {
                    return Err(Error::Malformed {
                        digest: desc.digest,
                        source: "not an image manifest or index".into(),
                    });
                }
            }
        }
    }

    /// Ensure the image named by `reference` is present locally.
    ///
    /// Fetches whatever content is missing, unpacks the layers into a
    /// snapshot, registers the repo tag and repo digest as content
    /// associations and records them in the image's metadata.  Pulling a
    /// reference again is cheap and changes nothing.
    pub async fn pull_image(&self, reference: &str) -> Result<PullResult> {
        let reference = normalize(reference)?;
        info!("pulling {reference}");

        let resolved = self
            .resolver
            .resolve(&reference)
            .await
            .map_err(|err| Error::Resolve {
                reference: reference.to_string(),
                source: err.into(),
            })?;
        let root = resolved.descriptor;
        // name@digest has to match what the source calls it
        let remote_digest = resolved.remote_digest.unwrap_or_else(|| root.digest.clone());
        debug!(
            "{} resolved to {} (remote {remote_digest})",
            resolved.name, root.digest
        );

        let stats = fetch_graph(
            &self.content,
            Arc::new(resolved.fetcher),
            root.clone(),
            &self.options.platform,
            self.options.max_concurrent_fetches,
        )
        .await?;

        let selected = self.select_manifest(&root)?;
        let config = manifest::manifest_config(&selected.descriptor, &selected.manifest)?;
        if config.kind()? != NodeKind::Config {
            return Err(Error::UnsupportedMediaType {
                digest: config.digest,
                media_type: config.media_type,
            });
        }
        let layers = manifest::manifest_layers(&selected.descriptor, &selected.manifest)?;
        let size = selected.path_size
            + selected.descriptor.size
            + config.size
            + layers.iter().map(|l| l.size).sum::<u64>();

        let id = self.unpacker.unpack(&layers).await?;

        let repo_tag = reference.repo_tag();
        let repo_digest = reference.repo_digest(&remote_digest);

        // No suspension point past here: the commit runs to completion even
        // if the caller goes away.
        let refs = Arc::clone(&self.refs);
        let metadata = Arc::clone(&self.metadata);
        let tags = Arc::clone(&self.tags);
        let (commit_id, commit_root) = (id.clone(), root.clone());
        let record = tokio::task::spawn_blocking(move || {
            commit_pull(
                &refs,
                &metadata,
                &tags,
                &commit_id,
                size,
                &commit_root,
                repo_tag.as_deref(),
                &repo_digest,
            )
        })
        .await
        .context("Joining metadata commit")??;

        info!("pulled {reference} as {id}");
        Ok(PullResult {
            image_ref: id,
            record,
            descriptor: root,
            stats,
        })
    }

    /// Find the local record a string refers to, if any.
    ///
    /// Accepts a full chain ID, a `sha256:` prefixed or bare hex prefix of one
    /// (bare prefixes need at least 12 digits), a repo tag or a repo digest.
    fn lookup(&self, reference: &str) -> Result<Option<LocalMatch>> {
        if let Ok(id) = reference.parse::<ChainId>() {
            let record = self.metadata.get(&id)?;
            return Ok(record.map(|record| LocalMatch {
                record,
                reference: None,
            }));
        }

        let (prefix, explicit) = match reference.strip_prefix("sha256:") {
            Some(prefix) => (prefix, true),
            None => (reference, false),
        };
        let is_hex = !prefix.is_empty() && prefix.bytes().all(|b| b.is_ascii_hexdigit());
        if is_hex && (explicit || prefix.len() >= MIN_ID_PREFIX) {
            let prefix = prefix.to_ascii_lowercase();
            let mut matches: Vec<_> = self
                .metadata
                .list()?
                .into_iter()
                .filter(|r| r.id.hex().starts_with(&prefix))
                .collect();
            match matches.len() {
                // a full-length ID can't be a name either
                0 if explicit || prefix.len() >= 64 => return Ok(None),
                0 => {}
                1 => {
                    return Ok(matches.pop().map(|record| LocalMatch {
                        record,
                        reference: None,
                    }))
                }
                _ => {
                    return Err(Error::InvalidReference {
                        reference: reference.to_string(),
                        reason: "ambiguous image ID prefix".to_string(),
                    })
                }
            }
        }

        let parsed = normalize(reference)?;
        let records = self.metadata.list()?;
        let found = match parsed.target() {
            Target::Tag(_) => {
                let repo_tag = parsed.repo_tag();
                records
                    .into_iter()
                    .find(|r| r.repo_tags.iter().any(|t| Some(t) == repo_tag.as_ref()))
            }
            Target::Digest(digest) => {
                let repo_digest = parsed.repo_digest(digest);
                records
                    .into_iter()
                    .find(|r| r.repo_digests.contains(&repo_digest))
            }
        };
        Ok(found.map(|record| LocalMatch {
            record,
            reference: Some(parsed),
        }))
    }

    /// Resolve a reference or image ID against local metadata only.
    pub fn resolve_local(&self, reference: &str) -> Result<Option<ChainId>> {
        Ok(self.lookup(reference)?.map(|m| m.record.id))
    }

    /// The record of the image a reference or image ID names, if present.
    pub fn image_status(&self, reference: &str) -> Result<Option<ImageRecord>> {
        Ok(self.lookup(reference)?.map(|m| m.record))
    }

    /// Every image record, ordered by ID.
    pub fn list_images(&self) -> Result<Vec<ImageRecord>> {
        self.metadata.list()
    }

    /// The runtime configuration of a pulled image.
    pub fn image_config(&self, reference: &str) -> Result<ImageConfiguration> {
        let Some(found) = self.lookup(reference)? else {
            return Err(Error::NotFound(format!("image {reference}")));
        };
        let record = found.record;

        let mut root = None;
        for name in record.references() {
            if let Some(desc) = self.refs.get(name)? {
                root = Some(desc);
                break;
            }
        }
        let Some(root) = root else {
            return Err(Error::NotFound(format!(
                "content association for image {}",
                record.id
            )));
        };

        let selected = self.select_manifest(&root)?;
        let config = manifest::manifest_config(&selected.descriptor, &selected.manifest)?;
        if config.kind()? != NodeKind::Config {
            return Err(Error::UnsupportedMediaType {
                digest: config.digest,
                media_type: config.media_type,
            });
        }
        let data = self.content.get(&config.digest)?;
        ImageConfiguration::from_reader(&data[..]).map_err(|err| Error::Malformed {
            digest: config.digest,
            source: err.into(),
        })
    }

    /// Remove an image by repo tag, repo digest or image ID.
    ///
    /// Removing a tag of an image that has other tags only drops that tag.
    /// Otherwise every content association of the image and its record are
    /// deleted.  Anything already gone is skipped, so removal can be retried
    /// after a partial failure and removing an unknown image succeeds.
    /// Content and snapshots are left for the garbage collector.
    pub async fn remove_image(&self, reference: &str) -> Result<RemoveOutcome> {
        let Some(found) = self.lookup(reference)? else {
            info!("{reference} not present, nothing to remove");
            return Ok(RemoveOutcome::NotFound);
        };
        let id = found.record.id.clone();
        let tag = found.reference.as_ref().and_then(Reference::repo_tag);

        let refs = Arc::clone(&self.refs);
        let metadata = Arc::clone(&self.metadata);
        let tag_locks = Arc::clone(&self.tags);
        let outcome = tokio::task::spawn_blocking(move || -> Result<RemoveOutcome> {
            loop {
                let locked = match &tag {
                    Some(tag) => vec![tag.clone()],
                    None => match metadata.get(&id)? {
                        Some(record) => record.repo_tags,
                        None => return Ok(RemoveOutcome::NotFound),
                    },
                };
                let removed = tag_locks.with_locks(locked.clone(), || {
                    metadata.with_lock(&id, || {
                        remove_locked(&refs, &metadata, &id, tag.as_deref(), &locked)
                    })
                })?;
                if let Some(outcome) = removed {
                    return Ok(outcome);
                }
                debug!("{id} was tagged meanwhile, retrying");
            }
        })
        .await
        .context("Joining image removal")??;

        info!("removed {reference}: {outcome:?}");
        Ok(outcome)
    }
}

/// Register the content associations of a pull and fold its references into
/// the image record.  A repo tag is moved here from any image that had it.
#[allow(clippy::too_many_arguments)]
fn commit_pull(
    refs: &RefStore,
    metadata: &ImageMetadataStore,
    tags: &KeyedLocks,
    id: &ChainId,
    size: u64,
    root: &ContentDescriptor,
    repo_tag: Option<&str>,
    repo_digest: &str,
) -> Result<ImageRecord> {
    let Some(tag) = repo_tag else {
        return commit_record(refs, metadata, id, size, root, None, repo_digest);
    };
    tags.with_lock(tag, || {
        let record = commit_record(refs, metadata, id, size, root, Some(tag), repo_digest)?;
        // the pull has succeeded; stale tags elsewhere are only cosmetic
        if let Err(err) = move_tag(refs, metadata, id, root, tag) {
            warn!("moving {tag} to {id}: {err}");
        }
        Ok(record)
    })
}

/// Point `name` at `root`, returning what it pointed at before.
fn replace_ref(
    refs: &RefStore,
    name: &str,
    root: &ContentDescriptor,
) -> Result<Option<ContentDescriptor>> {
    let previous = refs.get(name)?;
    refs.put(name, root)?;
    Ok(previous)
}

/// Write the refs and the record of a pull under the record's lock.  If the
/// record can't be written, the refs are put back the way they were.
fn commit_record(
    refs: &RefStore,
    metadata: &ImageMetadataStore,
    id: &ChainId,
    size: u64,
    root: &ContentDescriptor,
    repo_tag: Option<&str>,
    repo_digest: &str,
) -> Result<ImageRecord> {
    metadata.with_lock(id, || {
        let mut written = vec![];
        let mut result = Ok(());
        for name in repo_tag.into_iter().chain([repo_digest]) {
            match replace_ref(refs, name, root) {
                Ok(previous) => written.push((name, previous)),
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        let result = result.and_then(|()| {
            metadata.create_or_update_locked(id, size, repo_tag, Some(repo_digest))
        });

        if result.is_err() {
            for (name, previous) in written.into_iter().rev() {
                let restored = match previous {
                    Some(previous) => refs.put(name, &previous),
                    None => refs.delete(name),
                };
                if let Err(err) = restored {
                    warn!("restoring ref {name}: {err}");
                }
            }
        }
        result
    })
}

/// Strip `tag` from every record but `id`'s.  Called with the tag locked.
fn move_tag(
    refs: &RefStore,
    metadata: &ImageMetadataStore,
    id: &ChainId,
    root: &ContentDescriptor,
    tag: &str,
) -> Result<()> {
    for other in metadata.list()? {
        if other.id == *id || !other.repo_tags.iter().any(|t| t == tag) {
            continue;
        }
        if refs.get(tag)?.as_ref() != Some(root) {
            warn!("{tag} no longer points at {}, leaving other images alone", root.digest);
            return Ok(());
        }
        debug!("moving {tag} away from {}", other.id);
        let moved = metadata.with_lock(&other.id, || {
            metadata.update_locked(&other.id, |r| {
                r.remove_tag(tag);
            })
        });
        match moved {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn removal_error(reference: &str, id: &ChainId, err: Error) -> Error {
    Error::Removal {
        reference: reference.to_string(),
        image: id.clone(),
        source: err.into(),
    }
}

/// Drop the ref `name`, where a missing ref counts as success.
fn delete_ref(refs: &RefStore, id: &ChainId, name: &str) -> Result<()> {
    match refs.delete(name) {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => {
            debug!("ref {name} already gone");
            Ok(())
        }
        Err(err) => Err(removal_error(name, id, err)),
    }
}

/// Remove the image `id`, or just `tag` from it, holding the record lock and
/// the locks of the tags in `locked`.
///
/// Returns `None` if deleting the whole image would touch tags that aren't
/// locked; the caller retries with the record's current tags.
fn remove_locked(
    refs: &RefStore,
    metadata: &ImageMetadataStore,
    id: &ChainId,
    tag: Option<&str>,
    locked: &[String],
) -> Result<Option<RemoveOutcome>> {
    // re-read under the lock; a concurrent removal may have won
    let Some(record) = metadata.get(id)? else {
        return Ok(Some(RemoveOutcome::NotFound));
    };

    if let Some(tag) = tag {
        if !record.repo_tags.iter().any(|t| t == tag) {
            // the tag moved to another image meanwhile
            return Ok(Some(RemoveOutcome::NotFound));
        }
        if record.repo_tags.len() > 1 {
            delete_ref(refs, id, tag)?;
            let record = match metadata.update_locked(id, |r| {
                r.remove_tag(tag);
            }) {
                Ok(record) => record,
                Err(err) => return Err(removal_error(tag, id, err)),
            };
            return Ok(Some(RemoveOutcome::Untagged {
                id: id.clone(),
                record,
            }));
        }
    }
    if record.repo_tags.iter().any(|t| !locked.contains(t)) {
        return Ok(None);
    }

    for name in record.references() {
        delete_ref(refs, id, name)?;
    }
    match metadata.delete_locked(id) {
        Ok(()) => {}
        Err(err) if err.is_not_found() => debug!("metadata for {id} already gone"),
        Err(err) => return Err(removal_error(&id.to_string(), id, err)),
    }
    Ok(Some(RemoveOutcome::Deleted { id: id.clone() }))
}
