//! Materialized filesystem snapshots, one per chain ID.
//!
//! A snapshot is built by applying a layer changeset (an uncompressed tar
//! stream with OCI whiteouts) on top of the parent chain's snapshot.  The
//! result is prepared in a scratch directory and published with a single
//! rename, so a snapshot is either absent or complete.

use std::{
    collections::HashSet,
    fs::{self, Permissions},
    io::{ErrorKind, Read},
    os::unix::fs::{symlink, PermissionsExt},
    path::{Component, Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use fn_error_context::context;
use log::{debug, trace};
use tar::EntryType;

use crate::{digest::ChainId, util::NotFoundFilter};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Where layered filesystems get materialized.
pub trait Snapshotter: Send + Sync + 'static {
    /// Whether a committed snapshot exists for `chain`.
    fn exists(&self, chain: &ChainId) -> Result<bool>;

    /// Build the snapshot `chain` by applying `changeset` on top of `parent`
    /// (or on an empty tree).
    ///
    /// Must commit all or nothing.  Applying a chain that already exists is a
    /// no-op.
    fn apply(&self, chain: &ChainId, parent: Option<&ChainId>, changeset: &mut dyn Read)
        -> Result<()>;
}

/// Snapshots as plain directory trees under `snapshots/<alg>/<hex>`.
///
/// Files shared with the parent snapshot are hard links; layers always
/// replace a file rather than write into it, so parents are never modified.
#[derive(Debug)]
pub struct DirSnapshotter {
    root: PathBuf,
}

impl DirSnapshotter {
    #[context("Opening snapshot directory {}", root.display())]
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// The directory holding the snapshot for `chain`.
    pub fn path(&self, chain: &ChainId) -> PathBuf {
        self.root
            .join(chain.digest().algorithm().id())
            .join(chain.hex())
    }
}

impl Snapshotter for DirSnapshotter {
    fn exists(&self, chain: &ChainId) -> Result<bool> {
        Ok(self.path(chain).is_dir())
    }

    #[context("Applying snapshot {}", chain)]
    fn apply(
        &self,
        chain: &ChainId,
        parent: Option<&ChainId>,
        changeset: &mut dyn Read,
    ) -> Result<()> {
        let target = self.path(chain);
        if target.is_dir() {
            return Ok(());
        }
        let parent_dir = target.parent().context("Snapshot path has no parent")?;
        fs::create_dir_all(parent_dir)?;

        let scratch = tempfile::Builder::new()
            .prefix(".prepare-")
            .tempdir_in(&self.root)?;

        // the scratch directory is created 0700; the snapshot root is not
        let mut root_mode = Permissions::from_mode(0o755);
        if let Some(parent) = parent {
            let from = self.path(parent);
            if !from.is_dir() {
                bail!("Parent snapshot {parent} does not exist");
            }
            trace!("copying parent snapshot {parent}");
            copy_tree(&from, scratch.path())?;
            root_mode = fs::metadata(&from)?.permissions();
        }

        apply_layer(scratch.path(), changeset)?;
        fs::set_permissions(scratch.path(), root_mode)?;

        match fs::rename(scratch.path(), &target) {
            Ok(()) => {
                debug!("committed snapshot {chain}");
                Ok(())
            }
            // lost a race against an identical commit
            Err(_) if target.is_dir() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Join a path from an archive onto `root`, refusing anything that would
/// escape it.
fn safe_join(root: &Path, path: &Path) -> Result<PathBuf> {
    let mut joined = root.to_path_buf();
    for component in path.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                bail!("Refusing archive path {}", path.display())
            }
        }
    }
    Ok(joined)
}

/// [`safe_join`], additionally refusing paths whose parent directories
/// include a symlink.  Whatever the result names is inside `root`, so it can
/// be removed or listed without following links out of the snapshot.
fn resolve_in_root(root: &Path, path: &Path) -> Result<PathBuf> {
    let joined = safe_join(root, path)?;
    let mut parents = joined.strip_prefix(root)?.components();
    // the entry itself may be a symlink, it gets replaced, not followed
    parents.next_back();
    let mut dir = root.to_path_buf();
    for part in parents {
        dir.push(part);
        match fs::symlink_metadata(&dir).filter_not_found()? {
            Some(meta) if meta.file_type().is_symlink() => {
                bail!("Refusing archive path {} through symlink", path.display())
            }
            Some(_) => {}
            None => break,
        }
    }
    Ok(joined)
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path).filter_not_found()? {
        Some(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Some(_) => fs::remove_file(path),
        None => Ok(()),
    }
}

/// Mirror `from` into the existing directory `to`, hard-linking files.
fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        let meta = fs::symlink_metadata(&src)?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            fs::create_dir(&dst)?;
            copy_tree(&src, &dst)?;
            fs::set_permissions(&dst, meta.permissions())?;
        } else if file_type.is_symlink() {
            symlink(fs::read_link(&src)?, &dst)?;
        } else if fs::hard_link(&src, &dst).is_err() {
            fs::copy(&src, &dst).with_context(|| format!("Copying {}", src.display()))?;
        }
    }
    Ok(())
}

/// Unpack a tar changeset into `root`, honouring OCI whiteouts.
fn apply_layer(root: &Path, changeset: &mut dyn Read) -> Result<()> {
    let mut archive = tar::Archive::new(changeset);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    // paths written by this layer, which an opaque whiteout must not hide
    let mut written = HashSet::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let dest = resolve_in_root(root, &path)?;
        let Some(name) = dest.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            // the archive root itself
            continue;
        };
        let dir = dest.parent().context("Archive entry has no parent")?;

        if name == OPAQUE_WHITEOUT {
            trace!("opaque whiteout {}", dir.display());
            for child in fs::read_dir(dir).filter_not_found()?.into_iter().flatten() {
                let child = child?.path();
                if !written.contains(&child) {
                    remove_any(&child)?;
                }
            }
            continue;
        }
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            trace!("whiteout {}", dir.join(hidden).display());
            remove_any(&dir.join(hidden))?;
            continue;
        }

        // a layer replaces files, it never writes through them
        let is_dir = entry.header().entry_type() == EntryType::Directory;
        match fs::symlink_metadata(&dest) {
            Ok(meta) if meta.is_dir() && is_dir => {}
            Ok(_) => remove_any(&dest)?,
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        if !entry.unpack_in(root)? {
            bail!("Refusing archive path {}", path.display());
        }
        written.insert(dest);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        digest::Digest,
        test::{layer_tar, tempdir, Entry},
    };

    fn chain(name: &str) -> ChainId {
        ChainId::of(&[Digest::sha256(name.as_bytes())]).unwrap()
    }

    fn read(path: impl AsRef<Path>) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_apply_layers() {
        let tmp = tempdir();
        let snapshots = DirSnapshotter::open(tmp.path()).unwrap();
        let (base, top) = (chain("base"), chain("top"));

        let layer1 = layer_tar(&[
            Entry::Dir("etc"),
            Entry::File("etc/hostname", b"base"),
            Entry::File("etc/motd", b"hello"),
            Entry::Dir("var/cache"),
            Entry::File("var/cache/a", b"a"),
            Entry::Symlink("bin", "usr/bin"),
        ]);
        snapshots.apply(&base, None, &mut &layer1[..]).unwrap();
        assert!(snapshots.exists(&base).unwrap());

        let layer2 = layer_tar(&[
            Entry::File("etc/hostname", b"top"),
            Entry::File("etc/.wh.motd", b""),
            Entry::File("var/cache/.wh..wh..opq", b""),
            Entry::File("var/cache/b", b"b"),
        ]);
        snapshots.apply(&top, Some(&base), &mut &layer2[..]).unwrap();

        let top_dir = snapshots.path(&top);
        assert_eq!(read(top_dir.join("etc/hostname")), "top");
        assert!(!top_dir.join("etc/motd").exists());
        assert!(!top_dir.join("var/cache/a").exists());
        assert_eq!(read(top_dir.join("var/cache/b")), "b");
        assert_eq!(
            fs::read_link(top_dir.join("bin")).unwrap(),
            PathBuf::from("usr/bin")
        );

        // the parent is untouched
        let base_dir = snapshots.path(&base);
        assert_eq!(read(base_dir.join("etc/hostname")), "base");
        assert_eq!(read(base_dir.join("etc/motd")), "hello");
        assert_eq!(read(base_dir.join("var/cache/a")), "a");
    }

    #[test]
    fn test_apply_existing_is_noop() {
        let tmp = tempdir();
        let snapshots = DirSnapshotter::open(tmp.path()).unwrap();
        let base = chain("base");
        let layer = layer_tar(&[Entry::File("a", b"first")]);
        snapshots.apply(&base, None, &mut &layer[..]).unwrap();

        let other = layer_tar(&[Entry::File("a", b"second")]);
        snapshots.apply(&base, None, &mut &other[..]).unwrap();
        assert_eq!(read(snapshots.path(&base).join("a")), "first");
    }

    #[test]
    fn test_malformed_layer_commits_nothing() {
        let tmp = tempdir();
        let snapshots = DirSnapshotter::open(tmp.path()).unwrap();
        let base = chain("base");
        let mut layer = layer_tar(&[Entry::File("a", &[1u8; 4096])]);
        layer.truncate(1000);

        assert!(snapshots.apply(&base, None, &mut &layer[..]).is_err());
        assert!(!snapshots.exists(&base).unwrap());
        // no scratch directories are left behind
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|n| n.to_string_lossy().starts_with(".prepare-"))
            .collect();
        assert_eq!(leftovers.len(), 0);
    }

    #[test]
    fn test_missing_parent() {
        let tmp = tempdir();
        let snapshots = DirSnapshotter::open(tmp.path()).unwrap();
        let layer = layer_tar(&[Entry::File("a", b"a")]);
        assert!(snapshots
            .apply(&chain("top"), Some(&chain("base")), &mut &layer[..])
            .is_err());
    }

    #[test]
    fn test_whiteouts_stay_inside_snapshot() {
        let tmp = tempdir();
        let host = tempdir();
        fs::write(host.path().join("secret"), "keep").unwrap();
        fs::write(host.path().join("other"), "keep").unwrap();
        let host_path = host.path().to_str().unwrap();

        let snapshots = DirSnapshotter::open(tmp.path()).unwrap();
        let base = chain("base");
        let layer1 = layer_tar(&[Entry::Symlink("evil", host_path)]);
        snapshots.apply(&base, None, &mut &layer1[..]).unwrap();

        for (name, layer) in [
            ("whiteout", layer_tar(&[Entry::File("evil/.wh.secret", b"")])),
            ("opaque", layer_tar(&[Entry::File("evil/.wh..wh..opq", b"")])),
            ("file", layer_tar(&[Entry::File("evil/other", b"replaced")])),
        ] {
            let top = chain(name);
            assert!(snapshots.apply(&top, Some(&base), &mut &layer[..]).is_err());
            assert!(!snapshots.exists(&top).unwrap());
        }

        assert_eq!(read(host.path().join("secret")), "keep");
        assert_eq!(read(host.path().join("other")), "keep");
        // the link itself may still be replaced or whited out
        let layer = layer_tar(&[Entry::File(".wh.evil", b"")]);
        snapshots
            .apply(&chain("removed"), Some(&base), &mut &layer[..])
            .unwrap();
        assert!(fs::symlink_metadata(snapshots.path(&chain("removed")).join("evil")).is_err());
        assert!(host.path().join("secret").exists());
    }

    #[test]
    fn test_snapshot_root_mode() {
        let tmp = tempdir();
        let snapshots = DirSnapshotter::open(tmp.path()).unwrap();
        let (base, top) = (chain("base"), chain("top"));
        let layer = layer_tar(&[Entry::File("a", b"a")]);
        snapshots.apply(&base, None, &mut &layer[..]).unwrap();

        let mode = |chain: &ChainId| {
            fs::metadata(snapshots.path(chain)).unwrap().permissions().mode() & 0o7777
        };
        assert_eq!(mode(&base), 0o755);

        fs::set_permissions(snapshots.path(&base), Permissions::from_mode(0o750)).unwrap();
        snapshots.apply(&top, Some(&base), &mut &layer[..]).unwrap();
        assert_eq!(mode(&top), 0o750);
    }

    #[test]
    fn test_resolve_in_root() {
        let tmp = tempdir();
        fs::create_dir(tmp.path().join("dir")).unwrap();
        symlink("dir", tmp.path().join("link")).unwrap();

        assert_eq!(
            resolve_in_root(tmp.path(), Path::new("dir/a/b")).unwrap(),
            tmp.path().join("dir/a/b")
        );
        assert_eq!(
            resolve_in_root(tmp.path(), Path::new("link")).unwrap(),
            tmp.path().join("link")
        );
        assert_eq!(
            resolve_in_root(tmp.path(), Path::new(".")).unwrap(),
            tmp.path().to_path_buf()
        );
        assert!(resolve_in_root(tmp.path(), Path::new("link/a")).is_err());
    }

    #[test]
    fn test_safe_join() {
        let root = Path::new("/snap");
        assert_eq!(
            safe_join(root, Path::new("./etc/passwd")).unwrap(),
            PathBuf::from("/snap/etc/passwd")
        );
        assert_eq!(
            safe_join(root, Path::new("/abs")).unwrap(),
            PathBuf::from("/snap/abs")
        );
        assert!(safe_join(root, Path::new("../escape")).is_err());
    }
}
