//! Named content associations.
//!
//! A ref maps a repo tag or repo digest to the root descriptor of the content
//! it was pulled as.  Refs are the roots the garbage collector starts from:
//! a blob reachable from no ref may be reclaimed.
//!
//! Each ref is a file named by the sha256 of the ref name, holding the name
//! and the target, so names of any length map to a fixed-size filename.

use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use fn_error_context::context;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{
    digest::Digest,
    error::{Error, Result},
    manifest::ContentDescriptor,
    util::NotFoundFilter,
};

#[derive(Debug, Serialize, Deserialize)]
struct RefFile {
    name: String,
    target: ContentDescriptor,
}

#[derive(Debug)]
pub struct RefStore {
    dir: PathBuf,
}

impl RefStore {
    #[context("Opening ref store at {}", dir.display())]
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(Digest::sha256(name.as_bytes()).hex())
    }

    /// Point `name` at `target`, replacing any previous association.
    pub fn put(&self, name: &str, target: &ContentDescriptor) -> Result<()> {
        Ok(self.write(name, target)?)
    }

    #[context("Writing ref {}", name)]
    fn write(&self, name: &str, target: &ContentDescriptor) -> anyhow::Result<()> {
        let file = RefFile {
            name: name.to_string(),
            target: target.clone(),
        };
        let mut tmp = NamedTempFile::with_prefix_in(".tmp-", &self.dir)?;
        serde_json::to_writer(&mut tmp, &file)?;
        tmp.flush()?;
        tmp.persist(self.path(name))?;
        debug!("ref {name} -> {}", target.digest);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<ContentDescriptor>> {
        Ok(self.read(name)?)
    }

    #[context("Reading ref {}", name)]
    fn read(&self, name: &str) -> anyhow::Result<Option<ContentDescriptor>> {
        let Some(data) = fs::read(self.path(name)).filter_not_found()? else {
            return Ok(None);
        };
        let file: RefFile = serde_json::from_slice(&data)?;
        if file.name != name {
            bail!("Ref file holds {}", file.name);
        }
        Ok(Some(file.target))
    }

    /// Drop the association for `name`; [`Error::NotFound`] if there is none.
    pub fn delete(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.path(name)) {
            Ok(()) => {
                debug!("deleted ref {name}");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(format!("ref {name}")))
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("Deleting ref {name}"))
                .into()),
        }
    }

    /// All associations, sorted by name.
    #[context("Listing refs")]
    pub fn list(&self) -> anyhow::Result<Vec<(String, ContentDescriptor)>> {
        let mut refs = vec![];
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_name().as_encoded_bytes().starts_with(b".") {
                continue;
            }
            // raced with a delete
            let Some(data) = fs::read(entry.path()).filter_not_found()? else {
                continue;
            };
            match serde_json::from_slice::<RefFile>(&data) {
                Ok(file) => refs.push((file.name, file.target)),
                Err(err) => warn!("Skipping ref file {}: {err}", entry.path().display()),
            }
        }
        refs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(refs)
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{manifest::DOCKER_MANIFEST, test::tempdir};

    #[test]
    fn test_refs() {
        let tmp = tempdir();
        let refs = RefStore::open(&tmp.path().join("refs")).unwrap();
        let one = ContentDescriptor::for_bytes(DOCKER_MANIFEST, b"one");
        let two = ContentDescriptor::for_bytes(DOCKER_MANIFEST, b"two");

        assert_eq!(refs.get("registry.example/app:v1").unwrap(), None);

        refs.put("registry.example/app:v1", &one).unwrap();
        refs.put("registry.example/app:v2", &one).unwrap();
        assert_eq!(refs.get("registry.example/app:v1").unwrap(), Some(one.clone()));

        // replacing moves the association
        refs.put("registry.example/app:v2", &two).unwrap();
        assert_eq!(
            refs.list().unwrap(),
            vec![
                ("registry.example/app:v1".to_string(), one),
                ("registry.example/app:v2".to_string(), two),
            ]
        );

        refs.delete("registry.example/app:v1").unwrap();
        assert!(refs
            .delete("registry.example/app:v1")
            .unwrap_err()
            .is_not_found());
        assert_eq!(refs.list().unwrap().len(), 1);
    }

    #[test]
    fn test_long_names() {
        let tmp = tempdir();
        let refs = RefStore::open(&tmp.path().join("refs")).unwrap();
        let target = ContentDescriptor::for_bytes(DOCKER_MANIFEST, b"one");
        let name = format!(
            "registry.example/{}/{}/{}@{}",
            "a".repeat(100),
            "b".repeat(100),
            "c".repeat(50),
            target.digest
        );

        refs.put(&name, &target).unwrap();
        assert_eq!(refs.get(&name).unwrap(), Some(target.clone()));
        assert_eq!(refs.list().unwrap(), vec![(name.clone(), target)]);
        refs.delete(&name).unwrap();
        assert_eq!(refs.get(&name).unwrap(), None);
    }

    #[test]
    fn test_list_skips_unreadable() {
        let tmp = tempdir();
        let refs = RefStore::open(&tmp.path().join("refs")).unwrap();
        let target = ContentDescriptor::for_bytes(DOCKER_MANIFEST, b"one");
        refs.put("registry.example/app:v1", &target).unwrap();
        fs::write(tmp.path().join("refs/garbage"), "not json").unwrap();

        assert_eq!(
            refs.list().unwrap(),
            vec![("registry.example/app:v1".to_string(), target)]
        );
    }
}
