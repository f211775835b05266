//! Helpers shared by the unit and integration tests.

use std::ffi::OsString;

use async_compression::tokio::bufread::{GzipEncoder, ZstdEncoder};
use once_cell::sync::Lazy;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

static TMPDIR: Lazy<OsString> = Lazy::new(|| {
    if let Some(path) = std::env::var_os("IMAGESTORE_TEST_TMPDIR") {
        eprintln!("temporary directory from $IMAGESTORE_TEST_TMPDIR: {path:?}");
        path
    } else {
        std::env::temp_dir().into()
    }
});

pub fn tempdir() -> TempDir {
    TempDir::with_prefix_in("imagestore-test-", TMPDIR.as_os_str()).unwrap()
}

/// One member of a test layer.
#[derive(Debug, Clone, Copy)]
pub enum Entry<'a> {
    Dir(&'a str),
    File(&'a str, &'a [u8]),
    Symlink(&'a str, &'a str),
}

/// Build an uncompressed tar layer.
pub fn layer_tar(entries: &[Entry]) -> Vec<u8> {
    let mut builder = tar::Builder::new(vec![]);
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        match *entry {
            Entry::Dir(path) => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder
                    .append_data(&mut header, path, std::io::empty())
                    .unwrap();
            }
            Entry::File(path, data) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(data.len() as u64);
                builder.append_data(&mut header, path, data).unwrap();
            }
            Entry::Symlink(path, target) => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_mode(0o777);
                header.set_size(0);
                builder.append_link(&mut header, path, target).unwrap();
            }
        }
    }
    builder.into_inner().unwrap()
}

pub async fn gzip(data: &[u8]) -> Vec<u8> {
    let mut out = vec![];
    GzipEncoder::new(data).read_to_end(&mut out).await.unwrap();
    out
}

pub async fn zstd(data: &[u8]) -> Vec<u8> {
    let mut out = vec![];
    ZstdEncoder::new(data).read_to_end(&mut out).await.unwrap();
    out
}
