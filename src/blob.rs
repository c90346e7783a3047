//! Content-addressed blob storage under `blobs/sha256/`.
//!
//! Blobs are streamed into a temporary file in the blob directory while
//! being hashed, then renamed to their digest. A blob either appears whole
//! under its final name or not at all, and writing the same content twice
//! yields the same path.

use crate::error::ConvertError;
use anyhow::{Context, Result};
use oci_spec::image::{Descriptor, DescriptorBuilder, Digest, MediaType};
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const BLOBS_DIR: &str = "blobs";
pub const DIGEST_ALGORITHM: &str = "sha256";

const BLOB_MODE: u32 = 0o644;
const BLOB_DIR_MODE: u32 = 0o755;

/// Parses `algorithm:hex`, rejecting anything that is not a well-formed digest.
pub fn parse_digest(value: &str) -> Result<Digest> {
    Digest::from_str(value).map_err(|e| {
        anyhow::Error::from(ConvertError::InvalidDigest {
            digest: value.to_string(),
            reason: e.to_string(),
        })
    })
}

/// A blob that has been committed to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub digest: Digest,
    pub size: u64,
}

impl Blob {
    pub fn descriptor(&self, media_type: MediaType) -> Result<Descriptor> {
        DescriptorBuilder::default()
            .media_type(media_type)
            .digest(self.digest.clone())
            .size(self.size)
            .build()
            .context("Failed to build descriptor")
    }
}

/// Writer that hashes everything passing through it.
struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.written)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn hash_reader<R: Read>(mut reader: R) -> io::Result<(String, u64)> {
    let mut writer = DigestWriter::new(io::sink());
    io::copy(&mut reader, &mut writer)?;
    Ok(writer.finish())
}

#[cfg(unix)]
fn set_blob_mode(file: &File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(BLOB_MODE))
}

#[cfg(not(unix))]
fn set_blob_mode(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn create_blob_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(BLOB_DIR_MODE)
        .create(path)
}

#[cfg(not(unix))]
fn create_blob_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Store rooted at an existing image layout. Does not touch the disk.
    pub fn new(layout_root: &Path) -> Self {
        Self {
            dir: layout_root.join(BLOBS_DIR).join(DIGEST_ALGORITHM),
        }
    }

    /// Like [`BlobStore::new`], creating the blob directory if needed.
    pub fn create(layout_root: &Path) -> Result<Self> {
        let store = Self::new(layout_root);
        create_blob_dir(&store.dir).with_context(|| {
            format!("Failed to create blob directory: {}", store.dir.display())
        })?;
        Ok(store)
    }

    pub fn path_for(&self, digest: &Digest) -> PathBuf {
        self.dir.join(digest.digest())
    }

    /// Streams `reader` into the store and returns the committed blob.
    pub fn write<R: Read>(&self, mut reader: R) -> Result<Blob> {
        let tmp = tempfile::Builder::new()
            .prefix(".tmp-blob-")
            .tempfile_in(&self.dir)
            .with_context(|| format!("Failed to create temp blob in {}", self.dir.display()))?;

        let mut writer = DigestWriter::new(tmp.as_file());
        io::copy(&mut reader, &mut writer).context("Failed to write blob")?;
        writer.flush().context("Failed to flush blob")?;
        let (hex_digest, size) = writer.finish();

        tmp.as_file().sync_all().context("Failed to sync blob")?;
        set_blob_mode(tmp.as_file()).context("Failed to set blob permissions")?;

        let digest = parse_digest(&format!("{DIGEST_ALGORITHM}:{hex_digest}"))?;
        let path = self.path_for(&digest);
        tmp.persist(&path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to commit blob: {}", path.display()))?;

        log::debug!("Stored blob {} ({} bytes)", digest, size);
        Ok(Blob { digest, size })
    }

    pub fn write_json<T: Serialize>(&self, value: &T) -> Result<Blob> {
        let content = serde_json::to_vec(value).context("Failed to serialize blob")?;
        self.write(content.as_slice())
    }

    /// Re-hashes a committed blob and checks it against `digest` and `size`.
    pub fn verify(&self, digest: &Digest, size: u64) -> Result<()> {
        if !digest.to_string().starts_with(&format!("{DIGEST_ALGORITHM}:")) {
            return Err(ConvertError::InvalidDigest {
                digest: digest.to_string(),
                reason: format!("only {DIGEST_ALGORITHM} blobs are stored"),
            }
            .into());
        }

        let path = self.path_for(digest);
        let file =
            File::open(&path).with_context(|| format!("Failed to open blob: {}", path.display()))?;
        let (actual, actual_size) =
            hash_reader(file).with_context(|| format!("Failed to read blob: {}", path.display()))?;

        if actual != digest.digest() {
            return Err(ConvertError::DigestMismatch {
                expected: digest.to_string(),
                actual: format!("{DIGEST_ALGORITHM}:{actual}"),
            }
            .into());
        }
        if actual_size != size {
            return Err(ConvertError::SizeMismatch {
                digest: digest.to_string(),
                expected: size,
                actual: actual_size,
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_write_names_blob_by_digest() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::create(temp_dir.path()).unwrap();

        let blob = store.write(&b"hello"[..]).unwrap();
        assert_eq!(blob.digest.digest(), HELLO_SHA256);
        assert_eq!(blob.size, 5);

        let path = temp_dir.path().join("blobs/sha256").join(HELLO_SHA256);
        assert_eq!(store.path_for(&blob.digest), path);
        assert_eq!(fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn test_write_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::create(temp_dir.path()).unwrap();

        let first = store.write(&b"same content"[..]).unwrap();
        let second = store.write(&b"same content"[..]).unwrap();
        assert_eq!(first, second);

        let names: Vec<_> = fs::read_dir(temp_dir.path().join("blobs/sha256"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1, "no temp files left behind: {names:?}");
    }

    #[cfg(unix)]
    #[test]
    fn test_blob_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::create(temp_dir.path()).unwrap();
        let blob = store.write(&b"perm"[..]).unwrap();

        let mode = fs::metadata(store.path_for(&blob.digest))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_write_json_and_descriptor() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::create(temp_dir.path()).unwrap();

        let blob = store.write_json(&serde_json::json!({"a": 1})).unwrap();
        assert_eq!(blob.size, br#"{"a":1}"#.len() as u64);

        let descriptor = blob.descriptor(MediaType::ImageConfig).unwrap();
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["mediaType"], "application/vnd.oci.image.config.v1+json");
        assert_eq!(json["digest"], blob.digest.to_string());
        assert_eq!(json["size"], blob.size);
    }

    #[test]
    fn test_verify_detects_tampering() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::create(temp_dir.path()).unwrap();
        let blob = store.write(&b"hello"[..]).unwrap();

        store.verify(&blob.digest, blob.size).unwrap();

        let err = store.verify(&blob.digest, 6).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConvertError>(),
            Some(ConvertError::SizeMismatch { .. })
        ));

        let path = store.path_for(&blob.digest);
        fs::remove_file(&path).unwrap();
        fs::write(&path, b"jello").unwrap();
        let err = store.verify(&blob.digest, blob.size).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConvertError>(),
            Some(ConvertError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_parse_digest() {
        assert!(parse_digest(&format!("sha256:{HELLO_SHA256}")).is_ok());

        for bad in ["sha256:xyz", "nocolon", "sha256:"] {
            let err = parse_digest(bad).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<ConvertError>(),
                Some(ConvertError::InvalidDigest { .. })
            ));
        }
    }
}
