//! Builders for tar streams and `docker save` archives used by the tests.

#![allow(dead_code)]

use bzip2::write::BzEncoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::io::{self, Write};
use tar_rs::{Builder, EntryType, Header};

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn bzip2(data: &[u8]) -> Vec<u8> {
    let mut encoder = BzEncoder::new(Vec::new(), bzip2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Tar stream builder that can also emit entries `tar::Builder` refuses,
/// such as names containing `..` or absolute names.
pub struct TarBuilder {
    inner: Builder<Vec<u8>>,
}

impl Default for TarBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TarBuilder {
    pub fn new() -> Self {
        Self {
            inner: Builder::new(Vec::new()),
        }
    }

    pub fn dir(mut self, path: &str, mode: u32, mtime: u64) -> Self {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(mode);
        header.set_mtime(mtime);
        self.inner
            .append_data(&mut header, path, io::empty())
            .unwrap();
        self
    }

    pub fn file(mut self, path: &str, data: &[u8], mode: u32) -> Self {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(mode);
        header.set_mtime(1_600_000_000);
        self.inner.append_data(&mut header, path, data).unwrap();
        self
    }

    pub fn symlink(self, path: &str, target: &str) -> Self {
        self.raw(path, EntryType::Symlink, Some(target), b"")
    }

    pub fn hardlink(self, path: &str, target: &str) -> Self {
        self.raw(path, EntryType::Link, Some(target), b"")
    }

    /// Appends an entry with `name` and `link` copied verbatim into the header.
    pub fn raw(mut self, name: &str, kind: EntryType, link: Option<&str>, data: &[u8]) -> Self {
        let mut header = Header::new_gnu();
        {
            let old = header.as_old_mut();
            old.name[..name.len()].copy_from_slice(name.as_bytes());
            if let Some(link) = link {
                old.linkname[..link.len()].copy_from_slice(link.as_bytes());
            }
        }
        header.set_entry_type(kind);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_600_000_000);
        header.set_cksum();
        self.inner.append(&header, data).unwrap();
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.inner.into_inner().unwrap()
    }
}

/// One image of a synthetic `docker save` archive.
pub struct TestImage {
    pub tags: Vec<String>,
    /// Uncompressed layer tarballs, oldest first.
    pub layers: Vec<Vec<u8>>,
    /// Overrides the generated image config.
    pub config: Option<String>,
    /// Overrides the number of entries in `rootfs.diff_ids`.
    pub diff_id_count: Option<usize>,
}

impl TestImage {
    pub fn new(tags: &[&str], layers: Vec<Vec<u8>>) -> Self {
        Self {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            layers,
            config: None,
            diff_id_count: None,
        }
    }

    pub fn diff_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .layers
            .iter()
            .map(|l| format!("sha256:{}", sha256_hex(l)))
            .collect();
        if let Some(count) = self.diff_id_count {
            ids.resize(count, format!("sha256:{}", sha256_hex(b"padding")));
        }
        ids
    }

    pub fn config_json(&self) -> String {
        if let Some(config) = &self.config {
            return config.clone();
        }
        serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "created": "2023-06-01T12:00:00Z",
            "author": "tests",
            "container_config": {
                "Env": ["PATH=/usr/bin"],
                "Cmd": ["/bin/sh"],
                "WorkingDir": "/",
                "ExposedPorts": {"80/tcp": {}}
            },
            "rootfs": {"type": "layers", "diff_ids": self.diff_ids()},
            "history": self.layers.iter().map(|_| serde_json::json!({"created_by": "ADD"})).collect::<Vec<_>>()
        })
        .to_string()
    }
}

/// Small layer tarball holding one file.
pub fn layer_tar(path: &str, content: &[u8]) -> Vec<u8> {
    TarBuilder::new().file(path, content, 0o644).build()
}

/// Lays the images out the way `docker save` does: a JSON config per image,
/// one directory per layer and a top-level `manifest.json`.
pub fn docker_archive(images: &[TestImage]) -> Vec<u8> {
    let mut builder = TarBuilder::new();
    let mut manifest = Vec::new();

    for image in images {
        let config = image.config_json();
        let config_name = format!("{}.json", sha256_hex(config.as_bytes()));
        builder = builder.file(&config_name, config.as_bytes(), 0o644);

        let mut layer_paths = Vec::new();
        for layer in &image.layers {
            let dir = sha256_hex(layer);
            let path = format!("{dir}/layer.tar");
            if !layer_paths.contains(&path) {
                builder = builder
                    .dir(&format!("{dir}/"), 0o755, 1_600_000_000)
                    .file(&format!("{dir}/VERSION"), b"1.0", 0o644)
                    .file(&path, layer, 0o644);
            }
            layer_paths.push(path);
        }

        manifest.push(serde_json::json!({
            "Config": config_name,
            "RepoTags": image.tags,
            "Layers": layer_paths,
        }));
    }

    builder
        .file(
            "manifest.json",
            serde_json::Value::Array(manifest).to_string().as_bytes(),
            0o644,
        )
        .build()
}
