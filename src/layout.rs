//! OCI image layout assembly.
//!
//! A [`LayoutWriter`] takes the images listed in an extracted archive's
//! `manifest.json`, one at a time, and turns each into a config blob, layer
//! blobs and an image manifest. [`LayoutWriter::finish`] then writes
//! `index.json` and the `oci-layout` marker. Both top-level files are
//! created exclusively, so an existing layout is never overwritten.

use crate::blob::BlobStore;
use crate::extract::contained_path;
use crate::legacy::LegacyImageConfig;
use crate::manifest::ManifestEntry;
use crate::notifier::Notifier;
use crate::translate;
use anyhow::{Context, Result};
use oci_spec::image::{
    Descriptor, ImageIndex, ImageIndexBuilder, ImageManifest, ImageManifestBuilder, MediaType,
    OciLayoutBuilder, PlatformBuilder,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const INDEX_FILE: &str = "index.json";
pub const OCI_LAYOUT_FILE: &str = "oci-layout";
pub const IMAGE_LAYOUT_VERSION: &str = "1.0.0";
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

const SCHEMA_VERSION: u32 = 2;

/// Writes `value` as JSON to a file that must not exist yet.
fn write_new_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    serde_json::to_writer(&mut file, value)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    file.flush()?;
    file.sync_all()
        .with_context(|| format!("Failed to sync {}", path.display()))?;
    Ok(())
}

pub struct LayoutWriter<'a> {
    root: PathBuf,
    store: BlobStore,
    manifests: Vec<Descriptor>,
    notifier: &'a Notifier,
}

impl<'a> LayoutWriter<'a> {
    /// Prepares the blob directory of a layout rooted at `root`, which must exist.
    pub fn create(root: &Path, notifier: &'a Notifier) -> Result<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            store: BlobStore::create(root)?,
            manifests: Vec::new(),
            notifier,
        })
    }

    /// Converts one image of the archive extracted at `scratch` and returns
    /// the descriptor of its manifest.
    pub fn add_image(&mut self, scratch: &Path, entry: &ManifestEntry) -> Result<Descriptor> {
        let scratch = scratch
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", scratch.display()))?;

        let config_path = contained_path(&scratch, Path::new(&entry.config), true)?;
        let raw_config = fs::read(&config_path)
            .with_context(|| format!("Failed to read image config: {}", entry.config))?;
        let legacy = LegacyImageConfig::from_json(&raw_config)
            .with_context(|| format!("Invalid image config: {}", entry.config))?;
        translate::check_layer_alignment(&legacy, entry)?;

        if let Some(parent) = entry.parent_digest()? {
            self.notifier.debug(&format!("Image parent: {}", parent));
        }

        let config = translate::to_oci_config(&legacy)?;
        let config_descriptor = self
            .store
            .write_json(&config)?
            .descriptor(MediaType::ImageConfig)?;
        self.notifier
            .debug(&format!("Config blob: {}", config_descriptor.digest()));

        let mut layers = Vec::with_capacity(entry.layers.len());
        for (i, layer) in entry.layers.iter().enumerate() {
            self.notifier
                .progress(i + 1, entry.layers.len(), "Copying layers");
            layers.push(self.write_layer(&scratch, layer)?);
        }

        let manifest = ImageManifestBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::ImageManifest)
            .config(config_descriptor)
            .layers(layers)
            .build()
            .context("Failed to build image manifest")?;

        let mut descriptor = self
            .store
            .write_json(&manifest)?
            .descriptor(MediaType::ImageManifest)?;

        let platform = PlatformBuilder::default()
            .architecture(config.architecture().clone())
            .os(config.os().clone())
            .build()
            .context("Failed to build platform")?;
        descriptor.set_platform(Some(platform));

        if let Some(ref_name) = entry.ref_name() {
            let mut annotations = HashMap::new();
            annotations.insert(ANNOTATION_REF_NAME.to_string(), ref_name.to_string());
            descriptor.set_annotations(Some(annotations));
        }

        self.manifests.push(descriptor.clone());
        Ok(descriptor)
    }

    fn write_layer(&self, scratch: &Path, layer: &str) -> Result<Descriptor> {
        let path = contained_path(scratch, Path::new(layer), true)?;
        let file = File::open(&path).with_context(|| format!("Failed to open layer: {}", layer))?;
        let length = file
            .metadata()
            .with_context(|| format!("Failed to stat layer: {}", layer))?
            .len();

        let blob = match self.notifier.create_progress_bar(length, layer) {
            Some(progress_bar) => {
                let blob = self.store.write(progress_bar.wrap_read(file));
                progress_bar.finish_and_clear();
                blob
            }
            None => self.store.write(file),
        }
        .with_context(|| format!("Failed to copy layer: {}", layer))?;

        self.notifier
            .debug(&format!("Layer {} -> {} ({} bytes)", layer, blob.digest, blob.size));
        blob.descriptor(MediaType::ImageLayer)
    }

    /// Writes `index.json` and `oci-layout` and returns the index.
    pub fn finish(self) -> Result<ImageIndex> {
        let index = ImageIndexBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::ImageIndex)
            .manifests(self.manifests)
            .build()
            .context("Failed to build image index")?;
        write_new_json(&self.root.join(INDEX_FILE), &index)?;

        let layout = OciLayoutBuilder::default()
            .image_layout_version(IMAGE_LAYOUT_VERSION)
            .build()
            .context("Failed to build oci-layout")?;
        write_new_json(&self.root.join(OCI_LAYOUT_FILE), &layout)?;

        Ok(index)
    }
}

/// Re-hashes every blob reachable from `index.json`.
///
/// Returns the number of blobs checked. Blobs shared between images are
/// checked once per reference.
pub fn verify_layout(root: &Path) -> Result<usize> {
    let index_path = root.join(INDEX_FILE);
    let index: ImageIndex = serde_json::from_slice(
        &fs::read(&index_path)
            .with_context(|| format!("Failed to read {}", index_path.display()))?,
    )
    .with_context(|| format!("Failed to parse {}", index_path.display()))?;

    let store = BlobStore::new(root);
    let mut checked = 0;

    for manifest_descriptor in index.manifests() {
        store.verify(manifest_descriptor.digest(), manifest_descriptor.size())?;
        checked += 1;

        let manifest_path = store.path_for(manifest_descriptor.digest());
        let manifest: ImageManifest = serde_json::from_slice(
            &fs::read(&manifest_path)
                .with_context(|| format!("Failed to read {}", manifest_path.display()))?,
        )
        .with_context(|| format!("Failed to parse {}", manifest_path.display()))?;

        let config = manifest.config();
        store.verify(config.digest(), config.size())?;
        checked += 1;

        for layer in manifest.layers() {
            store.verify(layer.digest(), layer.size())?;
            checked += 1;
        }
    }

    Ok(checked)
}
