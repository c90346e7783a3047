//! `manifest.json` of a `docker save` archive.

use crate::blob::parse_digest;
use anyhow::{Context, Result};
use oci_spec::image::Digest;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::Path;

pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// One image of the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path of the image config, relative to the archive root.
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(default, rename = "RepoTags", deserialize_with = "null_as_empty")]
    pub repo_tags: Vec<String>,
    /// Layer tarballs, oldest first, aligned with `rootfs.diff_ids`.
    #[serde(default, rename = "Layers", deserialize_with = "null_as_empty")]
    pub layers: Vec<String>,
    #[serde(default, rename = "Parent", skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// Untagged images are saved with `"RepoTags": null`.
fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl ManifestEntry {
    pub fn parent_digest(&self) -> Result<Option<Digest>> {
        self.parent
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(parse_digest)
            .transpose()
    }

    /// Value for the `org.opencontainers.image.ref.name` annotation.
    ///
    /// Every `name:tag` entry overwrites the previous one, so the last tag
    /// wins; entries that do not split into exactly two parts on `:` are
    /// skipped.
    pub fn ref_name(&self) -> Option<&str> {
        let mut ref_name = None;
        for tag in &self.repo_tags {
            let parts: Vec<&str> = tag.split(':').collect();
            if parts.len() != 2 {
                continue;
            }
            ref_name = Some(parts[1]);
        }
        ref_name
    }
}

/// Parses the entries of `manifest.json`. An empty array is valid and
/// describes no images.
pub fn parse_manifest(content: &str) -> Result<Vec<ManifestEntry>> {
    serde_json::from_str(content).context("Failed to parse manifest.json")
}

pub fn read_manifest<P: AsRef<Path>>(path: P) -> Result<Vec<ManifestEntry>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
    parse_manifest(&content)
}
