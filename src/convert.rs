//! End-to-end conversion of a `docker save` archive into an OCI image layout.

use crate::compression;
use crate::error::ConvertError;
use crate::extract::{Extractor, UnknownEntryPolicy};
use crate::layout::{verify_layout, LayoutWriter};
use crate::manifest::{read_manifest, MANIFEST_FILE_NAME};
use crate::notifier::Notifier;
use anyhow::{anyhow, Context, Result};
use oci_spec::image::ImageIndex;
use std::fs;
use std::io::{self, Read};
use std::path::Path;

const DEST_DIR_MODE: u32 = 0o700;

#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    pub unknown_entries: UnknownEntryPolicy,
    /// Re-hash every blob once the layout is written.
    pub verify: bool,
}

#[cfg(unix)]
fn create_destination(dest: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(DEST_DIR_MODE)
        .create(dest)
}

#[cfg(not(unix))]
fn create_destination(dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)
}

/// Creates `dest`, failing if anything (even a dangling link) is already there.
pub fn prepare_destination(dest: &Path) -> Result<()> {
    match fs::symlink_metadata(dest) {
        Ok(_) => Err(ConvertError::DestinationExists(dest.to_path_buf()).into()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => create_destination(dest)
            .with_context(|| format!("Failed to create destination: {}", dest.display())),
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("Failed to inspect destination: {}", dest.display()))),
    }
}

pub struct Converter {
    options: ConvertOptions,
    notifier: Notifier,
}

impl Converter {
    pub fn new(options: ConvertOptions, notifier: Notifier) -> Self {
        Self { options, notifier }
    }

    /// Converts the archive read from `input` into a new layout at `dest`.
    ///
    /// `dest` must not exist. The archive is unpacked into a temporary
    /// directory that is removed when this returns, whether or not the
    /// conversion succeeded. A failed conversion may leave a partial layout
    /// behind in `dest`.
    pub fn convert<R: Read>(&self, input: R, dest: &Path) -> Result<ImageIndex> {
        let result = self.run(input, dest);
        self.notifier.finish();
        result
    }

    fn run<R: Read>(&self, input: R, dest: &Path) -> Result<ImageIndex> {
        prepare_destination(dest)?;

        let scratch = tempfile::Builder::new()
            .prefix("docker2oci-")
            .tempdir()
            .context("Failed to create scratch directory")?;
        self.notifier.debug(&format!(
            "Unpacking into scratch directory: {}",
            scratch.path().display()
        ));

        self.notifier.info("Reading image archive...");
        let (envelope, reader) = compression::decompress(input)?;
        self.notifier
            .debug(&format!("Archive compression: {}", envelope));

        let stats = Extractor::new(self.options.unknown_entries)
            .unpack(reader, scratch.path())
            .context("Failed to extract image archive")?;
        self.notifier.trace(&format!("Extraction stats: {:?}", stats));
        if stats.skipped > 0 {
            self.notifier.warn(&format!(
                "Skipped {} unsupported archive entries",
                stats.skipped
            ));
        }

        let manifest_path = scratch.path().join(MANIFEST_FILE_NAME);
        if !manifest_path.is_file() {
            return Err(anyhow!(
                "Invalid image archive: {} not found",
                MANIFEST_FILE_NAME
            ));
        }
        let entries = read_manifest(&manifest_path)?;

        let mut writer = LayoutWriter::create(dest, &self.notifier)?;
        for (i, entry) in entries.iter().enumerate() {
            self.notifier.info(&format!(
                "Converting image {}/{} ({})",
                i + 1,
                entries.len(),
                entry.config
            ));
            writer
                .add_image(scratch.path(), entry)
                .with_context(|| format!("Failed to convert image {}", entry.config))?;
        }

        self.notifier.info("Writing index...");
        let index = writer.finish()?;

        if self.options.verify {
            self.notifier.info("Verifying blobs...");
            let checked = verify_layout(dest)?;
            self.notifier
                .debug(&format!("Verified {} blob references", checked));
        }

        Ok(index)
    }
}
