//! Hardened tar extraction.
//!
//! [`Extractor::unpack`] materializes an untrusted tar stream under a
//! destination directory. Every entry name and every link target is resolved
//! inside the destination by walking it one component at a time, expanding
//! links that were already extracted, so nothing can be created outside the
//! destination through `..`, absolute names or symlink chains. Absolute link
//! targets are taken from the destination root, so `/usr/bin/env` inside a
//! layer means `<dest>/usr/bin/env`. Any violation or I/O failure aborts the
//! whole extraction.
//!
//! Directory modes and modification times are applied in a final pass,
//! after the stream is exhausted: files written into a directory would
//! otherwise bump its mtime, and a read-only directory would block them.

use crate::error::ConvertError;
use anyhow::{anyhow, Context, Result};
use filetime::FileTime;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tar_rs as tar;

/// Symlink expansions allowed while resolving a single path.
const MAX_LINK_EXPANSIONS: usize = 40;

/// Mode used for directories created before their own entry is seen.
const DEFAULT_DIR_MODE: u32 = 0o755;

/// What to do with entries that are neither directories, regular files,
/// hard links, symlinks nor global headers (devices, fifos, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownEntryPolicy {
    /// Log a warning and move on.
    #[default]
    Warn,
    /// Fail the extraction.
    Reject,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractStats {
    pub directories: usize,
    pub files: usize,
    pub hardlinks: usize,
    pub symlinks: usize,
    pub skipped: usize,
}

struct PendingDir {
    path: PathBuf,
    mode: u32,
    mtime: u64,
}

enum Step {
    Root,
    Parent,
    Name(OsString),
}

fn steps(path: &Path) -> Vec<Step> {
    path.components()
        .filter_map(|comp| match comp {
            Component::CurDir => None,
            Component::ParentDir => Some(Step::Parent),
            Component::Normal(c) => Some(Step::Name(c.to_os_string())),
            Component::RootDir | Component::Prefix(_) => Some(Step::Root),
        })
        .collect()
}

/// Resolves `rel` against `root` without ever leaving it.
///
/// `root` must already be canonical and `rel` must be relative; an absolute
/// `rel` is reported as outside. Symlinks found on disk along the way are
/// expanded relative to their own directory, or to `root` when their target
/// is absolute. The last component is only expanded when `follow_final` is
/// set. Returns `Ok(None)` if the path, or any link met while resolving it,
/// points outside `root`.
pub fn resolve_in_root(root: &Path, rel: &Path, follow_final: bool) -> Result<Option<PathBuf>> {
    let initial = steps(rel);
    if initial.iter().any(|s| matches!(s, Step::Root)) {
        return Ok(None);
    }
    walk(root, rel, initial, follow_final)
}

/// Resolves a link target found in an archive.
///
/// A relative `link` is taken from `base`, a directory relative to `root`.
/// An absolute `link` restarts at `root`, the way it would inside a
/// container using `root` as its filesystem.
pub fn resolve_link_target(
    root: &Path,
    base: &Path,
    link: &Path,
    follow_final: bool,
) -> Result<Option<PathBuf>> {
    let mut initial = steps(base);
    if initial.iter().any(|s| matches!(s, Step::Root)) {
        return Ok(None);
    }
    initial.extend(steps(link));
    walk(root, link, initial, follow_final)
}

fn walk(
    root: &Path,
    rel: &Path,
    initial: Vec<Step>,
    follow_final: bool,
) -> Result<Option<PathBuf>> {
    let mut pending: VecDeque<Step> = initial.into();
    let mut resolved = PathBuf::new();
    let mut expansions = 0;

    while let Some(step) = pending.pop_front() {
        let name = match step {
            Step::Root => {
                resolved.clear();
                continue;
            }
            Step::Parent => {
                if !resolved.pop() {
                    return Ok(None);
                }
                continue;
            }
            Step::Name(name) => name,
        };

        if !pending.is_empty() || follow_final {
            let candidate = root.join(&resolved).join(&name);
            let is_link = fs::symlink_metadata(&candidate)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);

            if is_link {
                expansions += 1;
                if expansions > MAX_LINK_EXPANSIONS {
                    return Err(ConvertError::TooManyLinks(rel.to_path_buf()).into());
                }
                let target = fs::read_link(&candidate)
                    .with_context(|| format!("Failed to read link: {}", candidate.display()))?;
                for s in steps(&target).into_iter().rev() {
                    pending.push_front(s);
                }
                continue;
            }
        }

        resolved.push(name);
    }

    Ok(Some(root.join(resolved)))
}

/// Like [`resolve_in_root`], failing with
/// [`ConvertError::ContainmentViolation`] instead of returning `None`.
pub fn contained_path(root: &Path, rel: &Path, follow_final: bool) -> Result<PathBuf> {
    resolve_in_root(root, rel, follow_final)?.ok_or_else(|| {
        ConvertError::ContainmentViolation {
            entry: rel.to_path_buf(),
            root: root.to_path_buf(),
        }
        .into()
    })
}

#[cfg(unix)]
fn create_dir_all(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(DEFAULT_DIR_MODE)
        .create(path)
}

#[cfg(not(unix))]
fn create_dir_all(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_file_mode(file: &File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_file_mode(_file: &File, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Removes whatever non-directory sits at `path`, so that a planted link is
/// replaced rather than followed.
fn remove_existing(path: &Path) -> Result<()> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if !meta.is_dir() {
            log::debug!("Replacing existing entry at: {}", path.display());
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove existing file: {}", path.display()))?;
        }
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

pub struct Extractor {
    unknown_entries: UnknownEntryPolicy,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(UnknownEntryPolicy::default())
    }
}

impl Extractor {
    pub fn new(unknown_entries: UnknownEntryPolicy) -> Self {
        Self { unknown_entries }
    }

    /// Extracts a decompressed tar stream into `dest`, which must exist.
    pub fn unpack<R: Read>(&self, reader: R, dest: &Path) -> Result<ExtractStats> {
        let root = dest
            .canonicalize()
            .with_context(|| format!("Failed to resolve destination: {}", dest.display()))?;

        let mut archive = tar::Archive::new(reader);
        let mut stats = ExtractStats::default();
        let mut dirs: Vec<PendingDir> = Vec::new();

        for entry_result in archive.entries().context("Failed to read tar archive")? {
            let mut entry = entry_result.context("error advancing tar stream")?;

            let (kind, mode, mtime) = {
                let header = entry.header();
                (
                    header.entry_type(),
                    header.mode().context("Invalid mode in tar header")? & 0o7777,
                    header.mtime().context("Invalid mtime in tar header")?,
                )
            };
            let name = entry
                .path()
                .context("Failed to get entry path")?
                .into_owned();

            if kind == tar::EntryType::XGlobalHeader {
                log::debug!("Global extended header found, treating as end of archive");
                break;
            }

            let target = contained_path(&root, &name, false)?;

            match kind {
                tar::EntryType::Directory => {
                    let is_dir = fs::symlink_metadata(&target)
                        .map(|m| m.is_dir())
                        .unwrap_or(false);
                    if !is_dir {
                        remove_existing(&target)?;
                        log::debug!("Creating directory: {}", target.display());
                        create_dir_all(&target).with_context(|| {
                            format!("error creating directory: {}", target.display())
                        })?;
                    }
                    dirs.push(PendingDir {
                        path: target,
                        mode,
                        mtime,
                    });
                    stats.directories += 1;
                }
                tar::EntryType::Regular | tar::EntryType::Continuous => {
                    if target == root {
                        return Err(ConvertError::ContainmentViolation { entry: name, root }.into());
                    }
                    ensure_parent(&target)?;
                    remove_existing(&target)?;

                    log::trace!("Creating file: {}", target.display());
                    let mut file = OpenOptions::new()
                        .create(true)
                        .write(true)
                        .truncate(true)
                        .open(&target)
                        .with_context(|| format!("unable to open file: {}", target.display()))?;
                    io::copy(&mut entry, &mut file)
                        .with_context(|| format!("unable to copy: {}", target.display()))?;
                    set_file_mode(&file, mode)
                        .with_context(|| format!("error changing mode: {}", target.display()))?;
                    stats.files += 1;
                }
                tar::EntryType::Link => {
                    let link = entry
                        .link_name()
                        .context("Failed to get hardlink target")?
                        .ok_or_else(|| anyhow!("hardlink without target: {}", name.display()))?
                        .into_owned();

                    let source = resolve_link_target(&root, Path::new(""), &link, false)?
                        .ok_or_else(|| {
                            ConvertError::InvalidHardlink {
                                path: name.clone(),
                                target: link.clone(),
                            }
                        })?;

                    ensure_parent(&target)?;
                    remove_existing(&target)?;
                    log::trace!("Linking {} -> {}", target.display(), source.display());
                    fs::hard_link(&source, &target).with_context(|| {
                        format!(
                            "Failed to create hardlink {} -> {}",
                            target.display(),
                            source.display()
                        )
                    })?;
                    stats.hardlinks += 1;
                }
                tar::EntryType::Symlink => {
                    let link = entry
                        .link_name()
                        .context("Failed to get symlink target")?
                        .ok_or_else(|| anyhow!("symlink without target: {}", name.display()))?
                        .into_owned();

                    let parent = target
                        .parent()
                        .and_then(|p| p.strip_prefix(&root).ok())
                        .unwrap_or_else(|| Path::new(""));
                    if resolve_link_target(&root, parent, &link, true)?.is_none() {
                        return Err(ConvertError::InvalidSymlink {
                            path: name,
                            target: link,
                        }
                        .into());
                    }

                    ensure_parent(&target)?;
                    remove_existing(&target)?;
                    Self::symlink(&link, &target)?;
                    stats.symlinks += 1;
                }
                other => match self.unknown_entries {
                    UnknownEntryPolicy::Warn => {
                        log::warn!(
                            "Skipping unsupported entry type {:?}: {}",
                            other,
                            name.display()
                        );
                        stats.skipped += 1;
                    }
                    UnknownEntryPolicy::Reject => {
                        return Err(ConvertError::UnsupportedEntryType {
                            path: name,
                            kind: format!("{:?}", other),
                        }
                        .into());
                    }
                },
            }
        }

        // Access time is not restored, only the modification time.
        let now = FileTime::now();
        for dir in &dirs {
            set_mode(&dir.path, dir.mode)
                .with_context(|| format!("error changing mode: {}", dir.path.display()))?;
            let mtime = FileTime::from_unix_time(dir.mtime as i64, 0);
            filetime::set_file_times(&dir.path, now, mtime)
                .with_context(|| format!("error changing time: {}", dir.path.display()))?;
        }

        log::debug!(
            "Extracted {} directories, {} files, {} hardlinks, {} symlinks ({} skipped)",
            stats.directories,
            stats.files,
            stats.hardlinks,
            stats.symlinks,
            stats.skipped
        );

        Ok(stats)
    }

    #[cfg(unix)]
    fn symlink(link: &Path, target: &Path) -> Result<()> {
        log::trace!("Symlinking {} -> {}", target.display(), link.display());
        std::os::unix::fs::symlink(link, target).with_context(|| {
            format!(
                "Failed to create symlink {} -> {}",
                target.display(),
                link.display()
            )
        })
    }

    #[cfg(not(unix))]
    fn symlink(link: &Path, target: &Path) -> Result<()> {
        log::warn!(
            "Symlink support not implemented on this platform: {} -> {}",
            target.display(),
            link.display()
        );
        Ok(())
    }
}
