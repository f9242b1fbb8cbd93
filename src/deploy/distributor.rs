//! Content diffing and file distribution.
//!
//! [`ServerFileDistributor`] computes the minimal set of changed files
//! between a module's logical archive entries and a previously deployed
//! directory, copying what changed and classifying every copied path into
//! an [`AppChanges`] descriptor. [`InitialServerFileDistributor`] handles
//! first-time placement where everything is copied unconditionally.

use crate::deploy::changes::{AppChanges, ModuleDescriptors};
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// One logical archive entry of a module: a relative path plus the file
/// backing it in the build output.
#[derive(Debug, Clone)]
pub struct ModuleEntry {
    /// Destination-relative path of the entry
    pub relative: PathBuf,
    /// Source file holding the entry's content
    pub source: PathBuf,
}

impl ModuleEntry {
    /// Create an entry
    pub fn new(relative: impl Into<PathBuf>, source: impl Into<PathBuf>) -> Self {
        Self {
            relative: relative.into(),
            source: source.into(),
        }
    }
}

/// How the distributor decides whether an existing destination file is stale
#[derive(Debug, Clone)]
pub enum DiffMode {
    /// Copy when the source is newer than the destination
    Timestamps,
    /// Copy exactly the listed relative paths; used by the deploy-on-save
    /// pass where the build reports the changed artifacts explicitly
    ArtifactList(HashSet<PathBuf>),
}

/// Incremental distributor: copies only what changed and classifies it.
pub struct ServerFileDistributor;

impl ServerFileDistributor {
    /// Diff `entries` against `dest_dir`, copy changed content, and return
    /// the classified change set.
    ///
    /// Destination files with no source counterpart are recorded as
    /// removals but left in place; whether to delete them is the caller's
    /// decision.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Distribution`] when the destination cannot be
    /// scanned or a changed file cannot be copied. A failure aborts this
    /// target's distribution only.
    pub fn distribute(
        entries: &[ModuleEntry],
        dest_dir: &Path,
        descriptors: &ModuleDescriptors,
        mode: &DiffMode,
    ) -> Result<AppChanges> {
        let existing = scan_destination(dest_dir)?;
        let mut to_delete: HashSet<PathBuf> = existing.keys().cloned().collect();
        let mut changes = AppChanges::new();

        for entry in entries {
            to_delete.remove(&entry.relative);

            let stale = match existing.get(&entry.relative) {
                None => true,
                Some(dest_mtime) => match mode {
                    DiffMode::Timestamps => source_mtime(&entry.source)? > *dest_mtime,
                    DiffMode::ArtifactList(artifacts) => artifacts.contains(&entry.relative),
                },
            };
            if !stale {
                continue;
            }

            copy_entry(entry, dest_dir)?;
            changes.record_changed(&entry.relative, descriptors);
            tracing::trace!(path = %entry.relative.display(), "Copied changed entry");
        }

        for leftover in to_delete {
            changes.record_removed(&leftover);
        }

        tracing::debug!(
            changed = changes.changed_files().len(),
            removed = changes.removed_files().len(),
            dest = %dest_dir.display(),
            "Computed distribution diff"
        );
        Ok(changes)
    }
}

/// First-time distributor: copies the whole module into place.
pub struct InitialServerFileDistributor;

impl InitialServerFileDistributor {
    /// Copy every entry into `dest_dir`, neutralizing stale locked archives
    /// that cannot be removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Distribution`] when a file cannot be copied.
    pub fn distribute(entries: &[ModuleEntry], dest_dir: &Path) -> Result<()> {
        let existing = scan_destination(dest_dir)?;
        let fresh: HashSet<&PathBuf> = entries.iter().map(|e| &e.relative).collect();

        // Stale leftovers from an earlier deployment must not shadow the new
        // content. A locked archive that cannot be deleted (file locking on
        // Windows) is truncated to a zero-byte placeholder instead.
        for relative in existing.keys() {
            if !fresh.contains(relative) {
                remove_or_neutralize(&dest_dir.join(relative));
            }
        }

        for entry in entries {
            copy_entry(entry, dest_dir)?;
        }

        tracing::debug!(
            entries = entries.len(),
            dest = %dest_dir.display(),
            "Completed initial distribution"
        );
        Ok(())
    }
}

/// Map of destination-relative paths to their modification times
fn scan_destination(dest_dir: &Path) -> Result<HashMap<PathBuf, SystemTime>> {
    let mut existing = HashMap::new();
    if !dest_dir.exists() {
        fs::create_dir_all(dest_dir).map_err(|e| {
            Error::Distribution(format!(
                "Failed to create destination directory {}: {}",
                dest_dir.display(),
                e
            ))
        })?;
        return Ok(existing);
    }

    for entry in WalkDir::new(dest_dir).into_iter() {
        let entry = entry.map_err(|e| {
            Error::Distribution(format!(
                "Failed to scan destination {}: {}",
                dest_dir.display(),
                e
            ))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dest_dir)
            .map_err(|e| Error::Distribution(format!("Destination scan escaped root: {}", e)))?
            .to_path_buf();
        let metadata = entry.metadata().map_err(|e| {
            Error::Distribution(format!("Failed to stat {}: {}", entry.path().display(), e))
        })?;
        let mtime = metadata.modified().map_err(|e| {
            Error::Distribution(format!("Failed to stat {}: {}", entry.path().display(), e))
        })?;
        existing.insert(relative, mtime);
    }
    Ok(existing)
}

fn source_mtime(source: &Path) -> Result<SystemTime> {
    fs::metadata(source)
        .and_then(|m| m.modified())
        .map_err(|e| Error::Distribution(format!("Failed to stat {}: {}", source.display(), e)))
}

fn copy_entry(entry: &ModuleEntry, dest_dir: &Path) -> Result<()> {
    let dest = dest_dir.join(&entry.relative);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            Error::Distribution(format!(
                "Failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }
    fs::copy(&entry.source, &dest).map_err(|e| {
        Error::Distribution(format!(
            "Failed to copy {} to {}: {}",
            entry.source.display(),
            dest.display(),
            e
        ))
    })?;
    Ok(())
}

/// Remove a stale destination file. When removal fails for an archive that
/// the OS still holds open, overwrite it with a zero-byte placeholder so the
/// server cannot pick up the stale content.
fn remove_or_neutralize(path: &Path) {
    if fs::remove_file(path).is_ok() {
        return;
    }
    let is_archive = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jar" | "zip" | "war" | "ear"))
        .unwrap_or(false);
    if is_archive {
        match fs::write(path, b"") {
            Ok(()) => {
                tracing::warn!(path = %path.display(), "Stale archive is locked, truncated to placeholder")
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to neutralize stale archive")
            }
        }
    } else {
        tracing::warn!(path = %path.display(), "Failed to remove stale destination file");
    }
}
