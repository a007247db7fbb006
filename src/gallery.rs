// Browsing and pruning the image archive.
// Every path a caller hands us is relative to the archive root and must stay inside it.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{info, warn};
use serde::Serialize;
use walkdir::WalkDir;

use crate::{error::StudioError, permissions::Permissions, utils::human_size};

pub const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "gif"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    // Folders sort first.
    Folder,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GalleryEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Relative to the archive root, `/`-separated.
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageStats {
    pub images: u64,
    pub bytes: u64,
    pub size: String,
}

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// Normalizes `requested` against the root without touching the filesystem.
/// Returns the components below the root; anything that climbs out is rejected.
fn confine(requested: &str) -> Result<Vec<String>> {
    let mut parts: Vec<String> = vec![];
    for component in Path::new(requested.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    bail!(StudioError::InvalidPath(requested.to_owned()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                bail!(StudioError::InvalidPath(requested.to_owned()))
            }
        }
    }
    Ok(parts)
}

#[derive(Debug, Clone)]
pub struct Gallery {
    root: PathBuf,
}

impl Gallery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, parts: &[String]) -> PathBuf {
        parts.iter().fold(self.root.clone(), |path, part| path.join(part))
    }

    /// Restricted users only see the character folders they may browse.
    fn check_browse(permissions: &Permissions, parts: &[String]) -> Result<()> {
        if let Some(top) = parts.first() {
            if !permissions.can_browse_directory(top) {
                bail!(StudioError::PermissionDenied(format!(
                    "{} may not browse {}",
                    permissions.username, top
                )));
            }
        }
        Ok(())
    }

    pub fn list(&self, permissions: &Permissions, path: &str) -> Result<Vec<GalleryEntry>> {
        let parts = confine(path)?;
        Self::check_browse(permissions, &parts)?;
        let dir = self.resolve(&parts);
        let mut entries = vec![];
        let listing = std::fs::read_dir(&dir).with_context(|| format!("failed to list {}", dir.display()))?;
        for item in listing {
            let item = item?;
            let name = item.file_name().to_string_lossy().into_owned();
            let kind = if item.file_type()?.is_dir() {
                if parts.is_empty() && !permissions.can_browse_directory(&name) {
                    continue;
                }
                EntryKind::Folder
            } else if is_image(&item.path()) {
                EntryKind::File
            } else {
                continue;
            };
            let mut relative = parts.clone();
            relative.push(name.clone());
            entries.push(GalleryEntry {
                name,
                kind,
                path: relative.join("/"),
            });
        }
        entries.sort_by(|a, b| (a.kind, &a.name).cmp(&(b.kind, &b.name)));
        Ok(entries)
    }

    /// Deletes `files` from the folder at `path`. Names that escape, don't exist or aren't files are skipped.
    pub fn delete(&self, permissions: &Permissions, path: &str, files: &[String]) -> Result<DeleteReport> {
        permissions.require_delete()?;
        let parts = confine(path)?;
        Self::check_browse(permissions, &parts)?;
        let base = parts.join("/");
        let mut report = DeleteReport::default();
        for file in files {
            let target = match confine(&format!("{}/{}", base, file)) {
                Ok(target) if target.len() > parts.len() && target.starts_with(&parts) => self.resolve(&target),
                _ => {
                    warn!("Refusing to delete {:?} from {:?}", file, path);
                    report.skipped.push(file.clone());
                    continue;
                }
            };
            if !target.is_file() {
                report.skipped.push(file.clone());
                continue;
            }
            std::fs::remove_file(&target).with_context(|| format!("failed to delete {}", target.display()))?;
            info!("{} deleted {}", permissions.username, target.display());
            report.deleted.push(file.clone());
        }
        Ok(report)
    }
}

/// Image count and total size across the given directories. Missing directories count as empty.
pub fn stats(dirs: &[PathBuf]) -> StorageStats {
    let mut stats = StorageStats::default();
    for dir in dirs {
        for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() || !is_image(entry.path()) {
                continue;
            }
            stats.images += 1;
            stats.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    stats.size = human_size(stats.bytes);
    stats
}
