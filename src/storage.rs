// Everything that ends up on disk outside the database:
// the per-user latest image, the per-character archive, the last-seed file, and per-session temporary workflows.
// All writes go through write_atomic, so a reader never sees half a file.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use log::{debug, info, warn};

use crate::{characters::Character, config::PathsConfig, utils, workflow::Workflow};

pub const LATEST_IMAGE_NAME: &str = "latest_image.png";

/// Writes to a temporary file next to `path`, then renames it into place.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let mut file = tempfile::NamedTempFile::new_in(dir).context("failed to create temporary file")?;
    file.write_all(data).context("failed to write temporary file")?;
    file.persist(path)
        .with_context(|| format!("failed to move file into place at {}", path.display()))?;
    Ok(())
}

/// The single shared last-seed file. Last writer wins.
#[derive(Debug, Clone)]
pub struct SeedStore {
    path: PathBuf,
}

impl SeedStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Missing, empty or garbled files all read as "no seed".
    pub fn load(&self) -> Option<i64> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) => {
                debug!("No last seed at {}: {}", self.path.display(), e);
                return None;
            }
        };
        let text = text.trim();
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            warn!("Ignoring invalid last seed {:?}", text);
            return None;
        }
        text.parse().ok()
    }

    /// Returns false (and writes nothing) for the random-seed marker.
    pub fn save(&self, seed: i64) -> Result<bool> {
        if seed < 0 {
            debug!("Not saving seed {}", seed);
            return Ok(false);
        }
        write_atomic(&self.path, seed.to_string().as_bytes())
            .context("failed to save last seed")?;
        debug!("Saved last seed {}", seed);
        Ok(true)
    }
}

/// Patched workflows kept between "update options" and "generate", one per session and template.
#[derive(Debug, Clone)]
pub struct TempWorkflowStore {
    root: PathBuf,
}

impl TempWorkflowStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Session keys can be anything, so the directory is named by their hash.
    pub fn path_for(&self, session: &str, template: &Path) -> PathBuf {
        let file_name = template
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workflow.json".to_string());
        self.root
            .join(&utils::hash(session)[..16])
            .join(utils::safe_component(&file_name))
    }

    pub fn save(&self, session: &str, template: &Path, workflow: &Workflow) -> Result<PathBuf> {
        let path = self.path_for(session, template);
        write_atomic(&path, workflow.to_json_pretty()?.as_bytes())
            .context("failed to save temporary workflow")?;
        info!("Saved temporary workflow to {}", path.display());
        Ok(path)
    }

    /// A missing or unreadable temporary workflow means "use the template".
    pub fn load(&self, session: &str, template: &Path) -> Option<Workflow> {
        let path = self.path_for(session, template);
        if !path.exists() {
            return None;
        }
        match Workflow::load(&path) {
            Ok(workflow) => Some(workflow),
            Err(e) => {
                warn!("Ignoring temporary workflow {}: {:#}", path.display(), e);
                None
            }
        }
    }

    pub fn clear(&self, session: &str, template: &Path) -> Result<bool> {
        let path = self.path_for(session, template);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
        Ok(true)
    }
}

/// Generated images: the per-user latest slot and the per-character archive.
#[derive(Debug, Clone)]
pub struct ImageArchive {
    images: PathBuf,
    latest: PathBuf,
}

impl ImageArchive {
    pub fn new(images: impl Into<PathBuf>, latest: impl Into<PathBuf>) -> Self {
        Self {
            images: images.into(),
            latest: latest.into(),
        }
    }

    pub fn from_config(paths: &PathsConfig) -> Self {
        Self::new(paths.images(), paths.latest())
    }

    pub fn latest_path(&self, user: &str) -> PathBuf {
        self.latest
            .join(utils::safe_component(user))
            .join(LATEST_IMAGE_NAME)
    }

    pub fn character_dir(&self, character: &Character) -> PathBuf {
        self.images.join(character.directory_name())
    }

    /// `<Name>_<YYYYmmdd_HHMMSS>[_<index>].png`; the index is only used for multi-image jobs.
    pub fn archive_path(&self, character: &Character, taken: NaiveDateTime, index: Option<usize>) -> PathBuf {
        let name = character.directory_name();
        let stamp = taken.format("%Y%m%d_%H%M%S");
        let file_name = match index {
            Some(index) => format!("{}_{}_{}.png", name, stamp, index),
            None => format!("{}_{}.png", name, stamp),
        };
        self.character_dir(character).join(file_name)
    }

    pub fn save_latest(&self, user: &str, png: &[u8]) -> Result<PathBuf> {
        let path = self.latest_path(user);
        write_atomic(&path, png).context("failed to save latest image")?;
        debug!("Saved latest image for {} to {}", user, path.display());
        Ok(path)
    }

    /// The archive is append-only. Two jobs finishing in the same second get a numbered suffix.
    pub fn save_archive(
        &self,
        character: &Character,
        png: &[u8],
        taken: NaiveDateTime,
        index: Option<usize>,
    ) -> Result<PathBuf> {
        let mut path = self.archive_path(character, taken, index);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut n = 1;
        while path.exists() {
            path.set_file_name(format!("{}-{}.png", stem, n));
            n += 1;
        }
        write_atomic(&path, png).context("failed to archive image")?;
        info!("Archived image to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characters::CharacterBook;
    use chrono::NaiveDate;

    fn alice() -> Character {
        let book = CharacterBook::load(Path::new("testdata/characters.yaml")).unwrap();
        book.get("Alice Liddell").unwrap().clone()
    }

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(12, 5, 7)
            .unwrap()
    }

    #[test]
    fn test_write_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/file.txt");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        // No temporary files left behind.
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_seed_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SeedStore::new(dir.path().join("last_seed.txt"));
        assert_eq!(store.load(), None);
        assert!(!store.save(-1).unwrap());
        assert_eq!(store.load(), None);
        assert!(store.save(123456789).unwrap());
        assert_eq!(store.load(), Some(123456789));
        assert!(!store.save(-1).unwrap());
        assert_eq!(store.load(), Some(123456789));
    }

    #[test]
    fn test_seed_store_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_seed.txt");
        let store = SeedStore::new(&path);
        for garbage in ["", "  ", "abc", "-5", "12x"] {
            std::fs::write(&path, garbage).unwrap();
            assert_eq!(store.load(), None, "{:?}", garbage);
        }
        std::fs::write(&path, "42\n").unwrap();
        assert_eq!(store.load(), Some(42));
    }

    #[test]
    fn test_temp_workflows() {
        let dir = tempfile::tempdir().unwrap();
        let store = TempWorkflowStore::new(dir.path());
        let template = Path::new("workflows/alice.json");
        let workflow = Workflow::load(Path::new("testdata/workflows/alice.json")).unwrap();

        assert!(store.load("session-1", template).is_none());
        let path = store.save("session-1", template, &workflow).unwrap();
        assert!(path.ends_with("alice.json"));
        assert_eq!(store.load("session-1", template), Some(workflow));
        // Sessions don't see each other's workflows.
        assert!(store.load("session-2", template).is_none());

        assert!(store.clear("session-1", template).unwrap());
        assert!(!store.clear("session-1", template).unwrap());
        assert!(store.load("session-1", template).is_none());
    }

    #[test]
    fn test_temp_workflow_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = TempWorkflowStore::new(dir.path());
        let template = Path::new("alice.json");
        let path = store.path_for("s", template);
        write_atomic(&path, b"{ not json").unwrap();
        assert!(store.load("s", template).is_none());
    }

    #[test]
    fn test_archive_paths() {
        let archive = ImageArchive::new("/data/images", "/data/latest");
        let alice = alice();
        assert_eq!(
            archive.archive_path(&alice, noon(), None),
            PathBuf::from("/data/images/Alice_Liddell/Alice_Liddell_20240309_120507.png")
        );
        assert_eq!(
            archive.archive_path(&alice, noon(), Some(2)),
            PathBuf::from("/data/images/Alice_Liddell/Alice_Liddell_20240309_120507_2.png")
        );
        assert_eq!(
            archive.latest_path("carol"),
            PathBuf::from("/data/latest/carol/latest_image.png")
        );
        assert_eq!(
            archive.latest_path("../root"),
            PathBuf::from("/data/latest/.._root/latest_image.png")
        );
    }

    #[test]
    fn test_archive_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ImageArchive::new(dir.path().join("images"), dir.path().join("latest"));
        let alice = alice();
        let first = archive.save_archive(&alice, b"first", noon(), None).unwrap();
        let second = archive.save_archive(&alice, b"second", noon(), None).unwrap();
        assert_ne!(first, second);
        assert!(second.ends_with("Alice_Liddell_20240309_120507-1.png"));
        assert_eq!(std::fs::read(first).unwrap(), b"first");
        assert_eq!(std::fs::read(second).unwrap(), b"second");

        let latest = archive.save_latest("carol", b"one").unwrap();
        archive.save_latest("carol", b"two").unwrap();
        assert_eq!(std::fs::read(latest).unwrap(), b"two");
    }
}
