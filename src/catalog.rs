// Model files the backend can load, as found under its models directory.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use serde::Serialize;
use walkdir::WalkDir;

pub const MODEL_EXTENSION: &str = "safetensors";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelCatalog {
    pub checkpoints: Vec<String>,
    pub loras: Vec<String>,
}

impl ModelCatalog {
    /// Checkpoints sit directly in `checkpoints/`; LoRAs may be nested under `loras/`.
    /// A missing directory is an empty list.
    pub fn scan(models_dir: &Path) -> Self {
        let checkpoints = scan(&models_dir.join("checkpoints"), false);
        let loras = scan(&models_dir.join("loras"), true);
        log::debug!(
            "Found {} checkpoints and {} LoRAs in {}",
            checkpoints.len(),
            loras.len(),
            models_dir.display()
        );
        Self { checkpoints, loras }
    }
}

fn is_model(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(MODEL_EXTENSION))
}

/// Relative paths, `/`-separated, sorted.
fn scan(dir: &Path, recursive: bool) -> Vec<String> {
    let mut walker = WalkDir::new(dir).min_depth(1);
    if !recursive {
        walker = walker.max_depth(1);
    }
    let found: BTreeSet<String> = walker
        .follow_links(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && is_model(entry.path()))
        .filter_map(|entry| {
            let relative: PathBuf = entry.path().strip_prefix(dir).ok()?.to_path_buf();
            Some(relative.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    found.into_iter().collect()
}
