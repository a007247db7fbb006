// The character book, config/characters.yaml.
// Like config.toml, it's read from disk every time; editing a character takes effect on the next request.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    error::StudioError,
    utils::safe_component,
    workflow::{NodeRoles, Workflow},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    /// Filled in from the YAML key.
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub physical_description: String,
    #[serde(default)]
    pub personality: String,
    /// Older character files have a single combined description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub workflow_file: PathBuf,
    #[serde(default)]
    pub nodes: NodeRoles,
}

impl Character {
    /// The name as used for directories and filenames.
    pub fn directory_name(&self) -> String {
        safe_component(&self.name)
    }

    /// Physical description, falling back to the legacy combined description.
    pub fn physical(&self) -> &str {
        if self.physical_description.is_empty() && self.personality.is_empty() {
            &self.description
        } else {
            &self.physical_description
        }
    }

    pub fn workflow_path(&self, base_dir: &Path) -> PathBuf {
        if self.workflow_file.is_absolute() {
            self.workflow_file.clone()
        } else {
            base_dir.join(&self.workflow_file)
        }
    }

    pub fn load_template(&self, base_dir: &Path) -> Result<Workflow> {
        Workflow::load(&self.workflow_path(base_dir))
    }
}

#[derive(Debug, Clone, Default)]
pub struct CharacterBook {
    characters: IndexMap<String, Character>,
}

impl CharacterBook {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Error reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Error parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        // An empty file parses as null.
        let characters: Option<IndexMap<String, Character>> = serde_yaml::from_str(text)?;
        let mut characters = characters.unwrap_or_default();
        for (name, character) in characters.iter_mut() {
            character.name = name.clone();
        }
        Ok(Self { characters })
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.characters.keys()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }

    /// Looks up a character by name. Unknown names get a suggestion if one is close enough.
    pub fn get(&self, name: &str) -> Result<&Character> {
        if let Some(character) = self.characters.get(name) {
            return Ok(character);
        }
        let suggestion = self
            .characters
            .keys()
            .map(|candidate| (strsim::levenshtein(name, candidate), candidate))
            .min_by_key(|(distance, _)| *distance)
            .filter(|(distance, _)| *distance <= 3)
            .map(|(_, candidate)| candidate.clone());
        bail!(StudioError::UnknownCharacter {
            name: name.to_owned(),
            suggestion,
        })
    }
}
