use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::{error::StudioError, utils::safe_component};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterAccess {
    pub can_generate: bool,
    pub can_browse: bool,
}

impl CharacterAccess {
    pub const FULL: CharacterAccess = CharacterAccess {
        can_generate: true,
        can_browse: true,
    };
}

/// What a single user may do, as resolved from the accounts database.
/// This is the only view of users the generation code gets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Permissions {
    pub username: String,
    /// Admins. Everything is allowed.
    pub unrestricted: bool,
    pub can_delete_files: bool,
    pub characters: BTreeMap<String, CharacterAccess>,
    pub checkpoints: BTreeSet<String>,
    pub loras: BTreeSet<String>,
}

impl Permissions {
    pub fn unrestricted(username: &str) -> Self {
        Self {
            username: username.to_owned(),
            unrestricted: true,
            can_delete_files: true,
            ..Default::default()
        }
    }

    fn access(&self, character: &str) -> CharacterAccess {
        if self.unrestricted {
            return CharacterAccess::FULL;
        }
        self.characters.get(character).copied().unwrap_or_default()
    }

    pub fn can_generate(&self, character: &str) -> bool {
        self.access(character).can_generate
    }

    pub fn can_browse(&self, character: &str) -> bool {
        self.access(character).can_browse
    }

    /// Archive folders are named after characters, made safe for paths.
    pub fn can_browse_directory(&self, directory: &str) -> bool {
        self.unrestricted
            || self
                .characters
                .keys()
                .any(|name| safe_component(name) == directory && self.can_browse(name))
    }

    pub fn require_generate(&self, character: &str) -> Result<()> {
        if !self.can_generate(character) {
            bail!(StudioError::PermissionDenied(format!(
                "{} may not generate images of {}",
                self.username, character
            )));
        }
        Ok(())
    }

    pub fn require_delete(&self) -> Result<()> {
        if !(self.unrestricted || self.can_delete_files) {
            bail!(StudioError::PermissionDenied(format!(
                "{} may not delete files",
                self.username
            )));
        }
        Ok(())
    }

    pub fn check_checkpoint(&self, name: &str) -> Result<()> {
        if !(self.unrestricted || self.checkpoints.contains(name)) {
            bail!(StudioError::PermissionDenied(format!(
                "checkpoint {} is not available to {}",
                name, self.username
            )));
        }
        Ok(())
    }

    pub fn check_lora(&self, name: &str) -> Result<()> {
        if !(self.unrestricted || self.loras.contains(name)) {
            bail!(StudioError::PermissionDenied(format!(
                "LoRA {} is not available to {}",
                name, self.username
            )));
        }
        Ok(())
    }
}
