// Applies a user's generation options to a character's workflow template.
//
// The template is never touched; every patch works on a copy. Roles that the workflow doesn't
// have (no seed node, no LoRA stack, ...) are skipped rather than treated as errors, since not
// every character's workflow has every knob.

use anyhow::{bail, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    permissions::Permissions,
    workflow::{NodeRoles, Role, Workflow},
};

/// Checkpoint value meaning "whatever the template says".
pub const DEFAULT_CHECKPOINT: &str = "default";

/// Seed value meaning "let the backend pick".
pub const RANDOM_SEED: i64 = -1;

/// Options as posted by the advanced-options panel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOptions {
    #[serde(default = "default_checkpoint")]
    pub checkpoint_model: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub guidance: Option<f64>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub use_last_seed: bool,
    #[serde(default)]
    pub loras: Vec<LoraSelection>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoraSelection {
    pub name: String,
    #[serde(default = "default_strength")]
    pub strength: f64,
}

fn default_checkpoint() -> String {
    DEFAULT_CHECKPOINT.to_string()
}

fn default_strength() -> f64 {
    1.0
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            checkpoint_model: default_checkpoint(),
            width: None,
            height: None,
            guidance: None,
            seed: None,
            use_last_seed: false,
            loras: vec![],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeedChoice {
    Explicit(i64),
    UseLast,
    Random,
}

impl GenerationOptions {
    pub fn seed_choice(&self) -> SeedChoice {
        if self.use_last_seed {
            SeedChoice::UseLast
        } else {
            match self.seed {
                Some(seed) => SeedChoice::Explicit(seed),
                None => SeedChoice::Random,
            }
        }
    }

    fn uses_default_checkpoint(&self) -> bool {
        let name = self.checkpoint_model.trim();
        name.is_empty() || name == DEFAULT_CHECKPOINT
    }

    /// User-selected LoRAs that actually name something.
    fn selected_loras(&self) -> impl Iterator<Item = &LoraSelection> {
        self.loras
            .iter()
            .filter(|l| !l.name.trim().is_empty() && l.name != "None")
    }

    /// Rejects anything the user isn't allowed to use.
    /// "default" always passes; every explicit model name is checked.
    pub fn check_permissions(&self, permissions: &Permissions) -> Result<()> {
        if !self.uses_default_checkpoint() {
            permissions.check_checkpoint(self.checkpoint_model.trim())?;
        }
        for lora in self.selected_loras() {
            permissions.check_lora(&lora.name)?;
        }
        Ok(())
    }
}

/// The last seed is passed in by the caller; this module never reads or writes the seed file.
pub fn resolve_seed(choice: SeedChoice, last_seed: Option<i64>) -> i64 {
    match choice {
        SeedChoice::Explicit(seed) => seed,
        SeedChoice::UseLast => last_seed.filter(|s| *s >= 0).unwrap_or(RANDOM_SEED),
        SeedChoice::Random => RANDOM_SEED,
    }
}

fn lora_slot(key: &str) -> Option<u32> {
    key.strip_prefix("lora_")?.parse().ok()
}

/// Returns a patched copy of `template`.
pub fn patch(
    template: &Workflow,
    roles: &NodeRoles,
    options: &GenerationOptions,
    permissions: &Permissions,
    last_seed: Option<i64>,
) -> Result<Workflow> {
    // Permission problems must surface before anything else happens.
    options.check_permissions(permissions)?;

    let mut workflow = template.clone();

    match roles.find(&workflow, Role::Checkpoint) {
        Some(id) if !options.uses_default_checkpoint() => {
            workflow.set_input(id, "ckpt_name", json!(options.checkpoint_model.trim()));
        }
        Some(_) => debug!("Keeping the template checkpoint"),
        None => debug!("No checkpoint node; skipping checkpoint"),
    }

    if let Some(id) = roles.find(&workflow, Role::Size) {
        if let Some(width) = options.width {
            workflow.set_input(id, "width", json!(width));
        }
        if let Some(height) = options.height {
            workflow.set_input(id, "height", json!(height));
        }
    } else if options.width.is_some() || options.height.is_some() {
        debug!("No size node; skipping width/height");
    }

    match (roles.find(&workflow, Role::Guidance), options.guidance) {
        (Some(id), Some(guidance)) => {
            workflow.set_input(id, "guidance", json!(guidance));
        }
        (None, Some(_)) => debug!("No guidance node; skipping guidance"),
        _ => {}
    }

    if let Some(id) = roles.find(&workflow, Role::Seed) {
        let seed = resolve_seed(options.seed_choice(), last_seed);
        info!("Setting seed to {}", seed);
        workflow.set_input(id, "seed", json!(seed));
    }

    match roles.find(&workflow, Role::LoraStack).map(str::to_owned) {
        Some(id) => merge_loras(&mut workflow, &id, options),
        None if options.selected_loras().next().is_some() => {
            warn!("LoRAs were requested, but the workflow has no LoRA stack; ignoring them")
        }
        None => {}
    }

    let before = template.dangling_references().len();
    let after = workflow.dangling_references().len();
    if after > before {
        bail!("patching introduced {} dangling references", after - before);
    }
    Ok(workflow)
}

/// Appends the user's LoRAs after the template's own.
/// The template's entries keep their slots and order, user picks that repeat one of them
/// (or each other) are dropped, and new entries go into fresh slots after the highest one in use.
fn merge_loras(workflow: &mut Workflow, id: &str, options: &GenerationOptions) {
    let Some(node) = workflow.get_mut(id) else {
        return;
    };
    let mut base: Vec<(u32, &Value)> = node
        .inputs
        .iter()
        .filter_map(|(key, value)| lora_slot(key).map(|slot| (slot, value)))
        .collect();
    base.sort_by_key(|(slot, _)| *slot);

    let mut highest = base.last().map(|(slot, _)| *slot).unwrap_or(0);
    let mut present: Vec<String> = base
        .iter()
        .filter_map(|(_, value)| value.get("lora").and_then(Value::as_str))
        .map(str::to_owned)
        .collect();
    debug!("Template LoRAs: {:?}", present);

    for lora in options.selected_loras() {
        if present.contains(&lora.name) {
            debug!("Skipping duplicate LoRA {}", lora.name);
            continue;
        }
        highest += 1;
        info!("Adding LoRA lora_{}: {} @ {}", highest, lora.name, lora.strength);
        node.inputs.insert(
            format!("lora_{}", highest),
            json!({
                "on": true,
                "lora": lora.name,
                "strength": lora.strength,
            }),
        );
        present.push(lora.name.clone());
    }
}

/// Puts the prompt text into the workflow's prompt node.
/// Unlike the other roles this one is required: a workflow we can't prompt is useless.
pub fn set_prompt(workflow: &mut Workflow, roles: &NodeRoles, prompt: &str) -> Result<()> {
    let Some(id) = roles.find(workflow, Role::Prompt).map(str::to_owned) else {
        bail!("workflow has no prompt node");
    };
    workflow.set_input(&id, "text", json!(prompt));
    Ok(())
}

/// Re-checks a workflow patched earlier against the caller's current permissions.
/// Models that the template itself names always pass, like "default" does; everything a
/// patch put there must still be allowed.
pub fn check_patched(
    workflow: &Workflow,
    template: &Workflow,
    roles: &NodeRoles,
    permissions: &Permissions,
) -> Result<()> {
    let checkpoint = |w: &Workflow| {
        roles
            .find(w, Role::Checkpoint)
            .and_then(|id| w.input(id, "ckpt_name"))
            .and_then(Value::as_str)
            .map(str::to_owned)
    };
    if let Some(name) = checkpoint(workflow) {
        if checkpoint(template).as_deref() != Some(name.as_str()) {
            permissions.check_checkpoint(&name)?;
        }
    }
    let template_loras: Vec<String> = lora_entries(template, roles).into_iter().map(|(name, _)| name).collect();
    for (name, _) in lora_entries(workflow, roles) {
        if !template_loras.contains(&name) {
            permissions.check_lora(&name)?;
        }
    }
    Ok(())
}

/// The LoRA entries of a stack node, in slot order.
pub fn lora_entries(workflow: &Workflow, roles: &NodeRoles) -> Vec<(String, f64)> {
    let Some(node) = roles.find(workflow, Role::LoraStack).and_then(|id| workflow.get(id)) else {
        return vec![];
    };
    let mut entries: Vec<(u32, String, f64)> = node
        .inputs
        .iter()
        .filter_map(|(key, value)| {
            let slot = lora_slot(key)?;
            let name = value.get("lora")?.as_str()?.to_owned();
            let strength = value.get("strength").and_then(Value::as_f64).unwrap_or(1.0);
            Some((slot, name, strength))
        })
        .collect();
    entries.sort_by_key(|(slot, _, _)| *slot);
    entries.into_iter().map(|(_, name, strength)| (name, strength)).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::{error::StudioError, workflow::Node};

    fn template() -> Workflow {
        Workflow::from_json(include_str!("../testdata/workflows/alice.json")).unwrap()
    }

    fn lora(name: &str, strength: f64) -> LoraSelection {
        LoraSelection {
            name: name.to_string(),
            strength,
        }
    }

    fn admin() -> Permissions {
        Permissions::unrestricted("admin")
    }

    #[test]
    fn test_end_to_end_scenario() {
        let mut template = Workflow::default();
        template.insert("4", Node::new("CheckpointLoaderSimple", json!({"ckpt_name": "base.safetensors"})));
        template.insert("5", Node::new("EmptyLatentImage", json!({"width": 512, "height": 512})));
        template.insert("16", Node::new("FluxGuidance", json!({"guidance": 3.5})));
        template.insert("25", Node::new("Seed (rgthree)", json!({"seed": -1})));
        let options: GenerationOptions = serde_json::from_value(json!({
            "checkpointModel": "my.safetensors",
            "width": 768,
            "height": 768,
            "guidance": 4.0,
            "seed": 123,
            "loras": [],
        }))
        .unwrap();

        let patched = patch(&template, &NodeRoles::default(), &options, &admin(), None).unwrap();
        assert_eq!(patched.input("4", "ckpt_name"), Some(&json!("my.safetensors")));
        assert_eq!(patched.input("5", "width"), Some(&json!(768)));
        assert_eq!(patched.input("5", "height"), Some(&json!(768)));
        assert_eq!(patched.input("16", "guidance"), Some(&json!(4.0)));
        assert_eq!(patched.input("25", "seed"), Some(&json!(123)));
    }

    #[test]
    fn test_template_is_never_mutated() {
        let template = template();
        let pristine = template.clone();
        let a = GenerationOptions {
            width: Some(1024),
            seed: Some(1),
            loras: vec![lora("a.safetensors", 1.0)],
            ..Default::default()
        };
        let b = GenerationOptions {
            width: Some(640),
            seed: Some(2),
            ..Default::default()
        };
        let patched_a = patch(&template, &NodeRoles::default(), &a, &admin(), None).unwrap();
        let patched_b = patch(&template, &NodeRoles::default(), &b, &admin(), None).unwrap();
        assert_eq!(template, pristine);
        assert_eq!(patched_a.input("5", "width"), Some(&json!(1024)));
        assert_eq!(patched_b.input("5", "width"), Some(&json!(640)));
        assert_eq!(patched_b.input("25", "seed"), Some(&json!(2)));
        assert_eq!(lora_entries(&patched_b, &NodeRoles::default()).len(), 2);
        assert_eq!(lora_entries(&patched_a, &NodeRoles::default()).len(), 3);
    }

    #[test]
    fn test_lora_merge_order() {
        let mut template = Workflow::default();
        template.insert(
            "21",
            Node::new(
                "Power Lora Loader (rgthree)",
                json!({
                    "lora_1": {"on": true, "lora": "A", "strength": 0.8},
                    "lora_2": {"on": true, "lora": "B", "strength": 0.6},
                }),
            ),
        );
        let options = GenerationOptions {
            loras: vec![lora("C", 1.0), lora("A", 0.5)],
            ..Default::default()
        };
        let patched = patch(&template, &NodeRoles::default(), &options, &admin(), None).unwrap();
        assert_eq!(
            lora_entries(&patched, &NodeRoles::default()),
            vec![("A".to_string(), 0.8), ("B".to_string(), 0.6), ("C".to_string(), 1.0)]
        );
        assert_eq!(
            patched.input("21", "lora_3"),
            Some(&json!({"on": true, "lora": "C", "strength": 1.0}))
        );
    }

    #[test]
    fn test_lora_merge_skips_blank_and_repeated_picks() {
        let options = GenerationOptions {
            loras: vec![
                lora("", 1.0),
                lora("extra.safetensors", 0.7),
                lora("None", 1.0),
                lora("extra.safetensors", 0.2),
            ],
            ..Default::default()
        };
        let patched = patch(&template(), &NodeRoles::default(), &options, &admin(), None).unwrap();
        let entries = lora_entries(&patched, &NodeRoles::default());
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2], ("extra.safetensors".to_string(), 0.7));
        // The node's connections survive the merge.
        assert_eq!(patched.input("21", "model"), Some(&json!(["4", 0])));
        assert_eq!(patched.input("21", "clip"), Some(&json!(["4", 1])));
    }

    #[test]
    fn test_lora_slots_follow_highest_in_use() {
        let mut template = Workflow::default();
        template.insert(
            "21",
            Node::new(
                "Power Lora Loader (rgthree)",
                json!({
                    "lora_10": {"on": true, "lora": "J", "strength": 1.0},
                    "lora_2": {"on": false, "lora": "B", "strength": 0.5},
                }),
            ),
        );
        let options = GenerationOptions {
            loras: vec![lora("K", 1.0)],
            ..Default::default()
        };
        let patched = patch(&template, &NodeRoles::default(), &options, &admin(), None).unwrap();
        assert!(patched.input("21", "lora_11").is_some());
        let names: Vec<_> = lora_entries(&patched, &NodeRoles::default())
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["B", "J", "K"]);
    }

    #[test]
    fn test_seed_resolution() {
        assert_eq!(resolve_seed(SeedChoice::UseLast, None), -1);
        assert_eq!(resolve_seed(SeedChoice::UseLast, Some(-5)), -1);
        assert_eq!(resolve_seed(SeedChoice::UseLast, Some(42)), 42);
        assert_eq!(resolve_seed(SeedChoice::Explicit(7), Some(42)), 7);
        assert_eq!(resolve_seed(SeedChoice::Random, Some(42)), -1);

        let options = GenerationOptions {
            use_last_seed: true,
            seed: Some(99),
            ..Default::default()
        };
        assert_eq!(options.seed_choice(), SeedChoice::UseLast);
        let patched = patch(&template(), &NodeRoles::default(), &options, &admin(), None).unwrap();
        assert_eq!(patched.input("25", "seed"), Some(&json!(-1)));
        let patched = patch(&template(), &NodeRoles::default(), &options, &admin(), Some(31337)).unwrap();
        assert_eq!(patched.input("25", "seed"), Some(&json!(31337)));
    }

    #[test]
    fn test_permissions() {
        let user = Permissions {
            username: "carol".to_string(),
            checkpoints: BTreeSet::from(["allowed.safetensors".to_string()]),
            ..Default::default()
        };
        let forbidden = GenerationOptions {
            checkpoint_model: "forbidden.safetensors".to_string(),
            ..Default::default()
        };
        let err = patch(&template(), &NodeRoles::default(), &forbidden, &user, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StudioError>(),
            Some(StudioError::PermissionDenied(_))
        ));

        // "default" never needs permission, and keeps the template's checkpoint.
        let default = GenerationOptions::default();
        let patched = patch(&template(), &NodeRoles::default(), &default, &user, None).unwrap();
        assert_eq!(patched.input("4", "ckpt_name"), Some(&json!("base.safetensors")));

        let lora_user = GenerationOptions {
            checkpoint_model: "allowed.safetensors".to_string(),
            loras: vec![lora("secret.safetensors", 1.0)],
            ..Default::default()
        };
        assert!(patch(&template(), &NodeRoles::default(), &lora_user, &user, None).is_err());
    }

    #[test]
    fn test_check_patched() {
        let mut user = Permissions {
            username: "carol".to_string(),
            checkpoints: BTreeSet::from(["allowed.safetensors".to_string()]),
            loras: BTreeSet::from(["extra.safetensors".to_string()]),
            ..Default::default()
        };
        let options = GenerationOptions {
            checkpoint_model: "allowed.safetensors".to_string(),
            loras: vec![lora("extra.safetensors", 0.5)],
            ..Default::default()
        };
        let roles = NodeRoles::default();
        let patched = patch(&template(), &roles, &options, &user, None).unwrap();
        check_patched(&patched, &template(), &roles, &user).unwrap();

        // The template's own models pass without any grants.
        let nobody = Permissions {
            username: "dave".to_string(),
            ..Default::default()
        };
        check_patched(&template(), &template(), &roles, &nobody).unwrap();

        user.loras.clear();
        let err = check_patched(&patched, &template(), &roles, &user).unwrap_err();
        assert!(matches!(err.downcast_ref::<StudioError>(), Some(StudioError::PermissionDenied(_))));

        user.checkpoints.clear();
        assert!(check_patched(&patched, &template(), &roles, &user).is_err());
    }

    #[test]
    fn test_missing_roles_are_skipped() {
        let mut template = Workflow::default();
        template.insert("6", Node::new("CLIPTextEncode", json!({"text": ""})));
        let options = GenerationOptions {
            checkpoint_model: "my.safetensors".to_string(),
            width: Some(768),
            guidance: Some(2.0),
            seed: Some(5),
            loras: vec![lora("x.safetensors", 1.0)],
            ..Default::default()
        };
        let patched = patch(&template, &NodeRoles::default(), &options, &admin(), None).unwrap();
        assert_eq!(patched, template);
    }

    #[test]
    fn test_set_prompt() {
        let mut wf = template();
        set_prompt(&mut wf, &NodeRoles::default(), "Alice at a tea party").unwrap();
        assert_eq!(wf.input("6", "text"), Some(&json!("Alice at a tea party")));

        let roles = NodeRoles {
            prompt: None,
            ..Default::default()
        };
        assert!(set_prompt(&mut wf, &roles, "x").is_err());
    }
}
