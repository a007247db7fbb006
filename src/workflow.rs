// ComfyUI "API format" workflows.
//
// A workflow is a map of node id (a string of digits) to a node, and each node has a class_type
// and a map of inputs. An input is either a literal, or a [node_id, output_slot] pair pointing at
// another node's output. That pair is the only edge encoding there is.

use std::{collections::BTreeMap, path::Path};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StudioError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub class_type: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    // _meta, widgets_values and whatever else the exporter left behind.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Node {
    #[cfg(test)]
    pub fn new(class_type: &str, inputs: Value) -> Self {
        Self {
            class_type: class_type.to_owned(),
            inputs: match inputs {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            extra: Map::new(),
        }
    }
}

/// A reference from an input to another node's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputRef {
    pub node: u64,
    pub slot: u32,
}

/// Recognizes `["3", 0]` (and `[3, 0]`, which some exporters write).
pub fn as_reference(value: &Value) -> Option<OutputRef> {
    let pair = value.as_array()?;
    if pair.len() != 2 {
        return None;
    }
    let node = match &pair[0] {
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => s.parse().ok()?,
        Value::Number(n) => n.as_u64()?,
        _ => return None,
    };
    let slot = u32::try_from(pair[1].as_u64()?).ok()?;
    Some(OutputRef { node, slot })
}

/// Parses a node id, if it is one. Non-numeric keys do occur in the wild and are ignored.
pub fn numeric_id(id: &str) -> Option<u64> {
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    id.parse().ok()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Workflow {
    nodes: IndexMap<String, Node>,
}

impl Workflow {
    /// Loads a workflow template.
    /// A missing file is reported as StudioError::TemplateNotFound, never papered over.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!(StudioError::TemplateNotFound(path.to_owned()));
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read workflow {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("failed to parse workflow {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("workflow is not a node map")
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize workflow")
    }

    #[cfg(test)]
    pub fn insert(&mut self, id: impl Into<String>, node: Node) {
        self.nodes.insert(id.into(), node);
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.nodes.iter()
    }

    /// Nodes with numeric ids, in ascending numeric order.
    pub fn numbered(&self) -> BTreeMap<u64, &Node> {
        self.nodes
            .iter()
            .filter_map(|(id, node)| numeric_id(id).map(|n| (n, node)))
            .collect()
    }

    pub fn input(&self, id: &str, name: &str) -> Option<&Value> {
        self.nodes.get(id)?.inputs.get(name)
    }

    /// Sets an input on an existing node. Returns false if the node doesn't exist.
    pub fn set_input(&mut self, id: &str, name: &str, value: Value) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.inputs.insert(name.to_owned(), value);
                true
            }
            None => false,
        }
    }

    /// Every reference in the graph whose source node does not exist.
    pub fn dangling_references(&self) -> Vec<(String, String, OutputRef)> {
        let mut dangling = Vec::new();
        for (id, node) in &self.nodes {
            for (name, value) in &node.inputs {
                if let Some(r) = as_reference(value) {
                    if !self.nodes.contains_key(&r.node.to_string()) {
                        dangling.push((id.clone(), name.clone(), r));
                    }
                }
            }
        }
        dangling
    }

    pub fn validate(&self) -> Result<()> {
        let dangling = self.dangling_references();
        if let Some((id, name, r)) = dangling.first() {
            bail!(
                "node {} input {} references missing node {} ({} dangling references)",
                id,
                name,
                r.node,
                dangling.len()
            );
        }
        Ok(())
    }
}

/// Which node plays which part in a character's workflow.
/// A role set to null (or pointing at a node the graph doesn't have) is simply not patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeRoles {
    pub prompt: Option<String>,
    pub checkpoint: Option<String>,
    pub size: Option<String>,
    pub guidance: Option<String>,
    pub seed: Option<String>,
    pub lora_stack: Option<String>,
}

impl Default for NodeRoles {
    fn default() -> Self {
        Self {
            prompt: Some("6".to_string()),
            checkpoint: Some("4".to_string()),
            size: Some("5".to_string()),
            guidance: Some("16".to_string()),
            seed: Some("25".to_string()),
            lora_stack: Some("21".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Prompt,
    Checkpoint,
    Size,
    Guidance,
    Seed,
    LoraStack,
}

impl NodeRoles {
    fn id(&self, role: Role) -> Option<&str> {
        match role {
            Role::Prompt => self.prompt.as_deref(),
            Role::Checkpoint => self.checkpoint.as_deref(),
            Role::Size => self.size.as_deref(),
            Role::Guidance => self.guidance.as_deref(),
            Role::Seed => self.seed.as_deref(),
            Role::LoraStack => self.lora_stack.as_deref(),
        }
    }

    /// Looks up a role's node id, if the role is mapped and the node exists.
    pub fn find(&self, workflow: &Workflow, role: Role) -> Option<&str> {
        let id = self.id(role)?;
        workflow.contains(id).then_some(id)
    }
}
