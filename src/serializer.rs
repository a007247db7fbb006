// Builds the "UI format" workflow that ComfyUI's editor expects to find in a PNG.
//
// The API format only has nodes and [node, slot] references. The editor wants explicit nodes
// with input/output slot arrays, plus a flat link table. We rebuild that here in two passes:
// lay out the nodes, then walk every input once and turn each reference into a link.
// No positions survive the API format, so nodes get a plain grid layout.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{ser::Serializer, Serialize};
use serde_json::{json, Map, Value};

use crate::workflow::{as_reference, Workflow};

pub const LORA_STACK_CLASS: &str = "Power Lora Loader (rgthree)";

const DEFAULT_SIZE: [f64; 2] = [315.0, 98.0];
const LORA_STACK_SIZE: [f64; 2] = [340.20001220703125, 166.0];
const GRID_COLUMNS: usize = 4;
const GRID_STEP: [f64; 2] = [400.0, 300.0];
/// No real node has anywhere near this many outputs.
const MAX_OUTPUT_SLOTS: u32 = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewerDocument {
    pub last_node_id: u64,
    pub last_link_id: u64,
    pub nodes: Vec<ViewerNode>,
    pub links: Vec<ViewerLink>,
    pub groups: Vec<Value>,
    pub config: Map<String, Value>,
    pub extra: Value,
    pub version: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewerNode {
    pub id: u64,
    #[serde(rename = "type")]
    pub class_type: String,
    pub pos: [f64; 2],
    pub size: [f64; 2],
    pub flags: Map<String, Value>,
    pub order: usize,
    pub mode: u32,
    pub inputs: Vec<InputSlot>,
    pub outputs: Vec<OutputSlot>,
    pub properties: Map<String, Value>,
    pub widgets_values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputSlot {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub link: Option<u64>,
    pub slot_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputSlot {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub links: Vec<u64>,
    pub slot_index: usize,
}

/// Serialized the way the editor stores links: `[id, from, from_slot, to, to_slot, type]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewerLink {
    pub id: u64,
    pub source: u64,
    pub source_slot: u32,
    pub target: u64,
    pub target_slot: usize,
    pub kind: String,
}

impl Serialize for ViewerLink {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (
            self.id,
            self.source,
            self.source_slot,
            self.target,
            self.target_slot,
            &self.kind,
        )
            .serialize(serializer)
    }
}

impl ViewerDocument {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize viewer document")
    }

    #[cfg(test)]
    pub fn node(&self, id: u64) -> Option<&ViewerNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

fn grid_position(order: usize) -> [f64; 2] {
    [
        (order % GRID_COLUMNS) as f64 * GRID_STEP[0],
        (order / GRID_COLUMNS) as f64 * GRID_STEP[1],
    ]
}

/// Converts an API-format workflow into the editor's format.
/// Deterministic: the same workflow always produces the same document.
pub fn serialize(workflow: &Workflow) -> ViewerDocument {
    let numbered = workflow.numbered();

    // Pass 1: one viewer node per workflow node, in id order.
    let mut index = HashMap::new();
    let mut nodes = Vec::with_capacity(numbered.len());
    for (order, (&id, node)) in numbered.iter().enumerate() {
        index.insert(id, order);
        let inputs = node
            .inputs
            .keys()
            .enumerate()
            .map(|(slot_index, name)| InputSlot {
                name: name.clone(),
                kind: name.to_uppercase(),
                link: None,
                slot_index,
            })
            .collect();
        let mut properties = Map::new();
        properties.insert("Node name for S&R".to_string(), json!(node.class_type));
        let widgets_values = node
            .extra
            .get("widgets_values")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        nodes.push(ViewerNode {
            id,
            class_type: node.class_type.clone(),
            pos: grid_position(order),
            size: DEFAULT_SIZE,
            flags: Map::new(),
            order,
            mode: 0,
            inputs,
            outputs: vec![],
            properties,
            widgets_values,
        });
    }

    // Pass 2: every reference becomes a link, exactly once per (from, from_slot, to, to_slot).
    let mut links: Vec<ViewerLink> = vec![];
    let mut link_ids: BTreeMap<(u64, u32, u64, usize), u64> = BTreeMap::new();
    for (&target, node) in numbered.iter() {
        let target_pos = index[&target];
        for (target_slot, (name, value)) in node.inputs.iter().enumerate() {
            let Some(reference) = as_reference(value) else {
                continue;
            };
            let Some(&source_pos) = index.get(&reference.node) else {
                warn!(
                    "Node {} input {} references missing node {}; leaving it unlinked",
                    target, name, reference.node
                );
                continue;
            };
            if reference.slot >= MAX_OUTPUT_SLOTS {
                warn!(
                    "Node {} input {} references output {} of node {}; leaving it unlinked",
                    target, name, reference.slot, reference.node
                );
                continue;
            }
            let key = (reference.node, reference.slot, target, target_slot);
            let label = name.to_uppercase();
            let id = *link_ids.entry(key).or_insert_with(|| {
                let id = links.len() as u64 + 1;
                links.push(ViewerLink {
                    id,
                    source: reference.node,
                    source_slot: reference.slot,
                    target,
                    target_slot,
                    kind: label.clone(),
                });
                id
            });

            nodes[target_pos].inputs[target_slot].link = Some(id);

            // Outputs only exist as far as something uses them; pad up to the referenced slot.
            let outputs = &mut nodes[source_pos].outputs;
            let slot = reference.slot as usize;
            while outputs.len() <= slot {
                let slot_index = outputs.len();
                outputs.push(OutputSlot {
                    name: String::new(),
                    kind: String::new(),
                    links: vec![],
                    slot_index,
                });
            }
            let output = &mut outputs[slot];
            if output.kind.is_empty() {
                output.name = label.clone();
                output.kind = label;
            }
            if !output.links.contains(&id) {
                output.links.push(id);
            }
        }
    }

    for (viewer, node) in nodes.iter_mut().zip(numbered.values()) {
        if node.class_type == LORA_STACK_CLASS {
            decorate_lora_stack(viewer, &node.inputs);
        }
    }

    debug!("Serialized {} nodes and {} links", nodes.len(), links.len());
    ViewerDocument {
        last_node_id: numbered.keys().next_back().copied().unwrap_or(0),
        last_link_id: links.len() as u64,
        nodes,
        links,
        groups: vec![],
        config: Map::new(),
        extra: json!({
            "ds": {
                "scale": 1.0,
                "offset": [0.0, 0.0],
            }
        }),
        version: 0.4,
    }
}

/// The rgthree LoRA loader renders from widgets_values, not from its inputs.
/// Without this the editor shows an empty stack.
fn decorate_lora_stack(viewer: &mut ViewerNode, inputs: &Map<String, Value>) {
    viewer
        .properties
        .insert("Show Strengths".to_string(), json!("Single Strength"));
    viewer.size = LORA_STACK_SIZE;

    let mut entries: Vec<(u32, &Value)> = inputs
        .iter()
        .filter(|(_, value)| value.is_object())
        .filter_map(|(key, value)| Some((key.strip_prefix("lora_")?.parse().ok()?, value)))
        .collect();
    entries.sort_by_key(|(slot, _)| *slot);

    let mut widgets = vec![Value::Null, json!({"type": "PowerLoraLoaderHeaderWidget"})];
    widgets.extend(entries.into_iter().map(|(_, entry)| {
        json!({
            "on": entry.get("on").cloned().unwrap_or(json!(true)),
            "lora": entry.get("lora").cloned().unwrap_or(json!("")),
            "strength": entry.get("strength").cloned().unwrap_or(json!(1)),
            "strengthTwo": null,
        })
    }));
    widgets.push(Value::Null);
    widgets.push(json!(""));
    viewer.widgets_values = widgets;
}
