/*
 * Copyright (c) 2026 the Vibe Engine developers.
 *
 * This file is part of the Vibe Script Engine.
 *
 * Licensed under the MIT License. See LICENSE for details.
 */

//! The view-tree IR: the serializable contract between VM-produced values
//! and the external renderer.
//!
//! Runtime dictionaries map to typed nodes; the reserved `$state` and
//! `$binding` dictionary tags become `state_ref`/`binding_ref` IR values.
//! `native` and `struct` values have no IR form and simply vanish from the
//! tree. Node IDs missing from a payload are synthesized from the node's
//! shape so renderer diffing stays stable across runs.

use crate::runtime::{Value, BINDING_TAG, STATE_TAG};
use crate::symbols::fnv1a32;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const IR_VERSION: i64 = 1;

// ─── IR values ───────────────────────────────────────────────────────────────

/// The serialization-friendly value shape. Variant order matters for the
/// untagged deserializer: the reference forms must win over plain objects,
/// and integers over doubles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IrValue {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    StateRef { state_ref: String },
    BindingRef { binding_ref: String },
    Array(Vec<IrValue>),
    Object(IndexMap<String, IrValue>),
}

impl IrValue {
    /// Map a runtime value into the IR. `native` and `struct` values are
    /// not representable and yield `None`; containers silently drop
    /// unrepresentable entries.
    pub fn from_runtime(value: &Value) -> Option<IrValue> {
        Some(match value {
            Value::None => IrValue::Null,
            Value::Bool(b) => IrValue::Bool(*b),
            Value::Int(i) => IrValue::Int(*i),
            Value::Float(f) => IrValue::Double(*f),
            Value::Str(s) => IrValue::String(s.clone()),
            Value::Array(items) => {
                IrValue::Array(items.iter().filter_map(IrValue::from_runtime).collect())
            }
            Value::Dict(entries) => {
                if let Some(Value::Str(path)) = entries.get(BINDING_TAG) {
                    return Some(IrValue::BindingRef { binding_ref: path.clone() });
                }
                if let Some(Value::Str(path)) = entries.get(STATE_TAG) {
                    return Some(IrValue::StateRef { state_ref: path.clone() });
                }
                IrValue::Object(
                    entries
                        .iter()
                        .filter_map(|(k, v)| Some((k.clone(), IrValue::from_runtime(v)?)))
                        .collect(),
                )
            }
            Value::Native(_) | Value::Struct(_) => return None,
        })
    }

    /// Map back into the runtime value space, reconstituting the reserved
    /// dictionary tags.
    pub fn to_runtime(&self) -> Value {
        match self {
            IrValue::Null => Value::None,
            IrValue::Bool(b) => Value::Bool(*b),
            IrValue::Int(i) => Value::Int(*i),
            IrValue::Double(f) => Value::Float(*f),
            IrValue::String(s) => Value::Str(s.clone()),
            IrValue::StateRef { state_ref } => {
                let mut entries = IndexMap::new();
                entries.insert(STATE_TAG.to_string(), Value::Str(state_ref.clone()));
                Value::Dict(entries)
            }
            IrValue::BindingRef { binding_ref } => {
                let mut entries = IndexMap::new();
                entries.insert(BINDING_TAG.to_string(), Value::Str(binding_ref.clone()));
                Value::Dict(entries)
            }
            IrValue::Array(items) => Value::Array(items.iter().map(IrValue::to_runtime).collect()),
            IrValue::Object(entries) => Value::Dict(
                entries.iter().map(|(k, v)| (k.clone(), v.to_runtime())).collect(),
            ),
        }
    }

}

// ─── Tree types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modifier {
    #[serde(rename = "type")]
    pub modifier_type: String,
    #[serde(default)]
    pub params: IndexMap<String, IrValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default)]
    pub action_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub props: IndexMap<String, IrValue>,
    #[serde(default)]
    pub children: Vec<ViewNode>,
    #[serde(default)]
    pub modifiers: Vec<Modifier>,
    #[serde(default)]
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewTree {
    pub ir_version: i64,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub root: ViewNode,
}

impl ViewTree {
    /// Build a tree from a runtime value. Accepts either a full payload
    /// (`{root, ir_version?, capabilities?}`) or a bare node (`{type, …}`),
    /// in which case the caller's defaults fill the envelope.
    pub fn from(value: &Value, ir_version: i64, capabilities: &[String]) -> Option<ViewTree> {
        let Value::Dict(entries) = value else { return None };
        if let Some(root_value) = entries.get("root") {
            let root = ViewNode::from_value(root_value)?;
            let version = match entries.get("ir_version") {
                Some(Value::Int(v)) => *v,
                _ => ir_version,
            };
            let caps = match entries.get("capabilities") {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => capabilities.to_vec(),
            };
            return Some(ViewTree { ir_version: version, capabilities: caps, root });
        }
        let root = ViewNode::from_value(value)?;
        Some(ViewTree {
            ir_version,
            capabilities: capabilities.to_vec(),
            root,
        })
    }
}

impl ViewNode {
    /// Parse one node from the dynamic value space. Requires a string
    /// `type`; everything else has defaults.
    pub fn from_value(value: &Value) -> Option<ViewNode> {
        let Value::Dict(entries) = value else { return None };
        let node_type = entries.get("type")?.as_str()?.to_string();

        let props: IndexMap<String, IrValue> = match entries.get("props") {
            Some(Value::Dict(props)) => props
                .iter()
                .filter_map(|(k, v)| Some((k.clone(), IrValue::from_runtime(v)?)))
                .collect(),
            _ => IndexMap::new(),
        };
        let children: Vec<ViewNode> = match entries.get("children") {
            Some(Value::Array(items)) => items.iter().filter_map(ViewNode::from_value).collect(),
            _ => Vec::new(),
        };
        let modifiers: Vec<Modifier> = match entries.get("modifiers") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| {
                    let Value::Dict(record) = item else { return None };
                    Some(Modifier {
                        modifier_type: record.get("type")?.as_str()?.to_string(),
                        params: match record.get("params") {
                            Some(Value::Dict(params)) => params
                                .iter()
                                .filter_map(|(k, v)| Some((k.clone(), IrValue::from_runtime(v)?)))
                                .collect(),
                            _ => IndexMap::new(),
                        },
                    })
                })
                .collect(),
            _ => Vec::new(),
        };
        let events: Vec<Event> = match entries.get("events") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| {
                    let Value::Dict(record) = item else { return None };
                    Some(Event {
                        event: record.get("event")?.as_str()?.to_string(),
                        action_id: record
                            .get("action_id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        path: record.get("path").and_then(Value::as_str).map(str::to_string),
                    })
                })
                .collect(),
            _ => Vec::new(),
        };

        let id = match entries.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => synthesize_id(&node_type, &props, &children),
        };
        Some(ViewNode { id, node_type, props, children, modifiers, events })
    }
}

/// Stable ID for payloads that carry none: `node-<hash(type|propKeys|childIds)>`.
fn synthesize_id(
    node_type: &str,
    props: &IndexMap<String, IrValue>,
    children: &[ViewNode],
) -> String {
    let prop_keys: Vec<&str> = props.keys().map(String::as_str).collect();
    let child_ids: Vec<&str> = children.iter().map(|c| c.id.as_str()).collect();
    let material = format!("{}|{}|{}", node_type, prop_keys.join(","), child_ids.join(","));
    format!("node-{:08x}", fnv1a32(material.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(entries: Vec<(&str, Value)>) -> Value {
        Value::Dict(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    #[test]
    fn test_primitive_round_trip() {
        let values = vec![
            Value::None,
            Value::Bool(true),
            Value::Int(-7),
            Value::Float(1.5),
            Value::Str("hello".to_string()),
        ];
        for value in values {
            let ir = IrValue::from_runtime(&value).unwrap();
            assert_eq!(ir.to_runtime(), value);
        }
    }

    #[test]
    fn test_array_and_object_round_trip() {
        let value = dict(vec![
            ("items", Value::Array(vec![Value::Int(1), Value::Str("two".to_string())])),
            ("flag", Value::Bool(false)),
        ]);
        let ir = IrValue::from_runtime(&value).unwrap();
        assert_eq!(ir.to_runtime(), value);
    }

    #[test]
    fn test_reserved_tags_round_trip() {
        let state = dict(vec![(STATE_TAG, Value::Str("counter".to_string()))]);
        let ir = IrValue::from_runtime(&state).unwrap();
        assert_eq!(ir, IrValue::StateRef { state_ref: "counter".to_string() });
        assert_eq!(ir.to_runtime(), state);

        let binding = dict(vec![(BINDING_TAG, Value::Str("name".to_string()))]);
        let ir = IrValue::from_runtime(&binding).unwrap();
        assert_eq!(ir, IrValue::BindingRef { binding_ref: "name".to_string() });
        assert_eq!(ir.to_runtime(), binding);
    }

    #[test]
    fn test_native_and_struct_are_absent() {
        use crate::runtime::{NativeValue, StructInstance};
        use crate::symbols::TypeId;
        use std::rc::Rc;

        let native = Value::Native(NativeValue::new("timestamp", Rc::new(1i64)));
        assert_eq!(IrValue::from_runtime(&native), None);

        let instance = Value::Struct(StructInstance {
            type_id: TypeId::of("P"),
            fields: IndexMap::new(),
        });
        assert_eq!(IrValue::from_runtime(&instance), None);

        // Inside a dict the unrepresentable entry vanishes.
        let wrapper = dict(vec![("ok", Value::Int(1)), ("bad", native)]);
        let IrValue::Object(entries) = IrValue::from_runtime(&wrapper).unwrap() else {
            panic!("expected object");
        };
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("ok"));
    }

    #[test]
    fn test_bare_node_uses_defaults() {
        let node = dict(vec![
            ("type", Value::Str("Text".to_string())),
            ("props", dict(vec![("text", Value::Str("hi".to_string()))])),
        ]);
        let caps = vec!["ui_basic".to_string()];
        let tree = ViewTree::from(&node, IR_VERSION, &caps).unwrap();
        assert_eq!(tree.ir_version, 1);
        assert_eq!(tree.capabilities, caps);
        assert_eq!(tree.root.node_type, "Text");
        assert!(tree.root.id.starts_with("node-"));
    }

    #[test]
    fn test_full_payload_overrides_defaults() {
        let payload = dict(vec![
            ("ir_version", Value::Int(2)),
            (
                "capabilities",
                Value::Array(vec![Value::Str("ui_basic".to_string())]),
            ),
            (
                "root",
                dict(vec![
                    ("id", Value::Str("root-1".to_string())),
                    ("type", Value::Str("VStack".to_string())),
                ]),
            ),
        ]);
        let tree = ViewTree::from(&payload, IR_VERSION, &[]).unwrap();
        assert_eq!(tree.ir_version, 2);
        assert_eq!(tree.capabilities, vec!["ui_basic"]);
        assert_eq!(tree.root.id, "root-1");
    }

    #[test]
    fn test_synthesized_ids_are_stable() {
        let node = dict(vec![
            ("type", Value::Str("Text".to_string())),
            ("props", dict(vec![("text", Value::Str("a".to_string()))])),
        ]);
        let a = ViewTree::from(&node, IR_VERSION, &[]).unwrap();
        let b = ViewTree::from(&node, IR_VERSION, &[]).unwrap();
        assert_eq!(a.root.id, b.root.id);

        let other = dict(vec![("type", Value::Str("Image".to_string()))]);
        let c = ViewTree::from(&other, IR_VERSION, &[]).unwrap();
        assert_ne!(a.root.id, c.root.id);
    }

    #[test]
    fn test_modifiers_and_events_parse() {
        let node = dict(vec![
            ("type", Value::Str("Button".to_string())),
            (
                "modifiers",
                Value::Array(vec![dict(vec![
                    ("type", Value::Str("padding".to_string())),
                    ("params", dict(vec![("value", Value::Int(8))])),
                ])]),
            ),
            (
                "events",
                Value::Array(vec![dict(vec![
                    ("event", Value::Str("tap".to_string())),
                    ("action_id", Value::Str("start".to_string())),
                ])]),
            ),
        ]);
        let tree = ViewTree::from(&node, IR_VERSION, &[]).unwrap();
        assert_eq!(tree.root.modifiers.len(), 1);
        assert_eq!(tree.root.modifiers[0].modifier_type, "padding");
        assert_eq!(tree.root.modifiers[0].params.get("value"), Some(&IrValue::Int(8)));
        assert_eq!(tree.root.events.len(), 1);
        assert_eq!(tree.root.events[0].event, "tap");
        assert_eq!(tree.root.events[0].action_id, "start");
        assert_eq!(tree.root.events[0].path, None);
    }

    #[test]
    fn test_json_round_trip() {
        let node = dict(vec![
            ("type", Value::Str("TextField".to_string())),
            (
                "props",
                dict(vec![
                    ("placeholder", Value::Str("Name".to_string())),
                    ("binding", dict(vec![(BINDING_TAG, Value::Str("user.name".to_string()))])),
                ]),
            ),
        ]);
        let tree = ViewTree::from(&node, IR_VERSION, &[]).unwrap();
        let json = serde_json::to_string(&tree).unwrap();
        assert!(json.contains("binding_ref"));
        let parsed: ViewTree = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, tree);
    }

    #[test]
    fn test_non_dict_values_are_not_trees() {
        assert!(ViewTree::from(&Value::Int(3), IR_VERSION, &[]).is_none());
        assert!(ViewTree::from(&Value::Str("Text".to_string()), IR_VERSION, &[]).is_none());
        // A dict without a type is not a node either.
        let no_type = dict(vec![("props", dict(vec![]))]);
        assert!(ViewTree::from(&no_type, IR_VERSION, &[]).is_none());
    }
}
