// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! JSON rendering of trees for debug logging.

use crate::tree::replica::{NodeRef, ReplicaTree};
use crate::tree::source::{NodeId, SourceTree};
use crate::tree::value::Value;
use serde_json::{json, Map};

/// Render a source tree as nested JSON objects.
pub fn source_to_json(tree: &SourceTree) -> serde_json::Value {
    source_node(tree, tree.root())
}

/// Render a replica the same way as [`source_to_json`], so the two can be
/// compared by eye. The placeholder renders as `null`.
pub fn replica_to_json(replica: &ReplicaTree) -> serde_json::Value {
    replica.root().map_or(serde_json::Value::Null, replica_node)
}

fn source_node(tree: &SourceTree, id: NodeId) -> serde_json::Value {
    let properties: Map<String, serde_json::Value> = tree
        .properties(id)
        .iter()
        .map(|(name, value)| (name.clone(), value_to_json(value)))
        .collect();
    let children: Vec<_> = tree
        .children(id)
        .iter()
        .map(|&child| source_node(tree, child))
        .collect();

    json!({
        "id": id.to_string(),
        "kind": tree.kind(id).unwrap_or_default(),
        "properties": properties,
        "children": children,
    })
}

fn replica_node(node: NodeRef<'_>) -> serde_json::Value {
    let properties: Map<String, serde_json::Value> = node
        .property_names()
        .filter_map(|name| Some((name.to_string(), value_to_json(&node.get(name)?))))
        .collect();
    let children: Vec<_> = node.children().map(replica_node).collect();

    json!({
        "id": node.id().to_string(),
        "kind": node.kind(),
        "properties": properties,
        "children": children,
    })
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Void => serde_json::Value::Null,
        Value::Scalar(scalar) => json!(scalar),
        Value::Text(text) => json!(&**text),
        Value::Object(object) => json!(format!("<object {:#x}>", object.addr())),
    }
}
