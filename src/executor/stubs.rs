//! Degradation outputs for node types whose collaborator is not wired in.

use serde_json::{json, Map, Value};

use crate::graph::NodeType;

fn field(config: &Map<String, Value>, key: &str, default: Value) -> Value {
    config.get(key).cloned().unwrap_or(default)
}

/// Build the stub output for `node_type`, always tagged `"unavailable": true`.
///
/// Returns `None` for unrecognised types, which have no stub.
pub fn stub_output(node_type: &NodeType, config: &Map<String, Value>) -> Option<Value> {
    let mut output = match node_type {
        NodeType::Navigation => json!({
            "destination": field(config, "destination", json!("unknown")),
            "transport_mode": field(config, "transport_mode", json!("walking")),
        }),
        NodeType::Interaction => json!({
            "question": field(config, "question", json!("please confirm")),
            "options": field(config, "options", json!(["yes", "no"])),
            "response": Value::Null,
        }),
        NodeType::Observation => json!({
            "observation_type": field(config, "type", json!("ocr")),
            "target": field(config, "target", json!("signboard")),
            "detected_objects": [],
            "confidence": 0.0,
        }),
        NodeType::ConditionCheck => json!({
            "condition": field(config, "condition", json!("true")),
            "required_items": field(config, "required_items", json!([])),
            "passed": true,
        }),
        NodeType::ExternalCall => json!({
            "service": field(config, "service", json!("unknown")),
            "service_type": field(config, "service_type", json!("")),
        }),
        NodeType::MemoryAction => json!({
            "action": field(config, "action", json!("save")),
            "memory_type": field(config, "memory_type", json!("default")),
            "fields": field(config, "fields", json!([])),
        }),
        NodeType::EnvironmentalState => json!({
            "trigger": field(config, "trigger", json!("")),
        }),
        NodeType::SceneEntry => json!({
            "scene_id": field(config, "scene_id", json!("")),
        }),
        NodeType::Decision => {
            let options = field(config, "options", json!([]));
            let priority = field(config, "priority", json!([]));
            let selected = priority
                .get(0)
                .or_else(|| options.get(0))
                .cloned()
                .unwrap_or_else(|| json!(""));
            json!({
                "options": options,
                "priority": priority,
                "selected": selected,
            })
        }
        NodeType::Unknown(_) => return None,
    };

    if let Value::Object(map) = &mut output {
        map.insert("unavailable".to_string(), Value::Bool(true));
    }
    Some(output)
}
