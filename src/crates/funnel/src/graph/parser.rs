//! Campaign definition parsing
//!
//! Two wire shapes are accepted:
//!
//! ```json
//! {"nodes": [{"id": "n1", "type": "message", "data": {"text": "Hi"}}],
//!  "edges": [{"source": "n1", "target": "n2", "sourceHandle": null}]}
//! ```
//!
//! and the legacy ordered step list `[{"type": "message", "text": "Hi"}, ...]`.

use super::model::*;
use crate::error::{FunnelError, Result};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct RawGraph {
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    edges: Vec<Edge>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    start: bool,
}

impl CampaignDefinition {
    /// Parse a stored definition
    pub fn parse(definition: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(definition)
            .map_err(|e| FunnelError::InvalidGraph(format!("definition is not JSON: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(steps) => parse_linear(steps).map(CampaignDefinition::Linear),
            Value::Object(_) => parse_graph(value).map(CampaignDefinition::Graph),
            other => Err(FunnelError::InvalidGraph(format!(
                "expected an object or an array, got {}",
                json_type(&other)
            ))),
        }
    }
}

fn parse_graph(value: Value) -> Result<CampaignGraph> {
    let raw: RawGraph = serde_json::from_value(value)
        .map_err(|e| FunnelError::InvalidGraph(format!("malformed graph: {}", e)))?;

    let mut nodes = Vec::with_capacity(raw.nodes.len());
    for raw_node in raw.nodes {
        let kind = parse_kind(&raw_node.kind, raw_node.data)
            .map_err(|e| FunnelError::InvalidGraph(format!("node '{}': {}", raw_node.id, e)))?;
        let is_start = raw_node.start || kind == NodeKind::Start;
        nodes.push(Node {
            id: raw_node.id,
            kind,
            is_start,
        });
    }

    Ok(CampaignGraph::new(nodes, raw.edges))
}

fn parse_linear(steps: Vec<Value>) -> Result<Vec<NodeKind>> {
    steps
        .into_iter()
        .enumerate()
        .map(|(index, step)| {
            let Value::Object(mut fields) = step else {
                return Err(FunnelError::InvalidGraph(format!("step {} is not an object", index)));
            };
            let kind = match fields.remove("type") {
                Some(Value::String(kind)) => kind,
                _ => return Err(FunnelError::InvalidGraph(format!("step {} has no type", index))),
            };
            let parsed = parse_kind(&kind, Value::Object(fields))
                .map_err(|e| FunnelError::InvalidGraph(format!("step {}: {}", index, e)))?;
            match parsed {
                NodeKind::Condition(_) | NodeKind::Randomizer(_) | NodeKind::Start => Err(
                    FunnelError::InvalidGraph(format!("step {}: '{}' needs a graph definition", index, kind)),
                ),
                step => Ok(step),
            }
        })
        .collect()
}

fn parse_kind(kind: &str, data: Value) -> std::result::Result<NodeKind, String> {
    fn params<T: serde::de::DeserializeOwned>(data: Value) -> std::result::Result<T, String> {
        let data = if data.is_null() { Value::Object(Default::default()) } else { data };
        serde_json::from_value(data).map_err(|e| e.to_string())
    }

    let parsed = match kind {
        "start" => NodeKind::Start,
        "message" | "text" => NodeKind::Message(params(data)?),
        "media" => NodeKind::Media(params(data)?),
        "delay" | "wait" => NodeKind::Delay(params(data)?),
        "condition" => NodeKind::Condition(params(data)?),
        "randomizer" => {
            let randomizer: RandomizerParams = params(data)?;
            if randomizer.percent_a > 100 {
                return Err(format!("percentA {} is above 100", randomizer.percent_a));
            }
            NodeKind::Randomizer(randomizer)
        }
        "link_campaign" | "linkCampaign" => NodeKind::LinkCampaign(params(data)?),
        "template" => NodeKind::Template(params(data)?),
        "label" | "labels" => NodeKind::Label(params(data)?),
        other => return Err(format!("unknown node type '{}'", other)),
    };

    Ok(parsed)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
