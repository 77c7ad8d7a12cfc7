//! Campaign graph model
//!
//! A graph is immutable once parsed. Nodes are indexed by id; edges keep their
//! authoring order because edge selection is first-match.

use chrono::{Duration, NaiveDateTime, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Handle taken when a tag or weekday condition holds
pub const HANDLE_TRUE: &str = "true";
/// Handle taken when a tag or weekday condition does not hold
pub const HANDLE_FALSE: &str = "false";
/// Randomizer branch taken when the roll is within `percent_a`
pub const HANDLE_A: &str = "a";
/// Randomizer branch taken otherwise
pub const HANDLE_B: &str = "b";

/// Interactive reply button attached to a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Button {
    pub id: String,
    pub title: String,
}

/// Free-form text message; with buttons it is sent as an interactive message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageParams {
    pub text: String,
    #[serde(default)]
    pub buttons: Vec<Button>,
    /// Internal note posted to the conversation once the message is delivered
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    #[default]
    Image,
    Video,
    Audio,
    Document,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Document => "document",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaParams {
    pub url: String,
    #[serde(default)]
    pub media_type: MediaType,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    #[default]
    Seconds,
    Minutes,
    Hours,
    Days,
}

/// Longest delay honoured; longer values are clamped (ten years)
pub const MAX_DELAY_SECS: u64 = 10 * 365 * 86_400;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayParams {
    pub amount: u64,
    #[serde(default)]
    pub unit: DelayUnit,
}

impl DelayParams {
    pub fn seconds(amount: u64) -> Self {
        Self {
            amount,
            unit: DelayUnit::Seconds,
        }
    }

    /// Total length of the delay
    pub fn duration(&self) -> Duration {
        let secs = match self.unit {
            DelayUnit::Seconds => self.amount,
            DelayUnit::Minutes => self.amount.saturating_mul(60),
            DelayUnit::Hours => self.amount.saturating_mul(3_600),
            DelayUnit::Days => self.amount.saturating_mul(86_400),
        };
        Duration::seconds(secs.min(MAX_DELAY_SECS) as i64)
    }
}

/// What a datetime-range condition does in one zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneAction {
    /// Branch on the zone handle (`before`, `between`, `after`)
    Follow,
    /// End the path
    Stop,
    /// Suspend until the next zone boundary and evaluate again
    Wait,
}

fn default_before() -> ZoneAction {
    ZoneAction::Wait
}

fn default_between() -> ZoneAction {
    ZoneAction::Follow
}

fn default_after() -> ZoneAction {
    ZoneAction::Stop
}

/// Condition evaluated by a condition node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "conditionType", rename_all = "snake_case")]
pub enum Condition {
    /// Conversation carries a label equal to `tag` after folding
    Tag { tag: String },

    /// Tenant-local calendar day is one of `days`
    Weekday { days: Vec<Weekday> },

    /// Tenant-local time compared with `[start, end)`
    #[serde(rename_all = "camelCase")]
    DatetimeRange {
        start: NaiveDateTime,
        end: NaiveDateTime,
        #[serde(default = "default_before")]
        before: ZoneAction,
        #[serde(default = "default_between")]
        between: ZoneAction,
        #[serde(default = "default_after")]
        after: ZoneAction,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RandomizerParams {
    /// Probability of branch `a`, in percent
    pub percent_a: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkCampaignParams {
    pub campaign_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateParams {
    pub template_name: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub components: Option<serde_json::Value>,
    /// Prefer `fallback_text` when the recipient wrote recently
    #[serde(default)]
    pub check_window: bool,
    #[serde(default)]
    pub fallback_text: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelParams {
    pub labels: Vec<String>,
}

/// Closed set of node kinds with their typed parameters
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Start,
    Message(MessageParams),
    Media(MediaParams),
    Delay(DelayParams),
    Condition(Condition),
    Randomizer(RandomizerParams),
    LinkCampaign(LinkCampaignParams),
    Template(TemplateParams),
    Label(LabelParams),
}

impl NodeKind {
    /// Wire name of the kind
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::Message(_) => "message",
            NodeKind::Media(_) => "media",
            NodeKind::Delay(_) => "delay",
            NodeKind::Condition(_) => "condition",
            NodeKind::Randomizer(_) => "randomizer",
            NodeKind::LinkCampaign(_) => "link_campaign",
            NodeKind::Template(_) => "template",
            NodeKind::Label(_) => "label",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    /// Seeds new executions
    pub is_start: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub source_handle: Option<String>,
}

/// Immutable campaign graph
#[derive(Debug, Clone, Default)]
pub struct CampaignGraph {
    nodes: HashMap<String, Node>,
    edges: Vec<Edge>,
    start: Option<String>,
}

impl CampaignGraph {
    /// Build a graph. The first node flagged as start wins.
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        let start = nodes.iter().find(|n| n.is_start).map(|n| n.id.clone());
        let nodes = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        Self { nodes, edges, start }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// The flagged start node, else the node called `fallback_id`
    pub fn start_node(&self, fallback_id: &str) -> Option<&Node> {
        match &self.start {
            Some(id) => self.nodes.get(id),
            None => self.nodes.get(fallback_id),
        }
    }

    /// Target of the first outgoing edge of `current` in authoring order.
    ///
    /// With a required handle only an edge carrying exactly that handle
    /// matches. `None` means the path ends here.
    pub fn next_node(&self, current: &str, required_handle: Option<&str>) -> Option<&str> {
        self.edges
            .iter()
            .filter(|edge| edge.source == current)
            .find(|edge| match required_handle {
                Some(handle) => edge.source_handle.as_deref() == Some(handle),
                None => true,
            })
            .map(|edge| edge.target.as_str())
    }
}

/// A parsed campaign definition
#[derive(Debug, Clone)]
pub enum CampaignDefinition {
    /// Node/edge graph driven by `current_node_id`
    Graph(CampaignGraph),
    /// Ordered step list driven by `current_step_index`
    Linear(Vec<NodeKind>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, kind: NodeKind) -> Node {
        Node {
            id: id.to_string(),
            kind,
            is_start: false,
        }
    }

    fn edge(source: &str, target: &str, handle: Option<&str>) -> Edge {
        Edge {
            source: source.to_string(),
            target: target.to_string(),
            source_handle: handle.map(str::to_string),
        }
    }

    fn randomizer_graph() -> CampaignGraph {
        CampaignGraph::new(
            vec![
                node("r", NodeKind::Randomizer(RandomizerParams { percent_a: 50 })),
                node("x", NodeKind::Start),
                node("y", NodeKind::Start),
            ],
            vec![edge("r", "x", Some("b")), edge("r", "y", Some("a")), edge("r", "x", None)],
        )
    }

    #[test]
    fn test_next_node_with_required_handle() {
        let graph = randomizer_graph();
        assert_eq!(graph.next_node("r", Some("a")), Some("y"));
        assert_eq!(graph.next_node("r", Some("b")), Some("x"));
        assert_eq!(graph.next_node("r", Some("c")), None);
    }

    #[test]
    fn test_next_node_without_handle_takes_first_edge() {
        let graph = randomizer_graph();
        assert_eq!(graph.next_node("r", None), Some("x"));
        assert_eq!(graph.next_node("missing", None), None);
    }

    #[test]
    fn test_start_node_resolution() {
        let mut flagged = node("entry", NodeKind::Start);
        flagged.is_start = true;
        let graph = CampaignGraph::new(vec![node("start", NodeKind::Start), flagged], vec![]);
        assert_eq!(graph.start_node("start").map(|n| n.id.as_str()), Some("entry"));

        let graph = CampaignGraph::new(vec![node("start", NodeKind::Start)], vec![]);
        assert_eq!(graph.start_node("start").map(|n| n.id.as_str()), Some("start"));
        assert!(graph.start_node("begin").is_none());
    }

    #[test]
    fn test_delay_duration_units() {
        assert_eq!(DelayParams::seconds(90).duration(), Duration::seconds(90));
        let two_hours = DelayParams {
            amount: 2,
            unit: DelayUnit::Hours,
        };
        assert_eq!(two_hours.duration(), Duration::hours(2));
    }
}
