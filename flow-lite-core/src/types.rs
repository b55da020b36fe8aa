use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch seconds (UTC).
pub type EpochSecs = i64;

/// The variable bag carried through a flow instance: input and output of
/// every node instance, and the context guards and assignments evaluate in.
pub type VarBag = BTreeMap<String, serde_json::Value>;

/// Serialize a variable bag to its stored JSON blob.
pub fn encode_bag(bag: &VarBag) -> String {
    serde_json::to_string(bag).unwrap_or_else(|_| "{}".to_string())
}

/// Parse a stored JSON blob back into a variable bag. Empty or malformed
/// blobs decode to an empty bag.
pub fn decode_bag(raw: &str) -> VarBag {
    if raw.trim().is_empty() {
        return VarBag::new();
    }
    serde_json::from_str(raw).unwrap_or_default()
}

/// Merge the output bag over the input bag. Output wins on key collision;
/// the result is the transition bag of a completed node instance.
pub fn merge_bags(input: &VarBag, out: &VarBag) -> VarBag {
    let mut merged = input.clone();
    for (key, value) in out {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

// ─── Node types ───────────────────────────────────────────────

/// BPMN node type of a definition node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    StartEvent,
    EndEvent,
    UserTask,
    ServiceTask,
    ExclusiveGateway,
    ParallelGateway,
    TimerEvent,
}

impl NodeType {
    /// Gateways are traversed inside a routing step and never materialise
    /// node instances.
    pub fn is_gateway(self) -> bool {
        matches!(self, NodeType::ExclusiveGateway | NodeType::ParallelGateway)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::StartEvent => "startEvent",
            NodeType::EndEvent => "endEvent",
            NodeType::UserTask => "userTask",
            NodeType::ServiceTask => "serviceTask",
            NodeType::ExclusiveGateway => "exclusiveGateway",
            NodeType::ParallelGateway => "parallelGateway",
            NodeType::TimerEvent => "timerEvent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "startEvent" => Some(NodeType::StartEvent),
            "endEvent" => Some(NodeType::EndEvent),
            "userTask" => Some(NodeType::UserTask),
            "serviceTask" => Some(NodeType::ServiceTask),
            "exclusiveGateway" => Some(NodeType::ExclusiveGateway),
            "parallelGateway" => Some(NodeType::ParallelGateway),
            "timerEvent" => Some(NodeType::TimerEvent),
            _ => None,
        }
    }
}

// ─── Definition entities ──────────────────────────────────────

/// Lifecycle status of a flow definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Active,
    Disabled,
}

impl FlowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowStatus::Active => "active",
            FlowStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(FlowStatus::Active),
            "disabled" => Some(FlowStatus::Disabled),
            _ => None,
        }
    }
}

/// A process definition header. Identified by `(code, version)`; immutable
/// once loaded. The newest active version serves new launches.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Flow {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub version: i64,
    pub status: FlowStatus,
    pub created: EpochSecs,
}

/// A node of a flow definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub code: String,
    pub type_code: NodeType,
    pub name: String,
}

/// A directed edge between two nodes. `expression` is the guard (empty ≡
/// true); `order` is the declared evaluation order per source node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouterEdge {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub source_node_id: Uuid,
    pub target_node_id: Uuid,
    pub expression: String,
    pub order: i32,
}

/// A candidate-assignment rule: a list-valued expression attached to a node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub node_id: Uuid,
    pub expression: String,
}

/// Scalar node metadata, e.g. `duration` on timer nodes or `candidate`
/// naming the bag variable used as the assignment fallback.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeProperty {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub node_id: Uuid,
    pub name: String,
    pub value: String,
}

/// A form carried with the definition. Opaque to the engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Form {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub code: String,
    pub data: String,
}

/// Binds a node to the form presented with its work items.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeForm {
    pub flow_id: Uuid,
    pub node_id: Uuid,
    pub form_id: Uuid,
}

/// A fully parsed process definition: the loader's output and the input to
/// graph construction and definition persistence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub flow: Flow,
    pub nodes: Vec<Node>,
    pub routers: Vec<RouterEdge>,
    pub assignments: Vec<Assignment>,
    pub properties: Vec<NodeProperty>,
    pub forms: Vec<Form>,
    pub node_forms: Vec<NodeForm>,
}

// ─── Runtime entities ─────────────────────────────────────────

/// Lifecycle of a flow instance: `Running → Complete | Stopped`, both
/// terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowInstanceStatus {
    Running,
    Complete,
    Stopped,
}

impl FlowInstanceStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, FlowInstanceStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlowInstanceStatus::Running => "running",
            FlowInstanceStatus::Complete => "complete",
            FlowInstanceStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(FlowInstanceStatus::Running),
            "complete" => Some(FlowInstanceStatus::Complete),
            "stopped" => Some(FlowInstanceStatus::Stopped),
            _ => None,
        }
    }
}

/// Lifecycle of a node instance: `Running → Complete`, exactly once.
/// Cancellation is soft deletion, never a completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeInstanceStatus {
    Running,
    Complete,
}

impl NodeInstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeInstanceStatus::Running => "running",
            NodeInstanceStatus::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(NodeInstanceStatus::Running),
            "complete" => Some(NodeInstanceStatus::Complete),
            _ => None,
        }
    }
}

/// A single execution of a flow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowInstance {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub launcher: String,
    pub launch_time: EpochSecs,
    pub status: FlowInstanceStatus,
    pub created: EpochSecs,
}

/// A single activation of a node within a flow instance. `input_data` and
/// `out_data` are serialised variable bags.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: Uuid,
    pub flow_instance_id: Uuid,
    pub node_id: Uuid,
    pub input_data: String,
    pub out_data: String,
    pub processor: String,
    pub process_time: EpochSecs,
    pub status: NodeInstanceStatus,
    pub created: EpochSecs,
    pub deleted: Option<EpochSecs>,
}

/// A principal authorised to complete a node instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeCandidate {
    pub id: Uuid,
    pub node_instance_id: Uuid,
    pub candidate_id: String,
    pub created: EpochSecs,
}

/// The pending-fire row of a running timer-node instance. `deleted` is the
/// tombstone that guarantees at-most-one firing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeTiming {
    pub id: Uuid,
    pub node_instance_id: Uuid,
    pub flow_instance_id: Uuid,
    pub expires_at: EpochSecs,
    pub created: EpochSecs,
    pub deleted: Option<EpochSecs>,
}

// ─── API results ──────────────────────────────────────────────

/// A node instance materialised by a routing step, with its resolved
/// candidate set (empty for timer nodes).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NextNode {
    pub node_instance_id: Uuid,
    pub node_id: Uuid,
    pub node_code: String,
    pub node_name: String,
    pub candidate_ids: Vec<String>,
}

/// Result of `start_flow`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartResult {
    pub flow_instance_id: Uuid,
    pub next_nodes: Vec<NextNode>,
    pub is_end: bool,
}

/// Result of `handle_flow`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandleResult {
    pub flow_instance_id: Uuid,
    pub next_nodes: Vec<NextNode>,
    pub is_end: bool,
}

/// Filter for the todo/done query surfaces. A zero `limit` means unbounded.
#[derive(Clone, Debug, Default)]
pub struct WorkFilter {
    pub flow_code: Option<String>,
    pub type_code: Option<NodeType>,
    pub limit: usize,
}

/// A pending work item of one user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TodoItem {
    pub node_instance_id: Uuid,
    pub flow_instance_id: Uuid,
    pub flow_code: String,
    pub flow_name: String,
    pub node_id: Uuid,
    pub node_code: String,
    pub node_name: String,
    pub node_type: NodeType,
    pub input_data: String,
    pub launcher: String,
    pub launch_time: EpochSecs,
    pub created: EpochSecs,
}

/// A work item completed by one user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DoneItem {
    pub node_instance_id: Uuid,
    pub flow_instance_id: Uuid,
    pub flow_code: String,
    pub flow_name: String,
    pub node_id: Uuid,
    pub node_code: String,
    pub node_name: String,
    pub node_type: NodeType,
    pub processor: String,
    pub process_time: EpochSecs,
    pub out_data: String,
    pub created: EpochSecs,
}

/// One step of a flow instance's history, derived from its completed node
/// instances.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub node_instance_id: Uuid,
    pub node_id: Uuid,
    pub node_code: String,
    pub node_name: String,
    pub node_type: NodeType,
    pub processor: String,
    pub process_time: EpochSecs,
    pub input_data: String,
    pub out_data: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bag_round_trip() {
        let mut bag = VarBag::new();
        bag.insert("day".to_string(), json!(3));
        bag.insert("bzr".to_string(), json!("T002"));

        let encoded = encode_bag(&bag);
        assert_eq!(decode_bag(&encoded), bag);
    }

    #[test]
    fn empty_and_malformed_blobs_decode_to_empty_bag() {
        assert!(decode_bag("").is_empty());
        assert!(decode_bag("   ").is_empty());
        assert!(decode_bag("not json").is_empty());
    }

    #[test]
    fn merge_prefers_output_values() {
        let mut input = VarBag::new();
        input.insert("action".to_string(), json!("back"));
        input.insert("day".to_string(), json!(1));

        let mut out = VarBag::new();
        out.insert("action".to_string(), json!("pass"));

        let merged = merge_bags(&input, &out);
        assert_eq!(merged["action"], json!("pass"));
        assert_eq!(merged["day"], json!(1));
    }

    #[test]
    fn node_type_str_round_trip() {
        for t in [
            NodeType::StartEvent,
            NodeType::EndEvent,
            NodeType::UserTask,
            NodeType::ServiceTask,
            NodeType::ExclusiveGateway,
            NodeType::ParallelGateway,
            NodeType::TimerEvent,
        ] {
            assert_eq!(NodeType::parse(t.as_str()), Some(t));
        }
        assert_eq!(NodeType::parse("subProcess"), None);
    }
}
