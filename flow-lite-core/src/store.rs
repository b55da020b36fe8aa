use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Persistence trait for all engine state.
///
/// Methods are grouped by concern; every call is transactional on its own
/// and reads are strongly consistent with the caller's prior writes. The
/// engine operates exclusively through this trait, enabling pluggable
/// backends (`MemoryStore` for tests and single-process deployments,
/// Postgres for production).
#[async_trait]
pub trait FlowStore: Send + Sync {
    // ── Definitions ──

    async fn save_definition(&self, def: &FlowDefinition) -> Result<()>;
    async fn load_definition(&self, flow_id: Uuid) -> Result<Option<FlowDefinition>>;
    async fn list_flows(&self) -> Result<Vec<Flow>>;

    // ── Flow instances ──

    /// Create a flow instance together with its first node instance and
    /// that instance's candidates. Atomic.
    async fn create_flow_instance(
        &self,
        instance: &FlowInstance,
        first_node: &NodeInstance,
        candidates: &[NodeCandidate],
    ) -> Result<()>;
    async fn load_flow_instance(&self, id: Uuid) -> Result<Option<FlowInstance>>;
    async fn update_flow_instance_status(&self, id: Uuid, status: FlowInstanceStatus)
        -> Result<()>;

    // ── Node instances ──

    /// Create a node instance with its candidates. Atomic.
    async fn create_node_instance(
        &self,
        instance: &NodeInstance,
        candidates: &[NodeCandidate],
    ) -> Result<()>;
    async fn load_node_instance(&self, id: Uuid) -> Result<Option<NodeInstance>>;

    /// The completion write, conditional on the instance still being
    /// running and not cancelled. Returns `false` when the guard fails;
    /// this is the store-side half of the at-most-once invariant.
    async fn complete_node_instance(
        &self,
        id: Uuid,
        processor: &str,
        process_time: EpochSecs,
        out_data: &str,
    ) -> Result<bool>;

    /// True iff the flow instance has at least one running, non-cancelled
    /// node instance.
    async fn has_running_node_instances(&self, flow_instance_id: Uuid) -> Result<bool>;

    /// Soft-delete every running node instance of the flow instance and
    /// tombstone their timer rows. Returns the cancelled instance ids.
    async fn cancel_running_node_instances(
        &self,
        flow_instance_id: Uuid,
        at: EpochSecs,
    ) -> Result<Vec<Uuid>>;

    /// The most recent completed activation of a node within a flow
    /// instance, if any.
    async fn last_completed_node_instance(
        &self,
        flow_instance_id: Uuid,
        node_id: Uuid,
    ) -> Result<Option<NodeInstance>>;

    // ── Candidates ──

    async fn load_candidates(&self, node_instance_id: Uuid) -> Result<Vec<NodeCandidate>>;
    async fn is_candidate(&self, node_instance_id: Uuid, user_id: &str) -> Result<bool>;

    // ── Join barriers ──

    /// Record one arrival at a parallel join and return the new count.
    async fn join_arrive(&self, flow_instance_id: Uuid, join_node_id: Uuid) -> Result<u32>;
    async fn join_reset(&self, flow_instance_id: Uuid, join_node_id: Uuid) -> Result<()>;

    // ── Timers ──

    async fn create_node_timing(&self, timing: &NodeTiming) -> Result<()>;

    /// Tombstone a timer row; at-most-one-firing is decided by whichever of
    /// the tombstone and the completion write lands first.
    async fn delete_node_timing(&self, node_instance_id: Uuid, at: EpochSecs) -> Result<()>;
    async fn expired_node_timings(&self, now: EpochSecs) -> Result<Vec<NodeTiming>>;

    // ── Work queries ──

    async fn query_todo(&self, user_id: &str, filter: &WorkFilter) -> Result<Vec<TodoItem>>;
    async fn query_done(
        &self,
        user_id: &str,
        filter: &WorkFilter,
        since: EpochSecs,
    ) -> Result<Vec<DoneItem>>;
    async fn query_history(&self, flow_instance_id: Uuid) -> Result<Vec<HistoryEntry>>;
}
