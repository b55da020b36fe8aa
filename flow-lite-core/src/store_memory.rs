use crate::store::FlowStore;
use crate::types::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

struct Inner {
    definitions: HashMap<Uuid, FlowDefinition>,
    flow_instances: HashMap<Uuid, FlowInstance>,
    node_instances: HashMap<Uuid, NodeInstance>,
    candidates: HashMap<Uuid, Vec<NodeCandidate>>,
    joins: HashMap<(Uuid, Uuid), u32>,
    /// Keyed by node_instance_id (one timer row per timer-node instance).
    timings: HashMap<Uuid, NodeTiming>,
}

/// In-memory implementation of `FlowStore` for tests and single-process
/// deployments.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                definitions: HashMap::new(),
                flow_instances: HashMap::new(),
                node_instances: HashMap::new(),
                candidates: HashMap::new(),
                joins: HashMap::new(),
                timings: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn node_meta(&self, instance: &NodeInstance) -> Option<(&Flow, &Node, &FlowInstance)> {
        let flow_instance = self.flow_instances.get(&instance.flow_instance_id)?;
        let def = self.definitions.get(&flow_instance.flow_id)?;
        let node = def.nodes.iter().find(|n| n.id == instance.node_id)?;
        Some((&def.flow, node, flow_instance))
    }
}

fn matches_filter(filter: &WorkFilter, flow: &Flow, node: &Node) -> bool {
    if let Some(code) = &filter.flow_code {
        if &flow.code != code {
            return false;
        }
    }
    if let Some(type_code) = filter.type_code {
        if node.type_code != type_code {
            return false;
        }
    }
    true
}

fn apply_limit<T>(items: &mut Vec<T>, limit: usize) {
    if limit > 0 && items.len() > limit {
        items.truncate(limit);
    }
}

#[async_trait]
impl FlowStore for MemoryStore {
    // ── Definitions ──

    async fn save_definition(&self, def: &FlowDefinition) -> Result<()> {
        let mut w = self.inner.write().await;
        w.definitions.insert(def.flow.id, def.clone());
        Ok(())
    }

    async fn load_definition(&self, flow_id: Uuid) -> Result<Option<FlowDefinition>> {
        let r = self.inner.read().await;
        Ok(r.definitions.get(&flow_id).cloned())
    }

    async fn list_flows(&self) -> Result<Vec<Flow>> {
        let r = self.inner.read().await;
        let mut flows: Vec<Flow> = r.definitions.values().map(|d| d.flow.clone()).collect();
        flows.sort_by(|a, b| a.code.cmp(&b.code).then(a.version.cmp(&b.version)));
        Ok(flows)
    }

    // ── Flow instances ──

    async fn create_flow_instance(
        &self,
        instance: &FlowInstance,
        first_node: &NodeInstance,
        candidates: &[NodeCandidate],
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        w.flow_instances.insert(instance.id, instance.clone());
        w.node_instances.insert(first_node.id, first_node.clone());
        w.candidates.insert(first_node.id, candidates.to_vec());
        Ok(())
    }

    async fn load_flow_instance(&self, id: Uuid) -> Result<Option<FlowInstance>> {
        let r = self.inner.read().await;
        Ok(r.flow_instances.get(&id).cloned())
    }

    async fn update_flow_instance_status(
        &self,
        id: Uuid,
        status: FlowInstanceStatus,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        let instance = w
            .flow_instances
            .get_mut(&id)
            .ok_or_else(|| anyhow!("flow instance not found: {id}"))?;
        instance.status = status;
        Ok(())
    }

    // ── Node instances ──

    async fn create_node_instance(
        &self,
        instance: &NodeInstance,
        candidates: &[NodeCandidate],
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        w.node_instances.insert(instance.id, instance.clone());
        w.candidates.insert(instance.id, candidates.to_vec());
        Ok(())
    }

    async fn load_node_instance(&self, id: Uuid) -> Result<Option<NodeInstance>> {
        let r = self.inner.read().await;
        Ok(r.node_instances.get(&id).cloned())
    }

    async fn complete_node_instance(
        &self,
        id: Uuid,
        processor: &str,
        process_time: EpochSecs,
        out_data: &str,
    ) -> Result<bool> {
        let mut w = self.inner.write().await;
        let instance = match w.node_instances.get_mut(&id) {
            Some(instance) => instance,
            None => return Ok(false),
        };
        if instance.status != NodeInstanceStatus::Running || instance.deleted.is_some() {
            return Ok(false);
        }
        instance.processor = processor.to_string();
        instance.process_time = process_time;
        instance.out_data = out_data.to_string();
        instance.status = NodeInstanceStatus::Complete;
        Ok(true)
    }

    async fn has_running_node_instances(&self, flow_instance_id: Uuid) -> Result<bool> {
        let r = self.inner.read().await;
        Ok(r.node_instances.values().any(|ni| {
            ni.flow_instance_id == flow_instance_id
                && ni.status == NodeInstanceStatus::Running
                && ni.deleted.is_none()
        }))
    }

    async fn cancel_running_node_instances(
        &self,
        flow_instance_id: Uuid,
        at: EpochSecs,
    ) -> Result<Vec<Uuid>> {
        let mut w = self.inner.write().await;
        let mut cancelled = Vec::new();
        for instance in w.node_instances.values_mut() {
            if instance.flow_instance_id == flow_instance_id
                && instance.status == NodeInstanceStatus::Running
                && instance.deleted.is_none()
            {
                instance.deleted = Some(at);
                cancelled.push(instance.id);
            }
        }
        for id in &cancelled {
            if let Some(timing) = w.timings.get_mut(id) {
                if timing.deleted.is_none() {
                    timing.deleted = Some(at);
                }
            }
        }
        Ok(cancelled)
    }

    async fn last_completed_node_instance(
        &self,
        flow_instance_id: Uuid,
        node_id: Uuid,
    ) -> Result<Option<NodeInstance>> {
        let r = self.inner.read().await;
        Ok(r.node_instances
            .values()
            .filter(|ni| {
                ni.flow_instance_id == flow_instance_id
                    && ni.node_id == node_id
                    && ni.status == NodeInstanceStatus::Complete
            })
            .max_by_key(|ni| (ni.process_time, ni.created, ni.id))
            .cloned())
    }

    // ── Candidates ──

    async fn load_candidates(&self, node_instance_id: Uuid) -> Result<Vec<NodeCandidate>> {
        let r = self.inner.read().await;
        Ok(r.candidates
            .get(&node_instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn is_candidate(&self, node_instance_id: Uuid, user_id: &str) -> Result<bool> {
        let r = self.inner.read().await;
        Ok(r.candidates
            .get(&node_instance_id)
            .is_some_and(|c| c.iter().any(|cand| cand.candidate_id == user_id)))
    }

    // ── Join barriers ──

    async fn join_arrive(&self, flow_instance_id: Uuid, join_node_id: Uuid) -> Result<u32> {
        let mut w = self.inner.write().await;
        let count = w.joins.entry((flow_instance_id, join_node_id)).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn join_reset(&self, flow_instance_id: Uuid, join_node_id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        w.joins.remove(&(flow_instance_id, join_node_id));
        Ok(())
    }

    // ── Timers ──

    async fn create_node_timing(&self, timing: &NodeTiming) -> Result<()> {
        let mut w = self.inner.write().await;
        w.timings.insert(timing.node_instance_id, timing.clone());
        Ok(())
    }

    async fn delete_node_timing(&self, node_instance_id: Uuid, at: EpochSecs) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(timing) = w.timings.get_mut(&node_instance_id) {
            if timing.deleted.is_none() {
                timing.deleted = Some(at);
            }
        }
        Ok(())
    }

    async fn expired_node_timings(&self, now: EpochSecs) -> Result<Vec<NodeTiming>> {
        let r = self.inner.read().await;
        let mut expired: Vec<NodeTiming> = r
            .timings
            .values()
            .filter(|t| t.deleted.is_none() && t.expires_at <= now)
            .cloned()
            .collect();
        expired.sort_by_key(|t| t.expires_at);
        Ok(expired)
    }

    // ── Work queries ──

    async fn query_todo(&self, user_id: &str, filter: &WorkFilter) -> Result<Vec<TodoItem>> {
        let r = self.inner.read().await;
        let mut items = Vec::new();
        for instance in r.node_instances.values() {
            if instance.status != NodeInstanceStatus::Running || instance.deleted.is_some() {
                continue;
            }
            let is_candidate = r
                .candidates
                .get(&instance.id)
                .is_some_and(|c| c.iter().any(|cand| cand.candidate_id == user_id));
            if !is_candidate {
                continue;
            }
            let Some((flow, node, flow_instance)) = r.node_meta(instance) else {
                continue;
            };
            if !matches_filter(filter, flow, node) {
                continue;
            }
            items.push(TodoItem {
                node_instance_id: instance.id,
                flow_instance_id: instance.flow_instance_id,
                flow_code: flow.code.clone(),
                flow_name: flow.name.clone(),
                node_id: node.id,
                node_code: node.code.clone(),
                node_name: node.name.clone(),
                node_type: node.type_code,
                input_data: instance.input_data.clone(),
                launcher: flow_instance.launcher.clone(),
                launch_time: flow_instance.launch_time,
                created: instance.created,
            });
        }
        items.sort_by_key(|i| i.created);
        apply_limit(&mut items, filter.limit);
        Ok(items)
    }

    async fn query_done(
        &self,
        user_id: &str,
        filter: &WorkFilter,
        since: EpochSecs,
    ) -> Result<Vec<DoneItem>> {
        let r = self.inner.read().await;
        let mut items = Vec::new();
        for instance in r.node_instances.values() {
            if instance.status != NodeInstanceStatus::Complete
                || instance.processor != user_id
                || instance.process_time < since
            {
                continue;
            }
            let Some((flow, node, _)) = r.node_meta(instance) else {
                continue;
            };
            if !matches_filter(filter, flow, node) {
                continue;
            }
            items.push(DoneItem {
                node_instance_id: instance.id,
                flow_instance_id: instance.flow_instance_id,
                flow_code: flow.code.clone(),
                flow_name: flow.name.clone(),
                node_id: node.id,
                node_code: node.code.clone(),
                node_name: node.name.clone(),
                node_type: node.type_code,
                processor: instance.processor.clone(),
                process_time: instance.process_time,
                out_data: instance.out_data.clone(),
                created: instance.created,
            });
        }
        items.sort_by(|a, b| b.process_time.cmp(&a.process_time));
        apply_limit(&mut items, filter.limit);
        Ok(items)
    }

    async fn query_history(&self, flow_instance_id: Uuid) -> Result<Vec<HistoryEntry>> {
        let r = self.inner.read().await;
        let mut entries = Vec::new();
        for instance in r.node_instances.values() {
            if instance.flow_instance_id != flow_instance_id
                || instance.status != NodeInstanceStatus::Complete
            {
                continue;
            }
            let Some((_, node, _)) = r.node_meta(instance) else {
                continue;
            };
            entries.push(HistoryEntry {
                node_instance_id: instance.id,
                node_id: node.id,
                node_code: node.code.clone(),
                node_name: node.name.clone(),
                node_type: node.type_code,
                processor: instance.processor.clone(),
                process_time: instance.process_time,
                input_data: instance.input_data.clone(),
                out_data: instance.out_data.clone(),
            });
        }
        // UUIDv7 ids keep same-second completions in creation order.
        entries.sort_by_key(|e| (e.process_time, e.node_instance_id));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_flow_instance(flow_id: Uuid) -> FlowInstance {
        FlowInstance {
            id: Uuid::now_v7(),
            flow_id,
            launcher: "T001".to_string(),
            launch_time: 1_000,
            status: FlowInstanceStatus::Running,
            created: 1_000,
        }
    }

    fn make_node_instance(flow_instance_id: Uuid, node_id: Uuid) -> NodeInstance {
        NodeInstance {
            id: Uuid::now_v7(),
            flow_instance_id,
            node_id,
            input_data: r#"{"day":1}"#.to_string(),
            out_data: String::new(),
            processor: String::new(),
            process_time: 0,
            status: NodeInstanceStatus::Running,
            created: 1_000,
            deleted: None,
        }
    }

    fn make_candidate(node_instance_id: Uuid, user: &str) -> NodeCandidate {
        NodeCandidate {
            id: Uuid::now_v7(),
            node_instance_id,
            candidate_id: user.to_string(),
            created: 1_000,
        }
    }

    #[tokio::test]
    async fn flow_instance_round_trip() {
        let store = MemoryStore::new();
        let instance = make_flow_instance(Uuid::now_v7());
        let node = make_node_instance(instance.id, Uuid::now_v7());
        let candidate = make_candidate(node.id, "T002");

        store
            .create_flow_instance(&instance, &node, &[candidate])
            .await
            .unwrap();

        let loaded = store.load_flow_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.launcher, "T001");
        assert_eq!(loaded.status, FlowInstanceStatus::Running);

        assert!(store.is_candidate(node.id, "T002").await.unwrap());
        assert!(!store.is_candidate(node.id, "T999").await.unwrap());
    }

    #[tokio::test]
    async fn completion_succeeds_exactly_once() {
        let store = MemoryStore::new();
        let node = make_node_instance(Uuid::now_v7(), Uuid::now_v7());
        store.create_node_instance(&node, &[]).await.unwrap();

        assert!(store
            .complete_node_instance(node.id, "T002", 2_000, "{}")
            .await
            .unwrap());
        assert!(!store
            .complete_node_instance(node.id, "T003", 2_001, "{}")
            .await
            .unwrap());

        let loaded = store.load_node_instance(node.id).await.unwrap().unwrap();
        assert_eq!(loaded.processor, "T002");
        assert_eq!(loaded.status, NodeInstanceStatus::Complete);
    }

    #[tokio::test]
    async fn cancelled_instances_refuse_completion() {
        let store = MemoryStore::new();
        let flow_instance_id = Uuid::now_v7();
        let node = make_node_instance(flow_instance_id, Uuid::now_v7());
        store.create_node_instance(&node, &[]).await.unwrap();

        let cancelled = store
            .cancel_running_node_instances(flow_instance_id, 3_000)
            .await
            .unwrap();
        assert_eq!(cancelled, vec![node.id]);

        assert!(!store
            .complete_node_instance(node.id, "T002", 3_001, "{}")
            .await
            .unwrap());
        assert!(!store
            .has_running_node_instances(flow_instance_id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cancel_tombstones_timer_rows() {
        let store = MemoryStore::new();
        let flow_instance_id = Uuid::now_v7();
        let node = make_node_instance(flow_instance_id, Uuid::now_v7());
        store.create_node_instance(&node, &[]).await.unwrap();
        store
            .create_node_timing(&NodeTiming {
                id: Uuid::now_v7(),
                node_instance_id: node.id,
                flow_instance_id,
                expires_at: 1_500,
                created: 1_000,
                deleted: None,
            })
            .await
            .unwrap();

        assert_eq!(store.expired_node_timings(2_000).await.unwrap().len(), 1);

        store
            .cancel_running_node_instances(flow_instance_id, 3_000)
            .await
            .unwrap();
        assert!(store.expired_node_timings(2_000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn join_barrier_counts_and_resets() {
        let store = MemoryStore::new();
        let fi = Uuid::now_v7();
        let join = Uuid::now_v7();

        assert_eq!(store.join_arrive(fi, join).await.unwrap(), 1);
        assert_eq!(store.join_arrive(fi, join).await.unwrap(), 2);
        store.join_reset(fi, join).await.unwrap();
        assert_eq!(store.join_arrive(fi, join).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn last_completed_prefers_most_recent() {
        let store = MemoryStore::new();
        let flow_instance_id = Uuid::now_v7();
        let node_id = Uuid::now_v7();

        let first = make_node_instance(flow_instance_id, node_id);
        store.create_node_instance(&first, &[]).await.unwrap();
        store
            .complete_node_instance(first.id, "T001", 1_000, "{}")
            .await
            .unwrap();

        let second = make_node_instance(flow_instance_id, node_id);
        store.create_node_instance(&second, &[]).await.unwrap();
        store
            .complete_node_instance(second.id, "T005", 2_000, "{}")
            .await
            .unwrap();

        let last = store
            .last_completed_node_instance(flow_instance_id, node_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.processor, "T005");
    }
}
