//! The execution controller: the top-level engine facade that wires the
//! graph registry, router, evaluator and store together.

use crate::bpmn;
use crate::error::{FlowError, Result};
use crate::eval::Evaluator;
use crate::graph::{GraphRegistry, ProcessGraph};
use crate::router::{Router, TIMER_PROCESSOR};
use crate::store::FlowStore;
use crate::types::*;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Wall-clock seam so tests can pin time.
pub trait Clock: Send + Sync {
    fn now(&self) -> EpochSecs;
}

/// Production clock: epoch seconds from the system clock.
#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> EpochSecs {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

const LOCK_SHARDS: usize = 64;

/// Sharded per-node-instance locks. A shard is held for the whole
/// completion + routing critical section; the store's conditional
/// completion write backs it up across processes.
struct LockShards {
    shards: Vec<Mutex<()>>,
}

impl LockShards {
    fn new() -> Self {
        Self {
            shards: (0..LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn acquire(&self, id: Uuid) -> MutexGuard<'_, ()> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        self.shards[index].lock().await
    }
}

/// The workflow engine. Construct with an explicit store and evaluator;
/// safe to share behind an `Arc` and call concurrently.
pub struct FlowEngine {
    store: Arc<dyn FlowStore>,
    evaluator: Arc<dyn Evaluator>,
    registry: GraphRegistry,
    clock: Arc<dyn Clock>,
    locks: LockShards,
}

impl FlowEngine {
    pub fn new(store: Arc<dyn FlowStore>, evaluator: Arc<dyn Evaluator>) -> Self {
        Self::with_clock(store, evaluator, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn FlowStore>,
        evaluator: Arc<dyn Evaluator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            evaluator,
            registry: GraphRegistry::new(),
            clock,
            locks: LockShards::new(),
        }
    }

    // ── Definitions ──

    /// Parse, validate, persist and publish a BPMN definition. Reloading a
    /// code bumps the version; new launches use the newest version while
    /// in-flight instances keep their own.
    pub async fn load_definition(&self, xml: &str) -> Result<Flow> {
        let mut def = bpmn::parse_bpmn(xml)?;
        def.flow.version = self.registry.latest_version(&def.flow.code).await + 1;
        def.flow.created = self.clock.now();

        let graph = Arc::new(ProcessGraph::build(&def)?);
        self.store.save_definition(&def).await?;
        self.registry.publish(graph).await;

        tracing::info!(
            code = %def.flow.code,
            version = def.flow.version,
            "flow definition loaded"
        );
        Ok(def.flow)
    }

    /// Republish every persisted definition, e.g. after a restart.
    pub async fn restore(&self) -> Result<usize> {
        let flows = self.store.list_flows().await?;
        let mut restored = 0;
        for flow in flows {
            let Some(def) = self.store.load_definition(flow.id).await? else {
                continue;
            };
            match ProcessGraph::build(&def) {
                Ok(graph) => {
                    self.registry.publish(Arc::new(graph)).await;
                    restored += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        code = %def.flow.code,
                        version = def.flow.version,
                        error = %err,
                        "skipping unusable persisted definition"
                    );
                }
            }
        }
        Ok(restored)
    }

    // ── Flow lifecycle ──

    /// Launch a flow instance: locate the newest active version of
    /// `flow_code` and the start node by `start_node_code`, create the flow
    /// instance plus the start node instance, then immediately run the
    /// router as if the start node completed with the launch variables.
    ///
    /// The first-hop guards are evaluated before anything is written, so a
    /// `NoRoute` failure leaves no state behind.
    pub async fn start_flow(
        &self,
        flow_code: &str,
        start_node_code: &str,
        launcher: &str,
        input: VarBag,
    ) -> Result<StartResult> {
        let graph = self
            .registry
            .by_code(flow_code)
            .await
            .ok_or_else(|| FlowError::FlowNotFound(flow_code.to_string()))?;
        let start_node = graph
            .node_by_code(start_node_code)
            .ok_or_else(|| FlowError::NodeNotFound(start_node_code.to_string()))?;

        let now = self.clock.now();
        let router = Router {
            graph: &graph,
            store: self.store.as_ref(),
            evaluator: self.evaluator.as_ref(),
            now,
        };
        let edges = router.select_edges(start_node, &input)?;

        let instance = FlowInstance {
            id: Uuid::now_v7(),
            flow_id: graph.flow().id,
            launcher: launcher.to_string(),
            launch_time: now,
            status: FlowInstanceStatus::Running,
            created: now,
        };
        let input_blob = encode_bag(&input);
        let first_node = NodeInstance {
            id: Uuid::now_v7(),
            flow_instance_id: instance.id,
            node_id: start_node.id,
            input_data: input_blob.clone(),
            out_data: String::new(),
            processor: String::new(),
            process_time: 0,
            status: NodeInstanceStatus::Running,
            created: now,
            deleted: None,
        };
        let launcher_candidate = NodeCandidate {
            id: Uuid::now_v7(),
            node_instance_id: first_node.id,
            candidate_id: launcher.to_string(),
            created: now,
        };
        self.store
            .create_flow_instance(&instance, &first_node, &[launcher_candidate])
            .await?;

        if !self
            .store
            .complete_node_instance(first_node.id, launcher, now, &input_blob)
            .await?
        {
            return Err(FlowError::AlreadyDone(first_node.id));
        }

        let outcome = router.advance(&instance, edges, &input).await?;
        let is_end = self.finish_if_drained(instance.id, outcome.reached_end).await?;

        tracing::info!(
            flow = %flow_code,
            flow_instance = %instance.id,
            launcher = %launcher,
            next = outcome.next_nodes.len(),
            "flow instance started"
        );
        Ok(StartResult {
            flow_instance_id: instance.id,
            next_nodes: outcome.next_nodes,
            is_end,
        })
    }

    /// Complete a node instance as `user_id` with output variables, then
    /// route. Runs under the instance's lock shard; the store's conditional
    /// completion write guarantees at-most-once even across processes.
    pub async fn handle_flow(
        &self,
        node_instance_id: Uuid,
        user_id: &str,
        out_vars: VarBag,
    ) -> Result<HandleResult> {
        let _guard = self.locks.acquire(node_instance_id).await;
        self.complete_and_route(node_instance_id, user_id, Some(out_vars), true)
            .await
    }

    /// Stop a flow instance: terminal status, every running node instance
    /// deactivated, timers tombstoned. Idempotent.
    pub async fn stop_flow(&self, flow_instance_id: Uuid) -> Result<()> {
        let instance = self
            .store
            .load_flow_instance(flow_instance_id)
            .await?
            .ok_or(FlowError::FlowInstanceNotFound(flow_instance_id))?;
        if instance.status.is_terminal() {
            return Ok(());
        }

        let now = self.clock.now();
        let cancelled = self
            .store
            .cancel_running_node_instances(flow_instance_id, now)
            .await?;
        self.store
            .update_flow_instance_status(flow_instance_id, FlowInstanceStatus::Stopped)
            .await?;

        tracing::info!(
            flow_instance = %flow_instance_id,
            cancelled = cancelled.len(),
            "flow instance stopped"
        );
        Ok(())
    }

    pub async fn flow_instance(&self, id: Uuid) -> Result<FlowInstance> {
        self.store
            .load_flow_instance(id)
            .await?
            .ok_or(FlowError::FlowInstanceNotFound(id))
    }

    /// The form bound to a node of the newest active version of
    /// `flow_code`, if any.
    pub async fn node_form(&self, flow_code: &str, node_code: &str) -> Result<Option<Form>> {
        let graph = self
            .registry
            .by_code(flow_code)
            .await
            .ok_or_else(|| FlowError::FlowNotFound(flow_code.to_string()))?;
        let node = graph
            .node_by_code(node_code)
            .ok_or_else(|| FlowError::NodeNotFound(node_code.to_string()))?;
        let Some(form_id) = graph.form_of(node.id) else {
            return Ok(None);
        };
        let def = self
            .store
            .load_definition(graph.flow().id)
            .await?
            .ok_or_else(|| FlowError::FlowNotFound(flow_code.to_string()))?;
        Ok(def.forms.into_iter().find(|f| f.id == form_id))
    }

    // ── Work queries ──

    pub async fn query_todo(&self, user_id: &str, filter: &WorkFilter) -> Result<Vec<TodoItem>> {
        Ok(self.store.query_todo(user_id, filter).await?)
    }

    pub async fn query_done(
        &self,
        user_id: &str,
        filter: &WorkFilter,
        since: EpochSecs,
    ) -> Result<Vec<DoneItem>> {
        Ok(self.store.query_done(user_id, filter, since).await?)
    }

    pub async fn query_history(&self, flow_instance_id: Uuid) -> Result<Vec<HistoryEntry>> {
        Ok(self.store.query_history(flow_instance_id).await?)
    }

    // ── Timers ──

    /// One sweep of expired timer rows. Each fire advances its instance
    /// exactly once; failures are logged and retried on the next sweep.
    /// Returns how many timers fired.
    pub async fn sweep_timers(&self) -> usize {
        let now = self.clock.now();
        let expired = match self.store.expired_node_timings(now).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(error = %err, "timer sweep query failed");
                return 0;
            }
        };

        let mut fired = 0;
        for timing in expired {
            match self.fire_timer(&timing).await {
                Ok(_) => fired += 1,
                Err(FlowError::AlreadyDone(_)) => {
                    // Lost the race against a completion or a cancellation;
                    // tombstone the stale row so it stops reappearing.
                    if let Err(err) = self
                        .store
                        .delete_node_timing(timing.node_instance_id, now)
                        .await
                    {
                        tracing::warn!(
                            node_instance = %timing.node_instance_id,
                            error = %err,
                            "failed to tombstone stale timer row"
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        node_instance = %timing.node_instance_id,
                        error = %err,
                        "timer fire failed, will retry next sweep"
                    );
                }
            }
        }
        fired
    }

    /// Fire one expired timer: synthetic completion (`__timer__`, output =
    /// input) under the same serialisation as `handle_flow`.
    async fn fire_timer(&self, timing: &NodeTiming) -> Result<HandleResult> {
        let _guard = self.locks.acquire(timing.node_instance_id).await;
        self.complete_and_route(timing.node_instance_id, TIMER_PROCESSOR, None, false)
            .await
    }

    // ── Shared completion + routing core ──

    async fn complete_and_route(
        &self,
        node_instance_id: Uuid,
        processor: &str,
        out_vars: Option<VarBag>,
        check_candidate: bool,
    ) -> Result<HandleResult> {
        let node_instance = self
            .store
            .load_node_instance(node_instance_id)
            .await?
            .ok_or(FlowError::NodeInstanceNotFound(node_instance_id))?;
        if node_instance.status != NodeInstanceStatus::Running || node_instance.deleted.is_some() {
            return Err(FlowError::AlreadyDone(node_instance_id));
        }
        if check_candidate && !self.store.is_candidate(node_instance_id, processor).await? {
            return Err(FlowError::NotCandidate {
                user: processor.to_string(),
                node_instance: node_instance_id,
            });
        }

        let instance = self
            .store
            .load_flow_instance(node_instance.flow_instance_id)
            .await?
            .ok_or(FlowError::FlowInstanceNotFound(node_instance.flow_instance_id))?;
        if instance.status.is_terminal() {
            return Err(FlowError::AlreadyDone(node_instance_id));
        }

        let graph = self.graph_for(instance.flow_id).await?;
        let node = graph
            .node(node_instance.node_id)
            .ok_or_else(|| FlowError::NodeNotFound(node_instance.node_id.to_string()))?;

        let input = decode_bag(&node_instance.input_data);
        let out = out_vars.unwrap_or_else(|| input.clone());
        let bag = merge_bags(&input, &out);

        let now = self.clock.now();
        let router = Router {
            graph: &graph,
            store: self.store.as_ref(),
            evaluator: self.evaluator.as_ref(),
            now,
        };
        // First-hop selection before the completion write: a NoRoute here
        // leaves the instance untouched.
        let edges = router.select_edges(node, &bag)?;

        if !self
            .store
            .complete_node_instance(node_instance_id, processor, now, &encode_bag(&out))
            .await?
        {
            return Err(FlowError::AlreadyDone(node_instance_id));
        }
        if node.type_code == NodeType::TimerEvent {
            self.store.delete_node_timing(node_instance_id, now).await?;
        }

        let outcome = router.advance(&instance, edges, &bag).await?;
        let is_end = self.finish_if_drained(instance.id, outcome.reached_end).await?;

        tracing::debug!(
            node = %node.code,
            node_instance = %node_instance_id,
            processor = %processor,
            next = outcome.next_nodes.len(),
            is_end,
            "node instance completed"
        );
        Ok(HandleResult {
            flow_instance_id: instance.id,
            next_nodes: outcome.next_nodes,
            is_end,
        })
    }

    /// The flow instance completes only when an end event was reached and
    /// no running tokens remain.
    async fn finish_if_drained(&self, flow_instance_id: Uuid, reached_end: bool) -> Result<bool> {
        if !reached_end {
            return Ok(false);
        }
        if self
            .store
            .has_running_node_instances(flow_instance_id)
            .await?
        {
            return Ok(false);
        }
        self.store
            .update_flow_instance_status(flow_instance_id, FlowInstanceStatus::Complete)
            .await?;
        tracing::info!(flow_instance = %flow_instance_id, "flow instance complete");
        Ok(true)
    }

    /// Graph for a flow id: registry first, falling back to the persisted
    /// definition (covers instances launched before a restart).
    async fn graph_for(&self, flow_id: Uuid) -> Result<Arc<ProcessGraph>> {
        if let Some(graph) = self.registry.by_flow_id(flow_id).await {
            return Ok(graph);
        }
        let def = self
            .store
            .load_definition(flow_id)
            .await?
            .ok_or_else(|| FlowError::FlowNotFound(flow_id.to_string()))?;
        let graph = Arc::new(ProcessGraph::build(&def)?);
        self.registry.publish(graph.clone()).await;
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::RhaiEvaluator;
    use crate::store_memory::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct ManualClock(AtomicI64);

    impl ManualClock {
        fn new(start: EpochSecs) -> Arc<Self> {
            Arc::new(Self(AtomicI64::new(start)))
        }

        fn advance(&self, secs: EpochSecs) {
            self.0.fetch_add(secs, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> EpochSecs {
            self.0.load(Ordering::SeqCst)
        }
    }

    const LEAVE_BPMN: &str = r#"
<definitions>
  <process id="leave" name="Leave request">
    <startEvent id="node_start"/>
    <userTask id="node_bzr" name="Adviser approval">
      <extensionElements>
        <assignment expression="[bzr]"/>
        <property name="candidate" value="bzr"/>
        <form code="leave_form"/>
      </extensionElements>
    </userTask>
    <endEvent id="node_end"/>
    <sequenceFlow id="f1" sourceRef="node_start" targetRef="node_bzr"/>
    <sequenceFlow id="f2" sourceRef="node_bzr" targetRef="node_end">
      <conditionExpression>action == "pass"</conditionExpression>
    </sequenceFlow>
    <sequenceFlow id="f3" sourceRef="node_bzr" targetRef="node_start">
      <conditionExpression>action == "back"</conditionExpression>
    </sequenceFlow>
  </process>
</definitions>"#;

    const PARALLEL_BACK_BPMN: &str = r#"
<definitions>
  <process id="countersign" name="Countersign">
    <startEvent id="node_start"/>
    <parallelGateway id="gw_fork"/>
    <userTask id="sign_a"><extensionElements><assignment expression='["P001"]'/></extensionElements></userTask>
    <userTask id="sign_b"><extensionElements><assignment expression='["P002"]'/></extensionElements></userTask>
    <parallelGateway id="gw_join"/>
    <endEvent id="node_end"/>
    <sequenceFlow id="f1" sourceRef="node_start" targetRef="gw_fork"/>
    <sequenceFlow id="f2" sourceRef="gw_fork" targetRef="sign_a"/>
    <sequenceFlow id="f3" sourceRef="gw_fork" targetRef="sign_b"/>
    <sequenceFlow id="f4" sourceRef="sign_a" targetRef="gw_join">
      <conditionExpression>action == "pass"</conditionExpression>
    </sequenceFlow>
    <sequenceFlow id="f5" sourceRef="sign_a" targetRef="node_start">
      <conditionExpression>action == "back"</conditionExpression>
    </sequenceFlow>
    <sequenceFlow id="f6" sourceRef="sign_b" targetRef="gw_join"/>
    <sequenceFlow id="f7" sourceRef="gw_join" targetRef="node_end"/>
  </process>
</definitions>"#;

    const TIMER_BPMN: &str = r#"
<definitions>
  <process id="timed" name="Timed step">
    <startEvent id="node_start"/>
    <intermediateCatchEvent id="node_wait">
      <timerEventDefinition><timeDuration>PT30S</timeDuration></timerEventDefinition>
    </intermediateCatchEvent>
    <userTask id="node_review"><extensionElements><assignment expression='["T100"]'/></extensionElements></userTask>
    <endEvent id="node_end"/>
    <sequenceFlow id="f1" sourceRef="node_start" targetRef="node_wait"/>
    <sequenceFlow id="f2" sourceRef="node_wait" targetRef="node_review"/>
    <sequenceFlow id="f3" sourceRef="node_review" targetRef="node_end">
      <conditionExpression>action == "pass"</conditionExpression>
    </sequenceFlow>
  </process>
</definitions>"#;

    fn new_engine() -> Arc<FlowEngine> {
        Arc::new(FlowEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(RhaiEvaluator::new()),
        ))
    }

    fn new_engine_with_clock(clock: Arc<ManualClock>) -> Arc<FlowEngine> {
        Arc::new(FlowEngine::with_clock(
            Arc::new(MemoryStore::new()),
            Arc::new(RhaiEvaluator::new()),
            clock,
        ))
    }

    fn bag(pairs: &[(&str, serde_json::Value)]) -> VarBag {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn start_requires_known_flow_and_node() {
        let engine = new_engine();
        engine.load_definition(LEAVE_BPMN).await.unwrap();

        let err = engine
            .start_flow("missing", "node_start", "T001", VarBag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::FlowNotFound(_)));

        let err = engine
            .start_flow("leave", "missing", "T001", VarBag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn reload_bumps_version() {
        let engine = new_engine();
        let v1 = engine.load_definition(LEAVE_BPMN).await.unwrap();
        let v2 = engine.load_definition(LEAVE_BPMN).await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
    }

    #[tokio::test]
    async fn handle_enforces_candidate_membership() {
        let engine = new_engine();
        engine.load_definition(LEAVE_BPMN).await.unwrap();

        let result = engine
            .start_flow(
                "leave",
                "node_start",
                "T001",
                bag(&[("day", json!(1)), ("bzr", json!("T002"))]),
            )
            .await
            .unwrap();
        assert_eq!(result.next_nodes[0].candidate_ids, vec!["T002"]);

        let err = engine
            .handle_flow(
                result.next_nodes[0].node_instance_id,
                "T999",
                bag(&[("action", json!("pass"))]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::NotCandidate { .. }));
    }

    #[tokio::test]
    async fn no_route_leaves_the_instance_untouched() {
        let engine = new_engine();
        engine.load_definition(LEAVE_BPMN).await.unwrap();

        let result = engine
            .start_flow(
                "leave",
                "node_start",
                "T001",
                bag(&[("day", json!(1)), ("bzr", json!("T002"))]),
            )
            .await
            .unwrap();
        let todo = result.next_nodes[0].node_instance_id;

        // "reject" matches no guard.
        let err = engine
            .handle_flow(todo, "T002", bag(&[("action", json!("reject"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::NoRoute(_)));

        // The node instance is still open and can be completed normally.
        let result = engine
            .handle_flow(todo, "T002", bag(&[("action", json!("pass"))]))
            .await
            .unwrap();
        assert!(result.is_end);
    }

    #[tokio::test]
    async fn concurrent_completions_succeed_exactly_once() {
        let engine = new_engine();
        engine.load_definition(LEAVE_BPMN).await.unwrap();

        let result = engine
            .start_flow(
                "leave",
                "node_start",
                "T001",
                bag(&[("day", json!(1)), ("bzr", json!("T002"))]),
            )
            .await
            .unwrap();
        let todo = result.next_nodes[0].node_instance_id;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                engine
                    .handle_flow(todo, "T002", bag(&[("action", json!("pass"))]))
                    .await
            }));
        }

        let mut ok = 0;
        let mut already_done = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(FlowError::AlreadyDone(_)) => already_done += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(already_done, 7);
    }

    #[tokio::test]
    async fn back_transition_deactivates_parallel_siblings() {
        let engine = new_engine();
        engine.load_definition(PARALLEL_BACK_BPMN).await.unwrap();

        let result = engine
            .start_flow("countersign", "node_start", "H001", VarBag::new())
            .await
            .unwrap();
        assert_eq!(result.next_nodes.len(), 2);

        let sign_a = result
            .next_nodes
            .iter()
            .find(|n| n.node_code == "sign_a")
            .unwrap();
        let back = engine
            .handle_flow(
                sign_a.node_instance_id,
                "P001",
                bag(&[("action", json!("back"))]),
            )
            .await
            .unwrap();
        assert!(!back.is_end);
        assert_eq!(back.next_nodes.len(), 1);
        assert_eq!(back.next_nodes[0].candidate_ids, vec!["H001"]);

        // The sibling token was deactivated: P002 has nothing left to do.
        let todos = engine
            .query_todo("P002", &WorkFilter::default())
            .await
            .unwrap();
        assert!(todos.is_empty());

        // Exactly one running token remains, on the launcher.
        let todos = engine
            .query_todo("H001", &WorkFilter::default())
            .await
            .unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].node_code, "node_start");
    }

    #[tokio::test]
    async fn stop_flow_is_idempotent_and_cancels_work() {
        let engine = new_engine();
        engine.load_definition(LEAVE_BPMN).await.unwrap();

        let result = engine
            .start_flow(
                "leave",
                "node_start",
                "T001",
                bag(&[("day", json!(1)), ("bzr", json!("T002"))]),
            )
            .await
            .unwrap();
        let flow_instance_id = result.flow_instance_id;
        let todo = result.next_nodes[0].node_instance_id;

        engine.stop_flow(flow_instance_id).await.unwrap();
        engine.stop_flow(flow_instance_id).await.unwrap();

        let instance = engine.flow_instance(flow_instance_id).await.unwrap();
        assert_eq!(instance.status, FlowInstanceStatus::Stopped);

        assert!(engine
            .query_todo("T002", &WorkFilter::default())
            .await
            .unwrap()
            .is_empty());
        let err = engine
            .handle_flow(todo, "T002", bag(&[("action", json!("pass"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::AlreadyDone(_)));
    }

    #[tokio::test]
    async fn timer_fires_once_and_advances_the_instance() {
        let clock = ManualClock::new(1_000);
        let engine = new_engine_with_clock(clock.clone());
        engine.load_definition(TIMER_BPMN).await.unwrap();

        let result = engine
            .start_flow("timed", "node_start", "T001", VarBag::new())
            .await
            .unwrap();
        assert_eq!(result.next_nodes.len(), 1);
        assert_eq!(result.next_nodes[0].node_code, "node_wait");
        assert!(result.next_nodes[0].candidate_ids.is_empty());

        // Not expired yet.
        assert_eq!(engine.sweep_timers().await, 0);

        clock.advance(30);
        assert_eq!(engine.sweep_timers().await, 1);
        // Fired once; the tombstone blocks a second fire.
        assert_eq!(engine.sweep_timers().await, 0);

        let todos = engine
            .query_todo("T100", &WorkFilter::default())
            .await
            .unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].node_code, "node_review");

        // The synthetic completion carried the input bag forward.
        let history = engine.query_history(result.flow_instance_id).await.unwrap();
        let timer_step = history
            .iter()
            .find(|h| h.node_code == "node_wait")
            .unwrap();
        assert_eq!(timer_step.processor, TIMER_PROCESSOR);
    }

    #[tokio::test]
    async fn stopped_flow_never_fires_its_timers() {
        let clock = ManualClock::new(1_000);
        let engine = new_engine_with_clock(clock.clone());
        engine.load_definition(TIMER_BPMN).await.unwrap();

        let result = engine
            .start_flow("timed", "node_start", "T001", VarBag::new())
            .await
            .unwrap();
        engine.stop_flow(result.flow_instance_id).await.unwrap();

        clock.advance(3_600);
        assert_eq!(engine.sweep_timers().await, 0);
    }

    #[tokio::test]
    async fn node_form_lookup() {
        let engine = new_engine();
        engine.load_definition(LEAVE_BPMN).await.unwrap();

        let form = engine.node_form("leave", "node_bzr").await.unwrap().unwrap();
        assert_eq!(form.code, "leave_form");

        assert!(engine
            .node_form("leave", "node_start")
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            engine.node_form("leave", "missing").await,
            Err(FlowError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn restore_republishes_persisted_definitions() {
        let store: Arc<dyn FlowStore> = Arc::new(MemoryStore::new());
        let engine = Arc::new(FlowEngine::new(
            store.clone(),
            Arc::new(RhaiEvaluator::new()),
        ));
        engine.load_definition(LEAVE_BPMN).await.unwrap();

        // A fresh engine over the same store: registry is empty until restore.
        let rebooted = Arc::new(FlowEngine::new(
            store.clone(),
            Arc::new(RhaiEvaluator::new()),
        ));
        let err = rebooted
            .start_flow("leave", "node_start", "T001", VarBag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::FlowNotFound(_)));

        assert_eq!(rebooted.restore().await.unwrap(), 1);
        let result = rebooted
            .start_flow(
                "leave",
                "node_start",
                "T001",
                bag(&[("day", json!(1)), ("bzr", json!("T002"))]),
            )
            .await
            .unwrap();
        assert_eq!(result.next_nodes[0].candidate_ids, vec!["T002"]);
    }
}
