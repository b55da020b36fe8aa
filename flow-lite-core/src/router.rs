//! The routing step: computes and materialises the transition closure of a
//! just-completed node instance.
//!
//! Edge selection is guard-driven and ordered; gateways are traversed
//! transparently inside a single step (they never materialise node
//! instances); parallel joins park arriving branches on a store-side barrier
//! until the count matches the join's forward in-degree; back-edges rewind
//! the instance to an upstream node, deactivating every other running token.

use crate::error::{FlowError, Result};
use crate::eval::Evaluator;
use crate::graph::{GraphEdge, ProcessGraph};
use crate::store::FlowStore;
use crate::types::*;
use std::collections::VecDeque;
use uuid::Uuid;

/// Synthetic processor recorded on timer-fired completions.
pub const TIMER_PROCESSOR: &str = "__timer__";

/// What one routing step produced.
#[derive(Debug, Default)]
pub struct RouteOutcome {
    pub next_nodes: Vec<NextNode>,
    /// An end event was reached. Whether the flow instance completes is
    /// decided by the controller once no running instances remain.
    pub reached_end: bool,
    pub back_taken: bool,
}

/// One routing step over a fixed graph snapshot.
pub struct Router<'a> {
    pub graph: &'a ProcessGraph,
    pub store: &'a dyn FlowStore,
    pub evaluator: &'a dyn Evaluator,
    pub now: EpochSecs,
}

impl<'a> Router<'a> {
    /// Select the outgoing edges of `node` whose guards hold against `bag`,
    /// in declared order. Parallel gateways take every true-guard edge;
    /// every other node type short-circuits on the first. Guard evaluation
    /// errors are demoted to `false`. Reads only; callers rely on this
    /// being safe to run before the completion write.
    pub fn select_edges(&self, node: &Node, bag: &VarBag) -> Result<Vec<&'a GraphEdge>> {
        let edges = self.graph.outgoing(node.id);
        let take_all = node.type_code == NodeType::ParallelGateway;
        let mut selected = Vec::new();

        for edge in edges {
            if !self.guard_holds(edge, node, bag) {
                continue;
            }
            selected.push(edge);
            if !take_all {
                break;
            }
        }

        if selected.is_empty() {
            return Err(FlowError::NoRoute(node.code.clone()));
        }
        Ok(selected)
    }

    /// Materialise the closure reachable through the already-selected
    /// edges. The triggering completion must be committed before this runs.
    pub async fn advance(
        &self,
        instance: &FlowInstance,
        edges: Vec<&'a GraphEdge>,
        bag: &VarBag,
    ) -> Result<RouteOutcome> {
        let mut outcome = RouteOutcome::default();
        let mut queue: VecDeque<&'a GraphEdge> = edges.into();

        while let Some(edge) = queue.pop_front() {
            let target = self.graph.node(edge.target_node_id).ok_or_else(|| {
                FlowError::Definition(format!("edge targets unknown node {}", edge.target_node_id))
            })?;

            if edge.back {
                self.rewind(instance, target, bag, &mut outcome).await?;
                continue;
            }

            match target.type_code {
                NodeType::EndEvent => outcome.reached_end = true,
                NodeType::ExclusiveGateway => {
                    queue.extend(self.select_edges(target, bag)?);
                }
                NodeType::ParallelGateway => {
                    let threshold = self.graph.in_degree(target.id);
                    if threshold > 1 {
                        let arrived = self.store.join_arrive(instance.id, target.id).await?;
                        if (arrived as usize) < threshold {
                            tracing::debug!(
                                join = %target.code,
                                arrived,
                                threshold,
                                "parallel join waiting for remaining branches"
                            );
                            continue;
                        }
                        self.store.join_reset(instance.id, target.id).await?;
                    }
                    queue.extend(self.select_edges(target, bag)?);
                }
                NodeType::TimerEvent => {
                    self.materialise_timer(instance, target, bag, &mut outcome)
                        .await?;
                }
                NodeType::UserTask | NodeType::ServiceTask | NodeType::StartEvent => {
                    self.materialise_task(instance, target, bag, None, &mut outcome)
                        .await?;
                }
            }
        }

        Ok(outcome)
    }

    fn guard_holds(&self, edge: &GraphEdge, node: &Node, bag: &VarBag) -> bool {
        match self.evaluator.eval_bool(&edge.expression, bag) {
            Ok(holds) => holds,
            Err(err) => {
                tracing::warn!(
                    node = %node.code,
                    expression = %edge.expression,
                    error = %err,
                    "guard evaluation failed, treating as false"
                );
                false
            }
        }
    }

    /// Take a back-edge: deactivate every other running token of the
    /// instance, then re-materialise the upstream target for the processor
    /// of its most recent completion (the flow launcher when there is none).
    async fn rewind(
        &self,
        instance: &FlowInstance,
        target: &Node,
        bag: &VarBag,
        outcome: &mut RouteOutcome,
    ) -> Result<()> {
        let prior = self
            .store
            .last_completed_node_instance(instance.id, target.id)
            .await?;
        let candidate = prior
            .map(|p| p.processor)
            .filter(|p| !p.is_empty() && p != TIMER_PROCESSOR)
            .unwrap_or_else(|| instance.launcher.clone());

        let cancelled = self
            .store
            .cancel_running_node_instances(instance.id, self.now)
            .await?;
        if !cancelled.is_empty() {
            tracing::debug!(
                flow_instance = %instance.id,
                count = cancelled.len(),
                "back transition deactivated running siblings"
            );
        }

        self.materialise_task(instance, target, bag, Some(vec![candidate]), outcome)
            .await?;
        outcome.back_taken = true;
        Ok(())
    }

    async fn materialise_task(
        &self,
        instance: &FlowInstance,
        target: &Node,
        bag: &VarBag,
        forced_candidates: Option<Vec<String>>,
        outcome: &mut RouteOutcome,
    ) -> Result<()> {
        let candidates = match forced_candidates {
            Some(candidates) => candidates,
            None => self.resolve_candidates(target, bag)?,
        };
        if candidates.is_empty() {
            return Err(FlowError::Definition(format!(
                "no candidates resolved for node '{}'",
                target.code
            )));
        }

        let node_instance = self.new_node_instance(instance, target, bag);
        let rows: Vec<NodeCandidate> = candidates
            .iter()
            .map(|candidate| NodeCandidate {
                id: Uuid::now_v7(),
                node_instance_id: node_instance.id,
                candidate_id: candidate.clone(),
                created: self.now,
            })
            .collect();
        self.store.create_node_instance(&node_instance, &rows).await?;

        outcome.next_nodes.push(NextNode {
            node_instance_id: node_instance.id,
            node_id: target.id,
            node_code: target.code.clone(),
            node_name: target.name.clone(),
            candidate_ids: candidates,
        });
        Ok(())
    }

    async fn materialise_timer(
        &self,
        instance: &FlowInstance,
        target: &Node,
        bag: &VarBag,
        outcome: &mut RouteOutcome,
    ) -> Result<()> {
        let duration = self
            .graph
            .property(target.id, "duration")
            .and_then(crate::bpmn::parse_duration_secs)
            .ok_or_else(|| {
                FlowError::Definition(format!(
                    "timer node '{}' has no usable duration property",
                    target.code
                ))
            })?;

        let node_instance = self.new_node_instance(instance, target, bag);
        self.store.create_node_instance(&node_instance, &[]).await?;
        self.store
            .create_node_timing(&NodeTiming {
                id: Uuid::now_v7(),
                node_instance_id: node_instance.id,
                flow_instance_id: instance.id,
                expires_at: self.now + duration,
                created: self.now,
                deleted: None,
            })
            .await?;

        outcome.next_nodes.push(NextNode {
            node_instance_id: node_instance.id,
            node_id: target.id,
            node_code: target.code.clone(),
            node_name: target.name.clone(),
            candidate_ids: Vec::new(),
        });
        Ok(())
    }

    fn new_node_instance(
        &self,
        instance: &FlowInstance,
        target: &Node,
        bag: &VarBag,
    ) -> NodeInstance {
        NodeInstance {
            id: Uuid::now_v7(),
            flow_instance_id: instance.id,
            node_id: target.id,
            input_data: encode_bag(bag),
            out_data: String::new(),
            processor: String::new(),
            process_time: 0,
            status: NodeInstanceStatus::Running,
            created: self.now,
            deleted: None,
        }
    }

    /// Assignment rules against the transition bag, falling back to the
    /// node's `candidate` property naming a bag variable. De-duplicated,
    /// first-seen order preserved.
    fn resolve_candidates(&self, node: &Node, bag: &VarBag) -> Result<Vec<String>> {
        let mut ids: Vec<String> = Vec::new();
        for rule in self.graph.assignments(node.id) {
            match self.evaluator.eval_ids(&rule.expression, bag) {
                Ok(found) => ids.extend(found),
                Err(err) => {
                    tracing::warn!(
                        node = %node.code,
                        expression = %rule.expression,
                        error = %err,
                        "assignment evaluation failed, falling back to candidate property"
                    );
                }
            }
        }

        if ids.is_empty() {
            if let Some(key) = self.graph.property(node.id, "candidate") {
                if let Some(value) = bag.get(key) {
                    ids.extend(ids_from_value(value));
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        ids.retain(|id| seen.insert(id.clone()));
        Ok(ids)
    }
}

fn ids_from_value(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::String(s) => vec![s.clone()],
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_from_scalar_and_list_values() {
        assert_eq!(ids_from_value(&json!("T002")), vec!["T002"]);
        assert_eq!(
            ids_from_value(&json!(["S001", "S002"])),
            vec!["S001", "S002"]
        );
        assert!(ids_from_value(&json!(42)).is_empty());
        assert!(ids_from_value(&json!([1, 2])).is_empty());
    }
}
