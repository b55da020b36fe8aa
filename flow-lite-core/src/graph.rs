//! The immutable, indexed representation of a loaded process definition.
//!
//! Nodes and edges are flat tables keyed by id, not object cycles, so a
//! graph publishes safely as an `Arc` snapshot. Back-edges (the "back"
//! transitions of the engine) are classified structurally at build time: an
//! edge whose target is an ancestor of its source in a depth-first traversal
//! from the start node.

use crate::bpmn::parse_duration_secs;
use crate::error::{FlowError, Result};
use crate::types::*;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{depth_first_search, Control, DfsEvent, EdgeRef};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A definition edge enriched with the derived back-edge flag.
#[derive(Clone, Debug)]
pub struct GraphEdge {
    pub id: Uuid,
    pub source_node_id: Uuid,
    pub target_node_id: Uuid,
    pub expression: String,
    pub order: i32,
    pub back: bool,
}

/// An immutable, validated process graph.
pub struct ProcessGraph {
    flow: Flow,
    nodes: HashMap<Uuid, Node>,
    by_code: HashMap<String, Uuid>,
    outgoing: HashMap<Uuid, Vec<GraphEdge>>,
    in_degree: HashMap<Uuid, usize>,
    assignments: HashMap<Uuid, Vec<Assignment>>,
    properties: HashMap<Uuid, BTreeMap<String, String>>,
    node_forms: HashMap<Uuid, Uuid>,
    start_node_id: Uuid,
}

impl ProcessGraph {
    /// Index and validate a parsed definition.
    ///
    /// Rejected: duplicate node codes, zero or multiple start events, no end
    /// event, nodes unreachable from the start, and timer nodes without a
    /// parseable `duration` property.
    pub fn build(def: &FlowDefinition) -> Result<Self> {
        let mut nodes = HashMap::new();
        let mut by_code = HashMap::new();
        let mut starts = Vec::new();
        let mut has_end = false;

        for node in &def.nodes {
            if by_code.insert(node.code.clone(), node.id).is_some() {
                return Err(FlowError::Definition(format!(
                    "duplicate node code '{}' in flow '{}'",
                    node.code, def.flow.code
                )));
            }
            match node.type_code {
                NodeType::StartEvent => starts.push(node.id),
                NodeType::EndEvent => has_end = true,
                _ => {}
            }
            nodes.insert(node.id, node.clone());
        }

        let start_node_id = match starts.as_slice() {
            [only] => *only,
            [] => {
                return Err(FlowError::Definition(format!(
                    "flow '{}' has no start event",
                    def.flow.code
                )))
            }
            _ => {
                return Err(FlowError::Definition(format!(
                    "flow '{}' has {} start events, expected one",
                    def.flow.code,
                    starts.len()
                )))
            }
        };
        if !has_end {
            return Err(FlowError::Definition(format!(
                "flow '{}' has no end event",
                def.flow.code
            )));
        }

        for edge in &def.routers {
            for endpoint in [edge.source_node_id, edge.target_node_id] {
                if !nodes.contains_key(&endpoint) {
                    return Err(FlowError::Definition(format!(
                        "edge in flow '{}' references unknown node {endpoint}",
                        def.flow.code
                    )));
                }
            }
        }

        let back = classify_back_edges(def, &nodes, start_node_id)?;

        // Rewinds re-materialise their target for the processor of its most
        // recent completion, which only exists for task-like nodes.
        for (i, edge) in def.routers.iter().enumerate() {
            if !back[i] {
                continue;
            }
            let target = &nodes[&edge.target_node_id];
            if !matches!(
                target.type_code,
                NodeType::UserTask | NodeType::ServiceTask | NodeType::StartEvent
            ) {
                return Err(FlowError::Definition(format!(
                    "back edge in flow '{}' targets {} node '{}'; back transitions must land on a task or the start event",
                    def.flow.code,
                    target.type_code.as_str(),
                    target.code
                )));
            }
        }

        let mut outgoing: HashMap<Uuid, Vec<GraphEdge>> = HashMap::new();
        let mut in_degree: HashMap<Uuid, usize> = HashMap::new();
        for (i, edge) in def.routers.iter().enumerate() {
            outgoing
                .entry(edge.source_node_id)
                .or_default()
                .push(GraphEdge {
                    id: edge.id,
                    source_node_id: edge.source_node_id,
                    target_node_id: edge.target_node_id,
                    expression: edge.expression.clone(),
                    order: edge.order,
                    back: back[i],
                });
            // Back-edges do not feed join barriers.
            if !back[i] {
                *in_degree.entry(edge.target_node_id).or_default() += 1;
            }
        }
        for edges in outgoing.values_mut() {
            edges.sort_by_key(|e| e.order);
        }

        let mut assignments: HashMap<Uuid, Vec<Assignment>> = HashMap::new();
        for rule in &def.assignments {
            assignments
                .entry(rule.node_id)
                .or_default()
                .push(rule.clone());
        }

        let mut properties: HashMap<Uuid, BTreeMap<String, String>> = HashMap::new();
        for prop in &def.properties {
            properties
                .entry(prop.node_id)
                .or_default()
                .insert(prop.name.clone(), prop.value.clone());
        }

        let node_forms: HashMap<Uuid, Uuid> = def
            .node_forms
            .iter()
            .map(|nf| (nf.node_id, nf.form_id))
            .collect();

        for node in nodes.values() {
            if node.type_code == NodeType::TimerEvent {
                let duration = properties
                    .get(&node.id)
                    .and_then(|p| p.get("duration"))
                    .and_then(|v| parse_duration_secs(v));
                if duration.is_none() {
                    return Err(FlowError::Definition(format!(
                        "timer node '{}' has no usable duration property",
                        node.code
                    )));
                }
            }
        }

        Ok(Self {
            flow: def.flow.clone(),
            nodes,
            by_code,
            outgoing,
            in_degree,
            assignments,
            properties,
            node_forms,
            start_node_id,
        })
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn node(&self, id: Uuid) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_by_code(&self, code: &str) -> Option<&Node> {
        self.by_code.get(code).and_then(|id| self.nodes.get(id))
    }

    pub fn start_node(&self) -> &Node {
        // The start node id is validated at build.
        &self.nodes[&self.start_node_id]
    }

    /// Outgoing edges of a node, in declared order.
    pub fn outgoing(&self, id: Uuid) -> &[GraphEdge] {
        self.outgoing.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Forward in-degree of a node (back-edges excluded). The join threshold
    /// of a converging parallel gateway.
    pub fn in_degree(&self, id: Uuid) -> usize {
        self.in_degree.get(&id).copied().unwrap_or(0)
    }

    pub fn assignments(&self, id: Uuid) -> &[Assignment] {
        self.assignments.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn property(&self, id: Uuid, name: &str) -> Option<&str> {
        self.properties
            .get(&id)
            .and_then(|p| p.get(name))
            .map(String::as_str)
    }

    pub fn form_of(&self, node_id: Uuid) -> Option<Uuid> {
        self.node_forms.get(&node_id).copied()
    }
}

/// Depth-first classification from the start node: back-edges and
/// reachability in one pass.
fn classify_back_edges(
    def: &FlowDefinition,
    nodes: &HashMap<Uuid, Node>,
    start_node_id: Uuid,
) -> Result<Vec<bool>> {
    let mut pg: DiGraph<Uuid, usize> = DiGraph::new();
    let mut index: HashMap<Uuid, NodeIndex> = HashMap::new();
    for id in nodes.keys() {
        index.insert(*id, pg.add_node(*id));
    }
    for (i, edge) in def.routers.iter().enumerate() {
        pg.add_edge(index[&edge.source_node_id], index[&edge.target_node_id], i);
    }

    let mut back = vec![false; def.routers.len()];
    let mut discovered: HashSet<NodeIndex> = HashSet::new();
    depth_first_search(&pg, Some(index[&start_node_id]), |event| {
        match event {
            DfsEvent::Discover(n, _) => {
                discovered.insert(n);
            }
            DfsEvent::BackEdge(u, v) => {
                for edge in pg.edges_connecting(u, v) {
                    back[*edge.weight()] = true;
                }
            }
            _ => {}
        }
        Control::<()>::Continue
    });

    if discovered.len() != nodes.len() {
        let unreachable: Vec<&str> = pg
            .node_indices()
            .filter(|n| !discovered.contains(n))
            .filter_map(|n| nodes.get(&pg[n]).map(|node| node.code.as_str()))
            .collect();
        return Err(FlowError::Definition(format!(
            "flow '{}' has nodes unreachable from the start event: {}",
            def.flow.code,
            unreachable.join(", ")
        )));
    }

    Ok(back)
}

// ─── Registry ─────────────────────────────────────────────────

struct RegistryInner {
    by_code: HashMap<String, Arc<ProcessGraph>>,
    by_flow_id: HashMap<Uuid, Arc<ProcessGraph>>,
}

/// Publishes loaded graphs. Lookups by code resolve to the newest version;
/// lookups by flow id keep serving older versions to their in-flight
/// instances. Publication replaces an `Arc` snapshot, so readers never
/// observe a partially loaded graph.
pub struct GraphRegistry {
    inner: RwLock<RegistryInner>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                by_code: HashMap::new(),
                by_flow_id: HashMap::new(),
            }),
        }
    }

    pub async fn publish(&self, graph: Arc<ProcessGraph>) {
        let mut w = self.inner.write().await;
        let flow = graph.flow().clone();
        w.by_flow_id.insert(flow.id, graph.clone());
        let newer_exists = w
            .by_code
            .get(&flow.code)
            .is_some_and(|existing| existing.flow().version > flow.version);
        if !newer_exists && flow.status == FlowStatus::Active {
            w.by_code.insert(flow.code, graph);
        }
    }

    pub async fn by_code(&self, code: &str) -> Option<Arc<ProcessGraph>> {
        self.inner.read().await.by_code.get(code).cloned()
    }

    pub async fn by_flow_id(&self, id: Uuid) -> Option<Arc<ProcessGraph>> {
        self.inner.read().await.by_flow_id.get(&id).cloned()
    }

    /// Highest published version for a code, 0 when none.
    pub async fn latest_version(&self, code: &str) -> i64 {
        self.inner
            .read()
            .await
            .by_code
            .get(code)
            .map(|g| g.flow().version)
            .unwrap_or(0)
    }
}

impl Default for GraphRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpmn::parse_bpmn;

    const CYCLIC_BPMN: &str = r#"
<definitions>
  <process id="p_cycle" name="Cycle">
    <startEvent id="s"/>
    <userTask id="a">
      <extensionElements><assignment expression="[bzr]"/></extensionElements>
    </userTask>
    <userTask id="b">
      <extensionElements><assignment expression="[fdy]"/></extensionElements>
    </userTask>
    <endEvent id="e"/>
    <sequenceFlow id="f1" sourceRef="s" targetRef="a"/>
    <sequenceFlow id="f2" sourceRef="a" targetRef="b">
      <conditionExpression>action == "pass"</conditionExpression>
    </sequenceFlow>
    <sequenceFlow id="f3" sourceRef="a" targetRef="s">
      <conditionExpression>action == "back"</conditionExpression>
    </sequenceFlow>
    <sequenceFlow id="f4" sourceRef="b" targetRef="e">
      <conditionExpression>action == "pass"</conditionExpression>
    </sequenceFlow>
    <sequenceFlow id="f5" sourceRef="b" targetRef="s">
      <conditionExpression>action == "back"</conditionExpression>
    </sequenceFlow>
  </process>
</definitions>"#;

    #[test]
    fn back_edges_are_classified_structurally() {
        let def = parse_bpmn(CYCLIC_BPMN).unwrap();
        let graph = ProcessGraph::build(&def).unwrap();

        let a = graph.node_by_code("a").unwrap();
        let b = graph.node_by_code("b").unwrap();
        let s = graph.node_by_code("s").unwrap();

        let a_edges = graph.outgoing(a.id);
        assert_eq!(a_edges.len(), 2);
        assert!(!a_edges[0].back, "a → b is a forward edge");
        assert!(a_edges[1].back, "a → s rewinds to an ancestor");

        let b_edges = graph.outgoing(b.id);
        assert!(b_edges.iter().any(|e| e.back && e.target_node_id == s.id));
    }

    #[test]
    fn back_edges_do_not_count_into_in_degree() {
        let def = parse_bpmn(CYCLIC_BPMN).unwrap();
        let graph = ProcessGraph::build(&def).unwrap();
        let s = graph.node_by_code("s").unwrap();
        // Two back-edges target the start node; its forward in-degree is 0.
        assert_eq!(graph.in_degree(s.id), 0);
    }

    #[test]
    fn parallel_join_in_degree() {
        let xml = r#"
<definitions>
  <process id="p_par" name="Parallel">
    <startEvent id="s"/>
    <parallelGateway id="fork"/>
    <userTask id="t1"><extensionElements><assignment expression='["P1"]'/></extensionElements></userTask>
    <userTask id="t2"><extensionElements><assignment expression='["P2"]'/></extensionElements></userTask>
    <parallelGateway id="join"/>
    <endEvent id="e"/>
    <sequenceFlow id="f1" sourceRef="s" targetRef="fork"/>
    <sequenceFlow id="f2" sourceRef="fork" targetRef="t1"/>
    <sequenceFlow id="f3" sourceRef="fork" targetRef="t2"/>
    <sequenceFlow id="f4" sourceRef="t1" targetRef="join"/>
    <sequenceFlow id="f5" sourceRef="t2" targetRef="join"/>
    <sequenceFlow id="f6" sourceRef="join" targetRef="e"/>
  </process>
</definitions>"#;
        let def = parse_bpmn(xml).unwrap();
        let graph = ProcessGraph::build(&def).unwrap();
        let join = graph.node_by_code("join").unwrap();
        assert_eq!(graph.in_degree(join.id), 2);
        assert_eq!(graph.outgoing(graph.node_by_code("fork").unwrap().id).len(), 2);
    }

    #[test]
    fn rejects_structural_defects() {
        let no_start = r#"
<definitions><process id="p1">
  <userTask id="a"/><endEvent id="e"/>
  <sequenceFlow id="f1" sourceRef="a" targetRef="e"/>
</process></definitions>"#;
        assert!(matches!(
            parse_bpmn(no_start).and_then(|d| ProcessGraph::build(&d).map(|_| ())),
            Err(FlowError::Definition(_))
        ));

        let unreachable = r#"
<definitions><process id="p2">
  <startEvent id="s"/><userTask id="a"/><userTask id="island"/><endEvent id="e"/>
  <sequenceFlow id="f1" sourceRef="s" targetRef="a"/>
  <sequenceFlow id="f2" sourceRef="a" targetRef="e"/>
</process></definitions>"#;
        let err = parse_bpmn(unreachable)
            .and_then(|d| ProcessGraph::build(&d).map(|_| ()))
            .unwrap_err();
        assert!(err.to_string().contains("island"));

        let timer_without_duration = r#"
<definitions><process id="p3">
  <startEvent id="s"/>
  <intermediateCatchEvent id="t"/>
  <endEvent id="e"/>
  <sequenceFlow id="f1" sourceRef="s" targetRef="t"/>
  <sequenceFlow id="f2" sourceRef="t" targetRef="e"/>
</process></definitions>"#;
        assert!(matches!(
            parse_bpmn(timer_without_duration).and_then(|d| ProcessGraph::build(&d).map(|_| ())),
            Err(FlowError::Definition(_))
        ));
    }

    #[test]
    fn rejects_back_edge_to_non_task_target() {
        let back_to_gateway = r#"
<definitions><process id="p_badback">
  <startEvent id="s"/>
  <exclusiveGateway id="gw"/>
  <userTask id="a">
    <extensionElements><assignment expression="[bzr]"/></extensionElements>
  </userTask>
  <endEvent id="e"/>
  <sequenceFlow id="f1" sourceRef="s" targetRef="gw"/>
  <sequenceFlow id="f2" sourceRef="gw" targetRef="a"/>
  <sequenceFlow id="f3" sourceRef="a" targetRef="e">
    <conditionExpression>action == "pass"</conditionExpression>
  </sequenceFlow>
  <sequenceFlow id="f4" sourceRef="a" targetRef="gw">
    <conditionExpression>action == "back"</conditionExpression>
  </sequenceFlow>
</process></definitions>"#;
        let err = parse_bpmn(back_to_gateway)
            .and_then(|d| ProcessGraph::build(&d).map(|_| ()))
            .unwrap_err();
        assert!(matches!(err, FlowError::Definition(_)));
        assert!(err.to_string().contains("back edge"));
        assert!(err.to_string().contains("gw"));
    }

    #[tokio::test]
    async fn registry_serves_newest_version_and_keeps_old_ids() {
        let registry = GraphRegistry::new();

        let mut def_v1 = parse_bpmn(CYCLIC_BPMN).unwrap();
        def_v1.flow.version = 1;
        let v1 = Arc::new(ProcessGraph::build(&def_v1).unwrap());

        let mut def_v2 = parse_bpmn(CYCLIC_BPMN).unwrap();
        def_v2.flow.version = 2;
        let v2 = Arc::new(ProcessGraph::build(&def_v2).unwrap());

        registry.publish(v1.clone()).await;
        assert_eq!(registry.latest_version("p_cycle").await, 1);

        registry.publish(v2.clone()).await;
        assert_eq!(registry.latest_version("p_cycle").await, 2);
        let current = registry.by_code("p_cycle").await.unwrap();
        assert_eq!(current.flow().id, def_v2.flow.id);

        // The older version stays reachable for its in-flight instances.
        let old = registry.by_flow_id(def_v1.flow.id).await.unwrap();
        assert_eq!(old.flow().version, 1);
    }
}
