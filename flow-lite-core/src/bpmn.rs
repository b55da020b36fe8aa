//! BPMN 2.0 XML definition loader.
//!
//! Parses the subset of BPMN the engine executes (events, user/service
//! tasks, exclusive and parallel gateways, timer catch events and sequence
//! flows) plus an extension vocabulary under `extensionElements`:
//! `<flow:assignment expression="..."/>`, `<flow:property name=".." value=".."/>`
//! and `<flow:form code=".." data=".."/>`. Element names are matched by local
//! name, so both prefixed and default-namespace documents are accepted.
//! Unknown elements are skipped; structural validation happens at graph
//! build, not here.

use crate::error::{FlowError, Result};
use crate::types::*;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::reader::Reader;
use std::collections::HashMap;
use uuid::Uuid;

/// A sequence flow collected during the scan; resolved to node ids once all
/// nodes are known.
struct RawFlow {
    code: String,
    source: String,
    target: String,
    expression: String,
}

struct ParseState {
    flow_id: Uuid,
    in_process: bool,
    process_code: Option<String>,
    process_name: String,
    nodes: Vec<Node>,
    raw_flows: Vec<RawFlow>,
    assignments: Vec<Assignment>,
    properties: Vec<NodeProperty>,
    forms: Vec<Form>,
    node_forms: Vec<NodeForm>,
    /// Index into `nodes` while inside a node element.
    current_node: Option<usize>,
    /// Index into `raw_flows` while inside a sequenceFlow element.
    current_flow: Option<usize>,
    in_condition: bool,
    in_duration: bool,
}

/// Parse BPMN XML into a [`FlowDefinition`].
///
/// The returned definition carries `version = 1` and `created = 0`; the
/// engine stamps both when the definition is loaded.
pub fn parse_bpmn(xml: &str) -> Result<FlowDefinition> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut state = ParseState {
        flow_id: Uuid::now_v7(),
        in_process: false,
        process_code: None,
        process_name: String::new(),
        nodes: Vec::new(),
        raw_flows: Vec::new(),
        assignments: Vec::new(),
        properties: Vec::new(),
        forms: Vec::new(),
        node_forms: Vec::new(),
        current_node: None,
        current_flow: None,
        in_condition: false,
        in_duration: false,
    };

    loop {
        let event = reader.read_event_into(&mut buf);
        match event {
            Ok(Event::Start(ref e)) => state.open_tag(e, false)?,
            Ok(Event::Empty(ref e)) => state.open_tag(e, true)?,
            Ok(Event::End(ref e)) => state.close_tag(&local(e.name())),
            Ok(Event::Text(ref e)) => {
                if let Ok(text) = e.unescape() {
                    state.text(text.trim());
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(FlowError::Definition(format!("XML parse error: {e}"))),
            _ => {}
        }
        buf.clear();
    }

    state.finish()
}

impl ParseState {
    fn open_tag(&mut self, e: &BytesStart, is_empty: bool) -> Result<()> {
        let name = local(e.name());
        match name.as_str() {
            "process" => {
                self.in_process = true;
                self.process_code = Some(get_attr(e, "id")?);
                self.process_name = get_attr_opt(e, "name").unwrap_or_default();
            }
            "startEvent" if self.in_process => self.add_node(e, NodeType::StartEvent, is_empty)?,
            "endEvent" if self.in_process => self.add_node(e, NodeType::EndEvent, is_empty)?,
            "userTask" if self.in_process => self.add_node(e, NodeType::UserTask, is_empty)?,
            "serviceTask" if self.in_process => self.add_node(e, NodeType::ServiceTask, is_empty)?,
            "exclusiveGateway" if self.in_process => {
                self.add_node(e, NodeType::ExclusiveGateway, is_empty)?;
            }
            "parallelGateway" if self.in_process => {
                self.add_node(e, NodeType::ParallelGateway, is_empty)?;
            }
            "intermediateCatchEvent" if self.in_process => {
                self.add_node(e, NodeType::TimerEvent, is_empty)?;
            }
            "timeDuration" if self.current_node.is_some() => {
                self.in_duration = !is_empty;
            }
            "sequenceFlow" if self.in_process => {
                let raw = RawFlow {
                    code: get_attr(e, "id")?,
                    source: get_attr(e, "sourceRef")?,
                    target: get_attr(e, "targetRef")?,
                    expression: String::new(),
                };
                self.raw_flows.push(raw);
                if !is_empty {
                    self.current_flow = Some(self.raw_flows.len() - 1);
                }
            }
            "conditionExpression" if self.current_flow.is_some() => {
                self.in_condition = !is_empty;
            }
            "assignment" => {
                if let Some(idx) = self.current_node {
                    self.assignments.push(Assignment {
                        id: Uuid::now_v7(),
                        flow_id: self.flow_id,
                        node_id: self.nodes[idx].id,
                        expression: get_attr(e, "expression")?,
                    });
                }
            }
            "property" => {
                if let Some(idx) = self.current_node {
                    self.properties.push(NodeProperty {
                        id: Uuid::now_v7(),
                        flow_id: self.flow_id,
                        node_id: self.nodes[idx].id,
                        name: get_attr(e, "name")?,
                        value: get_attr_opt(e, "value").unwrap_or_default(),
                    });
                }
            }
            "form" => {
                if let Some(idx) = self.current_node {
                    let form = Form {
                        id: Uuid::now_v7(),
                        flow_id: self.flow_id,
                        code: get_attr(e, "code")?,
                        data: get_attr_opt(e, "data").unwrap_or_default(),
                    };
                    self.node_forms.push(NodeForm {
                        flow_id: self.flow_id,
                        node_id: self.nodes[idx].id,
                        form_id: form.id,
                    });
                    self.forms.push(form);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn close_tag(&mut self, name: &str) {
        match name {
            "process" => self.in_process = false,
            "startEvent" | "endEvent" | "userTask" | "serviceTask" | "exclusiveGateway"
            | "parallelGateway" | "intermediateCatchEvent" => self.current_node = None,
            "sequenceFlow" => self.current_flow = None,
            "conditionExpression" => self.in_condition = false,
            "timeDuration" => self.in_duration = false,
            _ => {}
        }
    }

    fn text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.in_condition {
            if let Some(idx) = self.current_flow {
                self.raw_flows[idx].expression = text.to_string();
            }
        }
        if self.in_duration {
            if let Some(idx) = self.current_node {
                if let Some(secs) = parse_duration_secs(text) {
                    self.properties.push(NodeProperty {
                        id: Uuid::now_v7(),
                        flow_id: self.flow_id,
                        node_id: self.nodes[idx].id,
                        name: "duration".to_string(),
                        value: secs.to_string(),
                    });
                }
            }
        }
    }

    fn add_node(&mut self, e: &BytesStart, type_code: NodeType, is_empty: bool) -> Result<()> {
        let node = Node {
            id: Uuid::now_v7(),
            flow_id: self.flow_id,
            code: get_attr(e, "id")?,
            type_code,
            name: get_attr_opt(e, "name").unwrap_or_default(),
        };
        self.nodes.push(node);
        if !is_empty {
            self.current_node = Some(self.nodes.len() - 1);
        }
        Ok(())
    }

    fn finish(self) -> Result<FlowDefinition> {
        let code = self
            .process_code
            .ok_or_else(|| FlowError::Definition("no <process> element found".to_string()))?;

        let by_code: HashMap<&str, Uuid> = self
            .nodes
            .iter()
            .map(|n| (n.code.as_str(), n.id))
            .collect();

        let mut routers = Vec::with_capacity(self.raw_flows.len());
        for (order, raw) in self.raw_flows.iter().enumerate() {
            let source = *by_code.get(raw.source.as_str()).ok_or_else(|| {
                FlowError::Definition(format!(
                    "sequenceFlow '{}' references unknown sourceRef '{}'",
                    raw.code, raw.source
                ))
            })?;
            let target = *by_code.get(raw.target.as_str()).ok_or_else(|| {
                FlowError::Definition(format!(
                    "sequenceFlow '{}' references unknown targetRef '{}'",
                    raw.code, raw.target
                ))
            })?;
            routers.push(RouterEdge {
                id: Uuid::now_v7(),
                flow_id: self.flow_id,
                source_node_id: source,
                target_node_id: target,
                expression: raw.expression.clone(),
                order: order as i32,
            });
        }

        Ok(FlowDefinition {
            flow: Flow {
                id: self.flow_id,
                code,
                name: self.process_name,
                version: 1,
                status: FlowStatus::Active,
                created: 0,
            },
            nodes: self.nodes,
            routers,
            assignments: self.assignments,
            properties: self.properties,
            forms: self.forms,
            node_forms: self.node_forms,
        })
    }
}

fn local(name: QName<'_>) -> String {
    String::from_utf8_lossy(name.local_name().as_ref()).into_owned()
}

fn get_attr(e: &BytesStart, name: &str) -> Result<String> {
    get_attr_opt(e, name).ok_or_else(|| {
        FlowError::Definition(format!(
            "missing attribute '{name}' on <{}>",
            String::from_utf8_lossy(e.name().as_ref())
        ))
    })
}

fn get_attr_opt(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name.as_bytes())
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}

/// Parse a timer duration: plain seconds (`"30"`) or ISO-8601 (`"PT30S"`,
/// `"PT1H30M"`).
pub(crate) fn parse_duration_secs(text: &str) -> Option<i64> {
    let t = text.trim();
    if let Ok(n) = t.parse::<i64>() {
        return (n >= 0).then_some(n);
    }
    let body = t.strip_prefix("PT").or_else(|| t.strip_prefix("pt"))?;
    let mut total = 0i64;
    let mut digits = String::new();
    for ch in body.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else {
            let n: i64 = digits.parse().ok()?;
            digits.clear();
            total += match ch.to_ascii_uppercase() {
                'H' => n * 3_600,
                'M' => n * 60,
                'S' => n,
                _ => return None,
            };
        }
    }
    if !digits.is_empty() {
        return None;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEAVE_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL"
                  xmlns:flow="http://flow-lite.dev/schema/1.0">
  <bpmn:process id="process_leave_test" name="Leave request">
    <bpmn:startEvent id="node_start"/>
    <bpmn:userTask id="node_bzr" name="Adviser approval">
      <bpmn:extensionElements>
        <flow:assignment expression="[bzr]"/>
        <flow:property name="candidate" value="bzr"/>
        <flow:form code="leave_form"/>
      </bpmn:extensionElements>
    </bpmn:userTask>
    <bpmn:endEvent id="node_end"/>
    <bpmn:sequenceFlow id="f1" sourceRef="node_start" targetRef="node_bzr"/>
    <bpmn:sequenceFlow id="f2" sourceRef="node_bzr" targetRef="node_end">
      <bpmn:conditionExpression>action == "pass"</bpmn:conditionExpression>
    </bpmn:sequenceFlow>
    <bpmn:sequenceFlow id="f3" sourceRef="node_bzr" targetRef="node_start">
      <bpmn:conditionExpression>action == "back"</bpmn:conditionExpression>
    </bpmn:sequenceFlow>
  </bpmn:process>
</bpmn:definitions>"#;

    #[test]
    fn parses_nodes_edges_and_extensions() {
        let def = parse_bpmn(LEAVE_BPMN).unwrap();

        assert_eq!(def.flow.code, "process_leave_test");
        assert_eq!(def.flow.name, "Leave request");
        assert_eq!(def.nodes.len(), 3);
        assert_eq!(def.routers.len(), 3);

        let bzr = def.nodes.iter().find(|n| n.code == "node_bzr").unwrap();
        assert_eq!(bzr.type_code, NodeType::UserTask);
        assert_eq!(bzr.name, "Adviser approval");

        assert_eq!(def.assignments.len(), 1);
        assert_eq!(def.assignments[0].node_id, bzr.id);
        assert_eq!(def.assignments[0].expression, "[bzr]");

        assert_eq!(def.properties.len(), 1);
        assert_eq!(def.properties[0].name, "candidate");
        assert_eq!(def.properties[0].value, "bzr");

        assert_eq!(def.forms.len(), 1);
        assert_eq!(def.forms[0].code, "leave_form");
        assert_eq!(def.node_forms.len(), 1);
        assert_eq!(def.node_forms[0].node_id, bzr.id);
    }

    #[test]
    fn edge_order_follows_document_order() {
        let def = parse_bpmn(LEAVE_BPMN).unwrap();
        let orders: Vec<i32> = def.routers.iter().map(|r| r.order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
        assert_eq!(def.routers[1].expression, r#"action == "pass""#);
        assert_eq!(def.routers[2].expression, r#"action == "back""#);
        assert!(def.routers[0].expression.is_empty());
    }

    #[test]
    fn parses_timer_duration() {
        let xml = r#"
<definitions>
  <process id="p_timer">
    <startEvent id="s"/>
    <intermediateCatchEvent id="t">
      <timerEventDefinition>
        <timeDuration>PT1H30M</timeDuration>
      </timerEventDefinition>
    </intermediateCatchEvent>
    <endEvent id="e"/>
    <sequenceFlow id="f1" sourceRef="s" targetRef="t"/>
    <sequenceFlow id="f2" sourceRef="t" targetRef="e"/>
  </process>
</definitions>"#;
        let def = parse_bpmn(xml).unwrap();
        let timer = def.nodes.iter().find(|n| n.code == "t").unwrap();
        assert_eq!(timer.type_code, NodeType::TimerEvent);

        let duration = def
            .properties
            .iter()
            .find(|p| p.node_id == timer.id && p.name == "duration")
            .unwrap();
        assert_eq!(duration.value, "5400");
    }

    #[test]
    fn unknown_edge_endpoint_is_rejected() {
        let xml = r#"
<definitions>
  <process id="p_bad">
    <startEvent id="s"/>
    <sequenceFlow id="f1" sourceRef="s" targetRef="missing"/>
  </process>
</definitions>"#;
        let err = parse_bpmn(xml).unwrap_err();
        assert!(matches!(err, FlowError::Definition(_)));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn duration_formats() {
        assert_eq!(parse_duration_secs("30"), Some(30));
        assert_eq!(parse_duration_secs("PT30S"), Some(30));
        assert_eq!(parse_duration_secs("PT1H30M"), Some(5400));
        assert_eq!(parse_duration_secs("PT2H"), Some(7200));
        assert_eq!(parse_duration_secs("-5"), None);
        assert_eq!(parse_duration_secs("soon"), None);
    }
}
