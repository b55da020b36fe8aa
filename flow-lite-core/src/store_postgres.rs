//! PostgreSQL-backed implementation of `FlowStore`.
//!
//! Runtime-checked queries over the relational layout in `migrations/`.
//! Every trait method is one statement or one transaction.

use crate::store::FlowStore;
use crate::types::*;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

/// PostgreSQL store.
pub struct PostgresFlowStore {
    pool: sqlx::PgPool,
}

impl PostgresFlowStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run flow-lite migrations")?;
        Ok(())
    }
}

fn node_type_of(row: &PgRow, column: &str) -> Result<NodeType> {
    let raw: String = row.try_get(column)?;
    NodeType::parse(&raw).ok_or_else(|| anyhow!("unknown node type '{raw}'"))
}

fn node_instance_from_row(row: &PgRow) -> Result<NodeInstance> {
    let status_raw: String = row.try_get("status")?;
    Ok(NodeInstance {
        id: row.try_get("id")?,
        flow_instance_id: row.try_get("flow_instance_id")?,
        node_id: row.try_get("node_id")?,
        input_data: row.try_get("input_data")?,
        out_data: row.try_get("out_data")?,
        processor: row.try_get("processor")?,
        process_time: row.try_get("process_time")?,
        status: NodeInstanceStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown node instance status '{status_raw}'"))?,
        created: row.try_get("created")?,
        deleted: row.try_get("deleted")?,
    })
}

fn flow_from_row(row: &PgRow) -> Result<Flow> {
    let status_raw: String = row.try_get("status")?;
    Ok(Flow {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        status: FlowStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown flow status '{status_raw}'"))?,
        created: row.try_get("created")?,
    })
}

fn query_limit(filter: &WorkFilter) -> i64 {
    if filter.limit == 0 {
        i64::MAX
    } else {
        filter.limit as i64
    }
}

fn type_code_param(filter: &WorkFilter) -> Option<&'static str> {
    filter.type_code.map(NodeType::as_str)
}

#[async_trait]
impl FlowStore for PostgresFlowStore {
    // ── Definitions ──

    async fn save_definition(&self, def: &FlowDefinition) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO flow (id, code, name, version, status, created)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(def.flow.id)
        .bind(&def.flow.code)
        .bind(&def.flow.name)
        .bind(def.flow.version)
        .bind(def.flow.status.as_str())
        .bind(def.flow.created)
        .execute(&mut *tx)
        .await?;

        for node in &def.nodes {
            sqlx::query(
                "INSERT INTO node (id, flow_id, code, type_code, name)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(node.id)
            .bind(node.flow_id)
            .bind(&node.code)
            .bind(node.type_code.as_str())
            .bind(&node.name)
            .execute(&mut *tx)
            .await?;
        }

        for edge in &def.routers {
            sqlx::query(
                "INSERT INTO node_router (id, flow_id, source_node_id, target_node_id, expression, ord)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(edge.id)
            .bind(edge.flow_id)
            .bind(edge.source_node_id)
            .bind(edge.target_node_id)
            .bind(&edge.expression)
            .bind(edge.order)
            .execute(&mut *tx)
            .await?;
        }

        for rule in &def.assignments {
            sqlx::query(
                "INSERT INTO node_assignment (id, flow_id, node_id, expression)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(rule.id)
            .bind(rule.flow_id)
            .bind(rule.node_id)
            .bind(&rule.expression)
            .execute(&mut *tx)
            .await?;
        }

        for prop in &def.properties {
            sqlx::query(
                "INSERT INTO node_property (id, flow_id, node_id, name, value)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(prop.id)
            .bind(prop.flow_id)
            .bind(prop.node_id)
            .bind(&prop.name)
            .bind(&prop.value)
            .execute(&mut *tx)
            .await?;
        }

        for form in &def.forms {
            sqlx::query("INSERT INTO form (id, flow_id, code, data) VALUES ($1, $2, $3, $4)")
                .bind(form.id)
                .bind(form.flow_id)
                .bind(&form.code)
                .bind(&form.data)
                .execute(&mut *tx)
                .await?;
        }

        for binding in &def.node_forms {
            sqlx::query("INSERT INTO node_form (flow_id, node_id, form_id) VALUES ($1, $2, $3)")
                .bind(binding.flow_id)
                .bind(binding.node_id)
                .bind(binding.form_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_definition(&self, flow_id: Uuid) -> Result<Option<FlowDefinition>> {
        let Some(flow_row) =
            sqlx::query("SELECT id, code, name, version, status, created FROM flow WHERE id = $1")
                .bind(flow_id)
                .fetch_optional(&self.pool)
                .await?
        else {
            return Ok(None);
        };
        let flow = flow_from_row(&flow_row)?;

        let node_rows =
            sqlx::query("SELECT id, flow_id, code, type_code, name FROM node WHERE flow_id = $1")
                .bind(flow_id)
                .fetch_all(&self.pool)
                .await?;
        let mut nodes = Vec::with_capacity(node_rows.len());
        for row in &node_rows {
            nodes.push(Node {
                id: row.try_get("id")?,
                flow_id: row.try_get("flow_id")?,
                code: row.try_get("code")?,
                type_code: node_type_of(row, "type_code")?,
                name: row.try_get("name")?,
            });
        }

        let router_rows = sqlx::query(
            "SELECT id, flow_id, source_node_id, target_node_id, expression, ord
             FROM node_router WHERE flow_id = $1 ORDER BY ord",
        )
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await?;
        let mut routers = Vec::with_capacity(router_rows.len());
        for row in &router_rows {
            routers.push(RouterEdge {
                id: row.try_get("id")?,
                flow_id: row.try_get("flow_id")?,
                source_node_id: row.try_get("source_node_id")?,
                target_node_id: row.try_get("target_node_id")?,
                expression: row.try_get("expression")?,
                order: row.try_get("ord")?,
            });
        }

        let assignment_rows = sqlx::query(
            "SELECT id, flow_id, node_id, expression FROM node_assignment WHERE flow_id = $1",
        )
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await?;
        let mut assignments = Vec::with_capacity(assignment_rows.len());
        for row in &assignment_rows {
            assignments.push(Assignment {
                id: row.try_get("id")?,
                flow_id: row.try_get("flow_id")?,
                node_id: row.try_get("node_id")?,
                expression: row.try_get("expression")?,
            });
        }

        let property_rows = sqlx::query(
            "SELECT id, flow_id, node_id, name, value FROM node_property WHERE flow_id = $1",
        )
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await?;
        let mut properties = Vec::with_capacity(property_rows.len());
        for row in &property_rows {
            properties.push(NodeProperty {
                id: row.try_get("id")?,
                flow_id: row.try_get("flow_id")?,
                node_id: row.try_get("node_id")?,
                name: row.try_get("name")?,
                value: row.try_get("value")?,
            });
        }

        let form_rows = sqlx::query("SELECT id, flow_id, code, data FROM form WHERE flow_id = $1")
            .bind(flow_id)
            .fetch_all(&self.pool)
            .await?;
        let mut forms = Vec::with_capacity(form_rows.len());
        for row in &form_rows {
            forms.push(Form {
                id: row.try_get("id")?,
                flow_id: row.try_get("flow_id")?,
                code: row.try_get("code")?,
                data: row.try_get("data")?,
            });
        }

        let binding_rows =
            sqlx::query("SELECT flow_id, node_id, form_id FROM node_form WHERE flow_id = $1")
                .bind(flow_id)
                .fetch_all(&self.pool)
                .await?;
        let mut node_forms = Vec::with_capacity(binding_rows.len());
        for row in &binding_rows {
            node_forms.push(NodeForm {
                flow_id: row.try_get("flow_id")?,
                node_id: row.try_get("node_id")?,
                form_id: row.try_get("form_id")?,
            });
        }

        Ok(Some(FlowDefinition {
            flow,
            nodes,
            routers,
            assignments,
            properties,
            forms,
            node_forms,
        }))
    }

    async fn list_flows(&self) -> Result<Vec<Flow>> {
        let rows = sqlx::query(
            "SELECT id, code, name, version, status, created FROM flow ORDER BY code, version",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(flow_from_row).collect()
    }

    // ── Flow instances ──

    async fn create_flow_instance(
        &self,
        instance: &FlowInstance,
        first_node: &NodeInstance,
        candidates: &[NodeCandidate],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO flow_instance (id, flow_id, launcher, launch_time, status, created)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(instance.id)
        .bind(instance.flow_id)
        .bind(&instance.launcher)
        .bind(instance.launch_time)
        .bind(instance.status.as_str())
        .bind(instance.created)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO node_instance
                 (id, flow_instance_id, node_id, input_data, out_data, processor,
                  process_time, status, created, deleted)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(first_node.id)
        .bind(first_node.flow_instance_id)
        .bind(first_node.node_id)
        .bind(&first_node.input_data)
        .bind(&first_node.out_data)
        .bind(&first_node.processor)
        .bind(first_node.process_time)
        .bind(first_node.status.as_str())
        .bind(first_node.created)
        .bind(first_node.deleted)
        .execute(&mut *tx)
        .await?;

        for candidate in candidates {
            sqlx::query(
                "INSERT INTO node_candidate (id, node_instance_id, candidate_id, created)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(candidate.id)
            .bind(candidate.node_instance_id)
            .bind(&candidate.candidate_id)
            .bind(candidate.created)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_flow_instance(&self, id: Uuid) -> Result<Option<FlowInstance>> {
        let Some(row) = sqlx::query(
            "SELECT id, flow_id, launcher, launch_time, status, created
             FROM flow_instance WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let status_raw: String = row.try_get("status")?;
        Ok(Some(FlowInstance {
            id: row.try_get("id")?,
            flow_id: row.try_get("flow_id")?,
            launcher: row.try_get("launcher")?,
            launch_time: row.try_get("launch_time")?,
            status: FlowInstanceStatus::parse(&status_raw)
                .ok_or_else(|| anyhow!("unknown flow instance status '{status_raw}'"))?,
            created: row.try_get("created")?,
        }))
    }

    async fn update_flow_instance_status(
        &self,
        id: Uuid,
        status: FlowInstanceStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE flow_instance SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Node instances ──

    async fn create_node_instance(
        &self,
        instance: &NodeInstance,
        candidates: &[NodeCandidate],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO node_instance
                 (id, flow_instance_id, node_id, input_data, out_data, processor,
                  process_time, status, created, deleted)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(instance.id)
        .bind(instance.flow_instance_id)
        .bind(instance.node_id)
        .bind(&instance.input_data)
        .bind(&instance.out_data)
        .bind(&instance.processor)
        .bind(instance.process_time)
        .bind(instance.status.as_str())
        .bind(instance.created)
        .bind(instance.deleted)
        .execute(&mut *tx)
        .await?;

        for candidate in candidates {
            sqlx::query(
                "INSERT INTO node_candidate (id, node_instance_id, candidate_id, created)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(candidate.id)
            .bind(candidate.node_instance_id)
            .bind(&candidate.candidate_id)
            .bind(candidate.created)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_node_instance(&self, id: Uuid) -> Result<Option<NodeInstance>> {
        let row = sqlx::query(
            "SELECT id, flow_instance_id, node_id, input_data, out_data, processor,
                    process_time, status, created, deleted
             FROM node_instance WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(node_instance_from_row).transpose()
    }

    async fn complete_node_instance(
        &self,
        id: Uuid,
        processor: &str,
        process_time: EpochSecs,
        out_data: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE node_instance
             SET processor = $2, process_time = $3, out_data = $4, status = 'complete'
             WHERE id = $1 AND status = 'running' AND deleted IS NULL",
        )
        .bind(id)
        .bind(processor)
        .bind(process_time)
        .bind(out_data)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn has_running_node_instances(&self, flow_instance_id: Uuid) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (
                 SELECT 1 FROM node_instance
                 WHERE flow_instance_id = $1 AND status = 'running' AND deleted IS NULL
             ) AS running",
        )
        .bind(flow_instance_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("running")?)
    }

    async fn cancel_running_node_instances(
        &self,
        flow_instance_id: Uuid,
        at: EpochSecs,
    ) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "UPDATE node_instance SET deleted = $2
             WHERE flow_instance_id = $1 AND status = 'running' AND deleted IS NULL
             RETURNING id",
        )
        .bind(flow_instance_id)
        .bind(at)
        .fetch_all(&mut *tx)
        .await?;
        let mut cancelled = Vec::with_capacity(rows.len());
        for row in &rows {
            cancelled.push(row.try_get::<Uuid, _>("id")?);
        }

        if !cancelled.is_empty() {
            sqlx::query(
                "UPDATE node_timing SET deleted = $2
                 WHERE node_instance_id = ANY($1) AND deleted IS NULL",
            )
            .bind(&cancelled)
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(cancelled)
    }

    async fn last_completed_node_instance(
        &self,
        flow_instance_id: Uuid,
        node_id: Uuid,
    ) -> Result<Option<NodeInstance>> {
        let row = sqlx::query(
            "SELECT id, flow_instance_id, node_id, input_data, out_data, processor,
                    process_time, status, created, deleted
             FROM node_instance
             WHERE flow_instance_id = $1 AND node_id = $2 AND status = 'complete'
             ORDER BY process_time DESC, created DESC, id DESC
             LIMIT 1",
        )
        .bind(flow_instance_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(node_instance_from_row).transpose()
    }

    // ── Candidates ──

    async fn load_candidates(&self, node_instance_id: Uuid) -> Result<Vec<NodeCandidate>> {
        let rows = sqlx::query(
            "SELECT id, node_instance_id, candidate_id, created
             FROM node_candidate WHERE node_instance_id = $1
             ORDER BY created",
        )
        .bind(node_instance_id)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            candidates.push(NodeCandidate {
                id: row.try_get("id")?,
                node_instance_id: row.try_get("node_instance_id")?,
                candidate_id: row.try_get("candidate_id")?,
                created: row.try_get("created")?,
            });
        }
        Ok(candidates)
    }

    async fn is_candidate(&self, node_instance_id: Uuid, user_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (
                 SELECT 1 FROM node_candidate
                 WHERE node_instance_id = $1 AND candidate_id = $2
             ) AS found",
        )
        .bind(node_instance_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("found")?)
    }

    // ── Join barriers ──

    async fn join_arrive(&self, flow_instance_id: Uuid, join_node_id: Uuid) -> Result<u32> {
        let row = sqlx::query(
            "INSERT INTO node_join (flow_instance_id, join_node_id, arrived)
             VALUES ($1, $2, 1)
             ON CONFLICT (flow_instance_id, join_node_id)
             DO UPDATE SET arrived = node_join.arrived + 1
             RETURNING arrived",
        )
        .bind(flow_instance_id)
        .bind(join_node_id)
        .fetch_one(&self.pool)
        .await?;
        let arrived: i32 = row.try_get("arrived")?;
        Ok(arrived as u32)
    }

    async fn join_reset(&self, flow_instance_id: Uuid, join_node_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM node_join WHERE flow_instance_id = $1 AND join_node_id = $2")
            .bind(flow_instance_id)
            .bind(join_node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Timers ──

    async fn create_node_timing(&self, timing: &NodeTiming) -> Result<()> {
        sqlx::query(
            "INSERT INTO node_timing
                 (id, node_instance_id, flow_instance_id, expires_at, created, deleted)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(timing.id)
        .bind(timing.node_instance_id)
        .bind(timing.flow_instance_id)
        .bind(timing.expires_at)
        .bind(timing.created)
        .bind(timing.deleted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_node_timing(&self, node_instance_id: Uuid, at: EpochSecs) -> Result<()> {
        sqlx::query(
            "UPDATE node_timing SET deleted = $2
             WHERE node_instance_id = $1 AND deleted IS NULL",
        )
        .bind(node_instance_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn expired_node_timings(&self, now: EpochSecs) -> Result<Vec<NodeTiming>> {
        let rows = sqlx::query(
            "SELECT id, node_instance_id, flow_instance_id, expires_at, created, deleted
             FROM node_timing
             WHERE deleted IS NULL AND expires_at <= $1
             ORDER BY expires_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut timings = Vec::with_capacity(rows.len());
        for row in &rows {
            timings.push(NodeTiming {
                id: row.try_get("id")?,
                node_instance_id: row.try_get("node_instance_id")?,
                flow_instance_id: row.try_get("flow_instance_id")?,
                expires_at: row.try_get("expires_at")?,
                created: row.try_get("created")?,
                deleted: row.try_get("deleted")?,
            });
        }
        Ok(timings)
    }

    // ── Work queries ──

    async fn query_todo(&self, user_id: &str, filter: &WorkFilter) -> Result<Vec<TodoItem>> {
        let rows = sqlx::query(
            "SELECT ni.id AS node_instance_id, ni.flow_instance_id,
                    f.code AS flow_code, f.name AS flow_name,
                    n.id AS node_id, n.code AS node_code, n.name AS node_name, n.type_code,
                    ni.input_data, fi.launcher, fi.launch_time, ni.created
             FROM node_instance ni
             JOIN node_candidate c ON c.node_instance_id = ni.id
             JOIN flow_instance fi ON fi.id = ni.flow_instance_id
             JOIN node n ON n.id = ni.node_id
             JOIN flow f ON f.id = fi.flow_id
             WHERE c.candidate_id = $1
               AND ni.status = 'running' AND ni.deleted IS NULL
               AND ($2::text IS NULL OR f.code = $2)
               AND ($3::text IS NULL OR n.type_code = $3)
             ORDER BY ni.created
             LIMIT $4",
        )
        .bind(user_id)
        .bind(filter.flow_code.as_deref())
        .bind(type_code_param(filter))
        .bind(query_limit(filter))
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(TodoItem {
                node_instance_id: row.try_get("node_instance_id")?,
                flow_instance_id: row.try_get("flow_instance_id")?,
                flow_code: row.try_get("flow_code")?,
                flow_name: row.try_get("flow_name")?,
                node_id: row.try_get("node_id")?,
                node_code: row.try_get("node_code")?,
                node_name: row.try_get("node_name")?,
                node_type: node_type_of(row, "type_code")?,
                input_data: row.try_get("input_data")?,
                launcher: row.try_get("launcher")?,
                launch_time: row.try_get("launch_time")?,
                created: row.try_get("created")?,
            });
        }
        Ok(items)
    }

    async fn query_done(
        &self,
        user_id: &str,
        filter: &WorkFilter,
        since: EpochSecs,
    ) -> Result<Vec<DoneItem>> {
        let rows = sqlx::query(
            "SELECT ni.id AS node_instance_id, ni.flow_instance_id,
                    f.code AS flow_code, f.name AS flow_name,
                    n.id AS node_id, n.code AS node_code, n.name AS node_name, n.type_code,
                    ni.processor, ni.process_time, ni.out_data, ni.created
             FROM node_instance ni
             JOIN flow_instance fi ON fi.id = ni.flow_instance_id
             JOIN node n ON n.id = ni.node_id
             JOIN flow f ON f.id = fi.flow_id
             WHERE ni.processor = $1
               AND ni.status = 'complete' AND ni.process_time >= $2
               AND ($3::text IS NULL OR f.code = $3)
               AND ($4::text IS NULL OR n.type_code = $4)
             ORDER BY ni.process_time DESC
             LIMIT $5",
        )
        .bind(user_id)
        .bind(since)
        .bind(filter.flow_code.as_deref())
        .bind(type_code_param(filter))
        .bind(query_limit(filter))
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(DoneItem {
                node_instance_id: row.try_get("node_instance_id")?,
                flow_instance_id: row.try_get("flow_instance_id")?,
                flow_code: row.try_get("flow_code")?,
                flow_name: row.try_get("flow_name")?,
                node_id: row.try_get("node_id")?,
                node_code: row.try_get("node_code")?,
                node_name: row.try_get("node_name")?,
                node_type: node_type_of(row, "type_code")?,
                processor: row.try_get("processor")?,
                process_time: row.try_get("process_time")?,
                out_data: row.try_get("out_data")?,
                created: row.try_get("created")?,
            });
        }
        Ok(items)
    }

    async fn query_history(&self, flow_instance_id: Uuid) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            "SELECT ni.id AS node_instance_id,
                    n.id AS node_id, n.code AS node_code, n.name AS node_name, n.type_code,
                    ni.processor, ni.process_time, ni.input_data, ni.out_data
             FROM node_instance ni
             JOIN node n ON n.id = ni.node_id
             WHERE ni.flow_instance_id = $1 AND ni.status = 'complete'
             ORDER BY ni.process_time, ni.id",
        )
        .bind(flow_instance_id)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(HistoryEntry {
                node_instance_id: row.try_get("node_instance_id")?,
                node_id: row.try_get("node_id")?,
                node_code: row.try_get("node_code")?,
                node_name: row.try_get("node_name")?,
                node_type: node_type_of(row, "type_code")?,
                processor: row.try_get("processor")?,
                process_time: row.try_get("process_time")?,
                input_data: row.try_get("input_data")?,
                out_data: row.try_get("out_data")?,
            });
        }
        Ok(entries)
    }
}
