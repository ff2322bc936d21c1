//! Postgres workflow repository
//!
//! Queries run on the connection of the context's tenant scope. Row-level
//! security on `ontology_workflows` filters every statement to the bound
//! tenant, so no query here mentions `project_id` in its `WHERE` clause.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgQueryResult;
use sqlx::types::Json;
use sqlx::{PgConnection, Postgres};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::WorkflowRepository;
use crate::context::{bounded, RequestContext};
use crate::error::{StoreError, StoreResult};
use crate::metrics::{record_claim, record_heartbeat};
use crate::scope::TenantId;
use crate::workflow::{
    StaleLease, Workflow, WorkflowChange, WorkflowProgress, WorkflowState, WorkflowTask,
};

#[derive(Debug, sqlx::FromRow)]
struct WorkflowRow {
    id: Uuid,
    project_id: Uuid,
    ontology_id: Uuid,
    state: String,
    progress: Value,
    task_queue: Value,
    config: Value,
    error_message: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    phase: String,
    datasource_id: Option<Uuid>,
    owner_id: Option<String>,
    last_heartbeat: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = StoreError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        Ok(Workflow {
            id: row.id,
            project_id: TenantId::new(row.project_id),
            ontology_id: row.ontology_id,
            state: row.state.parse()?,
            progress: serde_json::from_value(row.progress)?,
            task_queue: serde_json::from_value(row.task_queue)?,
            config: row.config,
            error_message: row.error_message,
            started_at: row.started_at,
            completed_at: row.completed_at,
            phase: row.phase.parse()?,
            datasource_id: row.datasource_id,
            owner_id: row.owner_id,
            last_heartbeat: row.last_heartbeat,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Workflow repository over tenant-scoped Postgres connections
#[derive(Debug, Clone, Default)]
pub struct PgWorkflowRepository;

impl PgWorkflowRepository {
    pub fn new() -> Self {
        Self
    }
}

/// Single conditional write for a state, progress or task queue change.
///
/// With `owner_id` set the row must also be owned by that instance.
async fn write_change(
    conn: &mut PgConnection,
    id: Uuid,
    owner_id: Option<&str>,
    change: &WorkflowChange,
) -> StoreResult<PgQueryResult> {
    let result = match change {
        WorkflowChange::State {
            state,
            error_message,
        } => {
            sqlx::query(
                r#"
                UPDATE ontology_workflows
                SET state = $3,
                    error_message = $4,
                    completed_at = CASE
                        WHEN $5 AND completed_at IS NULL THEN NOW()
                        ELSE completed_at
                    END,
                    updated_at = NOW()
                WHERE id = $1 AND ($2::TEXT IS NULL OR owner_id = $2)
                "#,
            )
            .bind(id)
            .bind(owner_id)
            .bind(state.as_str())
            .bind(error_message.as_deref())
            .bind(state.is_terminal())
            .execute(conn)
            .await?
        }
        WorkflowChange::Progress(progress) => {
            let progress = serde_json::to_value(progress)?;
            sqlx::query(
                r#"
                UPDATE ontology_workflows
                SET progress = $3, updated_at = NOW()
                WHERE id = $1 AND ($2::TEXT IS NULL OR owner_id = $2)
                "#,
            )
            .bind(id)
            .bind(owner_id)
            .bind(Json(progress))
            .execute(conn)
            .await?
        }
        WorkflowChange::TaskQueue(tasks) => {
            let tasks = serde_json::to_value(tasks)?;
            sqlx::query(
                r#"
                UPDATE ontology_workflows
                SET task_queue = $3, updated_at = NOW()
                WHERE id = $1 AND ($2::TEXT IS NULL OR owner_id = $2)
                "#,
            )
            .bind(id)
            .bind(owner_id)
            .bind(Json(tasks))
            .execute(conn)
            .await?
        }
    };

    Ok(result)
}

impl PgWorkflowRepository {
    async fn apply_unguarded(
        &self,
        ctx: &mut RequestContext<PoolConnection<Postgres>>,
        id: Uuid,
        change: WorkflowChange,
    ) -> StoreResult<()> {
        let (conn, deadline) = ctx.session()?;

        let result = bounded(deadline, write_change(&mut **conn, id, None, &change)).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }

        debug!(workflow_id = %id, change = change.kind(), "Workflow updated");
        Ok(())
    }
}

#[async_trait]
impl WorkflowRepository for PgWorkflowRepository {
    type Conn = PoolConnection<Postgres>;

    async fn create(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        workflow: &Workflow,
    ) -> StoreResult<()> {
        let (conn, deadline) = ctx.session()?;
        let progress = serde_json::to_value(&workflow.progress)?;
        let task_queue = serde_json::to_value(&workflow.task_queue)?;

        bounded(deadline, async {
            sqlx::query(
                r#"
                INSERT INTO ontology_workflows (
                    id, project_id, ontology_id, state, progress, task_queue, config,
                    error_message, started_at, completed_at, phase, datasource_id,
                    created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(workflow.id)
            .bind(workflow.project_id.as_uuid())
            .bind(workflow.ontology_id)
            .bind(workflow.state.as_str())
            .bind(Json(&progress))
            .bind(Json(&task_queue))
            .bind(Json(&workflow.config))
            .bind(workflow.error_message.as_deref())
            .bind(workflow.started_at)
            .bind(workflow.completed_at)
            .bind(workflow.phase.as_str())
            .bind(workflow.datasource_id)
            .bind(workflow.created_at)
            .bind(workflow.updated_at)
            .execute(&mut **conn)
            .await?;
            Ok::<_, StoreError>(())
        })
        .await?;

        debug!(
            workflow_id = %workflow.id,
            tenant_id = %workflow.project_id,
            "Workflow created"
        );
        Ok(())
    }

    async fn get_by_id(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
    ) -> StoreResult<Option<Workflow>> {
        let (conn, deadline) = ctx.session()?;

        let row = bounded(deadline, async {
            let row = sqlx::query_as::<_, WorkflowRow>(
                r#"
                SELECT id, project_id, ontology_id, state, progress, task_queue, config,
                       error_message, started_at, completed_at, phase, datasource_id,
                       owner_id, last_heartbeat, created_at, updated_at
                FROM ontology_workflows
                WHERE id = $1
                "#,
            )
            .bind(id)
            .fetch_optional(&mut **conn)
            .await?;
            Ok::<_, StoreError>(row)
        })
        .await?;

        row.map(Workflow::try_from).transpose()
    }

    async fn get_latest_by_ontology(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        ontology_id: Uuid,
    ) -> StoreResult<Option<Workflow>> {
        let (conn, deadline) = ctx.session()?;

        let row = bounded(deadline, async {
            let row = sqlx::query_as::<_, WorkflowRow>(
                r#"
                SELECT id, project_id, ontology_id, state, progress, task_queue, config,
                       error_message, started_at, completed_at, phase, datasource_id,
                       owner_id, last_heartbeat, created_at, updated_at
                FROM ontology_workflows
                WHERE ontology_id = $1
                ORDER BY created_at DESC
                LIMIT 1
                "#,
            )
            .bind(ontology_id)
            .fetch_optional(&mut **conn)
            .await?;
            Ok::<_, StoreError>(row)
        })
        .await?;

        row.map(Workflow::try_from).transpose()
    }

    async fn update(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        workflow: &Workflow,
    ) -> StoreResult<()> {
        let (conn, deadline) = ctx.session()?;
        let progress = serde_json::to_value(&workflow.progress)?;
        let task_queue = serde_json::to_value(&workflow.task_queue)?;

        let result = bounded(deadline, async {
            let result = sqlx::query(
                r#"
                UPDATE ontology_workflows
                SET state = $2,
                    progress = $3,
                    task_queue = $4,
                    config = $5,
                    error_message = $6,
                    started_at = $7,
                    completed_at = $8,
                    phase = $9,
                    datasource_id = $10,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(workflow.id)
            .bind(workflow.state.as_str())
            .bind(Json(&progress))
            .bind(Json(&task_queue))
            .bind(Json(&workflow.config))
            .bind(workflow.error_message.as_deref())
            .bind(workflow.started_at)
            .bind(workflow.completed_at)
            .bind(workflow.phase.as_str())
            .bind(workflow.datasource_id)
            .execute(&mut **conn)
            .await?;
            Ok::<_, StoreError>(result)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(workflow.id));
        }
        Ok(())
    }

    async fn update_state(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        state: WorkflowState,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        let change = WorkflowChange::State {
            state,
            error_message: error_message.map(str::to_string),
        };
        self.apply_unguarded(ctx, id, change).await
    }

    async fn update_progress(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        progress: &WorkflowProgress,
    ) -> StoreResult<()> {
        self.apply_unguarded(ctx, id, WorkflowChange::Progress(progress.clone()))
            .await
    }

    async fn update_task_queue(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        tasks: &[WorkflowTask],
    ) -> StoreResult<()> {
        self.apply_unguarded(ctx, id, WorkflowChange::TaskQueue(tasks.to_vec()))
            .await
    }

    async fn apply_as_owner(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        owner_id: &str,
        change: &WorkflowChange,
    ) -> StoreResult<()> {
        let (conn, deadline) = ctx.session()?;

        let result =
            bounded(deadline, write_change(&mut **conn, id, Some(owner_id), change)).await?;
        if result.rows_affected() == 0 {
            warn!(
                workflow_id = %id,
                owner_id = %owner_id,
                change = change.kind(),
                "Owner-guarded write rejected: lease not held"
            );
            return Err(StoreError::not_owned(id, owner_id));
        }
        Ok(())
    }

    async fn delete(&self, ctx: &mut RequestContext<Self::Conn>, id: Uuid) -> StoreResult<()> {
        let (conn, deadline) = ctx.session()?;

        let result = bounded(deadline, async {
            let result = sqlx::query("DELETE FROM ontology_workflows WHERE id = $1")
                .bind(id)
                .execute(&mut **conn)
                .await?;
            Ok::<_, StoreError>(result)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn claim_ownership(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        owner_id: &str,
    ) -> StoreResult<bool> {
        let (conn, deadline) = ctx.session()?;

        let result = bounded(deadline, async {
            let result = sqlx::query(
                r#"
                UPDATE ontology_workflows
                SET owner_id = $2, last_heartbeat = NOW()
                WHERE id = $1 AND (owner_id IS NULL OR owner_id = $2)
                "#,
            )
            .bind(id)
            .bind(owner_id)
            .execute(&mut **conn)
            .await?;
            Ok::<_, StoreError>(result)
        })
        .await;

        match result {
            Ok(result) if result.rows_affected() > 0 => {
                record_claim("acquired");
                info!(workflow_id = %id, owner_id = %owner_id, "Workflow ownership claimed");
                Ok(true)
            }
            Ok(_) => {
                record_claim("conflict");
                debug!(workflow_id = %id, owner_id = %owner_id, "Workflow already owned");
                Ok(false)
            }
            Err(e) => {
                record_claim("error");
                Err(e)
            }
        }
    }

    async fn update_heartbeat(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        owner_id: &str,
    ) -> StoreResult<()> {
        let (conn, deadline) = ctx.session()?;

        let result = bounded(deadline, async {
            let result = sqlx::query(
                r#"
                UPDATE ontology_workflows
                SET last_heartbeat = NOW()
                WHERE id = $1 AND owner_id = $2
                "#,
            )
            .bind(id)
            .bind(owner_id)
            .execute(&mut **conn)
            .await?;
            Ok::<_, StoreError>(result)
        })
        .await;

        match result {
            Ok(result) if result.rows_affected() > 0 => {
                record_heartbeat("renewed");
                Ok(())
            }
            Ok(_) => {
                record_heartbeat("not_owned");
                Err(StoreError::not_owned(id, owner_id))
            }
            Err(e) => {
                record_heartbeat("error");
                Err(e)
            }
        }
    }

    async fn release_ownership(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
    ) -> StoreResult<()> {
        let (conn, deadline) = ctx.session()?;

        let result = bounded(deadline, async {
            let result = sqlx::query(
                r#"
                UPDATE ontology_workflows
                SET owner_id = NULL, last_heartbeat = NULL
                WHERE id = $1
                "#,
            )
            .bind(id)
            .execute(&mut **conn)
            .await?;
            Ok::<_, StoreError>(result)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }

        info!(workflow_id = %id, "Workflow ownership released");
        Ok(())
    }

    async fn release_owned(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        owner_id: &str,
    ) -> StoreResult<bool> {
        let (conn, deadline) = ctx.session()?;

        let result = bounded(deadline, async {
            let result = sqlx::query(
                r#"
                UPDATE ontology_workflows
                SET owner_id = NULL, last_heartbeat = NULL
                WHERE id = $1 AND owner_id = $2
                "#,
            )
            .bind(id)
            .bind(owner_id)
            .execute(&mut **conn)
            .await?;
            Ok::<_, StoreError>(result)
        })
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                workflow_id = %id,
                owner_id = %owner_id,
                "Release skipped: lease held by another owner"
            );
            return Ok(false);
        }

        info!(workflow_id = %id, owner_id = %owner_id, "Workflow ownership released");
        Ok(true)
    }

    async fn list_stale_leases(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        stale_after: Duration,
        limit: i64,
    ) -> StoreResult<Vec<StaleLease>> {
        let (conn, deadline) = ctx.session()?;

        let rows = bounded(deadline, async {
            let rows = sqlx::query_as::<_, (Uuid, Uuid, String, DateTime<Utc>)>(
                r#"
                SELECT id, project_id, owner_id, last_heartbeat
                FROM ontology_workflows
                WHERE owner_id IS NOT NULL
                  AND last_heartbeat < NOW() - make_interval(secs => $1)
                ORDER BY last_heartbeat ASC
                LIMIT $2
                "#,
            )
            .bind(stale_after.as_secs_f64())
            .bind(limit)
            .fetch_all(&mut **conn)
            .await?;
            Ok::<_, StoreError>(rows)
        })
        .await?;

        Ok(rows
            .into_iter()
            .map(|(workflow_id, project_id, owner_id, last_heartbeat)| StaleLease {
                workflow_id,
                project_id: TenantId::new(project_id),
                owner_id,
                last_heartbeat,
            })
            .collect())
    }

    async fn reset_stale_lease(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        owner_id: &str,
        stale_after: Duration,
    ) -> StoreResult<bool> {
        let (conn, deadline) = ctx.session()?;

        let result = bounded(deadline, async {
            let result = sqlx::query(
                r#"
                UPDATE ontology_workflows
                SET owner_id = NULL, last_heartbeat = NULL
                WHERE id = $1
                  AND owner_id = $2
                  AND last_heartbeat < NOW() - make_interval(secs => $3)
                "#,
            )
            .bind(id)
            .bind(owner_id)
            .bind(stale_after.as_secs_f64())
            .execute(&mut **conn)
            .await?;
            Ok::<_, StoreError>(result)
        })
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> WorkflowRow {
        let now = Utc::now();
        WorkflowRow {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            ontology_id: Uuid::new_v4(),
            state: "awaiting_input".to_string(),
            progress: json!({"phase": "entity_inference", "current": 2, "total": 5}),
            task_queue: json!([]),
            config: json!({"llm": false}),
            error_message: None,
            started_at: Some(now),
            completed_at: None,
            phase: "relationship_confirmation".to_string(),
            datasource_id: None,
            owner_id: Some("worker-a".to_string()),
            last_heartbeat: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_row_conversion() {
        let wf = Workflow::try_from(row()).unwrap();
        assert_eq!(wf.state, WorkflowState::AwaitingInput);
        assert_eq!(wf.progress.current, 2);
        assert_eq!(wf.owner_id.as_deref(), Some("worker-a"));
        assert!(wf.task_queue.is_empty());
    }

    #[test]
    fn test_row_with_unknown_state_is_rejected() {
        let mut bad = row();
        bad.state = "archived".to_string();
        assert!(matches!(
            Workflow::try_from(bad),
            Err(StoreError::InvalidInput(_))
        ));

        let mut bad = row();
        bad.task_queue = json!({"not": "a list"});
        assert!(matches!(
            Workflow::try_from(bad),
            Err(StoreError::Serialization(_))
        ));
    }
}
