use sqlx::{sqlite::SqliteRow, Executor, QueryBuilder, Row, Sqlite};

use super::{decode_error, from_unix_nanos, to_unix_nanos};
use crate::models::{AuditEvent, AuditEventType, AuditOutcome, Scope};

/// Filters applied on top of the mandatory scope match. Time bounds are inclusive.
#[derive(Debug, Clone)]
pub struct AuditEventFilter<'a> {
    pub scope: &'a Scope,
    pub event_type: Option<AuditEventType>,
    pub actor: Option<&'a str>,
    pub from_unix_ns: Option<i64>,
    pub to_unix_ns: Option<i64>,
    pub limit: i64,
    pub offset: i64,
}

pub async fn insert_event<'c, E>(executor: E, event: &AuditEvent) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO audit_events (
            event_id,
            event_type,
            actor,
            workspace_id,
            project_id,
            environment_id,
            bundle_version_id,
            target_bundle_version_id,
            outcome,
            request_id,
            trace_id,
            created_at_unix_ns
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&event.event_id)
    .bind(event.event_type.as_str())
    .bind(&event.actor)
    .bind(&event.scope.workspace_id)
    .bind(&event.scope.project_id)
    .bind(&event.scope.environment_id)
    .bind(&event.bundle_version_id)
    .bind(&event.target_bundle_version_id)
    .bind(event.outcome.as_str())
    .bind(&event.request_id)
    .bind(&event.trace_id)
    .bind(to_unix_nanos(event.created_at))
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn list_events<'c, E>(
    executor: E,
    filter: &AuditEventFilter<'_>,
) -> Result<Vec<AuditEvent>, sqlx::Error>
where
    E: Executor<'c, Database = Sqlite>,
{
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT event_id, event_type, actor, workspace_id, project_id, environment_id, \
         bundle_version_id, target_bundle_version_id, outcome, request_id, trace_id, \
         created_at_unix_ns FROM audit_events ",
    );
    builder.push("WHERE workspace_id = ");
    builder.push_bind(filter.scope.workspace_id.as_str());
    builder.push(" AND project_id = ");
    builder.push_bind(filter.scope.project_id.as_str());
    builder.push(" AND environment_id = ");
    builder.push_bind(filter.scope.environment_id.as_str());

    if let Some(event_type) = filter.event_type {
        builder.push(" AND event_type = ");
        builder.push_bind(event_type.as_str());
    }

    if let Some(actor) = filter.actor {
        builder.push(" AND actor = ");
        builder.push_bind(actor);
    }

    if let Some(from) = filter.from_unix_ns {
        builder.push(" AND created_at_unix_ns >= ");
        builder.push_bind(from);
    }

    if let Some(to) = filter.to_unix_ns {
        builder.push(" AND created_at_unix_ns <= ");
        builder.push_bind(to);
    }

    builder.push(" ORDER BY created_at_unix_ns DESC, event_id DESC LIMIT ");
    builder.push_bind(filter.limit);
    builder.push(" OFFSET ");
    builder.push_bind(filter.offset);

    let rows = builder.build().fetch_all(executor).await?;
    rows.iter().map(map_row).collect()
}

fn map_row(row: &SqliteRow) -> Result<AuditEvent, sqlx::Error> {
    let event_type: String = row.try_get("event_type")?;
    let event_type = AuditEventType::from_str(&event_type)
        .ok_or_else(|| decode_error(format!("unknown audit event type `{event_type}`")))?;
    let outcome: String = row.try_get("outcome")?;
    let outcome = AuditOutcome::from_str(&outcome)
        .ok_or_else(|| decode_error(format!("unknown audit outcome `{outcome}`")))?;

    Ok(AuditEvent {
        event_id: row.try_get("event_id")?,
        event_type,
        actor: row.try_get("actor")?,
        scope: Scope::new(
            row.try_get::<String, _>("workspace_id")?,
            row.try_get::<String, _>("project_id")?,
            row.try_get::<String, _>("environment_id")?,
        ),
        bundle_version_id: row.try_get("bundle_version_id")?,
        target_bundle_version_id: row.try_get("target_bundle_version_id")?,
        outcome,
        request_id: row.try_get("request_id")?,
        trace_id: row.try_get("trace_id")?,
        created_at: from_unix_nanos(row.try_get("created_at_unix_ns")?),
    })
}
