use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::authz::Authorizer;
use crate::db::{self, audit_events::AuditEventFilter};
use crate::error::{VaultError, VaultResult};
use crate::identity::CallMetadata;
use crate::models::{
    next_cursor, normalize_limit, parse_cursor, require_scope, AuditEvent, AuditEventType,
    AuditOutcome, ListAuditEventsRequest, ListAuditEventsResponse, Operation, Scope,
};
use crate::telemetry::{OperationLog, OperationResult, RoleDecision};

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        actor: &str,
        scope: &Scope,
        outcome: AuditOutcome,
        request_id: &str,
        trace_id: &str,
    ) -> Self {
        Self {
            event_id: format!("evt_{}", Uuid::new_v4()),
            event_type,
            actor: actor.to_string(),
            scope: scope.clone(),
            bundle_version_id: None,
            target_bundle_version_id: None,
            outcome,
            request_id: request_id.to_string(),
            trace_id: trace_id.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn with_versions(mut self, bundle_version_id: Option<&str>, target: Option<&str>) -> Self {
        self.bundle_version_id = bundle_version_id.map(str::to_string);
        self.target_bundle_version_id = target.map(str::to_string);
        self
    }
}

/// Writes `event` through a savepoint of the caller's open transaction.
///
/// A failed insert rolls back only the savepoint; the surrounding transaction
/// stays usable and the failure is logged. Returns whether the row was written.
pub async fn record_in_tx(conn: &mut SqliteConnection, event: &AuditEvent) -> bool {
    let mut savepoint = match sqlx::Connection::begin(conn).await {
        Ok(savepoint) => savepoint,
        Err(error) => {
            log_write_failure(event, &error);
            return false;
        }
    };
    if let Err(error) = db::audit_events::insert_event(&mut *savepoint, event).await {
        log_write_failure(event, &error);
        return false;
    }
    match savepoint.commit().await {
        Ok(()) => true,
        Err(error) => {
            log_write_failure(event, &error);
            false
        }
    }
}

/// Writes `event` on its own; failures are logged and swallowed.
pub async fn record_best_effort(pool: &SqlitePool, event: &AuditEvent) -> bool {
    match db::audit_events::insert_event(pool, event).await {
        Ok(()) => true,
        Err(error) => {
            log_write_failure(event, &error);
            false
        }
    }
}

/// Terminal handling for an operation that failed after authorization succeeded.
pub async fn report_failure(
    pool: &SqlitePool,
    log: &OperationLog<'_>,
    event: AuditEvent,
    error: &VaultError,
) {
    log.emit(RoleDecision::Allow, OperationResult::Failure, Some(error));
    record_best_effort(pool, &event).await;
}

fn log_write_failure(event: &AuditEvent, error: &sqlx::Error) {
    tracing::error!(
        event_id = %event.event_id,
        event_type = event.event_type.as_str(),
        outcome = event.outcome.as_str(),
        request_id = %event.request_id,
        %error,
        "audit write failed"
    );
}

/// Read side of the audit trail. Admin only.
#[derive(Clone)]
pub struct AuditService {
    pool: SqlitePool,
    authorizer: Authorizer,
}

impl AuditService {
    pub fn new(pool: SqlitePool, authorizer: Authorizer) -> Self {
        Self { pool, authorizer }
    }

    pub async fn list_audit_events(
        &self,
        call: &CallMetadata,
        request: ListAuditEventsRequest,
    ) -> VaultResult<ListAuditEventsResponse> {
        let operation = Operation::ListAuditEvents;
        let scope = require_scope(request.scope.as_ref())?;
        let limit = normalize_limit(request.limit);
        let offset = parse_cursor(request.cursor.as_deref())?;
        if let (Some(from), Some(to)) = (request.from_time, request.to_time) {
            if from > to {
                return Err(VaultError::InvalidArgument(
                    "from_time must not be after to_time".into(),
                ));
            }
        }
        let actor = request
            .actor
            .as_deref()
            .map(str::trim)
            .filter(|actor| !actor.is_empty());

        let caller = self.authorizer.authorize(call, &scope, operation).await?;
        let log = caller.operation_log(operation, &scope);

        let filter = AuditEventFilter {
            scope: &scope,
            event_type: request.event_type,
            actor,
            from_unix_ns: request.from_time.map(db::to_unix_nanos),
            to_unix_ns: request.to_time.map(db::to_unix_nanos),
            limit: i64::from(limit) + 1,
            offset,
        };
        let mut events = match db::audit_events::list_events(&self.pool, &filter).await {
            Ok(events) => events,
            Err(error) => {
                let error = VaultError::from(error);
                let event = caller.audit_event(operation, &scope, AuditOutcome::Failed);
                report_failure(&self.pool, &log, event, &error).await;
                return Err(error);
            }
        };

        let next_cursor = next_cursor(offset, limit, events.len());
        events.truncate(limit as usize);

        let event = caller.audit_event(operation, &scope, AuditOutcome::Success);
        record_best_effort(&self.pool, &event).await;
        log.emit(RoleDecision::Allow, OperationResult::Success, None);

        Ok(ListAuditEventsResponse {
            events,
            next_cursor,
        })
    }
}
