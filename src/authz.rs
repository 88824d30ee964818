use std::sync::Arc;

use sqlx::SqlitePool;

use crate::audit;
use crate::db::{self, policy_bindings};
use crate::error::{VaultError, VaultResult};
use crate::identity::{AuthSource, CallMetadata, Identity, IdentityVerifier};
use crate::models::{AuditEvent, AuditOutcome, Operation, PolicyBinding, Role, Scope};
use crate::telemetry::{OperationLog, OperationResult, RoleDecision};

/// An authenticated caller holding at least the role its operation requires.
#[derive(Clone, Debug)]
pub struct Caller {
    pub identity: Identity,
    pub role: Role,
    pub request_id: String,
    pub trace_id: String,
}

impl Caller {
    pub fn operation_log<'a>(&'a self, operation: Operation, scope: &'a Scope) -> OperationLog<'a> {
        OperationLog::new(operation, scope, &self.request_id, &self.trace_id).caller(
            &self.identity.actor,
            self.identity.auth_source.as_str(),
            Some(self.role),
        )
    }

    pub fn audit_event(&self, operation: Operation, scope: &Scope, outcome: AuditOutcome) -> AuditEvent {
        AuditEvent::new(
            operation.event_type(),
            &self.identity.actor,
            scope,
            outcome,
            &self.request_id,
            &self.trace_id,
        )
    }
}

/// Resolves who is calling and whether their binding in the scope is strong enough.
#[derive(Clone)]
pub struct Authorizer {
    pool: SqlitePool,
    verifier: Arc<dyn IdentityVerifier>,
    bootstrap_admin_subject: String,
}

impl Authorizer {
    pub fn new(
        pool: SqlitePool,
        verifier: Arc<dyn IdentityVerifier>,
        bootstrap_admin_subject: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            verifier,
            bootstrap_admin_subject: bootstrap_admin_subject.into(),
        }
    }

    /// Verifies the caller, provisions the bootstrap admin if due, and enforces
    /// `operation`'s minimum role. Rejections are logged here and denials are
    /// audited; the allowed path is logged by the operation once it finishes.
    pub async fn authorize(
        &self,
        call: &CallMetadata,
        scope: &Scope,
        operation: Operation,
    ) -> VaultResult<Caller> {
        let identity = match self.verifier.verify(call).await {
            Ok(identity) => identity,
            Err(error) => {
                let actor = call.claimed_actor();
                let auth_source = if call.subject.is_some() {
                    AuthSource::Header
                } else {
                    AuthSource::Unspecified
                };
                OperationLog::new(operation, scope, &call.request_id, &call.trace_id)
                    .caller(&actor, auth_source.as_str(), None)
                    .emit(RoleDecision::Deny, OperationResult::Denied, Some(&error));
                return Err(error);
            }
        };

        let role = match self.resolve_role(scope, &identity.subject).await {
            Ok(role) => role,
            Err(error) => {
                OperationLog::new(operation, scope, &call.request_id, &call.trace_id)
                    .caller(&identity.actor, identity.auth_source.as_str(), None)
                    .emit(RoleDecision::Deny, OperationResult::Failure, Some(&error));
                return Err(error);
            }
        };

        let required = operation.required_role();
        match role {
            Some(role) if role.satisfies(required) => {
                Ok(Caller {
                    identity,
                    role,
                    request_id: call.request_id.clone(),
                    trace_id: call.trace_id.clone(),
                })
            }
            _ => {
                let event = AuditEvent::new(
                    operation.event_type(),
                    &identity.actor,
                    scope,
                    AuditOutcome::Denied,
                    &call.request_id,
                    &call.trace_id,
                );
                audit::record_best_effort(&self.pool, &event).await;

                let error = VaultError::PermissionDenied(format!(
                    "insufficient role: required={}",
                    required.as_str()
                ));
                OperationLog::new(operation, scope, &call.request_id, &call.trace_id)
                    .caller(&identity.actor, identity.auth_source.as_str(), role)
                    .emit(RoleDecision::Deny, OperationResult::Denied, Some(&error));
                Err(error)
            }
        }
    }

    /// Role bound to `subject` in `scope`, provisioning the bootstrap admin first when applicable.
    pub async fn resolve_role(&self, scope: &Scope, subject: &str) -> VaultResult<Option<Role>> {
        if subject == self.bootstrap_admin_subject {
            self.ensure_bootstrap_binding(scope).await?;
        }
        Ok(policy_bindings::find_role(&self.pool, scope, subject).await?)
    }

    async fn ensure_bootstrap_binding(&self, scope: &Scope) -> VaultResult<()> {
        if policy_bindings::find_role(&self.pool, scope, &self.bootstrap_admin_subject)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let binding = PolicyBinding {
            subject: self.bootstrap_admin_subject.clone(),
            role: Role::Admin,
        };
        let mut tx = self.pool.begin().await?;
        let inserted = policy_bindings::insert_binding_if_absent(&mut *tx, scope, &binding).await?;
        if inserted {
            policy_bindings::bump_revision(&mut *tx, scope, db::now_unix_nanos()).await?;
        }
        tx.commit().await?;

        if inserted {
            tracing::info!(
                workspace_id = %scope.workspace_id,
                project_id = %scope.project_id,
                environment_id = %scope.environment_id,
                "bootstrap admin binding provisioned"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::BearerSubjectVerifier;

    async fn authorizer() -> Authorizer {
        let pool = db::connect_in_memory().await.unwrap();
        Authorizer::new(pool, Arc::new(BearerSubjectVerifier), "admin")
    }

    fn scope() -> Scope {
        Scope::new("ws1", "proj", "dev")
    }

    #[tokio::test]
    async fn bootstrap_admin_is_provisioned_once() {
        let authorizer = authorizer().await;
        let caller = authorizer
            .authorize(&CallMetadata::bearer("admin"), &scope(), Operation::SetPolicy)
            .await
            .unwrap();
        assert_eq!(caller.role, Role::Admin);
        assert_eq!(
            policy_bindings::get_revision(&authorizer.pool, &scope()).await.unwrap(),
            1
        );

        authorizer
            .authorize(&CallMetadata::bearer("admin"), &scope(), Operation::SetPolicy)
            .await
            .unwrap();
        assert_eq!(
            policy_bindings::get_revision(&authorizer.pool, &scope()).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn unbound_subject_is_denied_and_audited() {
        let authorizer = authorizer().await;
        let err = authorizer
            .authorize(
                &CallMetadata::bearer("mallory"),
                &scope(),
                Operation::PullActiveBundle,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::PermissionDenied(_)));

        let (outcome,): (String,) = sqlx::query_as("SELECT outcome FROM audit_events")
            .fetch_one(&authorizer.pool)
            .await
            .unwrap();
        assert_eq!(outcome, "denied");
    }

    #[tokio::test]
    async fn unauthenticated_calls_leave_no_audit_row() {
        let authorizer = authorizer().await;
        let mut call = CallMetadata::bearer("admin");
        call.subject = Some("someone-else".into());
        let err = authorizer
            .authorize(&call, &scope(), Operation::PullActiveBundle)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Unauthenticated(_)));

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_events")
            .fetch_one(&authorizer.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
