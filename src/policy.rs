use std::collections::HashSet;

use sqlx::SqlitePool;

use crate::audit;
use crate::authz::{Authorizer, Caller};
use crate::db::{self, policy_bindings};
use crate::error::{VaultError, VaultResult};
use crate::identity::CallMetadata;
use crate::models::{
    require_scope, AuditOutcome, GetPolicyRequest, GetPolicyResponse, Operation, PolicyBinding,
    Scope, SetPolicyRequest, SetPolicyResponse,
};
use crate::telemetry::{OperationResult, RoleDecision};

/// Role bindings per scope, replaced wholesale and versioned by a revision counter.
#[derive(Clone)]
pub struct PolicyService {
    pool: SqlitePool,
    authorizer: Authorizer,
}

impl PolicyService {
    pub fn new(pool: SqlitePool, authorizer: Authorizer) -> Self {
        Self { pool, authorizer }
    }

    pub async fn get_policy(
        &self,
        call: &CallMetadata,
        request: GetPolicyRequest,
    ) -> VaultResult<GetPolicyResponse> {
        let operation = Operation::GetPolicy;
        let scope = require_scope(request.scope.as_ref())?;
        let caller = self.authorizer.authorize(call, &scope, operation).await?;
        let log = caller.operation_log(operation, &scope);

        match self.read_policy(&scope).await {
            Ok(response) => {
                let event = caller.audit_event(operation, &scope, AuditOutcome::Success);
                audit::record_best_effort(&self.pool, &event).await;
                log.emit(RoleDecision::Allow, OperationResult::Success, None);
                Ok(response)
            }
            Err(error) => {
                let event = caller.audit_event(operation, &scope, AuditOutcome::Failed);
                audit::report_failure(&self.pool, &log, event, &error).await;
                Err(error)
            }
        }
    }

    async fn read_policy(&self, scope: &Scope) -> VaultResult<GetPolicyResponse> {
        let mut conn = self.pool.acquire().await?;
        let bindings = policy_bindings::list_bindings(&mut *conn, scope).await?;
        let policy_revision = policy_bindings::get_revision(&mut *conn, scope).await?;
        Ok(GetPolicyResponse {
            bindings,
            policy_revision,
        })
    }

    pub async fn set_policy(
        &self,
        call: &CallMetadata,
        request: SetPolicyRequest,
    ) -> VaultResult<SetPolicyResponse> {
        let operation = Operation::SetPolicy;
        let scope = require_scope(request.scope.as_ref())?;
        let bindings = normalize_bindings(request.bindings)?;

        let caller = self.authorizer.authorize(call, &scope, operation).await?;
        let log = caller.operation_log(operation, &scope);

        match self.replace_in_tx(&caller, &scope, &bindings).await {
            Ok(policy_revision) => {
                log.emit(RoleDecision::Allow, OperationResult::Success, None);
                Ok(SetPolicyResponse {
                    bindings,
                    policy_revision,
                })
            }
            Err(error) => {
                let event = caller.audit_event(operation, &scope, AuditOutcome::Failed);
                audit::report_failure(&self.pool, &log, event, &error).await;
                Err(error)
            }
        }
    }

    /// Delete-all, reinsert and bump the revision by one, atomically.
    async fn replace_in_tx(
        &self,
        caller: &Caller,
        scope: &Scope,
        bindings: &[PolicyBinding],
    ) -> VaultResult<i64> {
        let mut tx = self.pool.begin().await?;
        policy_bindings::delete_bindings(&mut *tx, scope).await?;
        for binding in bindings {
            policy_bindings::insert_binding(&mut *tx, scope, binding).await?;
        }
        let revision = policy_bindings::bump_revision(&mut *tx, scope, db::now_unix_nanos()).await?;

        let event = caller.audit_event(Operation::SetPolicy, scope, AuditOutcome::Success);
        audit::record_in_tx(&mut tx, &event).await;
        tx.commit().await?;

        tracing::info!(
            workspace_id = %scope.workspace_id,
            project_id = %scope.project_id,
            environment_id = %scope.environment_id,
            revision,
            bindings = bindings.len(),
            "policy replaced"
        );
        Ok(revision)
    }
}

/// Trims subjects, rejects empty or repeated ones, and orders the set by subject.
pub fn normalize_bindings(bindings: Vec<PolicyBinding>) -> VaultResult<Vec<PolicyBinding>> {
    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(bindings.len());
    for binding in bindings {
        let subject = binding.subject.trim();
        if subject.is_empty() {
            return Err(VaultError::InvalidArgument(
                "policy subject cannot be empty".into(),
            ));
        }
        if !seen.insert(subject.to_string()) {
            return Err(VaultError::InvalidArgument(format!(
                "duplicate policy subject: {subject}"
            )));
        }
        normalized.push(PolicyBinding {
            subject: subject.to_string(),
            role: binding.role,
        });
    }
    normalized.sort_by(|a, b| a.subject.cmp(&b.subject));
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn binding(subject: &str, role: Role) -> PolicyBinding {
        PolicyBinding {
            subject: subject.to_string(),
            role,
        }
    }

    #[test]
    fn bindings_are_trimmed_sorted_and_unique() {
        let normalized = normalize_bindings(vec![
            binding(" writer-1 ", Role::Writer),
            binding("admin", Role::Admin),
        ])
        .unwrap();
        assert_eq!(
            normalized,
            vec![binding("admin", Role::Admin), binding("writer-1", Role::Writer)]
        );

        assert!(normalize_bindings(vec![binding("  ", Role::Reader)]).is_err());
        assert!(normalize_bindings(vec![
            binding("a", Role::Reader),
            binding("a ", Role::Writer)
        ])
        .is_err());
        assert!(normalize_bindings(vec![]).unwrap().is_empty());
    }
}
