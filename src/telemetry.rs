use std::fmt;

use tracing_subscriber::{fmt as subscriber_fmt, EnvFilter};

use crate::error::VaultError;
use crate::models::{FileType, Operation, Role, Scope};

/// Target of the one-record-per-call operation log.
pub const OPERATION_TARGET: &str = "bundle_vault::operation";

/// JSON logs filtered by `RUST_LOG`. Call once from the binary.
pub fn init_tracing() {
    subscriber_fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleDecision {
    Allow,
    Deny,
}

impl fmt::Display for RoleDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RoleDecision::Allow => "allow",
            RoleDecision::Deny => "deny",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationResult {
    Success,
    Denied,
    Failure,
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationResult::Success => "success",
            OperationResult::Denied => "denied",
            OperationResult::Failure => "failure",
        })
    }
}

/// Structured operation record. Carries ids and names only; payloads, keys and
/// credentials have no field to land in.
#[derive(Clone, Debug)]
pub struct OperationLog<'a> {
    operation: Operation,
    scope: &'a Scope,
    actor: &'a str,
    auth_source: &'static str,
    role: Option<Role>,
    bundle_version_id: Option<&'a str>,
    target_bundle_version_id: Option<&'a str>,
    file_types: &'a [FileType],
    request_id: &'a str,
    trace_id: &'a str,
}

impl<'a> OperationLog<'a> {
    pub fn new(operation: Operation, scope: &'a Scope, request_id: &'a str, trace_id: &'a str) -> Self {
        Self {
            operation,
            scope,
            actor: "",
            auth_source: "unspecified",
            role: None,
            bundle_version_id: None,
            target_bundle_version_id: None,
            file_types: &[],
            request_id,
            trace_id,
        }
    }

    pub fn caller(mut self, actor: &'a str, auth_source: &'static str, role: Option<Role>) -> Self {
        self.actor = actor;
        self.auth_source = auth_source;
        self.role = role;
        self
    }

    pub fn versions(mut self, bundle_version_id: Option<&'a str>, target: Option<&'a str>) -> Self {
        self.bundle_version_id = bundle_version_id;
        self.target_bundle_version_id = target;
        self
    }

    pub fn file_types(mut self, file_types: &'a [FileType]) -> Self {
        self.file_types = file_types;
        self
    }

    pub fn emit(&self, decision: RoleDecision, result: OperationResult, error: Option<&VaultError>) {
        let file_types = self
            .file_types
            .iter()
            .map(FileType::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let role = self.role.map(|role| role.as_str()).unwrap_or("unspecified");
        let error = error.map(|error| error.to_string());

        macro_rules! record {
            ($level:ident) => {
                tracing::$level!(
                    target: OPERATION_TARGET,
                    operation = self.operation.as_str(),
                    event_type = self.operation.event_type().as_str(),
                    actor = self.actor,
                    auth_source = self.auth_source,
                    workspace_id = self.scope.workspace_id.as_str(),
                    project_id = self.scope.project_id.as_str(),
                    environment_id = self.scope.environment_id.as_str(),
                    role_decision = %decision,
                    role,
                    bundle_version_id = self.bundle_version_id,
                    target_bundle_version_id = self.target_bundle_version_id,
                    file_types = file_types.as_str(),
                    result = %result,
                    request_id = self.request_id,
                    trace_id = self.trace_id,
                    error = error.as_deref(),
                    "operation"
                )
            };
        }

        match result {
            OperationResult::Success => record!(info),
            OperationResult::Denied => record!(warn),
            OperationResult::Failure => record!(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decisions_render_as_wire_names() {
        assert_eq!(RoleDecision::Deny.to_string(), "deny");
        assert_eq!(OperationResult::Failure.to_string(), "failure");
    }
}
