use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};

pub const DEFAULT_LIST_LIMIT: u32 = 20;
pub const MAX_LIST_LIMIT: u32 = 100;

/// Isolation boundary for every bundle, binding, and audit row.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    #[serde(default)]
    pub workspace_id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub environment_id: String,
}

impl Scope {
    pub fn new(
        workspace_id: impl Into<String>,
        project_id: impl Into<String>,
        environment_id: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            project_id: project_id.into(),
            environment_id: environment_id.into(),
        }
    }

    /// Trims every component and rejects the scope if any of them is empty.
    pub fn validated(&self) -> VaultResult<Scope> {
        let scope = Scope::new(
            self.workspace_id.trim(),
            self.project_id.trim(),
            self.environment_id.trim(),
        );
        if scope.workspace_id.is_empty()
            || scope.project_id.is_empty()
            || scope.environment_id.is_empty()
        {
            return Err(VaultError::InvalidArgument(
                "scope requires workspace_id, project_id, and environment_id".into(),
            ));
        }
        Ok(scope)
    }
}

pub fn require_scope(scope: Option<&Scope>) -> VaultResult<Scope> {
    scope
        .ok_or_else(|| VaultError::InvalidArgument("scope is required".into()))?
        .validated()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FileType {
    #[serde(rename = "env")]
    Env,
    #[serde(rename = "dev-vars")]
    DevVars,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Env => "env",
            FileType::DevVars => "dev-vars",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "env" => Some(FileType::Env),
            "dev-vars" => Some(FileType::DevVars),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    Active,
    Archived,
}

impl BundleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleStatus::Active => "active",
            BundleStatus::Archived => "archived",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "active" => Some(BundleStatus::Active),
            "archived" => Some(BundleStatus::Archived),
            _ => None,
        }
    }
}

/// Strict hierarchy: `Reader < Writer < Admin`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Reader,
    Writer,
    Admin,
}

impl Role {
    pub fn rank(&self) -> u8 {
        match self {
            Role::Reader => 1,
            Role::Writer => 2,
            Role::Admin => 3,
        }
    }

    pub fn satisfies(&self, required: Role) -> bool {
        self.rank() >= required.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Reader => "reader",
            Role::Writer => "writer",
            Role::Admin => "admin",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "reader" => Some(Role::Reader),
            "writer" => Some(Role::Writer),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Push,
    Pull,
    List,
    Activate,
    Rotate,
    PolicyUpdate,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::Push => "push",
            AuditEventType::Pull => "pull",
            AuditEventType::List => "list",
            AuditEventType::Activate => "activate",
            AuditEventType::Rotate => "rotate",
            AuditEventType::PolicyUpdate => "policy_update",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "push" => Some(Self::Push),
            "pull" => Some(Self::Pull),
            "list" => Some(Self::List),
            "activate" => Some(Self::Activate),
            "rotate" => Some(Self::Rotate),
            "policy_update" => Some(Self::PolicyUpdate),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Denied,
    Failed,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Denied => "denied",
            AuditOutcome::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "success" => Some(AuditOutcome::Success),
            "denied" => Some(AuditOutcome::Denied),
            "failed" => Some(AuditOutcome::Failed),
            _ => None,
        }
    }
}

/// Every RPC the vault serves, with its minimum role and the audit type it records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    PushBundleVersion,
    PullActiveBundle,
    ListBundleVersions,
    ActivateBundleVersion,
    RotateBundleVersion,
    GetPolicy,
    SetPolicy,
    ListAuditEvents,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::PushBundleVersion => "push_bundle_version",
            Operation::PullActiveBundle => "pull_active_bundle",
            Operation::ListBundleVersions => "list_bundle_versions",
            Operation::ActivateBundleVersion => "activate_bundle_version",
            Operation::RotateBundleVersion => "rotate_bundle_version",
            Operation::GetPolicy => "get_policy",
            Operation::SetPolicy => "set_policy",
            Operation::ListAuditEvents => "list_audit_events",
        }
    }

    pub fn required_role(&self) -> Role {
        match self {
            Operation::PullActiveBundle | Operation::ListBundleVersions => Role::Reader,
            Operation::PushBundleVersion | Operation::RotateBundleVersion => Role::Writer,
            Operation::ActivateBundleVersion
            | Operation::GetPolicy
            | Operation::SetPolicy
            | Operation::ListAuditEvents => Role::Admin,
        }
    }

    pub fn event_type(&self) -> AuditEventType {
        match self {
            Operation::PushBundleVersion => AuditEventType::Push,
            Operation::PullActiveBundle => AuditEventType::Pull,
            Operation::ActivateBundleVersion => AuditEventType::Activate,
            Operation::RotateBundleVersion => AuditEventType::Rotate,
            Operation::SetPolicy => AuditEventType::PolicyUpdate,
            Operation::ListBundleVersions | Operation::GetPolicy | Operation::ListAuditEvents => {
                AuditEventType::List
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleVersionSummary {
    pub bundle_version_id: String,
    pub scope: Scope,
    pub status: BundleStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub file_types: Vec<FileType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_version_id: Option<String>,
}

/// A decrypted (or to-be-encrypted) file. `Debug` never prints the contents.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleFile {
    pub file_type: FileType,
    #[serde(with = "base64_bytes")]
    pub plaintext: Vec<u8>,
}

impl BundleFile {
    pub fn new(file_type: FileType, plaintext: impl Into<Vec<u8>>) -> Self {
        Self {
            file_type,
            plaintext: plaintext.into(),
        }
    }
}

impl fmt::Debug for BundleFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleFile")
            .field("file_type", &self.file_type)
            .field("plaintext", &format_args!("<redacted {} bytes>", self.plaintext.len()))
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyBinding {
    pub subject: String,
    pub role: Role,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub event_id: String,
    pub event_type: AuditEventType,
    pub actor: String,
    pub scope: Scope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_version_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_bundle_version_id: Option<String>,
    pub outcome: AuditOutcome,
    pub request_id: String,
    pub trace_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBundleVersionRequest {
    pub scope: Option<Scope>,
    #[serde(default)]
    pub files: Vec<BundleFile>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBundleVersionResponse {
    pub version: BundleVersionSummary,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullActiveBundleRequest {
    pub scope: Option<Scope>,
    #[serde(default)]
    pub bundle_version_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullActiveBundleResponse {
    pub version: BundleVersionSummary,
    pub files: Vec<BundleFile>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListBundleVersionsRequest {
    pub scope: Option<Scope>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListBundleVersionsResponse {
    pub versions: Vec<BundleVersionSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateBundleVersionRequest {
    pub scope: Option<Scope>,
    #[serde(default)]
    pub bundle_version_id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateBundleVersionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_active: Option<BundleVersionSummary>,
    pub active: BundleVersionSummary,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateBundleVersionRequest {
    pub scope: Option<Scope>,
    #[serde(default)]
    pub from_version_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateBundleVersionResponse {
    pub version: BundleVersionSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_active: Option<BundleVersionSummary>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPolicyRequest {
    pub scope: Option<Scope>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPolicyResponse {
    pub bindings: Vec<PolicyBinding>,
    pub policy_revision: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPolicyRequest {
    pub scope: Option<Scope>,
    #[serde(default)]
    pub bindings: Vec<PolicyBinding>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPolicyResponse {
    pub bindings: Vec<PolicyBinding>,
    pub policy_revision: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListAuditEventsRequest {
    pub scope: Option<Scope>,
    #[serde(default)]
    pub event_type: Option<AuditEventType>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub from_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListAuditEventsResponse {
    pub events: Vec<AuditEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Clamps a requested page size into `[1, MAX_LIST_LIMIT]`; absent or zero means the default.
pub fn normalize_limit(raw: Option<u32>) -> u32 {
    match raw {
        None | Some(0) => DEFAULT_LIST_LIMIT,
        Some(limit) => limit.min(MAX_LIST_LIMIT),
    }
}

/// Cursors are opaque non-negative integer offsets encoded as strings.
pub fn parse_cursor(raw: Option<&str>) -> VaultResult<i64> {
    let trimmed = raw.map(str::trim).unwrap_or_default();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed
        .parse::<i64>()
        .ok()
        .filter(|value| *value >= 0)
        .ok_or_else(|| VaultError::InvalidArgument("invalid cursor".into()))
}

pub fn next_cursor(offset: i64, limit: u32, fetched: usize) -> Option<String> {
    if fetched > limit as usize {
        Some((offset + i64::from(limit)).to_string())
    } else {
        None
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
