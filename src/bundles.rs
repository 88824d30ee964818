use std::collections::HashSet;
use std::sync::Arc;

use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::audit;
use crate::authz::{Authorizer, Caller};
use crate::crypto::{self, EncryptedPayload, Keyring};
use crate::db::{
    self, active_bundle_pointers, bundle_file_payloads, bundle_versions::NewBundleVersion,
    bundle_versions,
};
use crate::error::{VaultError, VaultResult};
use crate::identity::CallMetadata;
use crate::models::{
    next_cursor, normalize_limit, parse_cursor, require_scope, ActivateBundleVersionRequest,
    ActivateBundleVersionResponse, AuditOutcome, BundleFile, BundleStatus, BundleVersionSummary,
    FileType, ListBundleVersionsRequest, ListBundleVersionsResponse, Operation,
    PullActiveBundleRequest, PullActiveBundleResponse, PushBundleVersionRequest,
    PushBundleVersionResponse, RotateBundleVersionRequest, RotateBundleVersionResponse, Scope,
};
use crate::telemetry::{OperationResult, RoleDecision};

/// Bundle version manager: immutable encrypted versions plus one active pointer per scope.
#[derive(Clone)]
pub struct BundleService {
    pool: SqlitePool,
    keyring: Arc<Keyring>,
    authorizer: Authorizer,
}

struct Activation {
    previous_active: Option<BundleVersionSummary>,
    active: BundleVersionSummary,
}

impl BundleService {
    pub fn new(pool: SqlitePool, keyring: Arc<Keyring>, authorizer: Authorizer) -> Self {
        Self {
            pool,
            keyring,
            authorizer,
        }
    }

    pub async fn push_bundle_version(
        &self,
        call: &CallMetadata,
        request: PushBundleVersionRequest,
    ) -> VaultResult<PushBundleVersionResponse> {
        let operation = Operation::PushBundleVersion;
        let scope = require_scope(request.scope.as_ref())?;
        let files = normalize_files(request.files)?;
        let file_types: Vec<FileType> = files.iter().map(|file| file.file_type).collect();

        let caller = self.authorizer.authorize(call, &scope, operation).await?;
        let bundle_version_id = new_version_id();
        let log = caller
            .operation_log(operation, &scope)
            .versions(Some(&bundle_version_id), None)
            .file_types(&file_types);

        match self
            .push_in_tx(&caller, &scope, &bundle_version_id, &files)
            .await
        {
            Ok(version) => {
                log.emit(RoleDecision::Allow, OperationResult::Success, None);
                Ok(PushBundleVersionResponse { version })
            }
            Err(error) => {
                let event = caller
                    .audit_event(operation, &scope, AuditOutcome::Failed)
                    .with_versions(Some(&bundle_version_id), None);
                audit::report_failure(&self.pool, &log, event, &error).await;
                Err(error)
            }
        }
    }

    async fn push_in_tx(
        &self,
        caller: &Caller,
        scope: &Scope,
        bundle_version_id: &str,
        files: &[BundleFile],
    ) -> VaultResult<BundleVersionSummary> {
        let master_key = self.keyring.key_for(scope)?;
        let payloads = files
            .iter()
            .map(|file| Ok((file.file_type, crypto::encrypt(master_key, &file.plaintext)?)))
            .collect::<VaultResult<Vec<(FileType, EncryptedPayload)>>>()?;

        let now = db::now_unix_nanos();
        let mut tx = self.pool.begin().await?;
        let is_first = active_bundle_pointers::get_active_version_id(&mut *tx, scope)
            .await?
            .is_none();
        let status = if is_first {
            BundleStatus::Active
        } else {
            BundleStatus::Archived
        };

        bundle_versions::insert_version(
            &mut *tx,
            NewBundleVersion {
                bundle_version_id,
                scope,
                status,
                created_by: &caller.identity.actor,
                created_at_unix_ns: now,
                source_version_id: None,
            },
        )
        .await?;
        for (file_type, payload) in &payloads {
            bundle_file_payloads::insert_payload(&mut *tx, bundle_version_id, *file_type, payload)
                .await?;
        }
        if is_first {
            active_bundle_pointers::upsert_pointer(
                &mut *tx,
                scope,
                bundle_version_id,
                &caller.identity.actor,
                now,
            )
            .await?;
        }

        let event = caller
            .audit_event(Operation::PushBundleVersion, scope, AuditOutcome::Success)
            .with_versions(Some(bundle_version_id), None);
        audit::record_in_tx(&mut tx, &event).await;

        let version = read_summary(&mut tx, scope, bundle_version_id).await?;
        tx.commit().await?;
        Ok(version)
    }

    pub async fn pull_active_bundle(
        &self,
        call: &CallMetadata,
        request: PullActiveBundleRequest,
    ) -> VaultResult<PullActiveBundleResponse> {
        let operation = Operation::PullActiveBundle;
        let scope = require_scope(request.scope.as_ref())?;
        let requested = trimmed(request.bundle_version_id.as_deref());

        let caller = self.authorizer.authorize(call, &scope, operation).await?;

        match self.pull_in_tx(&caller, &scope, requested).await {
            Ok(response) => {
                let file_types: Vec<FileType> =
                    response.files.iter().map(|file| file.file_type).collect();
                caller
                    .operation_log(operation, &scope)
                    .versions(Some(&response.version.bundle_version_id), None)
                    .file_types(&file_types)
                    .emit(RoleDecision::Allow, OperationResult::Success, None);
                Ok(response)
            }
            Err(error) => {
                let log = caller
                    .operation_log(operation, &scope)
                    .versions(requested, None);
                let event = caller
                    .audit_event(operation, &scope, AuditOutcome::Failed)
                    .with_versions(requested, None);
                audit::report_failure(&self.pool, &log, event, &error).await;
                Err(error)
            }
        }
    }

    async fn pull_in_tx(
        &self,
        caller: &Caller,
        scope: &Scope,
        requested: Option<&str>,
    ) -> VaultResult<PullActiveBundleResponse> {
        let master_key = self.keyring.key_for(scope)?;

        let mut tx = self.pool.begin().await?;
        let bundle_version_id = match requested {
            Some(id) => id.to_string(),
            None => active_bundle_pointers::get_active_version_id(&mut *tx, scope)
                .await?
                .ok_or_else(|| VaultError::NotFound("no active bundle version".into()))?,
        };
        let version = bundle_versions::get_version(&mut *tx, scope, &bundle_version_id)
            .await?
            .ok_or_else(|| VaultError::NotFound("bundle version not found".into()))?;

        let stored = bundle_file_payloads::list_payloads(&mut *tx, &bundle_version_id).await?;
        let mut files = Vec::with_capacity(stored.len());
        for entry in &stored {
            let plaintext = crypto::decrypt(master_key, &entry.payload)?;
            verify_integrity(&plaintext, &entry.payload)?;
            files.push(BundleFile::new(entry.file_type, plaintext));
        }

        let event = caller
            .audit_event(Operation::PullActiveBundle, scope, AuditOutcome::Success)
            .with_versions(Some(&bundle_version_id), None);
        audit::record_in_tx(&mut tx, &event).await;
        tx.commit().await?;

        Ok(PullActiveBundleResponse { version, files })
    }

    pub async fn list_bundle_versions(
        &self,
        call: &CallMetadata,
        request: ListBundleVersionsRequest,
    ) -> VaultResult<ListBundleVersionsResponse> {
        let operation = Operation::ListBundleVersions;
        let scope = require_scope(request.scope.as_ref())?;
        let limit = normalize_limit(request.limit);
        let offset = parse_cursor(request.cursor.as_deref())?;

        let caller = self.authorizer.authorize(call, &scope, operation).await?;
        let log = caller.operation_log(operation, &scope);

        let fetched =
            bundle_versions::list_versions(&self.pool, &scope, i64::from(limit) + 1, offset).await;
        let mut versions = match fetched {
            Ok(versions) => versions,
            Err(error) => {
                let error = VaultError::from(error);
                let event = caller.audit_event(operation, &scope, AuditOutcome::Failed);
                audit::report_failure(&self.pool, &log, event, &error).await;
                return Err(error);
            }
        };
        let next_cursor = next_cursor(offset, limit, versions.len());
        versions.truncate(limit as usize);

        let event = caller.audit_event(operation, &scope, AuditOutcome::Success);
        audit::record_best_effort(&self.pool, &event).await;
        log.emit(RoleDecision::Allow, OperationResult::Success, None);

        Ok(ListBundleVersionsResponse {
            versions,
            next_cursor,
        })
    }

    pub async fn activate_bundle_version(
        &self,
        call: &CallMetadata,
        request: ActivateBundleVersionRequest,
    ) -> VaultResult<ActivateBundleVersionResponse> {
        let operation = Operation::ActivateBundleVersion;
        let scope = require_scope(request.scope.as_ref())?;
        let target = trimmed(Some(request.bundle_version_id.as_str()))
            .ok_or_else(|| VaultError::InvalidArgument("bundle_version_id is required".into()))?
            .to_string();

        let caller = self.authorizer.authorize(call, &scope, operation).await?;

        match self.activate_in_tx(&caller, &scope, &target).await {
            Ok(activation) => {
                let previous = activation
                    .previous_active
                    .as_ref()
                    .map(|version| version.bundle_version_id.as_str());
                caller
                    .operation_log(operation, &scope)
                    .versions(previous, Some(&target))
                    .file_types(&activation.active.file_types)
                    .emit(RoleDecision::Allow, OperationResult::Success, None);
                Ok(ActivateBundleVersionResponse {
                    previous_active: activation.previous_active,
                    active: activation.active,
                })
            }
            Err(error) => {
                let log = caller
                    .operation_log(operation, &scope)
                    .versions(None, Some(&target));
                let event = caller
                    .audit_event(operation, &scope, AuditOutcome::Failed)
                    .with_versions(None, Some(&target));
                audit::report_failure(&self.pool, &log, event, &error).await;
                Err(error)
            }
        }
    }

    async fn activate_in_tx(
        &self,
        caller: &Caller,
        scope: &Scope,
        target: &str,
    ) -> VaultResult<Activation> {
        let mut tx = self.pool.begin().await?;
        if bundle_versions::get_version(&mut *tx, scope, target)
            .await?
            .is_none()
        {
            return Err(VaultError::NotFound("bundle version not found".into()));
        }

        let previous = activate(&mut tx, scope, target, &caller.identity.actor).await?;

        let event = caller
            .audit_event(Operation::ActivateBundleVersion, scope, AuditOutcome::Success)
            .with_versions(previous.as_deref(), Some(target));
        audit::record_in_tx(&mut tx, &event).await;

        let activation = read_activation(&mut tx, scope, previous.as_deref(), target).await?;
        tx.commit().await?;
        Ok(activation)
    }

    pub async fn rotate_bundle_version(
        &self,
        call: &CallMetadata,
        request: RotateBundleVersionRequest,
    ) -> VaultResult<RotateBundleVersionResponse> {
        let operation = Operation::RotateBundleVersion;
        let scope = require_scope(request.scope.as_ref())?;
        let from_version_id = trimmed(request.from_version_id.as_deref());

        let caller = self.authorizer.authorize(call, &scope, operation).await?;
        let bundle_version_id = new_version_id();

        match self
            .rotate_in_tx(&caller, &scope, from_version_id, &bundle_version_id)
            .await
        {
            Ok((source, activation)) => {
                caller
                    .operation_log(operation, &scope)
                    .versions(Some(&source), Some(&bundle_version_id))
                    .file_types(&activation.active.file_types)
                    .emit(RoleDecision::Allow, OperationResult::Success, None);
                Ok(RotateBundleVersionResponse {
                    version: activation.active,
                    previous_active: activation.previous_active,
                })
            }
            Err(error) => {
                let log = caller
                    .operation_log(operation, &scope)
                    .versions(from_version_id, Some(&bundle_version_id));
                let event = caller
                    .audit_event(operation, &scope, AuditOutcome::Failed)
                    .with_versions(from_version_id, Some(&bundle_version_id));
                audit::report_failure(&self.pool, &log, event, &error).await;
                Err(error)
            }
        }
    }

    /// Returns the source version id alongside the activation result.
    async fn rotate_in_tx(
        &self,
        caller: &Caller,
        scope: &Scope,
        from_version_id: Option<&str>,
        bundle_version_id: &str,
    ) -> VaultResult<(String, Activation)> {
        let mut tx = self.pool.begin().await?;
        let source = match from_version_id {
            Some(id) => id.to_string(),
            None => active_bundle_pointers::get_active_version_id(&mut *tx, scope)
                .await?
                .ok_or_else(|| VaultError::NotFound("no active bundle version to rotate".into()))?,
        };
        if bundle_versions::get_version(&mut *tx, scope, &source)
            .await?
            .is_none()
        {
            return Err(VaultError::NotFound("source bundle version not found".into()));
        }

        bundle_versions::insert_version(
            &mut *tx,
            NewBundleVersion {
                bundle_version_id,
                scope,
                status: BundleStatus::Archived,
                created_by: &caller.identity.actor,
                created_at_unix_ns: db::now_unix_nanos(),
                source_version_id: Some(&source),
            },
        )
        .await?;
        let copied = bundle_file_payloads::copy_payloads(&mut *tx, &source, bundle_version_id).await?;
        if copied == 0 {
            return Err(VaultError::FailedPrecondition(
                "source bundle version has no files".into(),
            ));
        }

        let previous = activate(&mut tx, scope, bundle_version_id, &caller.identity.actor).await?;

        let event = caller
            .audit_event(Operation::RotateBundleVersion, scope, AuditOutcome::Success)
            .with_versions(Some(&source), Some(bundle_version_id));
        audit::record_in_tx(&mut tx, &event).await;

        let activation =
            read_activation(&mut tx, scope, previous.as_deref(), bundle_version_id).await?;
        tx.commit().await?;
        Ok((source, activation))
    }
}

/// Archives the current active version if it differs from `target`, marks
/// `target` active and moves the pointer. Returns the previously active id.
async fn activate(
    conn: &mut SqliteConnection,
    scope: &Scope,
    target: &str,
    actor: &str,
) -> VaultResult<Option<String>> {
    let previous = active_bundle_pointers::get_active_version_id(&mut *conn, scope).await?;
    if let Some(previous) = previous.as_deref() {
        if previous != target {
            bundle_versions::set_status(&mut *conn, previous, BundleStatus::Archived).await?;
        }
    }
    bundle_versions::set_status(&mut *conn, target, BundleStatus::Active).await?;
    active_bundle_pointers::upsert_pointer(&mut *conn, scope, target, actor, db::now_unix_nanos())
        .await?;
    Ok(previous)
}

async fn read_activation(
    conn: &mut SqliteConnection,
    scope: &Scope,
    previous: Option<&str>,
    target: &str,
) -> VaultResult<Activation> {
    let active = read_summary(&mut *conn, scope, target).await?;
    let previous_active = match previous {
        Some(previous) => bundle_versions::get_version(&mut *conn, scope, previous).await?,
        None => None,
    };
    Ok(Activation {
        previous_active,
        active,
    })
}

async fn read_summary(
    conn: &mut SqliteConnection,
    scope: &Scope,
    bundle_version_id: &str,
) -> VaultResult<BundleVersionSummary> {
    bundle_versions::get_version(conn, scope, bundle_version_id)
        .await?
        .ok_or_else(|| VaultError::Internal(format!("bundle version {bundle_version_id} vanished")))
}

/// Rejects empty and duplicate file sets; the result is ordered by file type.
pub fn normalize_files(files: Vec<BundleFile>) -> VaultResult<Vec<BundleFile>> {
    if files.is_empty() {
        return Err(VaultError::InvalidArgument(
            "at least one file payload is required".into(),
        ));
    }
    let mut seen = HashSet::new();
    for file in &files {
        if !seen.insert(file.file_type) {
            return Err(VaultError::InvalidArgument(format!(
                "duplicate file_type: {}",
                file.file_type.as_str()
            )));
        }
    }
    let mut files = files;
    files.sort_by_key(|file| file.file_type);
    Ok(files)
}

fn verify_integrity(plaintext: &[u8], payload: &EncryptedPayload) -> VaultResult<()> {
    if plaintext.len() as i64 != payload.byte_length || crypto::checksum(plaintext) != payload.checksum
    {
        return Err(VaultError::Internal(
            "decrypted payload does not match its recorded checksum".into(),
        ));
    }
    Ok(())
}

fn new_version_id() -> String {
    format!("ver_{}", Uuid::new_v4().simple())
}

fn trimmed(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_must_be_present_and_unique() {
        assert!(matches!(
            normalize_files(vec![]),
            Err(VaultError::InvalidArgument(_))
        ));
        assert!(matches!(
            normalize_files(vec![
                BundleFile::new(FileType::Env, "A=1"),
                BundleFile::new(FileType::Env, "A=2"),
            ]),
            Err(VaultError::InvalidArgument(_))
        ));

        let files = normalize_files(vec![
            BundleFile::new(FileType::DevVars, "B=2"),
            BundleFile::new(FileType::Env, "A=1"),
        ])
        .unwrap();
        assert_eq!(files[0].file_type, FileType::Env);
        assert_eq!(files[1].file_type, FileType::DevVars);
    }

    #[test]
    fn integrity_check_catches_mismatched_bookkeeping() {
        let key = crypto::MasterKey::from_bytes(&[4u8; crypto::KEY_SIZE]).unwrap();
        let mut payload = crypto::encrypt(&key, b"A=1").unwrap();
        assert!(verify_integrity(b"A=1", &payload).is_ok());

        payload.byte_length += 1;
        assert!(matches!(
            verify_integrity(b"A=1", &payload),
            Err(VaultError::Internal(_))
        ));
    }

    #[test]
    fn version_ids_are_prefixed() {
        let id = new_version_id();
        assert!(id.starts_with("ver_"));
        assert_eq!(id.len(), "ver_".len() + 32);
        assert_ne!(id, new_version_id());
    }
}
