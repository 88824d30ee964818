use std::sync::Arc;

use sqlx::SqlitePool;

use crate::audit::AuditService;
use crate::authz::Authorizer;
use crate::bundles::BundleService;
use crate::crypto::Keyring;
use crate::identity::{BearerSubjectVerifier, IdentityVerifier};
use crate::policy::PolicyService;

/// The three RPC services sharing one pool, keyring and authorizer.
#[derive(Clone)]
pub struct Vault {
    pub bundles: BundleService,
    pub policy: PolicyService,
    pub audit: AuditService,
}

impl Vault {
    pub fn new(
        pool: SqlitePool,
        keyring: Keyring,
        verifier: Arc<dyn IdentityVerifier>,
        bootstrap_admin_subject: impl Into<String>,
    ) -> Self {
        let authorizer = Authorizer::new(pool.clone(), verifier, bootstrap_admin_subject);
        Self {
            bundles: BundleService::new(pool.clone(), Arc::new(keyring), authorizer.clone()),
            policy: PolicyService::new(pool.clone(), authorizer.clone()),
            audit: AuditService::new(pool, authorizer),
        }
    }

    /// Bearer-equals-subject identity, the default trust model.
    pub fn with_bearer_identity(
        pool: SqlitePool,
        keyring: Keyring,
        bootstrap_admin_subject: impl Into<String>,
    ) -> Self {
        Self::new(
            pool,
            keyring,
            Arc::new(BearerSubjectVerifier),
            bootstrap_admin_subject,
        )
    }
}
