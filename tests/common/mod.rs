#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};

use bundle_vault::crypto::{Keyring, MasterKey, KEY_SIZE};
use bundle_vault::db;
use bundle_vault::identity::CallMetadata;
use bundle_vault::models::{BundleFile, FileType, PolicyBinding, Role, Scope, SetPolicyRequest};
use bundle_vault::Vault;
use sqlx::SqlitePool;

pub const ADMIN: &str = "admin";
pub const WRITER: &str = "writer-token";
pub const READER: &str = "reader-token";

pub fn scope() -> Scope {
    Scope::new("ws1", "proj", "dev")
}

pub fn keyring() -> Keyring {
    Keyring::single(MasterKey::from_bytes(&[7u8; KEY_SIZE]).unwrap())
}

pub fn call(token: &str) -> CallMetadata {
    CallMetadata::bearer(token)
}

pub fn env_file(contents: &str) -> BundleFile {
    BundleFile::new(FileType::Env, contents)
}

pub async fn vault() -> (Vault, SqlitePool) {
    vault_with_keyring(keyring()).await
}

pub async fn vault_with_keyring(keyring: Keyring) -> (Vault, SqlitePool) {
    let pool = db::connect_in_memory().await.unwrap();
    let vault = Vault::with_bearer_identity(pool.clone(), keyring, ADMIN);
    (vault, pool)
}

/// Binds admin, writer and reader subjects in `scope` through the bootstrap admin.
pub async fn bind_roles(vault: &Vault, scope: &Scope) {
    vault
        .policy
        .set_policy(
            &call(ADMIN),
            SetPolicyRequest {
                scope: Some(scope.clone()),
                bindings: vec![
                    PolicyBinding {
                        subject: ADMIN.into(),
                        role: Role::Admin,
                    },
                    PolicyBinding {
                        subject: WRITER.into(),
                        role: Role::Writer,
                    },
                    PolicyBinding {
                        subject: READER.into(),
                        role: Role::Reader,
                    },
                ],
            },
        )
        .await
        .unwrap();
}

pub async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    let (value,): (i64,) = sqlx::query_as(sql).fetch_one(pool).await.unwrap();
    value
}

/// In-memory sink for a thread-local JSON tracing subscriber.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::INFO)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
