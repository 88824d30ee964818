use std::collections::HashMap;
use std::fs;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;

use crate::crypto::{Keyring, MasterKey};

/// Database connection string. Defaults to a local SQLite file created on first use.
pub static DATABASE_URL: Lazy<String> = Lazy::new(|| {
    read_optional_env("DATABASE_URL").unwrap_or_else(|| "sqlite://bundle-vault.db?mode=rwc".into())
});

/// Pool size. SQLite serialises writers, so the default is a single connection.
pub static DB_MAX_CONNECTIONS: Lazy<u32> = Lazy::new(|| {
    std::env::var("VAULT_DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(1)
});

/// Address the HTTP server should bind to. Defaults to loopback.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| read_optional_env("BIND_ADDRESS").unwrap_or_else(|| "127.0.0.1".to_string()));

/// Port the HTTP server should listen on. Defaults to `8087`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(8087)
});

/// Subject auto-provisioned as admin the first time it touches an unbound scope.
pub static BOOTSTRAP_ADMIN_SUBJECT: Lazy<String> = Lazy::new(|| {
    read_optional_env("VAULT_BOOTSTRAP_ADMIN_SUBJECT").unwrap_or_else(|| "admin".to_string())
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| parse_truthy(&value))
        .unwrap_or(false)
});

/// Builds the keyring from `VAULT_MASTER_KEY_B64` (or a file named by `VAULT_MASTER_KEY_FILE`)
/// plus optional `VAULT_WORKSPACE_MASTER_KEYS` overrides. An empty keyring is an error.
pub fn keyring_from_env() -> Result<Keyring> {
    let default_key = read_secret_env("VAULT_MASTER_KEY_B64", "VAULT_MASTER_KEY_FILE")?
        .map(|raw| {
            MasterKey::from_base64(&raw).context("VAULT_MASTER_KEY_B64 is not a valid 32-byte key")
        })
        .transpose()?;
    let workspace_keys = match read_optional_env("VAULT_WORKSPACE_MASTER_KEYS") {
        Some(raw) => parse_workspace_keys(&raw)?,
        None => HashMap::new(),
    };

    let keyring = Keyring::new(default_key, workspace_keys);
    if keyring.is_empty() {
        return Err(anyhow!(
            "no master key configured; set VAULT_MASTER_KEY_B64 or VAULT_WORKSPACE_MASTER_KEYS"
        ));
    }
    Ok(keyring)
}

/// Parses `workspace:base64key` pairs separated by commas.
pub fn parse_workspace_keys(raw: &str) -> Result<HashMap<String, MasterKey>> {
    let mut keys = HashMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (workspace, encoded) = entry
            .split_once(':')
            .ok_or_else(|| anyhow!("workspace key entry must look like `workspace:key`"))?;
        let workspace = workspace.trim();
        if workspace.is_empty() {
            return Err(anyhow!("workspace key entry has an empty workspace id"));
        }
        let key = MasterKey::from_base64(encoded)
            .with_context(|| format!("invalid master key for workspace `{workspace}`"))?;
        if keys.insert(workspace.to_string(), key).is_some() {
            return Err(anyhow!("duplicate master key for workspace `{workspace}`"));
        }
    }
    Ok(keys)
}

fn parse_truthy(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes")
}

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_secret_env(value_key: &str, file_key: &str) -> Result<Option<String>> {
    if let Some(path) = read_optional_env(file_key) {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {file_key} from {path}"))?;
        let trimmed = contents.trim().to_string();
        if !trimmed.is_empty() {
            return Ok(Some(trimmed));
        }
    }

    Ok(read_optional_env(value_key))
}
