//! SQLite store adapter. Every function takes an executor so callers decide
//! whether a statement runs on the pool or inside an open transaction.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

pub mod active_bundle_pointers;
pub mod audit_events;
pub mod bundle_file_payloads;
pub mod bundle_versions;
pub mod policy_bindings;

/// Opens a pool against `url`, creating the database file when missing.
pub async fn connect(url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await
}

/// Single-connection in-memory database with the schema applied.
///
/// The connection never idles out, so the database lives as long as the pool.
pub async fn connect_in_memory() -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    run_migrations(&pool)
        .await
        .map_err(|error| sqlx::Error::Migrate(Box::new(error)))?;
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!().run(pool).await
}

pub fn now_unix_nanos() -> i64 {
    to_unix_nanos(Utc::now())
}

/// Saturates at the `i64` bounds for instants outside roughly 1677..2262.
pub fn to_unix_nanos(value: DateTime<Utc>) -> i64 {
    value.timestamp_nanos_opt().unwrap_or(if value.timestamp() < 0 {
        i64::MIN
    } else {
        i64::MAX
    })
}

pub fn from_unix_nanos(value: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(value)
}

pub(crate) fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_round_trip_through_nanos() {
        let now = Utc::now();
        assert_eq!(from_unix_nanos(to_unix_nanos(now)), now);
    }

    #[test]
    fn out_of_range_timestamps_saturate() {
        let ancient = Utc.with_ymd_and_hms(1600, 1, 1, 0, 0, 0).unwrap();
        let distant = Utc.with_ymd_and_hms(2300, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(to_unix_nanos(ancient), i64::MIN);
        assert_eq!(to_unix_nanos(distant), i64::MAX);
    }

    #[tokio::test]
    async fn in_memory_pool_has_schema() {
        let pool = connect_in_memory().await.unwrap();
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(name,)| name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "active_bundle_pointers",
                "audit_events",
                "bundle_file_payloads",
                "bundle_versions",
                "policy_bindings",
                "policy_revisions",
            ]
        );
    }
}
