use sqlx::{Executor, Row, Sqlite};

use crate::models::Scope;

/// Id of the version the scope currently serves, if one was ever activated.
pub async fn get_active_version_id<'c, E>(
    executor: E,
    scope: &Scope,
) -> Result<Option<String>, sqlx::Error>
where
    E: Executor<'c, Database = Sqlite>,
{
    let row = sqlx::query(
        r#"
        SELECT bundle_version_id
        FROM active_bundle_pointers
        WHERE workspace_id = ? AND project_id = ? AND environment_id = ?
        "#,
    )
    .bind(&scope.workspace_id)
    .bind(&scope.project_id)
    .bind(&scope.environment_id)
    .fetch_optional(executor)
    .await?;

    row.map(|row| row.try_get("bundle_version_id")).transpose()
}

pub async fn upsert_pointer<'c, E>(
    executor: E,
    scope: &Scope,
    bundle_version_id: &str,
    updated_by: &str,
    updated_at_unix_ns: i64,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO active_bundle_pointers (
            workspace_id,
            project_id,
            environment_id,
            bundle_version_id,
            updated_by,
            updated_at_unix_ns
        ) VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT (workspace_id, project_id, environment_id) DO UPDATE
        SET
            bundle_version_id = excluded.bundle_version_id,
            updated_by = excluded.updated_by,
            updated_at_unix_ns = excluded.updated_at_unix_ns
        "#,
    )
    .bind(&scope.workspace_id)
    .bind(&scope.project_id)
    .bind(&scope.environment_id)
    .bind(bundle_version_id)
    .bind(updated_by)
    .bind(updated_at_unix_ns)
    .execute(executor)
    .await?;
    Ok(())
}
