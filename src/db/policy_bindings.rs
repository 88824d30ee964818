use sqlx::{sqlite::SqliteRow, Executor, Row, Sqlite};

use super::decode_error;
use crate::models::{PolicyBinding, Role, Scope};

pub async fn find_role<'c, E>(
    executor: E,
    scope: &Scope,
    subject: &str,
) -> Result<Option<Role>, sqlx::Error>
where
    E: Executor<'c, Database = Sqlite>,
{
    let row = sqlx::query(
        r#"
        SELECT role
        FROM policy_bindings
        WHERE workspace_id = ? AND project_id = ? AND environment_id = ? AND subject = ?
        "#,
    )
    .bind(&scope.workspace_id)
    .bind(&scope.project_id)
    .bind(&scope.environment_id)
    .bind(subject)
    .fetch_optional(executor)
    .await?;

    row.map(|row| parse_role(&row)).transpose()
}

pub async fn list_bindings<'c, E>(executor: E, scope: &Scope) -> Result<Vec<PolicyBinding>, sqlx::Error>
where
    E: Executor<'c, Database = Sqlite>,
{
    let rows = sqlx::query(
        r#"
        SELECT subject, role
        FROM policy_bindings
        WHERE workspace_id = ? AND project_id = ? AND environment_id = ?
        ORDER BY subject ASC
        "#,
    )
    .bind(&scope.workspace_id)
    .bind(&scope.project_id)
    .bind(&scope.environment_id)
    .fetch_all(executor)
    .await?;

    rows.iter()
        .map(|row| {
            Ok::<_, sqlx::Error>(PolicyBinding {
                subject: row.try_get("subject")?,
                role: parse_role(row)?,
            })
        })
        .collect()
}

pub async fn delete_bindings<'c, E>(executor: E, scope: &Scope) -> Result<u64, sqlx::Error>
where
    E: Executor<'c, Database = Sqlite>,
{
    let result = sqlx::query(
        "DELETE FROM policy_bindings WHERE workspace_id = ? AND project_id = ? AND environment_id = ?",
    )
    .bind(&scope.workspace_id)
    .bind(&scope.project_id)
    .bind(&scope.environment_id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

pub async fn insert_binding<'c, E>(
    executor: E,
    scope: &Scope,
    binding: &PolicyBinding,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO policy_bindings (workspace_id, project_id, environment_id, subject, role)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&scope.workspace_id)
    .bind(&scope.project_id)
    .bind(&scope.environment_id)
    .bind(&binding.subject)
    .bind(binding.role.as_str())
    .execute(executor)
    .await?;
    Ok(())
}

/// Inserts the binding unless the subject is already bound. Returns whether a row was written.
pub async fn insert_binding_if_absent<'c, E>(
    executor: E,
    scope: &Scope,
    binding: &PolicyBinding,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO policy_bindings (workspace_id, project_id, environment_id, subject, role)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (workspace_id, project_id, environment_id, subject) DO NOTHING
        "#,
    )
    .bind(&scope.workspace_id)
    .bind(&scope.project_id)
    .bind(&scope.environment_id)
    .bind(&binding.subject)
    .bind(binding.role.as_str())
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Current policy revision; scopes that never had a policy write report 0.
pub async fn get_revision<'c, E>(executor: E, scope: &Scope) -> Result<i64, sqlx::Error>
where
    E: Executor<'c, Database = Sqlite>,
{
    let row = sqlx::query(
        r#"
        SELECT revision
        FROM policy_revisions
        WHERE workspace_id = ? AND project_id = ? AND environment_id = ?
        "#,
    )
    .bind(&scope.workspace_id)
    .bind(&scope.project_id)
    .bind(&scope.environment_id)
    .fetch_optional(executor)
    .await?;

    match row {
        Some(row) => row.try_get("revision"),
        None => Ok(0),
    }
}

/// Increments the scope's revision by one and returns the new value.
pub async fn bump_revision<'c, E>(
    executor: E,
    scope: &Scope,
    updated_at_unix_ns: i64,
) -> Result<i64, sqlx::Error>
where
    E: Executor<'c, Database = Sqlite>,
{
    let row = sqlx::query(
        r#"
        INSERT INTO policy_revisions (workspace_id, project_id, environment_id, revision, updated_at_unix_ns)
        VALUES (?, ?, ?, 1, ?)
        ON CONFLICT (workspace_id, project_id, environment_id) DO UPDATE
        SET
            revision = policy_revisions.revision + 1,
            updated_at_unix_ns = excluded.updated_at_unix_ns
        RETURNING revision
        "#,
    )
    .bind(&scope.workspace_id)
    .bind(&scope.project_id)
    .bind(&scope.environment_id)
    .bind(updated_at_unix_ns)
    .fetch_one(executor)
    .await?;
    row.try_get("revision")
}

fn parse_role(row: &SqliteRow) -> Result<Role, sqlx::Error> {
    let role: String = row.try_get("role")?;
    Role::from_str(&role).ok_or_else(|| decode_error(format!("unknown role `{role}`")))
}
