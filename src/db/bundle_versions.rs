use sqlx::{sqlite::SqliteRow, Executor, Row, Sqlite};

use super::{decode_error, from_unix_nanos};
use crate::models::{BundleStatus, BundleVersionSummary, FileType, Scope};

#[derive(Debug, Clone)]
pub struct NewBundleVersion<'a> {
    pub bundle_version_id: &'a str,
    pub scope: &'a Scope,
    pub status: BundleStatus,
    pub created_by: &'a str,
    pub created_at_unix_ns: i64,
    pub source_version_id: Option<&'a str>,
}

const SELECT_SUMMARY: &str = r#"
    SELECT
        v.bundle_version_id,
        v.workspace_id,
        v.project_id,
        v.environment_id,
        v.status,
        v.created_by,
        v.created_at_unix_ns,
        v.source_version_id,
        GROUP_CONCAT(p.file_type) AS file_types
    FROM bundle_versions v
    LEFT JOIN bundle_file_payloads p ON p.bundle_version_id = v.bundle_version_id
"#;

pub async fn insert_version<'c, E>(executor: E, input: NewBundleVersion<'_>) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO bundle_versions (
            bundle_version_id,
            workspace_id,
            project_id,
            environment_id,
            status,
            created_by,
            created_at_unix_ns,
            source_version_id
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(input.bundle_version_id)
    .bind(&input.scope.workspace_id)
    .bind(&input.scope.project_id)
    .bind(&input.scope.environment_id)
    .bind(input.status.as_str())
    .bind(input.created_by)
    .bind(input.created_at_unix_ns)
    .bind(input.source_version_id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Looks up a version, but only inside `scope`; ids from other scopes read as absent.
pub async fn get_version<'c, E>(
    executor: E,
    scope: &Scope,
    bundle_version_id: &str,
) -> Result<Option<BundleVersionSummary>, sqlx::Error>
where
    E: Executor<'c, Database = Sqlite>,
{
    let sql = format!(
        "{SELECT_SUMMARY} WHERE v.workspace_id = ? AND v.project_id = ? AND v.environment_id = ? \
         AND v.bundle_version_id = ? GROUP BY v.bundle_version_id"
    );
    let row = sqlx::query(&sql)
        .bind(&scope.workspace_id)
        .bind(&scope.project_id)
        .bind(&scope.environment_id)
        .bind(bundle_version_id)
        .fetch_optional(executor)
        .await?;
    row.map(|row| map_row(&row)).transpose()
}

/// Newest first; ties on the timestamp break on the id, both descending.
pub async fn list_versions<'c, E>(
    executor: E,
    scope: &Scope,
    limit: i64,
    offset: i64,
) -> Result<Vec<BundleVersionSummary>, sqlx::Error>
where
    E: Executor<'c, Database = Sqlite>,
{
    let sql = format!(
        "{SELECT_SUMMARY} WHERE v.workspace_id = ? AND v.project_id = ? AND v.environment_id = ? \
         GROUP BY v.bundle_version_id \
         ORDER BY v.created_at_unix_ns DESC, v.bundle_version_id DESC \
         LIMIT ? OFFSET ?"
    );
    let rows = sqlx::query(&sql)
        .bind(&scope.workspace_id)
        .bind(&scope.project_id)
        .bind(&scope.environment_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(executor)
        .await?;
    rows.iter().map(map_row).collect()
}

pub async fn set_status<'c, E>(
    executor: E,
    bundle_version_id: &str,
    status: BundleStatus,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Sqlite>,
{
    let result = sqlx::query("UPDATE bundle_versions SET status = ? WHERE bundle_version_id = ?")
        .bind(status.as_str())
        .bind(bundle_version_id)
        .execute(executor)
        .await?;
    if result.rows_affected() == 0 {
        return Err(sqlx::Error::RowNotFound);
    }
    Ok(())
}

pub async fn count_active<'c, E>(executor: E, scope: &Scope) -> Result<i64, sqlx::Error>
where
    E: Executor<'c, Database = Sqlite>,
{
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS active_count
        FROM bundle_versions
        WHERE workspace_id = ? AND project_id = ? AND environment_id = ? AND status = 'active'
        "#,
    )
    .bind(&scope.workspace_id)
    .bind(&scope.project_id)
    .bind(&scope.environment_id)
    .fetch_one(executor)
    .await?;
    row.try_get("active_count")
}

fn map_row(row: &SqliteRow) -> Result<BundleVersionSummary, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = BundleStatus::from_str(&status)
        .ok_or_else(|| decode_error(format!("unknown bundle status `{status}`")))?;
    let file_types: Option<String> = row.try_get("file_types")?;

    Ok(BundleVersionSummary {
        bundle_version_id: row.try_get("bundle_version_id")?,
        scope: Scope::new(
            row.try_get::<String, _>("workspace_id")?,
            row.try_get::<String, _>("project_id")?,
            row.try_get::<String, _>("environment_id")?,
        ),
        status,
        created_by: row.try_get("created_by")?,
        created_at: from_unix_nanos(row.try_get("created_at_unix_ns")?),
        file_types: parse_file_types(file_types.as_deref())?,
        source_version_id: row.try_get("source_version_id")?,
    })
}

fn parse_file_types(raw: Option<&str>) -> Result<Vec<FileType>, sqlx::Error> {
    let mut file_types = raw
        .unwrap_or_default()
        .split(',')
        .filter(|value| !value.is_empty())
        .map(|value| {
            FileType::from_str(value)
                .ok_or_else(|| decode_error(format!("unknown file type `{value}`")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    file_types.sort();
    file_types.dedup();
    Ok(file_types)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_types_are_sorted_and_deduplicated() {
        assert_eq!(
            parse_file_types(Some("dev-vars,env,env")).unwrap(),
            vec![FileType::Env, FileType::DevVars]
        );
        assert!(parse_file_types(None).unwrap().is_empty());
        assert!(parse_file_types(Some("yaml")).is_err());
    }
}
