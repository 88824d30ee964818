use sqlx::{sqlite::SqliteRow, Executor, Row, Sqlite};

use super::decode_error;
use crate::crypto::EncryptedPayload;
use crate::models::FileType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPayload {
    pub file_type: FileType,
    pub payload: EncryptedPayload,
}

pub async fn insert_payload<'c, E>(
    executor: E,
    bundle_version_id: &str,
    file_type: FileType,
    payload: &EncryptedPayload,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO bundle_file_payloads (
            bundle_version_id,
            file_type,
            ciphertext,
            ciphertext_nonce,
            wrapped_dek,
            dek_nonce,
            checksum,
            byte_length
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(bundle_version_id)
    .bind(file_type.as_str())
    .bind(&payload.ciphertext)
    .bind(&payload.ciphertext_nonce)
    .bind(&payload.wrapped_dek)
    .bind(&payload.dek_nonce)
    .bind(&payload.checksum)
    .bind(payload.byte_length)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn list_payloads<'c, E>(
    executor: E,
    bundle_version_id: &str,
) -> Result<Vec<StoredPayload>, sqlx::Error>
where
    E: Executor<'c, Database = Sqlite>,
{
    let rows = sqlx::query(
        r#"
        SELECT
            file_type,
            ciphertext,
            ciphertext_nonce,
            wrapped_dek,
            dek_nonce,
            checksum,
            byte_length
        FROM bundle_file_payloads
        WHERE bundle_version_id = ?
        "#,
    )
    .bind(bundle_version_id)
    .fetch_all(executor)
    .await?;

    let mut payloads = rows.iter().map(map_row).collect::<Result<Vec<_>, _>>()?;
    payloads.sort_by_key(|stored| stored.file_type);
    Ok(payloads)
}

/// Copies every encrypted row of `from_version_id` onto `to_version_id` byte for byte.
/// Returns the number of rows copied.
pub async fn copy_payloads<'c, E>(
    executor: E,
    from_version_id: &str,
    to_version_id: &str,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'c, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO bundle_file_payloads (
            bundle_version_id,
            file_type,
            ciphertext,
            ciphertext_nonce,
            wrapped_dek,
            dek_nonce,
            checksum,
            byte_length
        )
        SELECT
            ?,
            file_type,
            ciphertext,
            ciphertext_nonce,
            wrapped_dek,
            dek_nonce,
            checksum,
            byte_length
        FROM bundle_file_payloads
        WHERE bundle_version_id = ?
        "#,
    )
    .bind(to_version_id)
    .bind(from_version_id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

fn map_row(row: &SqliteRow) -> Result<StoredPayload, sqlx::Error> {
    let file_type: String = row.try_get("file_type")?;
    let file_type = FileType::from_str(&file_type)
        .ok_or_else(|| decode_error(format!("unknown file type `{file_type}`")))?;
    Ok(StoredPayload {
        file_type,
        payload: EncryptedPayload {
            ciphertext: row.try_get("ciphertext")?,
            ciphertext_nonce: row.try_get("ciphertext_nonce")?,
            wrapped_dek: row.try_get("wrapped_dek")?,
            dek_nonce: row.try_get("dek_nonce")?,
            checksum: row.try_get("checksum")?,
            byte_length: row.try_get("byte_length")?,
        },
    })
}
