use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

/// State of one object at its last successful transfer, keyed by Drive id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMetaRecord {
    pub local_key: String,
    pub remote_key: String,
    pub local_size: i64,
    pub remote_size: i64,
    pub local_mtime: i64,
    pub remote_mtime: i64,
}

impl SyncMetaRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        Self {
            local_key: row.get("local_key"),
            remote_key: row.get("remote_key"),
            local_size: row.get("local_size"),
            remote_size: row.get("remote_size"),
            local_mtime: row.get("local_mtime"),
            remote_mtime: row.get("remote_mtime"),
        }
    }

    fn key_type(&self) -> &'static str {
        if self.local_key.ends_with('/') {
            "folder"
        } else {
            "file"
        }
    }
}

// --- path -> remote id ---

pub async fn get_remote_id(pool: &SqlitePool, local_key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT remote_id FROM local_to_remote WHERE local_key = ?")
            .bind(local_key)
            .fetch_optional(pool)
            .await
            .context("Failed to fetch remote id mapping")?;
    Ok(row.map(|r| r.0))
}

/// Map a local path key to a Drive id (upsert).
pub async fn set_remote_id(pool: &SqlitePool, local_key: &str, remote_id: &str) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query(
        r#"INSERT INTO local_to_remote (local_key, remote_id, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(local_key) DO UPDATE SET
            remote_id = excluded.remote_id,
            updated_at = excluded.updated_at"#,
    )
    .bind(local_key)
    .bind(remote_id)
    .bind(&now)
    .execute(pool)
    .await
    .with_context(|| format!("Failed to map {local_key} to {remote_id}"))?;
    Ok(())
}

pub async fn delete_remote_id(pool: &SqlitePool, local_key: &str) -> Result<()> {
    sqlx::query("DELETE FROM local_to_remote WHERE local_key = ?")
        .bind(local_key)
        .execute(pool)
        .await
        .context("Failed to delete remote id mapping")?;
    Ok(())
}

pub async fn count_remote_ids(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM local_to_remote")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

/// Mapped keys strictly below `folder`, shallowest first.
pub async fn mapped_keys_under(pool: &SqlitePool, folder: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT local_key FROM local_to_remote
         WHERE substr(local_key, 1, length(?1)) = ?1 AND local_key != ?1
         ORDER BY length(local_key), local_key",
    )
    .bind(folder)
    .fetch_all(pool)
    .await
    .context("Failed to list mapped keys")?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

// --- remote id -> sync metadata ---

pub async fn get_sync_meta(pool: &SqlitePool, remote_key: &str) -> Result<Option<SyncMetaRecord>> {
    let row = sqlx::query("SELECT * FROM sync_mapping WHERE remote_key = ?")
        .bind(remote_key)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch sync metadata")?;

    Ok(row.as_ref().map(SyncMetaRecord::from_row))
}

/// The stored mapping for `remote_key`, but only if the object hasn't been
/// touched remotely since it was recorded.
pub async fn get_sync_meta_if_unchanged(
    pool: &SqlitePool,
    remote_key: &str,
    mtime_remote: i64,
) -> Result<Option<SyncMetaRecord>> {
    Ok(get_sync_meta(pool, remote_key)
        .await?
        .filter(|m| m.remote_key == remote_key && m.remote_mtime == mtime_remote))
}

pub async fn upsert_sync_meta(pool: &SqlitePool, m: &SyncMetaRecord) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO sync_mapping (
            remote_key, local_key, local_size, remote_size,
            local_mtime, remote_mtime, key_type
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(remote_key) DO UPDATE SET
            local_key = excluded.local_key,
            local_size = excluded.local_size,
            remote_size = excluded.remote_size,
            local_mtime = excluded.local_mtime,
            remote_mtime = excluded.remote_mtime,
            key_type = excluded.key_type"#,
    )
    .bind(&m.remote_key)
    .bind(&m.local_key)
    .bind(m.local_size)
    .bind(m.remote_size)
    .bind(m.local_mtime)
    .bind(m.remote_mtime)
    .bind(m.key_type())
    .execute(pool)
    .await
    .with_context(|| format!("Failed to upsert sync metadata for {}", m.local_key))?;
    Ok(())
}

/// Drop every sync-metadata row whose remote id is not in `keep`.
/// Returns the number of rows removed.
pub async fn retain_sync_meta(pool: &SqlitePool, keep: &[String]) -> Result<u64> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT remote_key FROM sync_mapping")
        .fetch_all(pool)
        .await
        .context("Failed to list sync metadata")?;

    let keep: std::collections::HashSet<&str> = keep.iter().map(String::as_str).collect();
    let mut removed = 0;
    for (remote_key,) in rows {
        if keep.contains(remote_key.as_str()) {
            continue;
        }
        sqlx::query("DELETE FROM sync_mapping WHERE remote_key = ?")
            .bind(&remote_key)
            .execute(pool)
            .await
            .context("Failed to prune sync metadata")?;
        removed += 1;
    }
    Ok(removed)
}

pub async fn count_sync_meta(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_mapping")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn meta(local_key: &str, remote_key: &str, remote_mtime: i64) -> SyncMetaRecord {
        SyncMetaRecord {
            local_key: local_key.into(),
            remote_key: remote_key.into(),
            local_size: 10,
            remote_size: 10,
            local_mtime: 500,
            remote_mtime,
        }
    }

    #[tokio::test]
    async fn remote_id_mapping_upserts() {
        let pool = db::init_memory_db().await.unwrap();
        assert_eq!(get_remote_id(&pool, "docs/").await.unwrap(), None);

        set_remote_id(&pool, "docs/", "id-1").await.unwrap();
        set_remote_id(&pool, "docs/", "id-2").await.unwrap();
        assert_eq!(get_remote_id(&pool, "docs/").await.unwrap().as_deref(), Some("id-2"));
        assert_eq!(count_remote_ids(&pool).await.unwrap(), 1);

        delete_remote_id(&pool, "docs/").await.unwrap();
        assert_eq!(get_remote_id(&pool, "docs/").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lists_keys_below_a_folder() {
        let pool = db::init_memory_db().await.unwrap();
        for (key, id) in [
            ("docs/", "1"),
            ("docs/a.md", "2"),
            ("docs/sub/", "3"),
            ("docs_old/b.md", "4"),
            ("other.md", "5"),
        ] {
            set_remote_id(&pool, key, id).await.unwrap();
        }

        assert_eq!(
            mapped_keys_under(&pool, "docs/").await.unwrap(),
            vec!["docs/a.md", "docs/sub/"]
        );
        assert!(mapped_keys_under(&pool, "none/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_meta_matches_only_unchanged_remote() {
        let pool = db::init_memory_db().await.unwrap();
        upsert_sync_meta(&pool, &meta("a.md", "r1", 1_000)).await.unwrap();

        assert!(get_sync_meta_if_unchanged(&pool, "r1", 1_000).await.unwrap().is_some());
        assert!(get_sync_meta_if_unchanged(&pool, "r1", 2_000).await.unwrap().is_none());
        assert!(get_sync_meta_if_unchanged(&pool, "r2", 1_000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retain_prunes_unknown_ids() {
        let pool = db::init_memory_db().await.unwrap();
        upsert_sync_meta(&pool, &meta("a.md", "r1", 1)).await.unwrap();
        upsert_sync_meta(&pool, &meta("b.md", "r2", 1)).await.unwrap();
        upsert_sync_meta(&pool, &meta("c/", "r3", 1)).await.unwrap();

        let removed = retain_sync_meta(&pool, &["r2".to_string()]).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(count_sync_meta(&pool).await.unwrap(), 1);
        assert!(get_sync_meta(&pool, "r2").await.unwrap().is_some());
    }
}
