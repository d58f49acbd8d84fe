use std::fmt;

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

/// What happened to a path locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryAction {
    Delete,
    /// The path was the source of a rename; `rename_to` holds the target.
    Rename,
    /// The path was the target of a rename.
    RenameDestination,
    /// Anything else found in the store. Rejected during assembly.
    Unknown(String),
}

impl HistoryAction {
    pub fn parse(s: &str) -> Self {
        match s {
            "delete" => Self::Delete,
            "rename" => Self::Rename,
            "rename_destination" => Self::RenameDestination,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Delete => "delete",
            Self::Rename => "rename",
            Self::RenameDestination => "rename_destination",
            Self::Unknown(s) => s,
        }
    }
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    File,
    Folder,
}

impl KeyType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Folder => "folder",
        }
    }
}

/// One row of the history log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub key: String,
    pub ctime: i64,
    pub mtime: i64,
    pub size: i64,
    /// Epoch milliseconds of the event.
    pub action_when: i64,
    pub action: HistoryAction,
    pub key_type: KeyType,
    /// Empty unless `action` is `Rename`.
    pub rename_to: String,
}

impl HistoryRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        let key: String = row.get("key");
        let key_type = match row.get::<&str, _>("key_type") {
            "folder" => KeyType::Folder,
            "file" => KeyType::File,
            _ if key.ends_with('/') => KeyType::Folder,
            _ => KeyType::File,
        };
        Self {
            key,
            ctime: row.get("ctime"),
            mtime: row.get("mtime"),
            size: row.get("size"),
            action_when: row.get("action_when"),
            action: HistoryAction::parse(row.get("action_type")),
            key_type,
            rename_to: row.get("rename_to"),
        }
    }

    /// A deletion observed now.
    pub fn deletion(key: &str, key_type: KeyType, action_when: i64) -> Self {
        Self {
            key: key.to_string(),
            ctime: 0,
            mtime: 0,
            size: 0,
            action_when,
            action: HistoryAction::Delete,
            key_type,
            rename_to: String::new(),
        }
    }

    /// The source/destination pair recorded for one rename.
    pub fn rename_pair(
        from: &str,
        to: &str,
        key_type: KeyType,
        stat: (i64, i64, i64),
        action_when: i64,
    ) -> (Self, Self) {
        let (ctime, mtime, size) = stat;
        let source = Self {
            key: from.to_string(),
            ctime,
            mtime,
            size,
            action_when,
            action: HistoryAction::Rename,
            key_type,
            rename_to: to.to_string(),
        };
        let destination = Self {
            key: to.to_string(),
            action: HistoryAction::RenameDestination,
            rename_to: String::new(),
            ..source.clone()
        };
        (source, destination)
    }
}

/// Insert or replace the history entry for a key.
pub async fn set(pool: &SqlitePool, r: &HistoryRecord) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO file_history (
            key, ctime, mtime, size, action_when, action_type, key_type, rename_to
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            ctime = excluded.ctime,
            mtime = excluded.mtime,
            size = excluded.size,
            action_when = excluded.action_when,
            action_type = excluded.action_type,
            key_type = excluded.key_type,
            rename_to = excluded.rename_to"#,
    )
    .bind(&r.key)
    .bind(r.ctime)
    .bind(r.mtime)
    .bind(r.size)
    .bind(r.action_when)
    .bind(r.action.as_str())
    .bind(r.key_type.as_str())
    .bind(&r.rename_to)
    .execute(pool)
    .await
    .with_context(|| format!("Failed to record history for {}", r.key))?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<HistoryRecord>> {
    let row = sqlx::query("SELECT * FROM file_history WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch history entry")?;

    Ok(row.as_ref().map(HistoryRecord::from_row))
}

pub async fn delete(pool: &SqlitePool, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM file_history WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await
        .context("Failed to delete history entry")?;
    Ok(())
}

/// All history entries, oldest event first.
pub async fn get_all(pool: &SqlitePool) -> Result<Vec<HistoryRecord>> {
    let rows = sqlx::query("SELECT * FROM file_history ORDER BY action_when ASC, key ASC")
        .fetch_all(pool)
        .await
        .context("Failed to fetch history")?;

    Ok(rows.iter().map(HistoryRecord::from_row).collect())
}

pub async fn count(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM file_history")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

/// Remove the entry for `key` if it records a delete or a rename source,
/// i.e. once that deletion has been propagated.
pub async fn clear_delete_or_rename(pool: &SqlitePool, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM file_history WHERE key = ? AND action_type IN ('delete', 'rename')")
        .bind(key)
        .execute(pool)
        .await
        .context("Failed to clear delete/rename history")?;
    Ok(())
}

/// Remove a rename-destination entry once the destination is in sync.
pub async fn clear_rename_destination(pool: &SqlitePool, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM file_history WHERE key = ? AND action_type = 'rename_destination'")
        .bind(key)
        .execute(pool)
        .await
        .context("Failed to clear rename-destination history")?;
    Ok(())
}
