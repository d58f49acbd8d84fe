use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;

use super::state;

/// Name of the deletion journal object kept at the remote root.
pub const METADATA_FILE: &str = "_gdsyncd_metadata.json";

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

const READ_ATTEMPTS: u32 = 3;
const READ_BACKOFF: Duration = Duration::from_millis(500);

/// One object as returned by the remote API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    /// Epoch milliseconds.
    pub modified_time: Option<i64>,
    pub size: u64,
    pub md5_checksum: Option<String>,
}

impl RemoteObject {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }
}

/// One page of a folder listing.
#[derive(Debug, Clone, Default)]
pub struct RemotePage {
    pub files: Vec<RemoteObject>,
    pub next_page_token: Option<String>,
}

/// A remote object placed in the tree: `path` is its key relative to the
/// sync root (folders end with `/`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub path: String,
    pub modified_time: Option<i64>,
    pub size: u64,
    pub md5_checksum: Option<String>,
}

/// Remote view of one path, after sync-metadata mapping has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub key: String,
    pub id: String,
    pub mtime: Option<i64>,
    pub size: u64,
    pub hash: Option<String>,
}

/// Operations the sync core needs from a cloud storage provider.
///
/// Objects are addressed by opaque id; folder ids act as parents.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list_children(&self, folder_id: &str, page_token: Option<&str>)
    -> Result<RemotePage>;

    /// Find a non-trashed folder called `name` directly under `parent_id`.
    async fn find_folder(&self, name: &str, parent_id: &str) -> Result<Option<RemoteObject>>;

    async fn create_file(&self, name: &str, parent_id: &str, content: Vec<u8>)
    -> Result<RemoteObject>;

    async fn update_file(&self, id: &str, content: Vec<u8>) -> Result<RemoteObject>;

    /// Create a folder; `None` as parent means the drive root.
    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<RemoteObject>;

    async fn delete_object(&self, id: &str) -> Result<()>;

    async fn download(&self, id: &str) -> Result<Vec<u8>>;
}

/// Run an idempotent read, retrying with exponential backoff.
pub async fn retry_read<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < READ_ATTEMPTS => {
                let wait = READ_BACKOFF * 2u32.pow(attempt - 1);
                tracing::warn!(
                    operation = what,
                    attempt,
                    error = %e,
                    "remote read failed, retrying in {wait:?}"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(e.context(format!("{what} failed after {READ_ATTEMPTS} attempts")));
            }
        }
    }
}

/// Enumerate the whole tree under `root_id`.
///
/// Breadth-first over folder ids; each folder's pages are fetched in an
/// inner loop until the page token runs out.
pub async fn get_all_files(store: &dyn RemoteStore, root_id: &str) -> Result<Vec<RemoteFile>> {
    let mut files = Vec::new();
    let mut queue: VecDeque<(String, String)> = VecDeque::new();
    queue.push_back((root_id.to_string(), String::new()));

    while let Some((folder_id, prefix)) = queue.pop_front() {
        let mut page_token: Option<String> = None;
        loop {
            let page = retry_read("list folder", || {
                store.list_children(&folder_id, page_token.as_deref())
            })
            .await
            .with_context(|| format!("Failed to list remote folder '{prefix}'"))?;

            for obj in page.files {
                let path = if obj.is_folder() {
                    format!("{prefix}{}/", obj.name)
                } else {
                    format!("{prefix}{}", obj.name)
                };
                if obj.is_folder() {
                    queue.push_back((obj.id.clone(), path.clone()));
                }
                files.push(RemoteFile {
                    id: obj.id,
                    name: obj.name,
                    mime_type: obj.mime_type,
                    path,
                    modified_time: obj.modified_time,
                    size: obj.size,
                    md5_checksum: obj.md5_checksum,
                });
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
    }

    tracing::debug!(count = files.len(), "remote tree listed");
    Ok(files)
}

/// Turn a listing into per-path remote entries.
///
/// An object whose id has a sync-metadata row recorded at the same remote
/// mtime is reported under that row's local key, size and mtime, so a file
/// we uploaded ourselves compares equal to its local source.
pub async fn parse_remote_files(pool: &SqlitePool, files: &[RemoteFile]) -> Result<Vec<RemoteEntry>> {
    let mut entries = Vec::with_capacity(files.len());
    for f in files {
        let mut entry = RemoteEntry {
            key: f.path.clone(),
            id: f.id.clone(),
            mtime: f.modified_time,
            size: f.size,
            hash: f.md5_checksum.clone(),
        };

        if let Some(mtime) = f.modified_time
            && let Some(meta) = state::get_sync_meta_if_unchanged(pool, &f.id, mtime).await?
        {
            tracing::trace!(path = %f.path, local_key = %meta.local_key, "remote mapped back");
            entry.key = meta.local_key;
            entry.size = meta.local_size.max(0) as u64;
            entry.mtime = Some(meta.local_mtime);
        }

        entries.push(entry);
    }
    Ok(entries)
}

/// The journal object, if present at the top level of the listing.
pub fn find_metadata_file(files: &[RemoteFile]) -> Option<&RemoteFile> {
    files.iter().find(|f| f.path == METADATA_FILE)
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryRemote;
    use super::*;
    use crate::db;
    use crate::sync::state::SyncMetaRecord;

    fn seeded() -> (MemoryRemote, String) {
        let remote = MemoryRemote::new(1_000);
        let root = remote.put_folder("vault", MemoryRemote::DRIVE_ROOT);
        let docs = remote.put_folder("docs", &root.id);
        remote.put_file("a.md", &root.id, b"a");
        remote.put_file("b.md", &root.id, b"b");
        remote.put_file("c.md", &docs.id, b"c");
        let deep = remote.put_folder("deep", &docs.id);
        remote.put_file("d.md", &deep.id, b"d");
        (remote, root.id)
    }

    #[tokio::test]
    async fn lists_whole_tree_across_pages() {
        let (remote, root) = seeded();
        let files = get_all_files(&remote, &root).await.unwrap();

        let mut paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        paths.sort();
        assert_eq!(
            paths,
            vec!["a.md", "b.md", "docs/", "docs/c.md", "docs/deep/", "docs/deep/d.md"]
        );
        assert!(files.iter().all(|f| f.modified_time.is_some()));
    }

    #[tokio::test]
    async fn listing_retries_transient_failures() {
        let (remote, root) = seeded();
        remote
            .fail_list_times
            .store(2, std::sync::atomic::Ordering::SeqCst);
        let files = get_all_files(&remote, &root).await.unwrap();
        assert_eq!(files.len(), 6);
    }

    #[tokio::test]
    async fn listing_gives_up_after_bounded_attempts() {
        let (remote, root) = seeded();
        remote
            .fail_list_times
            .store(READ_ATTEMPTS as usize, std::sync::atomic::Ordering::SeqCst);
        assert!(get_all_files(&remote, &root).await.is_err());
    }

    #[tokio::test]
    async fn parse_maps_back_unchanged_uploads() {
        let pool = db::init_memory_db().await.unwrap();
        let files = vec![
            RemoteFile {
                id: "r1".into(),
                name: "a.md".into(),
                mime_type: "text/plain".into(),
                path: "a.md".into(),
                modified_time: Some(9_000),
                size: 4,
                md5_checksum: Some("h".into()),
            },
            RemoteFile {
                id: "r2".into(),
                name: "b.md".into(),
                mime_type: "text/plain".into(),
                path: "b.md".into(),
                modified_time: Some(9_500),
                size: 4,
                md5_checksum: Some("h2".into()),
            },
        ];
        state::upsert_sync_meta(
            &pool,
            &SyncMetaRecord {
                local_key: "a.md".into(),
                remote_key: "r1".into(),
                local_size: 4,
                remote_size: 4,
                local_mtime: 5_000,
                remote_mtime: 9_000,
            },
        )
        .await
        .unwrap();
        // recorded at a different remote mtime: changed remotely since
        state::upsert_sync_meta(
            &pool,
            &SyncMetaRecord {
                local_key: "b.md".into(),
                remote_key: "r2".into(),
                local_size: 4,
                remote_size: 4,
                local_mtime: 5_000,
                remote_mtime: 9_000,
            },
        )
        .await
        .unwrap();

        let entries = parse_remote_files(&pool, &files).await.unwrap();
        assert_eq!(entries[0].mtime, Some(5_000));
        assert_eq!(entries[0].hash.as_deref(), Some("h"));
        assert_eq!(entries[1].mtime, Some(9_500));
    }

    #[test]
    fn metadata_file_only_at_top_level() {
        let make = |path: &str| RemoteFile {
            id: path.into(),
            name: METADATA_FILE.into(),
            mime_type: "application/json".into(),
            path: path.into(),
            modified_time: Some(1),
            size: 0,
            md5_checksum: None,
        };
        let nested = vec![make(&format!("sub/{METADATA_FILE}"))];
        assert!(find_metadata_file(&nested).is_none());
        let top = vec![make(METADATA_FILE)];
        assert_eq!(find_metadata_file(&top).unwrap().id, METADATA_FILE);
    }
}
