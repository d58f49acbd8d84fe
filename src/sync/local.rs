use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

use crate::util::{hash, path as key_path};

use super::remote::METADATA_FILE;
use super::trash::Trash;

/// Suffix of in-progress download files.
pub const TEMP_SUFFIX: &str = ".gdsyncd.tmp";

/// One entry of the local tree as observed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub key: String,
    pub is_dir: bool,
    /// Epoch milliseconds.
    pub mtime: Option<i64>,
    pub ctime: Option<i64>,
    pub size: u64,
    pub hash: Option<String>,
}

pub fn system_time_ms(t: SystemTime) -> Option<i64> {
    t.duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as i64)
}

/// True for paths the sync engine itself writes and never syncs.
pub fn is_internal(key: &str) -> bool {
    key == METADATA_FILE || key_path::file_name(key).ends_with(TEMP_SUFFIX)
}

/// The local side of the sync: one root folder on disk.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
    exclude: Vec<String>,
    trash: Trash,
}

impl LocalFs {
    pub fn new(root: PathBuf, exclude: Vec<String>, trash: Trash) -> Self {
        Self {
            root,
            exclude,
            trash,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn trash(&self) -> &Trash {
        &self.trash
    }

    pub fn full_path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_end_matches('/'))
    }

    pub fn is_ignored(&self, key: &str) -> bool {
        is_internal(key) || key_path::matches_exclude(key, &self.exclude)
    }

    /// Walk the tree, hashing every file.
    pub async fn list(&self) -> Result<Vec<LocalEntry>> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create sync root: {}", self.root.display()))?;

        let mut entries = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            self.read_one_dir(&dir, &mut pending, &mut entries).await?;
        }
        tracing::debug!(count = entries.len(), "local tree listed");
        Ok(entries)
    }

    async fn read_one_dir(
        &self,
        dir: &Path,
        pending: &mut Vec<PathBuf>,
        entries: &mut Vec<LocalEntry>,
    ) -> Result<()> {
        let mut read_dir = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to read dir: {}", dir.display()))?;

        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let meta = match tokio::fs::symlink_metadata(&path).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot stat, skipping");
                    continue;
                }
            };

            if meta.is_symlink() {
                tracing::debug!(path = %path.display(), "skipping symlink");
                continue;
            }

            let key = key_path::relative_key(&self.root, &path, meta.is_dir())?;
            if self.is_ignored(&key) {
                tracing::debug!(path = %key, "excluded (local)");
                continue;
            }

            let mtime = meta.modified().ok().and_then(system_time_ms);
            let ctime = meta.created().ok().and_then(system_time_ms);

            if meta.is_dir() {
                entries.push(LocalEntry {
                    key,
                    is_dir: true,
                    mtime,
                    ctime,
                    size: 0,
                    hash: None,
                });
                pending.push(path);
            } else if meta.is_file() {
                // unreadable files fail the listing instead of looking absent
                let hash = match hash::compute_md5(&path).await {
                    Ok(h) => h,
                    Err(_) if !tokio::fs::try_exists(&path).await.unwrap_or(true) => {
                        tracing::debug!(path = %key, "removed while listing");
                        continue;
                    }
                    Err(e) => return Err(e.context(format!("Failed to hash {key}"))),
                };
                entries.push(LocalEntry {
                    key,
                    is_dir: false,
                    mtime,
                    ctime,
                    size: meta.len(),
                    hash: Some(hash),
                });
            }
        }
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> bool {
        tokio::fs::try_exists(self.full_path(key))
            .await
            .unwrap_or(false)
    }

    pub async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.full_path(key);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    /// Write a file via a temp file in the same folder, then rename into place.
    pub async fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let dest = self.full_path(key);
        let tmp_name = format!(".{}{TEMP_SUFFIX}", key_path::file_name(key));
        let tmp_path = dest.with_file_name(tmp_name);

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("Failed to create temp file: {}", tmp_path.display()))?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &dest)
            .await
            .with_context(|| format!("Failed to rename temp file to {}", dest.display()))?;
        Ok(())
    }

    /// Create every missing level of a folder key, shallowest first.
    pub async fn mkdir_levels(&self, folder: &str) -> Result<()> {
        for level in key_path::folder_levels(folder) {
            let path = self.full_path(&level);
            match tokio::fs::create_dir(&path).await {
                Ok(()) => tracing::debug!(path = %level, "created local folder"),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create dir: {}", path.display()));
                }
            }
        }
        Ok(())
    }

    pub async fn move_to_trash(&self, key: &str) -> Result<PathBuf> {
        self.trash.move_to_trash(key, &self.full_path(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_at(root: &Path, trash: &Path, exclude: &[&str]) -> LocalFs {
        LocalFs::new(
            root.to_path_buf(),
            exclude.iter().map(|s| s.to_string()).collect(),
            Trash::new(None, trash.to_path_buf()),
        )
    }

    #[tokio::test]
    async fn lists_files_and_folders_with_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let trash = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs/deep")).unwrap();
        std::fs::write(dir.path().join("docs/deep/a.md"), "hello world").unwrap();
        std::fs::write(dir.path().join("skip.tmp"), "x").unwrap();
        std::fs::write(dir.path().join(METADATA_FILE), "{}").unwrap();
        std::fs::write(dir.path().join(format!(".b.md{TEMP_SUFFIX}")), "x").unwrap();

        let local = fs_at(dir.path(), trash.path(), &["*.tmp"]);
        let mut entries = local.list().await.unwrap();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["docs/", "docs/deep/", "docs/deep/a.md"]);

        let file = &entries[2];
        assert!(!file.is_dir);
        assert_eq!(file.size, 11);
        assert_eq!(file.hash.as_deref(), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));
        assert!(file.mtime.unwrap() > 0);
        assert!(entries[0].hash.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_file_fails_the_listing() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let trash = tempfile::tempdir().unwrap();
        let file = dir.path().join("locked.md");
        std::fs::write(&file, "secret").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o000)).unwrap();
        if std::fs::File::open(&file).is_ok() {
            // running as root, permissions are not enforced
            return;
        }

        let local = fs_at(dir.path(), trash.path(), &[]);
        let err = local.list().await.unwrap_err();
        assert!(format!("{err:#}").contains("locked.md"));

        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o644)).unwrap();
    }

    #[tokio::test]
    async fn write_atomic_and_mkdir_levels() {
        let dir = tempfile::tempdir().unwrap();
        let trash = tempfile::tempdir().unwrap();
        let local = fs_at(dir.path(), trash.path(), &[]);

        local.mkdir_levels("a/b/c/").await.unwrap();
        local.mkdir_levels("a/b/").await.unwrap();
        assert!(dir.path().join("a/b/c").is_dir());

        local.write_atomic("a/b/c/x.md", b"data").await.unwrap();
        assert_eq!(local.read("a/b/c/x.md").await.unwrap(), b"data");
        assert!(!dir.path().join(format!("a/b/c/.x.md{TEMP_SUFFIX}")).exists());
        assert!(local.exists("a/b/c/x.md").await);
        assert_eq!(std::fs::metadata(dir.path().join("a/b/c/x.md")).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn trash_removes_from_tree() {
        let dir = tempfile::tempdir().unwrap();
        let trash = tempfile::tempdir().unwrap();
        let local = fs_at(dir.path(), trash.path(), &[]);
        local.mkdir_levels("gone/").await.unwrap();
        local.write_atomic("gone/x.md", b"1").await.unwrap();

        local.move_to_trash("gone/").await.unwrap();
        assert!(!local.exists("gone/").await);
        assert!(local.list().await.unwrap().is_empty());
    }
}
