use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const EXDEV: i32 = 18;

/// Where deleted local files go.
///
/// The freedesktop trash (`$XDG_DATA_HOME/Trash`) is tried first so users can
/// restore from their file manager; when that fails the entry lands in the
/// in-app trash as `<app_trash>/YYYY-MM-DD/<relative_path>`.
#[derive(Debug, Clone)]
pub struct Trash {
    system: Option<PathBuf>,
    app: PathBuf,
}

impl Trash {
    pub fn new(system: Option<PathBuf>, app: PathBuf) -> Self {
        Self { system, app }
    }

    /// System trash under the user data dir, app trash next to the database.
    pub fn from_data_dir() -> Result<Self> {
        let data = dirs::data_dir().context("Could not determine data directory")?;
        Ok(Self::new(
            Some(data.join("Trash")),
            data.join("gdsyncd").join("trash"),
        ))
    }

    /// Move `full_path` out of the sync tree. Returns its new location.
    pub async fn move_to_trash(&self, relative_path: &str, full_path: &Path) -> Result<PathBuf> {
        if let Some(system) = &self.system {
            match move_to_system_trash(system, full_path).await {
                Ok(dest) => {
                    tracing::info!(path = %relative_path, to = %dest.display(), "moved to system trash");
                    return Ok(dest);
                }
                Err(e) => tracing::debug!(
                    path = %relative_path,
                    error = %e,
                    "system trash unavailable, using app trash"
                ),
            }
        }

        let dest = move_to_app_trash(&self.app, relative_path, full_path).await?;
        tracing::info!(path = %relative_path, to = %dest.display(), "moved to trash");
        Ok(dest)
    }

    /// Remove app-trash date folders older than `max_days`.
    pub async fn cleanup_expired(&self, max_days: u64) -> Result<usize> {
        let cutoff = chrono::Utc::now().date_naive() - chrono::Duration::days(max_days as i64);

        let mut read_dir = match tokio::fs::read_dir(&self.app).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.app.display()));
            }
        };

        let mut removed = 0;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name();
            let Some(day) = name.to_str().and_then(|n| n.get(..10)) else {
                continue;
            };
            let Ok(date) = chrono::NaiveDate::parse_from_str(day, "%Y-%m-%d") else {
                continue;
            };
            if date >= cutoff {
                continue;
            }

            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    tracing::debug!(folder = %entry.path().display(), "removed expired trash");
                    removed += 1;
                }
                Err(e) => tracing::warn!(
                    folder = %entry.path().display(),
                    error = %e,
                    "failed to remove expired trash"
                ),
            }
        }

        if removed > 0 {
            tracing::info!(count = removed, days = max_days, "cleaned up expired trash");
        }
        cleanup_empty_dirs(&self.app).await;
        Ok(removed)
    }
}

/// Move into `<trash_base>/YYYY-MM-DD/<relative_path>`, falling back to a
/// per-second folder on a name clash.
async fn move_to_app_trash(
    trash_base: &Path,
    relative_path: &str,
    full_path: &Path,
) -> Result<PathBuf> {
    let now = chrono::Utc::now();
    let relative_path = relative_path.trim_end_matches('/');

    let dest = trash_base
        .join(now.format("%Y-%m-%d").to_string())
        .join(relative_path);
    let dest = if dest.exists() {
        trash_base
            .join(now.format("%Y-%m-%d-%H-%M-%S").to_string())
            .join(relative_path)
    } else {
        dest
    };

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create trash directory: {}", parent.display()))?;
    }

    move_entry(full_path, &dest).await.with_context(|| {
        format!(
            "Failed to move {} to trash at {}",
            full_path.display(),
            dest.display()
        )
    })?;
    Ok(dest)
}

/// freedesktop.org trash: `files/<name>` plus `info/<name>.trashinfo`.
async fn move_to_system_trash(trash_root: &Path, full_path: &Path) -> Result<PathBuf> {
    let files = trash_root.join("files");
    let info = trash_root.join("info");
    tokio::fs::create_dir_all(&files).await?;
    tokio::fs::create_dir_all(&info).await?;

    let base_name = full_path
        .file_name()
        .and_then(|n| n.to_str())
        .context("Path has no file name")?;

    let trash_info = format!(
        "[Trash Info]\nPath={}\nDeletionDate={}\n",
        trashinfo_path(full_path)?,
        chrono::Local::now().format("%Y-%m-%dT%H:%M:%S"),
    );

    // Reserve a unique name by creating the .trashinfo file exclusively.
    for n in 1..1000 {
        let name = if n == 1 {
            base_name.to_string()
        } else {
            format!("{base_name}.{n}")
        };
        let info_path = info.join(format!("{name}.trashinfo"));
        let created = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&info_path)
            .await;
        match created {
            Ok(_) => {
                tokio::fs::write(&info_path, &trash_info).await?;
                let dest = files.join(&name);
                if let Err(e) = move_entry(full_path, &dest).await {
                    let _ = tokio::fs::remove_file(&info_path).await;
                    return Err(e);
                }
                return Ok(dest);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    anyhow::bail!("No free trash name for {base_name}")
}

/// The `Path=` value of a `.trashinfo` file: the absolute path, URL-escaped.
fn trashinfo_path(path: &Path) -> Result<String> {
    let url = url::Url::from_file_path(path)
        .map_err(|()| anyhow::anyhow!("Not an absolute path: {}", path.display()))?;
    Ok(url.path().to_string())
}

/// Move a file or directory, falling back to copy+delete for cross-filesystem moves.
async fn move_entry(src: &Path, dst: &Path) -> Result<()> {
    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(EXDEV) => {
            copy_recursive(src, dst).await?;
            if src.is_dir() {
                tokio::fs::remove_dir_all(src).await?;
            } else {
                tokio::fs::remove_file(src).await?;
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn copy_recursive<'a>(
    src: &'a Path,
    dst: &'a Path,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let meta = tokio::fs::symlink_metadata(src).await?;

        if meta.is_dir() {
            tokio::fs::create_dir_all(dst).await?;
            let mut read_dir = tokio::fs::read_dir(src).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                copy_recursive(&entry.path(), &dst.join(entry.file_name())).await?;
            }
        } else {
            tokio::fs::copy(src, dst).await?;
        }

        Ok(())
    })
}

/// Recursively remove empty subdirectories (bottom-up).
fn cleanup_empty_dirs(
    dir: &Path,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
    Box::pin(async move {
        let Ok(mut read_dir) = tokio::fs::read_dir(dir).await else {
            return;
        };

        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                cleanup_empty_dirs(&path).await;
                // only succeeds when empty
                let _ = tokio::fs::remove_dir(&path).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn app_trash_is_date_stamped() {
        let root = tempfile::tempdir().unwrap();
        let trash_dir = tempfile::tempdir().unwrap();
        let file = root.path().join("notes").join("a.md");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, "x").unwrap();

        let trash = Trash::new(None, trash_dir.path().to_path_buf());
        let dest = trash.move_to_trash("notes/a.md", &file).await.unwrap();

        assert!(!file.exists());
        assert!(dest.ends_with("notes/a.md"));
        let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
        assert!(dest.starts_with(trash_dir.path().join(day)));
    }

    #[tokio::test]
    async fn system_trash_writes_trashinfo() {
        let root = tempfile::tempdir().unwrap();
        let sys = tempfile::tempdir().unwrap();
        let app = tempfile::tempdir().unwrap();

        for _ in 0..2 {
            let dir = root.path().join("my folder");
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("inner.md"), "x").unwrap();
            let trash = Trash::new(Some(sys.path().to_path_buf()), app.path().to_path_buf());
            trash.move_to_trash("my folder/", &dir).await.unwrap();
        }

        assert!(sys.path().join("files/my folder/inner.md").exists());
        assert!(sys.path().join("files/my folder.2").exists());
        let info =
            std::fs::read_to_string(sys.path().join("info/my folder.trashinfo")).unwrap();
        assert!(info.starts_with("[Trash Info]\nPath="));
        assert!(info.contains("my%20folder"));
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_days() {
        let app = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(app.path().join("2000-01-01/old")).unwrap();
        std::fs::write(app.path().join("2000-01-01/old/a.md"), "x").unwrap();
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        std::fs::create_dir_all(app.path().join(&today)).unwrap();
        std::fs::write(app.path().join(&today).join("b.md"), "x").unwrap();

        let trash = Trash::new(None, app.path().to_path_buf());
        assert_eq!(trash.cleanup_expired(30).await.unwrap(), 1);
        assert!(!app.path().join("2000-01-01").exists());
        assert!(app.path().join(&today).join("b.md").exists());
    }

    #[test]
    fn trashinfo_path_encoding() {
        assert_eq!(
            trashinfo_path(Path::new("/a b/ü.md")).unwrap(),
            "/a%20b/%C3%BC.md"
        );
        assert_eq!(
            trashinfo_path(Path::new("/notes/#1 draft?.md")).unwrap(),
            "/notes/%231%20draft%3F.md"
        );
        assert!(trashinfo_path(Path::new("relative.md")).is_err());
    }
}
