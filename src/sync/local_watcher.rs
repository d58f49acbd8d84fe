use std::fs::Metadata;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::util::path::{self as key_path, ROOT_KEY};

use super::history::{self, HistoryAction, HistoryRecord, KeyType};
use super::local::{LocalFs, system_time_ms};
use super::state;

/// Start recording local deletions and renames into the history log.
///
/// Creations and edits are not recorded; the next listing sees them. The
/// recorder runs until the returned `WatcherHandle` is dropped.
pub fn start_history_recorder(pool: SqlitePool, local: LocalFs) -> Result<WatcherHandle> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        match result {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => {
                tracing::error!(error = %e, "local watcher error");
            }
        }
    })
    .context("Failed to create file watcher")?;

    watcher
        .watch(local.root(), RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {}", local.root().display()))?;
    tracing::info!(root = %local.root().display(), "recording local deletions and renames");

    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let now = chrono::Utc::now().timestamp_millis();
            let records = records_for_event(&local, &event, now);
            if records.is_empty() {
                continue;
            }
            if let Err(e) = persist(&pool, records, now).await {
                tracing::warn!(error = %e, "failed to record local change");
            }
        }
    });

    Ok(WatcherHandle {
        _watcher: watcher,
        task,
    })
}

/// Handle that keeps the watcher alive. Drop to stop recording.
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// History entries implied by one filesystem event.
pub fn records_for_event(local: &LocalFs, event: &Event, now: i64) -> Vec<HistoryRecord> {
    match event.kind {
        EventKind::Remove(kind) => {
            let key_type = if kind == RemoveKind::Folder {
                KeyType::Folder
            } else {
                KeyType::File
            };
            deletions(local, &event.paths, key_type, now)
        }
        // moved out of the watched tree
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            deletions(local, &event.paths, KeyType::File, now)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [from, to] => rename_records(local, from, to, now),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn tracked_key(local: &LocalFs, path: &Path, is_dir: bool) -> Option<String> {
    let key = key_path::relative_key(local.root(), path, is_dir).ok()?;
    (key != ROOT_KEY && !local.is_ignored(&key)).then_some(key)
}

fn deletions(local: &LocalFs, paths: &[PathBuf], key_type: KeyType, now: i64) -> Vec<HistoryRecord> {
    paths
        .iter()
        .filter_map(|p| tracked_key(local, p, key_type == KeyType::Folder))
        .map(|key| HistoryRecord::deletion(&key, key_type, now))
        .collect()
}

fn stat_triple(meta: &Metadata) -> (i64, i64, i64) {
    let ms = |t: std::io::Result<std::time::SystemTime>| t.ok().and_then(system_time_ms).unwrap_or(0);
    let size = if meta.is_dir() { 0 } else { meta.len() as i64 };
    (ms(meta.created()), ms(meta.modified()), size)
}

fn rename_records(local: &LocalFs, from: &Path, to: &Path, now: i64) -> Vec<HistoryRecord> {
    let Ok(meta) = std::fs::symlink_metadata(to) else {
        return Vec::new();
    };
    let is_dir = meta.is_dir();
    let key_type = if is_dir { KeyType::Folder } else { KeyType::File };

    let from_key = tracked_key(local, from, is_dir);
    let to_key = tracked_key(local, to, is_dir);
    let (from_key, to_key) = match (from_key, to_key) {
        (Some(f), Some(t)) => (f, t),
        (Some(f), None) => return vec![HistoryRecord::deletion(&f, key_type, now)],
        // appears like a creation; the listing picks it up
        (None, _) => return Vec::new(),
    };

    let mut out = Vec::new();
    let (src, dst) = HistoryRecord::rename_pair(&from_key, &to_key, key_type, stat_triple(&meta), now);
    out.push(src);
    out.push(dst);

    if is_dir {
        // children move with their folder but get no events of their own
        let mut stack = vec![to.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                if meta.file_type().is_symlink() {
                    continue;
                }
                let child_dir = meta.is_dir();
                let Some(child_dst) = tracked_key(local, &path, child_dir) else {
                    continue;
                };
                let child_src = format!("{from_key}{}", &child_dst[to_key.len()..]);
                let kt = if child_dir { KeyType::Folder } else { KeyType::File };
                let (s, d) = HistoryRecord::rename_pair(&child_src, &child_dst, kt, stat_triple(&meta), now);
                out.push(s);
                out.push(d);
                if child_dir {
                    stack.push(path);
                }
            }
        }
    }
    out
}

/// Store records, widening folder deletions to every key known below the
/// folder. A deletion whose kind the event could not tell is treated as a
/// folder when only the folder key is mapped.
async fn persist(pool: &SqlitePool, records: Vec<HistoryRecord>, now: i64) -> Result<()> {
    for mut record in records {
        if record.action == HistoryAction::Delete && record.key_type == KeyType::File {
            let folder = key_path::folder_key(&record.key);
            if state::get_remote_id(pool, &record.key).await?.is_none()
                && state::get_remote_id(pool, &folder).await?.is_some()
            {
                record.key = folder;
                record.key_type = KeyType::Folder;
            }
        }

        history::set(pool, &record).await?;
        tracing::debug!(path = %record.key, action = %record.action, "recorded local change");

        if record.action == HistoryAction::Delete && record.key_type == KeyType::Folder {
            for child in state::mapped_keys_under(pool, &record.key).await? {
                if history::get(pool, &child).await?.is_some() {
                    continue;
                }
                let kt = if key_path::is_folder_key(&child) {
                    KeyType::Folder
                } else {
                    KeyType::File
                };
                history::set(pool, &HistoryRecord::deletion(&child, kt, now)).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::sync::remote::METADATA_FILE;
    use crate::sync::trash::Trash;

    fn fixture() -> (tempfile::TempDir, LocalFs) {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalFs::new(
            dir.path().to_path_buf(),
            vec!["*.tmp".to_string()],
            Trash::new(None, dir.path().join(".trash-unused")),
        );
        (dir, local)
    }

    fn event(kind: EventKind, paths: &[PathBuf]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |e, p| e.add_path(p.clone()))
    }

    #[test]
    fn removals_become_deletions() {
        let (dir, local) = fixture();
        let file = event(
            EventKind::Remove(RemoveKind::File),
            &[dir.path().join("notes/a.md")],
        );
        let records = records_for_event(&local, &file, 42);
        assert_eq!(records, vec![HistoryRecord::deletion("notes/a.md", KeyType::File, 42)]);

        let folder = event(EventKind::Remove(RemoveKind::Folder), &[dir.path().join("notes")]);
        let records = records_for_event(&local, &folder, 43);
        assert_eq!(records[0].key, "notes/");
        assert_eq!(records[0].key_type, KeyType::Folder);
    }

    #[test]
    fn ignored_and_foreign_paths_are_skipped() {
        let (dir, local) = fixture();
        let ev = event(
            EventKind::Remove(RemoveKind::Any),
            &[
                dir.path().join("scratch.tmp"),
                dir.path().join(METADATA_FILE),
                PathBuf::from("/somewhere/else.md"),
                dir.path().to_path_buf(),
            ],
        );
        assert!(records_for_event(&local, &ev, 1).is_empty());

        let create = event(
            EventKind::Create(notify::event::CreateKind::File),
            &[dir.path().join("new.md")],
        );
        assert!(records_for_event(&local, &create, 1).is_empty());
    }

    #[test]
    fn file_rename_records_both_sides() {
        let (dir, local) = fixture();
        std::fs::write(dir.path().join("b.md"), "hello").unwrap();
        let ev = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &[dir.path().join("a.md"), dir.path().join("b.md")],
        );

        let records = records_for_event(&local, &ev, 9);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, "a.md");
        assert_eq!(records[0].action, HistoryAction::Rename);
        assert_eq!(records[0].rename_to, "b.md");
        assert_eq!(records[1].key, "b.md");
        assert_eq!(records[1].action, HistoryAction::RenameDestination);
        assert_eq!(records[1].size, 5);
        assert!(records.iter().all(|r| r.action_when == 9));
    }

    #[test]
    fn folder_rename_covers_children() {
        let (dir, local) = fixture();
        std::fs::create_dir_all(dir.path().join("new/sub")).unwrap();
        std::fs::write(dir.path().join("new/sub/x.md"), "x").unwrap();
        let ev = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &[dir.path().join("old"), dir.path().join("new")],
        );

        let mut pairs: Vec<(String, String)> = records_for_event(&local, &ev, 1)
            .into_iter()
            .filter(|r| r.action == HistoryAction::Rename)
            .map(|r| (r.key, r.rename_to))
            .collect();
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("old/".to_string(), "new/".to_string()),
                ("old/sub/".to_string(), "new/sub/".to_string()),
                ("old/sub/x.md".to_string(), "new/sub/x.md".to_string()),
            ]
        );
    }

    #[test]
    fn rename_out_of_tree_is_a_deletion() {
        let (dir, local) = fixture();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("a.md"), "x").unwrap();
        let ev = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &[dir.path().join("a.md"), outside.path().join("a.md")],
        );
        assert_eq!(
            records_for_event(&local, &ev, 7),
            vec![HistoryRecord::deletion("a.md", KeyType::File, 7)]
        );
    }

    #[tokio::test]
    async fn folder_deletion_reaches_mapped_children() {
        let pool = db::init_memory_db().await.unwrap();
        for (key, id) in [("docs/", "1"), ("docs/a.md", "2"), ("docs/sub/", "3")] {
            state::set_remote_id(&pool, key, id).await.unwrap();
        }

        // kind unknown at event time; resolved through the mapping
        persist(&pool, vec![HistoryRecord::deletion("docs", KeyType::File, 5)], 5)
            .await
            .unwrap();

        let all = history::get_all(&pool).await.unwrap();
        let mut keys: Vec<&str> = all.iter().map(|h| h.key.as_str()).collect();
        keys.sort();
        assert_eq!(keys, vec!["docs/", "docs/a.md", "docs/sub/"]);
        let sub = history::get(&pool, "docs/sub/").await.unwrap().unwrap();
        assert_eq!(sub.key_type, KeyType::Folder);
        assert_eq!(sub.action, HistoryAction::Delete);
    }
}
