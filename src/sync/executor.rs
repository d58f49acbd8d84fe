use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::ConsistencyError;
use crate::util::hash;
use crate::util::notice::Notifier;
use crate::util::path as key_path;

use super::assembler::{PathRecord, RecordMap};
use super::history;
use super::journal::{self, JournalSnapshot};
use super::local::LocalFs;
use super::plan::{DependencyGraph, SyncPlan};
use super::reconciler::Decision;
use super::remote::{self, RemoteStore};
use super::state::{self, SyncMetaRecord};

/// Everything a per-path operation touches.
pub struct ExecContext {
    pub pool: SqlitePool,
    pub remote: Arc<dyn RemoteStore>,
    pub local: LocalFs,
    /// Drive id of the folder mirrored by the local root.
    pub root_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathFailure {
    pub key: String,
    pub decision: Option<Decision>,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub total: usize,
    pub completed: usize,
    pub failed: Vec<PathFailure>,
    /// Not attempted because an ancestor failed.
    pub skipped: Vec<String>,
    pub journal_uploaded: bool,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Carry out a decided plan.
///
/// The deletion journal is written first (only if it changed). Then paths
/// run parent before child: a path is started only once its parent in the
/// plan finished successfully, and at most `concurrency` run at once. A
/// failing path is reported and its descendants are skipped; its siblings
/// carry on.
pub async fn execute_plan(
    ctx: Arc<ExecContext>,
    plan: &SyncPlan,
    journal: &JournalSnapshot,
    concurrency: usize,
    cancel: &CancellationToken,
    notifier: &Notifier,
) -> Result<ExecutionReport> {
    if let Some(r) = plan.records.values().find(|r| r.decision.is_none()) {
        return Err(ConsistencyError::Undecided { key: r.key.clone() }.into());
    }

    let mut report = ExecutionReport {
        total: plan.records.len(),
        ..Default::default()
    };

    report.journal_uploaded =
        journal::upload_if_changed(ctx.remote.as_ref(), &ctx.root_id, journal, &plan.deletions)
            .await?;
    if report.journal_uploaded {
        notifier.notify("Finished uploading metadata");
    }

    let records = Arc::new(plan.records.clone());
    let graph = DependencyGraph::build(&plan.sorted_keys, &plan.records);
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();

    let spawn = |tasks: &mut JoinSet<(String, Result<()>)>, key: String| {
        let ctx = Arc::clone(&ctx);
        let records = Arc::clone(&records);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(p) => p,
                Err(e) => return (key, Err(e.into())),
            };
            let result = dispatch(&ctx, &records, &key).await;
            (key, result)
        });
    };

    for key in &graph.roots {
        spawn(&mut tasks, key.clone());
    }

    loop {
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tasks.abort_all();
                anyhow::bail!(
                    "Sync cancelled after {}/{} paths",
                    report.completed,
                    report.total
                );
            }
            joined = tasks.join_next() => joined,
        };
        let Some(joined) = joined else {
            break;
        };

        match joined {
            Ok((key, Ok(()))) => {
                report.completed += 1;
                notifier.notify(&format!("Updated file {}/{}", report.completed, report.total));
                for child in graph.children_of(&key) {
                    spawn(&mut tasks, child.clone());
                }
            }
            Ok((key, Err(e))) => {
                let decision = records.get(&key).and_then(|r| r.decision);
                tracing::error!(path = %key, ?decision, error = %format!("{e:#}"), "path failed");
                let below = graph.descendants(&key);
                if !below.is_empty() {
                    tracing::warn!(path = %key, count = below.len(), "skipping descendants");
                }
                report.skipped.extend(below);
                report.failed.push(PathFailure {
                    key,
                    decision,
                    error: format!("{e:#}"),
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "sync task aborted");
                report.failed.push(PathFailure {
                    key: String::new(),
                    decision: None,
                    error: e.to_string(),
                });
            }
        }
    }

    Ok(report)
}

async fn dispatch(ctx: &ExecContext, records: &RecordMap, key: &str) -> Result<()> {
    let r = records
        .get(key)
        .with_context(|| format!("{key} is not part of the plan"))?;
    let decision = r
        .decision
        .ok_or_else(|| ConsistencyError::Undecided { key: key.to_string() })?;

    let result = match decision {
        Decision::SkipFolder => {
            if r.local.is_some()
                && let Some(remote) = &r.remote
            {
                state::set_remote_id(&ctx.pool, key, &remote.id).await?;
            }
            Ok(())
        }
        Decision::SkipUploading => history::clear_rename_destination(&ctx.pool, key).await,
        Decision::UploadLocalDelHistToRemote
        | Decision::KeepRemoteDelHist
        | Decision::UploadLocalDelHistToRemoteFolder
        | Decision::KeepRemoteDelHistFolder => delete_path(ctx, records, r).await,
        Decision::UploadLocalToRemote => upload(ctx, r).await,
        Decision::DownloadRemoteToLocal => download(ctx, r).await,
        Decision::CreateFolder => create_folder(ctx, r).await,
    };
    result.with_context(|| format!("{decision:?} failed for {key}"))
}

/// Remote id of the folder a new object at `key` goes into.
async fn resolve_parent_id(ctx: &ExecContext, key: &str) -> Result<String> {
    match key_path::parent_path(key) {
        None => Ok(ctx.root_id.clone()),
        Some(parent) => state::get_remote_id(&ctx.pool, &parent)
            .await?
            .with_context(|| format!("Parent folder {parent} has no remote id")),
    }
}

/// Whether some ancestor of `key` is being deleted remotely in this plan,
/// which already removes `key` on the remote side.
fn ancestor_deleted_remotely(records: &RecordMap, key: &str) -> bool {
    key_path::folder_levels(&key_path::parent_folder(key))
        .iter()
        .filter_map(|level| records.get(level))
        .any(|a| a.remote.is_some() && a.decision.is_some_and(Decision::is_deletion))
}

async fn delete_path(ctx: &ExecContext, records: &RecordMap, r: &PathRecord) -> Result<()> {
    let key = r.key.as_str();

    if ctx.local.exists(key).await {
        ctx.local.move_to_trash(key).await?;
    }

    if let Some(remote) = &r.remote {
        if ancestor_deleted_remotely(records, key) {
            tracing::debug!(path = %key, "removed with its parent on the remote side");
        } else {
            ctx.remote
                .delete_object(&remote.id)
                .await
                .with_context(|| format!("Failed to delete remote {key}"))?;
            tracing::info!(path = %key, "deleted remotely");
        }
    }

    history::clear_delete_or_rename(&ctx.pool, key).await?;
    state::delete_remote_id(&ctx.pool, key).await?;
    Ok(())
}

async fn upload(ctx: &ExecContext, r: &PathRecord) -> Result<()> {
    let key = r.key.as_str();
    let bytes = ctx.local.read(key).await?;
    let local_size = bytes.len() as i64;

    let object = match &r.remote {
        Some(remote) => ctx
            .remote
            .update_file(&remote.id, bytes)
            .await
            .with_context(|| format!("Failed to update remote {key}"))?,
        None => {
            let parent_id = resolve_parent_id(ctx, key).await?;
            ctx.remote
                .create_file(key_path::file_name(key), &parent_id, bytes)
                .await
                .with_context(|| format!("Failed to create remote {key}"))?
        }
    };
    tracing::info!(path = %key, id = %object.id, "uploaded");

    state::set_remote_id(&ctx.pool, key, &object.id).await?;
    let local_mtime = r.local.as_ref().and_then(|l| l.mtime);
    if let (Some(local_mtime), Some(remote_mtime)) = (local_mtime, object.modified_time) {
        state::upsert_sync_meta(
            &ctx.pool,
            &SyncMetaRecord {
                local_key: key.to_string(),
                remote_key: object.id.clone(),
                local_size,
                remote_size: object.size as i64,
                local_mtime,
                remote_mtime,
            },
        )
        .await?;
    }
    history::clear_rename_destination(&ctx.pool, key).await
}

async fn download(ctx: &ExecContext, r: &PathRecord) -> Result<()> {
    let key = r.key.as_str();
    let remote = r.remote.as_ref().context("No remote object to download")?;

    if let Some(parent) = key_path::parent_path(key) {
        ctx.local.mkdir_levels(&parent).await?;
    }
    let bytes = remote::retry_read("download", || ctx.remote.download(&remote.id))
        .await
        .with_context(|| format!("Failed to download {key}"))?;
    if let Some(expected) = &remote.hash {
        let actual = hash::md5_hex(&bytes);
        anyhow::ensure!(
            actual == *expected,
            "Checksum mismatch downloading {key}: expected {expected}, got {actual}"
        );
    }
    ctx.local.write_atomic(key, &bytes).await?;
    tracing::info!(path = %key, size = bytes.len(), "downloaded");
    Ok(())
}

async fn create_folder(ctx: &ExecContext, r: &PathRecord) -> Result<()> {
    let key = r.key.as_str();

    if !ctx.local.exists(key).await {
        ctx.local.mkdir_levels(key).await?;
        tracing::info!(path = %key, "created local folder");
    }

    let remote_id = match &r.remote {
        Some(remote) => remote.id.clone(),
        None => {
            let parent_id = resolve_parent_id(ctx, key).await?;
            let folder = ctx
                .remote
                .create_folder(key_path::file_name(key), Some(&parent_id))
                .await
                .with_context(|| format!("Failed to create remote folder {key}"))?;
            tracing::info!(path = %key, id = %folder.id, "created remote folder");

            let local_mtime = r
                .local
                .as_ref()
                .and_then(|l| l.stat_time.or(l.mtime))
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
            if let Some(remote_mtime) = folder.modified_time {
                state::upsert_sync_meta(
                    &ctx.pool,
                    &SyncMetaRecord {
                        local_key: key.to_string(),
                        remote_key: folder.id.clone(),
                        local_size: 0,
                        remote_size: 0,
                        local_mtime,
                        remote_mtime,
                    },
                )
                .await?;
            }
            folder.id
        }
    };

    state::set_remote_id(&ctx.pool, key, &remote_id).await
}
