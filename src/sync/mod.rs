pub mod assembler;
pub mod executor;
pub mod history;
pub mod journal;
pub mod local;
pub mod local_watcher;
pub mod plan;
pub mod reconciler;
pub mod remote;
pub mod state;
pub mod trash;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::util::notice::Notifier;
use crate::util::path::{self as key_path, ROOT_KEY};

use executor::{ExecContext, ExecutionReport};
use history::KeyType;
use journal::JournalSnapshot;
use local::LocalFs;
use plan::{SyncPlan, TriggerSource};
use remote::RemoteStore;

/// Id of the drive's top-level folder.
const DRIVE_ROOT: &str = "root";

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub concurrency: usize,
    pub remote_root_name: String,
    pub run_timeout: Option<Duration>,
    pub trash_retention_days: u64,
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.general.concurrency,
            remote_root_name: config.sync.remote_root_name(),
            run_timeout: config.general.run_timeout_secs.map(Duration::from_secs),
            trash_retention_days: config.general.trash_retention_days,
        }
    }
}

/// Runs reconciliations between one local folder and one Drive folder.
pub struct SyncEngine {
    pool: SqlitePool,
    remote: Arc<dyn RemoteStore>,
    local: LocalFs,
    options: EngineOptions,
    running: AtomicBool,
    notifier: Notifier,
}

/// Clears the running flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    pub fn new(
        pool: SqlitePool,
        remote: Arc<dyn RemoteStore>,
        local: LocalFs,
        options: EngineOptions,
    ) -> Self {
        Self {
            pool,
            remote,
            local,
            options,
            running: AtomicBool::new(false),
            notifier: Notifier::default(),
        }
    }

    /// Run one full reconciliation.
    ///
    /// Returns `Ok(None)` when another run is already in progress; the
    /// trigger is dropped, not queued.
    pub async fn run(
        &self,
        trigger: TriggerSource,
        cancel: &CancellationToken,
    ) -> Result<Option<ExecutionReport>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.notifier
                .alert("A sync is already running, this trigger was skipped");
            return Ok(None);
        }
        let _guard = RunGuard(&self.running);

        let result = match self.options.run_timeout {
            Some(limit) => tokio::time::timeout(limit, self.run_once(trigger, cancel))
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("Sync run exceeded {limit:?}"))),
            None => self.run_once(trigger, cancel).await,
        };

        match result {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                self.notifier.alert(&format!("Sync failed: {e:#}"));
                Err(e)
            }
        }
    }

    async fn run_once(
        &self,
        trigger: TriggerSource,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport> {
        let started = Instant::now();
        tracing::info!(%trigger, "sync started");

        let root_id = self
            .root_id(true)
            .await?
            .context("Remote root folder could not be created")?;
        let (plan, journal) = self.prepare(trigger, &root_id).await?;
        self.notifier.notify("Got the plan!");
        tracing::debug!(summary = ?plan.summary(), "plan computed");
        if plan.is_noop() {
            tracing::info!("everything is in sync, nothing to transfer");
        }

        self.prune_stale_state(&plan).await?;

        let ctx = Arc::new(ExecContext {
            pool: self.pool.clone(),
            remote: Arc::clone(&self.remote),
            local: self.local.clone(),
            root_id,
        });
        let report = executor::execute_plan(
            ctx,
            &plan,
            &journal,
            self.options.concurrency,
            cancel,
            &self.notifier,
        )
        .await?;

        if let Err(e) = self
            .local
            .trash()
            .cleanup_expired(self.options.trash_retention_days)
            .await
        {
            tracing::warn!(error = %e, "trash cleanup failed");
        }

        if !report.is_success() {
            self.notifier.alert(&format!(
                "{} of {} paths failed, {} skipped",
                report.failed.len(),
                report.total,
                report.skipped.len()
            ));
        }
        self.notifier.notify(&format!(
            "Sync completed in: {:.1}s",
            started.elapsed().as_secs_f64()
        ));
        tracing::info!(
            %trigger,
            completed = report.completed,
            failed = report.failed.len(),
            journal_uploaded = report.journal_uploaded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sync finished"
        );
        Ok(report)
    }

    /// Compute the plan without executing anything.
    pub async fn dry_run(&self, trigger: TriggerSource) -> Result<SyncPlan> {
        let root_id = self.root_id(false).await?.with_context(|| {
            format!(
                "Remote folder '{}' does not exist yet",
                self.options.remote_root_name
            )
        })?;
        let (plan, _) = self.prepare(trigger, &root_id).await?;
        Ok(plan)
    }

    /// Drive id of the remote root folder: mapped id, else a folder of the
    /// configured name under the drive root, else (if `create`) a new one.
    async fn root_id(&self, create: bool) -> Result<Option<String>> {
        if let Some(id) = state::get_remote_id(&self.pool, ROOT_KEY).await? {
            return Ok(Some(id));
        }

        let name = &self.options.remote_root_name;
        let found = remote::retry_read("find root folder", || {
            self.remote.find_folder(name, DRIVE_ROOT)
        })
        .await?;
        let id = match found {
            Some(folder) => folder.id,
            None if create => {
                let folder = self
                    .remote
                    .create_folder(name, None)
                    .await
                    .with_context(|| format!("Failed to create remote root '{name}'"))?;
                tracing::info!(name = %name, id = %folder.id, "created remote root folder");
                folder.id
            }
            None => return Ok(None),
        };

        state::set_remote_id(&self.pool, ROOT_KEY, &id).await?;
        Ok(Some(id))
    }

    /// Gather all four inputs, assemble, and decide.
    async fn prepare(
        &self,
        trigger: TriggerSource,
        root_id: &str,
    ) -> Result<(SyncPlan, JournalSnapshot)> {
        let files = remote::get_all_files(self.remote.as_ref(), root_id).await?;
        let journal_file = remote::find_metadata_file(&files).cloned();
        let content = journal::fetch(self.remote.as_ref(), journal_file.as_ref()).await?;
        let remote_entries = remote::parse_remote_files(&self.pool, &files).await?;
        let local_entries = self.local.list().await?;
        let history = history::get_all(&self.pool).await?;

        tracing::debug!(
            remote = remote_entries.len(),
            local = local_entries.len(),
            tombstones = content.deletions.len(),
            history = history.len(),
            "inputs gathered"
        );

        let mut records =
            assembler::assemble(remote_entries, local_entries, &content.deletions, &history)?;
        reconciler::decide_all(&mut records)?;

        let plan = SyncPlan::new(chrono::Utc::now().timestamp_millis(), trigger, records);
        let snapshot = JournalSnapshot {
            file: journal_file,
            content,
        };
        Ok((plan, snapshot))
    }

    /// Drop history entries and sync-metadata rows the plan no longer
    /// refers to.
    async fn prune_stale_state(&self, plan: &SyncPlan) -> Result<()> {
        for h in history::get_all(&self.pool).await? {
            let key = match h.key_type {
                KeyType::Folder => key_path::folder_key(&h.key),
                KeyType::File => h.key.clone(),
            };
            if !plan.records.contains_key(&key) {
                tracing::debug!(path = %h.key, action = %h.action, "pruning stale history");
                history::delete(&self.pool, &h.key).await?;
            }
        }

        let remote_ids: Vec<String> = plan
            .records
            .values()
            .filter_map(|r| r.remote.as_ref().map(|s| s.id.clone()))
            .collect();
        let removed = state::retain_sync_meta(&self.pool, &remote_ids).await?;
        if removed > 0 {
            tracing::debug!(count = removed, "pruned sync metadata");
        }
        Ok(())
    }
}
