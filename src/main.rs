use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

mod auth;
mod config;
mod db;
mod drive_api;
mod error;
mod sync;
mod util;

use sync::local::LocalFs;
use sync::plan::TriggerSource;
use sync::trash::Trash;
use sync::{EngineOptions, SyncEngine};

#[derive(Parser)]
#[command(
    name = "gdsyncd",
    version,
    about = "Bidirectional Google Drive folder sync daemon"
)]
struct Cli {
    /// Path to config file [default: ~/.config/gdsyncd/config.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the sync daemon (foreground, for systemd)
    Start,
    /// Run one sync now and exit
    SyncNow,
    /// Print what the next sync would do, as JSON, without changing anything
    Plan,
    /// Show sync status summary
    Status,
}

fn init_tracing(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "gdsyncd=info",
        1 => "gdsyncd=debug",
        2 => "gdsyncd=trace",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

/// Warn when the inotify watch limit is too low for a recursive watch.
fn check_inotify_limits() {
    let path = "/proc/sys/fs/inotify/max_user_watches";
    if let Ok(content) = std::fs::read_to_string(path)
        && let Ok(limit) = content.trim().parse::<u64>()
        && limit < 65536
    {
        tracing::warn!(
            max_user_watches = limit,
            "inotify watch limit is low, deletions in large trees may go unrecorded"
        );
    }
}

struct Runtime {
    pool: sqlx::SqlitePool,
    local: LocalFs,
    engine: Arc<SyncEngine>,
}

async fn build_runtime(cfg: &config::Config) -> Result<Runtime> {
    std::fs::create_dir_all(&cfg.sync.local_path).with_context(|| {
        format!(
            "Failed to create sync folder: {}",
            cfg.sync.local_path.display()
        )
    })?;

    let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
    let local = LocalFs::new(
        cfg.sync.local_path.clone(),
        cfg.sync.exclude.clone(),
        Trash::from_data_dir()?,
    );
    let token_mgr = Arc::new(auth::TokenManager::new(cfg)?);
    let client = Arc::new(drive_api::DriveClient::new(token_mgr)?);
    let engine = Arc::new(SyncEngine::new(
        pool.clone(),
        client,
        local.clone(),
        EngineOptions::from_config(cfg),
    ));

    Ok(Runtime {
        pool,
        local,
        engine,
    })
}

fn spawn_run(
    runs: &mut JoinSet<()>,
    engine: &Arc<SyncEngine>,
    trigger: TriggerSource,
    cancel: &CancellationToken,
) {
    let engine = Arc::clone(engine);
    let cancel = cancel.clone();
    runs.spawn(async move {
        if let Err(e) = engine.run(trigger, &cancel).await {
            tracing::error!(%trigger, error = %format!("{e:#}"), "sync failed");
        }
    });
}

async fn next_tick(timer: &mut Option<tokio::time::Interval>) {
    match timer {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_daemon(cfg: &config::Config) -> Result<()> {
    check_inotify_limits();
    let rt = build_runtime(cfg).await?;
    let _recorder = sync::local_watcher::start_history_recorder(rt.pool.clone(), rt.local.clone())?;

    let cancel = CancellationToken::new();
    let mut runs = JoinSet::new();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let init_delay = cfg.general.init_run_delay_secs;
    let init_sleep = tokio::time::sleep(Duration::from_secs(init_delay.unwrap_or(0)));
    tokio::pin!(init_sleep);
    let mut init_pending = init_delay.is_some();

    let interval = cfg.general.auto_run_interval_secs;
    let mut timer = (interval > 0).then(|| {
        let mut t = tokio::time::interval(Duration::from_secs(interval));
        t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        t.reset();
        t
    });

    tracing::info!(
        interval_secs = interval,
        init_delay_secs = ?init_delay,
        "gdsyncd daemon ready"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }

            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }

            _ = &mut init_sleep, if init_pending => {
                init_pending = false;
                spawn_run(&mut runs, &rt.engine, TriggerSource::AutoOnceInit, &cancel);
            }

            _ = next_tick(&mut timer) => {
                spawn_run(&mut runs, &rt.engine, TriggerSource::Auto, &cancel);
            }

            Some(joined) = runs.join_next(), if !runs.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "sync task panicked");
                }
            }
        }
    }

    cancel.cancel();
    while runs.join_next().await.is_some() {}

    tracing::info!("closing database");
    rt.pool.close().await;
    tracing::info!("gdsyncd stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Start => run_daemon(&cfg).await?,
        Command::SyncNow => {
            let rt = build_runtime(&cfg).await?;
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            let outcome = rt.engine.run(TriggerSource::Manual, &cancel).await;
            rt.pool.close().await;

            let report = outcome?.context("Another sync is already running")?;
            for failure in &report.failed {
                eprintln!("failed: {} ({:?}): {}", failure.key, failure.decision, failure.error);
            }
            if !report.is_success() {
                anyhow::bail!(
                    "{} of {} paths failed, {} skipped",
                    report.failed.len(),
                    report.total,
                    report.skipped.len()
                );
            }
            println!("sync complete: {} paths", report.completed);
        }
        Command::Plan => {
            let rt = build_runtime(&cfg).await?;
            let plan = rt.engine.dry_run(TriggerSource::Manual).await;
            rt.pool.close().await;
            println!("{}", serde_json::to_string_pretty(&plan?)?);
        }
        Command::Status => {
            let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
            print_status(&pool, &cfg).await?;
            pool.close().await;
        }
    }

    Ok(())
}

/// Print a short sync status summary.
async fn print_status(pool: &sqlx::SqlitePool, cfg: &config::Config) -> Result<()> {
    let root_id = sync::state::get_remote_id(pool, util::path::ROOT_KEY).await?;
    let mapped = sync::state::count_remote_ids(pool).await?;
    let meta = sync::state::count_sync_meta(pool).await?;
    let pending_count = sync::history::count(pool).await?;
    let pending = sync::history::get_all(pool).await?;

    println!("gdsyncd status");
    println!("==============");
    println!(
        "Folder: {} -> drive:{}",
        cfg.sync.local_path.display(),
        cfg.sync.remote_root_name()
    );
    match root_id {
        Some(id) => println!("Remote root id: {id}"),
        None => println!("Remote root id: not yet resolved"),
    }
    println!("Mapped paths: {mapped}");
    println!("Sync metadata rows: {meta}");
    println!("Pending local deletions/renames: {pending_count}");
    for h in pending.iter().take(10) {
        let when = chrono::DateTime::from_timestamp_millis(h.action_when)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| h.action_when.to_string());
        println!("  {} {} at {when}", h.action, h.key);
    }

    Ok(())
}
