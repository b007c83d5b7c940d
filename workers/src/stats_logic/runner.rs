use std::sync::Arc;

use anyhow::{Context, Result};
use lib_analytics::{
    AggregateSink, MemorySink, PillShardProcessor, RedisAggregateSink, ShardProcessor, SystemClock,
};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use super::config::{self, WorkerKind, WorkerSettings};
use super::coordinator::{self, ReplayOptions, ShardSummary};
use super::lease::LeaseTable;
use super::{logger, replay};

pub const LEASE_FILE: &str = "leases.json";

/// Loads configuration, installs logging and runs every shard found in the
/// replay directory until they finish or a shutdown signal arrives.
pub async fn run(kind: WorkerKind) -> Result<()> {
    let config = config::load_config(kind)?;
    let settings = config.resolve(kind).context("invalid configuration")?;
    logger::setup_logging(&settings.log_dir, &settings.log_level, kind.app_name())?;

    log::info!(
        "action=startup app={} stream={} replay_dir={} dry_run={} max_records={}",
        settings.processor.app_name,
        settings.stream_name,
        settings.replay_dir.display(),
        settings.dry_run,
        settings.max_records
    );

    let sink: Arc<dyn AggregateSink> = if settings.dry_run {
        Arc::new(MemorySink::new())
    } else {
        Arc::new(
            RedisAggregateSink::connect(&settings.redis_url, settings.redis_timeout)
                .await
                .with_context(|| format!("connecting to {}", settings.redis_url))?,
        )
    };

    let worker_id = format!("{}-{}", settings.processor.app_name, std::process::id());
    let table = if settings.dry_run {
        LeaseTable::in_memory(worker_id)
    } else {
        LeaseTable::load(settings.replay_dir.join(LEASE_FILE), worker_id)
            .await
            .context("loading the lease table")?
    };

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut shards = spawn_shards(&settings, sink, &table, &shutdown_tx).await?;

    let shutdown_signal = wait_for_shutdown_signal();
    tokio::pin!(shutdown_signal);
    let mut signalled = false;

    loop {
        tokio::select! {
            _ = &mut shutdown_signal, if !signalled => {
                signalled = true;
                // Send shutdown signal to all shard tasks
                let _ = shutdown_tx.send(());
            }
            joined = shards.join_next() => match joined {
                None => break,
                Some(Ok(Ok(summary))) => log::debug!("action=shard-joined shard={}", summary.shard_id),
                Some(Ok(Err(e))) => log::error!("action=shard-failed error={:#}", e),
                Some(Err(e)) => log::error!("action=shard-task-panicked error={}", e),
            },
        }
    }

    log::info!("Shutdown complete.");
    Ok(())
}

async fn spawn_shards(
    settings: &WorkerSettings,
    sink: Arc<dyn AggregateSink>,
    table: &LeaseTable,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<JoinSet<Result<ShardSummary>>> {
    let shard_ids = replay::discover_shards(&settings.replay_dir)
        .await
        .with_context(|| format!("listing shards in {}", settings.replay_dir.display()))?;
    if shard_ids.is_empty() {
        log::warn!("action=no-shards replay_dir={}", settings.replay_dir.display());
    }

    let options = ReplayOptions {
        replay_dir: settings.replay_dir.clone(),
        max_records: settings.max_records,
        idle_time_between_reads: settings.idle_time_between_reads,
    };

    let mut set = JoinSet::new();
    for shard_id in shard_ids {
        table.acquire(&shard_id).await;
        let table = table.clone();
        let options = options.clone();
        let shutdown = shutdown_tx.subscribe();

        match settings.kind {
            WorkerKind::Sense => {
                let processor = ShardProcessor::new(
                    settings.processor.clone(),
                    sink.clone(),
                    Arc::new(SystemClock),
                )?;
                set.spawn(coordinator::run_shard(processor, table, shard_id, options, shutdown));
            }
            WorkerKind::Pill => {
                let processor = PillShardProcessor::new(
                    settings.processor.clone(),
                    sink.clone(),
                    Arc::new(SystemClock),
                )?;
                set.spawn(coordinator::run_shard(processor, table, shard_id, options, shutdown));
            }
        }
    }
    Ok(set)
}

async fn wait_for_shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Could not install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}
