use anyhow::{Context, Result};
use clap::Parser;
use lib_analytics::{ConfigurationError, ProcessorSettings, SensorThresholds};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which stream a worker binary consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Sense,
    Pill,
}

impl WorkerKind {
    pub fn app_name(&self) -> &'static str {
        match self {
            WorkerKind::Sense => "sense_stats",
            WorkerKind::Pill => "pill_stats",
        }
    }

    pub fn stream_name(&self) -> &'static str {
        match self {
            WorkerKind::Sense => "sense_sensors_data",
            WorkerKind::Pill => "batch_pill_data",
        }
    }

    pub fn config_file(&self) -> PathBuf {
        PathBuf::from(format!("{}.conf", self.app_name()))
    }
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Telemetry stats worker: device presence, firmware, wifi and reboot aggregates", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "STATS_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "STATS_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "STATS_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "STATS_REDIS_URL", help = "Redis URL for aggregates and the checkpoint trail.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "STATS_REDIS_TIMEOUT_MS", help = "Response timeout in milliseconds for a single Redis write.")]
    pub redis_timeout_ms: Option<u64>,

    #[clap(long, env = "STATS_REPLAY_DIR", help = "Directory holding one <shard>.jsonl file per shard.")]
    pub replay_dir: Option<PathBuf>,

    #[clap(long, env = "STATS_MAX_RECORDS", help = "Maximum number of records delivered per batch.")]
    pub max_records: Option<usize>,

    #[clap(
        long,
        env = "STATS_DRY_RUN",
        num_args = 0..=1,
        default_missing_value = "true",
        help = "Write aggregates to memory instead of Redis and keep leases in memory."
    )]
    pub dry_run: Option<bool>,

    #[clap(long, env = "STATS_APP_NAME", help = "Application name; prefixes the checkpoint trail key.")]
    pub app_name: Option<String>,

    #[clap(long, env = "STATS_STREAM_NAME", help = "Name of the stream being consumed.")]
    pub stream_name: Option<String>,

    #[clap(long, env = "STATS_IDLE_TIME_BETWEEN_READS_MS", help = "Pause in milliseconds between two batch reads of a shard.")]
    pub idle_time_between_reads_ms: Option<u64>,

    #[clap(long, env = "STATS_CHECKPOINT_TRACK_PERIOD_MINUTES", help = "Minimum minutes between two recorded checkpoint advances.")]
    pub checkpoint_track_period_minutes: Option<u64>,

    /// Sensor bounds are only configurable through the file.
    #[clap(skip)]
    pub thresholds: Option<SensorThresholds>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            redis_url: other.redis_url.or(self.redis_url),
            redis_timeout_ms: other.redis_timeout_ms.or(self.redis_timeout_ms),
            replay_dir: other.replay_dir.or(self.replay_dir),
            max_records: other.max_records.or(self.max_records),
            dry_run: other.dry_run.or(self.dry_run),
            app_name: other.app_name.or(self.app_name),
            stream_name: other.stream_name.or(self.stream_name),
            idle_time_between_reads_ms: other.idle_time_between_reads_ms.or(self.idle_time_between_reads_ms),
            checkpoint_track_period_minutes: other
                .checkpoint_track_period_minutes
                .or(self.checkpoint_track_period_minutes),
            thresholds: other.thresholds.or(self.thresholds),
        }
    }

    pub fn defaults(kind: WorkerKind) -> Config {
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            redis_url: Some("redis://127.0.0.1/".to_string()),
            redis_timeout_ms: Some(500),
            replay_dir: Some(PathBuf::from("./replay").join(kind.stream_name())),
            max_records: Some(1000),
            dry_run: Some(false),
            app_name: Some(kind.app_name().to_string()),
            stream_name: Some(kind.stream_name().to_string()),
            idle_time_between_reads_ms: Some(1000),
            checkpoint_track_period_minutes: Some(60),
            thresholds: Some(SensorThresholds::default()),
            ..Default::default()
        }
    }

    /// Turns the merged options into concrete settings, rejecting anything
    /// the processors would refuse later.
    pub fn resolve(self, kind: WorkerKind) -> Result<WorkerSettings, ConfigurationError> {
        let defaults = Config::defaults(kind);
        let merged = defaults.merge(self);

        let max_records = merged.max_records.unwrap_or(1000);
        if max_records == 0 {
            return Err(ConfigurationError::InvalidValue {
                name: "max_records",
                reason: "must be at least 1".to_string(),
            });
        }
        let redis_timeout_ms = merged.redis_timeout_ms.unwrap_or(500);
        if redis_timeout_ms == 0 {
            return Err(ConfigurationError::InvalidValue {
                name: "redis_timeout_ms",
                reason: "must be positive".to_string(),
            });
        }

        let processor = ProcessorSettings {
            app_name: merged.app_name.unwrap_or_else(|| kind.app_name().to_string()),
            checkpoint_track_period: Duration::from_secs(
                merged.checkpoint_track_period_minutes.unwrap_or(60).saturating_mul(60),
            ),
            thresholds: merged.thresholds.unwrap_or_default(),
            ..Default::default()
        };
        processor.validate()?;

        Ok(WorkerSettings {
            kind,
            log_dir: merged.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: merged.log_level.unwrap_or_else(|| "info".to_string()),
            redis_url: merged.redis_url.ok_or(ConfigurationError::Missing("redis_url"))?,
            redis_timeout: Duration::from_millis(redis_timeout_ms),
            replay_dir: merged.replay_dir.ok_or(ConfigurationError::Missing("replay_dir"))?,
            max_records,
            dry_run: merged.dry_run.unwrap_or(false),
            stream_name: merged.stream_name.unwrap_or_else(|| kind.stream_name().to_string()),
            idle_time_between_reads: Duration::from_millis(
                merged.idle_time_between_reads_ms.unwrap_or(1000),
            ),
            processor,
        })
    }
}

/// Fully resolved worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub kind: WorkerKind,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub redis_url: String,
    pub redis_timeout: Duration,
    pub replay_dir: PathBuf,
    pub max_records: usize,
    pub dry_run: bool,
    pub stream_name: String,
    pub idle_time_between_reads: Duration,
    pub processor: ProcessorSettings,
}

/// Reads the JSON file, if there is one. A file that exists but cannot be
/// read or parsed is an error: logging is not installed yet, so a silent
/// fallback would hide it.
fn read_config_file(path: &Path) -> Result<Option<Config>> {
    if !path.exists() {
        return Ok(None);
    }
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let file_config = serde_json::from_str::<Config>(&config_str)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(Some(file_config))
}

/// Layers defaults < config file < CLI/env.
pub fn load_config_from(kind: WorkerKind, cli_args: Config) -> Result<Config> {
    // 1. Load defaults
    let mut current_config = Config::defaults(kind);

    // 2. Load from config file (<app>.conf) if present.
    //    The CLI may point somewhere else.
    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| kind.config_file());

    if let Some(file_config) = read_config_file(&config_file_path)? {
        current_config = current_config.merge(file_config);
    }

    // 3. Override with environment variables and CLI arguments
    Ok(current_config.merge(cli_args))
}

pub fn load_config(kind: WorkerKind) -> Result<Config> {
    load_config_from(kind, Config::parse())
}
