use crate::models::data_object::TransferType;
use crate::services::{backend::TransferClient, engine::EngineSettings};
use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub temp_archive_dir: String,
    pub posix_archive_dir: String,
    pub download_dir: String,
    /// JSON tiering table; `None` means nothing is tierable.
    pub tiering_config: Option<String>,
    pub sweep_interval_secs: u64,
    pub upload_timeout_hours: u64,
    pub call_timeout_secs: u64,
    pub max_concurrent_items: usize,
    pub max_traversal_depth: usize,
    pub permanent_archive: TransferType,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Transfer orchestration engine for archived data")]
pub struct Args {
    /// Host to bind to (overrides ORCHESTRATOR_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides ORCHESTRATOR_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides ORCHESTRATOR_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Temporary staging archive directory (overrides ORCHESTRATOR_TEMP_ARCHIVE_DIR)
    #[arg(long)]
    pub temp_archive_dir: Option<String>,

    /// POSIX permanent archive directory (overrides ORCHESTRATOR_POSIX_ARCHIVE_DIR)
    #[arg(long)]
    pub posix_archive_dir: Option<String>,

    /// Root for local download destinations (overrides ORCHESTRATOR_DOWNLOAD_DIR)
    #[arg(long)]
    pub download_dir: Option<String>,

    /// Tiering configuration JSON file (overrides ORCHESTRATOR_TIERING_CONFIG)
    #[arg(long)]
    pub tiering_config: Option<String>,

    /// Seconds between sweep passes (overrides ORCHESTRATOR_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Hours before an unreadable in-flight upload is forced to UNKNOWN
    /// (overrides ORCHESTRATOR_UPLOAD_TIMEOUT_HOURS)
    #[arg(long)]
    pub upload_timeout_hours: Option<u64>,

    /// Per backend call timeout in seconds (overrides ORCHESTRATOR_CALL_TIMEOUT_SECS)
    #[arg(long)]
    pub call_timeout_secs: Option<u64>,

    /// Items processed concurrently per sweep (overrides ORCHESTRATOR_MAX_CONCURRENT_ITEMS)
    #[arg(long)]
    pub max_concurrent_items: Option<usize>,

    /// Deepest collection level walked (overrides ORCHESTRATOR_MAX_TRAVERSAL_DEPTH)
    #[arg(long)]
    pub max_traversal_depth: Option<usize>,

    /// Backend receiving staged uploads (overrides ORCHESTRATOR_PERMANENT_ARCHIVE)
    #[arg(long)]
    pub permanent_archive: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// The permanent archive must be a real archive with a registered backend.
pub fn ensure_permanent_archive(kind: TransferType, transfers: &TransferClient) -> Result<()> {
    if kind == TransferType::Temp {
        bail!("the temporary archive cannot also be the permanent archive");
    }
    if !transfers.has_backend(kind) {
        bail!("no {} backend is available for the permanent archive", kind);
    }
    Ok(())
}

/// Read and parse `name`, falling back to `default` when unset.
fn env_parsed<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.into())
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    fn merge(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env_string("ORCHESTRATOR_HOST", "0.0.0.0");
        let env_port = env_parsed("ORCHESTRATOR_PORT", 3000u16)?;
        let env_db = env_string(
            "ORCHESTRATOR_DATABASE_URL",
            "sqlite://./data/meta/orchestrator.db",
        );
        let env_temp = env_string("ORCHESTRATOR_TEMP_ARCHIVE_DIR", "./data/temp-archive");
        let env_posix = env_string("ORCHESTRATOR_POSIX_ARCHIVE_DIR", "./data/archive");
        let env_download = env_string("ORCHESTRATOR_DOWNLOAD_DIR", "./data/downloads");
        let env_tiering = env::var("ORCHESTRATOR_TIERING_CONFIG").ok();
        let env_interval = env_parsed("ORCHESTRATOR_SWEEP_INTERVAL_SECS", 60u64)?;
        let env_upload_timeout = env_parsed("ORCHESTRATOR_UPLOAD_TIMEOUT_HOURS", 24u64)?;
        let env_call_timeout = env_parsed("ORCHESTRATOR_CALL_TIMEOUT_SECS", 300u64)?;
        let env_concurrency = env_parsed("ORCHESTRATOR_MAX_CONCURRENT_ITEMS", 8usize)?;
        let env_depth = env_parsed("ORCHESTRATOR_MAX_TRAVERSAL_DEPTH", 64usize)?;
        let env_permanent = env_parsed("ORCHESTRATOR_PERMANENT_ARCHIVE", TransferType::Posix)?;

        let permanent_archive = match args.permanent_archive {
            Some(value) => value
                .parse::<TransferType>()
                .map_err(|err| anyhow!("{}", err))
                .context("parsing --permanent-archive")?,
            None => env_permanent,
        };

        // --- Merge ---
        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            temp_archive_dir: args.temp_archive_dir.unwrap_or(env_temp),
            posix_archive_dir: args.posix_archive_dir.unwrap_or(env_posix),
            download_dir: args.download_dir.unwrap_or(env_download),
            tiering_config: args.tiering_config.or(env_tiering),
            sweep_interval_secs: args.sweep_interval_secs.unwrap_or(env_interval),
            upload_timeout_hours: args.upload_timeout_hours.unwrap_or(env_upload_timeout),
            call_timeout_secs: args.call_timeout_secs.unwrap_or(env_call_timeout),
            max_concurrent_items: args.max_concurrent_items.unwrap_or(env_concurrency),
            max_traversal_depth: args.max_traversal_depth.unwrap_or(env_depth),
            permanent_archive,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let hours = i64::try_from(self.upload_timeout_hours)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 3_600_000);
        EngineSettings {
            upload_timeout: chrono::Duration::hours(hours),
            max_concurrent_items: self.max_concurrent_items.max(1),
            max_traversal_depth: self.max_traversal_depth,
            permanent_archive: self.permanent_archive,
        }
    }
}
