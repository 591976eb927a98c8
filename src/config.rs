use anyhow::{Context, Result, ensure};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

use crate::services::{
    blob_store::MAX_MERGE_FAN_IN, coordinator::CoordinatorOptions, retry::RetryPolicy,
};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub fan_in: usize,
    pub call_timeout_ms: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub final_prefix: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Coordinator for chunked multipart uploads")]
pub struct Args {
    /// Host to bind to (overrides COORDINATOR_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides COORDINATOR_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where blobs are stored (overrides COORDINATOR_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides COORDINATOR_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Most sources per merge call (overrides COORDINATOR_FAN_IN)
    #[arg(long)]
    pub fan_in: Option<usize>,

    /// Deadline per ledger or blob store call (overrides COORDINATOR_CALL_TIMEOUT_MS)
    #[arg(long)]
    pub call_timeout_ms: Option<u64>,

    /// Attempts per external call (overrides COORDINATOR_MAX_ATTEMPTS)
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Key prefix for assembled objects (overrides COORDINATOR_FINAL_PREFIX)
    #[arg(long)]
    pub final_prefix: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read `name` from the environment, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        let cfg = Self {
            host: match args.host {
                Some(host) => host,
                None => env_or("COORDINATOR_HOST", "0.0.0.0".to_string())?,
            },
            port: match args.port {
                Some(port) => port,
                None => env_or("COORDINATOR_PORT", 8080)?,
            },
            storage_dir: match args.storage_dir {
                Some(dir) => dir,
                None => env_or("COORDINATOR_STORAGE_DIR", "./data/blobs".to_string())?,
            },
            database_url: match args.database_url {
                Some(url) => url,
                None => env_or(
                    "COORDINATOR_DATABASE_URL",
                    "sqlite://./data/meta/ledger.db".to_string(),
                )?,
            },
            fan_in: match args.fan_in {
                Some(fan_in) => fan_in,
                None => env_or("COORDINATOR_FAN_IN", MAX_MERGE_FAN_IN)?,
            },
            call_timeout_ms: match args.call_timeout_ms {
                Some(ms) => ms,
                None => env_or("COORDINATOR_CALL_TIMEOUT_MS", 30_000)?,
            },
            max_attempts: match args.max_attempts {
                Some(n) => n,
                None => env_or("COORDINATOR_MAX_ATTEMPTS", 4)?,
            },
            initial_backoff_ms: env_or("COORDINATOR_INITIAL_BACKOFF_MS", 100)?,
            max_backoff_ms: env_or("COORDINATOR_MAX_BACKOFF_MS", 5_000)?,
            final_prefix: match args.final_prefix {
                Some(prefix) => prefix,
                None => env_or("COORDINATOR_FINAL_PREFIX", "objects".to_string())?,
            },
        };
        cfg.validate()?;

        Ok((cfg, args.migrate))
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            (2..=MAX_MERGE_FAN_IN).contains(&self.fan_in),
            "fan-in must be between 2 and {}, got {}",
            MAX_MERGE_FAN_IN,
            self.fan_in
        );
        ensure!(self.max_attempts >= 1, "max attempts must be at least 1");
        ensure!(self.call_timeout_ms > 0, "call timeout must be positive");
        ensure!(
            self.initial_backoff_ms <= self.max_backoff_ms,
            "initial backoff ({} ms) exceeds max backoff ({} ms)",
            self.initial_backoff_ms,
            self.max_backoff_ms
        );
        ensure!(
            !self.final_prefix.trim_matches('/').is_empty(),
            "final object prefix must not be empty"
        );
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            fan_in: self.fan_in,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                initial_backoff: Duration::from_millis(self.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.max_backoff_ms),
                call_timeout: Duration::from_millis(self.call_timeout_ms),
            },
            final_prefix: self.final_prefix.trim_matches('/').to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AppConfig {
        AppConfig {
            host: "127.0.0.1".into(),
            port: 8080,
            storage_dir: "./data/blobs".into(),
            database_url: "sqlite::memory:".into(),
            fan_in: 32,
            call_timeout_ms: 30_000,
            max_attempts: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            final_prefix: "objects".into(),
        }
    }

    #[test]
    fn defaults_are_valid() {
        config().validate().unwrap();
    }

    #[test]
    fn fan_in_outside_merge_limits_is_rejected() {
        for fan_in in [0, 1, 33] {
            let cfg = AppConfig { fan_in, ..config() };
            assert!(cfg.validate().is_err(), "fan_in {fan_in}");
        }
    }

    #[test]
    fn options_carry_retry_policy() {
        let cfg = AppConfig {
            final_prefix: "/final/".into(),
            ..config()
        };
        let options = cfg.coordinator_options();
        assert_eq!(options.final_prefix, "final");
        assert_eq!(options.retry.max_attempts, 4);
        assert_eq!(options.retry.call_timeout, Duration::from_secs(30));
    }
}
