use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub executor_concurrency: usize,
    pub actuation_latency: Duration,
    pub actuation_max_attempts: u32,
    /// Upper bound for `GET /my/jobs/{id}/wait`.
    pub max_wait: Duration,
    /// Machines registered at startup.
    pub seed_machines: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("JOBPLANE_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid JOBPLANE_LISTEN_ADDR")?;

        let log_level = std::env::var("JOBPLANE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("JOBPLANE_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let executor_concurrency = env_number("JOBPLANE_EXECUTOR_CONCURRENCY", 8)?;
        let actuation_latency =
            Duration::from_millis(env_number("JOBPLANE_ACTUATION_LATENCY_MS", 250)?);
        let actuation_max_attempts = env_number("JOBPLANE_ACTUATION_MAX_ATTEMPTS", 3)?;
        let max_wait = Duration::from_secs(env_number("JOBPLANE_WAIT_TIMEOUT_SECS", 60)?);

        let seed_machines = match std::env::var("JOBPLANE_SEED_MACHINES") {
            Ok(names) => parse_names(&names),
            Err(_) if dev_mode => vec!["dev-vm-1".to_string()],
            Err(_) => Vec::new(),
        };

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            executor_concurrency,
            actuation_latency,
            actuation_max_attempts,
            max_wait,
            seed_machines,
        })
    }
}

fn env_number<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid {name}: '{value}'")),
        Err(_) => Ok(default),
    }
}

fn parse_names(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
