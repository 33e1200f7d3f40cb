use crate::{
    delivery::{RetryConfig, SimulationConfig},
    limiter::LimiterConfig,
    models::DomainPolicy,
    periodically::CleanerConfig,
};
use anyhow::Context;
use std::{
    collections::HashMap,
    env,
    fs::File,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Pipeline configuration, environment-driven. The per-domain policy table
/// and the rate-limit table come from JSON files referenced by
/// `DOMAINS_FILE` and `LIMITS_FILE`.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Announced in EHLO and used as Reporting-MTA in bounces.
    pub hostname: String,
    pub dkim_selector: String,
    pub smtp_port: u16,
    pub smtp_timeout: Duration,
    pub mx_cache_ttl: Duration,
    pub workers: usize,
    pub tick: Duration,
    pub retry: RetryConfig,
    pub attempt_timeout: Duration,
    pub dead_letter_enabled: bool,
    pub cleaner: CleanerConfig,
    pub limits: LimiterConfig,
    pub limiter_flush_interval: Duration,
    pub domains: HashMap<String, DomainPolicy>,
    pub simulation: SimulationConfig,
}

fn var_or<T: FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let hostname =
            env::var("MTA_HOSTNAME").context("Missing MTA_HOSTNAME environment variable")?;

        let domains = match env::var("DOMAINS_FILE") {
            Ok(path) => load_domains(Path::new(&path))?,
            Err(_) => HashMap::new(),
        };
        let limits = match env::var("LIMITS_FILE") {
            Ok(path) => load_limits(Path::new(&path))?,
            Err(_) => LimiterConfig::default(),
        };

        Ok(Self {
            data_dir: var_or("QUEUE_DATA_DIR", PathBuf::from("./data"))?,
            hostname,
            dkim_selector: var_or("DKIM_SELECTOR", "mail".to_string())?,
            smtp_port: var_or("SMTP_PORT", 25)?,
            smtp_timeout: secs(var_or("SMTP_TIMEOUT_SECS", 60)?),
            mx_cache_ttl: secs(var_or("MX_CACHE_TTL_SECS", 300)?),
            workers: var_or("WORKERS", 4)?,
            tick: secs(var_or("TICK_SECS", 10)?),
            retry: RetryConfig {
                interval: secs(var_or("RETRY_INTERVAL_SECS", 60)?),
                max_retries: var_or("MAX_RETRIES", 5)?,
            },
            attempt_timeout: secs(var_or("ATTEMPT_TIMEOUT_SECS", 120)?),
            dead_letter_enabled: var_or("DEAD_LETTER_ENABLED", true)?,
            cleaner: CleanerConfig {
                delivered_max_age: chrono::Duration::days(var_or("DELIVERED_MAX_AGE_DAYS", 7)?),
                delivered_interval: secs(var_or("CLEANUP_INTERVAL_SECS", 3600)?),
                dead_letter_max_age: chrono::Duration::days(var_or("DLQ_MAX_AGE_DAYS", 30)?),
                dead_letter_max_count: var_or("DLQ_MAX_COUNT", 10_000)?,
                dead_letter_interval: secs(var_or("DLQ_CLEANUP_INTERVAL_SECS", 3600)?),
            },
            limits,
            limiter_flush_interval: secs(var_or("RATE_LIMIT_FLUSH_SECS", 10)?),
            domains,
            simulation: SimulationConfig {
                enabled: var_or("SANDBOX_SIMULATE_ERRORS", false)?,
                probability: var_or("SANDBOX_ERROR_PROBABILITY", 0.05)?,
            },
        })
    }
}

pub fn load_domains(path: &Path) -> anyhow::Result<HashMap<String, DomainPolicy>> {
    let file =
        File::open(path).with_context(|| format!("could not open {}", path.display()))?;
    serde_json::from_reader(file)
        .with_context(|| format!("invalid domain policy file {}", path.display()))
}

pub fn load_limits(path: &Path) -> anyhow::Result<LimiterConfig> {
    let file =
        File::open(path).with_context(|| format!("could not open {}", path.display()))?;
    serde_json::from_reader(file)
        .with_context(|| format!("invalid rate limit file {}", path.display()))
}
