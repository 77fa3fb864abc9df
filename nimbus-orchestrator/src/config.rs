use std::time::Duration;

use anyhow::{bail, Context, Result};
use nimbus_providers::spider::SpiderTimeouts;

use crate::Tuning;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis(String),
    Postgres(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    Spider,
    Mock,
}

/// Process settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub store: StoreBackend,
    pub provider: ProviderKind,
    pub spider_url: String,
    pub spider_timeouts: SpiderTimeouts,
    pub monitoring_url: String,
    pub monitoring_timeout: Duration,
    pub autoscaler_interval: Duration,
    pub ssh_key_file: Option<String>,
    pub ssh_timeout: Duration,
    pub tuning: Tuning,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let num = |key: &str, default: u64| -> Result<u64> {
            match var(key) {
                Some(v) => v
                    .parse::<u64>()
                    .with_context(|| format!("{} must be a non-negative integer, got '{}'", key, v)),
                None => Ok(default),
            }
        };

        let store = match var("STORE_BACKEND").as_deref().unwrap_or("memory") {
            "memory" => StoreBackend::Memory,
            "redis" => StoreBackend::Redis(
                var("REDIS_URL").context("REDIS_URL must be set when STORE_BACKEND=redis")?,
            ),
            "postgres" => StoreBackend::Postgres(
                var("DATABASE_URL").context("DATABASE_URL must be set when STORE_BACKEND=postgres")?,
            ),
            other => bail!("unknown STORE_BACKEND '{}' (memory, redis or postgres)", other),
        };

        let provider = match var("PROVIDER").as_deref().unwrap_or("spider") {
            "spider" => ProviderKind::Spider,
            "mock" => ProviderKind::Mock,
            other => bail!("unknown PROVIDER '{}' (spider or mock)", other),
        };

        let defaults = SpiderTimeouts::default();
        let tuning_defaults = Tuning::default();
        Ok(Self {
            bind_addr: var("NIMBUS_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:1323".to_string()),
            store,
            provider,
            spider_url: var("SPIDER_URL").unwrap_or_else(|| "http://localhost:1024/spider".to_string()),
            spider_timeouts: SpiderTimeouts {
                status: Duration::from_secs(num("SPIDER_STATUS_TIMEOUT_SECS", defaults.status.as_secs())?),
                control: Duration::from_secs(num("SPIDER_CONTROL_TIMEOUT_SECS", defaults.control.as_secs())?),
                create: Duration::from_secs(num("SPIDER_CREATE_TIMEOUT_SECS", defaults.create.as_secs())?),
            },
            monitoring_url: var("MONITORING_URL").unwrap_or_else(|| "http://localhost:9090".to_string()),
            monitoring_timeout: Duration::from_secs(num("MONITORING_TIMEOUT_SECS", 30)?),
            autoscaler_interval: Duration::from_secs(num("AUTOSCALER_INTERVAL_SECS", 10)?.max(1)),
            ssh_key_file: var("SSH_KEY_FILE"),
            ssh_timeout: Duration::from_secs(num("SSH_TIMEOUT_SECS", 120)?),
            tuning: Tuning {
                control_stagger: Duration::from_millis(num(
                    "CONTROL_STAGGER_MS",
                    tuning_defaults.control_stagger.as_millis() as u64,
                )?),
                status_retry_delay: Duration::from_millis(num(
                    "STATUS_RETRY_DELAY_MS",
                    tuning_defaults.status_retry_delay.as_millis() as u64,
                )?),
                hold_poll: Duration::from_secs(num("HOLD_POLL_SECS", tuning_defaults.hold_poll.as_secs())?.max(1)),
                ssh_user: var("SSH_USER").unwrap_or(tuning_defaults.ssh_user),
            },
        })
    }
}
