use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

// Reconciler configuration sourced from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Downstream cluster this instance reconciles bindings for.
    pub cluster_name: String,
    pub storage: StorageBackend,
    // Requeue delay after a successful reconcile.
    pub requeue: Duration,
    // Requeue delay after a failed reconcile.
    pub error_requeue: Duration,
    pub conflict_retry: RetryPolicy,
    // Max concurrent reconciles per watched kind.
    pub concurrency: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Kubernetes,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "memory" => Ok(StorageBackend::Memory),
            "kubernetes" | "k8s" => Ok(StorageBackend::Kubernetes),
            other => bail!("unknown storage backend {other:?}"),
        }
    }
}

const DEFAULT_REQUEUE_SECS: u64 = 300;
const DEFAULT_ERROR_REQUEUE_SECS: u64 = 15;
const DEFAULT_CONFLICT_RETRY_STEPS: u32 = 5;
const DEFAULT_CONFLICT_RETRY_MS: u64 = 10;
const DEFAULT_CONCURRENCY: u16 = 4;

#[derive(Debug, Deserialize)]
struct ReconcilerConfigOverride {
    metrics_bind: Option<String>,
    cluster_name: Option<String>,
    storage: Option<StorageBackend>,
    requeue_secs: Option<u64>,
    error_requeue_secs: Option<u64>,
    conflict_retry_steps: Option<u32>,
    conflict_retry_ms: Option<u64>,
    concurrency: Option<u16>,
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|err| anyhow::anyhow!("{err}"))
            .with_context(|| format!("parse {key}")),
        Err(_) => Ok(default),
    }
}

impl ReconcilerConfig {
    pub fn from_env() -> Result<Self> {
        let metrics_bind = std::env::var("TRELLIS_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse TRELLIS_METRICS_BIND")?;
        let cluster_name =
            std::env::var("TRELLIS_CLUSTER_NAME").unwrap_or_else(|_| "local".to_string());
        let storage = env_or("TRELLIS_STORAGE", StorageBackend::Kubernetes)?;
        let requeue = Duration::from_secs(env_or("TRELLIS_REQUEUE_SECS", DEFAULT_REQUEUE_SECS)?);
        let error_requeue = Duration::from_secs(env_or(
            "TRELLIS_ERROR_REQUEUE_SECS",
            DEFAULT_ERROR_REQUEUE_SECS,
        )?);
        let conflict_retry = RetryPolicy {
            steps: env_or("TRELLIS_CONFLICT_RETRY_STEPS", DEFAULT_CONFLICT_RETRY_STEPS)?,
            interval: Duration::from_millis(env_or(
                "TRELLIS_CONFLICT_RETRY_MS",
                DEFAULT_CONFLICT_RETRY_MS,
            )?),
        };
        let concurrency = env_or("TRELLIS_CONCURRENCY", DEFAULT_CONCURRENCY)?;
        let config = Self {
            metrics_bind,
            cluster_name,
            storage,
            requeue,
            error_requeue,
            conflict_retry,
            concurrency,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("TRELLIS_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read TRELLIS_CONFIG: {path}"))?;
            let override_cfg: ReconcilerConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse reconciler config yaml")?;
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.cluster_name {
                config.cluster_name = value;
            }
            if let Some(value) = override_cfg.storage {
                config.storage = value;
            }
            if let Some(value) = override_cfg.requeue_secs {
                config.requeue = Duration::from_secs(value);
            }
            if let Some(value) = override_cfg.error_requeue_secs {
                config.error_requeue = Duration::from_secs(value);
            }
            if let Some(value) = override_cfg.conflict_retry_steps {
                config.conflict_retry.steps = value;
            }
            if let Some(value) = override_cfg.conflict_retry_ms {
                config.conflict_retry.interval = Duration::from_millis(value);
            }
            if let Some(value) = override_cfg.concurrency {
                config.concurrency = value;
            }
            config.validate()?;
        }
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            bail!("cluster name must not be empty");
        }
        if self.conflict_retry.steps == 0 {
            bail!("conflict retry steps must be at least 1");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        Ok(())
    }
}
