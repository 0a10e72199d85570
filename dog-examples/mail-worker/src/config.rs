use anyhow::{bail, Context, Result};
use dog_mail::HttpEmailConfig;
use dog_queue::{BackoffPolicy, QueueConfig, WorkerConfig};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Where jobs are stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueTarget {
    /// In-process store; jobs die with the process
    Memory,
    /// Redis instance at the given URL
    Redis(String),
}

impl FromStr for QueueTarget {
    type Err = anyhow::Error;

    fn from_str(url: &str) -> Result<Self> {
        if url.starts_with("memory://") {
            Ok(Self::Memory)
        } else if url.starts_with("redis://") || url.starts_with("rediss://") {
            Ok(Self::Redis(url.to_string()))
        } else {
            bail!("unsupported QUEUE_URL scheme: {}", url)
        }
    }
}

/// How notifications leave the process
#[derive(Debug, Clone)]
pub enum MailTarget {
    /// Log and keep in memory instead of sending
    Recording,
    Http(HttpEmailConfig),
}

/// Worker process settings, read from the environment
#[derive(Debug, Clone)]
pub struct Settings {
    pub queue_target: QueueTarget,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub mail: MailTarget,
}

impl Settings {
    /// Read every setting, falling back to defaults for anything unset
    pub fn from_env() -> Result<Self> {
        let queue_target = env::var("QUEUE_URL")
            .unwrap_or_else(|_| "memory://".to_string())
            .parse()?;

        Ok(Self {
            queue_target,
            queue: queue_config()?,
            worker: worker_config()?,
            mail: mail_target()?,
        })
    }
}

/// Queue name, visibility timeout and retry backoff
fn queue_config() -> Result<QueueConfig> {
    let name = env::var("QUEUE_NAME").unwrap_or_else(|_| "emails".to_string());
    let lease_duration = env_or("QUEUE_LEASE_DURATION_SECS", 300)?;
    let base_retry_backoff = env_or("QUEUE_BASE_RETRY_BACKOFF_SECS", 1)?;
    let max_retry_backoff = env_or("QUEUE_MAX_RETRY_BACKOFF_SECS", 3600)?;
    let poll_interval = env_or("QUEUE_POLL_INTERVAL_MS", 250)?;

    Ok(QueueConfig::new(name)
        .with_lease_duration(Duration::from_secs(lease_duration))
        .with_backoff(BackoffPolicy::new(
            Duration::from_secs(base_retry_backoff),
            Duration::from_secs(max_retry_backoff),
        ))
        .with_poll_interval(Duration::from_millis(poll_interval)))
}

/// Worker loop count and timings
fn worker_config() -> Result<WorkerConfig> {
    let name = env::var("WORKER_NAME").unwrap_or_else(|_| "mail-worker".to_string());
    let concurrency = env_or("WORKER_CONCURRENCY", 4)?;
    let lease_wait = env_or("WORKER_LEASE_WAIT_SECS", 5)?;
    let reaper_interval: u64 = env_or("WORKER_REAPER_INTERVAL_SECS", 30)?;
    let heartbeat_interval: u64 = env_or("WORKER_HEARTBEAT_INTERVAL_SECS", 0)?;

    let mut config = WorkerConfig::new(name)
        .with_concurrency(concurrency)
        .with_lease_wait(Duration::from_secs(lease_wait));

    // 0 turns the task off
    config = if reaper_interval == 0 {
        config.without_reaper()
    } else {
        config.with_reaper_interval(Duration::from_secs(reaper_interval))
    };
    if heartbeat_interval > 0 {
        config = config.with_heartbeat_interval(Duration::from_secs(heartbeat_interval));
    }
    Ok(config)
}

fn mail_target() -> Result<MailTarget> {
    match env::var("MAIL_PROVIDER").unwrap_or_else(|_| "http".to_string()).as_str() {
        "recording" => Ok(MailTarget::Recording),
        "http" => Ok(MailTarget::Http(
            HttpEmailConfig::from_env().context("email provider settings")?,
        )),
        other => bail!("unsupported MAIL_PROVIDER: {}", other),
    }
}

/// Parse `key`, or return `default` when it is unset
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}
