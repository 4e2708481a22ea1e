use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use jobhub_realtime::dedup::DEFAULT_BUSY_WINDOW;
use jobhub_realtime::reconnect::DEFAULT_RETRY_DELAY;
use jobhub_realtime::{BackoffPolicy, DedupPolicy, RealtimeConfig};

const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Daemon settings, read from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub realtime_url: String,
    pub api_key: String,
    pub api_url: String,
    pub store_path: PathBuf,
    pub realtime: RealtimeConfig,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let realtime_url = var("JOBHUB_REALTIME_URL").context("JOBHUB_REALTIME_URL is not set")?;
        let api_key = var("JOBHUB_API_KEY").unwrap_or_default();
        let api_url = var("JOBHUB_API_URL").unwrap_or_else(|| "http://localhost:8000/api".into());
        let store_path = var("JOBHUB_STORE_PATH").unwrap_or_else(|| "jobhub.db".into());

        let millis = |key: &str, default: Duration| -> Result<Duration> {
            match var(key) {
                Some(raw) => Ok(Duration::from_millis(
                    raw.trim()
                        .parse()
                        .with_context(|| format!("{} must be milliseconds, got {:?}", key, raw))?,
                )),
                None => Ok(default),
            }
        };
        let delay = millis("JOBHUB_RECONNECT_DELAY_MS", DEFAULT_RETRY_DELAY)?;
        let max = millis("JOBHUB_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX)?;

        let mut realtime = RealtimeConfig::default();
        realtime.join_timeout = millis("JOBHUB_JOIN_TIMEOUT_MS", realtime.join_timeout)?;
        realtime.backoff = match var("JOBHUB_BACKOFF").as_deref().unwrap_or("fixed") {
            "fixed" => BackoffPolicy::Fixed(delay),
            "exponential" => BackoffPolicy::Exponential { base: delay, max },
            "jittered" => BackoffPolicy::Jittered { base: delay, max },
            other => bail!("Unknown JOBHUB_BACKOFF {:?}", other),
        };
        realtime.dedup = match var("JOBHUB_DEDUP").as_deref().unwrap_or("idempotent") {
            "idempotent" => DedupPolicy::default(),
            "busy-window" => DedupPolicy::BusyWindow(DEFAULT_BUSY_WINDOW),
            other => bail!("Unknown JOBHUB_DEDUP {:?}", other),
        };

        Ok(Self {
            realtime_url,
            api_key,
            api_url,
            store_path: PathBuf::from(store_path),
            realtime,
        })
    }
}
