use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

pub const TELEGRAM_DEFAULT_API_BASE_URL: &str = "https://api.telegram.org";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bot_token: String,
    pub api_base: String,
    pub output_dir: PathBuf,

    pub max_send_bytes: u64,
    pub workers: usize,
    pub queue_capacity: usize,

    pub pending_ttl: Duration,
    pub expired_retention: Duration,
    pub sweep_interval: Duration,
    pub edit_interval: Duration,
    pub audio_headroom: f64,
    pub probe_timeout: Duration,

    pub ytdlp_bin: String,
    pub ffmpeg_bin: String,
    pub concurrent_fragments: u32,

    pub log_chat_id: Option<i64>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bot_token = lookup("BOT_TOKEN")
            .filter(|v| !v.trim().is_empty())
            .context("Missing required env var: BOT_TOKEN")?;
        let api_base = lookup("TELEGRAM_API_BASE")
            .unwrap_or_else(|| TELEGRAM_DEFAULT_API_BASE_URL.to_string());
        let output_dir = PathBuf::from(lookup("OUTPUT_DIR").unwrap_or_else(|| "downloads".to_string()));

        let max_send_bytes: u64 = parse_or(&lookup, "MAX_SEND_BYTES", 50 * 1024 * 1024)?;
        let workers: usize = parse_or(&lookup, "WORKERS", 2)?;
        let queue_capacity: usize = parse_or(&lookup, "QUEUE_CAPACITY", 32)?;
        let pending_ttl_secs: u64 = parse_or(&lookup, "PENDING_TTL_SECS", 600)?;
        let expired_retention_secs: u64 = parse_or(&lookup, "EXPIRED_RETENTION_SECS", 3600)?;
        let sweep_interval_secs: u64 = parse_or(&lookup, "SWEEP_INTERVAL_SECS", 60)?;
        let edit_interval_ms: u64 = parse_or(&lookup, "EDIT_INTERVAL_MS", 1800)?;
        let audio_headroom: f64 = parse_or(&lookup, "AUDIO_HEADROOM", mediaplan::DEFAULT_AUDIO_HEADROOM)?;
        let probe_timeout_secs: u64 = parse_or(&lookup, "PROBE_TIMEOUT_SECS", 10)?;
        let concurrent_fragments: u32 = parse_or(&lookup, "YTDLP_CONCURRENT_FRAGMENTS", 4)?;

        let log_chat_id = match lookup("LOG_CHAT_ID").filter(|v| !v.trim().is_empty()) {
            Some(v) => Some(v.trim().parse::<i64>().context("LOG_CHAT_ID must be a chat id")?),
            None => None,
        };

        // fail fast on values that would wedge the pipeline
        if !api_base.starts_with("http://") && !api_base.starts_with("https://") {
            bail!("TELEGRAM_API_BASE must start with http:// or https://");
        }
        if max_send_bytes == 0 {
            bail!("MAX_SEND_BYTES must be > 0");
        }
        if workers == 0 {
            bail!("WORKERS must be > 0");
        }
        if queue_capacity == 0 {
            bail!("QUEUE_CAPACITY must be > 0");
        }
        if pending_ttl_secs == 0 {
            bail!("PENDING_TTL_SECS must be > 0");
        }
        if !(0.0..1.0).contains(&audio_headroom) {
            bail!("AUDIO_HEADROOM must be in [0, 1)");
        }

        Ok(Self {
            bot_token,
            api_base,
            output_dir,
            max_send_bytes,
            workers,
            queue_capacity,
            pending_ttl: Duration::from_secs(pending_ttl_secs),
            expired_retention: Duration::from_secs(expired_retention_secs),
            sweep_interval: Duration::from_secs(sweep_interval_secs.max(1)),
            edit_interval: Duration::from_millis(edit_interval_ms),
            audio_headroom,
            probe_timeout: Duration::from_secs(probe_timeout_secs.max(1)),
            ytdlp_bin: lookup("YTDLP_BIN").unwrap_or_else(|| "yt-dlp".to_string()),
            ffmpeg_bin: lookup("FFMPEG_BIN").unwrap_or_else(|| "ffmpeg".to_string()),
            concurrent_fragments: concurrent_fragments.max(1),
            log_chat_id,
        })
    }

    pub fn plan_policy(&self) -> mediaplan::PlanPolicy {
        mediaplan::PlanPolicy {
            ceiling: self.max_send_bytes,
            audio_headroom: self.audio_headroom,
        }
    }

    pub fn store_config(&self) -> choicestore::StoreConfig {
        choicestore::StoreConfig {
            expired_retention: self.expired_retention,
            ..choicestore::StoreConfig::new(self.pending_ttl)
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(v) => v
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid value for {key} ({v:?}): {e}")),
    }
}
