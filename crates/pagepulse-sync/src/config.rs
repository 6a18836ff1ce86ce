//! Engine configuration, loaded from an optional TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_API_BASE_URL: &str = "https://graph.facebook.com/v18.0";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum concurrent page pipelines.
    pub max_workers: usize,

    /// Look-back window when a page has no sync cursor yet.
    pub first_run_days: i64,

    /// Look-back window once a cursor exists.
    pub subsequent_run_days: i64,

    /// Minimum spacing between outbound calls, per worker.
    pub min_call_interval_ms: u64,

    /// Per-request HTTP timeout. A stalled call must not hold a worker
    /// slot forever.
    pub http_timeout_secs: u64,

    /// Items requested per page turn.
    pub page_size: usize,

    pub api_base_url: String,
    pub database: PathBuf,
    pub tokens: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            first_run_days: 7,
            subsequent_run_days: 2,
            min_call_interval_ms: 100,
            http_timeout_secs: 30,
            page_size: 100,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            database: PathBuf::from("pagepulse.db"),
            tokens: PathBuf::from("tokens.json"),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file, defaulting when absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn min_call_interval(&self) -> Duration {
        Duration::from_millis(self.min_call_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Look-back window for one page, given whether a cursor exists.
    pub fn lookback_days(&self, has_cursor: bool) -> i64 {
        if has_cursor {
            self.subsequent_run_days
        } else {
            self.first_run_days
        }
    }
}
