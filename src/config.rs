//! Bridge configuration

use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Retry and paging policy for full synchronization.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How many times a transient remote failure is retried before the
    /// sync run gives up.
    pub max_retries: u32,
    /// Delay before the first retry; doubled after every failure.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Messages requested per page while enumerating.
    pub page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            page_size: 150,
        }
    }
}

impl SyncConfig {
    /// Backoff to wait before retry number `attempt` (starting at 1).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Live event polling.
#[derive(Debug, Clone)]
pub struct EventConfig {
    pub period: Duration,
    /// Upper bound of the random delay added to every period.
    pub jitter: Duration,
    /// Capacity of a session's event channel. Producers wait when it is
    /// full.
    pub buffer: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(20),
            jitter: Duration::ZERO,
            buffer: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub vault_dir: PathBuf,
    pub sync: SyncConfig,
    pub events: EventConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            vault_dir: PathBuf::from(".bridge-vault"),
            sync: SyncConfig::default(),
            events: EventConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load bridge configuration from environment variables
    ///
    /// Reads from `.env` file if present. All variables are optional:
    /// - `BRIDGE_VAULT_DIR` (default: `.bridge-vault`)
    /// - `BRIDGE_SYNC_MAX_RETRIES` (default: `5`)
    /// - `BRIDGE_SYNC_BACKOFF_MS` (default: `500`)
    /// - `BRIDGE_SYNC_MAX_BACKOFF_MS` (default: `30000`)
    /// - `BRIDGE_SYNC_PAGE_SIZE` (default: `150`)
    /// - `BRIDGE_EVENT_PERIOD_MS` (default: `20000`)
    /// - `BRIDGE_EVENT_JITTER_MS` (default: `0`)
    /// - `BRIDGE_EVENT_BUFFER` (default: `64`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let config = Self {
            vault_dir: env::var("BRIDGE_VAULT_DIR").map_or(defaults.vault_dir, PathBuf::from),
            sync: SyncConfig {
                max_retries: var_or("BRIDGE_SYNC_MAX_RETRIES", defaults.sync.max_retries)?,
                initial_backoff: millis_or(
                    "BRIDGE_SYNC_BACKOFF_MS",
                    defaults.sync.initial_backoff,
                )?,
                max_backoff: millis_or("BRIDGE_SYNC_MAX_BACKOFF_MS", defaults.sync.max_backoff)?,
                page_size: var_or("BRIDGE_SYNC_PAGE_SIZE", defaults.sync.page_size)?,
            },
            events: EventConfig {
                period: millis_or("BRIDGE_EVENT_PERIOD_MS", defaults.events.period)?,
                jitter: millis_or("BRIDGE_EVENT_JITTER_MS", defaults.events.jitter)?,
                buffer: var_or("BRIDGE_EVENT_BUFFER", defaults.events.buffer)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.sync.page_size == 0 {
            return Err(Error::Config("BRIDGE_SYNC_PAGE_SIZE must be positive".into()));
        }
        if self.events.buffer == 0 {
            return Err(Error::Config("BRIDGE_EVENT_BUFFER must be positive".into()));
        }
        Ok(())
    }
}

fn var_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env::var(name).map_or(Ok(default), |raw| {
        raw.parse()
            .map_err(|e| Error::Config(format!("Invalid {name}: {e}")))
    })
}

fn millis_or(name: &str, default: Duration) -> Result<Duration> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    var_or(name, default_ms).map(Duration::from_millis)
}
