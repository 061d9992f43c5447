use anyhow::{bail, Result};
use std::time::Duration;

const DEFAULT_MAX_MESSAGE_LENGTH: usize = 4000;
/// Message length the transport itself enforces.
pub(crate) const TRANSPORT_HARD_CAP: usize = 4096;
const DEFAULT_MIN_UPDATE_INTERVAL_MS: u64 = 2000;
const DEFAULT_MAX_RATE_LIMIT_WAIT_MS: u64 = 10_000;
const DEFAULT_CONTEXT_LIMIT: u64 = 200_000;
const DEFAULT_OVERFLOW_RELAX_FACTOR: f64 = 1.5;

/// Runtime limits for the streaming pipeline.
///
/// All values can be overridden through `STREAMGATE_*` environment variables;
/// the defaults match the transport constraints (4096-char messages, ~30
/// edits per minute per chat).
#[derive(Debug, Clone)]
pub struct Config {
    /// Working per-message length limit; kept below the transport hard cap.
    pub max_message_length: usize,
    /// Minimum spacing between edits of the same message.
    pub min_update_interval: Duration,
    /// Longest transport-indicated rate-limit wait we honor inline.
    pub max_rate_limit_wait: Duration,
    /// Context window used for the token usage display.
    pub context_limit: u64,
    /// Split-threshold multiplier applied right after a continuation message
    /// is created, so one oversized chunk does not spawn a tiny "Part N".
    pub overflow_relax_factor: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            min_update_interval: Duration::from_millis(DEFAULT_MIN_UPDATE_INTERVAL_MS),
            max_rate_limit_wait: Duration::from_millis(DEFAULT_MAX_RATE_LIMIT_WAIT_MS),
            context_limit: DEFAULT_CONTEXT_LIMIT,
            overflow_relax_factor: DEFAULT_OVERFLOW_RELAX_FACTOR,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let defaults = Self::default();

        let max_message_length = env_parse("STREAMGATE_MAX_MESSAGE_LENGTH")?
            .unwrap_or(defaults.max_message_length);
        let min_update_interval = env_parse("STREAMGATE_MIN_UPDATE_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.min_update_interval);
        let max_rate_limit_wait = env_parse("STREAMGATE_MAX_RATE_LIMIT_WAIT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_rate_limit_wait);
        let context_limit =
            env_parse("STREAMGATE_CONTEXT_LIMIT")?.unwrap_or(defaults.context_limit);
        let overflow_relax_factor = env_parse("STREAMGATE_OVERFLOW_RELAX_FACTOR")?
            .unwrap_or(defaults.overflow_relax_factor);

        Ok(Self {
            max_message_length,
            min_update_interval,
            max_rate_limit_wait,
            context_limit,
            overflow_relax_factor,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_message_length == 0 || self.max_message_length > TRANSPORT_HARD_CAP {
            bail!(
                "Invalid max_message_length {}: expected 1..={}",
                self.max_message_length,
                TRANSPORT_HARD_CAP
            );
        }

        if self.min_update_interval.is_zero() {
            bail!("min_update_interval must be positive");
        }

        if self.max_rate_limit_wait < self.min_update_interval {
            bail!(
                "max_rate_limit_wait {:?} must not be shorter than min_update_interval {:?}",
                self.max_rate_limit_wait,
                self.min_update_interval
            );
        }

        if self.overflow_relax_factor < 1.0 {
            bail!(
                "overflow_relax_factor {} must be at least 1.0",
                self.overflow_relax_factor
            );
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            match trimmed.parse() {
                Ok(value) => Ok(Some(value)),
                Err(_) => bail!("Invalid value '{raw}' for {name}"),
            }
        }
        Err(_) => Ok(None),
    }
}
