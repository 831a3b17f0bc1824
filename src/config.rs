//! Runtime configuration
//!
//! nfregex is configured entirely through environment variables, matching
//! the way its supervisor launches it:
//!
//! - `NFREGEX_NTHREADS`: number of worker threads (default 1)
//! - `NFREGEX_MATCH_MODE`: `stream` or `block` (default `stream`)
//! - `NFREGEX_FAIL_OPEN`: `1` to accept packets on queue overflow and
//!   scan-engine failure, anything else fails closed (default closed)
//! - `NFREGEX_QUEUE_NUM`: first queue number to try binding (default 1000)

use tracing::debug;

use crate::error::ConfigError;

/// First queue number probed when `NFREGEX_QUEUE_NUM` is unset.
pub const DEFAULT_QUEUE_BASE: u16 = 1000;

/// How payload chunks are scanned against the ruleset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Per-stream matcher state persists across packets; patterns may span
    /// packet boundaries. Only meaningful for TCP.
    Stream,
    /// Every payload chunk is scanned independently.
    Block,
}

/// Runtime knobs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker threads servicing the queue.
    pub workers: usize,
    /// Streaming or block matching.
    pub match_mode: MatchMode,
    /// Accept (true) or drop (false) when the decision path fails.
    pub fail_open: bool,
    /// First queue number to try binding.
    pub queue_base: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 1,
            match_mode: MatchMode::Stream,
            fail_open: false,
            queue_base: DEFAULT_QUEUE_BASE,
        }
    }
}

impl Config {
    /// Load configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set to an unusable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    ///
    /// Split out from [`Config::from_env`] so tests do not have to mutate
    /// process-global environment state.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(threads) = var("NFREGEX_NTHREADS") {
            let parsed: usize = threads
                .parse()
                .map_err(|_| ConfigError::env("NFREGEX_NTHREADS", format!("not a number: {threads}")))?;
            if parsed == 0 {
                return Err(ConfigError::env("NFREGEX_NTHREADS", "must be at least 1"));
            }
            config.workers = parsed;
        }

        if let Some(mode) = var("NFREGEX_MATCH_MODE") {
            config.match_mode = match mode.as_str() {
                "stream" => MatchMode::Stream,
                "block" => MatchMode::Block,
                other => {
                    return Err(ConfigError::env(
                        "NFREGEX_MATCH_MODE",
                        format!("expected 'stream' or 'block', got {other:?}"),
                    ))
                }
            };
        }

        if let Some(fail_open) = var("NFREGEX_FAIL_OPEN") {
            config.fail_open = fail_open == "1";
        }

        if let Some(queue) = var("NFREGEX_QUEUE_NUM") {
            config.queue_base = queue
                .parse()
                .map_err(|_| ConfigError::env("NFREGEX_QUEUE_NUM", format!("not a queue number: {queue}")))?;
        }

        debug!(
            workers = config.workers,
            mode = ?config.match_mode,
            fail_open = config.fail_open,
            queue_base = config.queue_base,
            "configuration resolved"
        );

        Ok(config)
    }
}
