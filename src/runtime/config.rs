//! Runtime configuration types.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `clock` | [`ClockMode::Wall`] |
//! | `default_queue_capacity` | 100 000 |
//! | `max_steps` | 0 (unbounded) |
//!
//! Configuration can come from three places, in ascending precedence:
//! built-in defaults, a JSON file via [`RuntimeConfig::from_json_file`], and
//! `STEPLINE_*` environment variables via [`RuntimeConfig::apply_env`].

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Environment variable selecting the clock mode (`wall` or `virtual`).
pub const ENV_CLOCK: &str = "STEPLINE_CLOCK";
/// Environment variable overriding the default message queue capacity.
pub const ENV_QUEUE_CAPACITY: &str = "STEPLINE_QUEUE_CAPACITY";
/// Environment variable overriding the scheduler step valve.
pub const ENV_MAX_STEPS: &str = "STEPLINE_MAX_STEPS";

/// How the runtime observes time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    /// Real time; `run()` sleeps until the next timer deadline.
    Wall,
    /// Virtual time; `run()` jumps straight to the next timer deadline.
    /// Deterministic, and the only sensible mode for tests.
    Virtual,
}

/// Runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Clock mode driving `run()`.
    pub clock: ClockMode,
    /// Capacity used for message queues created without an explicit one.
    pub default_queue_capacity: usize,
    /// Maximum scheduler jobs dispatched per `run()` (0 = unbounded).
    ///
    /// A safety valve against runaway step loops; when the valve trips the
    /// run loop logs a warning and returns.
    pub max_steps: u64,
}

impl RuntimeConfig {
    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.default_queue_capacity == 0 {
            self.default_queue_capacity = 1;
        }
    }

    /// Sets the clock mode.
    #[must_use]
    pub const fn with_clock(mut self, clock: ClockMode) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the default message queue capacity.
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.default_queue_capacity = capacity;
        self
    }

    /// Sets the scheduler step valve.
    #[must_use]
    pub const fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Loads configuration from a JSON file, then normalizes it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}", path.display())).with_source(e))?;
        let mut config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("cannot parse {}", path.display())).with_source(e))?;
        config.normalize();
        Ok(config)
    }

    /// Applies `STEPLINE_*` environment variable overrides.
    ///
    /// Only variables that are set are applied. Returns an error if a
    /// variable is set but holds an unparseable value.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var(ENV_CLOCK) {
            self.clock = match val.trim().to_ascii_lowercase().as_str() {
                "wall" => ClockMode::Wall,
                "virtual" => ClockMode::Virtual,
                other => {
                    return Err(Error::config(format!(
                        "invalid value for {ENV_CLOCK}: expected wall or virtual, got {other:?}"
                    )))
                }
            };
        }
        if let Ok(val) = std::env::var(ENV_QUEUE_CAPACITY) {
            self.default_queue_capacity = parse_number(ENV_QUEUE_CAPACITY, &val)?;
        }
        if let Ok(val) = std::env::var(ENV_MAX_STEPS) {
            self.max_steps = parse_number(ENV_MAX_STEPS, &val)?;
        }
        self.normalize();
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(var_name: &str, val: &str) -> Result<T> {
    val.trim().parse::<T>().map_err(|_| {
        Error::config(format!(
            "invalid value for {var_name}: expected unsigned integer, got {val:?}"
        ))
    })
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            clock: ClockMode::Wall,
            default_queue_capacity: 100_000,
            max_steps: 0,
        }
    }
}
