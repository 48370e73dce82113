//! Configuration for the pressure link using Figment.
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Built-in defaults (`Settings::default()`)
//! 2. An optional TOML file (`pressure_link.toml` unless a path is given)
//! 3. Environment variables prefixed with `PRESSURE_LINK_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! PRESSURE_LINK_LOG_LEVEL=debug
//! PRESSURE_LINK_LINK__PORT=/dev/ttyACM0
//! PRESSURE_LINK_LINK__BAUD_RATE=115200
//! ```
//!
//! # Example file
//!
//! ```toml
//! log_level = "info"
//!
//! [link]
//! port = "/dev/ttyUSB0"
//! baud_rate = 9600
//! poll_interval_ms = 100
//! read_timeout_ms = 1000
//! join_timeout_ms = 2000
//! ```
//!
//! None of this is consulted by `LinkManager` itself: the manager only takes a
//! `LinkTimings`, and the port/baud pair is always supplied at `connect` time.

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, SettingsError};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "pressure_link.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "PRESSURE_LINK_";

/// Baud rates offered to a consumer for selection.
pub const STANDARD_BAUD_RATES: [u32; 4] = [9600, 19200, 38400, 115200];

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Logging level used when `RUST_LOG` is not set (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Serial link settings
    #[serde(default)]
    pub link: LinkSettings,
}

/// Serial link defaults and timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSettings {
    /// Port to use when none is given on the command line
    #[serde(default)]
    pub port: Option<String>,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Sleep between receive polls when no bytes are waiting
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Read timeout handed to the serial driver
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// How long `disconnect` waits for the receiver before forcing release
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    STANDARD_BAUD_RATES[0]
}

fn default_poll_interval() -> u64 {
    100
}

fn default_read_timeout() -> u64 {
    1000
}

fn default_join_timeout() -> u64 {
    2000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            link: LinkSettings::default(),
        }
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            poll_interval_ms: default_poll_interval(),
            read_timeout_ms: default_read_timeout(),
            join_timeout_ms: default_join_timeout(),
        }
    }
}

impl Settings {
    /// Load settings from defaults, the TOML file and the environment.
    ///
    /// A missing file is not an error; `Toml::file` simply contributes nothing.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let settings: Settings = Self::figment(path).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// The layered provider stack, exposed for inspection.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Reject values that would make the link unusable.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let link = &self.link;
        if link.baud_rate == 0 {
            return Err(SettingsError::Validation(
                "link.baud_rate must be positive".to_string(),
            ));
        }
        if link.poll_interval_ms == 0 {
            return Err(SettingsError::Validation(
                "link.poll_interval_ms must be positive".to_string(),
            ));
        }
        if link.read_timeout_ms == 0 {
            return Err(SettingsError::Validation(
                "link.read_timeout_ms must be positive".to_string(),
            ));
        }
        if link.join_timeout_ms == 0 {
            return Err(SettingsError::Validation(
                "link.join_timeout_ms must be positive".to_string(),
            ));
        }
        link.timings()
            .validate()
            .map_err(|e| SettingsError::Validation(e.to_string()))?;
        if matches!(&link.port, Some(p) if p.trim().is_empty()) {
            return Err(SettingsError::Validation(
                "link.port must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

/// Runtime timing knobs for `LinkManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimings {
    /// Sleep between polls when nothing is waiting; also bounds stop latency
    pub poll_interval: Duration,
    /// Read timeout on the opened handle
    pub read_timeout: Duration,
    /// Upper bound on how long `disconnect` waits for the receiver thread
    pub join_timeout: Duration,
}

impl Default for LinkTimings {
    fn default() -> Self {
        LinkSettings::default().timings()
    }
}

impl LinkTimings {
    /// Longest time a healthy receiver needs to notice the stop flag: one
    /// poll sleep plus one bounded read.
    pub fn stop_latency(&self) -> Duration {
        self.poll_interval + self.read_timeout
    }

    /// Require `join_timeout` to outlast [`stop_latency`](Self::stop_latency).
    ///
    /// A shorter join timeout would make `disconnect` give up on receivers
    /// that are about to exit, leaving their read handle open.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let minimum = self.stop_latency();
        if self.join_timeout <= minimum {
            return Err(ConfigError::JoinTimeoutTooShort {
                join_timeout: self.join_timeout,
                minimum,
            });
        }
        Ok(())
    }
}

impl LinkSettings {
    /// Convert millisecond settings into durations.
    pub fn timings(&self) -> LinkTimings {
        LinkTimings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            join_timeout: Duration::from_millis(self.join_timeout_ms),
        }
    }
}
