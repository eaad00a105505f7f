//! Key exchanger options.
//!
//! Options can be built in code, deserialized (durations as seconds, PSK
//! as base64url) or read from `RIFT_REKEY_*` environment variables.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Deserializer};

use crate::error::KeyExchangeError;
use crate::psk::Psk;

/// Default spacing between completed rounds.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Default grace period after `interval` before a round is declared stalled.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default period of the rotation loop.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

pub const ENV_INTERVAL_SECS: &str = "RIFT_REKEY_INTERVAL_SECS";
pub const ENV_TIMEOUT_SECS: &str = "RIFT_REKEY_TIMEOUT_SECS";
pub const ENV_TICK_MS: &str = "RIFT_REKEY_TICK_MS";
pub const ENV_PSK: &str = "RIFT_REKEY_PSK";

/// Options for a key exchanger.
///
/// A zero `interval` or `timeout` means "use the default".
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeyExchangeOptions {
    #[serde(deserialize_with = "duration_from_secs")]
    interval: Duration,
    #[serde(deserialize_with = "duration_from_secs")]
    timeout: Duration,
    #[serde(deserialize_with = "duration_from_secs")]
    tick: Duration,
    #[serde(deserialize_with = "psk_from_base64")]
    psk: Option<Psk>,
}

impl Default for KeyExchangeOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            tick: DEFAULT_TICK,
            psk: None,
        }
    }
}

impl KeyExchangeOptions {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_psk(mut self, psk: impl Into<Vec<u8>>) -> Self {
        self.psk = Some(Psk::new(psk));
        self
    }

    pub fn interval(&self) -> Duration {
        if self.interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            self.interval
        }
    }

    pub fn timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.timeout
        }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// The configured PSK, if any non-empty one is set.
    pub fn psk(&self) -> Option<&Psk> {
        self.psk.as_ref().filter(|p| !p.is_empty())
    }

    pub fn validate(&self) -> Result<(), KeyExchangeError> {
        if self.tick.is_zero() {
            return Err(KeyExchangeError::config("tick must be non-zero"));
        }
        Ok(())
    }

    /// Read options from the process environment.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, KeyExchangeError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read options through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, KeyExchangeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();

        if let Some(secs) = parse_var::<u64>(&lookup, ENV_INTERVAL_SECS)? {
            options.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_TIMEOUT_SECS)? {
            options.timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_TICK_MS)? {
            options.tick = Duration::from_millis(ms);
        }
        if let Some(encoded) = lookup(ENV_PSK) {
            let bytes = URL_SAFE_NO_PAD
                .decode(encoded.trim())
                .map_err(|e| KeyExchangeError::config(format!("{ENV_PSK}: {e}")))?;
            options.psk = Some(Psk::new(bytes));
        }

        options.validate()?;
        Ok(options)
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, KeyExchangeError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| KeyExchangeError::config(format!("{key}: {e}")))
        })
        .transpose()
}

fn duration_from_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

fn psk_from_base64<'de, D>(deserializer: D) -> Result<Option<Psk>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded: Option<String> = Option::deserialize(deserializer)?;
    encoded
        .map(|s| {
            URL_SAFE_NO_PAD
                .decode(s.as_bytes())
                .map(Psk::new)
                .map_err(serde::de::Error::custom)
        })
        .transpose()
}
