// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bridge configuration.
//!
//! Values come from a YAML file, optionally overridden by `ESPLOGBRIDGE_*` environment
//! variables where `__` separates nested keys (e.g. `ESPLOGBRIDGE_LOKI__URL`).
//!
//! ```yaml
//! listen: ":5514"
//! input:
//!   udp:
//!     queue_size: 100
//! loki:
//!   url: http://loki:3100/loki/api/v1/push
//!   timeout: 2s
//!   labels:
//!     job: esphome
//!   batch:
//!     max_items: 50
//!     max_wait: 1s
//!   headers:
//!     X-Scope-OrgID: home
//! devices:
//!   192.168.1.20: porch
//! ```
//!
//! Absent, zero or empty values take their defaults. Durations longer than a day are rejected.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Deserializer};

use crate::devices::DeviceRegistry;
use crate::errors::ConfigError;

pub const DEFAULT_QUEUE_SIZE: usize = 100;
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_JOB: &str = "esphome";
pub const DEFAULT_BATCH_MAX_ITEMS: usize = 50;
pub const DEFAULT_BATCH_MAX_WAIT: Duration = Duration::from_secs(1);
pub const DEFAULT_LOG_LEVEL: &str = "info";
/// Upper bound for configured durations.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

const ENV_PREFIX: &str = "ESPLOGBRIDGE_";
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Validated, immutable bridge configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// UDP listen address, e.g. `0.0.0.0:5514` or `:5514`.
    pub listen: String,
    pub log_level: String,
    pub udp_queue_size: NonZeroUsize,
    /// Drop anything preceding the first device level tag (`[I]`, `[W]`, ...).
    pub udp_trim_to_level_marker: bool,
    pub loki_url: String,
    pub loki_timeout: Duration,
    pub loki_job: String,
    /// Static headers sent with every push, e.g. tenant or auth headers.
    pub loki_headers: BTreeMap<String, String>,
    pub batch_max_items: usize,
    pub batch_max_wait: Duration,
    pub devices: DeviceRegistry,
}

impl Config {
    /// Loads the YAML file at `path`, applies environment overrides and validates the result.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if let Err(e) = std::fs::metadata(path) {
            return Err(ConfigError::Load(format!("open {}: {e}", path.display())));
        }
        Self::extract(
            Figment::new()
                .merge(Yaml::file(path))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Parses and validates configuration from a YAML document. Environment is ignored.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Self::extract(Figment::new().merge(Yaml::string(yaml)))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let file_config: FileConfig = figment
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        Self::try_from(file_config)
    }

    /// Addresses to try for the UDP bind, in order.
    ///
    /// A bare `:port` binds the dual-stack wildcard `[::]:port`, falling back to
    /// `0.0.0.0:port` on hosts without IPv6.
    #[must_use]
    pub fn bind_addrs(&self) -> Vec<String> {
        if self.listen.starts_with(':') {
            vec![
                format!("[::]{}", self.listen),
                format!("0.0.0.0{}", self.listen),
            ]
        } else {
            vec![self.listen.clone()]
        }
    }
}

impl TryFrom<FileConfig> for Config {
    type Error = ConfigError;

    fn try_from(file: FileConfig) -> Result<Self, Self::Error> {
        let listen = trimmed(file.listen)
            .ok_or_else(|| ConfigError::Invalid("listen is required (e.g. :5514)".to_string()))?;

        let log_level = match trimmed(file.log_level) {
            Some(level) => level.to_lowercase(),
            None => DEFAULT_LOG_LEVEL.to_string(),
        };
        if !VALID_LOG_LEVELS.contains(&log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "log_level must be one of trace, debug, info, warn, error (got: {log_level})"
            )));
        }

        let udp = file.input.udp;
        let udp_queue_size = non_zero_or(udp.queue_size, DEFAULT_QUEUE_SIZE);

        let loki = file.loki;
        let loki_url = trimmed(loki.url)
            .ok_or_else(|| ConfigError::Invalid("loki.url is required".to_string()))?;
        validate_url(&loki_url)?;

        let loki_timeout = positive(loki.timeout, DEFAULT_PUSH_TIMEOUT, "loki.timeout")?;
        let loki_job = trimmed(loki.labels.job).unwrap_or_else(|| DEFAULT_JOB.to_string());

        let batch_max_items = non_zero_or(loki.batch.max_items, DEFAULT_BATCH_MAX_ITEMS).get();
        let batch_max_wait = positive(
            loki.batch.max_wait,
            DEFAULT_BATCH_MAX_WAIT,
            "loki.batch.max_wait",
        )?;

        let loki_headers = clean_pairs(loki.headers);
        for (name, value) in &loki_headers {
            if HeaderName::from_bytes(name.as_bytes()).is_err()
                || HeaderValue::from_str(value).is_err()
            {
                return Err(ConfigError::Invalid(format!(
                    "loki.headers contains an invalid header: {name}"
                )));
            }
        }

        let devices = DeviceRegistry::new(clean_pairs(file.devices))?;

        Ok(Config {
            listen,
            log_level,
            udp_queue_size,
            udp_trim_to_level_marker: udp.trim_to_level_marker.unwrap_or(false),
            loki_url,
            loki_timeout,
            loki_job,
            loki_headers,
            batch_max_items,
            batch_max_wait,
            devices,
        })
    }
}

/// Raw shape of the configuration file. Every field is optional so that defaults and
/// validation can tell "absent" apart from "explicitly zero".
#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct FileConfig {
    pub listen: Option<String>,
    pub log_level: Option<String>,
    pub input: InputConfig,
    pub loki: LokiConfig,
    pub devices: HashMap<String, String>,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct InputConfig {
    pub udp: UdpConfig,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UdpConfig {
    pub queue_size: Option<usize>,
    pub trim_to_level_marker: Option<bool>,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LokiConfig {
    pub url: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub timeout: Option<Duration>,
    pub labels: LokiLabels,
    pub batch: BatchConfig,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LokiLabels {
    pub job: Option<String>,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BatchConfig {
    pub max_items: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub max_wait: Option<Duration>,
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn clean_pairs(pairs: HashMap<String, String>) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .collect()
}

fn non_zero_or(value: Option<usize>, default: usize) -> NonZeroUsize {
    value
        .and_then(NonZeroUsize::new)
        .or_else(|| NonZeroUsize::new(default))
        .unwrap_or(NonZeroUsize::MIN)
}

/// Zero falls back to `default`; anything above [`MAX_DURATION`] is rejected.
fn positive(
    value: Option<Duration>,
    default: Duration,
    key: &str,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) if v.is_zero() => Ok(default),
        Some(v) if v > MAX_DURATION => Err(ConfigError::Invalid(format!(
            "{key} must be at most 24h (got: {v:?})"
        ))),
        Some(v) => Ok(v),
    }
}

fn validate_url(url: &str) -> Result<(), ConfigError> {
    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        Ok(parsed) => Err(ConfigError::Invalid(format!(
            "loki.url must use http or https (got: {})",
            parsed.scheme()
        ))),
        Err(e) => Err(ConfigError::Invalid(format!("loki.url is invalid: {e}"))),
    }
}

/// Parses a duration such as `1s`, `250ms` or `1m30s`. A bare number is taken as seconds.
///
/// Supported units: `ns`, `us` (`µs`), `ms`, `s`, `m`, `h`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<f64>() {
        return seconds(secs).ok_or_else(|| format!("invalid duration: {input}"));
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut nanos = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_end = rest.find(|c: char| !is_number(c)).unwrap_or(rest.len());
        if number_end == 0 {
            return Err(format!("invalid duration: {input}"));
        }
        let value: f64 = rest[..number_end]
            .parse()
            .map_err(|_| format!("invalid duration: {input}"))?;
        rest = &rest[number_end..];

        let unit_end = rest.find(is_number).unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("missing unit in duration: {input}")),
            unit => return Err(format!("unknown unit {unit} in duration: {input}")),
        };
        nanos += value * scale;
        rest = &rest[unit_end..];
    }

    if !nanos.is_finite() || nanos >= u64::MAX as f64 {
        return Err(format!("invalid duration: {input}"));
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}

fn seconds(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

/// Accepts a number of seconds or a duration string understood by [`parse_duration`].
pub fn deserialize_optional_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    struct DurationVisitor;
    impl serde::de::Visitor<'_> for DurationVisitor {
        type Value = Option<Duration>;
        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a duration such as \"2s\" or a number of seconds")
        }
        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(Duration::from_secs(v)))
        }
        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
            u64::try_from(v)
                .map(|secs| Some(Duration::from_secs(secs)))
                .map_err(|_| E::custom(format!("negative duration: {v}")))
        }
        fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Self::Value, E> {
            seconds(v)
                .map(Some)
                .ok_or_else(|| E::custom(format!("invalid duration: {v}")))
        }
        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
            parse_duration(v).map(Some).map_err(E::custom)
        }
        fn visit_none<E: serde::de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
        fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
    }
    deserializer.deserialize_any(DurationVisitor)
}
