use std::{collections::BTreeMap, fs, path::Path, time::Duration};

use reqwest::Url;
use serde::Deserialize;
use serde_with::{DurationMilliSeconds, DurationSeconds, serde_as};

use crate::{cli::Backend, error::ConfigError, retry::RetryPolicy, rollover::TimeReference};

#[serde_as]
#[derive(Debug, Deserialize)]
pub struct Config {
    pub envoy: EnvoyConfig,

    /// Value of the `source` tag on every point.
    #[serde(default = "default_source_tag")]
    pub source_tag: String,

    /// Power poll cadence.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_polling_interval")]
    pub polling_interval: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_inverter_polling_interval")]
    pub inverter_polling_interval: Duration,

    /// Time reference for the daily rollover.
    #[serde(default)]
    pub day_boundary: TimeReference,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Configured inverters by serial. Serials must be quoted in YAML to stay strings.
    #[serde(default)]
    pub inverters: BTreeMap<String, InverterConfig>,

    pub influxdb: Option<InfluxDbConfig>,

    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

#[serde_as]
#[derive(Debug, Deserialize)]
pub struct EnvoyConfig {
    pub url: String,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "timeout_seconds", default = "default_timeout")]
    pub timeout: Duration,
}

#[serde_as]
#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "base_delay_ms")]
    pub base_delay: Duration,

    pub multiplier: f64,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "max_delay_ms")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay: policy.base_delay,
            multiplier: policy.multiplier,
            max_delay: policy.max_delay,
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            multiplier: config.multiplier,
            max_delay: config.max_delay,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct InverterConfig {
    /// Extra tags attached to this inverter's points.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InfluxDbConfig {
    pub url: String,
    pub org: String,

    /// High-rate samples.
    pub bucket_hr: String,

    /// Daily summaries.
    pub bucket_lr: String,
}

#[derive(Copy, Clone, Debug, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default = "default_listening_port")]
    pub listening_port: u16,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self { listening_port: default_listening_port() }
    }
}

fn default_source_tag() -> String {
    "envoy".to_owned()
}

const fn default_polling_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_inverter_polling_interval() -> Duration {
    Duration::from_secs(300)
}

const fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_listening_port() -> u16 {
    9090
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_owned(), source })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.envoy_url()?;
        if self.polling_interval.is_zero() {
            return Err(ConfigError::Invalid("`polling_interval` must be positive".to_owned()));
        }
        if self.inverter_polling_interval < self.polling_interval {
            return Err(ConfigError::Invalid(format!(
                "`inverter_polling_interval` ({:?}) must not be shorter than `polling_interval` ({:?})",
                self.inverter_polling_interval, self.polling_interval,
            )));
        }
        if self.envoy.timeout.is_zero() {
            return Err(ConfigError::Invalid("`envoy.timeout_seconds` must be positive".to_owned()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("`retry.max_attempts` must be at least 1".to_owned()));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "`retry.multiplier` must be at least 1, got {}",
                self.retry.multiplier,
            )));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid(
                "`retry.base_delay_ms` must not exceed `retry.max_delay_ms`".to_owned(),
            ));
        }
        if self.inverters.keys().any(|serial| serial.trim().is_empty()) {
            return Err(ConfigError::Invalid("inverter serials must not be blank".to_owned()));
        }
        Ok(())
    }

    /// Check that the selected backend can be constructed.
    pub fn require_backend(
        &self,
        backend: Backend,
        influxdb_token: Option<&str>,
    ) -> Result<(), ConfigError> {
        match backend {
            Backend::Influxdb => {
                let Some(influxdb) = &self.influxdb else {
                    return Err(ConfigError::Invalid(
                        "the `influxdb` section is required for the InfluxDB backend".to_owned(),
                    ));
                };
                influxdb.url.parse::<Url>().map_err(|error| {
                    ConfigError::Invalid(format!("invalid `influxdb.url`: {error}"))
                })?;
                if influxdb_token.is_none_or(|token| token.trim().is_empty()) {
                    return Err(ConfigError::Invalid(
                        "an InfluxDB token is required for the InfluxDB backend".to_owned(),
                    ));
                }
                Ok(())
            }
            Backend::Prometheus => Ok(()),
        }
    }

    pub fn envoy_url(&self) -> Result<Url, ConfigError> {
        self.envoy
            .url
            .parse()
            .map_err(|error| ConfigError::Invalid(format!("invalid `envoy.url`: {error}")))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.into()
    }

    pub fn inverter_tags(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.inverters
            .iter()
            .map(|(serial, inverter)| (serial.clone(), inverter.tags.clone()))
            .collect()
    }
}
