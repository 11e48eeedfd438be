use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// The gateway returned a payload that cannot be interpreted.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("missing `{0}`")]
    Missing(&'static str),

    #[error("`{field}` is out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
}

/// A single fetch from the gateway has failed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Timeout, refused connection, or a server-side failure. Worth retrying.
    #[error("network error: {0}")]
    Network(String),

    /// The gateway rejected the session.
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

#[derive(Debug, Error)]
pub enum SinkWriteError {
    #[error("InfluxDB request failed: {0}")]
    Influx(#[from] influxdb2::RequestError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid point: {0}")]
    InvalidPoint(String),

    #[error("unexpected response: {0}")]
    Response(String),

    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse the configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
