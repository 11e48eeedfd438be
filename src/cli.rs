use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Parser)]
#[command(author, version, about, propagate_version = true)]
pub struct Args {
    /// Path to the configuration file.
    #[clap(long, env = "ENVOY_LOGGER_CFG_PATH", default_value = "/etc/envoy-logger/config.yml")]
    pub config: PathBuf,

    /// Where the samples go.
    #[clap(long, env = "ENVOY_LOGGER_DB", default_value = "influxdb")]
    pub db: Backend,

    /// Bearer token for the local gateway API.
    #[clap(long = "envoy-token", env = "ENVOY_TOKEN", hide_env_values = true)]
    pub envoy_token: String,

    /// InfluxDB API token, required for the InfluxDB backend.
    #[clap(long = "influxdb-token", env = "INFLUXDB_TOKEN", hide_env_values = true)]
    pub influxdb_token: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum, derive_more::Display)]
pub enum Backend {
    #[display("influxdb")]
    Influxdb,

    #[display("prometheus")]
    Prometheus,
}
