mod cli;
mod clock;
mod config;
mod device;
mod error;
mod freshness;
mod prelude;
mod quantity;
mod retry;
mod rollover;
mod sample;
mod scheduler;
mod sink;
#[cfg(test)]
mod testing;

use std::{net::SocketAddr, sync::Arc};

use chrono::Utc;
use clap::{Parser, crate_version};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::{
    cli::{Args, Backend},
    clock::SystemClock,
    config::Config,
    device::{DeviceClient, envoy},
    prelude::*,
    rollover::DailyAggregator,
    scheduler::Scheduler,
    sink::{Sink, influxdb::InfluxDb, metrics::Prometheus},
};

#[tokio::main]
async fn main() -> Result {
    let _ = dotenvy::dotenv();
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).without_time().compact().init();
    info!(version = crate_version!(), "starting…");

    let args = Args::parse();
    info!(config = %args.config.display(), db = %args.db, "arguments");
    info!(
        envoy_token = if args.envoy_token.is_empty() { "not set" } else { "set" },
        influxdb_token = if args.influxdb_token.is_some() { "set" } else { "not set" },
        "secrets",
    );

    let config = Config::load(&args.config)?;
    config.require_backend(args.db, args.influxdb_token.as_deref())?;
    info!(
        envoy_url = %config.envoy.url,
        source_tag = %config.source_tag,
        polling_interval = ?config.polling_interval,
        inverter_polling_interval = ?config.inverter_polling_interval,
        day_boundary = %config.day_boundary,
        n_inverters = config.inverters.len(),
        "runtime",
    );

    let device = envoy::Client::try_new(&config.envoy_url()?, args.envoy_token, config.envoy.timeout)?;
    if let Err(error) = device.authenticate().await {
        warn!("initial authentication has failed, will retry on the first poll: {error:#}");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (sink, exporter) = match args.db {
        Backend::Influxdb => {
            let influxdb = config.influxdb.as_ref().context("missing the `influxdb` section")?;
            info!(
                url = %influxdb.url,
                org = %influxdb.org,
                bucket_hr = %influxdb.bucket_hr,
                bucket_lr = %influxdb.bucket_lr,
                "InfluxDB",
            );
            let token = args.influxdb_token.context("missing the InfluxDB token")?;
            let sink: Arc<dyn Sink> = Arc::new(InfluxDb::try_new(
                influxdb,
                token,
                config.source_tag.clone(),
                config.inverter_tags(),
            )?);
            (sink, None)
        }
        Backend::Prometheus => {
            let port = config.prometheus.listening_port;
            info!(listening_port = port, "Prometheus");
            let prometheus = Arc::new(Prometheus::try_new(
                config.source_tag.clone(),
                &config.inverter_tags(),
            )?);
            let listener = Prometheus::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
            let exporter = tokio::spawn({
                let prometheus = prometheus.clone();
                let shutdown_rx = shutdown_rx.clone();
                async move {
                    let result = prometheus.serve(listener, shutdown_rx).await;
                    if let Err(error) = &result {
                        error!("the metrics exporter has failed: {error:#}");
                    }
                    result
                }
            });
            let sink: Arc<dyn Sink> = prometheus;
            (sink, Some(exporter))
        }
    };

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutting down…");
        let _ = shutdown_tx.send(true);
    });

    Scheduler::builder()
        .device(Arc::new(device))
        .sink(sink)
        .clock(Arc::new(SystemClock))
        .aggregator(DailyAggregator::new(
            Utc::now(),
            config.day_boundary,
            config.inverters.keys().cloned(),
        ))
        .retry_policy(config.retry_policy())
        .power_interval(config.polling_interval)
        .inverter_interval(config.inverter_polling_interval)
        .build()
        .run(shutdown_rx)
        .await;

    if let Some(exporter) = exporter {
        exporter.await??;
    }
    info!("bye");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {error:#}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!("failed to install the SIGTERM handler: {error:#}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
