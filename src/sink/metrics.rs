use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::Arc,
};

use async_trait::async_trait;
use axum::{Router, extract::State, http::StatusCode, routing::get};
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use tokio::{net::TcpListener, sync::watch};

use crate::{
    error::SinkWriteError,
    prelude::*,
    rollover::{DailySummary, MeasurementKey},
    sample::SampleData,
    sink::Sink,
};

const LINE_LABELS: &[&str] = &["source", "measurement_type", "line_idx"];
const INVERTER_LABELS: &[&str] = &["source", "serial"];

/// Label name for a configured inverter tag: anything but ASCII alphanumerics becomes `_`.
fn label_name(tag: &str) -> String {
    let name: String =
        tag.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect();
    if name.starts_with(|c: char| c.is_ascii_digit()) { format!("_{name}") } else { name }
}

/// Keeps the latest values in gauges for Prometheus to scrape.
pub struct Prometheus {
    registry: Registry,
    source_tag: String,

    /// Configured tag keys that become extra inverter labels, in label order.
    inverter_tag_keys: Vec<String>,

    inverter_tags: BTreeMap<String, BTreeMap<String, String>>,

    line_power: GaugeVec,
    line_reactive_power: GaugeVec,
    line_apparent_power: GaugeVec,
    line_voltage: GaugeVec,
    line_current: GaugeVec,
    inverter_power: GaugeVec,
    inverter_last_report: GaugeVec,
    daily_line_energy: GaugeVec,
    daily_inverter_energy: GaugeVec,
}

impl Prometheus {
    /// Every tag key configured for any inverter becomes a label of the inverter gauges.
    ///
    /// Inverters without the tag get an empty value.
    pub fn try_new(
        source_tag: String,
        inverter_tags: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> Result<Self, SinkWriteError> {
        let mut label_keys = BTreeMap::new();
        for key in inverter_tags.values().flat_map(BTreeMap::keys) {
            let name = label_name(key);
            if !INVERTER_LABELS.contains(&name.as_str()) {
                label_keys.entry(name).or_insert_with(|| key.clone());
            }
        }
        let inverter_labels: Vec<&str> =
            INVERTER_LABELS.iter().copied().chain(label_keys.keys().map(String::as_str)).collect();

        let registry = Registry::new();
        let gauge = |name: &str, help: &str, labels: &[&str]| -> Result<GaugeVec, SinkWriteError> {
            let gauge = GaugeVec::new(Opts::new(name, help), labels)?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        Ok(Self {
            line_power: gauge("envoy_line_power_watts", "Real power per line", LINE_LABELS)?,
            line_reactive_power: gauge(
                "envoy_line_reactive_power_var",
                "Reactive power per line",
                LINE_LABELS,
            )?,
            line_apparent_power: gauge(
                "envoy_line_apparent_power_va",
                "Apparent power per line",
                LINE_LABELS,
            )?,
            line_voltage: gauge("envoy_line_voltage_volts", "RMS voltage per line", LINE_LABELS)?,
            line_current: gauge("envoy_line_current_amperes", "RMS current per line", LINE_LABELS)?,
            inverter_power: gauge(
                "envoy_inverter_power_watts",
                "Last reported inverter power",
                &inverter_labels,
            )?,
            inverter_last_report: gauge(
                "envoy_inverter_last_report_timestamp_seconds",
                "When the inverter has last reported",
                &inverter_labels,
            )?,
            daily_line_energy: gauge(
                "envoy_daily_line_energy_watt_hours",
                "Energy per line over the last finalized day",
                LINE_LABELS,
            )?,
            daily_inverter_energy: gauge(
                "envoy_daily_inverter_energy_watt_hours",
                "Inverter energy over the last finalized day",
                &inverter_labels,
            )?,
            registry,
            source_tag,
            inverter_tag_keys: label_keys.into_values().collect(),
            inverter_tags: inverter_tags.clone(),
        })
    }

    /// Label values of an inverter gauge, in the order of its label names.
    fn inverter_labels<'a>(&'a self, serial: &'a str) -> Vec<&'a str> {
        let tags = self.inverter_tags.get(serial);
        [self.source_tag.as_str(), serial]
            .into_iter()
            .chain(self.inverter_tag_keys.iter().map(|key| {
                tags.and_then(|tags| tags.get(key)).map_or("", String::as_str)
            }))
            .collect()
    }

    /// Text exposition of everything registered.
    pub fn render(&self) -> Result<String, SinkWriteError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|error| SinkWriteError::Response(error.to_string()))
    }

    /// Bind the exporter's listener before anything is polled.
    pub async fn bind(address: SocketAddr) -> Result<TcpListener> {
        TcpListener::bind(address)
            .await
            .with_context(|| format!("failed to bind the metrics listener on {address}"))
    }

    /// Serve `GET /metrics` until the shutdown flag is raised.
    #[instrument(skip_all)]
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result {
        let app = Router::new().route("/metrics", get(get_metrics)).with_state(self);
        info!(address = ?listener.local_addr().ok(), "serving metrics…");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|is_shutting_down| *is_shutting_down).await;
            })
            .await?;
        info!("stopped");
        Ok(())
    }
}

#[async_trait]
impl Sink for Prometheus {
    async fn write_high_rate(&self, data: &SampleData) -> Result<(), SinkWriteError> {
        if let Some(sample) = &data.power {
            for (category, phase, line) in sample.iter() {
                let phase = phase.to_string();
                let labels = [self.source_tag.as_str(), category.as_str(), phase.as_str()];
                self.line_power.with_label_values(&labels).set(line.power.0);
                self.line_reactive_power.with_label_values(&labels).set(line.reactive_power.0);
                self.line_apparent_power.with_label_values(&labels).set(line.apparent_power.0);
                self.line_voltage.with_label_values(&labels).set(line.voltage.0);
                self.line_current.with_label_values(&labels).set(line.current.0);
            }
        }
        for sample in &data.inverters {
            let labels = self.inverter_labels(&sample.serial);
            self.inverter_power.with_label_values(&labels).set(sample.watts.0);
            #[expect(clippy::cast_precision_loss)]
            self.inverter_last_report
                .with_label_values(&labels)
                .set(sample.last_report_at.timestamp() as f64);
        }
        Ok(())
    }

    async fn write_daily_summary(&self, summary: &DailySummary) -> Result<(), SinkWriteError> {
        for (key, energy) in &summary.entries {
            match key {
                MeasurementKey::Line { category, phase } => {
                    let phase = phase.to_string();
                    self.daily_line_energy
                        .with_label_values(&[self.source_tag.as_str(), category.as_str(), phase.as_str()])
                        .set(energy.0);
                }
                MeasurementKey::Inverter(serial) => {
                    self.daily_inverter_energy
                        .with_label_values(&self.inverter_labels(serial))
                        .set(energy.0);
                }
            }
        }
        Ok(())
    }
}

async fn get_metrics(State(sink): State<Arc<Prometheus>>) -> Result<String, StatusCode> {
    sink.render().map_err(|error| {
        error!("failed to render the metrics: {error:#}");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
