use std::{collections::BTreeMap, future::Future, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream;
use influxdb2::{
    Client,
    api::query::FluxRecord,
    models::{DataPoint, Query},
};
use influxdb2_structmap::value::Value;
use reqwest::Url;

use crate::{
    config::InfluxDbConfig,
    error::SinkWriteError,
    prelude::*,
    rollover::{DailySummary, MeasurementKey},
    sample::{InverterSample, PowerSample, SampleData},
    sink::Sink,
};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Pushes points to InfluxDB v2.
pub struct InfluxDb {
    client: Client,
    bucket_hr: String,
    bucket_lr: String,
    source_tag: String,

    /// Extra tags per inverter serial.
    inverter_tags: BTreeMap<String, BTreeMap<String, String>>,
}

impl InfluxDb {
    #[instrument(skip_all, fields(url = %config.url))]
    pub fn try_new(
        config: &InfluxDbConfig,
        token: String,
        source_tag: String,
        inverter_tags: BTreeMap<String, BTreeMap<String, String>>,
    ) -> Result<Self> {
        let url: Url = config.url.parse().context("invalid InfluxDB URL")?;
        Ok(Self {
            client: Client::new(url.as_str().trim_end_matches('/'), config.org.as_str(), token),
            bucket_hr: config.bucket_hr.clone(),
            bucket_lr: config.bucket_lr.clone(),
            source_tag,
            inverter_tags,
        })
    }

    #[instrument(skip_all, fields(bucket = bucket, n_points = points.len()))]
    async fn write(&self, bucket: &str, points: Vec<DataPoint>) -> Result<(), SinkWriteError> {
        if points.is_empty() {
            return Ok(());
        }
        with_timeout(self.client.write(bucket, stream::iter(points))).await?;
        debug!("written");
        Ok(())
    }

    /// Point tagged with the source, stamped in nanoseconds.
    fn point<'t>(
        &self,
        measurement: String,
        tags: impl IntoIterator<Item = (&'t str, &'t str)>,
        fields: impl IntoIterator<Item = (&'static str, f64)>,
        at: DateTime<Utc>,
    ) -> Result<DataPoint, SinkWriteError> {
        let timestamp = at
            .timestamp_nanos_opt()
            .ok_or_else(|| SinkWriteError::InvalidPoint(format!("`{at}` is out of range")))?;
        let builder = DataPoint::builder(measurement).tag("source", self.source_tag.as_str());
        let builder = tags.into_iter().fold(builder, |builder, (key, value)| builder.tag(key, value));
        fields
            .into_iter()
            .fold(builder, |builder, (key, value)| builder.field(key, value))
            .timestamp(timestamp)
            .build()
            .map_err(|error| SinkWriteError::InvalidPoint(error.to_string()))
    }

    /// Tags shared by every point of an inverter.
    fn inverter_point_tags<'a>(
        &'a self,
        serial: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a str)> {
        [("measurement-type", "inverter"), ("serial", serial)].into_iter().chain(
            self.inverter_tags
                .get(serial)
                .into_iter()
                .flatten()
                .map(|(key, value)| (key.as_str(), value.as_str())),
        )
    }

    fn line_points(&self, sample: &PowerSample) -> Result<Vec<DataPoint>, SinkWriteError> {
        sample
            .iter()
            .map(|(category, phase, line)| {
                let phase = phase.to_string();
                self.point(
                    format!("{category}-line{phase}"),
                    [("measurement-type", category.as_str()), ("line-idx", phase.as_str())],
                    [
                        ("P", line.power.0),
                        ("Q", line.reactive_power.0),
                        ("S", line.apparent_power.0),
                        ("I_rms", line.current.0),
                        ("V_rms", line.voltage.0),
                    ],
                    sample.timestamp,
                )
            })
            .collect()
    }

    fn inverter_production_point(
        &self,
        sample: &InverterSample,
    ) -> Result<DataPoint, SinkWriteError> {
        self.point(
            format!("inverter-production-{}", sample.serial),
            self.inverter_point_tags(&sample.serial),
            [("P", sample.watts.0)],
            sample.last_report_at,
        )
    }

    fn daily_points(&self, summary: &DailySummary) -> Result<Vec<DataPoint>, SinkWriteError> {
        summary
            .entries
            .iter()
            .map(|(key, energy)| match key {
                MeasurementKey::Line { category, phase } => {
                    let phase = phase.to_string();
                    self.point(
                        format!("{category}-daily-summary-line{phase}"),
                        [
                            ("measurement-type", category.as_str()),
                            ("line-idx", phase.as_str()),
                            ("interval", "24h"),
                        ],
                        [("Wh", energy.0)],
                        summary.finalized_at,
                    )
                }
                MeasurementKey::Inverter(serial) => self.point(
                    format!("inverter-daily-summary-{serial}"),
                    self.inverter_point_tags(serial).chain([("interval", "24h")]),
                    [("Wh", energy.0)],
                    summary.finalized_at,
                ),
            })
            .collect()
    }

    fn last_report_query(&self, serial: &str) -> String {
        format!(
            r#"from(bucket: "{bucket}")
  |> range(start: -30d)
  |> filter(fn: (r) => r["source"] == "{source}")
  |> filter(fn: (r) => r["measurement-type"] == "inverter")
  |> filter(fn: (r) => r["serial"] == "{serial}")
  |> filter(fn: (r) => r["_field"] == "P")
  |> last()
  |> keep(columns: ["_time"])"#,
            bucket = flux_string(&self.bucket_hr),
            source = flux_string(&self.source_tag),
            serial = flux_string(serial),
        )
    }
}

#[async_trait]
impl Sink for InfluxDb {
    async fn write_high_rate(&self, data: &SampleData) -> Result<(), SinkWriteError> {
        let mut points = match &data.power {
            Some(sample) => self.line_points(sample)?,
            None => Vec::new(),
        };
        for sample in &data.inverters {
            points.push(self.inverter_production_point(sample)?);
        }
        self.write(&self.bucket_hr, points).await
    }

    async fn write_daily_summary(&self, summary: &DailySummary) -> Result<(), SinkWriteError> {
        self.write(&self.bucket_lr, self.daily_points(summary)?).await
    }

    #[instrument(skip_all, fields(serial = serial))]
    async fn last_known_timestamp(
        &self,
        serial: &str,
    ) -> Result<Option<DateTime<Utc>>, SinkWriteError> {
        let query = Query::new(self.last_report_query(serial));
        let records = with_timeout(self.client.query_raw(Some(query))).await?;
        let timestamp = last_time(&records)?;
        debug!(?timestamp, "queried");
        Ok(timestamp)
    }
}

async fn with_timeout<T>(
    request: impl Future<Output = Result<T, influxdb2::RequestError>>,
) -> Result<T, SinkWriteError> {
    let response =
        tokio::time::timeout(TIMEOUT, request).await.map_err(|_| SinkWriteError::Timeout(TIMEOUT))?;
    Ok(response?)
}

fn flux_string(text: &str) -> String {
    text.replace('\\', r"\\").replace('"', r#"\""#)
}

/// `_time` of the first record, if any.
fn last_time(records: &[FluxRecord]) -> Result<Option<DateTime<Utc>>, SinkWriteError> {
    let Some(record) = records.first() else {
        return Ok(None);
    };
    match record.values.get("_time") {
        Some(Value::TimeRFC(timestamp)) => Ok(Some(timestamp.to_utc())),
        other => Err(SinkWriteError::Response(format!("unexpected `_time`: {other:?}"))),
    }
}
