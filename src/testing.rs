//! Test doubles and payload fixtures.

use std::{
    collections::BTreeMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::{
    device::DeviceClient,
    error::{FetchError, SinkWriteError},
    rollover::DailySummary,
    sample::SampleData,
    sink::Sink,
};

type Respond = Box<dyn Fn(usize) -> Result<Value, FetchError> + Send + Sync>;

/// Scripted gateway: every endpoint answers by its own call index.
pub struct FakeDevice {
    authenticate: Box<dyn Fn() -> Result<(), FetchError> + Send + Sync>,
    power: Respond,
    inverters: Respond,
    inverter_latency: Duration,
    n_authentications: AtomicUsize,
    n_power_fetches: AtomicUsize,
    n_inverter_fetches: AtomicUsize,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self {
            authenticate: Box::new(|| Ok(())),
            power: Box::new(|_| Err(FetchError::Network("not scripted".to_owned()))),
            inverters: Box::new(|_| Err(FetchError::Network("not scripted".to_owned()))),
            inverter_latency: Duration::ZERO,
            n_authentications: AtomicUsize::new(0),
            n_power_fetches: AtomicUsize::new(0),
            n_inverter_fetches: AtomicUsize::new(0),
        }
    }
}

impl FakeDevice {
    pub fn with_authentication(
        mut self,
        authenticate: impl Fn() -> Result<(), FetchError> + Send + Sync + 'static,
    ) -> Self {
        self.authenticate = Box::new(authenticate);
        self
    }

    pub fn with_power(
        mut self,
        power: impl Fn(usize) -> Result<Value, FetchError> + Send + Sync + 'static,
    ) -> Self {
        self.power = Box::new(power);
        self
    }

    pub fn with_inverters(
        mut self,
        inverters: impl Fn(usize) -> Result<Value, FetchError> + Send + Sync + 'static,
    ) -> Self {
        self.inverters = Box::new(inverters);
        self
    }

    pub const fn with_inverter_latency(mut self, latency: Duration) -> Self {
        self.inverter_latency = latency;
        self
    }

    pub fn n_authentications(&self) -> usize {
        self.n_authentications.load(Ordering::SeqCst)
    }

    pub fn n_power_fetches(&self) -> usize {
        self.n_power_fetches.load(Ordering::SeqCst)
    }

    pub fn n_inverter_fetches(&self) -> usize {
        self.n_inverter_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceClient for FakeDevice {
    async fn authenticate(&self) -> Result<(), FetchError> {
        self.n_authentications.fetch_add(1, Ordering::SeqCst);
        (self.authenticate)()
    }

    async fn fetch_power(&self) -> Result<Value, FetchError> {
        let index = self.n_power_fetches.fetch_add(1, Ordering::SeqCst);
        (self.power)(index)
    }

    async fn fetch_inverters(&self) -> Result<Value, FetchError> {
        let index = self.n_inverter_fetches.fetch_add(1, Ordering::SeqCst);
        if !self.inverter_latency.is_zero() {
            tokio::time::sleep(self.inverter_latency).await;
        }
        (self.inverters)(index)
    }
}

/// Remembers everything written to it.
#[derive(Default)]
pub struct RecordingSink {
    high_rate: Mutex<Vec<SampleData>>,
    summaries: Mutex<Vec<DailySummary>>,
    last_known: BTreeMap<String, DateTime<Utc>>,
    query_latency: Duration,
    is_failing: AtomicBool,
    n_failed_writes: AtomicUsize,
}

impl RecordingSink {
    pub fn with_last_known(mut self, serial: &str, timestamp: DateTime<Utc>) -> Self {
        self.last_known.insert(serial.to_owned(), timestamp);
        self
    }

    pub const fn with_query_latency(mut self, latency: Duration) -> Self {
        self.query_latency = latency;
        self
    }

    pub fn set_failing(&self, is_failing: bool) {
        self.is_failing.store(is_failing, Ordering::SeqCst);
    }

    pub fn high_rate(&self) -> Vec<SampleData> {
        self.high_rate.lock().unwrap().clone()
    }

    pub fn summaries(&self) -> Vec<DailySummary> {
        self.summaries.lock().unwrap().clone()
    }

    pub fn n_failed_writes(&self) -> usize {
        self.n_failed_writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), SinkWriteError> {
        if self.is_failing.load(Ordering::SeqCst) {
            self.n_failed_writes.fetch_add(1, Ordering::SeqCst);
            Err(SinkWriteError::Response("the backend is unavailable".to_owned()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn write_high_rate(&self, data: &SampleData) -> Result<(), SinkWriteError> {
        self.check()?;
        self.high_rate.lock().unwrap().push(data.clone());
        Ok(())
    }

    async fn write_daily_summary(&self, summary: &DailySummary) -> Result<(), SinkWriteError> {
        self.check()?;
        self.summaries.lock().unwrap().push(summary.clone());
        Ok(())
    }

    async fn last_known_timestamp(
        &self,
        serial: &str,
    ) -> Result<Option<DateTime<Utc>>, SinkWriteError> {
        if !self.query_latency.is_zero() {
            tokio::time::sleep(self.query_latency).await;
        }
        Ok(self.last_known.get(serial).copied())
    }
}

/// Power document with a single line per meter.
///
/// Production runs at `watts`, consumption at half of it, and the net meter exports the rest.
pub fn power_payload(reading_time: DateTime<Utc>, watts: f64) -> Value {
    let line = |watts: f64| {
        json!({
            "wNow": watts,
            "reactPwr": 10.0,
            "apprntPwr": watts.abs() + 10.0,
            "rmsCurrent": 4.2,
            "rmsVoltage": 240.0,
        })
    };
    let meter = |measurement_type: &str, watts: f64| {
        json!({
            "type": "eim",
            "measurementType": measurement_type,
            "readingTime": reading_time.timestamp(),
            "lines": [line(watts)],
        })
    };
    json!({
        "production": [
            {"type": "inverters", "activeCount": 2, "readingTime": reading_time.timestamp(), "wNow": watts},
            meter("production", watts),
        ],
        "consumption": [
            meter("total-consumption", watts / 2.0),
            meter("net-consumption", -watts / 2.0),
        ],
    })
}

/// Inverter document from `(serial, last report, watts)`.
pub fn inverter_payload(inverters: &[(&str, DateTime<Utc>, f64)]) -> Value {
    inverters
        .iter()
        .map(|(serial, last_report_at, watts)| {
            json!({
                "serialNumber": serial,
                "lastReportDate": last_report_at.timestamp(),
                "devType": 1,
                "lastReportWatts": watts,
                "maxReportWatts": 295,
            })
        })
        .collect()
}
