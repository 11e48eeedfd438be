use std::{sync::Arc, time::Duration};

use bon::Builder;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};

use crate::{
    clock::Clock,
    device::DeviceClient,
    error::FetchError,
    freshness::FreshnessFilter,
    prelude::*,
    retry::RetryPolicy,
    rollover::DailyAggregator,
    sample::{InverterSample, PowerSample, SampleData, parse_inverters, parse_power},
    sink::Sink,
};

#[derive(Copy, Clone, Debug, derive_more::Display)]
pub enum Cadence {
    #[display("power")]
    Power,

    #[display("inverters")]
    Inverters,
}

/// Drives the power and inverter polls on their own epoch-aligned ticks.
#[derive(Builder)]
pub struct Scheduler {
    device: Arc<dyn DeviceClient>,
    sink: Arc<dyn Sink>,
    clock: Arc<dyn Clock>,

    #[builder(with = |aggregator: DailyAggregator| Mutex::new(aggregator))]
    aggregator: Mutex<DailyAggregator>,

    #[builder(default)]
    retry_policy: RetryPolicy,

    power_interval: Duration,
    inverter_interval: Duration,
}

impl Scheduler {
    /// Poll until the shutdown flag is raised.
    ///
    /// An in-flight cycle is allowed to finish.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(
            power_interval = ?self.power_interval,
            inverter_interval = ?self.inverter_interval,
            "polling…",
        );
        tokio::join!(self.run_power(shutdown.clone()), self.run_inverters(shutdown));
        info!("stopped polling");
    }

    async fn seed_freshness(&self) -> FreshnessFilter {
        let mut freshness = FreshnessFilter::default();
        let serials = self.aggregator.lock().await.configured_inverters().clone();
        for serial in serials {
            match self.sink.last_known_timestamp(&serial).await {
                Ok(Some(timestamp)) => {
                    debug!(%serial, %timestamp, "seeded");
                    freshness.seed(serial, timestamp);
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(%serial, "failed to query the last known report: {error:#}");
                }
            }
        }
        freshness
    }

    async fn run_power(&self, mut shutdown: watch::Receiver<bool>) {
        while self.wait_for_tick(Cadence::Power, &mut shutdown).await {
            if let Err(error) = self.power_cycle().await {
                warn!(cadence = %Cadence::Power, "tick failed: {error:#}");
            }
        }
    }

    /// Seeds the freshness filter before the first tick.
    async fn run_inverters(&self, mut shutdown: watch::Receiver<bool>) {
        let mut freshness = tokio::select! {
            biased;
            _ = shutdown.wait_for(|is_shutting_down| *is_shutting_down) => return,
            freshness = self.seed_freshness() => freshness,
        };
        while self.wait_for_tick(Cadence::Inverters, &mut shutdown).await {
            if let Err(error) = self.inverter_cycle(&mut freshness).await {
                warn!(cadence = %Cadence::Inverters, "tick failed: {error:#}");
            }
        }
    }

    /// Sleep until the cadence's next tick.
    ///
    /// Returns `false` when the shutdown flag has been raised instead.
    async fn wait_for_tick(&self, cadence: Cadence, shutdown: &mut watch::Receiver<bool>) -> bool {
        let interval = match cadence {
            Cadence::Power => self.power_interval,
            Cadence::Inverters => self.inverter_interval,
        };
        let deadline = next_tick(self.clock.now(), interval);
        trace!(%cadence, %deadline, "waiting…");
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|is_shutting_down| *is_shutting_down) => false,
            () = self.clock.sleep_until(deadline) => true,
        }
    }

    #[instrument(skip_all, name = "power")]
    async fn power_cycle(&self) -> Result {
        let sample = self
            .retry_policy
            .run(&*self.clock, &*self.device, || fetch_power(&*self.device))
            .await?;
        let polled_at = self.clock.now();
        debug!(timestamp = %sample.timestamp, "fetched");

        let summary = {
            let mut aggregator = self.aggregator.lock().await;
            aggregator.ingest_power(&sample);
            aggregator.maybe_roll_over(polled_at)
        };

        let written = self.sink.write_high_rate(&SampleData::from_power(polled_at, sample)).await;

        if let Some(summary) = summary {
            info!("daily summary:\n{summary}");
            if summary.is_empty() {
                warn!(day = %summary.day, "nothing has been accumulated, skipping the summary");
            } else if let Err(error) = self.sink.write_daily_summary(&summary).await {
                error!(day = %summary.day, "failed to write the daily summary: {error:#}");
            }
        }

        written?;
        Ok(())
    }

    #[instrument(skip_all, name = "inverters")]
    async fn inverter_cycle(&self, freshness: &mut FreshnessFilter) -> Result {
        let samples = self
            .retry_policy
            .run(&*self.clock, &*self.device, || fetch_inverters(&*self.device))
            .await?;
        let polled_at = self.clock.now();
        let n_reported = samples.len();

        let fresh = freshness.admit(samples);
        if fresh.is_empty() {
            debug!(n_reported, "no fresh reports");
            return Ok(());
        }
        self.aggregator.lock().await.ingest_inverters(&fresh);
        self.sink.write_high_rate(&SampleData::from_inverters(polled_at, fresh)).await?;
        Ok(())
    }
}

async fn fetch_power(device: &dyn DeviceClient) -> Result<PowerSample, FetchError> {
    Ok(parse_power(&device.fetch_power().await?)?)
}

async fn fetch_inverters(device: &dyn DeviceClient) -> Result<Vec<InverterSample>, FetchError> {
    Ok(parse_inverters(&device.fetch_inverters().await?)?)
}

/// Next multiple of `interval` since the Unix epoch, strictly after `now`.
pub fn next_tick(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let interval = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX).max(1);
    now.timestamp_millis()
        .div_euclid(interval)
        .checked_add(1)
        .and_then(|n_intervals| n_intervals.checked_mul(interval))
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use chrono::{TimeDelta, TimeZone};
    use serde_json::{Value, json};

    use super::*;
    use crate::{
        clock::PausedClock,
        quantity::WattHours,
        rollover::{MeasurementKey, TimeReference},
        sample::Category,
        testing::{FakeDevice, RecordingSink, inverter_payload, power_payload},
    };

    fn origin() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn seconds(n: usize) -> TimeDelta {
        TimeDelta::seconds(i64::try_from(n).unwrap())
    }

    /// Power reading of the `index`-th fetch, one per minute.
    fn minutely_power(index: usize) -> Result<Value, FetchError> {
        Ok(power_payload(origin() + seconds(60 * (index + 1)), 1000.0))
    }

    fn scheduler(
        origin: DateTime<Utc>,
        device: &Arc<FakeDevice>,
        sink: &Arc<RecordingSink>,
        serials: &[&str],
    ) -> Scheduler {
        Scheduler::builder()
            .device(device.clone())
            .sink(sink.clone())
            .clock(Arc::new(PausedClock::starting_at(origin)))
            .aggregator(DailyAggregator::new(
                origin,
                TimeReference::Utc,
                serials.iter().copied().map(str::to_owned),
            ))
            .power_interval(Duration::from_secs(60))
            .inverter_interval(Duration::from_secs(300))
            .build()
    }

    /// Run the scheduler and raise the shutdown flag after `duration`.
    async fn run_for(scheduler: &Scheduler, duration: Duration) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::join!(scheduler.run(shutdown_rx), async move {
            tokio::time::sleep(duration).await;
            shutdown_tx.send(true).unwrap();
        });
    }

    fn inverter_writes(sink: &RecordingSink) -> Vec<SampleData> {
        sink.high_rate().into_iter().filter(|data| data.power.is_none()).collect()
    }

    fn power_writes(sink: &RecordingSink) -> Vec<SampleData> {
        sink.high_rate().into_iter().filter(|data| data.power.is_some()).collect()
    }

    #[test]
    fn test_next_tick() {
        let at = |h, m, s| Utc.with_ymd_and_hms(2024, 6, 1, h, m, s).unwrap();
        assert_eq!(next_tick(at(12, 0, 0), Duration::from_secs(60)), at(12, 1, 0));
        assert_eq!(next_tick(at(12, 0, 59), Duration::from_secs(60)), at(12, 1, 0));
        assert_eq!(next_tick(at(12, 3, 7), Duration::from_secs(300)), at(12, 5, 0));
        assert_eq!(
            next_tick(at(12, 0, 0) + TimeDelta::milliseconds(1), Duration::from_secs(60)),
            at(12, 1, 0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_inverters_do_not_delay_power() {
        let device = Arc::new(
            FakeDevice::default()
                .with_power(minutely_power)
                .with_inverters(|_| Ok(inverter_payload(&[("A", origin(), 200.0)])))
                .with_inverter_latency(Duration::from_secs(20 * 60)),
        );
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(origin(), &device, &sink, &["A"]);

        run_for(&scheduler, Duration::from_secs(630)).await;

        assert_eq!(device.n_power_fetches(), 10);
        assert_eq!(power_writes(&sink).len(), 10);
        assert_eq!(device.n_inverter_fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_inverter_report_is_written_once() {
        let report_at = origin() + TimeDelta::seconds(290);
        let device = Arc::new(
            FakeDevice::default()
                .with_power(minutely_power)
                .with_inverters(move |_| Ok(inverter_payload(&[("A", report_at, 231.0)]))),
        );
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(origin(), &device, &sink, &["A"]);

        run_for(&scheduler, Duration::from_secs(630)).await;

        assert_eq!(device.n_power_fetches(), 10);
        assert_eq!(device.n_inverter_fetches(), 2);
        let writes = inverter_writes(&sink);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].inverters[0].last_report_at, report_at);
        assert_eq!(writes[0].polled_at, origin() + TimeDelta::seconds(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_seeded_report_is_not_rewritten() {
        let report_at = origin() + TimeDelta::seconds(290);
        let device = Arc::new(
            FakeDevice::default()
                .with_power(minutely_power)
                .with_inverters(move |_| Ok(inverter_payload(&[("A", report_at, 231.0)]))),
        );
        let sink = Arc::new(RecordingSink::default().with_last_known("A", report_at));
        let scheduler = scheduler(origin(), &device, &sink, &["A"]);

        run_for(&scheduler, Duration::from_secs(630)).await;

        assert_eq!(device.n_inverter_fetches(), 2);
        assert!(inverter_writes(&sink).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_seeding_does_not_delay_power() {
        let device = Arc::new(
            FakeDevice::default()
                .with_power(minutely_power)
                .with_inverters(|_| Ok(inverter_payload(&[("A", origin(), 200.0)]))),
        );
        let sink =
            Arc::new(RecordingSink::default().with_query_latency(Duration::from_secs(20 * 60)));
        let scheduler = scheduler(origin(), &device, &sink, &["A", "B"]);

        run_for(&scheduler, Duration::from_secs(630)).await;

        assert_eq!(device.n_power_fetches(), 10);
        assert_eq!(power_writes(&sink).len(), 10);
        assert_eq!(device.n_inverter_fetches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_midnight_rollover() {
        let origin = Utc.with_ymd_and_hms(2024, 6, 1, 23, 58, 0).unwrap();
        let device = Arc::new(FakeDevice::default().with_power(move |index| {
            Ok(power_payload(origin + seconds(60 * (index + 1)), 1000.0))
        }));
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(origin, &device, &sink, &["A", "B"]);

        run_for(&scheduler, Duration::from_secs(150)).await;

        assert_eq!(device.n_power_fetches(), 2);
        let summaries = sink.summaries();
        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.day, origin.date_naive());
        assert_eq!(summary.finalized_at, Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap());
        assert_eq!(summary.len(), 5);
        assert_eq!(summary.get(&MeasurementKey::Inverter("A".to_owned())), Some(WattHours::ZERO));
        assert_eq!(summary.get(&MeasurementKey::Inverter("B".to_owned())), Some(WattHours::ZERO));
        let production = summary
            .get(&MeasurementKey::Line { category: Category::Production, phase: 0 })
            .unwrap();
        assert_abs_diff_eq!(production.0, 1000.0 / 60.0, epsilon = 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parse_error_skips_only_its_tick() {
        let device = Arc::new(FakeDevice::default().with_power(|index| {
            if index == 1 { Ok(json!({"production": "nope"})) } else { minutely_power(index) }
        }));
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(origin(), &device, &sink, &[]);

        run_for(&scheduler, Duration::from_secs(210)).await;

        assert_eq!(device.n_power_fetches(), 3);
        assert_eq!(power_writes(&sink).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failures_do_not_stop_polling() {
        let device = Arc::new(FakeDevice::default().with_power(minutely_power));
        let sink = Arc::new(RecordingSink::default());
        sink.set_failing(true);
        let scheduler = scheduler(origin(), &device, &sink, &[]);

        run_for(&scheduler, Duration::from_secs(210)).await;

        assert_eq!(device.n_power_fetches(), 3);
        assert_eq!(sink.n_failed_writes(), 3);
        assert!(sink.high_rate().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failure_is_retried_within_the_tick() {
        let device = Arc::new(FakeDevice::default().with_power(|index| {
            if index == 0 {
                Err(FetchError::Network("connection reset".to_owned()))
            } else {
                minutely_power(index)
            }
        }));
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(origin(), &device, &sink, &[]);

        run_for(&scheduler, Duration::from_secs(90)).await;

        assert_eq!(device.n_power_fetches(), 2);
        assert_eq!(power_writes(&sink).len(), 1);
    }
}
