mod accumulator;
mod summary;
mod time_reference;

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};

pub use self::{
    accumulator::{DailyAccumulator, MeasurementKey},
    summary::DailySummary,
    time_reference::TimeReference,
};
use crate::{
    prelude::*,
    quantity::{WattHours, Watts},
    sample::{InverterSample, PowerSample},
};

/// Integrates power into daily energy totals and closes each day exactly once.
#[derive(Debug)]
pub struct DailyAggregator {
    time_reference: TimeReference,
    configured_inverters: BTreeSet<String>,
    accumulator: DailyAccumulator,
}

impl DailyAggregator {
    pub fn new(
        now: DateTime<Utc>,
        time_reference: TimeReference,
        configured_inverters: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            time_reference,
            configured_inverters: configured_inverters.into_iter().collect(),
            accumulator: DailyAccumulator::new(time_reference.date_of(now)),
        }
    }

    /// The day being accumulated.
    pub const fn day(&self) -> NaiveDate {
        self.accumulator.day()
    }

    pub const fn configured_inverters(&self) -> &BTreeSet<String> {
        &self.configured_inverters
    }

    #[cfg(test)]
    pub fn energy(&self, key: &MeasurementKey) -> Option<WattHours> {
        self.accumulator.energy(key)
    }

    /// Only real power is integrated, per line.
    pub fn ingest_power(&mut self, sample: &PowerSample) {
        for (category, phase, line) in sample.iter() {
            self.ingest(MeasurementKey::Line { category, phase }, sample.timestamp, line.power);
        }
    }

    /// Inverter energy is integrated against the inverters' own report times.
    pub fn ingest_inverters(&mut self, samples: &[InverterSample]) {
        for sample in samples {
            self.ingest(
                MeasurementKey::Inverter(sample.serial.clone()),
                sample.last_report_at,
                sample.watts,
            );
        }
    }

    /// Samples dated before the accumulated day belong to a day that has already been closed.
    fn ingest(&mut self, key: MeasurementKey, at: DateTime<Utc>, power: Watts) {
        let sample_day = self.time_reference.date_of(at);
        if sample_day < self.day() {
            debug!(%key, %at, %sample_day, "dropping a sample of a finalized day");
            return;
        }
        self.accumulator.ingest(key, at, power);
    }

    /// Finalize the current day if `now` belongs to a later one.
    ///
    /// A clock that has stepped back never rolls over. Skipped days produce no summaries.
    #[instrument(skip_all, fields(day = %self.day()))]
    pub fn maybe_roll_over(&mut self, now: DateTime<Utc>) -> Option<DailySummary> {
        let today = self.time_reference.date_of(now);
        if today <= self.day() {
            if today < self.day() {
                warn!(%today, "the clock is behind the accumulated day, not rolling over");
            }
            return None;
        }
        let finished = std::mem::replace(&mut self.accumulator, DailyAccumulator::new(today));
        let summary = finished.finalize(now, &self.configured_inverters);
        info!(%today, n_entries = summary.len(), "rolled over");
        Some(summary)
    }
}
