use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};

use crate::{
    quantity::{Hours, WattHours, Watts},
    rollover::summary::DailySummary,
    sample::Category,
};

/// What a daily energy total is kept for.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
pub enum MeasurementKey {
    #[display("{category}-line{phase}")]
    Line { category: Category, phase: usize },

    #[display("inverter-{_0}")]
    Inverter(String),
}

/// Running trapezoidal integral of a single key.
#[derive(Copy, Clone, Debug)]
struct Integrator {
    energy: WattHours,
    last_at: DateTime<Utc>,
    last_power: Watts,
}

impl Integrator {
    /// The first sample is the baseline and carries no energy.
    const fn baseline(at: DateTime<Utc>, power: Watts) -> Self {
        Self { energy: WattHours::ZERO, last_at: at, last_power: power }
    }

    /// Add the trapezoid between the previous and the new sample.
    ///
    /// Samples that are not newer than the previous one are ignored.
    fn push(&mut self, at: DateTime<Utc>, power: Watts) {
        if at <= self.last_at {
            return;
        }
        self.energy += self.last_power.average(power) * Hours::from(at - self.last_at);
        self.last_at = at;
        self.last_power = power;
    }
}

/// Energy totals of a single calendar day.
#[derive(Debug)]
pub struct DailyAccumulator {
    day: NaiveDate,
    entries: BTreeMap<MeasurementKey, Integrator>,
}

impl DailyAccumulator {
    pub const fn new(day: NaiveDate) -> Self {
        Self { day, entries: BTreeMap::new() }
    }

    pub const fn day(&self) -> NaiveDate {
        self.day
    }

    pub fn ingest(&mut self, key: MeasurementKey, at: DateTime<Utc>, power: Watts) {
        self.entries
            .entry(key)
            .and_modify(|integrator| integrator.push(at, power))
            .or_insert_with(|| Integrator::baseline(at, power));
    }

    #[cfg(test)]
    pub fn energy(&self, key: &MeasurementKey) -> Option<WattHours> {
        self.entries.get(key).map(|integrator| integrator.energy)
    }

    /// Close the day, adding zero totals for configured inverters that have never reported.
    pub fn finalize(
        self,
        finalized_at: DateTime<Utc>,
        configured_inverters: &BTreeSet<String>,
    ) -> DailySummary {
        let mut entries: BTreeMap<_, _> = self
            .entries
            .into_iter()
            .map(|(key, integrator)| (key, integrator.energy))
            .collect();
        for serial in configured_inverters {
            entries.entry(MeasurementKey::Inverter(serial.clone())).or_insert(WattHours::ZERO);
        }
        DailySummary { day: self.day, finalized_at, entries }
    }
}
