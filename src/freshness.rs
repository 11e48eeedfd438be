use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::{prelude::*, sample::InverterSample};

/// Drops inverter reports the gateway has not refreshed since they were last admitted.
///
/// The gateway keeps returning an inverter's last report until the inverter
/// calls in again, so a poll usually repeats data that has already been stored.
#[derive(Debug, Default)]
pub struct FreshnessFilter {
    last_seen: HashMap<String, DateTime<Utc>>,
}

impl FreshnessFilter {
    /// Seed the filter with a timestamp that is already stored downstream.
    ///
    /// Never moves a serial's timestamp backwards.
    pub fn seed(&mut self, serial: impl Into<String>, timestamp: DateTime<Utc>) {
        self.last_seen
            .entry(serial.into())
            .and_modify(|last_seen| *last_seen = (*last_seen).max(timestamp))
            .or_insert(timestamp);
    }

    /// Keep only the samples strictly newer than what has been admitted for their serial.
    pub fn admit(&mut self, samples: impl IntoIterator<Item = InverterSample>) -> Vec<InverterSample> {
        let mut admitted = Vec::new();
        let mut n_stale = 0_usize;
        for sample in samples {
            match self.last_seen.get_mut(&sample.serial) {
                Some(last_seen) if sample.last_report_at <= *last_seen => {
                    n_stale += 1;
                }
                Some(last_seen) => {
                    *last_seen = sample.last_report_at;
                    admitted.push(sample);
                }
                None => {
                    self.last_seen.insert(sample.serial.clone(), sample.last_report_at);
                    admitted.push(sample);
                }
            }
        }
        debug!(n_admitted = admitted.len(), n_stale, "filtered inverter reports");
        admitted
    }

    #[cfg(test)]
    pub fn last_seen(&self, serial: &str) -> Option<DateTime<Utc>> {
        self.last_seen.get(serial).copied()
    }
}
