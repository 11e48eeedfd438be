use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
};

use chrono::{DateTime, NaiveDate, Utc};
use comfy_table::{Cell, CellAlignment, Table, modifiers, presets};

use crate::{quantity::WattHours, rollover::accumulator::MeasurementKey};

/// Finalized energy totals of a calendar day.
#[must_use]
#[derive(Clone, Debug, PartialEq)]
pub struct DailySummary {
    pub day: NaiveDate,

    /// When the rollover has happened. Daily points are stamped with it.
    pub finalized_at: DateTime<Utc>,

    pub entries: BTreeMap<MeasurementKey, WattHours>,
}

impl DailySummary {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn get(&self, key: &MeasurementKey) -> Option<WattHours> {
        self.entries.get(key).copied()
    }
}

impl Display for DailySummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
            .set_header(vec![
                Cell::new(self.day),
                Cell::new("Energy").set_alignment(CellAlignment::Right),
            ]);
        for (key, energy) in &self.entries {
            table.add_row(vec![
                Cell::new(key),
                Cell::new(energy).set_alignment(CellAlignment::Right),
            ]);
        }
        write!(f, "{table}")
    }
}
