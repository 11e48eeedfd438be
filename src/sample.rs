mod inverter;
mod power;

use chrono::{DateTime, Utc};

pub use self::{
    inverter::{InverterSample, parse_inverters},
    power::{Category, LineReading, PowerSample, parse_power},
};

/// Everything a single poll cycle has produced.
///
/// The cadences are independent: a power cycle fills in [`SampleData::power`],
/// an inverter cycle fills in [`SampleData::inverters`].
#[must_use]
#[derive(Clone, Debug)]
pub struct SampleData {
    pub polled_at: DateTime<Utc>,
    pub power: Option<PowerSample>,
    pub inverters: Vec<InverterSample>,
}

impl SampleData {
    pub const fn from_power(polled_at: DateTime<Utc>, power: PowerSample) -> Self {
        Self { polled_at, power: Some(power), inverters: Vec::new() }
    }

    pub const fn from_inverters(polled_at: DateTime<Utc>, inverters: Vec<InverterSample>) -> Self {
        Self { polled_at, power: None, inverters }
    }
}
