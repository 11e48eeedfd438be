use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use serde_with::{TimestampSeconds, formats::Flexible, serde_as};

use crate::{
    error::ParseError,
    quantity::{Amperes, VoltAmperes, VoltAmperesReactive, Volts, Watts},
};

/// The gateway meters at most three phases.
pub const MAX_PHASES: usize = 3;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
pub enum Category {
    #[display("production")]
    Production,

    #[display("consumption")]
    Consumption,

    #[display("net")]
    Net,
}

impl Category {
    pub const ALL: [Self; 3] = [Self::Production, Self::Consumption, Self::Net];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Consumption => "consumption",
            Self::Net => "net",
        }
    }

    fn from_measurement_type(measurement_type: &str) -> Option<Self> {
        match measurement_type {
            "production" => Some(Self::Production),
            "total-consumption" => Some(Self::Consumption),
            "net-consumption" => Some(Self::Net),
            _ => None,
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Production => 0,
            Self::Consumption => 1,
            Self::Net => 2,
        }
    }
}

/// Single-phase reading of one meter.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LineReading {
    pub power: Watts,
    pub reactive_power: VoltAmperesReactive,
    pub apparent_power: VoltAmperes,
    pub voltage: Volts,
    pub current: Amperes,
}

#[must_use]
#[derive(Clone, Debug, PartialEq)]
pub struct PowerSample {
    /// Meter reading time as reported by the gateway.
    pub timestamp: DateTime<Utc>,

    /// Per-category phase readings, indexed by [`Category::index`].
    lines: [Vec<LineReading>; 3],
}

impl PowerSample {
    pub fn lines(&self, category: Category) -> &[LineReading] {
        &self.lines[category.index()]
    }

    /// All readings as `(category, phase, reading)`.
    pub fn iter(&self) -> impl Iterator<Item = (Category, usize, &LineReading)> {
        Category::ALL.into_iter().flat_map(move |category| {
            self.lines(category).iter().enumerate().map(move |(phase, line)| (category, phase, line))
        })
    }
}

/// Parse the `production.json?details=1` document.
///
/// Only the `eim` meters are used: production, total consumption and net consumption
/// must all be present, each with one to three lines.
pub fn parse_power(raw: &Value) -> Result<PowerSample, ParseError> {
    let payload = RawPowerPayload::deserialize(raw)?;

    let mut timestamp = None;
    let mut lines: [Option<Vec<LineReading>>; 3] = Default::default();
    for meter in payload.production.iter().chain(&payload.consumption) {
        if meter.kind != "eim" {
            continue;
        }
        let Some(category) =
            meter.measurement_type.as_deref().and_then(Category::from_measurement_type)
        else {
            continue;
        };
        if meter.lines.is_empty() {
            return Err(ParseError::Missing("lines"));
        }
        if meter.lines.len() > MAX_PHASES {
            return Err(ParseError::OutOfRange {
                field: "lines",
                value: meter.lines.len().to_string(),
            });
        }
        if category == Category::Production {
            timestamp = meter.reading_time;
        }
        lines[category.index()] =
            Some(meter.lines.iter().map(LineReading::try_from).collect::<Result<_, _>>()?);
    }

    let timestamp = timestamp.ok_or(ParseError::Missing("readingTime"))?;
    if timestamp.timestamp() <= 0 {
        return Err(ParseError::OutOfRange { field: "readingTime", value: timestamp.to_rfc3339() });
    }
    let [production, consumption, net] = lines;
    Ok(PowerSample {
        timestamp,
        lines: [
            production.ok_or(ParseError::Missing("production meter"))?,
            consumption.ok_or(ParseError::Missing("total consumption meter"))?,
            net.ok_or(ParseError::Missing("net consumption meter"))?,
        ],
    })
}

#[derive(Deserialize)]
struct RawPowerPayload {
    #[serde(default)]
    production: Vec<RawMeter>,

    #[serde(default)]
    consumption: Vec<RawMeter>,
}

#[serde_as]
#[derive(Deserialize)]
struct RawMeter {
    #[serde(rename = "type")]
    kind: String,

    #[serde(rename = "measurementType")]
    measurement_type: Option<String>,

    #[serde_as(as = "Option<TimestampSeconds<i64, Flexible>>")]
    #[serde(rename = "readingTime", default)]
    reading_time: Option<DateTime<Utc>>,

    #[serde(default)]
    lines: Vec<RawLine>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLine {
    w_now: f64,
    react_pwr: f64,
    apprnt_pwr: f64,
    rms_voltage: f64,
    rms_current: f64,
}

impl TryFrom<&RawLine> for LineReading {
    type Error = ParseError;

    fn try_from(raw: &RawLine) -> Result<Self, Self::Error> {
        for (field, value) in [
            ("wNow", raw.w_now),
            ("reactPwr", raw.react_pwr),
            ("apprntPwr", raw.apprnt_pwr),
            ("rmsVoltage", raw.rms_voltage),
            ("rmsCurrent", raw.rms_current),
        ] {
            if !value.is_finite() {
                return Err(ParseError::OutOfRange { field, value: value.to_string() });
            }
        }
        if raw.rms_voltage < 0.0 {
            return Err(ParseError::OutOfRange {
                field: "rmsVoltage",
                value: raw.rms_voltage.to_string(),
            });
        }
        Ok(Self {
            power: Watts(raw.w_now),
            reactive_power: VoltAmperesReactive(raw.react_pwr),
            apparent_power: VoltAmperes(raw.apprnt_pwr),
            voltage: Volts(raw.rms_voltage),
            current: Amperes(raw.rms_current),
        })
    }
}
