use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use serde_with::{TimestampSeconds, formats::Flexible, serde_as};

use crate::{error::ParseError, quantity::Watts};

/// Latest report of a single microinverter.
#[must_use]
#[derive(Clone, Debug, PartialEq)]
pub struct InverterSample {
    pub serial: String,
    pub watts: Watts,

    /// When the inverter has reported to the gateway. This is not the poll time:
    /// the gateway only updates it when it receives new data.
    pub last_report_at: DateTime<Utc>,
}

/// Parse the `/api/v1/production/inverters` document.
pub fn parse_inverters(raw: &Value) -> Result<Vec<InverterSample>, ParseError> {
    Vec::<RawInverter>::deserialize(raw)?.into_iter().map(InverterSample::try_from).collect()
}

#[serde_as]
#[derive(Deserialize)]
struct RawInverter {
    #[serde(rename = "serialNumber")]
    serial: String,

    #[serde(rename = "lastReportWatts")]
    watts: f64,

    #[serde_as(as = "TimestampSeconds<i64, Flexible>")]
    #[serde(rename = "lastReportDate")]
    last_report_at: DateTime<Utc>,
}

impl TryFrom<RawInverter> for InverterSample {
    type Error = ParseError;

    fn try_from(raw: RawInverter) -> Result<Self, Self::Error> {
        let serial = raw.serial.trim();
        if serial.is_empty() {
            return Err(ParseError::Missing("serialNumber"));
        }
        if !raw.watts.is_finite() {
            return Err(ParseError::OutOfRange {
                field: "lastReportWatts",
                value: raw.watts.to_string(),
            });
        }
        if raw.last_report_at.timestamp() <= 0 {
            return Err(ParseError::OutOfRange {
                field: "lastReportDate",
                value: raw.last_report_at.to_rfc3339(),
            });
        }
        Ok(Self {
            serial: serial.to_owned(),
            watts: Watts(raw.watts),
            last_report_at: raw.last_report_at,
        })
    }
}
