use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, FixedOffset, Local, NaiveDate, Utc};
use serde_with::DeserializeFromStr;

/// Where the calendar day boundary lies.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, DeserializeFromStr)]
pub enum TimeReference {
    Utc,

    /// The host's local time zone.
    #[default]
    Local,

    Fixed(FixedOffset),
}

impl TimeReference {
    pub fn date_of(self, timestamp: DateTime<Utc>) -> NaiveDate {
        match self {
            Self::Utc => timestamp.date_naive(),
            Self::Local => timestamp.with_timezone(&Local).date_naive(),
            Self::Fixed(offset) => timestamp.with_timezone(&offset).date_naive(),
        }
    }
}

impl FromStr for TimeReference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "utc" | "UTC" => Ok(Self::Utc),
            "local" => Ok(Self::Local),
            offset => offset
                .parse::<FixedOffset>()
                .map(Self::Fixed)
                .map_err(|_| format!("expected `utc`, `local`, or an offset like `+02:00`, got `{s}`")),
        }
    }
}

impl Display for TimeReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Utc => write!(f, "utc"),
            Self::Local => write!(f, "local"),
            Self::Fixed(offset) => write!(f, "{offset}"),
        }
    }
}
