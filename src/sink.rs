pub mod influxdb;
pub mod metrics;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{error::SinkWriteError, rollover::DailySummary, sample::SampleData};

/// Downstream consumer of samples and daily summaries.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write_high_rate(&self, data: &SampleData) -> Result<(), SinkWriteError>;

    async fn write_daily_summary(&self, summary: &DailySummary) -> Result<(), SinkWriteError>;

    /// Latest report time already stored for the inverter, used to seed the freshness filter.
    async fn last_known_timestamp(
        &self,
        _serial: &str,
    ) -> Result<Option<DateTime<Utc>>, SinkWriteError> {
        Ok(None)
    }
}
