pub mod envoy;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::FetchError;

/// The local gateway, as seen by the sampling engine.
///
/// Implementations own their session: [`DeviceClient::authenticate`] refreshes it
/// and must be safe to call repeatedly.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn authenticate(&self) -> Result<(), FetchError>;

    async fn fetch_power(&self) -> Result<Value, FetchError>;

    async fn fetch_inverters(&self) -> Result<Value, FetchError>;
}
