use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{StatusCode, Url, cookie::Jar, header::AUTHORIZATION};
use serde_json::Value;

use crate::{
    device::DeviceClient,
    error::{FetchError, ParseError},
    prelude::*,
};

/// Local Envoy gateway API.
pub struct Client {
    inner: reqwest::Client,
    check_jwt_url: Url,
    power_url: Url,
    inverters_url: Url,

    /// Bearer token. The gateway also hands out a session cookie, which lives in the client's jar.
    token: String,
}

impl Client {
    #[instrument(skip_all, fields(base_url = %base_url))]
    pub fn try_new(base_url: &Url, token: String, timeout: Duration) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .cookie_provider(Arc::new(Jar::default()))
            .danger_accept_invalid_certs(true) // the gateway's certificate is self-signed
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            inner,
            check_jwt_url: base_url.join("/auth/check_jwt")?,
            power_url: base_url.join("/production.json?details=1")?,
            inverters_url: base_url.join("/api/v1/production/inverters")?,
            token,
        })
    }

    async fn get(&self, url: &Url) -> Result<reqwest::Response, FetchError> {
        let response = self
            .inner
            .get(url.clone())
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|error| FetchError::Network(format!("`{url}`: {error}")))?;
        check_status(response.status())?;
        Ok(response)
    }

    #[instrument(skip_all, fields(url = %url))]
    async fn get_json(&self, url: &Url) -> Result<Value, FetchError> {
        let body = self
            .get(url)
            .await?
            .bytes()
            .await
            .map_err(|error| FetchError::Network(format!("`{url}`: {error}")))?;
        let value = serde_json::from_slice(&body).map_err(ParseError::from)?;
        debug!(n_bytes = body.len(), "fetched");
        Ok(value)
    }
}

#[async_trait]
impl DeviceClient for Client {
    #[instrument(skip_all)]
    async fn authenticate(&self) -> Result<(), FetchError> {
        self.get(&self.check_jwt_url).await?;
        info!("the gateway has accepted the token");
        Ok(())
    }

    async fn fetch_power(&self) -> Result<Value, FetchError> {
        self.get_json(&self.power_url).await
    }

    async fn fetch_inverters(&self) -> Result<Value, FetchError> {
        self.get_json(&self.inverters_url).await
    }
}

fn check_status(status: StatusCode) -> Result<(), FetchError> {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(FetchError::Auth(status.to_string())),
        status if status.is_success() => Ok(()),
        status => Err(FetchError::Network(status.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_status() {
        assert!(check_status(StatusCode::OK).is_ok());
        assert!(matches!(check_status(StatusCode::UNAUTHORIZED), Err(FetchError::Auth(_))));
        assert!(matches!(check_status(StatusCode::FORBIDDEN), Err(FetchError::Auth(_))));
        assert!(matches!(
            check_status(StatusCode::SERVICE_UNAVAILABLE),
            Err(FetchError::Network(_))
        ));
        assert!(matches!(check_status(StatusCode::NOT_FOUND), Err(FetchError::Network(_))));
    }

    #[test]
    fn test_endpoints() -> Result {
        let client =
            Client::try_new(&"https://envoy.local".parse()?, "token".to_owned(), Duration::from_secs(10))?;
        assert_eq!(client.check_jwt_url.as_str(), "https://envoy.local/auth/check_jwt");
        assert_eq!(client.power_url.as_str(), "https://envoy.local/production.json?details=1");
        assert_eq!(
            client.inverters_url.as_str(),
            "https://envoy.local/api/v1/production/inverters"
        );
        Ok(())
    }
}
