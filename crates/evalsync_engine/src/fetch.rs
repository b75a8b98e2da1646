use std::time::Duration;

use evalsync_core::{ClientConfig, StatusSnapshot};
use evalsync_logging::sync_debug;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::{FailureKind, FetchError};

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_bytes: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            max_bytes: 4 * 1024 * 1024,
        }
    }
}

impl FetchSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        let request_timeout = config.request_timeout();
        Self {
            connect_timeout: request_timeout.min(Self::default().connect_timeout),
            request_timeout,
            ..Self::default()
        }
    }
}

/// REST side of the sync client.
#[async_trait::async_trait]
pub trait StatusClient: Send + Sync {
    /// `GET {api}/evaluations/{id}`
    async fn fetch_status(&self, evaluation_id: &str) -> Result<StatusSnapshot, FetchError>;

    /// `GET {api}/evaluations`
    async fn fetch_list(&self) -> Result<Vec<StatusSnapshot>, FetchError>;
}

/// The list endpoint returns either a bare array or a wrapped page.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListBody {
    Items(Vec<StatusSnapshot>),
    Page {
        #[serde(alias = "items", alias = "results")]
        evaluations: Vec<StatusSnapshot>,
    },
}

#[derive(Debug, Clone)]
pub struct ReqwestStatusClient {
    client: reqwest::Client,
    config: ClientConfig,
    settings: FetchSettings,
}

impl ReqwestStatusClient {
    pub fn new(config: ClientConfig, settings: FetchSettings) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| FetchError::new(FailureKind::Network, err.to_string()))?;
        Ok(Self {
            client,
            config,
            settings,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|err| FetchError::new(FailureKind::InvalidUrl, err.to_string()))?;

        let response = self
            .client
            .get(parsed)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::new(
                FailureKind::HttpStatus(status.as_u16()),
                status.to_string(),
            ));
        }

        if let Some(content_len) = response.content_length() {
            if content_len > self.settings.max_bytes {
                return Err(FetchError::new(
                    FailureKind::TooLarge {
                        max_bytes: self.settings.max_bytes,
                        actual: Some(content_len),
                    },
                    "response too large",
                ));
            }
        }

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            let next_len = bytes.len() as u64 + chunk.len() as u64;
            if next_len > self.settings.max_bytes {
                return Err(FetchError::new(
                    FailureKind::TooLarge {
                        max_bytes: self.settings.max_bytes,
                        actual: Some(next_len),
                    },
                    "response too large",
                ));
            }
            bytes.extend_from_slice(&chunk);
        }
        sync_debug!("GET {} -> {} ({} bytes)", url, status, bytes.len());

        serde_json::from_slice(&bytes)
            .map_err(|err| FetchError::new(FailureKind::Decode, err.to_string()))
    }
}

#[async_trait::async_trait]
impl StatusClient for ReqwestStatusClient {
    async fn fetch_status(&self, evaluation_id: &str) -> Result<StatusSnapshot, FetchError> {
        let url = self.config.evaluation_url(evaluation_id);
        let mut snapshot: StatusSnapshot = self.get_json(&url).await?;
        if snapshot.id.is_empty() {
            snapshot.id = evaluation_id.to_string();
        }
        Ok(snapshot)
    }

    async fn fetch_list(&self) -> Result<Vec<StatusSnapshot>, FetchError> {
        let url = self.config.evaluations_url();
        Ok(match self.get_json(&url).await? {
            ListBody::Items(items) => items,
            ListBody::Page { evaluations } => evaluations,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::new(FailureKind::Timeout, err.to_string());
    }
    if err.is_decode() {
        return FetchError::new(FailureKind::Decode, err.to_string());
    }
    FetchError::new(FailureKind::Network, err.to_string())
}
