//! Update server client, as seen from a device
//!
//! [`UpdateSource`] is the seam between the agent and the server. The HTTP
//! implementation identifies the device with the `x-device-uuid` header.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::download::{CancelToken, DownloadError, DownloadResult, Downloader};
use crate::engine::models::{Device, HeartbeatRequest, RegisterRequest, UpdateRecord};
use crate::engine::version::Version;

pub const DEVICE_HEADER: &str = "x-device-uuid";

/// Whole-request bound for register, latest and heartbeat calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Longest wait for the next package chunk
pub const STALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Device is not authorized")]
    Forbidden,
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Server answered {status}: {message}")]
    Server { status: u16, message: String },
    #[error(transparent)]
    Download(#[from] DownloadError),
}

#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn register(&self, request: &RegisterRequest) -> Result<Device, SourceError>;

    /// Latest published update, or `None` when nothing has been published
    async fn latest(&self, uuid: &str) -> Result<Option<UpdateRecord>, SourceError>;

    async fn download(
        &self,
        uuid: &str,
        version: &Version,
        dest: &Path,
        cancel: &CancelToken,
    ) -> Result<DownloadResult, SourceError>;

    async fn heartbeat(&self, uuid: &str, report: &HeartbeatRequest) -> Result<(), SourceError>;
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

pub struct HttpUpdateSource {
    base_url: String,
    client: reqwest::Client,
    request_timeout: Duration,
    downloader: Downloader,
}

impl HttpUpdateSource {
    pub fn new(base_url: &str) -> Result<Self, SourceError> {
        Self::with_timeouts(base_url, REQUEST_TIMEOUT, STALL_TIMEOUT)
    }

    pub fn with_timeouts(
        base_url: &str,
        request_timeout: Duration,
        stall_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("devfleet-agent/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            request_timeout,
            downloader: Downloader::new(stall_timeout),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, SourceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::FORBIDDEN {
            return Err(SourceError::Forbidden);
        }
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|b| b.message)
            .unwrap_or_default();
        Err(SourceError::Server {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl UpdateSource for HttpUpdateSource {
    async fn register(&self, request: &RegisterRequest) -> Result<Device, SourceError> {
        let response = self
            .client
            .post(self.url("/api/devices"))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn latest(&self, uuid: &str) -> Result<Option<UpdateRecord>, SourceError> {
        let response = self
            .client
            .get(self.url(&format!("/api/devices/{}/updates/latest", uuid)))
            .timeout(self.request_timeout)
            .header(DEVICE_HEADER, uuid)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::check(response).await?.json().await?))
    }

    async fn download(
        &self,
        uuid: &str,
        version: &Version,
        dest: &Path,
        cancel: &CancelToken,
    ) -> Result<DownloadResult, SourceError> {
        let request = self
            .client
            .get(self.url(&format!("/api/updates/{}/package", version)))
            .header(DEVICE_HEADER, uuid);
        self.downloader
            .download(request, dest, cancel, |downloaded, total| {
                tracing::trace!(downloaded, total, "download progress");
            })
            .await
            .map_err(|e| match e {
                DownloadError::Forbidden => SourceError::Forbidden,
                other => other.into(),
            })
    }

    async fn heartbeat(&self, uuid: &str, report: &HeartbeatRequest) -> Result<(), SourceError> {
        let response = self
            .client
            .post(self.url(&format!("/api/devices/{}/heartbeat", uuid)))
            .timeout(self.request_timeout)
            .header(DEVICE_HEADER, uuid)
            .json(report)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let source = HttpUpdateSource::new("http://fleet.local:54380/").unwrap();
        assert_eq!(
            source.url("/api/health"),
            "http://fleet.local:54380/api/health"
        );
    }

    #[tokio::test]
    async fn test_stalled_server_fails_latest() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = socket.read(&mut request).await;
                held.push(socket);
            }
        });

        let source = HttpUpdateSource::with_timeouts(
            &format!("http://{addr}"),
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            source.latest("6f9619ff-8b86-d011-b42d-00c04fc964ff"),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(SourceError::Network(ref e)) if e.is_timeout()), "{result:?}");
    }
}
