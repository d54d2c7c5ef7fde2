//! Operator client for the update server's HTTP API

use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::PublishError;
use crate::engine::models::{Device, UpdatePolicy, UpdateRecord};

/// Fields of a `POST /api/updates` multipart upload
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub version: String,
    pub description: String,
    pub requires_system_packages: bool,
    pub system_packages: Vec<String>,
    pub policy: UpdatePolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerHealth {
    pub status: String,
    pub version: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

pub struct OperatorClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OperatorClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("devfleet/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
    }

    pub async fn health(&self) -> Result<ServerHealth, PublishError> {
        let response = self
            .client
            .get(format!("{}/api/health", self.base_url))
            .send()
            .await?;
        decode(response).await
    }

    pub async fn upload(
        &self,
        request: &UploadRequest,
        package: Vec<u8>,
    ) -> Result<UpdateRecord, PublishError> {
        let file_name = format!("{}.tar.gz", request.version);
        let form = Form::new()
            .text("version", request.version.clone())
            .text("description", request.description.clone())
            .text(
                "requires_system_packages",
                request.requires_system_packages.to_string(),
            )
            .text(
                "system_packages",
                serde_json::to_string(&request.system_packages)?,
            )
            .text("policy", request.policy.as_str())
            .part(
                "package",
                Part::bytes(package)
                    .file_name(file_name)
                    .mime_str("application/gzip")?,
            );

        let response = self.post("/api/updates").multipart(form).send().await?;
        decode(response).await
    }

    pub async fn list_updates(&self) -> Result<Vec<UpdateRecord>, PublishError> {
        decode(self.get("/api/updates").send().await?).await
    }

    pub async fn get_update(&self, version: &str) -> Result<UpdateRecord, PublishError> {
        decode(self.get(&format!("/api/updates/{}", version)).send().await?).await
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>, PublishError> {
        decode(self.get("/api/devices").send().await?).await
    }

    pub async fn get_device(&self, uuid: &str) -> Result<Device, PublishError> {
        decode(self.get(&format!("/api/devices/{}", uuid)).send().await?).await
    }

    pub async fn deactivate(&self, uuid: &str) -> Result<Device, PublishError> {
        decode(
            self.post(&format!("/api/devices/{}/deactivate", uuid))
                .send()
                .await?,
        )
        .await
    }

    pub async fn reactivate(&self, uuid: &str) -> Result<Device, PublishError> {
        decode(
            self.post(&format!("/api/devices/{}/reactivate", uuid))
                .send()
                .await?,
        )
        .await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, PublishError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body = response.json::<ErrorBody>().await.unwrap_or(ErrorBody {
        error: String::new(),
        message: String::new(),
    });
    Err(match status {
        StatusCode::UNAUTHORIZED => PublishError::Unauthorized,
        StatusCode::CONFLICT => PublishError::Conflict(body.message),
        StatusCode::NOT_FOUND => PublishError::NotFound(body.message),
        _ => PublishError::Server {
            status: status.as_u16(),
            code: body.error,
            message: body.message,
        },
    })
}
