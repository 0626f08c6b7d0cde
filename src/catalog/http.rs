//! `CatalogClient` over the catalog server's HTTP API.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::error::{CatalogError, Operation};
use super::{AddImage, CatalogClient, RemoveImage};

/// Success code in upload responses.
const UPLOAD_OK: i64 = 0;
/// Success code in remove responses.
const REMOVE_OK: i64 = 200;

/// Connection settings for [`HttpCatalog`].
#[derive(Clone)]
pub struct CatalogConfig {
    /// Base URL, e.g. `http://catalog.local:8080`.
    pub server_url: String,
    pub token: Option<String>,
    /// Sent as `userId`.
    pub owner_id: String,
    /// Sent as `dev`.
    pub device: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for CatalogConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogConfig")
            .field("server_url", &self.server_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("owner_id", &self.owner_id)
            .field("device", &self.device)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RemoveBody<'a> {
    unique_key: &'a str,
    img_name: &'a str,
    dev: &'a str,
    dir: &'a str,
    user_id: serde_json::Value,
}

pub struct HttpCatalog {
    client: Client,
    base_url: String,
    owner_id: String,
    device: String,
}

impl HttpCatalog {
    pub fn new(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("imgsync/", env!("CARGO_PKG_VERSION"))),
        );
        if let Some(token) = &config.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| CatalogError::InvalidToken)?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(CatalogError::Client)?;

        Ok(Self {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            owner_id: config.owner_id.clone(),
            device: config.device.clone(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    /// The remove endpoint wants a numeric `userId` when the ID is numeric.
    fn owner_id_json(&self) -> serde_json::Value {
        self.owner_id
            .parse::<i64>()
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::from(self.owner_id.clone()))
    }
}

/// MIME type for an image file name, by extension.
fn mime_for(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

fn check_code(operation: Operation, body: ApiResponse, expected: i64) -> Result<(), CatalogError> {
    if body.code == expected {
        return Ok(());
    }
    Err(CatalogError::Rejected {
        operation,
        code: body.code,
        message: body.msg.unwrap_or_default(),
    })
}

async fn read_response(
    operation: Operation,
    response: reqwest::Response,
) -> Result<ApiResponse, CatalogError> {
    let status = response.status();
    if !status.is_success() {
        return Err(CatalogError::HttpStatus {
            operation,
            status: status.as_u16(),
        });
    }
    response
        .json::<ApiResponse>()
        .await
        .map_err(|source| CatalogError::Decode { operation, source })
}

#[async_trait]
impl CatalogClient for HttpCatalog {
    async fn add_image(&self, request: &AddImage) -> Result<(), CatalogError> {
        let operation = Operation::Add;
        let part = Part::bytes(request.bytes.clone())
            .file_name(request.file_name.clone())
            .mime_str(mime_for(&request.file_name))
            .map_err(CatalogError::Client)?;
        let form = Form::new()
            .text("uniqueKey", request.content_key.to_string())
            .text("imgName", request.file_name.clone())
            .part("img", part)
            .text("dev", self.device.clone())
            .text("dir", request.source_dir.clone())
            .text("userId", self.owner_id.clone());

        tracing::debug!(key = %request.content_key, file = %request.file_name, bytes = request.bytes.len(), "Uploading image");
        let response = self
            .client
            .post(self.url("images/upload"))
            .multipart(form)
            .send()
            .await
            .map_err(|source| CatalogError::Transport { operation, source })?;

        let body = read_response(operation, response).await?;
        check_code(operation, body, UPLOAD_OK)
    }

    async fn remove_image(&self, request: &RemoveImage) -> Result<(), CatalogError> {
        let operation = Operation::Remove;
        let body = RemoveBody {
            unique_key: request.content_key.as_str(),
            img_name: &request.file_name,
            dev: &self.device,
            dir: &request.source_dir,
            user_id: self.owner_id_json(),
        };

        tracing::debug!(key = %request.content_key, file = %request.file_name, "Removing image");
        let response = self
            .client
            .post(self.url("images/remove"))
            .json(&body)
            .send()
            .await
            .map_err(|source| CatalogError::Transport { operation, source })?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(key = %request.content_key, "Catalog does not hold key; treating remove as done");
            return Ok(());
        }

        let body = read_response(operation, response).await?;
        check_code(operation, body, REMOVE_OK)
    }
}
