//! GoFile external host.
//!
//! Flow: `GET {api}/servers`, pick one of the listed servers at random, then
//! a multipart `POST` of the file (streamed from disk) to that server's
//! `uploadFile` endpoint. The response carries the public `downloadPage`.

use std::path::Path;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::io::ReaderStream;

use super::{DeliveryError, ExternalHost, HostedFile};
use crate::progress::{ProgressMeter, ProgressReader, ProgressSink, Stage};

/// GoFile refuses single files above 10 GB.
pub const GOFILE_MAX_BYTES: u64 = 10 * 1024 * 1024 * 1024;

const DEFAULT_UPLOAD_URL: &str = "https://{server}.gofile.io/uploadFile";

#[derive(Debug, Deserialize)]
struct ServerList {
    servers: Vec<Server>,
}

#[derive(Debug, Deserialize)]
struct Server {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadedFile {
    download_page: String,
    #[serde(default)]
    file_id: Option<String>,
}

pub struct GofileUploader {
    client: Client,
    api_url: String,
    upload_url_template: String,
    token: Option<SecretString>,
}

impl GofileUploader {
    pub fn new(client: Client, api_url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            upload_url_template: DEFAULT_UPLOAD_URL.to_string(),
            token,
        }
    }

    /// Overrides the upload endpoint; `{server}` is replaced with the picked
    /// server name.
    #[must_use]
    pub fn with_upload_url(mut self, template: impl Into<String>) -> Self {
        self.upload_url_template = template.into();
        self
    }

    async fn pick_server(&self) -> Result<String, DeliveryError> {
        let response = self.client.get(format!("{}/servers", self.api_url)).send().await?;
        if !response.status().is_success() {
            return Err(DeliveryError::HostStatus(response.status().as_u16()));
        }
        let body: Value = response.json().await?;
        let list: ServerList = unwrap_envelope(body)?;

        if list.servers.is_empty() {
            return Err(DeliveryError::Host("no upload server available".to_string()));
        }
        let index = rand::random::<u32>() as usize % list.servers.len();
        let server = list.servers[index].name.clone();
        log::info!("Selected GoFile server: {}", server);
        Ok(server)
    }
}

/// GoFile wraps every answer in `{"status": "ok", "data": {...}}`.
fn unwrap_envelope<T: for<'de> Deserialize<'de>>(body: Value) -> Result<T, DeliveryError> {
    let status = body.get("status").and_then(Value::as_str).unwrap_or("missing status");
    if status != "ok" {
        return Err(DeliveryError::Host(status.to_string()));
    }
    let data = body.get("data").cloned().unwrap_or(Value::Null);
    serde_json::from_value(data).map_err(|e| DeliveryError::Host(format!("unexpected response: {}", e)))
}

#[async_trait]
impl ExternalHost for GofileUploader {
    async fn upload(&self, path: &Path, progress: &ProgressSink) -> Result<HostedFile, DeliveryError> {
        let size = fs_err::tokio::metadata(path).await?.len();
        if size > GOFILE_MAX_BYTES {
            return Err(DeliveryError::TooLarge {
                size,
                limit: GOFILE_MAX_BYTES,
            });
        }

        let server = self.pick_server().await?;
        let upload_url = self.upload_url_template.replace("{server}", &server);

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("merged.mp4")
            .to_string();
        let file = fs_err::tokio::File::open(path).await?;
        let counted = ProgressReader::new(file, ProgressMeter::new(Stage::Uploading, Some(size)), progress.clone());
        let body = Body::wrap_stream(ReaderStream::new(counted));
        let part = Part::stream_with_length(body, size)
            .file_name(file_name)
            .mime_str("application/octet-stream")?;

        let mut form = Form::new();
        if let Some(token) = &self.token {
            form = form.text("token", token.expose_secret().to_string());
        }
        form = form.part("file", part);

        let response = self.client.post(&upload_url).multipart(form).send().await?;
        if !response.status().is_success() {
            return Err(DeliveryError::HostStatus(response.status().as_u16()));
        }
        let body: Value = response.json().await?;
        let uploaded: UploadedFile = unwrap_envelope(body)?;

        Ok(HostedFile {
            link: uploaded.download_page,
            file_id: uploaded.file_id,
        })
    }
}
