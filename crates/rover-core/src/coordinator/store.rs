use async_trait::async_trait;
use reqwest::header::{ETAG, IF_MATCH};
use reqwest::StatusCode;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::client::DeviceClient;
use crate::error::StoreError;
use crate::transport::Endpoint;

/// Document as fetched, with the store's version tag when it sent one.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub document: Value,
    pub version: Option<String>,
}

/// Remote JSON documents addressed by resource path.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn fetch(&self, resource: &str) -> Result<Snapshot, StoreError>;

    /// Replaces the whole document. `version` is the tag of the snapshot the
    /// document was derived from; a store that detects a newer document
    /// answers with `StoreError::Conflict`.
    async fn write(
        &self,
        resource: &str,
        document: &Value,
        version: Option<&str>,
    ) -> Result<(), StoreError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum WriteMethod {
    #[default]
    Post,
    Put,
}

impl WriteMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMethod::Post => "POST",
            WriteMethod::Put => "PUT",
        }
    }
}

/// Device REST resources as a document store.
#[derive(Clone, Debug)]
pub struct HttpDocumentStore {
    http: reqwest::Client,
    endpoint: Endpoint,
    method: WriteMethod,
}

impl HttpDocumentStore {
    pub fn new(client: &DeviceClient, method: WriteMethod) -> Self {
        Self {
            http: client.http().clone(),
            endpoint: client.endpoint().clone(),
            method,
        }
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn fetch(&self, resource: &str) -> Result<Snapshot, StoreError> {
        let url = self.endpoint.resource_url(resource);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StoreError::Status(status.as_u16()));
        }
        let version = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let document: Value = resp
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        if !document.is_object() {
            return Err(StoreError::Decode(format!(
                "`{resource}` is not a JSON object"
            )));
        }
        Ok(Snapshot { document, version })
    }

    async fn write(
        &self,
        resource: &str,
        document: &Value,
        version: Option<&str>,
    ) -> Result<(), StoreError> {
        let url = self.endpoint.resource_url(resource);
        let mut req = match self.method {
            WriteMethod::Post => self.http.post(&url),
            WriteMethod::Put => self.http.put(&url),
        }
        .json(document);
        if let Some(tag) = version {
            req = req.header(IF_MATCH, tag);
        }
        debug!(target: "rover::coordinator", %url, method = self.method.as_str(), "writing document");
        let resp = req
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::CONFLICT || status == StatusCode::PRECONDITION_FAILED {
            Err(StoreError::Conflict(format!("{} on {resource}", status.as_u16())))
        } else {
            Err(StoreError::Status(status.as_u16()))
        }
    }
}
