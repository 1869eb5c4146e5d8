use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{ConfigurationError, PollError};
use crate::poller::Fetch;
use crate::transport::Endpoint;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

fn user_agent() -> String {
    format!("rover-bridge/{}", env!("CARGO_PKG_VERSION"))
}

/// Identity block of the device's `/info` document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub app_version: Option<String>,
}

impl DeviceInfo {
    pub fn from_info(doc: &Value) -> Result<Self, PollError> {
        match doc.get("device") {
            Some(device) if device.is_object() => serde_json::from_value(device.clone())
                .map_err(|e| PollError::Decode(format!("device block: {e}"))),
            Some(_) => Err(PollError::Decode("`device` is not an object".into())),
            None => Ok(DeviceInfo::default()),
        }
    }
}

/// Plain GET access to the device's REST resources.
#[derive(Clone, Debug)]
pub struct DeviceClient {
    http: reqwest::Client,
    endpoint: Endpoint,
}

impl DeviceClient {
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Result<Self, ConfigurationError> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent())
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigurationError::Client(e.to_string()))?;
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub async fn get_json(&self, path: &str) -> Result<Value, PollError> {
        let url = self.endpoint.resource_url(path);
        debug!(target: "rover::client", %url, "GET");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| PollError::Request(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PollError::Status(status.as_u16()));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| PollError::Decode(e.to_string()))
    }

    pub async fn info(&self) -> Result<DeviceInfo, PollError> {
        let doc = self.get_json(rover_topics::RESOURCE_INFO).await?;
        DeviceInfo::from_info(&doc)
    }

    /// A poller fetch bound to one resource path.
    pub fn fetcher(&self, path: impl Into<String>) -> ResourceFetcher {
        ResourceFetcher {
            client: self.clone(),
            path: path.into(),
        }
    }
}

pub struct ResourceFetcher {
    client: DeviceClient,
    path: String,
}

#[async_trait]
impl Fetch for ResourceFetcher {
    async fn fetch(&self) -> Result<Value, PollError> {
        self.client.get_json(&self.path).await
    }
}
