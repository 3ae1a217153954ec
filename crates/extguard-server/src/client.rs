use crate::{ClusterExtensionList, Status};
use extguard_schema::{ClusterExtension, ResourceName};
use std::io::Read;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered with a `Status`; Display is the server's message.
    #[error("{}", .0.message)]
    Status(Status),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ClientError {
    /// HTTP code of a server-side rejection, if this is one.
    pub fn code(&self) -> Option<u16> {
        match self {
            ClientError::Status(s) => Some(s.code),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ClientError::Status(s) => Some(&s.reason),
            _ => None,
        }
    }
}

/// Blocking client for the extguard HTTP routes.
pub struct HttpClient {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            agent: config.into(),
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/apis/clusterextensions", self.base_url)
    }

    fn item_url(&self, name: &ResourceName) -> String {
        format!("{}/{name}", self.collection_url())
    }

    /// The server's reported health: `ok`, `syncing` or `degraded`.
    pub fn health(&self) -> Result<String, ClientError> {
        let url = format!("{}/healthz", self.base_url);
        tracing::debug!("GET {url}");
        let resp = self
            .agent
            .get(&url)
            .call()
            .map_err(|e| ClientError::Http(e.to_string()))?;
        // degraded servers answer 503 with the same body
        let body: serde_json::Value = serde_json::from_slice(&read_body(resp)?)
            .map_err(|e| ClientError::Serialization(e.to_string()))?;
        Ok(body["status"].as_str().unwrap_or_default().to_owned())
    }

    pub fn list(&self) -> Result<ClusterExtensionList, ClientError> {
        let url = self.collection_url();
        tracing::debug!("GET {url}");
        decode(self.agent.get(&url).call())
    }

    pub fn get(&self, name: &ResourceName) -> Result<ClusterExtension, ClientError> {
        let url = self.item_url(name);
        tracing::debug!("GET {url}");
        decode(self.agent.get(&url).call())
    }

    pub fn create(&self, obj: &ClusterExtension) -> Result<ClusterExtension, ClientError> {
        let url = self.collection_url();
        tracing::debug!("POST {url}");
        let body = encode(obj)?;
        decode(
            self.agent
                .post(&url)
                .header("Content-Type", "application/json")
                .send(&body[..]),
        )
    }

    pub fn update(&self, obj: &ClusterExtension) -> Result<ClusterExtension, ClientError> {
        let url = self.item_url(obj.name());
        tracing::debug!("PUT {url}");
        let body = encode(obj)?;
        decode(
            self.agent
                .put(&url)
                .header("Content-Type", "application/json")
                .send(&body[..]),
        )
    }

    pub fn delete(&self, name: &ResourceName) -> Result<ClusterExtension, ClientError> {
        let url = self.item_url(name);
        tracing::debug!("DELETE {url}");
        decode(self.agent.delete(&url).call())
    }
}

fn encode(obj: &ClusterExtension) -> Result<Vec<u8>, ClientError> {
    serde_json::to_vec(obj).map_err(|e| ClientError::Serialization(e.to_string()))
}

fn read_body(resp: ureq::http::Response<ureq::Body>) -> Result<Vec<u8>, ClientError> {
    let mut body = Vec::new();
    resp.into_body()
        .into_reader()
        .read_to_end(&mut body)
        .map_err(|e| ClientError::Http(e.to_string()))?;
    Ok(body)
}

fn decode<T: serde::de::DeserializeOwned>(
    result: Result<ureq::http::Response<ureq::Body>, ureq::Error>,
) -> Result<T, ClientError> {
    let resp = result.map_err(|e| ClientError::Http(e.to_string()))?;
    let code = resp.status().as_u16();
    let body = read_body(resp)?;

    if code >= 400 {
        return Err(match serde_json::from_slice::<Status>(&body) {
            Ok(status) => ClientError::Status(status),
            Err(_) => ClientError::Http(format!("HTTP {code}")),
        });
    }
    serde_json::from_slice(&body).map_err(|e| ClientError::Serialization(e.to_string()))
}
