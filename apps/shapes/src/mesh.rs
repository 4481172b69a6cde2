use std::time::Duration;

use capsule_codec::Capsule;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use url::Url;

pub const HANDSHAKE_PATH: &str = "mesh/handshake";

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("invalid mesh endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
}

#[derive(Serialize)]
struct HandshakeRequest<'a> {
    capsule: &'a Capsule,
}

/// HTTP fallback for delivering a capsule when no data channel is open.
#[derive(Clone)]
pub struct MeshPublisher {
    client: reqwest::Client,
    endpoint: Url,
}

impl MeshPublisher {
    pub fn new(mesh_url: &str, timeout: Duration) -> Result<Self, PublishError> {
        let endpoint = handshake_endpoint(mesh_url)?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// `true` only on a 2xx response. Failures are logged, never raised.
    pub async fn publish(&self, capsule: &Capsule) -> bool {
        match self.try_publish(capsule).await {
            Ok(status) => {
                tracing::info!(target: "shapes::mesh", endpoint = %self.endpoint, %status, "capsule published");
                true
            }
            Err(err) => {
                tracing::warn!(target: "shapes::mesh", endpoint = %self.endpoint, error = %err, "mesh publish failed");
                false
            }
        }
    }

    pub async fn try_publish(&self, capsule: &Capsule) -> Result<StatusCode, PublishError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&HandshakeRequest { capsule })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PublishError::HttpStatus(status));
        }
        Ok(status)
    }
}

fn handshake_endpoint(mesh_url: &str) -> Result<Url, PublishError> {
    let mut base = Url::parse(mesh_url)
        .map_err(|err| PublishError::InvalidEndpoint(format!("{mesh_url}: {err}")))?;
    if !matches!(base.scheme(), "http" | "https") {
        return Err(PublishError::InvalidEndpoint(format!(
            "unsupported scheme {}",
            base.scheme()
        )));
    }
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(HANDSHAKE_PATH)
        .map_err(|err| PublishError::InvalidEndpoint(err.to_string()))
}
