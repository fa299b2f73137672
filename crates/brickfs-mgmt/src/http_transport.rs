//! JSON-over-HTTP transports for peer and brick RPCs.

use async_trait::async_trait;
use brickfs_volgen::BrickInfo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::transport::{BrickRequest, BrickResponse, BrickTransport, PeerRequest, PeerResponse, PeerTransport, TransportError};

/// Path every management daemon serves peer requests on
pub const PEER_RPC_PATH: &str = "/mgmt/v1/peer";

/// Path brick daemons serve sub-operations on
pub const BRICK_RPC_PATH: &str = "/brick/v1/op";

async fn post_json<Req, Resp>(client: &reqwest::Client, addr: String, path: &str, timeout: Duration, body: &Req) -> Result<Resp, TransportError>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let url = format!("http://{}{}", addr, path);
    let response = client
        .post(&url)
        .timeout(timeout)
        .json(body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout {
                    addr: addr.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }
            } else {
                TransportError::Unreachable {
                    addr: addr.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Remote {
            addr,
            reason: format!("Request failed: {}", status),
        });
    }
    response.json().await.map_err(|e| TransportError::Decode {
        addr,
        reason: e.to_string(),
    })
}

/// Talks to other management daemons' `/mgmt/v1/peer` endpoint
pub struct HttpPeerTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpPeerTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn send(&self, hostname: &str, port: u16, request: PeerRequest) -> Result<PeerResponse, TransportError> {
        debug!(peer = %hostname, port, request = request.name(), "sending peer request");
        post_json(&self.client, format!("{}:{}", hostname, port), PEER_RPC_PATH, self.timeout, &request).await
    }
}

/// Talks to brick daemons on their advertised port
pub struct HttpBrickTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpBrickTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl BrickTransport for HttpBrickTransport {
    async fn send(&self, brick: &BrickInfo, request: BrickRequest) -> Result<BrickResponse, TransportError> {
        let Some(port) = brick.port else {
            return Err(TransportError::Unreachable {
                addr: brick.id(),
                reason: "brick has no port".into(),
            });
        };
        post_json(&self.client, format!("{}:{}", brick.hostname, port), BRICK_RPC_PATH, self.timeout, &request).await
    }

    async fn disconnect(&self, brick: &BrickInfo) {
        // connections are per request; nothing to tear down
        debug!(brick = %brick, "brick connection released");
    }
}
