//! Firecracker API client
//!
//! Talks to the hypervisor's HTTP control API over its Unix socket. The VM
//! is configured from the rendered config file at launch, so the client only
//! needs to observe the instance and request a guest shutdown.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Method;
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

type HyperClient = Client<UnixConnector, Full<Bytes>>;

/// VM action (e.g., "SendCtrlAltDel")
#[derive(Serialize, Debug, Clone)]
pub struct Action {
    pub action_type: String,
}

/// Response of `GET /`
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct InstanceInfo {
    pub id: String,
    /// "Not started", "Running" or "Paused"
    pub state: String,
    pub vmm_version: String,
    #[serde(default)]
    pub app_name: String,
}

/// Client for communicating with Firecracker's control API
pub struct FirecrackerClient {
    client: HyperClient,
    socket_path: String,
}

impl FirecrackerClient {
    /// Create a new Firecracker API client
    ///
    /// # Arguments
    /// * `socket_path` - Path to the Firecracker API Unix socket
    pub fn new(socket_path: impl Into<String>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);

        Self {
            client,
            socket_path: socket_path.into(),
        }
    }

    /// Send a request and return the response body
    async fn send_request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<String>,
    ) -> Result<Bytes> {
        let api_err = |message: String| Error::Api {
            endpoint: endpoint.to_string(),
            message,
        };

        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();
        let mut builder = hyper::Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        if body.is_some() {
            builder = builder.header("Content-Type", "application/json");
        }
        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| api_err(e.to_string()))?;

        let res = self
            .client
            .request(req)
            .await
            .map_err(|e| api_err(e.to_string()))?;
        let status = res.status();
        let body_bytes = res
            .into_body()
            .collect()
            .await
            .map_err(|e| api_err(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            let message = String::from_utf8_lossy(&body_bytes);
            return Err(api_err(format!("{} - {}", status, message.trim())));
        }

        Ok(body_bytes)
    }

    /// Query instance identity and state
    pub async fn describe_instance(&self) -> Result<InstanceInfo> {
        let body = self.send_request(Method::GET, "/", None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Ask the guest to shut down (keyboard reset via i8042)
    pub async fn send_ctrl_alt_del(&self) -> Result<()> {
        let action = Action {
            action_type: "SendCtrlAltDel".to_string(),
        };
        self.send_request(
            Method::PUT,
            "/actions",
            Some(serde_json::to_string(&action)?),
        )
        .await?;
        Ok(())
    }
}
