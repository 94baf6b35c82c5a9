//! Oracle backed by a load balancer controller's target-health endpoint.
//!
//! Expects `GET {prefix}/{id}` to answer `{"state": "..."}` with one of the
//! target states `initial`, `healthy`, `unhealthy`, `draining`, `unused`,
//! and `POST {prefix}/{id}/deregister` to start deregistration. A 404 means
//! the target is not registered.

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Empty};
use serde::Deserialize;
use tracing::debug;

use ebb_core::TargetRegistration;

use crate::oracle::TargetHealthOracle;

#[derive(Debug, Deserialize)]
struct TargetHealthBody {
    state: String,
}

/// HTTP client for a target-health endpoint.
#[derive(Debug, Clone)]
pub struct HttpTargetOracle {
    /// `host:port` of the controller.
    address: String,
    /// Path prefix for target resources, e.g. `/targets`.
    prefix: String,
}

impl HttpTargetOracle {
    pub fn new(address: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    /// Fetch the load balancer's view of a target.
    pub async fn target_state(&self, instance_id: &str) -> anyhow::Result<TargetRegistration> {
        let path = format!("{}/{}", self.prefix, instance_id);
        let (status, body) = self.send(Method::GET, &path).await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(TargetRegistration::Unregistered);
        }
        if !status.is_success() {
            bail!("target health request for {instance_id} returned {status}");
        }

        let parsed: TargetHealthBody =
            serde_json::from_slice(&body).context("malformed target health body")?;
        map_state(&parsed.state)
            .with_context(|| format!("unknown target state {:?}", parsed.state))
    }

    async fn send(&self, method: Method, path: &str) -> anyhow::Result<(StatusCode, Bytes)> {
        let uri = format!("http://{}{}", self.address, path);

        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("connect to {}", self.address))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method(method)
            .uri(&uri)
            .header("host", &self.address)
            .header("user-agent", "ebbgrid-health/0.1")
            .body(Empty::<Bytes>::new())?;

        let resp = sender.send_request(req).await?;
        let status = resp.status();
        let body = resp.into_body().collect().await?.to_bytes();
        debug!(%uri, %status, "target health request");
        Ok((status, body))
    }
}

#[async_trait]
impl TargetHealthOracle for HttpTargetOracle {
    async fn is_in_service(&self, instance_id: &str) -> anyhow::Result<bool> {
        Ok(self.target_state(instance_id).await?.is_in_service())
    }

    async fn is_registered(&self, instance_id: &str) -> anyhow::Result<bool> {
        Ok(self.target_state(instance_id).await?.is_registered())
    }

    async fn request_deregistration(&self, instance_id: &str) -> anyhow::Result<()> {
        let path = format!("{}/{}/deregister", self.prefix, instance_id);
        let (status, _) = self.send(Method::POST, &path).await?;
        // Already gone counts as deregistered.
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            bail!("deregistration of {instance_id} returned {status}")
        }
    }
}

fn map_state(state: &str) -> Option<TargetRegistration> {
    match state {
        // Registered but not (yet) passing the LB's own checks.
        "initial" | "unhealthy" => Some(TargetRegistration::Registering),
        "healthy" => Some(TargetRegistration::InService),
        "draining" => Some(TargetRegistration::Deregistering),
        "unused" | "unavailable" => Some(TargetRegistration::Unregistered),
        _ => None,
    }
}
