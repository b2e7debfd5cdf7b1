//! Traffic redirection collaborators.

use super::TrafficRouter;
use crate::utils::errors::{DrError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

/// POSTs `{"target": "<host>"}` to a configured endpoint
#[derive(Debug, Clone)]
pub struct WebhookRouter {
    url: String,
    client: reqwest::Client,
}

impl WebhookRouter {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl TrafficRouter for WebhookRouter {
    async fn redirect(&self, target: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "target": target }))
            .send()
            .await
            .map_err(|e| DrError::Transfer(format!("router unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(DrError::Transfer(format!(
                "router rejected redirect to {}: HTTP {}",
                target,
                response.status()
            )));
        }
        info!(target_host = %target, "Traffic redirected");
        Ok(())
    }
}

/// Used when no router is configured; redirection is left to the operator
#[derive(Debug, Default, Clone)]
pub struct NoopRouter;

#[async_trait]
impl TrafficRouter for NoopRouter {
    async fn redirect(&self, target: &str) -> Result<()> {
        warn!(
            target_host = %target,
            "No router configured; redirect traffic to the failover target manually"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_router_is_transfer_error() {
        let router = WebhookRouter::new("http://127.0.0.1:9/redirect").unwrap();
        assert!(matches!(router.redirect("standby-1").await, Err(DrError::Transfer(_))));
    }
}
