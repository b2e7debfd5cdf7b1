//! JSON-RPC status client for the node.

use super::NodeRpc;
use crate::utils::errors::{DrError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Clone)]
pub struct JsonRpcNode {
    url: String,
    client: reqwest::Client,
}

impl JsonRpcNode {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    async fn call(&self, method: &str) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": [],
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DrError::Rpc(format!("{} unreachable: {}", method, e)))?;

        if !response.status().is_success() {
            return Err(DrError::Rpc(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            )));
        }

        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|e| DrError::Rpc(format!("{} returned malformed JSON: {}", method, e)))?;
        parse_response(method, parsed)
    }
}

fn parse_response(method: &str, response: RpcResponse) -> Result<Value> {
    if let Some(err) = response.error {
        return Err(DrError::Rpc(format!(
            "{} failed ({}): {}",
            method, err.code, err.message
        )));
    }
    response
        .result
        .ok_or_else(|| DrError::Rpc(format!("{} returned no result", method)))
}

/// Decode a `0x`-prefixed hex quantity
fn parse_quantity(method: &str, value: &Value) -> Result<u64> {
    let raw = value
        .as_str()
        .ok_or_else(|| DrError::Rpc(format!("{} returned a non-string quantity", method)))?;
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(digits, 16)
        .map_err(|_| DrError::Rpc(format!("{} returned an invalid quantity: {}", method, raw)))
}

#[async_trait]
impl NodeRpc for JsonRpcNode {
    async fn block_number(&self) -> Result<u64> {
        let value = self.call("eth_blockNumber").await?;
        parse_quantity("eth_blockNumber", &value)
    }

    async fn peer_count(&self) -> Result<u64> {
        let value = self.call("net_peerCount").await?;
        parse_quantity("net_peerCount", &value)
    }

    async fn syncing(&self) -> Result<bool> {
        // `false` when idle, a progress object while syncing
        let value = self.call("eth_syncing").await?;
        Ok(!matches!(value, Value::Bool(false)))
    }
}
