// src/rpc.rs
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// A raw log entry as returned inside a transaction receipt.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Log {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
}

/// The subset of a transaction receipt the listener needs.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Receipt {
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,

    /// Top-level recipient; `None` for contract creation.
    #[serde(default)]
    pub to: Option<String>,

    #[serde(default)]
    pub logs: Vec<Log>,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    #[serde(default)]
    transactions: Vec<String>,
}

// Error is tried first: with `T = Option<_>` a missing `result` would
// otherwise match Success.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RpcResponse<T> {
    Error { error: RpcError },
    Success { result: T },
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Read access to the chain, as the block listener sees it.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Latest block number known to the node.
    async fn latest_block_number(&self) -> Result<u64>;

    /// Ordered transaction hashes of a block.
    async fn block_transactions(&self, number: u64) -> Result<Vec<String>>;

    /// Receipt (recipient and logs) of one transaction.
    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Receipt>;
}

/// JSON-RPC client over HTTP.
pub struct RpcClient {
    client: Client,
    url: String,
}

impl RpcClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });

        debug!("Sending {} → {}", method, self.url);

        let resp = self.client.post(&self.url).json(&payload).send().await?;
        if resp.status() != StatusCode::OK {
            return Err(eyre!("{} failed: HTTP {}", method, resp.status()));
        }

        match resp.json::<RpcResponse<T>>().await? {
            RpcResponse::Success { result } => Ok(result),
            RpcResponse::Error { error } => Err(eyre!(
                "{} returned RPC error {}: {}",
                method,
                error.code,
                error.message
            )),
        }
    }
}

fn parse_quantity(hex_str: &str) -> Result<u64> {
    u64::from_str_radix(hex_str.trim_start_matches("0x"), 16)
        .wrap_err_with(|| format!("invalid hex quantity `{}`", hex_str))
}

#[async_trait]
impl ChainSource for RpcClient {
    /// Latest block number, retried up to three times.
    async fn latest_block_number(&self) -> Result<u64> {
        for attempt in 1..=3 {
            match self.call::<String>("eth_blockNumber", json!([])).await {
                Ok(hex_str) => return parse_quantity(&hex_str),
                Err(e) if attempt < 3 => {
                    warn!("eth_blockNumber failed (attempt {}): {:?}. Retrying...", attempt, e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                Err(e) => return Err(e.wrap_err("eth_blockNumber failed after 3 attempts")),
            }
        }

        Err(eyre!("Unreachable: retries exhausted"))
    }

    async fn block_transactions(&self, number: u64) -> Result<Vec<String>> {
        let block: Option<BlockHeader> = self
            .call("eth_getBlockByNumber", json!([format!("0x{:x}", number), false]))
            .await?;
        block
            .map(|b| b.transactions)
            .ok_or_else(|| eyre!("block {} not found", number))
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Receipt> {
        let receipt: Option<Receipt> = self
            .call("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        receipt.ok_or_else(|| eyre!("receipt for {} not available", tx_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_receipt_payload() {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "transactionHash": "0xabc",
                "to": "0xaa8e23fb1079ea71e0a56f48a2aa51851d8433d0",
                "status": "0x1",
                "logs": [{
                    "address": "0xaa8e23fb1079ea71e0a56f48a2aa51851d8433d0",
                    "topics": ["0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"],
                    "data": "0x01"
                }]
            }
        });

        let parsed: RpcResponse<Option<Receipt>> = serde_json::from_value(body).unwrap();
        let receipt = match parsed {
            RpcResponse::Success { result } => result.unwrap(),
            RpcResponse::Error { .. } => panic!("expected success"),
        };
        assert_eq!(receipt.tx_hash, "0xabc");
        assert_eq!(receipt.logs.len(), 1);
        assert_eq!(receipt.logs[0].data, "0x01");
    }

    #[test]
    fn decodes_contract_creation_receipt() {
        let body = json!({ "transactionHash": "0xdef", "to": null, "logs": [] });
        let receipt: Receipt = serde_json::from_value(body).unwrap();
        assert!(receipt.to.is_none());
    }

    #[test]
    fn decodes_rpc_error() {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32000, "message": "header not found" }
        });
        let parsed: RpcResponse<Option<Receipt>> = serde_json::from_value(body).unwrap();
        assert!(matches!(parsed, RpcResponse::Error { error } if error.code == -32000));
    }

    #[test]
    fn parses_hex_quantities() {
        assert_eq!(parse_quantity("0x10").unwrap(), 16);
        assert!(parse_quantity("0xzz").is_err());
    }
}
