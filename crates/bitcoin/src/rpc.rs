//! Bitcoin Core RPC client.
//!
//! The coordinator consumes three node calls: `getrawtransaction` to verify
//! registered inputs, `sendrawtransaction` to broadcast the final mix, and
//! `estimatesmartfee` for the fee oracle. The `ChainRpc` trait is the seam
//! the tests mock.

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use vortex_common::{Result, VortexError};

/// RPC error code Bitcoin Core returns for an unknown transaction.
const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;

/// Chain queries the coordinator depends on.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Fetch a transaction by id; `None` if the node does not know it.
    async fn get_raw_transaction(&self, txid: &Txid) -> Result<Option<Transaction>>;

    /// Broadcast a fully signed transaction; returns its txid.
    async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid>;

    /// Fee estimate in sat/vB for the given confirmation target, if the
    /// node has one.
    async fn estimate_smart_fee(&self, conf_target: u16) -> Result<Option<f64>>;
}

/// Bitcoin Core RPC client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    pub url: String,
    pub user: String,
    pub password: String,
}

/// JSON-RPC client against a Bitcoin Core node.
pub struct BitcoinRpcClient {
    config: RpcConfig,
    client: reqwest::Client,
}

impl BitcoinRpcClient {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Make an RPC call, returning the raw error so callers can branch on
    /// error codes.
    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> std::result::Result<T, RpcCallError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "vortex",
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.config.url)
            .basic_auth(&self.config.user, Some(&self.config.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcCallError::Transport(format!("RPC request failed: {}", e)))?;

        if !response.status().is_success() && response.status().as_u16() != 500 {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RpcCallError::Transport(format!(
                "RPC error {}: {}",
                status, body
            )));
        }

        let result: RpcResponse<T> = response.json().await.map_err(|e| {
            RpcCallError::Transport(format!("failed to parse RPC response: {}", e))
        })?;

        if let Some(error) = result.error {
            return Err(RpcCallError::Node {
                code: error.code,
                message: error.message,
            });
        }

        result
            .result
            .ok_or_else(|| RpcCallError::Transport("RPC returned null result".to_string()))
    }
}

#[async_trait]
impl ChainRpc for BitcoinRpcClient {
    async fn get_raw_transaction(&self, txid: &Txid) -> Result<Option<Transaction>> {
        let hex: String = match self
            .call("getrawtransaction", vec![json!(txid.to_string())])
            .await
        {
            Ok(hex) => hex,
            Err(RpcCallError::Node { code, .. }) if code == RPC_INVALID_ADDRESS_OR_KEY => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let bytes = hex::decode(&hex)
            .map_err(|e| VortexError::NodeRpc(format!("invalid transaction hex: {}", e)))?;
        let tx = bitcoin::consensus::deserialize(&bytes)
            .map_err(|e| VortexError::NodeRpc(format!("invalid transaction bytes: {}", e)))?;
        Ok(Some(tx))
    }

    async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid> {
        let hex = bitcoin::consensus::encode::serialize_hex(tx);
        let txid: String = self
            .call("sendrawtransaction", vec![json!(hex)])
            .await
            .map_err(|e| VortexError::Broadcast(e.to_string()))?;
        txid.parse()
            .map_err(|e| VortexError::Broadcast(format!("invalid txid from node: {}", e)))
    }

    async fn estimate_smart_fee(&self, conf_target: u16) -> Result<Option<f64>> {
        let result: EstimateSmartFeeResult = self
            .call("estimatesmartfee", vec![json!(conf_target)])
            .await
            .map_err(|e| VortexError::FeeEstimation(e.to_string()))?;

        // feerate comes back in BTC/kvB; convert to sat/vB.
        Ok(result.feerate.map(|btc_per_kvb| btc_per_kvb * 100_000.0))
    }
}

/// An RPC-layer failure, before mapping into the domain error.
#[derive(Debug)]
enum RpcCallError {
    Transport(String),
    Node { code: i32, message: String },
}

impl std::fmt::Display for RpcCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcCallError::Transport(msg) => write!(f, "{}", msg),
            RpcCallError::Node { code, message } => write!(f, "node error {}: {}", code, message),
        }
    }
}

impl From<RpcCallError> for VortexError {
    fn from(e: RpcCallError) -> Self {
        VortexError::NodeRpc(e.to_string())
    }
}

// ============================================================================
// RPC Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct EstimateSmartFeeResult {
    feerate: Option<f64>,
    #[allow(dead_code)]
    errors: Option<Vec<String>>,
}
