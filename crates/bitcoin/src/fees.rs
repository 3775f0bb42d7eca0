//! Fee oracle.
//!
//! Fee rates come from the node's `estimatesmartfee`, falling back to a
//! mempool.space-compatible HTTP provider when the node has no estimate.
//! Regtest has no fee market, so it short-circuits to a fixed floor.

use std::sync::Arc;

use serde::Deserialize;

use vortex_common::{Result, VortexError};

use crate::rpc::ChainRpc;

/// Confirmation target for node estimates.
const CONF_TARGET: u16 = 6;

/// Fixed rate used on regtest, sat/vB.
const REGTEST_FEE_RATE: u64 = 1;

/// Supplies the round fee rate in sat/vB.
pub struct FeeOracle {
    rpc: Arc<dyn ChainRpc>,
    fallback_url: String,
    client: reqwest::Client,
    regtest: bool,
}

impl FeeOracle {
    pub fn new(rpc: Arc<dyn ChainRpc>, fallback_url: String, regtest: bool) -> Self {
        Self {
            rpc,
            fallback_url,
            client: reqwest::Client::new(),
            regtest,
        }
    }

    /// Current fee rate in sat/vB, never below 1.
    pub async fn fee_rate(&self) -> Result<u64> {
        if self.regtest {
            return Ok(REGTEST_FEE_RATE);
        }

        match self.rpc.estimate_smart_fee(CONF_TARGET).await {
            Ok(Some(sat_per_vb)) => Ok((sat_per_vb.ceil() as u64).max(1)),
            Ok(None) => {
                tracing::debug!("Node returned no fee estimate, trying fallback provider");
                self.fallback_rate().await
            }
            Err(e) => {
                tracing::warn!("Node fee estimation failed ({}), trying fallback provider", e);
                self.fallback_rate().await
            }
        }
    }

    async fn fallback_rate(&self) -> Result<u64> {
        let url = format!("{}/v1/fees/recommended", self.fallback_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| VortexError::FeeEstimation(format!("fallback request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(VortexError::FeeEstimation(format!(
                "fallback provider returned status {}",
                response.status()
            )));
        }

        let fees: RecommendedFees = response
            .json()
            .await
            .map_err(|e| VortexError::FeeEstimation(format!("invalid fallback response: {}", e)))?;

        Ok(fees.half_hour_fee.max(1))
    }
}

/// mempool.space `/v1/fees/recommended` response.
#[derive(Debug, Deserialize)]
struct RecommendedFees {
    #[serde(rename = "halfHourFee")]
    half_hour_fee: u64,
    #[allow(dead_code)]
    #[serde(rename = "hourFee", default)]
    hour_fee: u64,
    #[allow(dead_code)]
    #[serde(rename = "minimumFee", default)]
    minimum_fee: u64,
}
