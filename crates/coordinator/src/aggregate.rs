//! Signature aggregation.
//!
//! When a round enters `Signing`, the coordinator hands this task one
//! one-shot receiver per registered Alice. The task awaits the full set
//! under the signing timer, combines the signed PSBTs, validates the
//! extracted transaction, broadcasts it, and reports the outcome back to
//! the coordinator as a command.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{OutPoint, Psbt, Transaction, TxOut};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use vortex_bitcoin::psbt::{check_fee, combine_signed, extract_final_tx};
use vortex_bitcoin::ChainRpc;
use vortex_common::{PeerId, Result, RoundId, VortexError};

use crate::coordinator::Command;

pub struct Aggregator {
    pub round_id: RoundId,
    pub receivers: Vec<(PeerId, oneshot::Receiver<Psbt>)>,
    pub prevouts: HashMap<OutPoint, TxOut>,
    pub fee_rate: u64,
    pub rpc: Arc<dyn ChainRpc>,
    pub timeout: Duration,
    pub cmd_tx: mpsc::Sender<Command>,
}

/// Spawn the aggregation task; its outcome arrives as a
/// `Command::RoundOutcome`.
pub fn spawn(aggregator: Aggregator) -> JoinHandle<()> {
    tokio::spawn(async move {
        let round_id = aggregator.round_id;
        let cmd_tx = aggregator.cmd_tx.clone();
        let result = aggregator.run().await;
        if cmd_tx
            .send(Command::RoundOutcome { round_id, result })
            .await
            .is_err()
        {
            debug!("Coordinator gone before aggregation outcome delivery");
        }
    })
}

impl Aggregator {
    async fn run(self) -> Result<Transaction> {
        let expected = self.receivers.len();
        let deadline = Instant::now() + self.timeout;
        let mut signed = Vec::with_capacity(expected);

        for (peer_id, receiver) in self.receivers {
            match tokio::time::timeout_at(deadline, receiver).await {
                Ok(Ok(psbt)) => {
                    debug!("Collected signed psbt from peer {}", peer_id);
                    signed.push(psbt);
                }
                Ok(Err(_)) => {
                    warn!("Peer {} failed its signature slot", peer_id);
                    return Err(VortexError::RoundFailed(format!(
                        "peer {} failed to deliver a valid signed psbt",
                        peer_id
                    )));
                }
                Err(_) => {
                    return Err(VortexError::SigningTimeout {
                        received: signed.len(),
                        expected,
                    });
                }
            }
        }

        let combined = combine_signed(signed)?;
        let tx = extract_final_tx(combined)?;
        check_fee(&tx, &self.prevouts, self.fee_rate)?;

        let txid = self.rpc.send_raw_transaction(&tx).await?;
        info!("Broadcast round {} transaction {}", self.round_id, txid);
        Ok(tx)
    }
}
