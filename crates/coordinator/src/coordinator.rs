//! Command channel and the coordinator façade.
//!
//! All round-state mutation happens on the single coordinator task;
//! connection tasks and timers talk to it through `Command`s. The handle is
//! the public entry point the connection manager calls.

use bitcoin::Transaction;
use tokio::sync::{mpsc, oneshot};

use vortex_common::protocol::{
    AskNonce, BlindedSig, BobMessage, MixDetails, NonceMessage, RegisterOutputAck,
    SignedPsbtMessage,
};
use vortex_common::{PeerId, Result, RoundId, RoundStatus, VortexError};

use crate::wire::Frame;

/// A timer scheduled for a phase of a specific round. Stale events (from an
/// earlier round or an already-left phase) are ignored on receipt.
#[derive(Debug, Clone, Copy)]
pub struct TimerEvent {
    pub round_id: RoundId,
    pub phase: RoundStatus,
}

/// Read-only view of the current round.
#[derive(Debug, Clone, Copy)]
pub struct RoundSnapshot {
    pub round_id: RoundId,
    pub status: RoundStatus,
    pub registered_alices: usize,
    pub registered_outputs: usize,
}

/// Commands consumed by the coordinator task.
pub enum Command {
    GetNonce {
        peer_id: PeerId,
        ask: AskNonce,
        reply: oneshot::Sender<Result<NonceMessage>>,
    },
    MixDetails {
        network: bitcoin::Network,
        reply: oneshot::Sender<Result<MixDetails>>,
    },
    RegisterInputs {
        peer_id: PeerId,
        msg: vortex_common::protocol::RegisterInputs,
        reply: oneshot::Sender<Result<BlindedSig>>,
    },
    RegisterOutput {
        msg: BobMessage,
        reply: oneshot::Sender<Result<RegisterOutputAck>>,
    },
    RegisterSignature {
        peer_id: PeerId,
        msg: SignedPsbtMessage,
        reply: oneshot::Sender<Result<()>>,
    },
    PeerConnected {
        peer_id: PeerId,
        sender: mpsc::Sender<Frame>,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
    Timer(TimerEvent),
    /// Outcome of the signature aggregation for a round.
    RoundOutcome {
        round_id: RoundId,
        result: Result<Transaction>,
    },
    Snapshot {
        reply: oneshot::Sender<RoundSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clonable handle to the coordinator task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<Command> {
        self.tx.clone()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| VortexError::Shutdown)?;
        reply_rx.await.map_err(|_| VortexError::Shutdown)?
    }

    pub async fn get_nonce(&self, peer_id: PeerId, ask: AskNonce) -> Result<NonceMessage> {
        self.request(|reply| Command::GetNonce { peer_id, ask, reply })
            .await
    }

    pub async fn mix_details(&self, network: bitcoin::Network) -> Result<MixDetails> {
        self.request(|reply| Command::MixDetails { network, reply })
            .await
    }

    pub async fn register_inputs(
        &self,
        peer_id: PeerId,
        msg: vortex_common::protocol::RegisterInputs,
    ) -> Result<BlindedSig> {
        self.request(|reply| Command::RegisterInputs { peer_id, msg, reply })
            .await
    }

    pub async fn register_output(&self, msg: BobMessage) -> Result<RegisterOutputAck> {
        self.request(|reply| Command::RegisterOutput { msg, reply })
            .await
    }

    pub async fn register_signature(&self, peer_id: PeerId, msg: SignedPsbtMessage) -> Result<()> {
        self.request(|reply| Command::RegisterSignature { peer_id, msg, reply })
            .await
    }

    pub async fn peer_connected(&self, peer_id: PeerId, sender: mpsc::Sender<Frame>) -> Result<()> {
        self.tx
            .send(Command::PeerConnected { peer_id, sender })
            .await
            .map_err(|_| VortexError::Shutdown)
    }

    pub async fn peer_disconnected(&self, peer_id: PeerId) -> Result<()> {
        self.tx
            .send(Command::PeerDisconnected { peer_id })
            .await
            .map_err(|_| VortexError::Shutdown)
    }

    /// Observe the current round without touching its state.
    pub async fn snapshot(&self) -> Result<RoundSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| VortexError::Shutdown)?;
        reply_rx.await.map_err(|_| VortexError::Shutdown)
    }

    /// Stop the coordinator: cancels timers, fails pending signature slots,
    /// and flushes the current round to `Failed`.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Command::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}
