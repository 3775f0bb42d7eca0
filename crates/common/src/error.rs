//! Error types for the Vortex coordinator.

use bitcoin::OutPoint;
use chrono::{DateTime, Utc};

use crate::types::{PeerId, RoundId, RoundStatus};

/// Errors surfaced across the coordinator's public API.
#[derive(Debug, thiserror::Error)]
pub enum VortexError {
    #[error("Wrong round phase: expected {expected}, actual {actual}")]
    WrongPhase {
        expected: RoundStatus,
        actual: RoundStatus,
    },

    #[error("Message references round {got}, current round is {current}")]
    WrongRound { got: RoundId, current: RoundId },

    #[error("Wrong network: coordinator mixes on {expected}, request was for {got}")]
    WrongNetwork {
        expected: bitcoin::Network,
        got: bitcoin::Network,
    },

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("No inputs submitted")]
    NoInputs,

    #[error("Unsupported script type: expected {expected}, got {got}")]
    ScriptType { expected: &'static str, got: String },

    #[error("Input {outpoint} is banned until {until}")]
    BannedInput {
        outpoint: OutPoint,
        until: DateTime<Utc>,
    },

    #[error("Input {0} is already registered to this round")]
    DuplicateInput(OutPoint),

    #[error("Previous output not found on chain: {0}")]
    MissingPrevOut(OutPoint),

    #[error("Previous output mismatch for {0}")]
    PrevOutMismatch(OutPoint),

    #[error("Invalid input ownership proof for {0}")]
    InvalidInputProof(OutPoint),

    #[error("Input value {provided} sats cannot cover {required} sats of mix amount and fees")]
    InsufficientInputValue { provided: u64, required: u64 },

    #[error("Change amount {change} exceeds allowed maximum {allowed}")]
    ExcessiveChange { change: u64, allowed: u64 },

    #[error("Output signature does not verify under the round public key")]
    InvalidOutputSignature,

    #[error("Output amount {got} does not match mix amount {expected}")]
    WrongOutputAmount { expected: u64, got: u64 },

    #[error("Unsigned transaction does not match the round transaction")]
    PsbtMismatch,

    #[error("Invalid signature for input {input_index}")]
    InvalidPsbtSignature { input_index: usize },

    #[error("Not enough peers: got {got}, need {need}")]
    NotEnoughPeers { got: usize, need: usize },

    #[error("Signing timed out: received {received} of {expected} signed transactions")]
    SigningTimeout { received: usize, expected: usize },

    #[error("Round failed: {0}")]
    RoundFailed(String),

    #[error("Broadcast error: {0}")]
    Broadcast(String),

    #[error("Node RPC error: {0}")]
    NodeRpc(String),

    #[error("Fee estimation error: {0}")]
    FeeEstimation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Transport(String),

    #[error("Coordinator is shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, VortexError>;

impl VortexError {
    /// Whether this error should ban the submitted outpoints.
    ///
    /// Policy predicates (script type, wrong phase, wrong round) reject
    /// without banning; only evidence of a bad or unowned UTXO bans.
    pub fn bans_inputs(&self) -> bool {
        matches!(
            self,
            VortexError::BannedInput { .. }
                | VortexError::DuplicateInput(_)
                | VortexError::MissingPrevOut(_)
                | VortexError::PrevOutMismatch(_)
                | VortexError::InvalidInputProof(_)
                | VortexError::InsufficientInputValue { .. }
                | VortexError::ExcessiveChange { .. }
        )
    }
}
