//! Stored entity types.

use bitcoin::secp256k1::PublicKey;
use bitcoin::{OutPoint, Psbt, ScriptBuf, Transaction, TxOut};
use chrono::{DateTime, Utc};

use vortex_common::{PeerId, RoundId, RoundStatus};

/// A mixing round.
#[derive(Debug, Clone)]
pub struct StoredRound {
    pub round_id: RoundId,
    pub status: RoundStatus,
    /// Scheduled start, unix seconds.
    pub round_time: u64,
    /// Fee rate the round was planned at, sat/vB.
    pub fee_rate: u64,
    /// Uniform mixed-output value, sats.
    pub mix_amount: u64,
    /// Per-peer coordinator fee, sats.
    pub mix_fee: u64,
    /// Per-input fee contribution: `fee_rate * 149`.
    pub input_fee: u64,
    /// Per-output fee contribution: `fee_rate * 43`.
    pub output_fee: u64,
    /// Set once the round reaches `Signing`.
    pub unsigned_psbt: Option<Psbt>,
    /// Set once the round reaches `Signed`.
    pub final_tx: Option<Transaction>,
    /// Coordinator take, recorded on `Signed`.
    pub profit: Option<u64>,
}

/// A peer's Alice-role registration.
#[derive(Debug, Clone)]
pub struct StoredAlice {
    pub peer_id: PeerId,
    pub round_id: RoundId,
    /// HD derivation path of the issued nonce.
    pub purpose: u32,
    pub coin: u32,
    pub account: u32,
    pub chain: u32,
    /// Globally unique, monotonically increasing nonce index.
    pub nonce_index: u32,
    /// The issued nonce point.
    pub nonce: PublicKey,
    /// Blinded challenge submitted with `RegisterInputs`.
    pub blinded_output: Option<[u8; 32]>,
    /// Change scriptPubKey, if the peer requested change.
    pub change_spk: Option<ScriptBuf>,
    /// The blind signature issued to this Alice.
    pub blind_sig: Option<[u8; 32]>,
    /// Whether the peer delivered a valid signed PSBT.
    pub signed: bool,
}

impl StoredAlice {
    /// An Alice counts as registered once her blind signature is issued.
    pub fn is_registered(&self) -> bool {
        self.blind_sig.is_some()
    }
}

/// A validated input registered to a round.
#[derive(Debug, Clone)]
pub struct StoredInput {
    pub round_id: RoundId,
    pub outpoint: OutPoint,
    pub peer_id: PeerId,
    /// The previous output being spent.
    pub prev_output: TxOut,
    /// Ownership proof over the Alice's nonce.
    pub input_proof: Vec<u8>,
    /// Position in the final transaction, set after the builder runs.
    pub index_in_final_tx: Option<u32>,
}

/// A validated mixed output. Carries no peer linkage.
#[derive(Debug, Clone)]
pub struct StoredOutput {
    pub round_id: RoundId,
    pub output: TxOut,
    /// Unblinded Schnorr signature by the round key over the output.
    pub sig: Vec<u8>,
}

/// A banned UTXO. Bans outlive rounds.
#[derive(Debug, Clone)]
pub struct BannedUtxo {
    pub outpoint: OutPoint,
    pub banned_until: DateTime<Utc>,
    pub reason: String,
}
