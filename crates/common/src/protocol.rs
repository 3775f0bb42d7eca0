//! Wire protocol messages exchanged between peers and the coordinator.
//!
//! Message bodies are serde structs; framing (length prefix + type tag) is
//! handled by the coordinator's codec. A peer speaks as "Alice" while
//! registering inputs and as "Bob" — over a separate connection — when
//! submitting its unblinded output.

use bitcoin::secp256k1::PublicKey;
use bitcoin::{OutPoint, Psbt, TxOut};
use serde::{Deserialize, Serialize};

use crate::types::RoundId;

/// Protocol version advertised in `MixDetails`.
pub const PROTOCOL_VERSION: u16 = 1;

/// Domain tag prefixed to the peer nonce when signing input-ownership proofs.
pub const INPUT_PROOF_TAG: &[u8] = b"LnVortex input proof";

/// Request the Alice's Schnorr nonce for the given round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskNonce {
    pub round_id: RoundId,
}

/// The coordinator's answer to `AskNonce`: a fresh per-Alice nonce point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceMessage {
    pub nonce: PublicKey,
}

/// Request the advertised parameters of the current round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskMixDetails {
    pub network: bitcoin::Network,
}

/// Parameters of the current round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixDetails {
    pub version: u16,
    pub round_id: RoundId,
    /// Uniform mixed-output value, in satoshis.
    pub amount: u64,
    /// Per-peer coordinator fee, in satoshis.
    pub mix_fee: u64,
    /// Per-input fee contribution, in satoshis.
    pub input_fee: u64,
    /// Per-output fee contribution, in satoshis.
    pub output_fee: u64,
    /// Round public key the unblinded output signatures verify under.
    pub public_key: PublicKey,
    /// Scheduled round start, unix seconds.
    pub round_time: u64,
}

/// One input a peer offers to the round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputReference {
    pub outpoint: OutPoint,
    /// The previous output being spent (amount + scriptPubKey).
    pub output: TxOut,
    /// Schnorr signature by the UTXO's key over the tagged peer nonce,
    /// proving possession without revealing a spending signature.
    pub input_proof: Vec<u8>,
}

/// Alice registration: inputs, the blinded output token, optional change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterInputs {
    pub inputs: Vec<InputReference>,
    /// Blinded challenge scalar for the output the peer will later reveal.
    pub blinded_output: [u8; 32],
    pub change_output: Option<TxOut>,
}

/// The coordinator's blind signature over `blinded_output`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlindedSig {
    pub sig: [u8; 32],
}

/// Bob submission: the unblinded output with its unblinded signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BobMessage {
    pub output: TxOut,
    /// 65-byte unblinded Schnorr signature (33-byte R, 32-byte s).
    pub sig: Vec<u8>,
}

/// Acknowledgement of a `BobMessage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterOutputAck {
    pub accepted: bool,
}

/// Coordinator → peer: the assembled round transaction to sign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsignedPsbtMessage {
    #[serde(with = "psbt_bytes")]
    pub psbt: Psbt,
}

/// Peer → coordinator: the PSBT with the peer's inputs finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPsbtMessage {
    #[serde(with = "psbt_bytes")]
    pub psbt: Psbt,
}

/// PSBTs cross the wire as their BIP174 bytes; `bitcoin::Psbt` only
/// exposes the manual `serialize`/`deserialize` pair.
mod psbt_bytes {
    use bitcoin::Psbt;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(psbt: &Psbt, serializer: S) -> Result<S::Ok, S::Error> {
        psbt.serialize().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Psbt, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Psbt::deserialize(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Coordinator → peer: a new round has been scheduled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartRoundMessage {
    pub round_id: RoundId,
    pub round_time: u64,
}

/// Coordinator → peer: the current round failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundFailedMessage {
    pub reason: String,
}

/// Coordinator → peer: a request was rejected. The round is unaffected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
}
