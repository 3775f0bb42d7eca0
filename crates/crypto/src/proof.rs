//! Input-ownership proofs.
//!
//! A peer proves it controls a UTXO by producing a Schnorr signature with
//! the UTXO's key over its Alice nonce. The nonce is fresh per Alice, so a
//! proof cannot be replayed into a later round.
//!
//! A P2WPKH scriptPubKey commits only to the key's HASH160, so the proof
//! carries the compressed public key followed by the signature; the
//! verifier checks the key against the witness program before checking the
//! signature.

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::{Script, ScriptBuf, WPubkeyHash};

use vortex_common::protocol::INPUT_PROOF_TAG;
use vortex_common::Result;

use crate::blind::{schnorr_sign, verify, UnblindedSignature};

/// Serialized proof length: 33-byte pubkey + 65-byte signature.
pub const PROOF_LEN: usize = 98;

/// The message an input proof signs: the domain tag followed by the
/// compressed nonce point.
fn proof_message(nonce: &PublicKey) -> Vec<u8> {
    let mut msg = Vec::with_capacity(INPUT_PROOF_TAG.len() + 33);
    msg.extend_from_slice(INPUT_PROOF_TAG);
    msg.extend_from_slice(&nonce.serialize());
    msg
}

/// Sign an input proof with the key controlling the UTXO. Client side.
pub fn sign_input_proof(
    secp: &Secp256k1<All>,
    utxo_key: &SecretKey,
    nonce: &PublicKey,
) -> Result<Vec<u8>> {
    let sig = schnorr_sign(secp, utxo_key, &proof_message(nonce))?;
    let mut proof = Vec::with_capacity(PROOF_LEN);
    proof.extend_from_slice(&utxo_key.public_key(secp).serialize());
    proof.extend_from_slice(&sig.serialize());
    Ok(proof)
}

/// Verify an input proof against the UTXO's P2WPKH scriptPubKey and the
/// Alice nonce.
pub fn verify_input_proof(
    secp: &Secp256k1<All>,
    script_pubkey: &Script,
    nonce: &PublicKey,
    proof: &[u8],
) -> bool {
    if proof.len() != PROOF_LEN {
        return false;
    }
    let Ok(pubkey) = PublicKey::from_slice(&proof[..33]) else {
        return false;
    };
    let wpkh = WPubkeyHash::hash(&pubkey.serialize());
    if ScriptBuf::new_p2wpkh(&wpkh) != *script_pubkey {
        return false;
    }
    match UnblindedSignature::from_bytes(&proof[33..]) {
        Ok(sig) => verify(secp, &pubkey, &proof_message(nonce), &sig),
        Err(_) => false,
    }
}
