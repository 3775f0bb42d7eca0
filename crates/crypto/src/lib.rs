//! Cryptographic primitives for the Vortex coordinator.
//!
//! - Blind Schnorr signatures: the coordinator signs a blinded challenge and
//!   cannot recognize the unblinded signature it later validates.
//! - Input-ownership proofs: Schnorr signatures by a UTXO's key over the
//!   peer's nonce.
//! - HD key management: per-round signing keys and the per-Alice nonce
//!   sequence.

pub mod blind;
pub mod keys;
pub mod proof;

pub use blind::{
    blind_challenge, blind_sign, output_commitment, schnorr_sign, unblind_signature, verify,
    BlindingTweaks, UnblindedSignature,
};
pub use keys::{fresh_round_id, load_or_create_seed, IssuedNonce, KeyManager, HD_PURPOSE};
pub use proof::{sign_input_proof, verify_input_proof, PROOF_LEN};

/// Generic tagged hash: SHA256(SHA256(tag) || SHA256(tag) || msg).
pub(crate) fn tagged_hash(tag: &str, msg: &[u8]) -> [u8; 32] {
    use bitcoin::hashes::{sha256, Hash};
    use sha2::{Digest, Sha256};

    let tag_hash = sha256::Hash::hash(tag.as_bytes());
    let mut s = Sha256::new();
    s.update(tag_hash);
    s.update(tag_hash);
    s.update(msg);
    s.finalize().into()
}
