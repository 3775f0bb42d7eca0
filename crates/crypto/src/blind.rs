//! Blind Schnorr signatures over secp256k1.
//!
//! The coordinator publishes a per-Alice nonce point `R` and the round key
//! `P = x·G`. The client blinds with fresh scalars `(alpha, beta)`:
//!
//! ```text
//! Client                                        Coordinator
//!   R' = R + alpha·G + beta·P
//!   c' = H(R' || P || m)
//!   c  = c' + beta            ── c (blinded_output) ──►
//!                                                  s = k + c·x
//!                             ◄────── s ──────────
//!   s' = s + alpha
//! ```
//!
//! `(R', s')` is an ordinary Schnorr signature on `m` under `P`
//! (`s'·G = R' + c'·P`) that the coordinator cannot link to the blinded
//! challenge it signed.

use bitcoin::secp256k1::{All, PublicKey, Scalar, Secp256k1, SecretKey};
use bitcoin::TxOut;
use rand::rngs::OsRng;

use vortex_common::{Result, VortexError};

use crate::tagged_hash;

/// Domain tag for the Schnorr challenge hash.
const CHALLENGE_TAG: &str = "vortex/schnorr/challenge";

/// Domain tag for deterministic signing nonces.
const NONCE_TAG: &str = "vortex/schnorr/nonce";

/// An unblinded Schnorr signature `(R', s')`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnblindedSignature {
    pub r: PublicKey,
    pub s: [u8; 32],
}

impl UnblindedSignature {
    /// Serialize as 65 bytes: compressed `R'` followed by `s'`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(65);
        out.extend_from_slice(&self.r.serialize());
        out.extend_from_slice(&self.s);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 65 {
            return Err(VortexError::Crypto(format!(
                "signature must be 65 bytes, got {}",
                bytes.len()
            )));
        }
        let r = PublicKey::from_slice(&bytes[..33])
            .map_err(|e| VortexError::Crypto(format!("invalid signature nonce: {}", e)))?;
        let mut s = [0u8; 32];
        s.copy_from_slice(&bytes[33..]);
        Ok(Self { r, s })
    }
}

/// Blinding scalars held by the client between blinding and unblinding.
pub struct BlindingTweaks {
    alpha: SecretKey,
    beta: SecretKey,
}

/// Schnorr challenge `H(R || P || m)` reduced to a scalar.
fn challenge(r: &PublicKey, signer_pk: &PublicKey, msg: &[u8]) -> Result<Scalar> {
    let mut data = Vec::with_capacity(66 + msg.len());
    data.extend_from_slice(&r.serialize());
    data.extend_from_slice(&signer_pk.serialize());
    data.extend_from_slice(msg);
    let hash = tagged_hash(CHALLENGE_TAG, &data);
    Scalar::from_be_bytes(hash)
        .map_err(|_| VortexError::Crypto("challenge hash out of scalar range".to_string()))
}

/// The message a mixed output's signature commits to: its consensus bytes.
pub fn output_commitment(output: &TxOut) -> Vec<u8> {
    bitcoin::consensus::serialize(output)
}

/// Coordinator side: sign a blinded challenge with `s = k + c·x`.
///
/// The nonce key `k` must never sign more than one challenge.
pub fn blind_sign(
    nonce_key: &SecretKey,
    signing_key: &SecretKey,
    blinded_challenge: &[u8; 32],
) -> Result<[u8; 32]> {
    let c = Scalar::from_be_bytes(*blinded_challenge)
        .map_err(|_| VortexError::Crypto("blinded challenge out of scalar range".to_string()))?;
    let cx = signing_key
        .mul_tweak(&c)
        .map_err(|e| VortexError::Crypto(format!("challenge multiplication failed: {}", e)))?;
    let s = nonce_key
        .add_tweak(&Scalar::from(cx))
        .map_err(|e| VortexError::Crypto(format!("nonce addition failed: {}", e)))?;
    Ok(s.secret_bytes())
}

/// Client side: blind the challenge for `msg` under the coordinator's nonce
/// `R` and round key `P`.
///
/// Returns the blinded challenge to submit, the tweaks to keep secret, and
/// the blinded nonce `R'` that becomes part of the final signature.
pub fn blind_challenge(
    secp: &Secp256k1<All>,
    nonce: &PublicKey,
    round_pk: &PublicKey,
    msg: &[u8],
) -> Result<([u8; 32], BlindingTweaks, PublicKey)> {
    let alpha = SecretKey::new(&mut OsRng);
    let beta = SecretKey::new(&mut OsRng);

    let alpha_point = alpha.public_key(secp);
    let beta_point = round_pk
        .mul_tweak(secp, &Scalar::from(beta))
        .map_err(|e| VortexError::Crypto(format!("beta tweak failed: {}", e)))?;

    let blinded_nonce = nonce
        .combine(&alpha_point)
        .and_then(|p| p.combine(&beta_point))
        .map_err(|e| VortexError::Crypto(format!("nonce blinding failed: {}", e)))?;

    let c_prime = challenge(&blinded_nonce, round_pk, msg)?;
    let blinded = SecretKey::from_slice(&c_prime.to_be_bytes())
        .map_err(|_| VortexError::Crypto("degenerate challenge".to_string()))?
        .add_tweak(&Scalar::from(beta))
        .map_err(|e| VortexError::Crypto(format!("challenge blinding failed: {}", e)))?;

    Ok((
        blinded.secret_bytes(),
        BlindingTweaks { alpha, beta },
        blinded_nonce,
    ))
}

/// Client side: unblind the coordinator's signature into `(R', s')`.
pub fn unblind_signature(
    blind_sig: &[u8; 32],
    tweaks: &BlindingTweaks,
    blinded_nonce: PublicKey,
) -> Result<UnblindedSignature> {
    let s = SecretKey::from_slice(blind_sig)
        .map_err(|e| VortexError::Crypto(format!("invalid blind signature: {}", e)))?
        .add_tweak(&Scalar::from(tweaks.alpha))
        .map_err(|e| VortexError::Crypto(format!("unblinding failed: {}", e)))?;
    Ok(UnblindedSignature {
        r: blinded_nonce,
        s: s.secret_bytes(),
    })
}

/// Verify a Schnorr signature `(R, s)` on `msg` under `signer_pk`:
/// `s·G == R + H(R || P || m)·P`.
pub fn verify(
    secp: &Secp256k1<All>,
    signer_pk: &PublicKey,
    msg: &[u8],
    sig: &UnblindedSignature,
) -> bool {
    let Ok(c) = challenge(&sig.r, signer_pk, msg) else {
        return false;
    };
    let Ok(s_key) = SecretKey::from_slice(&sig.s) else {
        return false;
    };
    let lhs = s_key.public_key(secp);
    let Ok(cp) = signer_pk.mul_tweak(secp, &c) else {
        return false;
    };
    let Ok(rhs) = sig.r.combine(&cp) else {
        return false;
    };
    lhs == rhs
}

/// Sign `msg` directly (no blinding) with a deterministic synthetic nonce.
///
/// Used for input-ownership proofs, where the signer holds the key locally.
pub fn schnorr_sign(
    secp: &Secp256k1<All>,
    signing_key: &SecretKey,
    msg: &[u8],
) -> Result<UnblindedSignature> {
    let mut nonce_input = Vec::with_capacity(32 + msg.len());
    nonce_input.extend_from_slice(&signing_key.secret_bytes());
    nonce_input.extend_from_slice(msg);
    let k = SecretKey::from_slice(&tagged_hash(NONCE_TAG, &nonce_input))
        .map_err(|_| VortexError::Crypto("degenerate signing nonce".to_string()))?;

    let r = k.public_key(secp);
    let pk = signing_key.public_key(secp);
    let c = challenge(&r, &pk, msg)?;
    let cx = signing_key
        .mul_tweak(&c)
        .map_err(|e| VortexError::Crypto(format!("challenge multiplication failed: {}", e)))?;
    let s = k
        .add_tweak(&Scalar::from(cx))
        .map_err(|e| VortexError::Crypto(format!("nonce addition failed: {}", e)))?;

    Ok(UnblindedSignature {
        r,
        s: s.secret_bytes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Secp256k1<All>, SecretKey, PublicKey, SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let signing_key = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let signing_pk = signing_key.public_key(&secp);
        let nonce_key = SecretKey::from_slice(&[0x22; 32]).unwrap();
        let nonce_pk = nonce_key.public_key(&secp);
        (secp, signing_key, signing_pk, nonce_key, nonce_pk)
    }

    #[test]
    fn test_blind_sign_unblind_verify() {
        let (secp, signing_key, signing_pk, nonce_key, nonce_pk) = setup();
        let msg = b"a mixed output";

        let (blinded, tweaks, blinded_nonce) =
            blind_challenge(&secp, &nonce_pk, &signing_pk, msg).unwrap();
        let blind_sig = blind_sign(&nonce_key, &signing_key, &blinded).unwrap();
        let sig = unblind_signature(&blind_sig, &tweaks, blinded_nonce).unwrap();

        assert!(verify(&secp, &signing_pk, msg, &sig));
    }

    #[test]
    fn test_unblinded_signature_is_unlinkable_to_challenge() {
        // The unblinded (R', s') must differ from anything the signer saw.
        let (secp, signing_key, signing_pk, nonce_key, nonce_pk) = setup();
        let msg = b"a mixed output";

        let (blinded, tweaks, blinded_nonce) =
            blind_challenge(&secp, &nonce_pk, &signing_pk, msg).unwrap();
        let blind_sig = blind_sign(&nonce_key, &signing_key, &blinded).unwrap();
        let sig = unblind_signature(&blind_sig, &tweaks, blinded_nonce).unwrap();

        assert_ne!(sig.r, nonce_pk);
        assert_ne!(sig.s, blind_sig);
        assert_ne!(sig.s, blinded);
    }

    #[test]
    fn test_verify_rejects_wrong_message() {
        let (secp, signing_key, signing_pk, nonce_key, nonce_pk) = setup();

        let (blinded, tweaks, blinded_nonce) =
            blind_challenge(&secp, &nonce_pk, &signing_pk, b"message one").unwrap();
        let blind_sig = blind_sign(&nonce_key, &signing_key, &blinded).unwrap();
        let sig = unblind_signature(&blind_sig, &tweaks, blinded_nonce).unwrap();

        assert!(!verify(&secp, &signing_pk, b"message two", &sig));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let (secp, signing_key, signing_pk, nonce_key, nonce_pk) = setup();
        let msg = b"a mixed output";

        let (blinded, tweaks, blinded_nonce) =
            blind_challenge(&secp, &nonce_pk, &signing_pk, msg).unwrap();
        let blind_sig = blind_sign(&nonce_key, &signing_key, &blinded).unwrap();
        let sig = unblind_signature(&blind_sig, &tweaks, blinded_nonce).unwrap();

        let other_pk = SecretKey::from_slice(&[0x33; 32]).unwrap().public_key(&secp);
        assert!(!verify(&secp, &other_pk, msg, &sig));
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let (secp, signing_key, signing_pk, nonce_key, nonce_pk) = setup();
        let msg = b"a mixed output";

        let (blinded, tweaks, blinded_nonce) =
            blind_challenge(&secp, &nonce_pk, &signing_pk, msg).unwrap();
        let blind_sig = blind_sign(&nonce_key, &signing_key, &blinded).unwrap();
        let mut sig = unblind_signature(&blind_sig, &tweaks, blinded_nonce).unwrap();

        sig.s[0] ^= 0xFF;
        assert!(!verify(&secp, &signing_pk, msg, &sig));
    }

    #[test]
    fn test_signature_serialization_roundtrip() {
        let (secp, signing_key, _, _, _) = setup();
        let sig = schnorr_sign(&secp, &signing_key, b"hello").unwrap();

        let bytes = sig.serialize();
        assert_eq!(bytes.len(), 65);
        let back = UnblindedSignature::from_bytes(&bytes).unwrap();
        assert_eq!(back, sig);

        assert!(UnblindedSignature::from_bytes(&bytes[..64]).is_err());
    }

    #[test]
    fn test_direct_schnorr_sign_verify() {
        let (secp, signing_key, signing_pk, _, _) = setup();
        let sig = schnorr_sign(&secp, &signing_key, b"prove it").unwrap();
        assert!(verify(&secp, &signing_pk, b"prove it", &sig));
        assert!(!verify(&secp, &signing_pk, b"prove what", &sig));
    }
}
