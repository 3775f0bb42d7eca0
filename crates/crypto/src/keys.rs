//! HD key management for the coordinator.
//!
//! All keys hang off a single BIP32 root:
//!
//! - nonce keys at `m/69'/coin'/0'/0/index`, one per Alice, indexed by a
//!   strictly increasing counter so no nonce ever signs twice;
//! - round signing keys at `m/69'/coin'/0'/1/child`, where `child` is
//!   derived from the round id, giving every round its own key.

use std::path::Path;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::Network;
use rand::RngCore;

use vortex_common::{Result, RoundId, VortexError};

/// BIP43 purpose for coordinator keys.
pub const HD_PURPOSE: u32 = 69;

/// Chain index for Alice nonce keys.
const NONCE_CHAIN: u32 = 0;

/// Chain index for round signing keys.
const ROUND_CHAIN: u32 = 1;

/// A nonce handed to an Alice: the derivation index and the public point.
#[derive(Debug, Clone, Copy)]
pub struct IssuedNonce {
    pub index: u32,
    pub point: PublicKey,
}

/// Derives nonces and round signing keys, and issues blind signatures.
pub struct KeyManager {
    secp: Secp256k1<All>,
    account: Xpriv,
    coin: u32,
    next_index: u32,
}

impl KeyManager {
    /// Build from a 32-byte seed. `next_index` resumes the nonce counter
    /// (recovered from the store at startup).
    pub fn new(seed: &[u8], network: Network, next_index: u32) -> Result<Self> {
        let secp = Secp256k1::new();
        let coin = match network {
            Network::Bitcoin => 0,
            _ => 1,
        };
        let root = Xpriv::new_master(network, seed)
            .map_err(|e| VortexError::Crypto(format!("invalid seed: {}", e)))?;
        let path: DerivationPath = vec![
            ChildNumber::from_hardened_idx(HD_PURPOSE).expect("valid index"),
            ChildNumber::from_hardened_idx(coin).expect("valid index"),
            ChildNumber::from_hardened_idx(0).expect("valid index"),
        ]
        .into();
        let account = root
            .derive_priv(&secp, &path)
            .map_err(|e| VortexError::Crypto(format!("account derivation failed: {}", e)))?;

        Ok(Self {
            secp,
            account,
            coin,
            next_index,
        })
    }

    pub fn coin(&self) -> u32 {
        self.coin
    }

    /// The next nonce index that will be issued.
    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    fn derive(&self, chain: u32, index: u32) -> Result<SecretKey> {
        let path: DerivationPath = vec![
            ChildNumber::from_normal_idx(chain)
                .map_err(|e| VortexError::Crypto(e.to_string()))?,
            ChildNumber::from_normal_idx(index)
                .map_err(|e| VortexError::Crypto(e.to_string()))?,
        ]
        .into();
        let child = self
            .account
            .derive_priv(&self.secp, &path)
            .map_err(|e| VortexError::Crypto(format!("child derivation failed: {}", e)))?;
        Ok(child.private_key)
    }

    /// Issue the next nonce in the sequence. Strictly increasing; a given
    /// index is handed out exactly once per process lifetime.
    pub fn next_nonce(&mut self) -> Result<IssuedNonce> {
        let index = self.next_index;
        self.next_index += 1;
        let key = self.derive(NONCE_CHAIN, index)?;
        Ok(IssuedNonce {
            index,
            point: key.public_key(&self.secp),
        })
    }

    /// Re-derive the nonce point at a previously issued index.
    pub fn nonce_at(&self, index: u32) -> Result<PublicKey> {
        Ok(self.derive(NONCE_CHAIN, index)?.public_key(&self.secp))
    }

    /// The signing key for a round, selected by its id.
    pub fn round_signing_key(&self, round_id: &RoundId) -> Result<SecretKey> {
        self.derive(ROUND_CHAIN, round_child_index(round_id))
    }

    /// The public key unblinded output signatures verify under.
    pub fn round_public_key(&self, round_id: &RoundId) -> Result<PublicKey> {
        Ok(self.round_signing_key(round_id)?.public_key(&self.secp))
    }

    /// Issue a blind signature over `challenge` with the nonce at `index`.
    pub fn blind_sign(
        &self,
        round_id: &RoundId,
        nonce_index: u32,
        challenge: &[u8; 32],
    ) -> Result<[u8; 32]> {
        let nonce_key = self.derive(NONCE_CHAIN, nonce_index)?;
        let signing_key = self.round_signing_key(round_id)?;
        crate::blind::blind_sign(&nonce_key, &signing_key, challenge)
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }
}

/// Non-hardened child index for a round's signing key: the first four bytes
/// of the round id, clamped to the non-hardened range.
fn round_child_index(round_id: &RoundId) -> u32 {
    let bytes = round_id.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & 0x7FFF_FFFF
}

/// A fresh round id: double-SHA256 of a random 32-byte secret.
pub fn fresh_round_id() -> RoundId {
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    RoundId::from_bytes(sha256d::Hash::hash(&secret).to_byte_array())
}

/// Load the coordinator seed from `path`, generating and persisting a new
/// one on first start.
pub fn load_or_create_seed(path: &Path) -> Result<[u8; 32]> {
    if path.exists() {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| VortexError::Crypto(format!("failed to read seed file: {}", e)))?;
        let bytes = hex::decode(contents.trim())
            .map_err(|e| VortexError::Crypto(format!("invalid seed file: {}", e)))?;
        bytes
            .try_into()
            .map_err(|_| VortexError::Crypto("seed file must hold 32 hex-encoded bytes".to_string()))
    } else {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VortexError::Crypto(format!("failed to create seed dir: {}", e)))?;
        }
        std::fs::write(path, hex::encode(seed))
            .map_err(|e| VortexError::Crypto(format!("failed to write seed file: {}", e)))?;
        tracing::info!("Generated new coordinator seed at {:?}", path);
        Ok(seed)
    }
}
