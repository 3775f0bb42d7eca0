//! Domain identifiers and round lifecycle types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier assigned to a peer connection by the connection manager.
///
/// A fresh random 32-byte digest per connection. A peer acting as both Alice
/// and Bob holds two unrelated ids, one per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to correlate log lines.
        write!(f, "{}", &hex::encode(self.0)[..16])
    }
}

/// Identifier of a mixing round: double-SHA256 of a fresh 32-byte secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoundId(pub [u8; 32]);

impl RoundId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..16])
    }
}

/// Phase of a mixing round.
///
/// Rounds advance strictly forward; `Failed` is reachable from any
/// non-terminal phase and always triggers scheduling of a new round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Pending,
    RegisterAlices,
    RegisterOutputs,
    Signing,
    Signed,
    Failed,
}

const VALID_TRANSITIONS: &[(RoundStatus, RoundStatus)] = &[
    (RoundStatus::Pending, RoundStatus::RegisterAlices),
    (RoundStatus::RegisterAlices, RoundStatus::RegisterOutputs),
    (RoundStatus::RegisterOutputs, RoundStatus::Signing),
    (RoundStatus::Signing, RoundStatus::Signed),
    (RoundStatus::Pending, RoundStatus::Failed),
    (RoundStatus::RegisterAlices, RoundStatus::Failed),
    (RoundStatus::RegisterOutputs, RoundStatus::Failed),
    (RoundStatus::Signing, RoundStatus::Failed),
];

impl RoundStatus {
    pub fn can_advance_to(self, next: RoundStatus) -> bool {
        VALID_TRANSITIONS.contains(&(self, next))
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RoundStatus::Signed | RoundStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoundStatus::Pending => "pending",
            RoundStatus::RegisterAlices => "register_alices",
            RoundStatus::RegisterOutputs => "register_outputs",
            RoundStatus::Signing => "signing",
            RoundStatus::Signed => "signed",
            RoundStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoundStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RoundStatus::Pending),
            "register_alices" => Ok(RoundStatus::RegisterAlices),
            "register_outputs" => Ok(RoundStatus::RegisterOutputs),
            "signing" => Ok(RoundStatus::Signing),
            "signed" => Ok(RoundStatus::Signed),
            "failed" => Ok(RoundStatus::Failed),
            other => Err(format!("unknown round status: '{}'", other)),
        }
    }
}

/// Script types the coordinator accepts at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    /// Native segwit v0 key hash (P2WPKH). Current policy for inputs,
    /// change, and mixed outputs.
    WitnessV0Keyhash,
    /// Segwit v1 taproot (P2TR).
    WitnessV1Taproot,
}

impl ScriptType {
    /// Check a scriptPubKey against this type.
    pub fn matches(self, spk: &bitcoin::Script) -> bool {
        match self {
            ScriptType::WitnessV0Keyhash => spk.is_p2wpkh(),
            ScriptType::WitnessV1Taproot => spk.is_p2tr(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScriptType::WitnessV0Keyhash => "witness_v0_keyhash",
            ScriptType::WitnessV1Taproot => "witness_v1_taproot",
        }
    }

    /// Describe a scriptPubKey for error reporting.
    pub fn describe(spk: &bitcoin::Script) -> String {
        if spk.is_p2wpkh() {
            "witness_v0_keyhash".to_string()
        } else if spk.is_p2tr() {
            "witness_v1_taproot".to_string()
        } else if spk.is_p2pkh() {
            "p2pkh".to_string()
        } else if spk.is_p2sh() {
            "p2sh".to_string()
        } else if spk.is_p2wsh() {
            "witness_v0_scripthash".to_string()
        } else {
            "nonstandard".to_string()
        }
    }
}
