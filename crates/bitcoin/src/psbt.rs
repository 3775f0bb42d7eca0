//! PSBT validation, combination, and extraction for the signing phase.
//!
//! Peers return the round PSBT with their own inputs finalized as P2WPKH
//! witnesses. The coordinator checks each claimed input, combines the
//! per-peer PSBTs, and extracts the broadcastable transaction.

use std::collections::HashMap;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa, All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Amount, OutPoint, Psbt, ScriptBuf, Transaction, TxOut, WPubkeyHash, Witness};

use vortex_common::{Result, VortexError};

/// Check that `index` of `psbt` carries a valid finalized P2WPKH witness.
///
/// The witness must be `[der_signature || sighash_flag, compressed_pubkey]`,
/// the pubkey must hash to the prevout's witness program, and the ECDSA
/// signature must verify over the input's BIP143 sighash.
pub fn verify_finalized_input(secp: &Secp256k1<All>, psbt: &Psbt, index: usize) -> Result<()> {
    let invalid = || VortexError::InvalidPsbtSignature { input_index: index };

    let psbt_input = psbt.inputs.get(index).ok_or_else(invalid)?;
    let witness = psbt_input.final_script_witness.as_ref().ok_or_else(invalid)?;
    if witness.len() != 2 {
        return Err(invalid());
    }
    let sig_bytes = witness.nth(0).ok_or_else(invalid)?;
    let key_bytes = witness.nth(1).ok_or_else(invalid)?;

    let utxo = psbt_input.witness_utxo.as_ref().ok_or_else(invalid)?;
    let pubkey = PublicKey::from_slice(key_bytes).map_err(|_| invalid())?;
    let wpkh = WPubkeyHash::hash(&pubkey.serialize());
    if utxo.script_pubkey != ScriptBuf::new_p2wpkh(&wpkh) {
        return Err(invalid());
    }

    let (der, flag) = sig_bytes.split_at(sig_bytes.len().saturating_sub(1));
    if flag != [EcdsaSighashType::All as u8] {
        return Err(invalid());
    }
    let signature = ecdsa::Signature::from_der(der).map_err(|_| invalid())?;

    let sighash = SighashCache::new(&psbt.unsigned_tx)
        .p2wpkh_signature_hash(index, &utxo.script_pubkey, utxo.value, EcdsaSighashType::All)
        .map_err(|_| invalid())?;
    let msg = Message::from_digest(sighash.to_byte_array());

    secp.verify_ecdsa(&msg, &signature, &pubkey)
        .map_err(|_| invalid())
}

/// Combine per-peer signed PSBTs into one. Order-independent.
pub fn combine_signed(psbts: Vec<Psbt>) -> Result<Psbt> {
    let mut iter = psbts.into_iter();
    let mut combined = iter
        .next()
        .ok_or_else(|| VortexError::RoundFailed("no signed psbts to combine".to_string()))?;
    for psbt in iter {
        combined
            .combine(psbt)
            .map_err(|e| VortexError::RoundFailed(format!("psbt combine failed: {}", e)))?;
    }
    Ok(combined)
}

/// Extract the final transaction from a fully finalized PSBT.
pub fn extract_final_tx(psbt: Psbt) -> Result<Transaction> {
    psbt.extract_tx()
        .map_err(|e| VortexError::RoundFailed(format!("psbt extraction failed: {}", e)))
}

/// Miner-fee sufficiency: `sum(inputs) - sum(outputs) >= fee_rate * vsize`.
pub fn check_fee(
    tx: &Transaction,
    prevouts: &HashMap<OutPoint, TxOut>,
    fee_rate: u64,
) -> Result<()> {
    let mut input_total: u64 = 0;
    for input in &tx.input {
        let prevout = prevouts
            .get(&input.previous_output)
            .ok_or(VortexError::MissingPrevOut(input.previous_output))?;
        input_total += prevout.value.to_sat();
    }
    let output_total: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();

    let fee = input_total.saturating_sub(output_total);
    let required = fee_rate * tx.vsize() as u64;
    if fee < required {
        return Err(VortexError::RoundFailed(format!(
            "miner fee {} below required {} at {} sat/vB",
            fee, required, fee_rate
        )));
    }
    Ok(())
}

/// Finalize one P2WPKH input of `psbt` with `key`. Peer side; the
/// coordinator never holds input keys.
pub fn sign_p2wpkh_input(
    secp: &Secp256k1<All>,
    psbt: &mut Psbt,
    index: usize,
    key: &SecretKey,
) -> Result<()> {
    let utxo = psbt.inputs[index]
        .witness_utxo
        .clone()
        .ok_or_else(|| VortexError::Crypto(format!("input {} missing witness utxo", index)))?;

    let sighash = SighashCache::new(&psbt.unsigned_tx)
        .p2wpkh_signature_hash(index, &utxo.script_pubkey, utxo.value, EcdsaSighashType::All)
        .map_err(|e| VortexError::Crypto(format!("sighash failed: {}", e)))?;
    let msg = Message::from_digest(sighash.to_byte_array());

    let signature = secp.sign_ecdsa(&msg, key);
    let mut sig_bytes = signature.serialize_der().to_vec();
    sig_bytes.push(EcdsaSighashType::All as u8);

    let mut witness = Witness::new();
    witness.push(sig_bytes);
    witness.push(key.public_key(secp).serialize());
    psbt.inputs[index].final_script_witness = Some(witness);
    Ok(())
}

/// A P2WPKH scriptPubKey for a compressed public key.
pub fn p2wpkh_script(pubkey: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::hash(&pubkey.serialize()))
}

/// A P2WPKH prevout for a key, used when minting test UTXOs.
pub fn p2wpkh_txout(pubkey: &PublicKey, sats: u64) -> TxOut {
    TxOut {
        value: Amount::from_sat(sats),
        script_pubkey: p2wpkh_script(pubkey),
    }
}
