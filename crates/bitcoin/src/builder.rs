//! Round transaction assembly.
//!
//! Builds the unsigned CoinJoin transaction from the registered inputs and
//! outputs: mixed outputs first, then per-peer change, then the coordinator
//! fee output; dust outputs are dropped into the miner fee, and inputs and
//! outputs are shuffled with a round-scoped deterministic RNG so positions
//! leak nothing.

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Psbt, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use vortex_common::{Result, RoundId, VortexError};

/// Dust limit in satoshis; outputs below it are dropped into the miner fee.
pub const DUST_LIMIT: u64 = 546;

/// One registered input as it enters the builder.
#[derive(Debug, Clone)]
pub struct RoundInput {
    pub outpoint: OutPoint,
    pub prev_output: TxOut,
}

/// The assembled round transaction.
#[derive(Debug, Clone)]
pub struct BuiltRound {
    pub psbt: Psbt,
    /// Each registered input's index in the final (post-shuffle) ordering.
    pub input_indexes: Vec<(OutPoint, u32)>,
}

/// Assemble the unsigned round PSBT.
///
/// The coordinator fee output takes `mix_fee * inputs.len()` sats to
/// `coordinator_spk`. Dust filtering runs before the shuffle so the
/// recorded indexes match the transaction peers sign.
pub fn build_round_transaction(
    round_id: &RoundId,
    inputs: &[RoundInput],
    mixed_outputs: &[TxOut],
    change_outputs: &[TxOut],
    coordinator_spk: ScriptBuf,
    mix_fee: u64,
) -> Result<BuiltRound> {
    if inputs.is_empty() {
        return Err(VortexError::RoundFailed("no inputs to build from".to_string()));
    }
    if mixed_outputs.is_empty() {
        return Err(VortexError::RoundFailed("no mixed outputs to build from".to_string()));
    }

    let mut outputs: Vec<TxOut> = Vec::with_capacity(mixed_outputs.len() + change_outputs.len() + 1);
    outputs.extend_from_slice(mixed_outputs);
    outputs.extend_from_slice(change_outputs);
    outputs.push(TxOut {
        value: Amount::from_sat(mix_fee * inputs.len() as u64),
        script_pubkey: coordinator_spk,
    });

    // FilterDust: sub-dust change and a sub-dust coordinator output go to
    // the miners instead of bloating the transaction.
    outputs.retain(|out| out.value.to_sat() >= DUST_LIMIT);

    // Shuffle: seeded by the round id, so the ordering is reproducible from
    // persisted state but carries no registration-order information.
    let mut ordered_inputs: Vec<RoundInput> = inputs.to_vec();
    let mut rng = StdRng::from_seed(*round_id.as_bytes());
    ordered_inputs.shuffle(&mut rng);
    outputs.shuffle(&mut rng);

    let tx_inputs: Vec<TxIn> = ordered_inputs
        .iter()
        .map(|input| TxIn {
            previous_output: input.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::default(),
        })
        .collect();

    let input_indexes: Vec<(OutPoint, u32)> = ordered_inputs
        .iter()
        .enumerate()
        .map(|(i, input)| (input.outpoint, i as u32))
        .collect();

    let unsigned_tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: tx_inputs,
        output: outputs,
    };

    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx)
        .map_err(|e| VortexError::RoundFailed(format!("psbt construction failed: {}", e)))?;

    // Peers sign only from the PSBT, so every input carries its prevout.
    for (i, input) in ordered_inputs.iter().enumerate() {
        psbt.inputs[i].witness_utxo = Some(input.prev_output.clone());
    }

    Ok(BuiltRound { psbt, input_indexes })
}
