//! Shared fixtures for coordinator integration tests: a mock chain RPC and
//! client-side peer helpers that drive the Alice/Bob protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};

use vortex_bitcoin::psbt::{p2wpkh_script, p2wpkh_txout};
use vortex_bitcoin::{ChainRpc, FeeOracle};
use vortex_common::protocol::{
    AskNonce, BobMessage, InputReference, RegisterInputs, SignedPsbtMessage,
};
use vortex_common::{CoordinatorConfig, PeerId, Result, RoundStatus, VortexError};
use vortex_coordinator::{Coordinator, CoordinatorHandle, RoundSnapshot};
use vortex_crypto::{
    blind_challenge, output_commitment, sign_input_proof, unblind_signature, KeyManager,
};
use vortex_storage::VortexStore;

/// Spec-scenario parameters: fee rate 10 sat/vB, mix 100_000, mix fee 500.
pub const FEE_RATE: u64 = 10;
pub const MIX_AMOUNT: u64 = 100_000;
pub const MIX_FEE: u64 = 500;
pub const INPUT_FEE: u64 = FEE_RATE * 149;
pub const OUTPUT_FEE: u64 = FEE_RATE * 43;
pub const UTXO_VALUE: u64 = 200_000;

/// In-memory chain backend.
pub struct MockChain {
    txs: Mutex<HashMap<Txid, Transaction>>,
    pub broadcasts: Mutex<Vec<Transaction>>,
    pub reject_broadcast: AtomicBool,
    fee_rate: f64,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            txs: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(Vec::new()),
            reject_broadcast: AtomicBool::new(false),
            fee_rate: FEE_RATE as f64,
        }
    }

    /// Mint a confirmed UTXO paying `value` to `key`, keyed by `salt` so
    /// every funding transaction is distinct.
    pub fn fund(&self, secp: &Secp256k1<All>, key: &SecretKey, value: u64, salt: u8) -> (OutPoint, TxOut) {
        let prev_output = p2wpkh_txout(&key.public_key(secp), value);
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array([salt; 32]),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![prev_output.clone()],
        };
        let txid = tx.compute_txid();
        self.txs.lock().unwrap().insert(txid, tx);
        (OutPoint { txid, vout: 0 }, prev_output)
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().unwrap().len()
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn get_raw_transaction(&self, txid: &Txid) -> Result<Option<Transaction>> {
        Ok(self.txs.lock().unwrap().get(txid).cloned())
    }

    async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid> {
        if self.reject_broadcast.load(Ordering::SeqCst) {
            return Err(VortexError::Broadcast(
                "bad-txns-inputs-missingorspent".to_string(),
            ));
        }
        self.broadcasts.lock().unwrap().push(tx.clone());
        Ok(tx.compute_txid())
    }

    async fn estimate_smart_fee(&self, _conf_target: u16) -> Result<Option<f64>> {
        Ok(Some(self.fee_rate))
    }
}

/// A running coordinator plus everything tests poke at.
pub struct TestRig {
    pub handle: CoordinatorHandle,
    pub store: Arc<VortexStore>,
    pub chain: Arc<MockChain>,
    pub secp: Secp256k1<All>,
    pub network: bitcoin::Network,
}

/// Spec-scenario configuration: max 3 / min 2 peers, short timers.
pub fn test_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.network = bitcoin::Network::Regtest;
    config.round_amount = MIX_AMOUNT;
    config.coordinator_fee = MIX_FEE;
    config.min_remix_peers = 1;
    config.min_new_peers = 1;
    config.max_peers = 3;
    config.round_interval_secs = 0;
    config.input_registration_secs = 1;
    config.output_registration_secs = 1;
    config.signing_secs = 5;
    config
}

pub async fn start_rig(config: CoordinatorConfig) -> TestRig {
    let network = config.network;
    let store = Arc::new(VortexStore::open_in_memory().unwrap());
    let chain = Arc::new(MockChain::new());
    let keys = KeyManager::new(&[0x77; 32], network, 0).unwrap();
    // Not regtest mode for the oracle: the scenarios run at 10 sat/vB.
    let fees = FeeOracle::new(chain.clone(), "http://unused".to_string(), false);

    let (handle, _task) = Coordinator::start(config, store.clone(), keys, chain.clone(), fees)
        .await
        .unwrap();

    TestRig {
        handle,
        store,
        chain,
        secp: Secp256k1::new(),
        network,
    }
}

/// Poll the coordinator until the snapshot satisfies `pred`.
pub async fn wait_for(
    handle: &CoordinatorHandle,
    pred: impl Fn(&RoundSnapshot) -> bool,
    what: &str,
) -> RoundSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = handle.snapshot().await.expect("coordinator alive");
        if pred(&snapshot) {
            return snapshot;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}; last snapshot: {:?}", what, snapshot);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_for_status(handle: &CoordinatorHandle, status: RoundStatus) -> RoundSnapshot {
    wait_for(handle, |s| s.status == status, &format!("status {}", status)).await
}

/// One simulated human participant: an Alice connection, a funded UTXO,
/// and the Bob-side secrets needed to reveal the mixed output later.
#[derive(Debug)]
pub struct TestPeer {
    pub alice_id: PeerId,
    pub utxo_key: SecretKey,
    pub outpoint: OutPoint,
    pub output: TxOut,
    bob_sig: Vec<u8>,
}

fn peer_id(salt: u8) -> PeerId {
    PeerId::from_bytes([salt; 32])
}

impl TestPeer {
    /// Run the Alice side: nonce request, blinding, input registration,
    /// blind-signature unblinding. Leaves a ready `BobMessage`.
    pub async fn register(rig: &TestRig, salt: u8) -> Self {
        let peer = Self::try_register(rig, salt, None).await.expect("registration");
        peer
    }

    /// Like `register`, but with full control and surfaced errors.
    /// `change_value`: None computes the exact remainder for one input.
    pub async fn try_register(
        rig: &TestRig,
        salt: u8,
        change_value: Option<u64>,
    ) -> Result<Self> {
        let utxo_key = SecretKey::from_slice(&[salt; 32]).unwrap();
        let (outpoint, prev_output) = rig.chain.fund(&rig.secp, &utxo_key, UTXO_VALUE, salt);
        Self::register_utxo(rig, salt, utxo_key, outpoint, prev_output, change_value, false).await
    }

    /// Full Alice flow over an existing UTXO.
    pub async fn register_utxo(
        rig: &TestRig,
        salt: u8,
        utxo_key: SecretKey,
        outpoint: OutPoint,
        prev_output: TxOut,
        change_value: Option<u64>,
        forge_proof: bool,
    ) -> Result<Self> {
        let alice_id = peer_id(salt);
        let details = rig.handle.mix_details(rig.network).await?;
        let nonce = rig
            .handle
            .get_nonce(alice_id, AskNonce { round_id: details.round_id })
            .await?
            .nonce;

        // Fresh unlinkable output key per round.
        let output_key = SecretKey::from_slice(&[salt ^ 0xAA; 32]).unwrap();
        let output = p2wpkh_txout(&output_key.public_key(&rig.secp), MIX_AMOUNT);

        let (blinded_output, tweaks, blinded_nonce) = blind_challenge(
            &rig.secp,
            &nonce,
            &details.public_key,
            &output_commitment(&output),
        )?;

        let proof_key = if forge_proof {
            SecretKey::from_slice(&[0xEE; 32]).unwrap()
        } else {
            utxo_key
        };
        let input_proof = sign_input_proof(&rig.secp, &proof_key, &nonce)?;

        let change_key = SecretKey::from_slice(&[salt ^ 0x55; 32]).unwrap();
        let change_value = change_value.unwrap_or_else(|| {
            prev_output.value.to_sat() - MIX_AMOUNT - MIX_FEE - INPUT_FEE - OUTPUT_FEE * 2
        });
        let change_output = Some(p2wpkh_txout(
            &change_key.public_key(&rig.secp),
            change_value,
        ));

        let msg = RegisterInputs {
            inputs: vec![InputReference {
                outpoint,
                output: prev_output,
                input_proof,
            }],
            blinded_output,
            change_output,
        };
        let blind_sig = rig.handle.register_inputs(alice_id, msg).await?;
        let sig = unblind_signature(&blind_sig.sig, &tweaks, blinded_nonce)?;

        Ok(Self {
            alice_id,
            utxo_key,
            outpoint,
            output,
            bob_sig: sig.serialize(),
        })
    }

    /// The Bob-side submission (sent over what would be a separate
    /// connection in production).
    pub fn bob_message(&self) -> BobMessage {
        BobMessage {
            output: self.output.clone(),
            sig: self.bob_sig.clone(),
        }
    }

    /// Sign this peer's inputs in the round PSBT and deliver it.
    pub async fn sign_round_psbt(&self, rig: &TestRig) -> Result<()> {
        let psbt = self.signed_round_psbt(rig).await;
        rig.handle
            .register_signature(self.alice_id, SignedPsbtMessage { psbt })
            .await
    }

    /// Fetch the round PSBT from the store and finalize this peer's inputs.
    pub async fn signed_round_psbt(&self, rig: &TestRig) -> bitcoin::Psbt {
        let snapshot = rig.handle.snapshot().await.unwrap();
        let round = rig.store.get_round(&snapshot.round_id).unwrap().unwrap();
        let mut psbt = round.unsigned_psbt.expect("round psbt");
        for input in rig
            .store
            .inputs_for_peer(&snapshot.round_id, &self.alice_id)
            .unwrap()
        {
            let index = input.index_in_final_tx.expect("index assigned") as usize;
            vortex_bitcoin::psbt::sign_p2wpkh_input(&rig.secp, &mut psbt, index, &self.utxo_key)
                .unwrap();
        }
        psbt
    }
}

/// A non-p2wpkh (legacy P2PKH) variant of a peer's prevout, for the
/// script-type policy scenario.
pub fn as_p2pkh(secp: &Secp256k1<All>, key: &SecretKey, value: u64) -> TxOut {
    let pubkey = bitcoin::PublicKey::new(key.public_key(secp));
    TxOut {
        value: Amount::from_sat(value),
        script_pubkey: ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()),
    }
}

/// The coordinator's fee output script for the current round.
pub async fn coordinator_spk(rig: &TestRig) -> ScriptBuf {
    let details = rig.handle.mix_details(rig.network).await.unwrap();
    p2wpkh_script(&details.public_key)
}
