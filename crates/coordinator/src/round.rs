//! The round state machine and coordinator operations.
//!
//! One task owns all mutable round state and consumes the command channel.
//! Phase timers are sleep tasks that post `Timer` commands; stale events
//! are dropped by round-id and phase guards, so an early phase advance
//! implicitly cancels its timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Amount, OutPoint, Psbt, Transaction, TxOut};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use vortex_bitcoin::psbt as psbt_util;
use vortex_bitcoin::{
    build_round_transaction, ChainRpc, FeeOracle, RoundInput, INPUT_VBYTES, OUTPUT_VBYTES,
};
use vortex_common::protocol::{
    AskNonce, BlindedSig, BobMessage, MixDetails, NonceMessage, RegisterInputs,
    RegisterOutputAck, RestartRoundMessage, RoundFailedMessage, SignedPsbtMessage,
    UnsignedPsbtMessage, PROTOCOL_VERSION,
};
use vortex_common::{
    CoordinatorConfig, PeerId, Result, RoundStatus, ScriptType, VortexError,
};
use vortex_crypto::{fresh_round_id, verify_input_proof, KeyManager, UnblindedSignature, HD_PURPOSE};
use vortex_storage::{StoredAlice, StoredInput, StoredOutput, StoredRound, VortexStore};

use crate::aggregate::{self, Aggregator};
use crate::coordinator::{Command, CoordinatorHandle, RoundSnapshot, TimerEvent};
use crate::wire::Frame;

/// Pending per-peer signature slots while a round is in `Signing`.
struct SigningState {
    slots: HashMap<PeerId, oneshot::Sender<Psbt>>,
}

/// The single-writer coordinator.
pub struct Coordinator {
    config: CoordinatorConfig,
    store: Arc<VortexStore>,
    keys: KeyManager,
    rpc: Arc<dyn ChainRpc>,
    fees: FeeOracle,
    peers: HashMap<PeerId, mpsc::Sender<Frame>>,
    round: StoredRound,
    signing: Option<SigningState>,
    cmd_tx: mpsc::Sender<Command>,
}

impl Coordinator {
    /// Recover persisted state, schedule the first round, and spawn the
    /// coordinator task. Returns the handle plus the task's join handle.
    pub async fn start(
        config: CoordinatorConfig,
        store: Arc<VortexStore>,
        keys: KeyManager,
        rpc: Arc<dyn ChainRpc>,
        fees: FeeOracle,
    ) -> Result<(CoordinatorHandle, tokio::task::JoinHandle<()>)> {
        // Crash recovery: anything non-terminal from a previous run failed.
        for mut stale in store.unfinished_rounds()? {
            warn!(
                "Flushing round {} (status {}) from a previous run to failed",
                stale.round_id, stale.status
            );
            stale.status = RoundStatus::Failed;
            store.save_round(&stale)?;
        }

        let (cmd_tx, mut cmd_rx) = mpsc::channel(256);
        let handle = CoordinatorHandle::new(cmd_tx.clone());

        let fee_rate = fees.fee_rate().await?;
        let round = plan_round(&config, &store, fee_rate)?;
        info!(
            "Scheduled round {} starting at {}",
            round.round_id, round.round_time
        );

        let mut coordinator = Self {
            config,
            store,
            keys,
            rpc,
            fees,
            peers: HashMap::new(),
            round,
            signing: None,
            cmd_tx,
        };
        coordinator.arm_round_start_timer();

        let task = tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if coordinator.handle_command(cmd).await {
                    break;
                }
            }
        });

        Ok((handle, task))
    }

    /// Process one command; returns true on shutdown.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::GetNonce { peer_id, ask, reply } => {
                let _ = reply.send(self.get_nonce(peer_id, ask));
            }
            Command::MixDetails { network, reply } => {
                let _ = reply.send(self.mix_details(network));
            }
            Command::RegisterInputs { peer_id, msg, reply } => {
                let result = self.register_inputs(peer_id, msg).await;
                let fatal = fatal_reason(&result);
                let _ = reply.send(result);
                if let Some(reason) = fatal {
                    self.fail_round(VortexError::RoundFailed(reason)).await;
                }
            }
            Command::RegisterOutput { msg, reply } => {
                let result = self.register_output(msg).await;
                let fatal = fatal_reason(&result);
                let _ = reply.send(result);
                if let Some(reason) = fatal {
                    self.fail_round(VortexError::RoundFailed(reason)).await;
                }
            }
            Command::RegisterSignature { peer_id, msg, reply } => {
                let result = self.register_signature(peer_id, msg);
                let fatal = fatal_reason(&result);
                let _ = reply.send(result);
                if let Some(reason) = fatal {
                    self.fail_round(VortexError::RoundFailed(reason)).await;
                }
            }
            Command::PeerConnected { peer_id, sender } => {
                debug!("Peer {} connected", peer_id);
                self.peers.insert(peer_id, sender);
            }
            Command::PeerDisconnected { peer_id } => {
                debug!("Peer {} disconnected", peer_id);
                self.peers.remove(&peer_id);
                if let Some(signing) = &mut self.signing {
                    if signing.slots.remove(&peer_id).is_some() {
                        warn!(
                            "Peer {} disconnected during signing; its slot fails",
                            peer_id
                        );
                    }
                }
            }
            Command::Timer(event) => self.handle_timer(event).await,
            Command::RoundOutcome { round_id, result } => {
                self.handle_round_outcome(round_id, result).await;
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(RoundSnapshot {
                    round_id: self.round.round_id,
                    status: self.round.status,
                    registered_alices: self
                        .store
                        .count_registered_alices(&self.round.round_id)
                        .unwrap_or(0),
                    registered_outputs: self
                        .store
                        .count_outputs(&self.round.round_id)
                        .unwrap_or(0),
                });
            }
            Command::Shutdown { reply } => {
                info!("Coordinator stopping");
                self.signing = None;
                if !self.round.status.is_terminal() {
                    self.round.status = RoundStatus::Failed;
                    if let Err(e) = self.store.save_round(&self.round) {
                        error!("Failed to flush round on shutdown: {}", e);
                    }
                }
                self.peers.clear();
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Issue (or re-deliver) the Alice's nonce. Idempotent per peer.
    fn get_nonce(&mut self, peer_id: PeerId, ask: AskNonce) -> Result<NonceMessage> {
        match self.round.status {
            RoundStatus::Pending | RoundStatus::RegisterAlices => {}
            actual => {
                return Err(VortexError::WrongPhase {
                    expected: RoundStatus::RegisterAlices,
                    actual,
                });
            }
        }
        if ask.round_id != self.round.round_id {
            return Err(VortexError::WrongRound {
                got: ask.round_id,
                current: self.round.round_id,
            });
        }

        if let Some(alice) = self.store.get_alice(&peer_id)? {
            if alice.round_id == self.round.round_id {
                return Ok(NonceMessage { nonce: alice.nonce });
            }
        }

        let nonce = self.keys.next_nonce()?;
        let alice = StoredAlice {
            peer_id,
            round_id: self.round.round_id,
            purpose: HD_PURPOSE,
            coin: self.keys.coin(),
            account: 0,
            chain: 0,
            nonce_index: nonce.index,
            nonce: nonce.point,
            blinded_output: None,
            change_spk: None,
            blind_sig: None,
            signed: false,
        };
        self.store.save_alice(&alice)?;
        debug!("Issued nonce {} to peer {}", nonce.index, peer_id);
        Ok(NonceMessage { nonce: nonce.point })
    }

    /// Advertise the current round's parameters.
    fn mix_details(&self, network: bitcoin::Network) -> Result<MixDetails> {
        if network != self.config.network {
            return Err(VortexError::WrongNetwork {
                expected: self.config.network,
                got: network,
            });
        }
        Ok(MixDetails {
            version: PROTOCOL_VERSION,
            round_id: self.round.round_id,
            amount: self.round.mix_amount,
            mix_fee: self.round.mix_fee,
            input_fee: self.round.input_fee,
            output_fee: self.round.output_fee,
            public_key: self.keys.round_public_key(&self.round.round_id)?,
            round_time: self.round.round_time,
        })
    }

    /// Validate and register a peer's inputs, returning the blind signature.
    async fn register_inputs(&mut self, peer_id: PeerId, msg: RegisterInputs) -> Result<BlindedSig> {
        if self.round.status != RoundStatus::RegisterAlices {
            return Err(VortexError::WrongPhase {
                expected: RoundStatus::RegisterAlices,
                actual: self.round.status,
            });
        }
        let mut alice = self
            .store
            .get_alice(&peer_id)?
            .filter(|a| a.round_id == self.round.round_id)
            .ok_or(VortexError::UnknownPeer(peer_id))?;
        if msg.inputs.is_empty() {
            return Err(VortexError::NoInputs);
        }

        // Policy predicates run before ban logic and never ban.
        for input in &msg.inputs {
            let spk = &input.output.script_pubkey;
            if !self.config.input_script_type.matches(spk) {
                return Err(VortexError::ScriptType {
                    expected: self.config.input_script_type.as_str(),
                    got: ScriptType::describe(spk),
                });
            }
        }
        if let Some(change) = &msg.change_output {
            if !self.config.change_script_type.matches(&change.script_pubkey) {
                return Err(VortexError::ScriptType {
                    expected: self.config.change_script_type.as_str(),
                    got: ScriptType::describe(&change.script_pubkey),
                });
            }
        }

        // From here on, evidence of a bad or unowned UTXO bans every
        // submitted outpoint; infrastructure failures (store, node RPC) do
        // not punish the peer.
        if let Err(e) = self.validate_inputs(&alice, &msg).await {
            if e.bans_inputs() {
                let outpoints: Vec<OutPoint> = msg.inputs.iter().map(|i| i.outpoint).collect();
                let until = Utc::now() + self.config.bad_inputs_ban();
                if let Err(ban_err) = self.store.ban_outpoints(&outpoints, until, &e.to_string()) {
                    error!("Failed to persist ban: {}", ban_err);
                }
            }
            return Err(e);
        }

        // All inputs valid: issue the blind signature and commit the
        // registration. Failures past this point are fatal for the round.
        let sig = self
            .keys
            .blind_sign(&self.round.round_id, alice.nonce_index, &msg.blinded_output)?;

        // A second call from the same Alice overwrites her earlier
        // registration; she still counts once towards the max_peers cutoff.
        if alice.is_registered() {
            debug!("Peer {} re-registering; replacing earlier inputs", peer_id);
        }
        let inputs: Vec<StoredInput> = msg
            .inputs
            .iter()
            .map(|i| StoredInput {
                round_id: self.round.round_id,
                outpoint: i.outpoint,
                peer_id,
                prev_output: i.output.clone(),
                input_proof: i.input_proof.clone(),
                index_in_final_tx: None,
            })
            .collect();
        self.store
            .replace_peer_inputs(&self.round.round_id, &peer_id, &inputs)?;

        alice.blinded_output = Some(msg.blinded_output);
        alice.change_spk = msg.change_output.map(|o| o.script_pubkey);
        alice.blind_sig = Some(sig);
        self.store.save_alice(&alice)?;

        let registered = self.store.count_registered_alices(&self.round.round_id)?;
        info!(
            "Peer {} registered {} input(s); {} Alice(s) now registered",
            peer_id,
            inputs.len(),
            registered
        );

        // The max_peers-th commit advances the phase exactly once; the
        // status guard makes a second firing impossible.
        if registered >= self.config.max_peers {
            self.advance_to_register_outputs()?;
        }

        Ok(BlindedSig { sig })
    }

    /// Per-input validation: ban list, chain lookup, ownership proof, then
    /// the change arithmetic. Chain lookups and proofs run concurrently.
    async fn validate_inputs(&self, alice: &StoredAlice, msg: &RegisterInputs) -> Result<()> {
        // An outpoint may enter the round exactly once: a repeat within the
        // message or a clash with another peer's registration would
        // double-count its value in the fee arithmetic. The Alice's own
        // earlier inputs are excluded, since an overwrite replaces them.
        let mut seen: Vec<OutPoint> = self
            .store
            .inputs_for_round(&self.round.round_id)?
            .iter()
            .filter(|i| i.peer_id != alice.peer_id)
            .map(|i| i.outpoint)
            .collect();
        for input in &msg.inputs {
            if seen.contains(&input.outpoint) {
                return Err(VortexError::DuplicateInput(input.outpoint));
            }
            seen.push(input.outpoint);
        }

        let now = Utc::now();
        for input in &msg.inputs {
            if let Some(ban) = self.store.active_ban(&input.outpoint, now)? {
                return Err(VortexError::BannedInput {
                    outpoint: input.outpoint,
                    until: ban.banned_until,
                });
            }
        }

        let mut checks = JoinSet::new();
        for input in msg.inputs.clone() {
            let rpc = self.rpc.clone();
            let nonce = alice.nonce;
            checks.spawn(async move {
                let tx = rpc
                    .get_raw_transaction(&input.outpoint.txid)
                    .await?
                    .ok_or(VortexError::MissingPrevOut(input.outpoint))?;
                let prev = tx
                    .output
                    .get(input.outpoint.vout as usize)
                    .ok_or(VortexError::PrevOutMismatch(input.outpoint))?;
                if *prev != input.output {
                    return Err(VortexError::PrevOutMismatch(input.outpoint));
                }
                let secp = Secp256k1::new();
                if !verify_input_proof(
                    &secp,
                    &input.output.script_pubkey,
                    &nonce,
                    &input.input_proof,
                ) {
                    return Err(VortexError::InvalidInputProof(input.outpoint));
                }
                Ok(())
            });
        }
        while let Some(joined) = checks.join_next().await {
            joined.map_err(|e| VortexError::RoundFailed(format!("validation task failed: {}", e)))??;
        }

        // Inputs must cover the mix amount plus everything this
        // registration adds to the transaction: the coordinator fee, each
        // input's vbytes, and two outputs (mix + change).
        let input_sum: u64 = msg.inputs.iter().map(|i| i.output.value.to_sat()).sum();
        let required = self.round.mix_amount
            + self.round.mix_fee
            + self.round.input_fee * msg.inputs.len() as u64
            + self.round.output_fee * 2;
        if input_sum < required {
            return Err(VortexError::InsufficientInputValue {
                provided: input_sum,
                required,
            });
        }
        if let Some(change) = &msg.change_output {
            let allowed = input_sum - required;
            if change.value.to_sat() > allowed {
                return Err(VortexError::ExcessiveChange {
                    change: change.value.to_sat(),
                    allowed,
                });
            }
        }
        Ok(())
    }

    /// Accept a Bob's unblinded output. No peer linkage exists or is
    /// created here; failures never ban.
    async fn register_output(&mut self, msg: BobMessage) -> Result<RegisterOutputAck> {
        if self.round.status != RoundStatus::RegisterOutputs {
            return Err(VortexError::WrongPhase {
                expected: RoundStatus::RegisterOutputs,
                actual: self.round.status,
            });
        }
        let spk = &msg.output.script_pubkey;
        if !self.config.output_script_type.matches(spk) {
            return Err(VortexError::ScriptType {
                expected: self.config.output_script_type.as_str(),
                got: ScriptType::describe(spk),
            });
        }
        if msg.output.value.to_sat() != self.round.mix_amount {
            return Err(VortexError::WrongOutputAmount {
                expected: self.round.mix_amount,
                got: msg.output.value.to_sat(),
            });
        }

        let sig = UnblindedSignature::from_bytes(&msg.sig)
            .map_err(|_| VortexError::InvalidOutputSignature)?;
        let round_pk = self.keys.round_public_key(&self.round.round_id)?;
        let commitment = vortex_crypto::output_commitment(&msg.output);
        if !vortex_crypto::verify(self.keys.secp(), &round_pk, &commitment, &sig) {
            return Err(VortexError::InvalidOutputSignature);
        }

        self.store.insert_output(&StoredOutput {
            round_id: self.round.round_id,
            output: msg.output,
            sig: msg.sig,
        })?;

        let outputs = self.store.count_outputs(&self.round.round_id)?;
        let alices = self.store.count_registered_alices(&self.round.round_id)?;
        info!("Registered output ({}/{})", outputs, alices);

        if outputs >= alices {
            self.begin_signing().await?;
        }
        Ok(RegisterOutputAck { accepted: true })
    }

    /// Assemble the round transaction and open the signing phase.
    async fn begin_signing(&mut self) -> Result<()> {
        let round_id = self.round.round_id;
        let stored_inputs = self.store.inputs_for_round(&round_id)?;
        let outputs = self.store.outputs_for_round(&round_id)?;
        let alices = self.store.alices_for_round(&round_id)?;
        let registered: Vec<&StoredAlice> =
            alices.iter().filter(|a| a.is_registered()).collect();

        // Per-peer change: the full remainder after the mix amount and the
        // fees the peer's registration incurred.
        let mut change_outputs = Vec::new();
        for alice in &registered {
            let Some(spk) = &alice.change_spk else { continue };
            let peer_inputs: Vec<&StoredInput> = stored_inputs
                .iter()
                .filter(|i| i.peer_id == alice.peer_id)
                .collect();
            let input_sum: u64 = peer_inputs
                .iter()
                .map(|i| i.prev_output.value.to_sat())
                .sum();
            let owed = self.round.mix_amount
                + self.round.mix_fee
                + self.round.input_fee * peer_inputs.len() as u64
                + self.round.output_fee * 2;
            change_outputs.push(TxOut {
                value: Amount::from_sat(input_sum.saturating_sub(owed)),
                script_pubkey: spk.clone(),
            });
        }

        let round_inputs: Vec<RoundInput> = stored_inputs
            .iter()
            .map(|i| RoundInput {
                outpoint: i.outpoint,
                prev_output: i.prev_output.clone(),
            })
            .collect();
        let mixed: Vec<TxOut> = outputs.iter().map(|o| o.output.clone()).collect();
        let coordinator_spk =
            psbt_util::p2wpkh_script(&self.keys.round_public_key(&round_id)?);

        let built = build_round_transaction(
            &round_id,
            &round_inputs,
            &mixed,
            &change_outputs,
            coordinator_spk,
            self.round.mix_fee,
        )?;
        for (outpoint, index) in &built.input_indexes {
            self.store.set_input_index(&round_id, outpoint, *index)?;
        }

        self.round.unsigned_psbt = Some(built.psbt.clone());
        self.transition(RoundStatus::Signing)?;

        // One-shot slot per registered Alice; the aggregator awaits the
        // full set under the signing timer.
        let mut slots = HashMap::new();
        let mut receivers = Vec::new();
        for alice in &registered {
            let (slot_tx, slot_rx) = oneshot::channel();
            slots.insert(alice.peer_id, slot_tx);
            receivers.push((alice.peer_id, slot_rx));
        }
        self.signing = Some(SigningState { slots });

        let prevouts: HashMap<OutPoint, TxOut> = stored_inputs
            .iter()
            .map(|i| (i.outpoint, i.prev_output.clone()))
            .collect();
        aggregate::spawn(Aggregator {
            round_id,
            receivers,
            prevouts,
            fee_rate: self.round.fee_rate,
            rpc: self.rpc.clone(),
            timeout: self.config.signing_time(),
            cmd_tx: self.cmd_tx.clone(),
        });

        // Push the unsigned transaction to every registered Alice.
        let frame = Frame::UnsignedPsbt(UnsignedPsbtMessage { psbt: built.psbt });
        for alice in &registered {
            match self.peers.get(&alice.peer_id) {
                Some(sender) => {
                    let _ = sender.send(frame.clone()).await;
                }
                None => warn!("Peer {} offline at signing start", alice.peer_id),
            }
        }
        Ok(())
    }

    /// Validate and accept a peer's signed PSBT.
    fn register_signature(&mut self, peer_id: PeerId, msg: SignedPsbtMessage) -> Result<()> {
        if self.round.status != RoundStatus::Signing {
            return Err(VortexError::WrongPhase {
                expected: RoundStatus::Signing,
                actual: self.round.status,
            });
        }
        let mut alice = self
            .store
            .get_alice(&peer_id)?
            .filter(|a| a.round_id == self.round.round_id && a.is_registered())
            .ok_or(VortexError::UnknownPeer(peer_id))?;

        if let Err(e) = self.validate_signed_psbt(&peer_id, &msg.psbt) {
            if matches!(
                e,
                VortexError::PsbtMismatch | VortexError::InvalidPsbtSignature { .. }
            ) {
                let outpoints: Vec<OutPoint> = self
                    .store
                    .inputs_for_peer(&self.round.round_id, &peer_id)?
                    .iter()
                    .map(|i| i.outpoint)
                    .collect();
                let until = Utc::now() + self.config.invalid_signature_ban();
                if let Err(ban_err) = self.store.ban_outpoints(&outpoints, until, &e.to_string()) {
                    error!("Failed to persist ban: {}", ban_err);
                }
            }
            // Dropping the slot fails the aggregation, which fails the round.
            if let Some(signing) = &mut self.signing {
                signing.slots.remove(&peer_id);
            }
            return Err(e);
        }

        alice.signed = true;
        self.store.save_alice(&alice)?;

        if let Some(signing) = &mut self.signing {
            match signing.slots.remove(&peer_id) {
                Some(slot) => {
                    let _ = slot.send(msg.psbt);
                }
                None => debug!("Peer {} already delivered a signed psbt", peer_id),
            }
        }
        Ok(())
    }

    fn validate_signed_psbt(&self, peer_id: &PeerId, psbt: &Psbt) -> Result<()> {
        let unsigned = self
            .round
            .unsigned_psbt
            .as_ref()
            .ok_or_else(|| VortexError::RoundFailed("signing phase without a psbt".to_string()))?;

        if bitcoin::consensus::serialize(&psbt.unsigned_tx)
            != bitcoin::consensus::serialize(&unsigned.unsigned_tx)
        {
            return Err(VortexError::PsbtMismatch);
        }

        for input in self.store.inputs_for_peer(&self.round.round_id, peer_id)? {
            let index = input.index_in_final_tx.ok_or_else(|| {
                VortexError::RoundFailed(format!("input {} has no final index", input.outpoint))
            })?;
            psbt_util::verify_finalized_input(self.keys.secp(), psbt, index as usize)?;
        }
        Ok(())
    }

    // ========================================================================
    // Phase transitions and timers
    // ========================================================================

    fn transition(&mut self, next: RoundStatus) -> Result<()> {
        if !self.round.status.can_advance_to(next) {
            return Err(VortexError::RoundFailed(format!(
                "illegal transition {} -> {}",
                self.round.status, next
            )));
        }
        info!(
            "Round {} advancing {} -> {}",
            self.round.round_id, self.round.status, next
        );
        self.round.status = next;
        self.store.save_round(&self.round)
    }

    fn advance_to_register_alices(&mut self) -> Result<()> {
        self.transition(RoundStatus::RegisterAlices)?;
        self.arm_timer(RoundStatus::RegisterAlices, self.config.input_registration_time());
        Ok(())
    }

    fn advance_to_register_outputs(&mut self) -> Result<()> {
        self.transition(RoundStatus::RegisterOutputs)?;
        self.arm_timer(
            RoundStatus::RegisterOutputs,
            self.config.output_registration_time(),
        );
        Ok(())
    }

    fn arm_round_start_timer(&self) {
        let now = Utc::now().timestamp().max(0) as u64;
        let delay = Duration::from_secs(self.round.round_time.saturating_sub(now));
        self.arm_timer(RoundStatus::Pending, delay);
    }

    /// Spawn a sleep task that posts a timer command. The receipt-side
    /// guards make firing after an early phase advance a no-op.
    fn arm_timer(&self, phase: RoundStatus, delay: Duration) {
        let cmd_tx = self.cmd_tx.clone();
        let event = TimerEvent {
            round_id: self.round.round_id,
            phase,
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(Command::Timer(event)).await;
        });
    }

    async fn handle_timer(&mut self, event: TimerEvent) {
        if event.round_id != self.round.round_id || event.phase != self.round.status {
            debug!(
                "Ignoring stale timer (round {}, phase {})",
                event.round_id, event.phase
            );
            return;
        }

        let result = match event.phase {
            RoundStatus::Pending => self.advance_to_register_alices(),
            RoundStatus::RegisterAlices => self.input_registration_expired().await,
            RoundStatus::RegisterOutputs => self.output_registration_expired().await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            self.fail_round(e).await;
        }
    }

    async fn input_registration_expired(&mut self) -> Result<()> {
        let registered = self.store.count_registered_alices(&self.round.round_id)?;
        let need = self.config.min_peers();
        if registered >= need {
            self.advance_to_register_outputs()
        } else {
            Err(VortexError::NotEnoughPeers {
                got: registered,
                need,
            })
        }
    }

    async fn output_registration_expired(&mut self) -> Result<()> {
        let outputs = self.store.count_outputs(&self.round.round_id)?;
        let alices = self.store.count_registered_alices(&self.round.round_id)?;
        if outputs >= alices && outputs > 0 {
            self.begin_signing().await
        } else {
            Err(VortexError::RoundFailed(format!(
                "output registration timed out with {} of {} outputs",
                outputs, alices
            )))
        }
    }

    // ========================================================================
    // Round completion and failure
    // ========================================================================

    async fn handle_round_outcome(&mut self, round_id: vortex_common::RoundId, result: Result<Transaction>) {
        if round_id != self.round.round_id || self.round.status != RoundStatus::Signing {
            debug!("Ignoring outcome for stale round {}", round_id);
            return;
        }
        match result {
            Ok(tx) => {
                let input_count = self
                    .store
                    .inputs_for_round(&round_id)
                    .map(|v| v.len())
                    .unwrap_or(0) as u64;
                self.round.final_tx = Some(tx.clone());
                self.round.profit = Some(self.round.mix_fee * input_count);
                self.signing = None;
                if let Err(e) = self.transition(RoundStatus::Signed) {
                    error!("Failed to mark round signed: {}", e);
                }
                info!(
                    "Round {} complete: broadcast {}",
                    round_id,
                    tx.compute_txid()
                );
                self.start_new_round().await;
            }
            Err(e) => self.fail_round(e).await,
        }
    }

    async fn fail_round(&mut self, err: VortexError) {
        warn!("Round {} failed: {}", self.round.round_id, err);
        // Dropping the slots cancels the aggregator's pending receivers.
        self.signing = None;
        if !self.round.status.is_terminal() {
            self.round.status = RoundStatus::Failed;
            if let Err(e) = self.store.save_round(&self.round) {
                error!("Failed to persist round failure: {}", e);
            }
        }
        self.broadcast(Frame::RoundFailed(RoundFailedMessage {
            reason: err.to_string(),
        }))
        .await;
        self.start_new_round().await;
    }

    /// Schedule the next round. A fresh round id per round; a fee-oracle
    /// failure keeps the previous rate rather than stalling the mix.
    async fn start_new_round(&mut self) {
        let fee_rate = match self.fees.fee_rate().await {
            Ok(rate) => rate,
            Err(e) => {
                warn!("Fee estimation failed ({}), keeping previous rate", e);
                self.round.fee_rate
            }
        };
        match plan_round(&self.config, &self.store, fee_rate) {
            Ok(round) => {
                info!(
                    "Scheduled round {} starting at {}",
                    round.round_id, round.round_time
                );
                self.round = round;
                self.arm_round_start_timer();
                self.broadcast(Frame::RestartRound(RestartRoundMessage {
                    round_id: self.round.round_id,
                    round_time: self.round.round_time,
                }))
                .await;
            }
            Err(e) => error!("Failed to schedule a new round: {}", e),
        }
    }

    async fn broadcast(&self, frame: Frame) {
        for (peer_id, sender) in &self.peers {
            if sender.send(frame.clone()).await.is_err() {
                debug!("Peer {} channel closed", peer_id);
            }
        }
    }
}

/// Plan a fresh round starting one interval from now.
fn plan_round(
    config: &CoordinatorConfig,
    store: &VortexStore,
    fee_rate: u64,
) -> Result<StoredRound> {
    let round = StoredRound {
        round_id: fresh_round_id(),
        status: RoundStatus::Pending,
        round_time: Utc::now().timestamp().max(0) as u64 + config.round_interval_secs,
        fee_rate,
        mix_amount: config.round_amount,
        mix_fee: config.coordinator_fee,
        input_fee: fee_rate * INPUT_VBYTES,
        output_fee: fee_rate * OUTPUT_VBYTES,
        unsigned_psbt: None,
        final_tx: None,
        profit: None,
    };
    store.save_round(&round)?;
    Ok(round)
}

/// Errors that invalidate the round itself rather than one request.
fn fatal_reason<T>(result: &Result<T>) -> Option<String> {
    match result {
        Err(e @ (VortexError::Storage(_) | VortexError::Crypto(_) | VortexError::RoundFailed(_))) => {
            Some(e.to_string())
        }
        _ => None,
    }
}
