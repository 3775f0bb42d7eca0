//! Persistent storage for coordinator state.
//!
//! Uses SQLite for durable storage of:
//! - rounds and their lifecycle artifacts (unsigned PSBT, final tx, profit)
//! - Alices (per-peer registrations and issued nonces)
//! - registered inputs and outputs of the current round
//! - banned UTXOs, which outlive rounds
//!
//! Registered outputs deliberately carry no peer linkage; the blind
//! signature protocol keeps Alices and outputs unlinkable even with full
//! database access.

mod entities;

use std::path::Path;
use std::sync::Mutex;

use bitcoin::{OutPoint, Psbt, Transaction, TxOut};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use vortex_common::{PeerId, Result, RoundId, RoundStatus, VortexError};

pub use entities::{BannedUtxo, StoredAlice, StoredInput, StoredOutput, StoredRound};

/// Schema migrations, applied in order; `PRAGMA user_version` tracks the
/// last applied index so startup is idempotent.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE rounds (
        round_id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        round_time INTEGER NOT NULL,
        fee_rate INTEGER NOT NULL,
        mix_amount INTEGER NOT NULL,
        mix_fee INTEGER NOT NULL,
        input_fee INTEGER NOT NULL,
        output_fee INTEGER NOT NULL,
        unsigned_psbt TEXT,
        final_tx TEXT,
        profit INTEGER
    );
    CREATE TABLE alices (
        peer_id TEXT PRIMARY KEY,
        round_id TEXT NOT NULL,
        purpose INTEGER NOT NULL,
        coin INTEGER NOT NULL,
        account INTEGER NOT NULL,
        chain INTEGER NOT NULL,
        nonce_index INTEGER NOT NULL UNIQUE,
        nonce TEXT NOT NULL,
        blinded_output TEXT,
        change_spk TEXT,
        blind_sig TEXT,
        signed INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE registered_inputs (
        round_id TEXT NOT NULL,
        outpoint TEXT NOT NULL,
        peer_id TEXT NOT NULL,
        value INTEGER NOT NULL,
        script_pubkey TEXT NOT NULL,
        input_proof TEXT NOT NULL,
        index_in_final_tx INTEGER,
        PRIMARY KEY (round_id, outpoint)
    );
    CREATE TABLE registered_outputs (
        round_id TEXT NOT NULL,
        value INTEGER NOT NULL,
        script_pubkey TEXT NOT NULL,
        sig TEXT NOT NULL,
        PRIMARY KEY (round_id, script_pubkey, value)
    );
    CREATE TABLE banned_utxos (
        outpoint TEXT PRIMARY KEY,
        banned_until INTEGER NOT NULL,
        reason TEXT NOT NULL
    );",
];

/// SQLite-backed coordinator store.
pub struct VortexStore {
    conn: Mutex<Connection>,
}

fn storage_err<E: std::fmt::Display>(e: E) -> VortexError {
    VortexError::Storage(e.to_string())
}

impl VortexStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(storage_err)?;
        }
        let conn = Connection::open(path).map_err(storage_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Apply any pending schema migrations.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        let version: usize = conn
            .query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))
            .map_err(storage_err)? as usize;

        for (i, migration) in MIGRATIONS.iter().enumerate().skip(version) {
            conn.execute_batch(migration).map_err(storage_err)?;
            conn.pragma_update(None, "user_version", i as i64 + 1)
                .map_err(storage_err)?;
            tracing::debug!("Applied schema migration {}", i + 1);
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| VortexError::Storage(format!("lock error: {}", e)))
    }

    // ========================================================================
    // Rounds
    // ========================================================================

    /// Insert or update a round row.
    pub fn save_round(&self, round: &StoredRound) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO rounds
             (round_id, status, round_time, fee_rate, mix_amount, mix_fee,
              input_fee, output_fee, unsigned_psbt, final_tx, profit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                round.round_id.to_hex(),
                round.status.as_str(),
                round.round_time as i64,
                round.fee_rate as i64,
                round.mix_amount as i64,
                round.mix_fee as i64,
                round.input_fee as i64,
                round.output_fee as i64,
                round.unsigned_psbt.as_ref().map(|p| hex::encode(p.serialize())),
                round
                    .final_tx
                    .as_ref()
                    .map(|tx| hex::encode(bitcoin::consensus::serialize(tx))),
                round.profit.map(|p| p as i64),
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Get a round by id.
    pub fn get_round(&self, round_id: &RoundId) -> Result<Option<StoredRound>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT round_id, status, round_time, fee_rate, mix_amount, mix_fee,
                    input_fee, output_fee, unsigned_psbt, final_tx, profit
             FROM rounds WHERE round_id = ?1",
            params![round_id.to_hex()],
            row_to_round,
        )
        .optional()
        .map_err(storage_err)
    }

    /// Rounds left in a non-terminal status (crash recovery at startup).
    pub fn unfinished_rounds(&self) -> Result<Vec<StoredRound>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT round_id, status, round_time, fee_rate, mix_amount, mix_fee,
                        input_fee, output_fee, unsigned_psbt, final_tx, profit
                 FROM rounds WHERE status NOT IN ('signed', 'failed')",
            )
            .map_err(storage_err)?;
        let rounds = stmt
            .query_map([], row_to_round)
            .map_err(storage_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_err)?;
        Ok(rounds)
    }

    // ========================================================================
    // Alices
    // ========================================================================

    /// Insert or update an Alice row.
    pub fn save_alice(&self, alice: &StoredAlice) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO alices
             (peer_id, round_id, purpose, coin, account, chain, nonce_index,
              nonce, blinded_output, change_spk, blind_sig, signed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                alice.peer_id.to_hex(),
                alice.round_id.to_hex(),
                alice.purpose,
                alice.coin,
                alice.account,
                alice.chain,
                alice.nonce_index,
                alice.nonce.to_string(),
                alice.blinded_output.map(hex::encode),
                alice.change_spk.as_ref().map(|spk| hex::encode(spk.as_bytes())),
                alice.blind_sig.map(hex::encode),
                alice.signed as i32,
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Get an Alice by peer id.
    pub fn get_alice(&self, peer_id: &PeerId) -> Result<Option<StoredAlice>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT peer_id, round_id, purpose, coin, account, chain, nonce_index,
                    nonce, blinded_output, change_spk, blind_sig, signed
             FROM alices WHERE peer_id = ?1",
            params![peer_id.to_hex()],
            row_to_alice,
        )
        .optional()
        .map_err(storage_err)
    }

    /// All Alices of a round.
    pub fn alices_for_round(&self, round_id: &RoundId) -> Result<Vec<StoredAlice>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT peer_id, round_id, purpose, coin, account, chain, nonce_index,
                        nonce, blinded_output, change_spk, blind_sig, signed
                 FROM alices WHERE round_id = ?1",
            )
            .map_err(storage_err)?;
        let alices = stmt
            .query_map(params![round_id.to_hex()], row_to_alice)
            .map_err(storage_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_err)?;
        Ok(alices)
    }

    /// Alices of a round that hold a blind signature.
    pub fn count_registered_alices(&self, round_id: &RoundId) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM alices WHERE round_id = ?1 AND blind_sig IS NOT NULL",
                params![round_id.to_hex()],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(count as usize)
    }

    /// Highest nonce index ever issued, to resume the counter at startup.
    pub fn max_nonce_index(&self) -> Result<Option<u32>> {
        let conn = self.lock()?;
        let max: Option<i64> = conn
            .query_row("SELECT MAX(nonce_index) FROM alices", [], |row| row.get(0))
            .map_err(storage_err)?;
        Ok(max.map(|v| v as u32))
    }

    // ========================================================================
    // Registered inputs
    // ========================================================================

    /// Persist a peer's inputs atomically, replacing anything the peer
    /// registered earlier in the round (a repeat registration overwrites).
    pub fn replace_peer_inputs(
        &self,
        round_id: &RoundId,
        peer_id: &PeerId,
        inputs: &[StoredInput],
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;
        tx.execute(
            "DELETE FROM registered_inputs WHERE round_id = ?1 AND peer_id = ?2",
            params![round_id.to_hex(), peer_id.to_hex()],
        )
        .map_err(storage_err)?;
        for input in inputs {
            tx.execute(
                "INSERT OR REPLACE INTO registered_inputs
                 (round_id, outpoint, peer_id, value, script_pubkey, input_proof,
                  index_in_final_tx)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    input.round_id.to_hex(),
                    input.outpoint.to_string(),
                    input.peer_id.to_hex(),
                    input.prev_output.value.to_sat() as i64,
                    hex::encode(input.prev_output.script_pubkey.as_bytes()),
                    hex::encode(&input.input_proof),
                    input.index_in_final_tx,
                ],
            )
            .map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)?;
        Ok(())
    }

    /// All registered inputs of a round.
    pub fn inputs_for_round(&self, round_id: &RoundId) -> Result<Vec<StoredInput>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT round_id, outpoint, peer_id, value, script_pubkey, input_proof,
                        index_in_final_tx
                 FROM registered_inputs WHERE round_id = ?1",
            )
            .map_err(storage_err)?;
        let inputs = stmt
            .query_map(params![round_id.to_hex()], row_to_input)
            .map_err(storage_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_err)?;
        Ok(inputs)
    }

    /// Registered inputs a peer contributed to a round.
    pub fn inputs_for_peer(&self, round_id: &RoundId, peer_id: &PeerId) -> Result<Vec<StoredInput>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT round_id, outpoint, peer_id, value, script_pubkey, input_proof,
                        index_in_final_tx
                 FROM registered_inputs WHERE round_id = ?1 AND peer_id = ?2",
            )
            .map_err(storage_err)?;
        let inputs = stmt
            .query_map(params![round_id.to_hex(), peer_id.to_hex()], row_to_input)
            .map_err(storage_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_err)?;
        Ok(inputs)
    }

    /// Record an input's index in the final transaction.
    pub fn set_input_index(
        &self,
        round_id: &RoundId,
        outpoint: &OutPoint,
        index: u32,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE registered_inputs SET index_in_final_tx = ?3
             WHERE round_id = ?1 AND outpoint = ?2",
            params![round_id.to_hex(), outpoint.to_string(), index],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    // ========================================================================
    // Registered outputs
    // ========================================================================

    /// Persist a registered output. Replaying the same output is a no-op,
    /// which makes Bob submissions idempotent.
    pub fn insert_output(&self, output: &StoredOutput) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO registered_outputs
             (round_id, value, script_pubkey, sig)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                output.round_id.to_hex(),
                output.output.value.to_sat() as i64,
                hex::encode(output.output.script_pubkey.as_bytes()),
                hex::encode(&output.sig),
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// All registered outputs of a round, ordered by scriptPubKey so the
    /// result carries no submission-order information.
    pub fn outputs_for_round(&self, round_id: &RoundId) -> Result<Vec<StoredOutput>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT round_id, value, script_pubkey, sig
                 FROM registered_outputs WHERE round_id = ?1 ORDER BY script_pubkey",
            )
            .map_err(storage_err)?;
        let outputs = stmt
            .query_map(params![round_id.to_hex()], row_to_output)
            .map_err(storage_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_err)?;
        Ok(outputs)
    }

    pub fn count_outputs(&self, round_id: &RoundId) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM registered_outputs WHERE round_id = ?1",
                params![round_id.to_hex()],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(count as usize)
    }

    // ========================================================================
    // Banned UTXOs
    // ========================================================================

    /// Ban a set of outpoints atomically.
    pub fn ban_outpoints(
        &self,
        outpoints: &[OutPoint],
        banned_until: DateTime<Utc>,
        reason: &str,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;
        for outpoint in outpoints {
            tx.execute(
                "INSERT OR REPLACE INTO banned_utxos (outpoint, banned_until, reason)
                 VALUES (?1, ?2, ?3)",
                params![outpoint.to_string(), banned_until.timestamp(), reason],
            )
            .map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)?;
        tracing::info!(
            "Banned {} outpoint(s) until {}: {}",
            outpoints.len(),
            banned_until,
            reason
        );
        Ok(())
    }

    /// The active ban on an outpoint, if any.
    pub fn active_ban(&self, outpoint: &OutPoint, now: DateTime<Utc>) -> Result<Option<BannedUtxo>> {
        let conn = self.lock()?;
        let ban = conn
            .query_row(
                "SELECT outpoint, banned_until, reason FROM banned_utxos WHERE outpoint = ?1",
                params![outpoint.to_string()],
                row_to_ban,
            )
            .optional()
            .map_err(storage_err)?;
        Ok(ban.filter(|b| b.banned_until > now))
    }
}

// ============================================================================
// Row mappers
// ============================================================================

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn parse_round_id(idx: usize, s: &str) -> std::result::Result<RoundId, rusqlite::Error> {
    RoundId::from_hex(s).ok_or_else(|| conversion_err(idx, format!("invalid round id '{}'", s)))
}

fn parse_peer_id(idx: usize, s: &str) -> std::result::Result<PeerId, rusqlite::Error> {
    let bytes = hex::decode(s).map_err(|e| conversion_err(idx, e.to_string()))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| conversion_err(idx, format!("invalid peer id '{}'", s)))?;
    Ok(PeerId::from_bytes(arr))
}

fn parse_scalar(idx: usize, s: &str) -> std::result::Result<[u8; 32], rusqlite::Error> {
    let bytes = hex::decode(s).map_err(|e| conversion_err(idx, e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| conversion_err(idx, "expected 32 bytes".to_string()))
}

fn row_to_round(row: &rusqlite::Row<'_>) -> std::result::Result<StoredRound, rusqlite::Error> {
    let round_id: String = row.get(0)?;
    let status: String = row.get(1)?;
    let unsigned_psbt: Option<String> = row.get(8)?;
    let final_tx: Option<String> = row.get(9)?;

    let unsigned_psbt = unsigned_psbt
        .map(|s| {
            let bytes = hex::decode(&s).map_err(|e| conversion_err(8, e.to_string()))?;
            Psbt::deserialize(&bytes).map_err(|e| conversion_err(8, e.to_string()))
        })
        .transpose()?;
    let final_tx = final_tx
        .map(|s| {
            let bytes = hex::decode(&s).map_err(|e| conversion_err(9, e.to_string()))?;
            bitcoin::consensus::deserialize::<Transaction>(&bytes)
                .map_err(|e| conversion_err(9, e.to_string()))
        })
        .transpose()?;

    Ok(StoredRound {
        round_id: parse_round_id(0, &round_id)?,
        status: status
            .parse::<RoundStatus>()
            .map_err(|e| conversion_err(1, e))?,
        round_time: row.get::<_, i64>(2)? as u64,
        fee_rate: row.get::<_, i64>(3)? as u64,
        mix_amount: row.get::<_, i64>(4)? as u64,
        mix_fee: row.get::<_, i64>(5)? as u64,
        input_fee: row.get::<_, i64>(6)? as u64,
        output_fee: row.get::<_, i64>(7)? as u64,
        unsigned_psbt,
        final_tx,
        profit: row.get::<_, Option<i64>>(10)?.map(|p| p as u64),
    })
}

fn row_to_alice(row: &rusqlite::Row<'_>) -> std::result::Result<StoredAlice, rusqlite::Error> {
    let peer_id: String = row.get(0)?;
    let round_id: String = row.get(1)?;
    let nonce: String = row.get(7)?;
    let blinded_output: Option<String> = row.get(8)?;
    let change_spk: Option<String> = row.get(9)?;
    let blind_sig: Option<String> = row.get(10)?;

    Ok(StoredAlice {
        peer_id: parse_peer_id(0, &peer_id)?,
        round_id: parse_round_id(1, &round_id)?,
        purpose: row.get(2)?,
        coin: row.get(3)?,
        account: row.get(4)?,
        chain: row.get(5)?,
        nonce_index: row.get(6)?,
        nonce: nonce
            .parse()
            .map_err(|e: bitcoin::secp256k1::Error| conversion_err(7, e.to_string()))?,
        blinded_output: blinded_output.map(|s| parse_scalar(8, &s)).transpose()?,
        change_spk: change_spk
            .map(|s| {
                hex::decode(&s)
                    .map(bitcoin::ScriptBuf::from_bytes)
                    .map_err(|e| conversion_err(9, e.to_string()))
            })
            .transpose()?,
        blind_sig: blind_sig.map(|s| parse_scalar(10, &s)).transpose()?,
        signed: row.get::<_, i32>(11)? != 0,
    })
}

fn row_to_input(row: &rusqlite::Row<'_>) -> std::result::Result<StoredInput, rusqlite::Error> {
    let round_id: String = row.get(0)?;
    let outpoint: String = row.get(1)?;
    let peer_id: String = row.get(2)?;
    let script_pubkey: String = row.get(4)?;
    let input_proof: String = row.get(5)?;

    Ok(StoredInput {
        round_id: parse_round_id(0, &round_id)?,
        outpoint: outpoint
            .parse()
            .map_err(|e: bitcoin::transaction::ParseOutPointError| conversion_err(1, e.to_string()))?,
        peer_id: parse_peer_id(2, &peer_id)?,
        prev_output: TxOut {
            value: bitcoin::Amount::from_sat(row.get::<_, i64>(3)? as u64),
            script_pubkey: bitcoin::ScriptBuf::from_bytes(
                hex::decode(&script_pubkey).map_err(|e| conversion_err(4, e.to_string()))?,
            ),
        },
        input_proof: hex::decode(&input_proof).map_err(|e| conversion_err(5, e.to_string()))?,
        index_in_final_tx: row.get(6)?,
    })
}

fn row_to_output(row: &rusqlite::Row<'_>) -> std::result::Result<StoredOutput, rusqlite::Error> {
    let round_id: String = row.get(0)?;
    let script_pubkey: String = row.get(2)?;
    let sig: String = row.get(3)?;

    Ok(StoredOutput {
        round_id: parse_round_id(0, &round_id)?,
        output: TxOut {
            value: bitcoin::Amount::from_sat(row.get::<_, i64>(1)? as u64),
            script_pubkey: bitcoin::ScriptBuf::from_bytes(
                hex::decode(&script_pubkey).map_err(|e| conversion_err(2, e.to_string()))?,
            ),
        },
        sig: hex::decode(&sig).map_err(|e| conversion_err(3, e.to_string()))?,
    })
}

fn row_to_ban(row: &rusqlite::Row<'_>) -> std::result::Result<BannedUtxo, rusqlite::Error> {
    let outpoint: String = row.get(0)?;
    let banned_until: i64 = row.get(1)?;

    Ok(BannedUtxo {
        outpoint: outpoint
            .parse()
            .map_err(|e: bitcoin::transaction::ParseOutPointError| conversion_err(0, e.to_string()))?,
        banned_until: Utc
            .timestamp_opt(banned_until, 0)
            .single()
            .ok_or_else(|| conversion_err(1, format!("invalid timestamp {}", banned_until)))?,
        reason: row.get(2)?,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, ScriptBuf, Txid, WPubkeyHash};
    use chrono::Duration;

    fn spk(byte: u8) -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([byte; 20]))
    }

    fn outpoint(byte: u8) -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array([byte; 32]),
            vout: 0,
        }
    }

    fn test_round(status: RoundStatus) -> StoredRound {
        StoredRound {
            round_id: RoundId::from_bytes([1u8; 32]),
            status,
            round_time: 1_700_000_000,
            fee_rate: 10,
            mix_amount: 100_000,
            mix_fee: 500,
            input_fee: 1_490,
            output_fee: 430,
            unsigned_psbt: None,
            final_tx: None,
            profit: None,
        }
    }

    fn test_alice(nonce_index: u32) -> StoredAlice {
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let key = bitcoin::secp256k1::SecretKey::from_slice(&[nonce_index as u8 + 1; 32]).unwrap();
        StoredAlice {
            peer_id: PeerId::from_bytes([nonce_index as u8 + 10; 32]),
            round_id: RoundId::from_bytes([1u8; 32]),
            purpose: 69,
            coin: 1,
            account: 0,
            chain: 0,
            nonce_index,
            nonce: key.public_key(&secp),
            blinded_output: None,
            change_spk: None,
            blind_sig: None,
            signed: false,
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let store = VortexStore::open_in_memory().unwrap();
        store.migrate().unwrap();
        store.migrate().unwrap();
    }

    #[test]
    fn test_round_crud() {
        let store = VortexStore::open_in_memory().unwrap();
        let mut round = test_round(RoundStatus::Pending);

        store.save_round(&round).unwrap();
        let loaded = store.get_round(&round.round_id).unwrap().unwrap();
        assert_eq!(loaded.status, RoundStatus::Pending);
        assert_eq!(loaded.mix_amount, 100_000);
        assert!(loaded.unsigned_psbt.is_none());

        round.status = RoundStatus::Failed;
        round.profit = Some(1_000);
        store.save_round(&round).unwrap();
        let loaded = store.get_round(&round.round_id).unwrap().unwrap();
        assert_eq!(loaded.status, RoundStatus::Failed);
        assert_eq!(loaded.profit, Some(1_000));
    }

    #[test]
    fn test_unfinished_rounds() {
        let store = VortexStore::open_in_memory().unwrap();
        let mut open = test_round(RoundStatus::RegisterAlices);
        open.round_id = RoundId::from_bytes([2u8; 32]);
        let done = test_round(RoundStatus::Signed);

        store.save_round(&open).unwrap();
        store.save_round(&done).unwrap();

        let unfinished = store.unfinished_rounds().unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].round_id, open.round_id);
    }

    #[test]
    fn test_alice_crud_and_counts() {
        let store = VortexStore::open_in_memory().unwrap();
        let round_id = RoundId::from_bytes([1u8; 32]);

        let mut alice = test_alice(0);
        store.save_alice(&alice).unwrap();
        assert_eq!(store.count_registered_alices(&round_id).unwrap(), 0);

        alice.blinded_output = Some([3u8; 32]);
        alice.blind_sig = Some([4u8; 32]);
        alice.change_spk = Some(spk(9));
        store.save_alice(&alice).unwrap();

        let loaded = store.get_alice(&alice.peer_id).unwrap().unwrap();
        assert_eq!(loaded.nonce, alice.nonce);
        assert_eq!(loaded.blind_sig, Some([4u8; 32]));
        assert_eq!(loaded.change_spk, Some(spk(9)));
        assert!(loaded.is_registered());

        store.save_alice(&test_alice(1)).unwrap();
        assert_eq!(store.count_registered_alices(&round_id).unwrap(), 1);
        assert_eq!(store.alices_for_round(&round_id).unwrap().len(), 2);
        assert_eq!(store.max_nonce_index().unwrap(), Some(1));
    }

    #[test]
    fn test_input_crud_and_index_assignment() {
        let store = VortexStore::open_in_memory().unwrap();
        let round_id = RoundId::from_bytes([1u8; 32]);
        let peer = PeerId::from_bytes([5u8; 32]);

        let inputs = vec![
            StoredInput {
                round_id,
                outpoint: outpoint(1),
                peer_id: peer,
                prev_output: TxOut {
                    value: Amount::from_sat(200_000),
                    script_pubkey: spk(1),
                },
                input_proof: vec![1, 2, 3],
                index_in_final_tx: None,
            },
            StoredInput {
                round_id,
                outpoint: outpoint(2),
                peer_id: peer,
                prev_output: TxOut {
                    value: Amount::from_sat(300_000),
                    script_pubkey: spk(2),
                },
                input_proof: vec![4, 5, 6],
                index_in_final_tx: None,
            },
        ];
        store.replace_peer_inputs(&round_id, &peer, &inputs).unwrap();

        assert_eq!(store.inputs_for_round(&round_id).unwrap().len(), 2);
        assert_eq!(store.inputs_for_peer(&round_id, &peer).unwrap().len(), 2);

        store.set_input_index(&round_id, &outpoint(1), 7).unwrap();
        let loaded = store.inputs_for_round(&round_id).unwrap();
        let first = loaded.iter().find(|i| i.outpoint == outpoint(1)).unwrap();
        assert_eq!(first.index_in_final_tx, Some(7));

        // A repeat registration replaces the peer's earlier inputs.
        let replacement = vec![StoredInput {
            round_id,
            outpoint: outpoint(3),
            peer_id: peer,
            prev_output: TxOut {
                value: Amount::from_sat(150_000),
                script_pubkey: spk(3),
            },
            input_proof: vec![7, 8, 9],
            index_in_final_tx: None,
        }];
        store
            .replace_peer_inputs(&round_id, &peer, &replacement)
            .unwrap();
        let loaded = store.inputs_for_peer(&round_id, &peer).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].outpoint, outpoint(3));
    }

    #[test]
    fn test_output_replay_is_idempotent() {
        let store = VortexStore::open_in_memory().unwrap();
        let round_id = RoundId::from_bytes([1u8; 32]);

        let output = StoredOutput {
            round_id,
            output: TxOut {
                value: Amount::from_sat(100_000),
                script_pubkey: spk(0xB),
            },
            sig: vec![9u8; 65],
        };
        store.insert_output(&output).unwrap();
        store.insert_output(&output).unwrap();
        assert_eq!(store.count_outputs(&round_id).unwrap(), 1);
    }

    #[test]
    fn test_ban_expiry() {
        let store = VortexStore::open_in_memory().unwrap();
        let now = Utc::now();
        let target = outpoint(7);

        store
            .ban_outpoints(&[target, outpoint(8)], now + Duration::hours(1), "bad inputs")
            .unwrap();

        let ban = store.active_ban(&target, now).unwrap().unwrap();
        assert_eq!(ban.reason, "bad inputs");

        // Expired bans are not reported.
        assert!(store
            .active_ban(&target, now + Duration::hours(2))
            .unwrap()
            .is_none());
        // Unknown outpoints are not banned.
        assert!(store.active_ban(&outpoint(9), now).unwrap().is_none());
    }

    #[test]
    fn test_no_table_links_outputs_to_peers() {
        // The registered_outputs schema must not reference peers or Alices.
        let store = VortexStore::open_in_memory().unwrap();
        let conn = store.conn.lock().unwrap();
        let schema: String = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE name = 'registered_outputs'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!schema.contains("peer"));
        assert!(!schema.contains("alice"));
    }
}
