//! Coordinator configuration.
//!
//! Loaded from a TOML file; every field has a default so a fresh deployment
//! can start from an empty file. Durations are stored as integer seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VortexError};
use crate::types::ScriptType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Coordinator name. Determines the database subdirectory and the Tor
    /// hidden-service key filename.
    #[serde(default = "default_name")]
    pub name: String,

    /// Bitcoin network the coordinator mixes on.
    #[serde(default = "default_network")]
    pub network: bitcoin::Network,

    /// TCP listen address for peer connections.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Base data directory; the store lives at `<data_dir>/<name>/vortex.db`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Bitcoin Core JSON-RPC endpoint.
    #[serde(default = "default_rpc_url")]
    pub bitcoind_rpc_url: String,

    #[serde(default = "default_rpc_user")]
    pub bitcoind_rpc_user: String,

    #[serde(default = "default_rpc_password")]
    pub bitcoind_rpc_password: String,

    /// Fallback fee provider (mempool.space compatible API base URL).
    #[serde(default = "default_fee_url")]
    pub fallback_fee_url: String,

    /// Script type enforced for registered inputs.
    #[serde(default = "default_script_type")]
    pub input_script_type: ScriptType,

    /// Script type enforced for change outputs.
    #[serde(default = "default_script_type")]
    pub change_script_type: ScriptType,

    /// Script type enforced for mixed outputs.
    #[serde(default = "default_script_type")]
    pub output_script_type: ScriptType,

    /// Minimum peers re-mixing a previous round output.
    #[serde(default = "default_min_remix_peers")]
    pub min_remix_peers: usize,

    /// Minimum peers contributing fresh inputs.
    #[serde(default = "default_min_new_peers")]
    pub min_new_peers: usize,

    /// Hard cap on registered Alices; reaching it advances the round early.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Uniform value of every mixed output, in satoshis.
    #[serde(default = "default_round_amount")]
    pub round_amount: u64,

    /// Per-peer coordinator fee, in satoshis.
    #[serde(default = "default_coordinator_fee")]
    pub coordinator_fee: u64,

    /// Time between consecutive rounds, in seconds.
    #[serde(default = "default_round_interval")]
    pub round_interval_secs: u64,

    /// Input registration phase timeout, in seconds.
    #[serde(default = "default_input_registration")]
    pub input_registration_secs: u64,

    /// Output registration phase timeout, in seconds.
    #[serde(default = "default_output_registration")]
    pub output_registration_secs: u64,

    /// Signing phase timeout, in seconds.
    #[serde(default = "default_signing")]
    pub signing_secs: u64,

    /// Ban duration for invalid input registrations, in seconds.
    #[serde(default = "default_bad_inputs_ban")]
    pub bad_inputs_ban_secs: u64,

    /// Ban duration for invalid final signatures, in seconds.
    #[serde(default = "default_invalid_signature_ban")]
    pub invalid_signature_ban_secs: u64,
}

fn default_name() -> String {
    "vortex".to_string()
}

fn default_network() -> bitcoin::Network {
    bitcoin::Network::Regtest
}

fn default_listen() -> String {
    "127.0.0.1:12523".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".vortex")
}

fn default_rpc_url() -> String {
    "http://localhost:18443".to_string()
}

fn default_rpc_user() -> String {
    "bitcoin".to_string()
}

fn default_rpc_password() -> String {
    "bitcoin".to_string()
}

fn default_fee_url() -> String {
    "https://mempool.space/api".to_string()
}

fn default_script_type() -> ScriptType {
    ScriptType::WitnessV0Keyhash
}

fn default_min_remix_peers() -> usize {
    1
}

fn default_min_new_peers() -> usize {
    1
}

fn default_max_peers() -> usize {
    10
}

fn default_round_amount() -> u64 {
    100_000
}

fn default_coordinator_fee() -> u64 {
    500
}

fn default_round_interval() -> u64 {
    1800
}

fn default_input_registration() -> u64 {
    300
}

fn default_output_registration() -> u64 {
    60
}

fn default_signing() -> u64 {
    60
}

fn default_bad_inputs_ban() -> u64 {
    3600
}

fn default_invalid_signature_ban() -> u64 {
    86400
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        toml::from_str("").expect("all config fields have defaults")
    }
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file, creating a default file if it
    /// does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| VortexError::Config(format!("failed to read {:?}: {}", path, e)))?;
            toml::from_str(&contents)
                .map_err(|e| VortexError::Config(format!("failed to parse {:?}: {}", path, e)))
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VortexError::Config(format!("failed to create {:?}: {}", parent, e)))?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| VortexError::Config(e.to_string()))?;
        std::fs::write(path, contents)
            .map_err(|e| VortexError::Config(format!("failed to write {:?}: {}", path, e)))
    }

    /// Minimum Alices required for a round to proceed.
    pub fn min_peers(&self) -> usize {
        self.min_remix_peers + self.min_new_peers
    }

    /// Database path: `<data_dir>/<name>/vortex.db`.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.name).join("vortex.db")
    }

    /// Tor hidden-service key path:
    /// `<data_dir>/torKeys/<name>_<network>_tor_priv_key`.
    pub fn tor_key_path(&self) -> PathBuf {
        self.data_dir
            .join("torKeys")
            .join(format!("{}_{}_tor_priv_key", self.name, self.network))
    }

    pub fn round_interval(&self) -> Duration {
        Duration::from_secs(self.round_interval_secs)
    }

    pub fn input_registration_time(&self) -> Duration {
        Duration::from_secs(self.input_registration_secs)
    }

    pub fn output_registration_time(&self) -> Duration {
        Duration::from_secs(self.output_registration_secs)
    }

    pub fn signing_time(&self) -> Duration {
        Duration::from_secs(self.signing_secs)
    }

    pub fn bad_inputs_ban(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.bad_inputs_ban_secs as i64)
    }

    pub fn invalid_signature_ban(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.invalid_signature_ban_secs as i64)
    }
}
