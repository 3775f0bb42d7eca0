//! Bitcoin-facing pieces of the Vortex coordinator: node RPC, fee
//! estimation, round transaction assembly, and PSBT validation.

pub mod builder;
pub mod fees;
pub mod psbt;
pub mod rpc;

pub use builder::{build_round_transaction, BuiltRound, RoundInput, DUST_LIMIT};
pub use fees::FeeOracle;
pub use rpc::{BitcoinRpcClient, ChainRpc, RpcConfig};

/// Virtual bytes charged per registered input when computing `input_fee`.
pub const INPUT_VBYTES: u64 = 149;

/// Virtual bytes charged per registered output when computing `output_fee`.
pub const OUTPUT_VBYTES: u64 = 43;
