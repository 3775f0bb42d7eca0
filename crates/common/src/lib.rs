//! Shared types for the Vortex CoinJoin coordinator.
//!
//! Contains the error taxonomy, configuration, domain identifiers, and the
//! wire protocol message structs exchanged with peers.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;

pub use config::CoordinatorConfig;
pub use error::{Result, VortexError};
pub use types::{PeerId, RoundId, RoundStatus, ScriptType};
