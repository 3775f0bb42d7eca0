//! The Vortex round coordinator.
//!
//! A single-writer task owns the current round's state and consumes a
//! command channel; per-peer connection tasks translate framed wire
//! messages into commands and push coordinator-initiated messages back out.

pub mod aggregate;
pub mod coordinator;
pub mod net;
pub mod round;
pub mod wire;

pub use coordinator::{Command, CoordinatorHandle, RoundSnapshot};
pub use net::spawn_listener;
pub use round::Coordinator;
pub use wire::Frame;
