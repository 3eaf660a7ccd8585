//! Huddle signaling protocol
//!
//! Wire types shared by the signaling server and its clients.

pub mod messages;
pub mod types;

pub use messages::{ClientEnvelope, ClientRequest, Reply, ServerMessage};
pub use types::*;
