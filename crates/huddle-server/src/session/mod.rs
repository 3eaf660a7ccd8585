//! Signaling session state: who is connected, which rooms exist and which
//! engine resources each connection owns.

pub mod coordinator;
pub mod ledger;
pub mod registry;
pub mod rooms;

pub use coordinator::{ConnectionState, SessionCoordinator, SessionSettings};
pub use ledger::{LedgerCounts, ResourceLedger};
pub use registry::{Connection, ConnectionRegistry};
pub use rooms::RoomDirectory;
