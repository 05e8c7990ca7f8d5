//! Request bank and dispatch core for a multi-node telemetry bus.
//!
//! Clients attached to a local server node subscribe to data items
//! identified by (node address, variable id, revision), with zero fields
//! acting as wildcards. Producers publish packets keyed by the same
//! triple. This crate holds the indexed subscription tables and the
//! unified expiration heap that answer the three hot-path queries: is
//! this re-subscription a duplicate, which clients does this packet fan
//! out to, and which subscription expires next.
//!
//! Wire transports, schema storage, revision persistence, and the time
//! source are collaborators behind traits; see [`server`].

pub mod bank;
pub mod clock;
pub mod error;
pub mod heap;
pub mod index;
pub mod ledger;
pub mod protocol;
pub mod server;

pub use clock::{Clock, ManualClock, QuantaClock, SystemClock};
pub use error::{Error, Result};
pub use ledger::QuotaLedger;
pub use protocol::{
    AcceptancePacket, ClientId, DataPacket, NodeAddress, ProductionPacket, RequestPacket,
    ResponsePacket, Revision, Timestamp, VariableId,
};
pub use server::{RevisionSet, Schema, Server, ServerConfig, Transport};
