//! Packet types exchanged between clients, peers, and the routing core.
//!
//! Every data item on the bus is addressed by the triple
//! (node address, variable id, revision). In request patterns a zero field
//! is a wildcard; on data packets all three fields are always populated.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Identifies a node on the bus. Zero means "any" in request patterns.
pub type NodeAddress = u32;

/// Identifies a typed data item in the schema. Zero means "any".
pub type VariableId = u32;

/// Monotonic version of a variable's value. Zero means "any" in requests;
/// any other value names one specific published value.
pub type Revision = u32;

/// Dense identifier of a client attached to the local node.
pub type ClientId = u16;

/// Absolute time in nanoseconds since the UNIX epoch.
pub type Timestamp = u64;

/// Wildcard host address in request patterns.
pub const ANY_HOST: NodeAddress = 0;

/// Wildcard variable id in request patterns.
pub const ANY_VARIABLE: VariableId = 0;

/// Wildcard revision in request patterns.
pub const ANY_REVISION: Revision = 0;

/// A published value, keyed by the full addressing triple.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DataPacket {
    pub node_address: NodeAddress,
    pub variable_id: VariableId,
    pub revision: Revision,
    pub payload: Vec<u8>,
}

/// A subscription (or cancellation) request from a client.
///
/// The sign of `quantity` gives the direction: positive subscribes,
/// negative unsubscribes. Zero fields act as wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RequestPacket {
    pub deadline: Timestamp,
    pub node_address: NodeAddress,
    pub variable_id: VariableId,
    pub revision: Revision,
    pub quantity: i32,
}

/// The core's answer to a [`RequestPacket`].
///
/// Rejections (quota or an invalid pattern) are carried here as
/// `accepted = false`; they never surface as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResponsePacket {
    pub accepted: bool,
    pub requests_remaining_local: u32,
    pub requests_remaining_remote: u32,
}

/// A new value offered by a producer, before a revision is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProductionPacket {
    pub variable_id: VariableId,
    pub response_id: u32,
    pub payload: Vec<u8>,
}

/// Acknowledges a [`ProductionPacket`] with the revision it was assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AcceptancePacket {
    pub response_id: u32,
    pub revision: Revision,
}
