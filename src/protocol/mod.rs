//! Framing and message codecs of the wire protocol. Payloads of the structured value system
//!  are carried as opaque bytes.

pub mod command;
pub mod guid;
pub mod header;
pub mod messages;
pub mod status;

/// minor protocol revision we speak - the effective revision of a connection is the minimum
///  of both peers' revisions
pub const PVA_PROTOCOL_REVISION: u8 = 2;
