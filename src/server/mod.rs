//! Server side bookkeeping of a connection: channels created by the client and the operations
//!  running on them.

pub mod channel;
pub mod connection;
pub mod operation;
