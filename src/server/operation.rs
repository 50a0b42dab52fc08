use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;

use crate::error::PvaError;
use crate::ids::{Ioid, Sid};
use crate::protocol::command::Command;
use crate::request::RequestHandle;

/// The kinds of operation a client can run on a server channel
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OperationKind {
    Get,
    Put,
    PutGet,
    Monitor,
    Array,
    Process,
    Rpc,
    GetField,
}

impl OperationKind {
    pub fn for_command(command: Command) -> Option<OperationKind> {
        match command {
            Command::Get => Some(OperationKind::Get),
            Command::Put => Some(OperationKind::Put),
            Command::PutGet => Some(OperationKind::PutGet),
            Command::Monitor => Some(OperationKind::Monitor),
            Command::Array => Some(OperationKind::Array),
            Command::Process => Some(OperationKind::Process),
            Command::Rpc => Some(OperationKind::Rpc),
            Command::GetField => Some(OperationKind::GetField),
            _ => None,
        }
    }
}

/// An operation a client requested on a server channel. Cancellation is a flag the code
///  serving the operation checks before it sends further responses.
#[derive(Debug)]
pub struct ServerOperation {
    pub ioid: Ioid,
    pub sid: Sid,
    pub kind: OperationKind,
    cancelled: AtomicBool,
}

impl ServerOperation {
    pub fn new(ioid: Ioid, sid: Sid, kind: OperationKind) -> ServerOperation {
        ServerOperation {
            ioid,
            sid,
            kind,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl RequestHandle for ServerOperation {
    fn cancel(&self, reason: &PvaError) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            trace!(ioid = self.ioid, sid = self.sid, kind = ?self.kind, %reason, "operation cancelled");
        }
    }
}
