use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::PvaError;
use crate::ids::{Cid, Ioid, Sid};
use crate::request::registry::RequestRegistry;
use crate::request::RequestHandle;
use crate::server::operation::{OperationKind, ServerOperation};

/// guarded together so that registration and teardown are atomic with respect to each other
#[derive(Default)]
struct Lifecycle {
    destroyed: bool,
    get_field: Option<Arc<ServerOperation>>,
}

/// A channel as the server sees it. Its operations live in the connection's operation registry,
///  scoped by this channel's SID.
///
/// At most one get-field (introspection) request is in flight per channel. A second one is
///  rejected while the first is active.
pub struct ServerChannel {
    cid: Cid,
    sid: Sid,
    name: String,
    operations: Arc<RequestRegistry<ServerOperation>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Debug for ServerChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ServerChannel{{{}/{}:{:?}}}", self.cid, self.sid, self.name)
    }
}

impl ServerChannel {
    pub fn new(cid: Cid, sid: Sid, name: &str, operations: Arc<RequestRegistry<ServerOperation>>) -> ServerChannel {
        ServerChannel {
            cid,
            sid,
            name: name.to_string(),
            operations,
            lifecycle: Default::default(),
        }
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn sid(&self) -> Sid {
        self.sid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_destroyed(&self) -> bool {
        self.lifecycle.lock().destroyed
    }

    /// the ioid is chosen by the client, so it may collide with a live one
    pub fn register_operation(&self, ioid: Ioid, kind: OperationKind) -> Result<Arc<ServerOperation>, PvaError> {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.destroyed {
            return Err(PvaError::ChannelDestroyed);
        }
        let operation = Arc::new(ServerOperation::new(ioid, self.sid, kind));
        self.operations.register_for_channel(self.sid, ioid, operation.clone())?;
        drop(lifecycle);
        Ok(operation)
    }

    /// Unregisters and cancels an operation of this channel. Operations of other channels are
    ///  left alone.
    pub fn destroy_operation(&self, ioid: Ioid) -> Option<Arc<ServerOperation>> {
        let operation = self.operations.unregister_if(ioid, |op| op.sid == self.sid)?;
        operation.cancel(&PvaError::Cancelled);
        Some(operation)
    }

    pub fn num_operations(&self) -> usize {
        self.operations.channel_requests(self.sid).len()
    }

    pub fn install_get_field(&self, requester: Arc<ServerOperation>) -> Result<(), PvaError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.destroyed {
            return Err(PvaError::ChannelDestroyed);
        }
        if let Some(active) = lifecycle.get_field.as_ref() {
            if !active.is_cancelled() {
                debug!(sid = self.sid, active = active.ioid, rejected = requester.ioid, "get-field already in progress");
                return Err(PvaError::GetFieldInProgress(self.sid));
            }
        }
        lifecycle.get_field = Some(requester);
        Ok(())
    }

    /// Clears the get-field slot if `requester` is the one installed. A stale completion (from
    ///  a request that was rejected or replaced) leaves the slot alone and returns false.
    pub fn complete_get_field(&self, requester: &Arc<ServerOperation>) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.get_field.as_ref() {
            Some(active) if Arc::ptr_eq(active, requester) => {
                lifecycle.get_field = None;
                true
            }
            _ => false,
        }
    }

    pub fn get_field_in_progress(&self) -> Option<Ioid> {
        self.lifecycle.lock()
            .get_field
            .as_ref()
            .map(|op| op.ioid)
    }

    /// Idempotent. Cancels all operations of the channel, returning how many were cancelled.
    pub fn destroy(&self) -> usize {
        let get_field = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.destroyed {
                return 0;
            }
            lifecycle.destroyed = true;
            lifecycle.get_field.take()
        };

        // no registration can happen after the flag is set, so this catches all of them
        let num_cancelled = self.operations.destroy_channel(self.sid, &PvaError::ChannelDestroyed);
        if let Some(get_field) = get_field {
            get_field.cancel(&PvaError::ChannelDestroyed);
        }
        debug!(cid = self.cid, sid = self.sid, name = self.name, num_cancelled, "destroyed server channel");
        num_cancelled
    }
}
