use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::error::PvaError;
use crate::ids::{Cid, IdAllocator, Ioid, Sid};
use crate::protocol::messages::{CreateChannelRequest, CreateChannelResponse};
use crate::protocol::status::Status;
use crate::request::registry::RequestRegistry;
use crate::request::RequestHandle;
use crate::server::channel::ServerChannel;
use crate::server::operation::ServerOperation;
use crate::transport::Transport;

/// Server side state of one client connection: the channels the client created and the
///  operations running on them. SIDs are unique per connection, IOIDs are chosen by the client.
pub struct ServerConnection {
    transport: Arc<dyn Transport>,
    channels: RwLock<FxHashMap<Sid, Arc<ServerChannel>>>,
    sids: IdAllocator,
    operations: Arc<RequestRegistry<ServerOperation>>,
    destroyed: AtomicBool,
}

impl ServerConnection {
    pub fn new(transport: Arc<dyn Transport>) -> ServerConnection {
        ServerConnection {
            transport,
            channels: Default::default(),
            sids: IdAllocator::default(),
            operations: Arc::new(RequestRegistry::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn create_channel(&self, cid: Cid, name: &str) -> Result<Arc<ServerChannel>, PvaError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(PvaError::ConnectionLost(self.transport.remote_addr()));
        }

        let mut channels = self.channels.write();
        if channels.values().any(|c| c.cid() == cid) {
            return Err(PvaError::DuplicateId(cid));
        }
        let sid = self.sids.allocate(|sid| channels.contains_key(&sid))?;
        let channel = Arc::new(ServerChannel::new(cid, sid, name, self.operations.clone()));
        channels.insert(sid, channel.clone());

        debug!(peer = %self.transport.remote_addr(), cid, sid, name, "created server channel");
        Ok(channel)
    }

    /// Handles a client's request to create a channel, turning the outcome into the response
    ///  to send back
    pub fn on_create_channel(&self, request: &CreateChannelRequest) -> CreateChannelResponse {
        match self.create_channel(request.cid, &request.name) {
            Ok(channel) => CreateChannelResponse {
                cid: request.cid,
                sid: channel.sid(),
                status: Status::ok(),
            },
            Err(e) => CreateChannelResponse {
                cid: request.cid,
                sid: 0,
                status: Status::error(e.to_string()),
            },
        }
    }

    pub fn channel(&self, sid: Sid) -> Option<Arc<ServerChannel>> {
        self.channels.read()
            .get(&sid)
            .cloned()
    }

    pub fn destroy_channel(&self, sid: Sid) -> Option<Arc<ServerChannel>> {
        let channel = self.channels.write().remove(&sid)?;
        channel.destroy();
        Some(channel)
    }

    pub fn operation(&self, ioid: Ioid) -> Option<Arc<ServerOperation>> {
        self.operations.lookup(ioid)
    }

    /// A destroy-request from the client: the operation is forgotten, whichever channel it
    ///  belongs to
    pub fn destroy_operation(&self, ioid: Ioid) -> Option<Arc<ServerOperation>> {
        let operation = self.operations.unregister(ioid)?;
        operation.cancel(&PvaError::Cancelled);
        Some(operation)
    }

    /// A cancel-request from the client stops the operation's activity, but it stays
    ///  registered until destroyed
    pub fn cancel_operation(&self, ioid: Ioid) -> bool {
        match self.operations.lookup(ioid) {
            Some(operation) => {
                operation.cancel(&PvaError::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.read().len()
    }

    pub fn num_operations(&self) -> usize {
        self.operations.len()
    }

    /// Idempotent. Destroys all channels and cancels all operations, e.g. when the connection
    ///  was closed.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let channels = self.channels.write()
            .drain()
            .map(|(_, c)| c)
            .collect::<Vec<_>>();
        for channel in &channels {
            channel.destroy();
        }
        let num_orphans = self.operations.cancel_all(&PvaError::ConnectionLost(self.transport.remote_addr()));
        info!(peer = %self.transport.remote_addr(), num_channels = channels.len(), num_orphans, "destroyed server connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::operation::OperationKind;
    use crate::test_util::test_addr;
    use crate::test_util::transport::RecordingTransport;

    fn connection() -> ServerConnection {
        ServerConnection::new(RecordingTransport::new(test_addr(1), 0))
    }

    #[test]
    fn test_create_channel() {
        let connection = connection();
        let a = connection.create_channel(1, "a").unwrap();
        let b = connection.create_channel(2, "b").unwrap();
        assert_ne!(a.sid(), b.sid());

        assert_eq!(connection.create_channel(1, "again").unwrap_err(), PvaError::DuplicateId(1));
        assert_eq!(connection.num_channels(), 2);
        assert!(Arc::ptr_eq(&connection.channel(a.sid()).unwrap(), &a));
    }

    #[test]
    fn test_on_create_channel() {
        let connection = connection();
        let request = CreateChannelRequest { cid: 3, name: "x".to_string() };

        let response = connection.on_create_channel(&request);
        assert!(response.status.is_success());
        assert_eq!(response.cid, 3);
        assert!(connection.channel(response.sid).is_some());

        let response = connection.on_create_channel(&request);
        assert!(!response.status.is_success());
    }

    #[test]
    fn test_destroy_channel_cancels_its_operations() {
        let connection = connection();
        let a = connection.create_channel(1, "a").unwrap();
        let b = connection.create_channel(2, "b").unwrap();
        let op_a = a.register_operation(10, OperationKind::Get).unwrap();
        let op_b = b.register_operation(11, OperationKind::Monitor).unwrap();

        assert!(connection.destroy_channel(a.sid()).is_some());
        assert!(connection.destroy_channel(a.sid()).is_none());

        assert!(op_a.is_cancelled());
        assert!(!op_b.is_cancelled());
        assert!(connection.operation(10).is_none());
        assert!(Arc::ptr_eq(&connection.operation(11).unwrap(), &op_b));
    }

    #[test]
    fn test_cancel_and_destroy_operation() {
        let connection = connection();
        let channel = connection.create_channel(1, "a").unwrap();
        let op = channel.register_operation(10, OperationKind::Monitor).unwrap();

        assert!(connection.cancel_operation(10));
        assert!(op.is_cancelled());
        assert_eq!(connection.num_operations(), 1);

        assert!(connection.destroy_operation(10).is_some());
        assert_eq!(connection.num_operations(), 0);
        assert!(!connection.cancel_operation(10));
        assert!(connection.destroy_operation(10).is_none());

        // the id is free again
        channel.register_operation(10, OperationKind::Get).unwrap();
    }

    #[test]
    fn test_destroy() {
        let connection = connection();
        let channel = connection.create_channel(1, "a").unwrap();
        let op = channel.register_operation(10, OperationKind::Rpc).unwrap();

        connection.destroy();
        connection.destroy();

        assert!(channel.is_destroyed());
        assert!(op.is_cancelled());
        assert_eq!(connection.num_channels(), 0);
        assert_eq!(connection.num_operations(), 0);
        assert_eq!(connection.create_channel(2, "b").unwrap_err(), PvaError::ConnectionLost(test_addr(1)));
    }
}
