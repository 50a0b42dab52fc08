use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::dispatch::dispatcher::ResponseDispatcher;

pub mod registry;
pub mod tcp;
pub mod udp;

/// Identity of a physical connection in the registry. Priority only affects queuing on the
///  server side, but channels with different priorities never share a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportKey {
    pub addr: SocketAddr,
    pub priority: u16,
}

impl TransportKey {
    pub fn new(addr: SocketAddr, priority: u16) -> TransportKey {
        TransportKey { addr, priority }
    }
}

/// One physical connection shared by all channels to the same destination and priority
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn remote_addr(&self) -> SocketAddr;
    fn priority(&self) -> u16;
    /// protocol revision negotiated with the peer
    fn minor_revision(&self) -> u8;

    fn key(&self) -> TransportKey {
        TransportKey::new(self.remote_addr(), self.priority())
    }

    /// enqueues a complete, framed message
    async fn send(&self, msg: Bytes) -> anyhow::Result<()>;

    /// Idempotent. The transport's listener is notified on the first call only.
    fn close(&self);
    fn is_closed(&self) -> bool;

    /// The peer was detected to have restarted: state negotiated with its previous
    ///  incarnation can not be relied on.
    fn changed_transport(&self);

    /// returns the number of attached clients after attaching
    fn attach_client(&self) -> usize;
    /// returns the number of attached clients after detaching
    fn detach_client(&self) -> usize;
}

impl Debug for dyn Transport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transport{{{}@{}}}", self.remote_addr(), self.priority())
    }
}

/// Notified exactly once per transport, when it is closed for whatever reason
pub trait TransportListener: Send + Sync + 'static {
    fn transport_closed(&self, transport: Arc<dyn Transport>);
}

/// What a newly established transport is wired to
#[derive(Clone)]
pub struct TransportHooks {
    pub dispatcher: Arc<ResponseDispatcher>,
    pub listener: Weak<dyn TransportListener>,
}

/// Establishes a transport including the protocol level handshake
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, addr: SocketAddr, priority: u16, hooks: TransportHooks) -> anyhow::Result<Arc<dyn Transport>>;
}
