use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::context::{ContextHandle, ContextInner};
use crate::error::PvaError;
use crate::ids::{Cid, Ioid, Sid};
use crate::protocol::command::{subcommand, Command};
use crate::protocol::header::{encode_with, HeaderFlags};
use crate::protocol::messages::{GetFieldRequest, RequestIds, RequestMessage, Response};
use crate::request::pending::{PendingRequest, ResponseReceiver, ResponseSink};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChannelState {
    /// waiting for a server to answer a search request
    Searching,
    /// a server was found, the transport or the channel on the server is being set up
    Connecting,
    Connected,
    Destroyed,
}

struct Connection {
    transport: Arc<dyn Transport>,
    /// assigned by the server once it created the channel
    sid: Option<Sid>,
}

/// A named process variable on some server. Requests can be issued while the channel is
///  connected; when the connection is lost, pending requests fail and the channel goes back
///  to searching.
///
/// State transitions happen under the connection lock, so the state and the connection are
///  always consistent with each other.
pub struct Channel {
    cid: Cid,
    name: String,
    priority: u16,
    context: ContextHandle,
    state: watch::Sender<ChannelState>,
    connection: Mutex<Option<Connection>>,
}

impl Debug for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Channel{{{}:{:?}:{:?}}}", self.cid, self.name, self.state())
    }
}

impl Channel {
    pub(crate) fn new(cid: Cid, name: &str, priority: u16, context: ContextHandle) -> Channel {
        Channel {
            cid,
            name: name.to_string(),
            priority,
            context,
            state: watch::Sender::new(ChannelState::Searching),
            connection: Mutex::new(None),
        }
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> u16 {
        self.priority
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    pub fn sid(&self) -> Option<Sid> {
        self.connection.lock()
            .as_ref()
            .and_then(|c| c.sid)
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.connection.lock()
            .as_ref()
            .map(|c| c.transport.clone())
    }

    pub(crate) fn uses_transport(&self, transport: &Arc<dyn Transport>) -> bool {
        self.connection.lock()
            .as_ref()
            .is_some_and(|c| std::ptr::addr_eq(Arc::as_ptr(&c.transport), Arc::as_ptr(transport)))
    }

    fn transition(&self, from: &[ChannelState], to: ChannelState) -> bool {
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            }
            else {
                false
            }
        })
    }

    /// Searching -> Connecting. Exactly one of several concurrent callers succeeds.
    pub(crate) fn try_begin_connect(&self) -> bool {
        let _connection = self.connection.lock();
        self.transition(&[ChannelState::Searching], ChannelState::Connecting)
    }

    /// Connecting -> Searching if no transport was established
    pub(crate) fn abort_connect(&self) -> bool {
        let connection = self.connection.lock();
        connection.is_none() && self.transition(&[ChannelState::Connecting], ChannelState::Searching)
    }

    /// Returns false if the channel is not connecting any more, i.e. it was destroyed
    pub(crate) fn set_transport(&self, transport: Arc<dyn Transport>) -> bool {
        let mut connection = self.connection.lock();
        if self.state() != ChannelState::Connecting || connection.is_some() {
            return false;
        }
        *connection = Some(Connection { transport, sid: None });
        true
    }

    pub(crate) fn set_connected(&self, sid: Sid) -> bool {
        let mut connection = self.connection.lock();
        match connection.as_mut() {
            Some(c) if self.state() == ChannelState::Connecting => {
                c.sid = Some(sid);
                self.transition(&[ChannelState::Connecting], ChannelState::Connected)
            }
            _ => false,
        }
    }

    pub(crate) fn take_transport(&self) -> Option<Arc<dyn Transport>> {
        self.connection.lock()
            .take()
            .map(|c| c.transport)
    }

    /// takes the transport only if it is `transport`, so a stale notification does not
    ///  disconnect a channel that reconnected meanwhile
    pub(crate) fn take_transport_if(&self, transport: &Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        let mut connection = self.connection.lock();
        if connection.as_ref().is_some_and(|c| std::ptr::addr_eq(Arc::as_ptr(&c.transport), Arc::as_ptr(transport))) {
            connection.take().map(|c| c.transport)
        }
        else {
            None
        }
    }

    pub(crate) fn back_to_searching(&self) -> bool {
        let connection = self.connection.lock();
        connection.is_none() && self.transition(&[ChannelState::Connecting, ChannelState::Connected], ChannelState::Searching)
    }

    pub(crate) fn mark_destroyed(&self) -> Option<(Arc<dyn Transport>, Option<Sid>)> {
        let mut connection = self.connection.lock();
        self.state.send_replace(ChannelState::Destroyed);
        connection.take().map(|c| (c.transport, c.sid))
    }

    fn connection(&self) -> Result<(Arc<dyn Transport>, Sid), PvaError> {
        let connection = self.connection.lock();
        match (self.state(), connection.as_ref()) {
            (ChannelState::Destroyed, _) => Err(PvaError::ChannelDestroyed),
            (ChannelState::Connected, Some(Connection { transport, sid: Some(sid) })) => Ok((transport.clone(), *sid)),
            _ => Err(PvaError::NotConnected(self.name.clone())),
        }
    }

    /// Waits until the channel is connected. Fails if it is destroyed first.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), PvaError> {
        let mut receiver = self.state.subscribe();
        let wait = async {
            receiver.wait_for(|s| matches!(s, ChannelState::Connected | ChannelState::Destroyed))
                .await
                .map(|s| *s)
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(ChannelState::Connected)) => Ok(()),
            Ok(_) => Err(PvaError::ChannelDestroyed),
            Err(_) => Err(PvaError::Timeout(timeout)),
        }
    }

    /// Idempotent
    pub async fn destroy(&self) {
        match self.context.upgrade() {
            Some(context) => context.destroy_channel(self.cid).await,
            None => {
                self.mark_destroyed();
            }
        }
    }

    /// Runs a two-phase request: the request is initialized with `pv_request`, then `action`
    ///  is executed with `body` and the request destroyed. Returns the body of the final
    ///  response.
    pub async fn request(&self, command: Command, pv_request: Bytes, action: u8, body: Bytes) -> Result<Bytes, PvaError> {
        let mut operation = Operation::start(self, command)?;
        operation.init(pv_request).await?;

        operation.send_request(action | subcommand::DESTROY, body).await?;
        let response = operation.next_response().await?;
        Ok(response.body)
    }

    pub async fn get(&self, pv_request: Bytes) -> Result<Bytes, PvaError> {
        self.request(Command::Get, pv_request, subcommand::GET, Bytes::new()).await
    }

    pub async fn put(&self, pv_request: Bytes, value: Bytes) -> Result<(), PvaError> {
        self.request(Command::Put, pv_request, subcommand::DEFAULT, value).await?;
        Ok(())
    }

    pub async fn put_get(&self, pv_request: Bytes, value: Bytes) -> Result<Bytes, PvaError> {
        self.request(Command::PutGet, pv_request, subcommand::DEFAULT, value).await
    }

    pub async fn rpc(&self, pv_request: Bytes, argument: Bytes) -> Result<Bytes, PvaError> {
        self.request(Command::Rpc, pv_request, subcommand::DEFAULT, argument).await
    }

    /// Introspection data of the channel, or of one of its sub fields
    pub async fn get_field(&self, sub_field: &str) -> Result<Bytes, PvaError> {
        let mut operation = Operation::start(self, Command::GetField)?;
        let request = GetFieldRequest {
            sid: operation.sid,
            ioid: operation.ioid,
            sub_field: sub_field.to_string(),
        };
        operation.send(encode_with(Command::GetField, HeaderFlags::empty(), |buf| request.ser(buf))).await?;
        Ok(operation.next_response().await?.body)
    }

    /// Subscribes to updates. The subscription lasts until [Monitor::stop] is called or the
    ///  [Monitor] is dropped.
    pub async fn monitor(&self, pv_request: Bytes) -> Result<Monitor, PvaError> {
        let mut operation = Operation::start(self, Command::Monitor)?;
        let introspection = operation.init(pv_request).await?;
        operation.send_request(subcommand::MONITOR_START, Bytes::new()).await?;
        Ok(Monitor {
            operation,
            introspection,
        })
    }
}

/// A request registered with the context, from the client's point of view. If it is dropped
///  before the server finished it, it is unregistered and the server is told to destroy it.
struct Operation {
    context: Arc<ContextInner>,
    transport: Arc<dyn Transport>,
    command: Command,
    sid: Sid,
    ioid: Ioid,
    receiver: ResponseReceiver,
    timeout: Duration,
    finished: bool,
}

impl Operation {
    fn start(channel: &Channel, command: Command) -> Result<Operation, PvaError> {
        let context = channel.context.upgrade().ok_or(PvaError::ContextDestroyed)?;
        let (transport, sid) = channel.connection()?;

        let (sink, receiver) = ResponseSink::new();
        let request = PendingRequest::for_command(command, sink).ok_or(PvaError::NotARequest(command))?;
        let ioid = context.requests().register_new(Some(channel.cid), Arc::new(request))?;

        // the connection may have been lost before the request was registered
        if !channel.uses_transport(&transport) {
            context.requests().unregister(ioid);
            return Err(PvaError::NotConnected(channel.name.clone()));
        }

        trace!(cid = channel.cid, sid, ioid, ?command, "started request");
        Ok(Operation {
            timeout: context.config().request_timeout,
            context,
            transport,
            command,
            sid,
            ioid,
            receiver,
            finished: false,
        })
    }

    async fn send(&mut self, msg: Bytes) -> Result<(), PvaError> {
        if let Err(e) = self.transport.send(msg).await {
            debug!(ioid = self.ioid, transport = ?self.transport, "sending request failed: {}", e);
            self.finished = true;
            self.context.requests().unregister(self.ioid);
            return Err(PvaError::ConnectionLost(self.transport.remote_addr()));
        }
        Ok(())
    }

    async fn send_request(&mut self, action: u8, body: Bytes) -> Result<(), PvaError> {
        let request = RequestMessage {
            sid: self.sid,
            ioid: self.ioid,
            subcommand: action,
            body,
        };
        let msg = encode_with(self.command, HeaderFlags::empty(), |buf| request.ser(buf));
        self.send(msg).await
    }

    /// returns the body of the init response, i.e. the introspection data
    async fn init(&mut self, pv_request: Bytes) -> Result<Bytes, PvaError> {
        self.send_request(subcommand::INIT, pv_request).await?;
        let response = self.next_response().await?;
        if self.finished {
            return Err(PvaError::MalformedResponse(format!("request {} was destroyed by the server during init", self.ioid)));
        }
        Ok(response.body)
    }

    async fn next_response(&mut self) -> Result<Response, PvaError> {
        match tokio::time::timeout(self.timeout, self.receiver.recv()).await {
            Ok(received) => self.on_received(received),
            Err(_) => {
                debug!(ioid = self.ioid, command = ?self.command, timeout = ?self.timeout, "request timed out");
                self.abandon().await;
                Err(PvaError::Timeout(self.timeout))
            }
        }
    }

    fn on_received(&mut self, received: Option<Result<Response, PvaError>>) -> Result<Response, PvaError> {
        match received {
            Some(Ok(response)) => {
                if response.is_destroy() {
                    self.finished = true;
                }
                if !response.status.is_success() {
                    return Err(PvaError::Remote(response.status));
                }
                Ok(response)
            }
            Some(Err(e)) => {
                self.finished = true;
                Err(e)
            }
            None => {
                self.finished = true;
                Err(PvaError::Cancelled)
            }
        }
    }

    fn destroy_request(&self) -> Bytes {
        let ids = RequestIds {
            sid: self.sid,
            ioid: self.ioid,
        };
        encode_with(Command::DestroyRequest, HeaderFlags::empty(), |buf| ids.ser(buf))
    }

    /// unregisters the request and tells the server, unless it finished meanwhile
    async fn abandon(&mut self) {
        self.finished = true;
        if self.context.requests().unregister(self.ioid).is_some() {
            if let Err(e) = self.transport.send(self.destroy_request()).await {
                debug!(ioid = self.ioid, "could not send destroy request: {}", e);
            }
        }
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        if self.finished || self.context.requests().unregister(self.ioid).is_none() {
            return;
        }

        let msg = self.destroy_request();
        let transport = self.transport.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = transport.send(msg).await;
            });
        }
    }
}

/// A subscription to a channel's updates
pub struct Monitor {
    operation: Operation,
    introspection: Bytes,
}

impl Monitor {
    pub fn ioid(&self) -> Ioid {
        self.operation.ioid
    }

    /// type information sent by the server when the subscription was set up
    pub fn introspection(&self) -> &Bytes {
        &self.introspection
    }

    /// The next update. `Ok(None)` means the server ended the subscription.
    pub async fn next(&mut self) -> Result<Option<Bytes>, PvaError> {
        if self.operation.finished {
            return Ok(None);
        }
        let received = self.operation.receiver.recv().await;
        let response = self.operation.on_received(received)?;
        if response.is_destroy() {
            return Ok(None);
        }
        Ok(Some(response.body))
    }

    pub async fn stop(mut self) {
        self.operation.abandon().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_addr;
    use crate::test_util::transport::RecordingTransport;

    fn channel() -> Channel {
        Channel::new(1, "a:b", 0, ContextHandle::detached())
    }

    fn transport(n: u8) -> Arc<dyn Transport> {
        RecordingTransport::new(test_addr(n), 0)
    }

    #[test]
    fn test_connect_lifecycle() {
        let channel = channel();
        let transport = transport(1);
        assert_eq!(channel.state(), ChannelState::Searching);

        assert!(!channel.set_transport(transport.clone()));
        assert!(channel.try_begin_connect());
        assert!(!channel.try_begin_connect());
        assert_eq!(channel.state(), ChannelState::Connecting);

        assert!(channel.set_transport(transport.clone()));
        assert!(channel.uses_transport(&transport));
        assert!(!channel.abort_connect());
        assert_eq!(channel.sid(), None);

        assert!(channel.set_connected(17));
        assert!(!channel.set_connected(18));
        assert_eq!(channel.state(), ChannelState::Connected);
        assert_eq!(channel.sid(), Some(17));
    }

    #[test]
    fn test_abort_connect() {
        let channel = channel();
        assert!(channel.try_begin_connect());
        assert!(channel.abort_connect());
        assert_eq!(channel.state(), ChannelState::Searching);
        assert!(channel.try_begin_connect());
    }

    #[test]
    fn test_stale_transport_is_ignored() {
        let channel = channel();
        let old = transport(1);
        let new = transport(1);

        channel.try_begin_connect();
        channel.set_transport(new.clone());
        channel.set_connected(1);

        assert!(channel.take_transport_if(&old).is_none());
        assert!(!channel.back_to_searching());
        assert_eq!(channel.state(), ChannelState::Connected);

        assert!(channel.take_transport_if(&new).is_some());
        assert!(channel.back_to_searching());
        assert_eq!(channel.state(), ChannelState::Searching);
        assert_eq!(channel.sid(), None);
    }

    #[test]
    fn test_destroyed_is_final() {
        let channel = channel();
        let transport = transport(1);
        channel.try_begin_connect();
        channel.set_transport(transport.clone());

        let (taken, sid) = channel.mark_destroyed().unwrap();
        assert!(std::ptr::addr_eq(Arc::as_ptr(&taken), Arc::as_ptr(&transport)));
        assert_eq!(sid, None);

        assert!(!channel.try_begin_connect());
        assert!(!channel.set_transport(transport.clone()));
        assert!(!channel.back_to_searching());
        assert_eq!(channel.state(), ChannelState::Destroyed);
        assert!(matches!(channel.connection(), Err(PvaError::ChannelDestroyed)));
    }

    #[test]
    fn test_requests_need_connection() {
        let channel = channel();
        assert_eq!(channel.connection().err(), Some(PvaError::NotConnected("a:b".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_connected() {
        let channel = Arc::new(channel());
        assert_eq!(channel.wait_connected(Duration::from_secs(1)).await, Err(PvaError::Timeout(Duration::from_secs(1))));

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.wait_connected(Duration::from_secs(10)).await })
        };
        tokio::task::yield_now().await;
        channel.try_begin_connect();
        channel.set_transport(transport(1));
        channel.set_connected(3);
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_wait_connected_fails_when_destroyed() {
        let channel = channel();
        channel.destroy().await;
        assert_eq!(channel.wait_connected(Duration::from_secs(1)).await, Err(PvaError::ChannelDestroyed));
    }
}
