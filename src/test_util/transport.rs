use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::dispatch::dispatcher::ResponseDispatcher;
use crate::protocol::command::Command;
use crate::protocol::header::MessageHeader;
use crate::protocol::PVA_PROTOCOL_REVISION;
use crate::transport::{Connector, Transport, TransportHooks, TransportListener};

/// A transport that records what is sent through it instead of talking to a network
pub struct RecordingTransport {
    addr: SocketAddr,
    priority: u16,
    myself: Weak<RecordingTransport>,
    sent: Mutex<Vec<Bytes>>,
    clients: AtomicUsize,
    closed: AtomicBool,
    num_changed: AtomicUsize,
    fail_sends: AtomicBool,
    listener: Option<Weak<dyn TransportListener>>,
}

impl RecordingTransport {
    pub fn new(addr: SocketAddr, priority: u16) -> Arc<RecordingTransport> {
        Self::create(addr, priority, None)
    }

    pub fn with_listener(addr: SocketAddr, priority: u16, listener: Weak<dyn TransportListener>) -> Arc<RecordingTransport> {
        Self::create(addr, priority, Some(listener))
    }

    fn create(addr: SocketAddr, priority: u16, listener: Option<Weak<dyn TransportListener>>) -> Arc<RecordingTransport> {
        Arc::new_cyclic(|myself| RecordingTransport {
            addr,
            priority,
            myself: myself.clone(),
            sent: Default::default(),
            clients: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            num_changed: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
            listener,
        })
    }

    pub fn sent_messages(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// the messages sent so far, decoded into header and payload
    pub fn take_sent(&self) -> Vec<(MessageHeader, Bytes)> {
        std::mem::take(&mut *self.sent.lock())
            .into_iter()
            .map(|mut msg| {
                let header = MessageHeader::try_deser(&mut msg)
                    .expect("sent messages are framed");
                (header, msg)
            })
            .collect()
    }

    /// payloads of sent messages with the given command, consuming all recorded messages
    pub fn take_sent_with(&self, command: Command) -> Vec<Bytes> {
        self.take_sent()
            .into_iter()
            .filter(|(header, _)| header.command == u8::from(command))
            .map(|(_, payload)| payload)
            .collect()
    }

    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    pub fn num_changed(&self) -> usize {
        self.num_changed.load(Ordering::SeqCst)
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    fn priority(&self) -> u16 {
        self.priority
    }

    fn minor_revision(&self) -> u8 {
        PVA_PROTOCOL_REVISION
    }

    async fn send(&self, msg: Bytes) -> anyhow::Result<()> {
        if self.is_closed() || self.fail_sends.load(Ordering::SeqCst) {
            bail!("transport to {} is closed", self.addr);
        }
        self.sent.lock().push(msg);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let listener = self.listener.as_ref().and_then(|l| l.upgrade());
        if let (Some(listener), Some(myself)) = (listener, self.myself.upgrade()) {
            listener.transport_closed(myself);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn changed_transport(&self) {
        self.num_changed.fetch_add(1, Ordering::SeqCst);
    }

    fn attach_client(&self) -> usize {
        self.clients.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn detach_client(&self) -> usize {
        let previous = self.clients.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }
}

/// Creates [RecordingTransport]s, counting connection attempts, optionally slow or failing
#[derive(Default)]
pub struct CountingConnector {
    delay: Duration,
    failing: AtomicBool,
    num_connects: AtomicUsize,
    transports: Mutex<Vec<Arc<RecordingTransport>>>,
}

impl CountingConnector {
    pub fn new() -> CountingConnector {
        Default::default()
    }

    pub fn with_delay(delay: Duration) -> CountingConnector {
        CountingConnector {
            delay,
            ..Default::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.num_connects.load(Ordering::SeqCst)
    }

    /// all transports created so far, in order of creation
    pub fn transports(&self) -> Vec<Arc<RecordingTransport>> {
        self.transports.lock().clone()
    }

    pub fn last_transport(&self) -> Option<Arc<RecordingTransport>> {
        self.transports.lock().last().cloned()
    }
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(&self, addr: SocketAddr, priority: u16, hooks: TransportHooks) -> anyhow::Result<Arc<dyn Transport>> {
        self.num_connects.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            bail!("connection refused by {}", addr);
        }

        let transport = RecordingTransport::with_listener(addr, priority, hooks.listener);
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

struct NoListener;
impl TransportListener for NoListener {
    fn transport_closed(&self, _transport: Arc<dyn Transport>) {}
}

/// hooks that are not connected to any context
pub fn detached_hooks() -> TransportHooks {
    let listener: Weak<dyn TransportListener> = Weak::<NoListener>::new();
    TransportHooks {
        dispatcher: Arc::new(ResponseDispatcher::new(0)),
        listener,
    }
}
