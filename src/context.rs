use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::beacon::tracker::BeaconListener;
use crate::beacon::BeaconTrackerMap;
use crate::channel::{Channel, ChannelState};
use crate::config::ContextConfig;
use crate::dispatch::dispatcher::ResponseDispatcher;
use crate::dispatch::handlers::register_default_handlers;
use crate::error::PvaError;
use crate::ids::{Cid, IdAllocator};
use crate::protocol::command::Command;
use crate::protocol::header::{encode_with, HeaderFlags};
use crate::protocol::messages::{resolve_server_address, BeaconMessage, CreateChannelRequest, CreateChannelResponse, DestroyChannel, SearchResponse};
use crate::request::pending::PendingRequest;
use crate::request::registry::RequestRegistry;
use crate::search::{SearchManager, SearchSender};
use crate::transport::registry::TransportRegistry;
use crate::transport::tcp::TcpConnector;
use crate::transport::udp::UdpEndpoint;
use crate::transport::{Connector, Transport, TransportHooks, TransportKey, TransportListener};

const EVENT_QUEUE_SIZE: usize = 256;

/// Notable things happening in a context, for applications that want to observe them
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ContextEvent {
    ChannelStateChanged {
        cid: Cid,
        state: ChannelState,
    },
    NewServerDetected(SocketAddr),
    ServerRestarted(SocketAddr),
    TransportClosed(SocketAddr),
}

/// A non-owning reference to a context, held by channels and message handlers. Resolving it
///  fails once the context is gone, and whatever was about to happen is dropped then.
#[derive(Clone)]
pub(crate) struct ContextHandle(Weak<ContextInner>);

impl ContextHandle {
    pub(crate) fn upgrade(&self) -> Option<Arc<ContextInner>> {
        self.0.upgrade()
    }

    #[cfg(test)]
    pub(crate) fn detached() -> ContextHandle {
        ContextHandle(Weak::new())
    }
}

pub(crate) struct ContextInner {
    myself: Weak<ContextInner>,
    config: ContextConfig,
    transports: TransportRegistry,
    connector: Arc<dyn Connector>,
    requests: RequestRegistry<PendingRequest>,
    channels: RwLock<FxHashMap<Cid, Arc<Channel>>>,
    channel_ids: IdAllocator,
    beacons: BeaconTrackerMap,
    search: Arc<SearchManager>,
    dispatcher: Arc<ResponseDispatcher>,
    events: broadcast::Sender<ContextEvent>,
    destroyed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    udp_endpoints: Mutex<Vec<Arc<UdpEndpoint>>>,
}

impl ContextInner {
    pub(crate) fn handle(&self) -> ContextHandle {
        ContextHandle(self.myself.clone())
    }

    pub(crate) fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub(crate) fn requests(&self) -> &RequestRegistry<PendingRequest> {
        &self.requests
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn channel(&self, cid: Cid) -> Option<Arc<Channel>> {
        self.channels.read()
            .get(&cid)
            .cloned()
    }

    fn emit(&self, event: ContextEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    fn emit_state(&self, channel: &Channel) {
        self.emit(ContextEvent::ChannelStateChanged {
            cid: channel.cid(),
            state: channel.state(),
        });
    }

    fn transport_hooks(&self) -> TransportHooks {
        let listener: Weak<dyn TransportListener> = self.myself.clone();
        TransportHooks {
            dispatcher: self.dispatcher.clone(),
            listener,
        }
    }

    fn create_channel(&self, name: &str, priority: u16) -> Result<Arc<Channel>, PvaError> {
        let channel = {
            let mut channels = self.channels.write();
            // destroy() sets the flag before draining the map
            if self.is_destroyed() {
                return Err(PvaError::ContextDestroyed);
            }
            let cid = self.channel_ids.allocate(|cid| channels.contains_key(&cid))?;
            let channel = Arc::new(Channel::new(cid, name, priority, self.handle()));
            channels.insert(cid, channel.clone());
            self.search.register(cid, name);
            channel
        };

        debug!(cid = channel.cid(), name, priority, "created channel");
        Ok(channel)
    }

    /// Idempotent. Pending requests of the channel fail, the server is told (best effort), and
    ///  the channel's share of its transport is released.
    pub(crate) async fn destroy_channel(&self, cid: Cid) {
        let Some(channel) = self.channels.write().remove(&cid) else {
            return;
        };

        self.search.unregister(cid);
        let connection = channel.mark_destroyed();
        self.requests.destroy_channel(cid, &PvaError::ChannelDestroyed);

        if let Some((transport, sid)) = connection {
            if let Some(sid) = sid {
                let msg = encode_with(Command::DestroyChannel, HeaderFlags::empty(), |buf| DestroyChannel { sid, cid }.ser(buf));
                if let Err(e) = transport.send(msg).await {
                    debug!(cid, sid, "could not notify server of destroyed channel: {}", e);
                }
            }
            self.release_transport(transport).await;
        }

        debug!(cid, name = channel.name(), "destroyed channel");
        self.emit_state(&channel);
    }

    /// Detaches one client. The last one removes and closes the transport, under the key's
    ///  reservation so a concurrent connect either reuses it before or creates a new one after.
    async fn release_transport(&self, transport: Arc<dyn Transport>) {
        let _reservation = self.transports.reserve(transport.key()).await;
        let remaining = transport.detach_client();
        trace!(?transport, remaining, "released transport");
        if remaining == 0 {
            debug!(?transport, "last channel detached - closing transport");
            self.transports.remove(&transport);
            transport.close();
        }
    }

    fn spawn_release(&self, transport: Arc<dyn Transport>) {
        match self.myself.upgrade() {
            Some(ctx) => {
                tokio::spawn(async move { ctx.release_transport(transport).await });
            }
            None => transport.close(),
        }
    }

    /// The channel lost its server: requests fail, and it is searched for again
    fn reset_channel(&self, channel: &Channel, reason: &PvaError) {
        self.requests.destroy_channel(channel.cid(), reason);
        if channel.back_to_searching() {
            self.search.register(channel.cid(), channel.name());
            self.emit_state(channel);
        }
    }

    pub(crate) fn on_beacon(&self, source: SocketAddr, remote_revision: u8, beacon: BeaconMessage) {
        let server_addr = resolve_server_address(beacon.server_address, source);
        self.beacons.get_or_create(server_addr)
            .notify(remote_revision, Instant::now(), beacon.guid, beacon.sequence_id, beacon.change_count);
    }

    pub(crate) fn on_search_response(&self, source: SocketAddr, response: SearchResponse) {
        if !response.found {
            return;
        }

        let server_addr = resolve_server_address(response.server_address, source);
        for cid in response.cids {
            let Some(channel) = self.channel(cid) else {
                trace!(cid, "search response for unknown channel");
                continue;
            };
            // several servers may answer, the first one wins
            if !channel.try_begin_connect() {
                trace!(cid, ?server_addr, "channel is not searching - ignoring search response");
                continue;
            }

            self.search.unregister(cid);
            self.emit_state(&channel);
            debug!(cid, name = channel.name(), ?server_addr, "found channel");

            if let Some(ctx) = self.myself.upgrade() {
                tokio::spawn(ctx.connect_channel(channel, server_addr));
            }
        }
    }

    async fn connect_channel(self: Arc<Self>, channel: Arc<Channel>, server_addr: SocketAddr) {
        let key = TransportKey::new(server_addr, channel.priority());
        let transport = match self.transports.connect(self.connector.as_ref(), key, self.transport_hooks(), self.config.connection_timeout).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(cid = channel.cid(), name = channel.name(), "could not connect channel: {}", e);
                if channel.abort_connect() {
                    self.search.register(channel.cid(), channel.name());
                    self.emit_state(&channel);
                }
                return;
            }
        };

        if !channel.set_transport(transport.clone()) {
            trace!(cid = channel.cid(), "channel was destroyed while connecting");
            self.release_transport(transport).await;
            return;
        }

        let request = CreateChannelRequest {
            cid: channel.cid(),
            name: channel.name().to_string(),
        };
        let msg = encode_with(Command::CreateChannel, HeaderFlags::empty(), |buf| request.ser(buf));
        if let Err(e) = transport.send(msg).await {
            warn!(cid = channel.cid(), ?transport, "could not send create channel request: {}", e);
            if let Some(transport) = channel.take_transport_if(&transport) {
                self.reset_channel(&channel, &PvaError::ConnectionLost(server_addr));
                self.release_transport(transport).await;
            }
        }
    }

    pub(crate) fn on_create_channel_response(&self, transport: Option<&Arc<dyn Transport>>, response: CreateChannelResponse) {
        let Some(channel) = self.channel(response.cid) else {
            debug!(cid = response.cid, "create channel response for unknown channel");
            return;
        };
        if let Some(transport) = transport {
            if !channel.uses_transport(transport) {
                debug!(cid = response.cid, ?transport, "create channel response from a transport the channel does not use");
                return;
            }
        }

        if response.status.is_success() {
            if channel.set_connected(response.sid) {
                info!(cid = response.cid, sid = response.sid, name = channel.name(), "channel connected");
                self.emit_state(&channel);
            }
            else {
                debug!(cid = response.cid, state = ?channel.state(), "unexpected create channel response");
            }
            return;
        }

        warn!(cid = response.cid, name = channel.name(), status = %response.status, "server refused to create channel");
        if let Some(transport) = channel.take_transport() {
            self.reset_channel(&channel, &PvaError::Remote(response.status));
            self.spawn_release(transport);
        }
    }

    /// The server destroyed a channel on its own, e.g. because the record went away
    pub(crate) fn on_server_destroy_channel(&self, transport: Option<&Arc<dyn Transport>>, msg: DestroyChannel) {
        let Some(channel) = self.channel(msg.cid) else {
            debug!(cid = msg.cid, "server destroyed unknown channel");
            return;
        };
        if channel.sid() != Some(msg.sid) || !transport.map_or(true, |t| channel.uses_transport(t)) {
            debug!(cid = msg.cid, sid = msg.sid, "server destroyed channel with mismatched ids - ignoring");
            return;
        }

        info!(cid = msg.cid, name = channel.name(), "server destroyed channel");
        if let Some(transport) = channel.take_transport() {
            self.reset_channel(&channel, &PvaError::NotConnected(channel.name().to_string()));
            self.spawn_release(transport);
        }
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        for endpoint in self.udp_endpoints.lock().drain(..) {
            endpoint.cancel_recv_loop();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let channels = self.channels.write()
            .drain()
            .map(|(_, c)| c)
            .collect::<Vec<_>>();
        for channel in &channels {
            self.search.unregister(channel.cid());
            channel.mark_destroyed();
        }
        let num_requests = self.requests.cancel_all(&PvaError::ContextDestroyed);

        let transports = self.transports.clear();
        for transport in &transports {
            transport.close();
        }
        self.beacons.clear();

        info!(num_channels = channels.len(), num_requests, num_transports = transports.len(), "destroyed client context");
    }
}

impl BeaconListener for ContextInner {
    fn new_server_detected(&self, server_addr: SocketAddr) {
        if self.is_destroyed() {
            return;
        }
        self.search.boost();
        self.emit(ContextEvent::NewServerDetected(server_addr));
    }

    fn server_restarted(&self, server_addr: SocketAddr) {
        if self.is_destroyed() {
            return;
        }
        for transport in self.transports.to_vec(Some(server_addr)) {
            transport.changed_transport();
        }
        self.emit(ContextEvent::ServerRestarted(server_addr));
    }
}

impl TransportListener for ContextInner {
    fn transport_closed(&self, transport: Arc<dyn Transport>) {
        if self.is_destroyed() {
            return;
        }

        self.transports.remove(&transport);

        let affected = self.channels.read()
            .values()
            .filter(|c| c.uses_transport(&transport))
            .cloned()
            .collect::<Vec<_>>();

        info!(?transport, num_channels = affected.len(), "transport closed");
        let reason = PvaError::ConnectionLost(transport.remote_addr());
        for channel in &affected {
            // the transport is gone, there is no client count left to release
            if channel.take_transport_if(&transport).is_some() {
                self.reset_channel(channel, &reason);
            }
        }
        self.emit(ContextEvent::TransportClosed(transport.remote_addr()));
    }
}

/// The client side of the protocol: resolves channels by name, keeps one connection per
///  server and priority, and correlates requests and responses.
///
/// Dropping the context destroys it.
pub struct ClientContext {
    inner: Arc<ContextInner>,
}

impl ClientContext {
    /// Binds the discovery sockets and starts the background tasks. Must be called inside a
    ///  tokio runtime.
    pub fn new(config: ContextConfig) -> anyhow::Result<ClientContext> {
        config.validate()?;

        let search_endpoint = Arc::new(UdpEndpoint::bind((Ipv4Addr::UNSPECIFIED, 0).into(), config.search_destinations())?);
        let beacon_endpoint = Arc::new(UdpEndpoint::bind((Ipv4Addr::UNSPECIFIED, config.broadcast_port).into(), Vec::new())?);
        let connector = Arc::new(TcpConnector::new(&config));

        let context = Self::with_collaborators(config, connector, search_endpoint.clone())?;
        for endpoint in [search_endpoint, beacon_endpoint] {
            context.spawn_recv_loop(endpoint);
        }
        Ok(context)
    }

    /// A context with externally provided network access, for embedding into hosting code and
    ///  for tests. Must be called inside a tokio runtime.
    pub fn with_collaborators(config: ContextConfig, connector: Arc<dyn Connector>, search_sender: Arc<dyn SearchSender>) -> anyhow::Result<ClientContext> {
        let (events, _) = broadcast::channel(EVENT_QUEUE_SIZE);
        let search = Arc::new(SearchManager::new(&config, search_sender));
        let dispatcher = Arc::new(ResponseDispatcher::new(config.debug_level));

        let inner = Arc::new_cyclic(|myself: &Weak<ContextInner>| {
            let beacon_listener: Weak<dyn BeaconListener> = myself.clone();
            ContextInner {
                myself: myself.clone(),
                transports: TransportRegistry::new(),
                connector,
                requests: RequestRegistry::new(),
                channels: Default::default(),
                channel_ids: IdAllocator::default(),
                beacons: BeaconTrackerMap::new(beacon_listener),
                search: search.clone(),
                dispatcher: dispatcher.clone(),
                events,
                destroyed: AtomicBool::new(false),
                tasks: Default::default(),
                udp_endpoints: Default::default(),
                config,
            }
        });

        register_default_handlers(&dispatcher, inner.handle())?;
        inner.tasks.lock().push(search.spawn_timer(inner.config.search_period));

        info!(destinations = ?inner.config.search_destinations(), "started client context");
        Ok(ClientContext { inner })
    }

    fn spawn_recv_loop(&self, endpoint: Arc<UdpEndpoint>) {
        let dispatcher = self.inner.dispatcher.clone();
        self.inner.udp_endpoints.lock().push(endpoint.clone());
        let task = tokio::spawn(async move {
            if let Err(e) = endpoint.recv_loop(dispatcher).await {
                warn!("UDP receive loop terminated: {}", e);
            }
        });
        self.inner.tasks.lock().push(task);
    }

    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    /// Inbound messages from the network are fed through this, which makes it a handy entry
    ///  point for injecting messages in tests
    pub fn dispatcher(&self) -> &Arc<ResponseDispatcher> {
        &self.inner.dispatcher
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.inner.transports
    }

    pub fn search(&self) -> &Arc<SearchManager> {
        &self.inner.search
    }

    pub fn beacons(&self) -> &BeaconTrackerMap {
        &self.inner.beacons
    }

    pub fn num_pending_requests(&self) -> usize {
        self.inner.requests.len()
    }

    /// Starts resolving a channel. The returned channel connects in the background, see
    ///  [Channel::wait_connected].
    pub fn create_channel(&self, name: &str, priority: u16) -> Result<Arc<Channel>, PvaError> {
        self.inner.create_channel(name, priority)
    }

    pub fn channel(&self, cid: Cid) -> Option<Arc<Channel>> {
        self.inner.channel(cid)
    }

    pub fn num_channels(&self) -> usize {
        self.inner.channels.read().len()
    }

    pub async fn destroy_channel(&self, cid: Cid) {
        self.inner.destroy_channel(cid).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContextEvent> {
        self.inner.events.subscribe()
    }

    /// Idempotent. Stops background tasks, fails all pending requests, and closes all
    ///  transports.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}
