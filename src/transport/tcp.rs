use std::cmp::min;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::config::ContextConfig;
use crate::dispatch::dispatcher::ResponseDispatcher;
use crate::protocol::command::Command;
use crate::protocol::header::{encode_message, encode_with, HeaderFlags, MessageHeader, HEADER_SIZE};
use crate::protocol::messages::{ConnectionValidationRequest, ConnectionValidationResponse};
use crate::protocol::status::Status;
use crate::protocol::PVA_PROTOCOL_REVISION;
use crate::transport::{Connector, Transport, TransportHooks, TransportKey, TransportListener};

/// Reads one complete message. Payloads above `max_message_size` are a framing violation.
pub async fn read_message(reader: &mut (impl AsyncRead + Unpin), max_message_size: u32) -> anyhow::Result<(MessageHeader, Bytes)> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header).await?;
    let header = MessageHeader::try_deser(&mut &raw_header[..])?;

    if header.wire_payload_len() > max_message_size as usize {
        bail!("message size {} exceeds the maximum of {}", header.payload_size, max_message_size);
    }

    let mut payload = BytesMut::zeroed(header.wire_payload_len());
    reader.read_exact(&mut payload).await?;
    Ok((header, payload.freeze()))
}

/// like [read_message], skipping control messages
async fn read_application_message(reader: &mut (impl AsyncRead + Unpin), max_message_size: u32) -> anyhow::Result<(MessageHeader, Bytes)> {
    loop {
        let (header, payload) = read_message(reader, max_message_size).await?;
        if !header.is_control() {
            return Ok((header, payload));
        }
        trace!(?header, "skipping control message during handshake");
    }
}

/// Parameters the client announces during connection validation
#[derive(Debug, Clone)]
pub struct HandshakeParams {
    pub receive_buffer_size: u32,
    pub introspection_registry_size: u16,
    pub max_message_size: u32,
    pub priority: u16,
}

/// Client side of connection validation: the server asks, the client answers, the server
///  confirms with a status. Returns the negotiated minor revision.
pub async fn client_handshake(reader: &mut (impl AsyncRead + Unpin), writer: &mut (impl AsyncWrite + Unpin), params: &HandshakeParams) -> anyhow::Result<u8> {
    let (header, mut payload) = read_application_message(reader, params.max_message_size).await?;
    if header.command != u8::from(Command::ConnectionValidation) {
        bail!("expected connection validation, server sent {:?}", header);
    }
    let request = ConnectionValidationRequest::try_deser(&mut payload)?;
    trace!(?request, "connection validation request");

    // authentication policy is out of scope: anonymous if offered, whatever is offered otherwise
    let auth_method = request.auth_methods.iter()
        .find(|m| m.as_str() == ConnectionValidationResponse::AUTH_ANONYMOUS)
        .or(request.auth_methods.first())
        .cloned()
        .unwrap_or_default();

    let response = ConnectionValidationResponse {
        receive_buffer_size: params.receive_buffer_size,
        introspection_registry_size: min(params.introspection_registry_size, request.introspection_registry_size),
        qos: params.priority,
        auth_method,
    };
    writer.write_all(&encode_with(Command::ConnectionValidation, HeaderFlags::empty(), |buf| response.ser(buf))).await?;
    writer.flush().await?;

    let (validated_header, mut payload) = read_application_message(reader, params.max_message_size).await?;
    if validated_header.command != u8::from(Command::ConnectionValidated) {
        bail!("expected connection validated, server sent {:?}", validated_header);
    }
    let status = Status::try_deser(&mut payload)?;
    if !status.is_success() {
        bail!("server rejected the connection: {}", status);
    }

    Ok(min(header.version, PVA_PROTOCOL_REVISION))
}

/// Establishes TCP transports to servers
pub struct TcpConnector {
    connection_timeout: Duration,
    receive_buffer_size: u32,
    introspection_registry_size: u16,
    max_message_size: u32,
    send_queue_size: usize,
}

impl TcpConnector {
    pub fn new(config: &ContextConfig) -> TcpConnector {
        TcpConnector {
            connection_timeout: config.connection_timeout,
            receive_buffer_size: config.receive_buffer_size,
            introspection_registry_size: config.introspection_registry_size,
            max_message_size: config.max_message_size,
            send_queue_size: config.send_queue_size,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: SocketAddr, priority: u16, hooks: TransportHooks) -> anyhow::Result<Arc<dyn Transport>> {
        let stream = tokio::time::timeout(self.connection_timeout, TcpStream::connect(addr)).await
            .map_err(|_| anyhow!("timed out connecting to {}", addr))??;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let params = HandshakeParams {
            receive_buffer_size: self.receive_buffer_size,
            introspection_registry_size: self.introspection_registry_size,
            max_message_size: self.max_message_size,
            priority,
        };
        let minor_revision = tokio::time::timeout(self.connection_timeout, client_handshake(&mut reader, &mut writer, &params)).await
            .map_err(|_| anyhow!("timed out validating connection to {}", addr))??;

        debug!(?addr, priority, minor_revision, "connection validated");
        let transport = TcpTransport::start(
            TransportKey::new(addr, priority),
            minor_revision,
            reader,
            writer,
            hooks,
            self.max_message_size,
            self.send_queue_size,
        );
        Ok(transport)
    }
}

/// A validated connection to a server, with a reader task feeding inbound messages to the
///  dispatcher and a writer task draining a bounded send queue.
pub struct TcpTransport {
    key: TransportKey,
    minor_revision: u8,
    myself: Weak<TcpTransport>,
    send_queue: mpsc::Sender<Bytes>,
    clients: AtomicUsize,
    closed: AtomicBool,
    cancel_sender: broadcast::Sender<()>,
    listener: Weak<dyn TransportListener>,
}

impl TcpTransport {
    pub fn start<R, W>(key: TransportKey, minor_revision: u8, reader: R, writer: W, hooks: TransportHooks, max_message_size: u32, send_queue_size: usize) -> Arc<TcpTransport>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (send_queue, send_receiver) = mpsc::channel(send_queue_size);
        let (cancel_sender, _) = broadcast::channel(1);

        let transport = Arc::new_cyclic(|myself| TcpTransport {
            key,
            minor_revision,
            myself: myself.clone(),
            send_queue,
            clients: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            cancel_sender,
            listener: hooks.listener,
        });

        tokio::spawn(Self::write_loop(
            Arc::downgrade(&transport),
            writer,
            send_receiver,
            transport.cancel_sender.subscribe(),
        ));
        tokio::spawn(Self::read_loop(
            Arc::downgrade(&transport),
            reader,
            hooks.dispatcher,
            max_message_size,
            transport.cancel_sender.subscribe(),
        ));
        transport
    }

    async fn write_loop(transport: Weak<TcpTransport>, mut writer: impl AsyncWrite + Unpin, mut send_receiver: mpsc::Receiver<Bytes>, mut cancel_receiver: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                msg = send_receiver.recv() => {
                    let Some(msg) = msg else {
                        break;
                    };
                    if let Err(e) = writer.write_all(&msg).await {
                        warn!(error = %e, "error writing to connection");
                        if let Some(transport) = transport.upgrade() {
                            transport.close();
                        }
                        break;
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }
        let _ = writer.shutdown().await;
        trace!("write loop terminated");
    }

    async fn read_loop(transport: Weak<TcpTransport>, mut reader: impl AsyncRead + Unpin, dispatcher: Arc<ResponseDispatcher>, max_message_size: u32, mut cancel_receiver: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                r = read_message(&mut reader, max_message_size) => {
                    let Some(transport) = transport.upgrade() else {
                        break;
                    };
                    match r {
                        Ok((header, payload)) => {
                            if header.is_control() {
                                trace!(?header, "ignoring control message");
                                continue;
                            }
                            if header.is_segmented() {
                                warn!(?header, "segmented messages are not supported - dropping");
                                continue;
                            }
                            let source = transport.key.addr;
                            let transport: Arc<dyn Transport> = transport;
                            dispatcher.handle_message(source, Some(&transport), header.version, header.command, payload);
                        }
                        Err(e) => {
                            let is_eof = e.downcast_ref::<std::io::Error>()
                                .is_some_and(|e| e.kind() == ErrorKind::UnexpectedEof);
                            if is_eof {
                                info!(addr = ?transport.key.addr, "connection closed by server");
                            }
                            else {
                                warn!(addr = ?transport.key.addr, "closing connection: {}", e);
                            }
                            transport.close();
                            break;
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }
        trace!("read loop terminated");
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn remote_addr(&self) -> SocketAddr {
        self.key.addr
    }

    fn priority(&self) -> u16 {
        self.key.priority
    }

    fn minor_revision(&self) -> u8 {
        self.minor_revision
    }

    async fn send(&self, msg: Bytes) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("connection to {} is closed", self.key.addr);
        }
        self.send_queue.send(msg).await
            .map_err(|_| anyhow!("connection to {} is closed", self.key.addr))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(key = ?self.key, "closing transport");
        let _ = self.cancel_sender.send(());

        if let (Some(listener), Some(myself)) = (self.listener.upgrade(), self.myself.upgrade()) {
            listener.transport_closed(myself);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn changed_transport(&self) {
        // a connection to the previous server process fails on the next write
        debug!(key = ?self.key, "server restarted - probing connection");
        let probe = encode_message(Command::Echo, HeaderFlags::empty(), &[]);
        if let Err(e) = self.send_queue.try_send(probe) {
            debug!(key = ?self.key, "could not enqueue echo probe: {}", e);
        }
    }

    fn attach_client(&self) -> usize {
        self.clients.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn detach_client(&self) -> usize {
        let previous = self.clients.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use bytes::BufMut;
    use tokio::io::{duplex, split, DuplexStream};

    use super::*;
    use crate::dispatch::dispatcher::{InboundMessage, ResponseHandler};
    use crate::test_util::test_addr;

    const MAX: u32 = 1024 * 1024;

    fn params() -> HandshakeParams {
        HandshakeParams {
            receive_buffer_size: 16384,
            introspection_registry_size: 100,
            max_message_size: MAX,
            priority: 3,
        }
    }

    async fn server_handshake(server: &mut (impl AsyncRead + AsyncWrite + Unpin), version: u8, status: Status) -> ConnectionValidationResponse {
        let request = ConnectionValidationRequest {
            receive_buffer_size: 32768,
            introspection_registry_size: 50,
            auth_methods: vec!["ca".to_string(), "anonymous".to_string()],
        };
        let mut msg = encode_with(Command::ConnectionValidation, HeaderFlags::FROM_SERVER, |buf| request.ser(buf)).to_vec();
        msg[1] = version;
        server.write_all(&msg).await.unwrap();

        let (_, mut payload) = read_message(server, MAX).await.unwrap();
        let response = ConnectionValidationResponse::try_deser(&mut payload).unwrap();

        server.write_all(&encode_with(Command::ConnectionValidated, HeaderFlags::FROM_SERVER, |buf| status.ser(buf))).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_client_handshake() {
        let (client, mut server) = duplex(4096);
        let (mut reader, mut writer) = split(client);

        let server_task = tokio::spawn(async move {
            server_handshake(&mut server, 1, Status::ok()).await
        });

        let revision = client_handshake(&mut reader, &mut writer, &params()).await.unwrap();
        assert_eq!(revision, 1);

        let response = server_task.await.unwrap();
        assert_eq!(response.auth_method, "anonymous");
        assert_eq!(response.qos, 3);
        assert_eq!(response.introspection_registry_size, 50);
    }

    #[tokio::test]
    async fn test_client_handshake_rejected() {
        let (client, mut server) = duplex(4096);
        let (mut reader, mut writer) = split(client);

        tokio::spawn(async move {
            server_handshake(&mut server, 2, Status::error("go away")).await;
            // keep the stream open until the client is done
            let _ = read_message(&mut server, MAX).await;
        });

        let result = client_handshake(&mut reader, &mut writer, &params()).await;
        assert!(result.unwrap_err().to_string().contains("go away"));
    }

    #[tokio::test]
    async fn test_client_handshake_unexpected_command() {
        let (client, mut server) = duplex(4096);
        let (mut reader, mut writer) = split(client);

        server.write_all(&encode_message(Command::Echo, HeaderFlags::empty(), &[])).await.unwrap();
        assert!(client_handshake(&mut reader, &mut writer, &params()).await.is_err());
    }

    #[tokio::test]
    async fn test_read_message_too_large() {
        let mut buf = BytesMut::new();
        MessageHeader::new(Command::Get, HeaderFlags::empty(), MAX + 1).ser(&mut buf);
        let mut reader: &[u8] = &buf;
        assert!(read_message(&mut reader, MAX).await.is_err());
    }

    #[derive(Default)]
    struct CountingListener {
        closed: AtomicUsize,
    }
    impl TransportListener for CountingListener {
        fn transport_closed(&self, transport: Arc<dyn Transport>) {
            assert!(transport.is_closed());
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct EchoCounter {
        count: AtomicUsize,
    }
    impl ResponseHandler for EchoCounter {
        fn handle(&self, msg: &InboundMessage) -> anyhow::Result<()> {
            assert!(msg.transport.is_some());
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn start_transport(client: DuplexStream, listener: &Arc<CountingListener>, handler: Arc<EchoCounter>) -> Arc<TcpTransport> {
        let dispatcher = Arc::new(ResponseDispatcher::new(0));
        dispatcher.register_handler(Command::Echo, handler).unwrap();
        let listener: Weak<CountingListener> = Arc::downgrade(listener);
        let hooks = TransportHooks {
            dispatcher,
            listener,
        };
        let (reader, writer) = split(client);
        TcpTransport::start(TransportKey::new(test_addr(1), 0), 2, reader, writer, hooks, MAX, 16)
    }

    #[tokio::test]
    async fn test_transport_dispatches_and_closes_on_eof() {
        let (client, mut server) = duplex(4096);
        let listener = Arc::new(CountingListener::default());
        let handler = Arc::new(EchoCounter::default());
        let transport = start_transport(client, &listener, handler.clone());

        let mut control = BytesMut::new();
        MessageHeader::new(Command::Echo, HeaderFlags::CONTROL, 77).ser(&mut control);
        server.write_all(&control).await.unwrap();
        server.write_all(&encode_message(Command::Echo, HeaderFlags::FROM_SERVER, b"x")).await.unwrap();

        transport.send(encode_message(Command::Echo, HeaderFlags::empty(), b"ping")).await.unwrap();
        let (header, payload) = read_message(&mut server, MAX).await.unwrap();
        assert_eq!(header.command, u8::from(Command::Echo));
        assert_eq!(&payload[..], b"ping");

        drop(server);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !transport.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();

        assert_eq!(handler.count.load(Ordering::SeqCst), 1);
        assert_eq!(listener.closed.load(Ordering::SeqCst), 1);
        assert!(transport.send(Bytes::from_static(b"late")).await.is_err());

        transport.close();
        assert_eq!(listener.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_framing_violation_closes_transport() {
        let (client, mut server) = duplex(4096);
        let listener = Arc::new(CountingListener::default());
        let transport = start_transport(client, &listener, Arc::new(EchoCounter::default()));

        let mut garbage = BytesMut::new();
        garbage.put_slice(b"\x00\x02\x80\x02\x00\x00\x00\x00");
        server.write_all(&garbage).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !transport.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();
        assert_eq!(listener.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attach_detach() {
        let (client, _server) = duplex(4096);
        let listener = Arc::new(CountingListener::default());
        let transport = start_transport(client, &listener, Arc::new(EchoCounter::default()));

        assert_eq!(transport.attach_client(), 1);
        assert_eq!(transport.attach_client(), 2);
        assert_eq!(transport.detach_client(), 1);
        assert_eq!(transport.detach_client(), 0);
        assert_eq!(transport.detach_client(), 0);
    }

    #[tokio::test]
    async fn test_tcp_connector() {
        let server = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = server.accept().await.unwrap();
            server_handshake(&mut stream, 2, Status::ok()).await;
            // hold the connection open
            let _ = read_message(&mut stream, MAX).await;
        });

        let mut config = ContextConfig::new();
        config.connection_timeout = Duration::from_secs(5);
        let connector = TcpConnector::new(&config);
        let listener = Arc::new(CountingListener::default());
        let weak_listener: Weak<CountingListener> = Arc::downgrade(&listener);
        let hooks = TransportHooks {
            dispatcher: Arc::new(ResponseDispatcher::new(0)),
            listener: weak_listener,
        };

        let transport = connector.connect(addr, 7, hooks).await.unwrap();
        assert_eq!(transport.remote_addr(), addr);
        assert_eq!(transport.priority(), 7);
        assert_eq!(transport.minor_revision(), 2);

        transport.close();
        assert_eq!(listener.closed.load(Ordering::SeqCst), 1);
    }
}
