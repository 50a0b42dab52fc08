use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, error, trace, warn};

use crate::dispatch::dispatcher::ResponseDispatcher;
use crate::protocol::header::MessageHeader;
use crate::search::SearchSender;

const MAX_DATAGRAM_SIZE: usize = 65536;

/// A UDP socket for discovery traffic: search requests go out through it, search responses
///  and beacons come in.
pub struct UdpEndpoint {
    socket: UdpSocket,
    /// where search requests are sent
    destinations: Vec<SocketAddr>,
    cancel_sender: broadcast::Sender<()>,
}

impl UdpEndpoint {
    /// Binds with address reuse, so several processes on a host can listen for beacons on the
    ///  same port. Must be called inside a tokio runtime.
    pub fn bind(addr: SocketAddr, destinations: Vec<SocketAddr>) -> anyhow::Result<UdpEndpoint> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv4() {
            socket.set_broadcast(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())
            .with_context(|| format!("binding UDP socket to {}", addr))?;

        let socket = UdpSocket::from_std(socket.into())?;
        let (cancel_sender, _) = broadcast::channel(1);

        debug!(local_addr = ?socket.local_addr()?, "bound UDP endpoint");
        Ok(UdpEndpoint {
            socket,
            destinations,
            cancel_sender,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn send_to(&self, msg: &[u8], to: SocketAddr) -> anyhow::Result<()> {
        self.socket.send_to(msg, to).await?;
        Ok(())
    }

    pub async fn recv_loop(&self, dispatcher: Arc<ResponseDispatcher>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut cancel_receiver = self.cancel_sender.subscribe();

        trace!("starting UDP receive loop");

        loop {
            tokio::select! {
                r = self.socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            dispatch_datagram(&dispatcher, from, Bytes::copy_from_slice(&buf[..len]));
                        }
                        Err(e) => {
                            error!(error = ?e, "error receiving from datagram socket");
                            return Err(e.into());
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }

        debug!("UDP receive loop stopped");
        Ok(())
    }

    pub fn cancel_recv_loop(&self) {
        if let Err(err) = self.cancel_sender.send(()) {
            debug!(?err, "no receive loop to cancel");
        }
    }
}

#[async_trait]
impl SearchSender for UdpEndpoint {
    fn response_address(&self) -> SocketAddr {
        // servers reply to the datagram's source address if this is unspecified
        self.socket.local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    async fn send_search(&self, msg: Bytes) -> anyhow::Result<()> {
        for destination in &self.destinations {
            if let Err(e) = self.socket.send_to(&msg, destination).await {
                // one unreachable destination must not prevent searching the others
                warn!(?destination, "error sending search request: {}", e);
            }
        }
        Ok(())
    }
}

/// A datagram may hold several messages back to back. Returns the number of messages that were
///  dispatched. Parsing stops at the first malformed or truncated message.
pub fn dispatch_datagram(dispatcher: &ResponseDispatcher, source: SocketAddr, mut datagram: Bytes) -> usize {
    let mut num_dispatched = 0;
    while datagram.has_remaining() {
        let header = match MessageHeader::try_deser(&mut datagram) {
            Ok(header) => header,
            Err(e) => {
                debug!(?source, "invalid datagram - dropping the rest: {}", e);
                break;
            }
        };

        let len = header.wire_payload_len();
        if len > datagram.remaining() {
            warn!(?source, ?header, remaining = datagram.remaining(), "truncated message in datagram - dropping");
            break;
        }
        let payload = datagram.split_to(len);

        if header.is_control() {
            continue;
        }
        dispatcher.handle_message(source, None, header.version, header.command, payload);
        num_dispatched += 1;
    }
    num_dispatched
}
