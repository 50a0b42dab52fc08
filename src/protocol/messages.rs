//! Codecs for the messages the connection layer itself interprets. Request and response
//!  bodies (structured values, introspection data) are carried through as opaque bytes.

use std::net::SocketAddr;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes};

use crate::ids::{Cid, Ioid, Sid};
use crate::protocol::command::subcommand;
use crate::protocol::guid::ServerGuid;
use crate::protocol::status::Status;
use crate::util::buf::{put_size, put_socket_addr, put_string, try_get_size, try_get_socket_addr, try_get_string};

pub const PROTOCOL_TCP: &str = "tcp";

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BeaconMessage {
    pub guid: ServerGuid,
    pub flags: u8,
    pub sequence_id: u16,
    pub change_count: u16,
    /// the unspecified address means 'the sender of the datagram'
    pub server_address: SocketAddr,
    pub protocol: String,
}

impl BeaconMessage {
    pub fn ser(&self, buf: &mut impl BufMut) {
        self.guid.ser(buf);
        buf.put_u8(self.flags);
        buf.put_u16(self.sequence_id);
        buf.put_u16(self.change_count);
        put_socket_addr(buf, self.server_address);
        put_string(buf, &self.protocol);
    }

    /// trailing server status data is ignored
    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<BeaconMessage> {
        Ok(BeaconMessage {
            guid: ServerGuid::try_deser(buf)?,
            flags: buf.try_get_u8()?,
            sequence_id: buf.try_get_u16()?,
            change_count: buf.try_get_u16()?,
            server_address: try_get_socket_addr(buf)?,
            protocol: try_get_string(buf)?,
        })
    }
}

/// Servers put the unspecified address into beacons and search responses to mean 'the address
///  this datagram came from'.
pub fn resolve_server_address(advertised: SocketAddr, source: SocketAddr) -> SocketAddr {
    if advertised.ip().is_unspecified() {
        SocketAddr::new(source.ip(), advertised.port())
    }
    else {
        advertised
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SearchRequest {
    pub sequence_id: u32,
    pub flags: u8,
    pub response_address: SocketAddr,
    pub protocols: Vec<String>,
    pub channels: Vec<(Cid, String)>,
}

impl SearchRequest {
    pub const FLAG_REPLY_REQUIRED: u8 = 0x01;
    pub const FLAG_UNICAST: u8 = 0x80;

    /// size of everything except the channel entries, for the protocols we send
    pub fn fixed_len() -> usize {
        4 + 1 + 3 + 18 + 1 + (1 + PROTOCOL_TCP.len()) + 2
    }

    pub fn channel_entry_len(name: &str) -> usize {
        let size_len = if name.len() < 254 { 1 } else { 5 };
        4 + size_len + name.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sequence_id);
        buf.put_u8(self.flags);
        buf.put_slice(&[0, 0, 0]);
        put_socket_addr(buf, self.response_address);
        put_size(buf, self.protocols.len());
        for protocol in &self.protocols {
            put_string(buf, protocol);
        }
        buf.put_u16(self.channels.len() as u16);
        for (cid, name) in &self.channels {
            buf.put_u32(*cid);
            put_string(buf, name);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<SearchRequest> {
        let sequence_id = buf.try_get_u32()?;
        let flags = buf.try_get_u8()?;
        for _ in 0..3 {
            buf.try_get_u8()?;
        }
        let response_address = try_get_socket_addr(buf)?;

        let num_protocols = try_get_size(buf)?;
        let mut protocols = Vec::new();
        for _ in 0..num_protocols {
            protocols.push(try_get_string(buf)?);
        }

        let num_channels = buf.try_get_u16()?;
        let mut channels = Vec::new();
        for _ in 0..num_channels {
            let cid = buf.try_get_u32()?;
            channels.push((cid, try_get_string(buf)?));
        }

        Ok(SearchRequest {
            sequence_id,
            flags,
            response_address,
            protocols,
            channels,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SearchResponse {
    pub guid: ServerGuid,
    pub sequence_id: u32,
    pub server_address: SocketAddr,
    pub protocol: String,
    pub found: bool,
    pub cids: Vec<Cid>,
}

impl SearchResponse {
    pub fn ser(&self, buf: &mut impl BufMut) {
        self.guid.ser(buf);
        buf.put_u32(self.sequence_id);
        put_socket_addr(buf, self.server_address);
        put_string(buf, &self.protocol);
        buf.put_u8(self.found as u8);
        buf.put_u16(self.cids.len() as u16);
        for cid in &self.cids {
            buf.put_u32(*cid);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<SearchResponse> {
        let guid = ServerGuid::try_deser(buf)?;
        let sequence_id = buf.try_get_u32()?;
        let server_address = try_get_socket_addr(buf)?;
        let protocol = try_get_string(buf)?;
        let found = buf.try_get_u8()? != 0;

        let count = buf.try_get_u16()? as usize;
        if buf.remaining() < count * 4 {
            bail!("search response announces {} channels but has only {} bytes left", count, buf.remaining());
        }
        let cids = (0..count)
            .map(|_| buf.get_u32())
            .collect();

        Ok(SearchResponse {
            guid,
            sequence_id,
            server_address,
            protocol,
            found,
            cids,
        })
    }
}

/// first message a server sends on a new connection
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionValidationRequest {
    pub receive_buffer_size: u32,
    pub introspection_registry_size: u16,
    pub auth_methods: Vec<String>,
}

impl ConnectionValidationRequest {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.receive_buffer_size);
        buf.put_u16(self.introspection_registry_size);
        put_size(buf, self.auth_methods.len());
        for method in &self.auth_methods {
            put_string(buf, method);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ConnectionValidationRequest> {
        let receive_buffer_size = buf.try_get_u32()?;
        let introspection_registry_size = buf.try_get_u16()?;
        let num_methods = try_get_size(buf)?;
        let mut auth_methods = Vec::new();
        for _ in 0..num_methods {
            auth_methods.push(try_get_string(buf)?);
        }
        Ok(ConnectionValidationRequest {
            receive_buffer_size,
            introspection_registry_size,
            auth_methods,
        })
    }
}

/// the client's answer to [ConnectionValidationRequest]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionValidationResponse {
    pub receive_buffer_size: u32,
    pub introspection_registry_size: u16,
    pub qos: u16,
    pub auth_method: String,
}

impl ConnectionValidationResponse {
    pub const AUTH_ANONYMOUS: &'static str = "anonymous";

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.receive_buffer_size);
        buf.put_u16(self.introspection_registry_size);
        buf.put_u16(self.qos);
        put_string(buf, &self.auth_method);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ConnectionValidationResponse> {
        Ok(ConnectionValidationResponse {
            receive_buffer_size: buf.try_get_u32()?,
            introspection_registry_size: buf.try_get_u16()?,
            qos: buf.try_get_u16()?,
            auth_method: try_get_string(buf)?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CreateChannelRequest {
    pub cid: Cid,
    pub name: String,
}

impl CreateChannelRequest {
    pub fn ser(&self, buf: &mut impl BufMut) {
        // the protocol allows batching, we always create one channel per message
        buf.put_u16(1);
        buf.put_u32(self.cid);
        put_string(buf, &self.name);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<CreateChannelRequest> {
        let count = buf.try_get_u16()?;
        if count != 1 {
            bail!("creating {} channels in a single request is not supported", count);
        }
        Ok(CreateChannelRequest {
            cid: buf.try_get_u32()?,
            name: try_get_string(buf)?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CreateChannelResponse {
    pub cid: Cid,
    pub sid: Sid,
    pub status: Status,
}

impl CreateChannelResponse {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.cid);
        buf.put_u32(self.sid);
        self.status.ser(buf);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<CreateChannelResponse> {
        Ok(CreateChannelResponse {
            cid: buf.try_get_u32()?,
            sid: buf.try_get_u32()?,
            status: Status::try_deser(buf)?,
        })
    }
}

/// sent in both directions
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DestroyChannel {
    pub sid: Sid,
    pub cid: Cid,
}

impl DestroyChannel {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sid);
        buf.put_u32(self.cid);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<DestroyChannel> {
        Ok(DestroyChannel {
            sid: buf.try_get_u32()?,
            cid: buf.try_get_u32()?,
        })
    }
}

/// Common layout of get / put / put-get / monitor / array / process / rpc requests
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RequestMessage {
    pub sid: Sid,
    pub ioid: Ioid,
    pub subcommand: u8,
    pub body: Bytes,
}

impl RequestMessage {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sid);
        buf.put_u32(self.ioid);
        buf.put_u8(self.subcommand);
        buf.put_slice(&self.body);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<RequestMessage> {
        let sid = buf.try_get_u32()?;
        let ioid = buf.try_get_u32()?;
        let subcommand = buf.try_get_u8()?;
        Ok(RequestMessage {
            sid,
            ioid,
            subcommand,
            body: buf.copy_to_bytes(buf.remaining()),
        })
    }
}

/// introspection request - unlike other requests it has no sub-command
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GetFieldRequest {
    pub sid: Sid,
    pub ioid: Ioid,
    pub sub_field: String,
}

impl GetFieldRequest {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sid);
        buf.put_u32(self.ioid);
        put_string(buf, &self.sub_field);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<GetFieldRequest> {
        Ok(GetFieldRequest {
            sid: buf.try_get_u32()?,
            ioid: buf.try_get_u32()?,
            sub_field: try_get_string(buf)?,
        })
    }
}

/// payload of both destroy-request and cancel-request
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RequestIds {
    pub sid: Sid,
    pub ioid: Ioid,
}

impl RequestIds {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sid);
        buf.put_u32(self.ioid);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<RequestIds> {
        Ok(RequestIds {
            sid: buf.try_get_u32()?,
            ioid: buf.try_get_u32()?,
        })
    }
}

/// Decoded response to a pending request. Monitor updates carry no status on the wire, they
///  are decoded with [Status::ok].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Response {
    pub subcommand: u8,
    pub status: Status,
    pub body: Bytes,
}

impl Response {
    pub fn is_destroy(&self) -> bool {
        self.subcommand & subcommand::DESTROY != 0
    }

    /// `buf` is positioned after the ioid
    pub fn try_deser_data(buf: &mut impl Buf, is_monitor: bool) -> anyhow::Result<Response> {
        let subcommand = buf.try_get_u8()?;
        let has_status = !is_monitor
            || subcommand & (subcommand::INIT | subcommand::DESTROY) != 0;

        let status = if has_status {
            Status::try_deser(buf)?
        }
        else {
            Status::ok()
        };

        Ok(Response {
            subcommand,
            status,
            body: buf.copy_to_bytes(buf.remaining()),
        })
    }

    /// get-field responses have no sub-command, and they always terminate the request
    pub fn try_deser_get_field(buf: &mut impl Buf) -> anyhow::Result<Response> {
        let status = Status::try_deser(buf)?;
        Ok(Response {
            subcommand: subcommand::DESTROY,
            status,
            body: buf.copy_to_bytes(buf.remaining()),
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MessageNotification {
    pub ioid: Ioid,
    pub message_type: u8,
    pub message: String,
}

impl MessageNotification {
    pub const TYPE_INFO: u8 = 0;
    pub const TYPE_WARNING: u8 = 1;
    pub const TYPE_ERROR: u8 = 2;
    pub const TYPE_FATAL: u8 = 3;

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MessageNotification> {
        Ok(MessageNotification {
            ioid: buf.try_get_u32()?,
            message_type: buf.try_get_u8()?,
            message: try_get_string(buf)?,
        })
    }
}
