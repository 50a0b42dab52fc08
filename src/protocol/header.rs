use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::command::Command;
use crate::protocol::PVA_PROTOCOL_REVISION;

pub const PVA_MAGIC: u8 = 0xCA;
pub const HEADER_SIZE: usize = 8;

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct HeaderFlags: u8 {
        const CONTROL        = 0b0000_0001;
        const SEGMENT_MASK   = 0b0011_0000;
        const SEGMENT_FIRST  = 0b0001_0000;
        const SEGMENT_LAST   = 0b0010_0000;
        const FROM_SERVER    = 0b0100_0000;
        const BIG_ENDIAN     = 0b1000_0000;
    }
}

/// The fixed 8 byte header in front of every message: magic, version, flags, command and
///  payload size. For control messages the size field carries a value instead, and no payload
///  follows.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct MessageHeader {
    pub version: u8,
    pub flags: HeaderFlags,
    pub command: u8,
    pub payload_size: u32,
}

impl Debug for MessageHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let command = match Command::try_from(self.command) {
            Ok(c) => format!("{:?}", c),
            Err(_) => format!("#{}", self.command),
        };
        write!(f, "HDR{{V{}:{}{}:{}}}",
               self.version,
               if self.is_control() { "CTRL " } else { "" },
               command,
               self.payload_size,
        )
    }
}

impl MessageHeader {
    pub fn new(command: Command, flags: HeaderFlags, payload_size: u32) -> MessageHeader {
        MessageHeader {
            version: PVA_PROTOCOL_REVISION,
            flags: flags | HeaderFlags::BIG_ENDIAN,
            command: command.into(),
            payload_size,
        }
    }

    pub fn is_control(&self) -> bool {
        self.flags.contains(HeaderFlags::CONTROL)
    }

    pub fn is_segmented(&self) -> bool {
        self.flags.intersects(HeaderFlags::SEGMENT_MASK)
    }

    /// number of payload bytes that follow the header on the wire
    pub fn wire_payload_len(&self) -> usize {
        if self.is_control() {
            0
        }
        else {
            self.payload_size as usize
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(PVA_MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.command);
        buf.put_u32(self.payload_size);
    }

    /// Reads and validates a header. Failures here are framing violations: the rest of the
    ///  stream can not be parsed reliably after them.
    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        if buf.remaining() < HEADER_SIZE {
            bail!("incomplete message header: {} bytes", buf.remaining());
        }

        let magic = buf.get_u8();
        if magic != PVA_MAGIC {
            bail!("invalid magic byte {:#04x}", magic);
        }
        let version = buf.get_u8();
        let flags = HeaderFlags::from_bits_retain(buf.get_u8());
        let command = buf.get_u8();

        if !flags.contains(HeaderFlags::BIG_ENDIAN) {
            bail!("little endian messages are not supported");
        }
        let payload_size = buf.get_u32();

        Ok(MessageHeader {
            version,
            flags,
            command,
            payload_size,
        })
    }
}

/// Frames a complete application message
pub fn encode_message(command: Command, flags: HeaderFlags, payload: &[u8]) -> Bytes {
    let payload_size: u32 = payload.len().try_into()
        .expect("this is a bug: message payloads are bounded far below 4 GiB");

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    MessageHeader::new(command, flags, payload_size).ser(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// Frames a message whose payload is written by `f`
pub fn encode_with(command: Command, flags: HeaderFlags, f: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut payload = BytesMut::new();
    f(&mut payload);
    encode_message(command, flags, &payload)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_encode_message() {
        let msg = encode_message(Command::Echo, HeaderFlags::empty(), b"abc");
        assert_eq!(&msg[..], b"\xca\x02\x80\x02\x00\x00\x00\x03abc");

        let mut buf = msg.clone();
        let header = MessageHeader::try_deser(&mut buf).unwrap();
        assert_eq!(header.command, 2);
        assert_eq!(header.wire_payload_len(), 3);
        assert!(!header.is_control());
        assert_eq!(&buf[..], b"abc");
    }

    #[rstest]
    #[case::short(b"\xca\x02\x80\x02\x00\x00\x00")]
    #[case::bad_magic(b"\xcb\x02\x80\x02\x00\x00\x00\x03")]
    #[case::little_endian(b"\xca\x02\x00\x02\x03\x00\x00\x00")]
    fn test_try_deser_invalid(#[case] mut buf: &[u8]) {
        assert!(MessageHeader::try_deser(&mut buf).is_err());
    }

    #[test]
    fn test_control_message_has_no_payload() {
        let mut buf: &[u8] = b"\xca\x02\x81\x02\x00\x01\x00\x00";
        let header = MessageHeader::try_deser(&mut buf).unwrap();
        assert!(header.is_control());
        assert_eq!(header.payload_size, 0x10000);
        assert_eq!(header.wire_payload_len(), 0);
    }

    #[rstest]
    #[case::unsegmented(0x80, false)]
    #[case::first(0x90, true)]
    #[case::last(0xa0, true)]
    #[case::middle(0xb0, true)]
    fn test_is_segmented(#[case] flags: u8, #[case] expected: bool) {
        let header = MessageHeader { version: 2, flags: HeaderFlags::from_bits_retain(flags), command: 10, payload_size: 0 };
        assert_eq!(header.is_segmented(), expected);
    }
}
