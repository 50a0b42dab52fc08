use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use anyhow::bail;
use bytes::{Buf, BufMut};

const SIZE_NULL: u8 = 0xFF;
const SIZE_FOLLOWS: u8 = 0xFE;

/// Sizes (of strings, collections) are encoded in a single byte if they are < 254, and as a
///  marker byte 0xFE followed by a u32 otherwise. 0xFF encodes 'null', which we read as empty.
pub fn put_size(buf: &mut impl BufMut, size: usize) {
    if size < SIZE_FOLLOWS as usize {
        buf.put_u8(size as u8);
    }
    else {
        buf.put_u8(SIZE_FOLLOWS);
        buf.put_u32(size.try_into().expect("this is a bug: sizes are bounded by the u32 message length"));
    }
}

pub fn try_get_size(buf: &mut impl Buf) -> anyhow::Result<usize> {
    match buf.try_get_u8()? {
        SIZE_NULL => Ok(0),
        SIZE_FOLLOWS => Ok(buf.try_get_u32()? as usize),
        n => Ok(n as usize),
    }
}

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    put_size(buf, s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = try_get_size(buf)?;
    if buf.remaining() < len {
        bail!("string length {} exceeds remaining buffer of {} bytes", len, buf.remaining());
    }

    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    Ok(String::from_utf8(raw)?)
}

/// Addresses go on the wire as 16 bytes of IPv6 address (IPv4 addresses in their mapped form)
///  followed by the port.
pub fn put_socket_addr(buf: &mut impl BufMut, addr: SocketAddr) {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    buf.put_u128(ip.to_bits());
    buf.put_u16(addr.port());
}

pub fn try_get_socket_addr(buf: &mut impl Buf) -> anyhow::Result<SocketAddr> {
    let ip = Ipv6Addr::from_bits(buf.try_get_u128()?);
    let port = buf.try_get_u16()?;

    let ip = match ip.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(ip),
    };
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::zero(0, b"\0")]
    #[case::small(5, b"\x05")]
    #[case::max_short(253, b"\xfd")]
    #[case::first_long(254, b"\xfe\0\0\0\xfe")]
    #[case::long(70000, b"\xfe\0\x01\x11\x70")]
    fn test_put_size(#[case] size: usize, #[case] expected: &[u8]) {
        let mut buf = BytesMut::new();
        put_size(&mut buf, size);
        assert_eq!(&buf, expected);

        let mut b: &[u8] = &buf;
        assert_eq!(try_get_size(&mut b).unwrap(), size);
        assert!(b.is_empty());
    }

    #[test]
    fn test_null_size_reads_as_empty() {
        let mut b: &[u8] = b"\xff";
        assert_eq!(try_get_size(&mut b).unwrap(), 0);
    }

    #[rstest]
    #[case::empty(b"", false)]
    #[case::truncated_long(b"\xfe\0\0", false)]
    #[case::string_too_short(b"\x05abc", false)]
    #[case::string(b"\x03abc", true)]
    fn test_try_get_string_bounds(#[case] mut buf: &[u8], #[case] expected_ok: bool) {
        assert_eq!(try_get_string(&mut buf).is_ok(), expected_ok);
    }

    #[rstest]
    #[case::v4("10.1.2.3:5075", b"\0\0\0\0\0\0\0\0\0\0\xff\xff\x0a\x01\x02\x03\x13\xd3")]
    #[case::v4_unspecified("0.0.0.0:5076", b"\0\0\0\0\0\0\0\0\0\0\xff\xff\0\0\0\0\x13\xd4")]
    #[case::v6("[::1]:1", b"\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\x01\0\x01")]
    fn test_socket_addr(#[case] addr: &str, #[case] expected: &[u8]) {
        let addr = SocketAddr::from_str(addr).unwrap();

        let mut buf = BytesMut::new();
        put_socket_addr(&mut buf, addr);
        assert_eq!(&buf, expected);

        let mut b: &[u8] = &buf;
        assert_eq!(try_get_socket_addr(&mut b).unwrap(), addr);
    }
}
