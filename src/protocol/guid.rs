use std::fmt::{Debug, Display, Formatter};

use bytes::{Buf, BufMut};

/// Opaque identity a server assigns itself at startup. It is stable for the lifetime of one
///  server process, so a different GUID from the same address means the server restarted.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct ServerGuid(pub [u8; ServerGuid::LEN]);

impl Debug for ServerGuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "GUID{{{}}}", hex::encode(self.0))
    }
}

impl Display for ServerGuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl ServerGuid {
    pub const LEN: usize = 12;

    pub fn random() -> ServerGuid {
        ServerGuid(rand::random())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ServerGuid> {
        if buf.remaining() < Self::LEN {
            anyhow::bail!("GUID needs {} bytes, only {} remaining", Self::LEN, buf.remaining());
        }
        let mut raw = [0u8; Self::LEN];
        buf.copy_to_slice(&mut raw);
        Ok(ServerGuid(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_hex() {
        let guid = ServerGuid([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 0xa, 0xff]);
        assert_eq!(format!("{:?}", guid), "GUID{000102030405060708090aff}");
    }

    #[test]
    fn test_try_deser_short() {
        let mut buf: &[u8] = &[1, 2, 3];
        assert!(ServerGuid::try_deser(&mut buf).is_err());
    }

    #[test]
    fn test_random_differs() {
        assert_ne!(ServerGuid::random(), ServerGuid::random());
    }
}
