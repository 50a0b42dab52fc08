use std::fmt::{Display, Formatter};

use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::buf::{put_string, try_get_string};

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum StatusKind {
    Ok = 0,
    Warning = 1,
    Error = 2,
    Fatal = 3,
}

/// Completion status a server reports for a request or channel operation
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Status {
    pub kind: StatusKind,
    pub message: String,
    pub call_tree: String,
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{:?}", self.kind)
        }
        else {
            write!(f, "{:?}: {}", self.kind, self.message)
        }
    }
}

impl Status {
    /// plain OK without message goes on the wire as this single byte
    const OK_MARKER: u8 = 0xFF;

    pub fn ok() -> Status {
        Status {
            kind: StatusKind::Ok,
            message: String::new(),
            call_tree: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Status {
        Status {
            kind: StatusKind::Error,
            message: message.into(),
            call_tree: String::new(),
        }
    }

    /// warnings do not fail a request
    pub fn is_success(&self) -> bool {
        matches!(self.kind, StatusKind::Ok | StatusKind::Warning)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        if self.kind == StatusKind::Ok && self.message.is_empty() && self.call_tree.is_empty() {
            buf.put_u8(Self::OK_MARKER);
            return;
        }
        buf.put_u8(self.kind.into());
        put_string(buf, &self.message);
        put_string(buf, &self.call_tree);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Status> {
        let raw_kind = buf.try_get_u8()?;
        if raw_kind == Self::OK_MARKER {
            return Ok(Status::ok());
        }

        let kind = StatusKind::try_from(raw_kind)?;
        let message = try_get_string(buf)?;
        let call_tree = try_get_string(buf)?;
        Ok(Status {
            kind,
            message,
            call_tree,
        })
    }
}
