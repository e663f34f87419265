//! Standard message header shared by every wire frame

use bytes::{Buf, BufMut, BytesMut};

use crate::{ReplayError, Result};

/// Size of the standard message header
pub const HEADER_LEN: usize = 16;

/// Largest frame the replay engine will accept from the target
pub const MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

/// Wire opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// OP_REPLY (1)
    Reply,
    /// OP_UPDATE (2001)
    Update,
    /// OP_INSERT (2002)
    Insert,
    /// OP_QUERY (2004)
    Query,
    /// OP_GET_MORE (2005)
    GetMore,
    /// OP_DELETE (2006)
    Delete,
    /// OP_KILL_CURSORS (2007)
    KillCursors,
    /// OP_COMMAND (2010)
    Command,
    /// OP_COMMANDREPLY (2011)
    CommandReply,
    /// OP_MSG (2013)
    Msg,
    /// Anything else, kept verbatim
    Unknown(i32),
}

impl OpCode {
    /// Decode an opcode
    #[must_use]
    pub fn from_i32(code: i32) -> Self {
        match code {
            1 => Self::Reply,
            2001 => Self::Update,
            2002 => Self::Insert,
            2004 => Self::Query,
            2005 => Self::GetMore,
            2006 => Self::Delete,
            2007 => Self::KillCursors,
            2010 => Self::Command,
            2011 => Self::CommandReply,
            2013 => Self::Msg,
            other => Self::Unknown(other),
        }
    }

    /// Encode an opcode
    #[must_use]
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Reply => 1,
            Self::Update => 2001,
            Self::Insert => 2002,
            Self::Query => 2004,
            Self::GetMore => 2005,
            Self::Delete => 2006,
            Self::KillCursors => 2007,
            Self::Command => 2010,
            Self::CommandReply => 2011,
            Self::Msg => 2013,
            Self::Unknown(code) => *code,
        }
    }

    /// The server answers this opcode with a reply frame
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        matches!(self, Self::Query | Self::GetMore | Self::Command | Self::Msg)
    }

    /// This opcode only ever travels from server to client
    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Reply | Self::CommandReply)
    }
}

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Total frame length including this header
    pub message_length: i32,
    /// Identifier chosen by the sender
    pub request_id: i32,
    /// Request id this frame answers (0 for requests)
    pub response_to: i32,
    /// Opcode
    pub op_code: OpCode,
}

impl MsgHeader {
    /// Parse a header from the first [`HEADER_LEN`] bytes of `buf`
    ///
    /// # Errors
    ///
    /// Returns error if `buf` is too short or the length field is out of range
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(ReplayError::InvalidFrame(format!(
                "Header needs {HEADER_LEN} bytes, got {}",
                buf.len()
            )));
        }

        let mut cursor = &buf[..HEADER_LEN];
        let message_length = cursor.get_i32_le();
        let request_id = cursor.get_i32_le();
        let response_to = cursor.get_i32_le();
        let op_code = OpCode::from_i32(cursor.get_i32_le());

        let header = Self {
            message_length,
            request_id,
            response_to,
            op_code,
        };
        header.frame_len()?;
        Ok(header)
    }

    /// Frame length as a `usize`, validated against protocol bounds
    ///
    /// # Errors
    ///
    /// Returns error if the length is shorter than a header or too large
    pub fn frame_len(&self) -> Result<usize> {
        let len = usize::try_from(self.message_length).map_err(|_| {
            ReplayError::InvalidFrame(format!("Negative message length {}", self.message_length))
        })?;

        if len < HEADER_LEN {
            return Err(ReplayError::InvalidFrame(format!(
                "Message length {len} shorter than header"
            )));
        }
        if len > MAX_MESSAGE_SIZE {
            return Err(ReplayError::InvalidFrame(format!(
                "Message length {len} exceeds limit of {MAX_MESSAGE_SIZE}"
            )));
        }
        Ok(len)
    }

    /// Append the encoded header to `buf`
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.message_length);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(self.op_code.as_i32());
    }
}
