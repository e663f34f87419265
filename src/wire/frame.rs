//! Raw wire frames and the handful of fields the replay engine reads

use std::fmt::Debug;

use bson::{Bson, Document};
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{ReplayError, Result};

use super::header::{MsgHeader, OpCode, HEADER_LEN};

/// OP_REPLY flag: the getmore named a cursor the server does not know
pub const REPLY_CURSOR_NOT_FOUND: i32 = 1;

/// OP_REPLY flag: the query failed and the single returned document holds `$err`
pub const REPLY_QUERY_FAILURE: i32 = 1 << 1;

/// OP_MSG flag: a CRC-32C checksum trails the sections
const MSG_CHECKSUM_PRESENT: u32 = 1;

/// Operation type as reported in stat records.
///
/// Queries against a `$cmd` namespace are reported as commands, the way the
/// server itself treats them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    /// Insert
    Insert,
    /// Query
    Query,
    /// Getmore
    GetMore,
    /// Reply
    Reply,
    /// Kill cursors
    KillCursors,
    /// Command (`$cmd` query, OP_COMMAND, OP_MSG)
    Command,
    /// Update
    Update,
    /// Delete
    Delete,
    /// Anything else
    Other,
}

impl OpKind {
    /// Lowercase name, as used in stat output
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Query => "query",
            Self::GetMore => "getmore",
            Self::Reply => "reply",
            Self::KillCursors => "killcursors",
            Self::Command => "command",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the replay engine needs from a server response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplySummary {
    /// Cursor id left open by the server (0 when exhausted or absent)
    pub cursor_id: i64,
    /// Documents in the returned batch
    pub number_returned: i32,
    /// The server flagged the request as failed
    pub failed: bool,
}

/// One complete wire frame, header included
#[derive(Clone, PartialEq, Eq)]
pub struct RawOp {
    header: MsgHeader,
    frame: Bytes,
}

impl Debug for RawOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawOp")
            .field("op_code", &self.header.op_code)
            .field("request_id", &self.header.request_id)
            .field("response_to", &self.header.response_to)
            .field("len", &self.frame.len())
            .finish()
    }
}

impl RawOp {
    /// Wrap a complete frame
    ///
    /// # Errors
    ///
    /// Returns error if the header is invalid or disagrees with the frame length
    pub fn from_bytes(frame: Bytes) -> Result<Self> {
        let header = MsgHeader::parse(&frame)?;
        let len = header.frame_len()?;
        if len != frame.len() {
            return Err(ReplayError::InvalidFrame(format!(
                "Header declares {len} bytes, frame holds {}",
                frame.len()
            )));
        }
        Ok(Self { header, frame })
    }

    /// Decoded header
    #[must_use]
    pub fn header(&self) -> &MsgHeader {
        &self.header
    }

    /// Opcode
    #[must_use]
    pub fn op_code(&self) -> OpCode {
        self.header.op_code
    }

    /// Whole frame as sent on the wire
    #[must_use]
    pub fn as_bytes(&self) -> &Bytes {
        &self.frame
    }

    /// Frame length
    #[must_use]
    pub fn len(&self) -> usize {
        self.frame.len()
    }

    /// A frame always carries at least a header
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    fn body(&self) -> &[u8] {
        &self.frame[HEADER_LEN..]
    }

    /// Stat-facing operation type
    #[must_use]
    pub fn kind(&self) -> OpKind {
        match self.header.op_code {
            OpCode::Insert => OpKind::Insert,
            OpCode::Query => {
                if self.is_command_namespace() {
                    OpKind::Command
                } else {
                    OpKind::Query
                }
            }
            OpCode::GetMore => OpKind::GetMore,
            OpCode::Reply | OpCode::CommandReply => OpKind::Reply,
            OpCode::KillCursors => OpKind::KillCursors,
            OpCode::Command | OpCode::Msg => OpKind::Command,
            OpCode::Update => OpKind::Update,
            OpCode::Delete => OpKind::Delete,
            OpCode::Unknown(_) => OpKind::Other,
        }
    }

    fn is_command_namespace(&self) -> bool {
        self.namespace()
            .is_some_and(|ns| ns.ends_with(".$cmd"))
    }

    /// Target namespace (`db.collection`, or `db.$cmd` for commands)
    #[must_use]
    pub fn namespace(&self) -> Option<String> {
        let body = self.body();
        match self.header.op_code {
            OpCode::Insert
            | OpCode::Query
            | OpCode::GetMore
            | OpCode::Update
            | OpCode::Delete => read_cstr(body, 4).ok().map(|(ns, _)| ns.to_string()),
            OpCode::Command => read_cstr(body, 0).ok().map(|(db, _)| format!("{db}.$cmd")),
            OpCode::Msg => {
                let doc = self.msg_body_document().ok()?;
                let db = doc.get_str("$db").ok()?;
                Some(format!("{db}.$cmd"))
            }
            _ => None,
        }
    }

    /// Command name for command-shaped operations
    #[must_use]
    pub fn command_name(&self) -> Option<String> {
        match self.header.op_code {
            OpCode::Query if self.is_command_namespace() => {
                let doc = self.query_document().ok()?;
                first_command_key(&doc)
            }
            OpCode::Command => {
                let (_, next) = read_cstr(self.body(), 0).ok()?;
                read_cstr(self.body(), next).ok().map(|(name, _)| name.to_string())
            }
            OpCode::Msg => {
                let doc = self.msg_body_document().ok()?;
                doc.keys().next().cloned()
            }
            _ => None,
        }
    }

    /// Query document of an OP_QUERY
    ///
    /// # Errors
    ///
    /// Returns error if this is not a query or the document is malformed
    pub fn query_document(&self) -> Result<Document> {
        if self.header.op_code != OpCode::Query {
            return Err(ReplayError::InvalidFrame(format!(
                "{:?} has no query document",
                self.header.op_code
            )));
        }
        let (_, next) = read_cstr(self.body(), 4)?;
        read_document(self.body(), next + 8).map(|(doc, _)| doc)
    }

    /// `numberToReturn` of a query or getmore
    #[must_use]
    pub fn number_to_return(&self) -> Option<i32> {
        let (_, next) = read_cstr(self.body(), 4).ok()?;
        match self.header.op_code {
            OpCode::Query => read_i32(self.body(), next + 4).ok(),
            OpCode::GetMore => read_i32(self.body(), next).ok(),
            _ => None,
        }
    }

    fn msg_body_document(&self) -> Result<Document> {
        let body = self.body();
        let flags = read_u32(body, 0)?;
        let end = if flags & MSG_CHECKSUM_PRESENT == 0 {
            body.len()
        } else {
            body.len().saturating_sub(4)
        };

        let mut pos = 4;
        while pos < end {
            let kind = body[pos];
            pos += 1;
            match kind {
                0 => return read_document(body, pos).map(|(doc, _)| doc),
                1 => {
                    let size = usize::try_from(read_i32(body, pos)?).map_err(|_| {
                        ReplayError::InvalidFrame("Negative OP_MSG section size".to_string())
                    })?;
                    pos += size;
                }
                other => {
                    return Err(ReplayError::InvalidFrame(format!(
                        "Unknown OP_MSG section kind {other}"
                    )))
                }
            }
        }
        Err(ReplayError::InvalidFrame(
            "OP_MSG without a body section".to_string(),
        ))
    }

    /// Absolute offsets of every cursor-id field in the frame
    fn cursor_offsets(&self) -> Result<Vec<usize>> {
        let body = self.body();
        let offsets = match self.header.op_code {
            OpCode::GetMore => {
                let (_, next) = read_cstr(body, 4)?;
                vec![next + 4]
            }
            OpCode::KillCursors => {
                let count = usize::try_from(read_i32(body, 4)?).map_err(|_| {
                    ReplayError::InvalidFrame("Negative kill-cursors count".to_string())
                })?;
                let needed = count.checked_mul(8).and_then(|ids| ids.checked_add(8));
                if !needed.is_some_and(|needed| needed <= body.len()) {
                    return Err(ReplayError::InvalidFrame(format!(
                        "Kill-cursors declares {count} ids in a body of {} bytes",
                        body.len()
                    )));
                }
                (0..count).map(|i| 8 + i * 8).collect()
            }
            OpCode::Reply => vec![4],
            _ => Vec::new(),
        };

        if let Some(last) = offsets.last() {
            if last + 8 > body.len() {
                return Err(ReplayError::InvalidFrame(format!(
                    "Cursor field at {last} overruns {:?} body of {} bytes",
                    self.header.op_code,
                    body.len()
                )));
            }
        }
        Ok(offsets.into_iter().map(|off| off + HEADER_LEN).collect())
    }

    /// Cursor ids carried by a getmore, kill-cursors or reply frame
    ///
    /// # Errors
    ///
    /// Returns error if a cursor field lies outside the frame
    pub fn cursor_ids(&self) -> Result<Vec<i64>> {
        self.cursor_offsets()?
            .into_iter()
            .map(|off| read_i64(&self.frame, off))
            .collect()
    }

    /// Copy of this frame with its cursor-id fields replaced.
    ///
    /// Only the cursor fields change; the length and every other byte are
    /// preserved.
    ///
    /// # Errors
    ///
    /// Returns error if `ids` does not match the number of cursor fields
    pub fn with_cursor_ids(&self, ids: &[i64]) -> Result<Self> {
        let offsets = self.cursor_offsets()?;
        if offsets.len() != ids.len() {
            return Err(ReplayError::InvalidFrame(format!(
                "{:?} carries {} cursor ids, {} given",
                self.header.op_code,
                offsets.len(),
                ids.len()
            )));
        }

        let mut buf = BytesMut::from(&self.frame[..]);
        for (off, id) in offsets.into_iter().zip(ids) {
            buf[off..off + 8].copy_from_slice(&id.to_le_bytes());
        }

        Ok(Self {
            header: self.header,
            frame: buf.freeze(),
        })
    }

    /// Fields of a server response the replay engine acts on
    ///
    /// # Errors
    ///
    /// Returns error if this is not a response frame or it is truncated
    pub fn reply_summary(&self) -> Result<ReplySummary> {
        let body = self.body();
        match self.header.op_code {
            OpCode::Reply => {
                let flags = read_i32(body, 0)?;
                Ok(ReplySummary {
                    cursor_id: read_i64(body, 4)?,
                    number_returned: read_i32(body, 16)?,
                    failed: flags & (REPLY_CURSOR_NOT_FOUND | REPLY_QUERY_FAILURE) != 0,
                })
            }
            OpCode::Msg => Ok(summarize_command_reply(&self.msg_body_document()?)),
            OpCode::CommandReply => {
                let (first, next) = read_document(body, 0)?;
                if first.contains_key("ok") {
                    return Ok(summarize_command_reply(&first));
                }
                let (second, _) = read_document(body, next)?;
                Ok(summarize_command_reply(&second))
            }
            other => Err(ReplayError::InvalidFrame(format!(
                "{other:?} is not a response"
            ))),
        }
    }

    /// Result document of a command response
    ///
    /// # Errors
    ///
    /// Returns error if this is not a response frame or it carries no document
    pub fn reply_document(&self) -> Result<Document> {
        let body = self.body();
        match self.header.op_code {
            OpCode::Reply => {
                if read_i32(body, 16)? < 1 {
                    return Err(ReplayError::InvalidFrame(
                        "Reply carries no document".to_string(),
                    ));
                }
                read_document(body, 20).map(|(doc, _)| doc)
            }
            OpCode::Msg => self.msg_body_document(),
            OpCode::CommandReply => read_document(body, 0).map(|(doc, _)| doc),
            other => Err(ReplayError::InvalidFrame(format!(
                "{other:?} is not a response"
            ))),
        }
    }
}

/// First key of a command document, looking through a `$query` wrapper
fn first_command_key(doc: &Document) -> Option<String> {
    let first = doc.keys().next()?;
    if first == "$query" || first == "query" {
        if let Ok(inner) = doc.get_document(first) {
            return inner.keys().next().cloned();
        }
    }
    Some(first.clone())
}

fn summarize_command_reply(doc: &Document) -> ReplySummary {
    let failed = match doc.get("ok") {
        Some(Bson::Double(ok)) => *ok == 0.0,
        Some(Bson::Int32(ok)) => *ok == 0,
        Some(Bson::Int64(ok)) => *ok == 0,
        Some(Bson::Boolean(ok)) => !ok,
        _ => false,
    };

    let mut summary = ReplySummary {
        failed,
        ..ReplySummary::default()
    };

    if let Ok(cursor) = doc.get_document("cursor") {
        summary.cursor_id = cursor.get_i64("id").unwrap_or_default();
        let batch = cursor
            .get_array("firstBatch")
            .or_else(|_| cursor.get_array("nextBatch"));
        if let Ok(batch) = batch {
            summary.number_returned = i32::try_from(batch.len()).unwrap_or(i32::MAX);
        }
    }
    summary
}

fn truncated(at: usize) -> ReplayError {
    ReplayError::InvalidFrame(format!("Frame truncated at offset {at}"))
}

pub(crate) fn read_i32(buf: &[u8], at: usize) -> Result<i32> {
    buf.get(at..at + 4)
        .map(|mut b| b.get_i32_le())
        .ok_or_else(|| truncated(at))
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32> {
    buf.get(at..at + 4)
        .map(|mut b| b.get_u32_le())
        .ok_or_else(|| truncated(at))
}

pub(crate) fn read_i64(buf: &[u8], at: usize) -> Result<i64> {
    buf.get(at..at + 8)
        .map(|mut b| b.get_i64_le())
        .ok_or_else(|| truncated(at))
}

/// Read a NUL-terminated string; returns it and the offset just past the NUL
pub(crate) fn read_cstr(buf: &[u8], at: usize) -> Result<(&str, usize)> {
    let rest = buf.get(at..).ok_or_else(|| truncated(at))?;
    let nul = rest
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| ReplayError::InvalidFrame(format!("Unterminated string at {at}")))?;
    let s = std::str::from_utf8(&rest[..nul])
        .map_err(|e| ReplayError::InvalidFrame(format!("String at {at} is not UTF-8: {e}")))?;
    Ok((s, at + nul + 1))
}

/// Read one BSON document; returns it and the offset just past it
pub(crate) fn read_document(buf: &[u8], at: usize) -> Result<(Document, usize)> {
    let len = usize::try_from(read_i32(buf, at)?)
        .map_err(|_| ReplayError::InvalidFrame(format!("Negative document length at {at}")))?;
    let mut raw = buf.get(at..at + len).ok_or_else(|| truncated(at))?;
    let doc = Document::from_reader(&mut raw)
        .map_err(|e| ReplayError::InvalidFrame(format!("Bad document at {at}: {e}")))?;
    Ok((doc, at + len))
}
