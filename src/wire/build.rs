//! Frame builders for the legacy opcodes.
//!
//! Used by the stub server to answer requests and by tests to fabricate
//! recorded traffic.

use bson::Document;
use bytes::{BufMut, BytesMut};

use crate::{ReplayError, Result};

use super::frame::RawOp;
use super::header::{MsgHeader, OpCode, HEADER_LEN};

/// Incrementally built frame; the length is patched in by [`FrameBuilder::finish`]
pub struct FrameBuilder {
    buf: BytesMut,
}

impl FrameBuilder {
    /// Start a frame with the given header fields
    #[must_use]
    pub fn new(op_code: OpCode, request_id: i32, response_to: i32) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        MsgHeader {
            message_length: 0,
            request_id,
            response_to,
            op_code,
        }
        .write_to(&mut buf);
        Self { buf }
    }

    /// Append one byte
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    /// Append a little-endian i32
    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32_le(value);
        self
    }

    /// Append a little-endian i64
    pub fn put_i64(&mut self, value: i64) -> &mut Self {
        self.buf.put_i64_le(value);
        self
    }

    /// Append a NUL-terminated string
    pub fn put_cstr(&mut self, value: &str) -> &mut Self {
        self.buf.put_slice(value.as_bytes());
        self.buf.put_u8(0);
        self
    }

    /// Append a BSON document
    ///
    /// # Errors
    ///
    /// Returns error if the document cannot be serialized
    pub fn put_document(&mut self, doc: &Document) -> Result<&mut Self> {
        let mut raw = Vec::new();
        doc.to_writer(&mut raw)
            .map_err(|e| ReplayError::InvalidFrame(format!("Failed to encode document: {e}")))?;
        self.buf.put_slice(&raw);
        Ok(self)
    }

    /// Patch the length and produce the frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame exceeds protocol limits
    pub fn finish(mut self) -> Result<RawOp> {
        let len = i32::try_from(self.buf.len()).map_err(|_| {
            ReplayError::InvalidFrame(format!("Frame of {} bytes too large", self.buf.len()))
        })?;
        self.buf[..4].copy_from_slice(&len.to_le_bytes());
        debug_assert!(self.buf.len() >= HEADER_LEN);
        RawOp::from_bytes(self.buf.freeze())
    }
}

/// OP_INSERT
///
/// # Errors
///
/// Returns error if a document cannot be serialized
pub fn insert(request_id: i32, ns: &str, docs: &[Document]) -> Result<RawOp> {
    let mut frame = FrameBuilder::new(OpCode::Insert, request_id, 0);
    frame.put_i32(0).put_cstr(ns);
    for doc in docs {
        frame.put_document(doc)?;
    }
    frame.finish()
}

/// OP_QUERY
///
/// # Errors
///
/// Returns error if the query cannot be serialized
pub fn query(request_id: i32, ns: &str, skip: i32, limit: i32, query: &Document) -> Result<RawOp> {
    let mut frame = FrameBuilder::new(OpCode::Query, request_id, 0);
    frame.put_i32(0).put_cstr(ns).put_i32(skip).put_i32(limit);
    frame.put_document(query)?;
    frame.finish()
}

/// OP_GET_MORE
///
/// # Errors
///
/// Returns error if the frame cannot be assembled
pub fn get_more(request_id: i32, ns: &str, limit: i32, cursor_id: i64) -> Result<RawOp> {
    let mut frame = FrameBuilder::new(OpCode::GetMore, request_id, 0);
    frame.put_i32(0).put_cstr(ns).put_i32(limit).put_i64(cursor_id);
    frame.finish()
}

/// OP_KILL_CURSORS
///
/// # Errors
///
/// Returns error if the frame cannot be assembled
pub fn kill_cursors(request_id: i32, cursor_ids: &[i64]) -> Result<RawOp> {
    let count = i32::try_from(cursor_ids.len())
        .map_err(|_| ReplayError::InvalidFrame("Too many cursor ids".to_string()))?;
    let mut frame = FrameBuilder::new(OpCode::KillCursors, request_id, 0);
    frame.put_i32(0).put_i32(count);
    for id in cursor_ids {
        frame.put_i64(*id);
    }
    frame.finish()
}

/// OP_REPLY
///
/// # Errors
///
/// Returns error if a document cannot be serialized
pub fn reply(
    request_id: i32,
    response_to: i32,
    flags: i32,
    cursor_id: i64,
    starting_from: i32,
    docs: &[Document],
) -> Result<RawOp> {
    let count = i32::try_from(docs.len())
        .map_err(|_| ReplayError::InvalidFrame("Too many reply documents".to_string()))?;
    let mut frame = FrameBuilder::new(OpCode::Reply, request_id, response_to);
    frame
        .put_i32(flags)
        .put_i64(cursor_id)
        .put_i32(starting_from)
        .put_i32(count);
    for doc in docs {
        frame.put_document(doc)?;
    }
    frame.finish()
}

/// OP_COMMAND
///
/// # Errors
///
/// Returns error if a document cannot be serialized
pub fn command(request_id: i32, db: &str, name: &str, args: &Document) -> Result<RawOp> {
    let mut frame = FrameBuilder::new(OpCode::Command, request_id, 0);
    frame.put_cstr(db).put_cstr(name);
    frame.put_document(&Document::new())?;
    frame.put_document(args)?;
    frame.finish()
}

/// OP_COMMAND_REPLY with empty metadata
///
/// # Errors
///
/// Returns error if the reply cannot be serialized
pub fn command_reply(request_id: i32, response_to: i32, reply: &Document) -> Result<RawOp> {
    let mut frame = FrameBuilder::new(OpCode::CommandReply, request_id, response_to);
    frame.put_document(reply)?;
    frame.put_document(&Document::new())?;
    frame.finish()
}

/// OP_MSG with a single body section
///
/// # Errors
///
/// Returns error if the body cannot be serialized
pub fn msg(request_id: i32, response_to: i32, body: &Document) -> Result<RawOp> {
    let mut frame = FrameBuilder::new(OpCode::Msg, request_id, response_to);
    frame.put_i32(0).put_u8(0);
    frame.put_document(body)?;
    frame.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::OpKind;
    use bson::doc;

    #[test]
    fn test_builder_patches_length() {
        let op = insert(1, "db.coll", &[doc! { "a": 1 }, doc! { "b": 2 }]).unwrap();
        assert_eq!(
            usize::try_from(op.header().message_length).unwrap(),
            op.len()
        );
        assert_eq!(op.header().request_id, 1);
    }

    #[test]
    fn test_command_frame() {
        let op = command(3, "admin", "ping", &doc! { "ping": 1 }).unwrap();
        assert_eq!(op.kind(), OpKind::Command);
        assert_eq!(op.namespace().as_deref(), Some("admin.$cmd"));
        assert_eq!(op.command_name().as_deref(), Some("ping"));
        assert!(op.op_code().expects_reply());
    }

    #[test]
    fn test_msg_frame() {
        let op = msg(5, 0, &doc! { "find": "coll", "$db": "shop" }).unwrap();
        assert_eq!(op.kind(), OpKind::Command);
        assert_eq!(op.namespace().as_deref(), Some("shop.$cmd"));
        assert_eq!(op.command_name().as_deref(), Some("find"));

        let answer = msg(
            9,
            5,
            &doc! { "cursor": { "id": 44_i64, "firstBatch": [ { "a": 1 }, { "a": 2 } ] }, "ok": 1.0 },
        )
        .unwrap();
        let summary = answer.reply_summary().unwrap();
        assert_eq!(summary.cursor_id, 44);
        assert_eq!(summary.number_returned, 2);
        assert!(!summary.failed);
    }

    #[test]
    fn test_command_reply_failure() {
        let answer = command_reply(2, 1, &doc! { "ok": 0, "errmsg": "no" }).unwrap();
        assert!(answer.reply_summary().unwrap().failed);
    }

    #[test]
    fn test_query_frame_document() {
        let op = query(4, "db.coll", 0, 5, &doc! { "name": "x" }).unwrap();
        assert_eq!(op.query_document().unwrap(), doc! { "name": "x" });
        assert_eq!(op.number_to_return(), Some(5));
        assert_eq!(op.kind(), OpKind::Query);
    }
}
