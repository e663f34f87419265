//! Minimal MongoDB wire support.
//!
//! Reads the fixed fields the replay engine acts on (header, namespace,
//! command name, cursor ids, reply counts) and rewrites cursor ids in place.
//! Everything else in a frame is carried verbatim.

pub mod build;
mod frame;
mod header;

pub use frame::{
    OpKind, RawOp, ReplySummary, REPLY_CURSOR_NOT_FOUND, REPLY_QUERY_FAILURE,
};
pub(crate) use frame::{read_cstr, read_document, read_i32};
pub use header::{MsgHeader, OpCode, HEADER_LEN, MAX_MESSAGE_SIZE};
