//! Captured operations as delivered to the replay engine

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use crate::wire::{OpCode, RawOp};

/// Opaque identifier of one end of a captured connection (usually `host:port`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(Arc<str>);

impl Endpoint {
    /// Endpoint as a string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Endpoint {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for Endpoint {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One captured wire operation.
///
/// Immutable once built; the replay engine derives rewritten copies of the
/// frame for transmission and never touches the record itself.
#[derive(Debug, Clone)]
pub struct RecordedOp {
    raw: RawOp,
    seen: SystemTime,
    src: Endpoint,
    dst: Endpoint,
}

impl RecordedOp {
    /// Create a record
    #[must_use]
    pub fn new(
        raw: RawOp,
        seen: SystemTime,
        src: impl Into<Endpoint>,
        dst: impl Into<Endpoint>,
    ) -> Self {
        Self {
            raw,
            seen,
            src: src.into(),
            dst: dst.into(),
        }
    }

    /// Captured frame
    #[must_use]
    pub fn raw(&self) -> &RawOp {
        &self.raw
    }

    /// Capture timestamp
    #[must_use]
    pub fn seen(&self) -> SystemTime {
        self.seen
    }

    /// Sender of the captured frame
    #[must_use]
    pub fn src(&self) -> &Endpoint {
        &self.src
    }

    /// Receiver of the captured frame
    #[must_use]
    pub fn dst(&self) -> &Endpoint {
        &self.dst
    }

    /// Opcode of the captured frame
    #[must_use]
    pub fn op_code(&self) -> OpCode {
        self.raw.header().op_code
    }

    /// Request id assigned by the original sender
    #[must_use]
    pub fn request_id(&self) -> i32 {
        self.raw.header().request_id
    }

    /// Request id this frame answers
    #[must_use]
    pub fn response_to(&self) -> i32 {
        self.raw.header().response_to
    }

    /// Whether this frame was sent by the server.
    ///
    /// Clients always send `responseTo = 0`, so any frame answering a request
    /// id is a response even when its opcode (OP_MSG) is shared by both sides.
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.op_code().is_response() || self.response_to() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::build;
    use bson::doc;

    #[test]
    fn test_recorded_op_accessors() {
        let raw = build::insert(11, "mongotape.test", &[doc! { "a": 1 }]).unwrap();
        let seen = SystemTime::now();
        let op = RecordedOp::new(raw, seen, "10.0.0.1:5000", "10.0.0.2:27017");

        assert_eq!(op.request_id(), 11);
        assert_eq!(op.response_to(), 0);
        assert_eq!(op.op_code(), OpCode::Insert);
        assert_eq!(op.src().as_str(), "10.0.0.1:5000");
        assert_eq!(op.dst().to_string(), "10.0.0.2:27017");
        assert_eq!(op.seen(), seen);
        assert!(!op.is_response());
    }
}
