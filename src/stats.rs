//! Stat records and the sinks that consume them

use std::io::Write;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use tracing::{info, warn};

use crate::error::OpErrorKind;
use crate::wire::OpKind;

/// Audit record for one replayed operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpStat {
    /// Lane the operation was replayed on
    pub lane: String,
    /// Position of the operation within its lane, starting at 0
    pub seq: u64,
    /// Operation type
    pub op_type: OpKind,
    /// Target namespace
    pub ns: Option<String>,
    /// Command name for command-shaped operations
    pub command: Option<String>,
    /// Documents returned by the live server (query, getmore, command)
    pub num_returned: i32,
    /// Time from transmit to response (or to write completion)
    #[serde(rename = "latency_us", serialize_with = "serialize_micros")]
    pub latency: Duration,
    /// Request id from the recording
    pub request_id: i32,
    /// Wall-clock time the operation was issued
    pub played_at: SystemTime,
    /// Why the operation failed, if it did
    pub error: Option<OpErrorKind>,
    /// A cursor id had no live binding and was sent verbatim
    pub translation_miss: bool,
}

impl OpStat {
    /// Whether the operation completed without error
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

fn serialize_micros<S: Serializer>(latency: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(latency.as_micros()).unwrap_or(u64::MAX))
}

/// Consumer of stat records.
///
/// Called concurrently from every lane; each lane delivers its own records
/// in issue order.
pub trait StatSink: Send + Sync {
    /// Accept one record
    fn record(&self, stat: OpStat);
}

/// Keeps every record in memory, in arrival order
#[derive(Debug, Default)]
pub struct BufferedStatSink {
    buffer: Mutex<Vec<OpStat>>,
}

impl BufferedStatSink {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record received so far
    #[must_use]
    pub fn snapshot(&self) -> Vec<OpStat> {
        self.buffer.lock().clone()
    }

    /// Records of one lane, in lane order
    #[must_use]
    pub fn for_lane(&self, lane: &str) -> Vec<OpStat> {
        self.buffer
            .lock()
            .iter()
            .filter(|stat| stat.lane == lane)
            .cloned()
            .collect()
    }

    /// Number of records received
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Whether nothing was received
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StatSink for BufferedStatSink {
    fn record(&self, stat: OpStat) {
        self.buffer.lock().push(stat);
    }
}

/// Writes one JSON object per line
pub struct JsonStatSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonStatSink<W> {
    /// Wrap a writer
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the writer
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> StatSink for JsonStatSink<W> {
    fn record(&self, stat: OpStat) {
        let mut writer = self.writer.lock();
        let result = serde_json::to_writer(&mut *writer, &stat)
            .map_err(std::io::Error::from)
            .and_then(|()| writer.write_all(b"\n"));
        if let Err(e) = result {
            warn!("Failed to write stat record: {e}");
        }
    }
}

/// Emits one `tracing` event per record
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatSink;

impl StatSink for TracingStatSink {
    fn record(&self, stat: OpStat) {
        info!(
            target: "mongotape::stats",
            lane = %stat.lane,
            seq = stat.seq,
            op = %stat.op_type,
            ns = stat.ns.as_deref().unwrap_or(""),
            command = stat.command.as_deref().unwrap_or(""),
            returned = stat.num_returned,
            latency_us = u64::try_from(stat.latency.as_micros()).unwrap_or(u64::MAX),
            error = stat.error.map_or("", |e| e.as_str()),
            "played"
        );
    }
}
