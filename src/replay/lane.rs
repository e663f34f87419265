//! Lane worker: replays one captured connection over one live connection

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::cursor::{CursorMissPolicy, CursorTranslator, LaneCursors};
use crate::error::OpErrorKind;
use crate::network::{authenticate, Connector, Credentials, LanePool, WireConnection};
use crate::record::RecordedOp;
use crate::router::LaneId;
use crate::stats::{OpStat, StatSink};
use crate::throttle::{LaneClock, SpeedThrottle};
use crate::wire::{OpCode, RawOp, ReplySummary};
use crate::ReplayError;

use super::cancel::CancelSignal;

/// Lane lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneState {
    /// Created, waiting for its predecessor or a slot
    Idle,
    /// Opening the live connection
    Connecting,
    /// Connected, waiting for the next operation
    Ready,
    /// Writing an operation
    Issuing,
    /// Waiting for the server's reply
    AwaitingResponse,
    /// No more operations will be issued
    Draining,
    /// Connection closed, bindings released
    Closed,
}

/// Why a lane stopped issuing before its stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneAbort {
    /// The live connection could not be opened
    ConnectFailed,
    /// The live connection broke mid-run
    ConnectionLost,
    /// Too many operations failed in a row
    ConsecutiveFailures,
}

/// Lane notifications consumed by the player
#[derive(Debug)]
pub enum LaneEvent {
    /// A lane opened its live connection
    Connected(LaneId),
    /// A lane could not open its live connection
    ConnectFailed {
        /// Lane that failed
        lane: LaneId,
        /// Connect error
        error: io::Error,
    },
    /// A lane closed early
    Aborted {
        /// Lane that closed
        lane: LaneId,
        /// Why it closed
        reason: LaneAbort,
    },
}

/// Final accounting of one lane worker
#[derive(Debug, Clone)]
pub struct LaneReport {
    /// Lane identity
    pub lane: LaneId,
    /// The worker tried to open a connection
    pub connect_attempted: bool,
    /// The worker opened a connection
    pub connected: bool,
    /// Stat records emitted
    pub played: u64,
    /// Stat records carrying an error
    pub failed: u64,
    /// Operations dropped without a stat record (cancellation)
    pub skipped: u64,
    /// Operations sent with an unbound cursor id
    pub translation_misses: u64,
    /// Set when the lane closed early
    pub abort: Option<LaneAbort>,
    /// The worker gave its slot to a waiting lane
    pub yielded: bool,
}

impl LaneReport {
    fn new(lane: LaneId) -> Self {
        Self {
            lane,
            connect_attempted: false,
            connected: false,
            played: 0,
            failed: 0,
            skipped: 0,
            translation_misses: 0,
            abort: None,
            yielded: false,
        }
    }
}

/// Per-lane tunables
#[derive(Debug, Clone, Copy)]
pub(crate) struct LaneSettings {
    pub(crate) throttle: SpeedThrottle,
    pub(crate) response_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) max_consecutive_failures: u32,
    pub(crate) cursor_miss: CursorMissPolicy,
}

/// State shared by every lane of one run
pub(crate) struct LaneContext<C: Connector> {
    pub(crate) connector: Arc<C>,
    pub(crate) addr: String,
    pub(crate) sink: Arc<dyn StatSink>,
    pub(crate) pool: LanePool,
    pub(crate) cancel: CancelSignal,
    pub(crate) events: mpsc::UnboundedSender<LaneEvent>,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) settings: LaneSettings,
}

enum Flow {
    Continue,
    Cancelled,
    Abort(LaneAbort),
}

struct Outcome {
    played_at: SystemTime,
    latency: Duration,
    num_returned: i32,
    error: Option<OpErrorKind>,
    translation_miss: bool,
}

impl Outcome {
    fn failed(error: OpErrorKind, played_at: SystemTime, translation_miss: bool) -> Self {
        Self {
            played_at,
            latency: Duration::ZERO,
            num_returned: 0,
            error: Some(error),
            translation_miss,
        }
    }
}

/// Errors after which the connection can no longer be trusted
fn is_link_lost(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WriteZero
    )
}

/// Lane state handed from a worker that yielded its slot to the worker that
/// takes the lane over. Live cursors outlive the connection that opened them.
pub(crate) struct LaneCarry {
    cursors: Box<dyn CursorTranslator>,
    live_cursors: HashMap<i32, i64>,
    clock: LaneClock,
    seq: u64,
    consecutive_failures: u32,
}

/// Replays the operations of one lane, strictly in order, one at a time
pub(crate) struct LaneWorker<C: Connector> {
    lane: LaneId,
    label: String,
    ctx: Arc<LaneContext<C>>,
    rx: mpsc::Receiver<RecordedOp>,
    cursors: Box<dyn CursorTranslator>,
    clock: LaneClock,
    state: LaneState,
    seq: u64,
    consecutive_failures: u32,
    /// Live cursor left open by each request, keyed by recorded request id,
    /// until the recorded reply to that request shows up
    live_cursors: HashMap<i32, i64>,
    report: LaneReport,
    handoff: Option<oneshot::Sender<LaneCarry>>,
}

impl<C: Connector> LaneWorker<C> {
    pub(crate) fn new(
        lane: LaneId,
        ctx: Arc<LaneContext<C>>,
        rx: mpsc::Receiver<RecordedOp>,
        cursors: Box<dyn CursorTranslator>,
        handoff: oneshot::Sender<LaneCarry>,
    ) -> Self {
        Self {
            label: lane.to_string(),
            report: LaneReport::new(lane.clone()),
            lane,
            ctx,
            rx,
            cursors,
            clock: LaneClock::new(),
            state: LaneState::Idle,
            seq: 0,
            consecutive_failures: 0,
            live_cursors: HashMap::new(),
            handoff: Some(handoff),
        }
    }

    fn transition(&mut self, next: LaneState) {
        trace!(lane = %self.label, from = ?self.state, to = ?next, "Lane state");
        self.state = next;
    }

    /// Run the lane to completion.
    ///
    /// `predecessor` resolves when an earlier worker for the same lane has
    /// closed; nothing is issued before that. A predecessor that yielded its
    /// slot passes its cursor bindings, pacing and sequence on.
    pub(crate) async fn run(mut self, predecessor: Option<oneshot::Receiver<LaneCarry>>) -> LaneReport {
        let ctx = Arc::clone(&self.ctx);
        let cancel = ctx.cancel.clone();

        if let Some(predecessor) = predecessor {
            let carried = tokio::select! {
                carried = predecessor => carried.ok(),
                () = cancel.cancelled() => return self.finish_cancelled(),
            };
            if let Some(carry) = carried {
                self.resume(carry);
            }
        }

        self.transition(LaneState::Connecting);
        self.report.connect_attempted = true;

        let guard = tokio::select! {
            guard = ctx.pool.acquire() => guard,
            () = cancel.cancelled() => return self.finish_cancelled(),
        };
        let guard = match guard {
            Ok(guard) => guard,
            Err(e) => {
                warn!(lane = %self.label, "No lane slot: {e}");
                return self.abort_lane(LaneAbort::ConnectFailed).await;
            }
        };

        let connected = tokio::select! {
            result = timeout(ctx.settings.connect_timeout, ctx.connector.connect(&ctx.addr)) => result,
            () = cancel.cancelled() => return self.finish_cancelled(),
        };
        let stream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(lane = %self.label, "Failed to connect to {}: {e}", ctx.addr);
                drop(guard);
                return self.connect_failed(e).await;
            }
            Err(_) => {
                warn!(
                    lane = %self.label,
                    "Timed out connecting to {} after {:?}",
                    ctx.addr,
                    ctx.settings.connect_timeout
                );
                drop(guard);
                let e = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
                return self.connect_failed(e).await;
            }
        };

        let mut conn = WireConnection::new(stream);

        if let Some(credentials) = ctx.credentials.as_ref() {
            let authenticated = tokio::select! {
                result = timeout(ctx.settings.connect_timeout, authenticate(&mut conn, credentials)) => result,
                () = cancel.cancelled() => return self.finish_cancelled(),
            };
            let rejected = match authenticated {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("authentication timed out".to_string()),
            };
            if let Some(reason) = rejected {
                warn!(
                    lane = %self.label,
                    "Could not authenticate as {}: {reason}",
                    credentials.username
                );
                drop(conn);
                drop(guard);
                let e = io::Error::new(io::ErrorKind::PermissionDenied, reason);
                return self.connect_failed(e).await;
            }
        }

        self.report.connected = true;
        let _ = ctx.events.send(LaneEvent::Connected(self.lane.clone()));
        debug!(lane = %self.label, "Lane connected to {}", ctx.addr);

        self.transition(LaneState::Ready);

        let flow = self.pump(&mut conn).await;

        self.transition(LaneState::Draining);
        let handing_off = matches!(flow, Flow::Continue) && self.report.yielded;
        if !handing_off {
            self.cursors.release_lane(&self.lane);
            self.live_cursors.clear();
        }
        if let Err(e) = conn.shutdown().await {
            debug!(lane = %self.label, "Connection shutdown failed: {e}");
        }
        drop(conn);
        drop(guard);

        match flow {
            Flow::Continue if handing_off => {
                self.hand_off();
                self.finish()
            }
            Flow::Continue => self.finish(),
            Flow::Cancelled => self.finish_cancelled(),
            Flow::Abort(reason) => self.abort_lane(reason).await,
        }
    }

    /// Issue queued operations until the queue closes, the lane yields its
    /// slot, or something stops the lane
    async fn pump(&mut self, conn: &mut WireConnection<C::Stream>) -> Flow {
        let ctx = Arc::clone(&self.ctx);
        let cancel = ctx.cancel.clone();

        loop {
            if cancel.is_cancelled() {
                return Flow::Cancelled;
            }

            let op = match self.rx.try_recv() {
                Ok(op) => op,
                Err(TryRecvError::Disconnected) => return Flow::Continue,
                Err(TryRecvError::Empty) => {
                    let contended = ctx.pool.contended();

                    if !self.report.yielded && ctx.pool.has_waiters() {
                        debug!(lane = %self.label, "Queue empty, yielding slot to a waiting lane");
                        self.report.yielded = true;
                        self.rx.close();
                    }

                    if self.report.yielded {
                        tokio::select! {
                            op = self.rx.recv() => match op {
                                Some(op) => op,
                                None => return Flow::Continue,
                            },
                            () = cancel.cancelled() => return Flow::Cancelled,
                        }
                    } else {
                        tokio::select! {
                            op = self.rx.recv() => match op {
                                Some(op) => op,
                                None => return Flow::Continue,
                            },
                            () = cancel.cancelled() => return Flow::Cancelled,
                            () = contended => continue,
                        }
                    }
                }
            };

            match self.execute(conn, op).await {
                Flow::Continue => {}
                other => return other,
            }
        }
    }

    async fn execute(&mut self, conn: &mut WireConnection<C::Stream>, op: RecordedOp) -> Flow {
        if op.is_response() {
            self.correlate(&op);
            return Flow::Continue;
        }

        let cancel = self.ctx.cancel.clone();
        let settings = self.ctx.settings;

        let wait = self
            .clock
            .wait_before(&settings.throttle, op.seen(), std::time::Instant::now());
        if !wait.is_zero() {
            trace!(lane = %self.label, ?wait, "Throttling");
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = cancel.cancelled() => {
                    self.report.skipped += 1;
                    return Flow::Cancelled;
                }
            }
        }

        let (frame, miss) = match self.rewrite(&op) {
            Ok(rewritten) => rewritten,
            Err(kind) => {
                self.emit(&op, Outcome::failed(kind, SystemTime::now(), kind == OpErrorKind::StaleCursor));
                return self.after_failure();
            }
        };

        self.transition(LaneState::Issuing);
        let issued_at = std::time::Instant::now();
        let played_at = SystemTime::now();
        self.clock.issued(op.seen(), issued_at);

        let sent = tokio::select! {
            result = timeout(settings.response_timeout, conn.send(&frame)) => result,
            () = cancel.cancelled() => {
                self.emit(&op, Outcome::failed(OpErrorKind::Cancelled, played_at, miss));
                return Flow::Cancelled;
            }
        };
        let send_error = match sent {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
        };
        if let Some(e) = send_error {
            warn!(lane = %self.label, request_id = op.request_id(), "Transmit failed: {e}");
            self.emit(&op, Outcome::failed(OpErrorKind::Transmit, played_at, miss));
            self.transition(LaneState::Ready);
            if is_link_lost(&e) {
                return Flow::Abort(LaneAbort::ConnectionLost);
            }
            return self.after_failure();
        }

        if !op.op_code().expects_reply() {
            if op.op_code() == OpCode::KillCursors {
                self.release_cursors(&op);
            }
            self.emit(
                &op,
                Outcome {
                    played_at,
                    latency: issued_at.elapsed(),
                    num_returned: 0,
                    error: None,
                    translation_miss: miss,
                },
            );
            self.transition(LaneState::Ready);
            return self.after_success();
        }

        self.transition(LaneState::AwaitingResponse);
        let deadline = Instant::now() + settings.response_timeout;
        let reply = loop {
            let received = tokio::select! {
                result = timeout_at(deadline, conn.recv()) => result,
                () = cancel.cancelled() => {
                    self.emit(&op, Outcome::failed(OpErrorKind::Cancelled, played_at, miss));
                    return Flow::Cancelled;
                }
            };

            match received {
                Err(_) => {
                    warn!(
                        lane = %self.label,
                        request_id = op.request_id(),
                        "No response within {:?}",
                        settings.response_timeout
                    );
                    self.emit(&op, Outcome::failed(OpErrorKind::ResponseTimeout, played_at, miss));
                    self.transition(LaneState::Ready);
                    return self.after_failure();
                }
                Ok(Err(ReplayError::Io(e))) => {
                    warn!(lane = %self.label, request_id = op.request_id(), "Connection lost: {e}");
                    self.emit(&op, Outcome::failed(OpErrorKind::ConnectionClosed, played_at, miss));
                    return Flow::Abort(LaneAbort::ConnectionLost);
                }
                Ok(Err(e)) => {
                    warn!(lane = %self.label, request_id = op.request_id(), "Unreadable response: {e}");
                    self.emit(&op, Outcome::failed(OpErrorKind::MalformedResponse, played_at, miss));
                    return Flow::Abort(LaneAbort::ConnectionLost);
                }
                Ok(Ok(reply)) if reply.header().response_to != op.request_id() => {
                    debug!(
                        lane = %self.label,
                        response_to = reply.header().response_to,
                        "Discarding late reply"
                    );
                }
                Ok(Ok(reply)) => break reply,
            }
        };
        let latency = issued_at.elapsed();

        let summary = match reply.reply_summary() {
            Ok(summary) => summary,
            Err(e) => {
                warn!(lane = %self.label, request_id = op.request_id(), "Malformed reply: {e}");
                self.emit(&op, Outcome::failed(OpErrorKind::MalformedResponse, played_at, miss));
                self.transition(LaneState::Ready);
                return self.after_failure();
            }
        };

        self.on_reply(&op, &summary, miss);
        self.emit(
            &op,
            Outcome {
                played_at,
                latency,
                num_returned: summary.number_returned,
                error: summary.failed.then_some(OpErrorKind::ServerError),
                translation_miss: miss,
            },
        );
        self.transition(LaneState::Ready);

        if summary.failed {
            self.after_failure()
        } else {
            self.after_success()
        }
    }

    fn resume(&mut self, carry: LaneCarry) {
        debug!(
            lane = %self.label,
            seq = carry.seq,
            bindings = carry.cursors.len(),
            "Resuming lane"
        );
        self.cursors = carry.cursors;
        self.live_cursors = carry.live_cursors;
        self.clock = carry.clock;
        self.seq = carry.seq;
        self.consecutive_failures = carry.consecutive_failures;
    }

    /// Pass lane state to the successor created once this worker has closed
    fn hand_off(&mut self) {
        let Some(handoff) = self.handoff.take() else {
            return;
        };

        let carry = LaneCarry {
            cursors: std::mem::replace(&mut self.cursors, Box::new(LaneCursors::new())),
            live_cursors: std::mem::take(&mut self.live_cursors),
            clock: self.clock,
            seq: self.seq,
            consecutive_failures: self.consecutive_failures,
        };

        if let Err(mut carry) = handoff.send(carry) {
            // Nobody will resume this lane
            carry.cursors.release_lane(&self.lane);
        }
    }

    /// Copy of the frame with recorded cursor ids replaced by live ones
    fn rewrite(&mut self, op: &RecordedOp) -> Result<(RawOp, bool), OpErrorKind> {
        if !matches!(op.op_code(), OpCode::GetMore | OpCode::KillCursors) {
            return Ok((op.raw().clone(), false));
        }

        let recorded = op.raw().cursor_ids().map_err(|e| {
            warn!(lane = %self.label, request_id = op.request_id(), "Unreadable cursor ids: {e}");
            OpErrorKind::MalformedRequest
        })?;

        let mut miss = false;
        let live: Vec<i64> = recorded
            .iter()
            .map(|&id| {
                if id == 0 {
                    return 0;
                }
                let lookup = self.cursors.resolve(&self.lane, id);
                miss |= lookup.is_miss();
                lookup.live_id()
            })
            .collect();

        if miss {
            self.report.translation_misses += 1;
            warn!(
                lane = %self.label,
                request_id = op.request_id(),
                cursors = ?recorded,
                "No live binding for recorded cursor"
            );
            if self.ctx.settings.cursor_miss == CursorMissPolicy::Fail {
                return Err(OpErrorKind::StaleCursor);
            }
        }

        if live == recorded {
            return Ok((op.raw().clone(), miss));
        }

        let frame = op.raw().with_cursor_ids(&live).map_err(|e| {
            warn!(lane = %self.label, request_id = op.request_id(), "Cursor rewrite failed: {e}");
            OpErrorKind::MalformedRequest
        })?;
        trace!(lane = %self.label, from = ?recorded, to = ?live, "Rewrote cursor ids");
        Ok((frame, miss))
    }

    fn release_cursors(&mut self, op: &RecordedOp) {
        if let Ok(ids) = op.raw().cursor_ids() {
            for id in ids {
                self.cursors.release(&self.lane, id);
            }
        }
    }

    fn on_reply(&mut self, op: &RecordedOp, summary: &ReplySummary, miss: bool) {
        let continues_binding = op.op_code() == OpCode::GetMore && !miss;
        if continues_binding {
            if summary.cursor_id == 0 {
                self.release_cursors(op);
            }
        } else if summary.cursor_id != 0 {
            self.live_cursors.insert(op.request_id(), summary.cursor_id);
        }
    }

    /// Bind the cursor of a recorded reply to the live cursor of its request
    fn correlate(&mut self, reply: &RecordedOp) {
        let Some(live) = self.live_cursors.remove(&reply.response_to()) else {
            trace!(
                lane = %self.label,
                response_to = reply.response_to(),
                "Recorded reply without an open live cursor"
            );
            return;
        };

        match reply.raw().reply_summary() {
            Ok(recorded) if recorded.cursor_id != 0 => {
                debug!(
                    lane = %self.label,
                    recorded = recorded.cursor_id,
                    live,
                    "Bound cursor"
                );
                self.cursors
                    .record_binding(&self.lane, recorded.cursor_id, live);
            }
            Ok(_) => {}
            Err(e) => warn!(lane = %self.label, "Unreadable recorded reply: {e}"),
        }
    }

    fn emit(&mut self, op: &RecordedOp, outcome: Outcome) {
        let raw = op.raw();
        let stat = OpStat {
            lane: self.label.clone(),
            seq: self.seq,
            op_type: raw.kind(),
            ns: raw.namespace(),
            command: raw.command_name(),
            num_returned: outcome.num_returned,
            latency: outcome.latency,
            request_id: op.request_id(),
            played_at: outcome.played_at,
            error: outcome.error,
            translation_miss: outcome.translation_miss,
        };

        self.seq += 1;
        self.report.played += 1;
        if stat.error.is_some() {
            self.report.failed += 1;
        }

        debug!(
            lane = %self.label,
            seq = stat.seq,
            op = %stat.op_type,
            returned = stat.num_returned,
            error = ?stat.error,
            "Played operation"
        );
        self.ctx.sink.record(stat);
    }

    fn after_success(&mut self) -> Flow {
        self.consecutive_failures = 0;
        Flow::Continue
    }

    fn after_failure(&mut self) -> Flow {
        self.consecutive_failures += 1;
        let limit = self.ctx.settings.max_consecutive_failures;
        if limit > 0 && self.consecutive_failures > limit {
            warn!(
                lane = %self.label,
                "{} consecutive failures, draining lane",
                self.consecutive_failures
            );
            return Flow::Abort(LaneAbort::ConsecutiveFailures);
        }
        Flow::Continue
    }

    async fn connect_failed(self, error: io::Error) -> LaneReport {
        let _ = self.ctx.events.send(LaneEvent::ConnectFailed {
            lane: self.lane.clone(),
            error,
        });
        self.abort_lane(LaneAbort::ConnectFailed).await
    }

    /// Close the lane early. Operations still routed here are reported as
    /// aborted until the stream ends, so the router never blocks on this lane.
    async fn abort_lane(mut self, reason: LaneAbort) -> LaneReport {
        warn!(lane = %self.label, ?reason, "Lane closing early");
        self.report.abort = Some(reason);
        let _ = self.ctx.events.send(LaneEvent::Aborted {
            lane: self.lane.clone(),
            reason,
        });

        self.transition(LaneState::Draining);
        self.cursors.release_lane(&self.lane);
        self.live_cursors.clear();

        let cancel = self.ctx.cancel.clone();
        loop {
            let op = tokio::select! {
                op = self.rx.recv() => op,
                () = cancel.cancelled() => return self.finish_cancelled(),
            };
            let Some(op) = op else { break };
            if !op.is_response() {
                self.emit(
                    &op,
                    Outcome::failed(OpErrorKind::LaneAborted, SystemTime::now(), false),
                );
            }
        }

        self.finish()
    }

    fn finish_cancelled(mut self) -> LaneReport {
        self.rx.close();
        let pending = u64::try_from(self.rx.len()).unwrap_or(u64::MAX);
        self.report.skipped += pending;
        debug!(lane = %self.label, pending, "Lane cancelled");
        self.finish()
    }

    fn finish(mut self) -> LaneReport {
        self.transition(LaneState::Closed);
        info!(
            lane = %self.label,
            played = self.report.played,
            failed = self.report.failed,
            "Lane closed"
        );
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::route;
    use crate::stats::BufferedStatSink;
    use crate::stub::{StubConnector, StubServer};
    use crate::wire::build;
    use bson::doc;

    fn context(
        server: &StubServer,
        sink: Arc<BufferedStatSink>,
    ) -> (Arc<LaneContext<StubConnector>>, mpsc::UnboundedReceiver<LaneEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let ctx = LaneContext {
            connector: Arc::new(server.connector()),
            addr: "stub:27017".to_string(),
            sink,
            pool: LanePool::new(1),
            cancel: CancelSignal::new(),
            events,
            credentials: None,
            settings: LaneSettings {
                throttle: SpeedThrottle::unthrottled(),
                response_timeout: Duration::from_secs(2),
                connect_timeout: Duration::from_secs(1),
                max_consecutive_failures: 0,
                cursor_miss: CursorMissPolicy::PassThrough,
            },
        };
        (Arc::new(ctx), events_rx)
    }

    fn recorded(raw: RawOp) -> RecordedOp {
        RecordedOp::new(raw, SystemTime::now(), "client:1", "server:27017")
    }

    #[tokio::test]
    async fn test_worker_plays_queue_then_closes() {
        let server = StubServer::new();
        let sink = Arc::new(BufferedStatSink::new());
        let (ctx, mut events) = context(&server, sink.clone());

        let first = recorded(build::insert(1, "db.c", &[doc! { "a": 1 }]).unwrap());
        let lane = route(&first);
        let (tx, rx) = mpsc::channel(8);
        tx.send(first).await.unwrap();
        tx.send(recorded(build::query(2, "db.c", 0, 0, &doc! {}).unwrap()))
            .await
            .unwrap();
        drop(tx);

        let (handoff_tx, handoff_rx) = oneshot::channel();
        let worker = LaneWorker::new(lane.clone(), ctx, rx, Box::new(LaneCursors::new()), handoff_tx);
        let report = worker.run(None).await;

        assert!(report.connected);
        assert_eq!(report.played, 2);
        assert_eq!(report.failed, 0);
        assert!(report.abort.is_none());
        assert!(handoff_rx.await.is_err());
        assert!(matches!(events.try_recv(), Ok(LaneEvent::Connected(id)) if id == lane));

        let stats = sink.snapshot();
        assert_eq!(stats[0].seq, 0);
        assert_eq!(stats[1].seq, 1);
        assert_eq!(stats[1].num_returned, 1);
    }

    #[tokio::test]
    async fn test_worker_waits_for_predecessor() {
        let server = StubServer::new();
        let sink = Arc::new(BufferedStatSink::new());
        let (ctx, _events) = context(&server, sink.clone());

        let op = recorded(build::insert(1, "db.c", &[doc! { "a": 1 }]).unwrap());
        let lane = route(&op);
        let (tx, rx) = mpsc::channel(8);
        tx.send(op).await.unwrap();
        drop(tx);

        let (predecessor_tx, predecessor_rx) = oneshot::channel::<LaneCarry>();
        let (handoff_tx, _handoff_rx) = oneshot::channel();
        let worker = LaneWorker::new(lane, ctx, rx, Box::new(LaneCursors::new()), handoff_tx);
        let handle = tokio::spawn(worker.run(Some(predecessor_rx)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.is_empty());
        assert_eq!(server.connections(), 0);

        drop(predecessor_tx);
        let report = handle.await.unwrap();
        assert_eq!(report.played, 1);
    }

    #[tokio::test]
    async fn test_cancel_before_connect_skips_everything() {
        let server = StubServer::new();
        let sink = Arc::new(BufferedStatSink::new());
        let (ctx, _events) = context(&server, sink.clone());
        ctx.cancel.cancel();

        let (tx, rx) = mpsc::channel(8);
        let op = recorded(build::insert(1, "db.c", &[doc! { "a": 1 }]).unwrap());
        let lane = route(&op);
        tx.send(op).await.unwrap();

        let (handoff_tx, _handoff_rx) = oneshot::channel();
        let worker = LaneWorker::new(lane, ctx, rx, Box::new(LaneCursors::new()), handoff_tx);
        let report = worker.run(None).await;

        assert_eq!(report.played, 0);
        assert_eq!(report.skipped, 1);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_successor_resumes_carried_lane_state() {
        let server = StubServer::new();
        let sink = Arc::new(BufferedStatSink::new());
        let (ctx, _events) = context(&server, sink.clone());

        let op = recorded(build::get_more(9, "db.c", 5, 4242).unwrap());
        let lane = route(&op);
        let (tx, rx) = mpsc::channel(8);
        tx.send(op).await.unwrap();
        drop(tx);

        let mut cursors = LaneCursors::new();
        cursors.record_binding(&lane, 4242, 777);
        let (predecessor_tx, predecessor_rx) = oneshot::channel();
        let carry = LaneCarry {
            cursors: Box::new(cursors),
            live_cursors: HashMap::new(),
            clock: LaneClock::new(),
            seq: 21,
            consecutive_failures: 0,
        };
        assert!(predecessor_tx.send(carry).is_ok());

        let (handoff_tx, _handoff_rx) = oneshot::channel();
        let worker = LaneWorker::new(lane, ctx, rx, Box::new(LaneCursors::new()), handoff_tx);
        let report = worker.run(Some(predecessor_rx)).await;

        assert_eq!(report.translation_misses, 0);
        let sent = server.received_of(OpCode::GetMore);
        assert_eq!(sent[0].cursor_ids().unwrap(), vec![777]);

        let stats = sink.snapshot();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].seq, 21);
        assert!(!stats[0].translation_miss);
    }

    #[tokio::test]
    async fn test_bound_getmore_replies_are_not_correlated() {
        let server = StubServer::new();
        let sink = Arc::new(BufferedStatSink::new());
        let (ctx, _events) = context(&server, sink);

        let query = recorded(build::query(1, "db.c", 0, 5, &doc! {}).unwrap());
        let lane = route(&query);
        let (_tx, rx) = mpsc::channel(1);
        let (handoff_tx, _handoff_rx) = oneshot::channel();
        let mut worker = LaneWorker::new(lane.clone(), ctx, rx, Box::new(LaneCursors::new()), handoff_tx);

        let open = ReplySummary {
            cursor_id: 777,
            number_returned: 5,
            failed: false,
        };
        worker.on_reply(&query, &open, false);
        assert_eq!(worker.live_cursors.get(&1), Some(&777));

        worker.cursors.record_binding(&lane, 4242, 777);
        for id in 2..50 {
            let more = recorded(build::get_more(id, "db.c", 5, 4242).unwrap());
            worker.on_reply(&more, &open, false);
        }
        assert_eq!(worker.live_cursors.len(), 1);

        // An unbound getmore that opened a live cursor still awaits its reply
        let stray = recorded(build::get_more(60, "db.c", 5, 9999).unwrap());
        worker.on_reply(&stray, &open, true);
        assert_eq!(worker.live_cursors.get(&60), Some(&777));

        let exhausted = ReplySummary {
            cursor_id: 0,
            ..open
        };
        let last = recorded(build::get_more(50, "db.c", 5, 4242).unwrap());
        worker.on_reply(&last, &exhausted, false);
        assert!(worker.cursors.resolve(&lane, 4242).is_miss());
    }

    #[test]
    fn test_link_lost_kinds() {
        assert!(is_link_lost(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_link_lost(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(!is_link_lost(&io::Error::from(io::ErrorKind::InvalidData)));
    }
}
