//! Replay orchestration: routes recorded operations to lane workers

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{target_address, ConnectFailurePolicy, PlayConfig};
use crate::cursor::{translator_for, CursorScope, SharedCursors};
use crate::network::{Connector, LanePool};
use crate::record::RecordedOp;
use crate::router::{route, LaneId};
use crate::stats::StatSink;
use crate::throttle::SpeedThrottle;
use crate::{ReplayError, Result};

use super::cancel::CancelSignal;
use super::lane::{LaneCarry, LaneContext, LaneEvent, LaneReport, LaneSettings, LaneWorker};

/// Totals of a completed replay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlaySummary {
    /// Distinct lanes seen in the stream
    pub lanes_opened: usize,
    /// Lanes that opened a live connection at least once
    pub lanes_connected: usize,
    /// Lanes that closed early
    pub lanes_aborted: usize,
    /// Stat records emitted
    pub ops_played: u64,
    /// Stat records carrying an error
    pub ops_failed: u64,
    /// Operations dropped without a stat record
    pub ops_skipped: u64,
    /// Operations sent with an unbound cursor id
    pub translation_misses: u64,
}

impl LaneSettings {
    fn from_config(config: &PlayConfig) -> Self {
        Self {
            throttle: SpeedThrottle::new(config.speed),
            response_timeout: config.response_timeout(),
            connect_timeout: config.connect_timeout(),
            max_consecutive_failures: config.max_consecutive_failures,
            cursor_miss: config.cursor_miss,
        }
    }
}

/// Replays a stream of recorded operations against one target.
///
/// A player runs once; [`Player::cancel_handle`] stops it from another task.
pub struct Player<C: Connector> {
    connector: Arc<C>,
    sink: Arc<dyn StatSink>,
    config: PlayConfig,
    cancel: CancelSignal,
}

impl<C: Connector> Player<C> {
    /// Create a player
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(connector: C, sink: Arc<dyn StatSink>, config: PlayConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            connector: Arc::new(connector),
            sink,
            config,
            cancel: CancelSignal::new(),
        })
    }

    /// Handle that cancels the run
    #[must_use]
    pub fn cancel_handle(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Replay every operation received on `ops` until the producer closes it.
    ///
    /// # Errors
    ///
    /// Returns the first run-level failure: cancellation, a connect failure
    /// under [`ConnectFailurePolicy::AbortRun`], or no lane connecting at all
    pub async fn play(self, ops: mpsc::Receiver<RecordedOp>) -> Result<PlaySummary> {
        let stream = futures_util::stream::unfold(ops, |mut rx| async move {
            rx.recv().await.map(|op| (Ok::<_, Infallible>(op), rx))
        });
        self.play_stream(stream).await
    }

    /// Replay a fallible stream of operations.
    ///
    /// # Errors
    ///
    /// As [`Player::play`], plus [`ReplayError::Stream`] when the stream
    /// yields an error
    pub async fn play_stream<S, E>(self, ops: S) -> Result<PlaySummary>
    where
        S: Stream<Item = std::result::Result<RecordedOp, E>>,
        E: Display,
    {
        let addr = target_address(&self.config.target)?;
        info!(
            "Replaying against {} (speed {}, lane limit {}, queue depth {})",
            addr, self.config.speed, self.config.lane_limit, self.config.queue_depth
        );

        let credentials = self.config.credentials()?;
        if let Some(credentials) = &credentials {
            info!(
                "Lanes authenticate as {} on {}",
                credentials.username, credentials.source
            );
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let ctx = Arc::new(LaneContext {
            connector: Arc::clone(&self.connector),
            addr,
            sink: Arc::clone(&self.sink),
            pool: LanePool::new(self.config.lane_limit),
            cancel: self.cancel.clone(),
            events: events_tx,
            credentials,
            settings: LaneSettings::from_config(&self.config),
        });

        let mut run = Run {
            ctx,
            shared: SharedCursors::new(),
            cursor_scope: self.config.cursor_scope,
            queue_depth: self.config.queue_depth,
            connect_failure: self.config.connect_failure,
            lanes: HashMap::new(),
            tasks: JoinSet::new(),
            events,
            connected: HashSet::new(),
            attempted: HashSet::new(),
            summary: PlaySummary::default(),
        };

        let routed = run.route_all(ops).await;
        let result = match routed {
            Ok(()) => run.wait_for_lanes().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => run.finish(),
            Err(e) => {
                error!("Replay failed: {e}");
                run.shutdown().await;
                Err(e)
            }
        }
    }
}

/// Replay `ops` against `target` with default settings for everything but
/// the speed factor and the concurrency bounds
///
/// # Errors
///
/// As [`Player::play`], plus configuration errors
pub async fn play<C: Connector>(
    connector: C,
    sink: Arc<dyn StatSink>,
    ops: mpsc::Receiver<RecordedOp>,
    speed: f64,
    target: &str,
    lane_limit: usize,
    queue_depth: usize,
) -> Result<PlaySummary> {
    let mut config = PlayConfig::new(target);
    config.speed = speed;
    config.lane_limit = lane_limit;
    config.queue_depth = queue_depth;

    Player::new(connector, sink, config)?.play(ops).await
}

struct LaneHandle {
    tx: mpsc::Sender<RecordedOp>,
    handoff: Option<oneshot::Receiver<LaneCarry>>,
}

enum Step<E> {
    Cancelled,
    Event(LaneEvent),
    Joined(std::result::Result<LaneReport, JoinError>),
    Next(Option<std::result::Result<RecordedOp, E>>),
}

/// State of one replay run, owned by the routing loop
struct Run<C: Connector> {
    ctx: Arc<LaneContext<C>>,
    shared: SharedCursors,
    cursor_scope: CursorScope,
    queue_depth: usize,
    connect_failure: ConnectFailurePolicy,
    lanes: HashMap<LaneId, LaneHandle>,
    tasks: JoinSet<LaneReport>,
    events: mpsc::UnboundedReceiver<LaneEvent>,
    connected: HashSet<LaneId>,
    attempted: HashSet<LaneId>,
    summary: PlaySummary,
}

impl<C: Connector> Run<C> {
    async fn route_all<S, E>(&mut self, ops: S) -> Result<()>
    where
        S: Stream<Item = std::result::Result<RecordedOp, E>>,
        E: Display,
    {
        futures_util::pin_mut!(ops);
        let cancel = self.ctx.cancel.clone();

        loop {
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => Step::Cancelled,
                Some(event) = self.events.recv() => Step::Event(event),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => Step::Joined(joined),
                next = ops.next() => Step::Next(next),
            };

            match step {
                Step::Cancelled => return Err(ReplayError::Cancelled),
                Step::Event(event) => self.on_event(event)?,
                Step::Joined(joined) => self.absorb(joined)?,
                Step::Next(Some(Ok(op))) => self.dispatch(op).await?,
                Step::Next(Some(Err(e))) => return Err(ReplayError::Stream(e.to_string())),
                Step::Next(None) => {
                    debug!("Operation stream closed");
                    return Ok(());
                }
            }
        }
    }

    /// Hand `op` to its lane, creating the lane worker if needed
    async fn dispatch(&mut self, mut op: RecordedOp) -> Result<()> {
        let lane = route(&op);
        let cancel = self.ctx.cancel.clone();

        loop {
            let tx = match self.lanes.get(&lane) {
                Some(handle) => handle.tx.clone(),
                None => self.spawn_lane(lane.clone(), None),
            };

            let sent = tokio::select! {
                sent = tx.send(op) => sent,
                () = cancel.cancelled() => return Err(ReplayError::Cancelled),
            };

            match sent {
                Ok(()) => return Ok(()),
                Err(SendError(returned)) => {
                    // The worker yielded its slot; a successor takes over
                    // once it has closed.
                    op = returned;
                    let predecessor = self
                        .lanes
                        .remove(&lane)
                        .and_then(|mut handle| handle.handoff.take());
                    debug!(lane = %lane, "Re-opening lane");
                    self.spawn_lane(lane.clone(), predecessor);
                }
            }
        }
    }

    fn spawn_lane(
        &mut self,
        lane: LaneId,
        predecessor: Option<oneshot::Receiver<LaneCarry>>,
    ) -> mpsc::Sender<RecordedOp> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let (handoff_tx, handoff_rx) = oneshot::channel();

        if self.attempted.insert(lane.clone()) {
            self.summary.lanes_opened += 1;
            info!(lane = %lane, "Opening lane");
        }

        let cursors = translator_for(self.cursor_scope, &self.shared);
        let worker = LaneWorker::new(lane.clone(), Arc::clone(&self.ctx), rx, cursors, handoff_tx);
        self.tasks.spawn(worker.run(predecessor));

        self.lanes.insert(
            lane,
            LaneHandle {
                tx: tx.clone(),
                handoff: Some(handoff_rx),
            },
        );
        tx
    }

    fn on_event(&mut self, event: LaneEvent) -> Result<()> {
        match event {
            LaneEvent::Connected(lane) => {
                self.connected.insert(lane);
                Ok(())
            }
            LaneEvent::ConnectFailed { lane, error } => {
                if self.connect_failure == ConnectFailurePolicy::AbortRun {
                    error!(lane = %lane, "Lane could not connect, aborting run");
                    return Err(ReplayError::Connect {
                        addr: self.ctx.addr.clone(),
                        source: error,
                    });
                }
                warn!(lane = %lane, "Lane could not connect: {error}");
                Ok(())
            }
            LaneEvent::Aborted { lane, reason } => {
                warn!(lane = %lane, ?reason, "Lane drained early");
                Ok(())
            }
        }
    }

    fn absorb(&mut self, joined: std::result::Result<LaneReport, JoinError>) -> Result<()> {
        let report = match joined {
            Ok(report) => report,
            Err(e) if e.is_cancelled() => return Ok(()),
            Err(e) => return Err(ReplayError::LaneTask(e.to_string())),
        };

        self.summary.ops_played += report.played;
        self.summary.ops_failed += report.failed;
        self.summary.ops_skipped += report.skipped;
        self.summary.translation_misses += report.translation_misses;
        if report.abort.is_some() {
            self.summary.lanes_aborted += 1;
        }
        debug!(
            lane = %report.lane,
            played = report.played,
            yielded = report.yielded,
            "Lane worker finished"
        );
        Ok(())
    }

    /// Close every lane queue and wait for the workers to drain
    async fn wait_for_lanes(&mut self) -> Result<()> {
        self.lanes.clear();
        let cancel = self.ctx.cancel.clone();

        loop {
            let step: Step<Infallible> = tokio::select! {
                biased;
                () = cancel.cancelled() => Step::Cancelled,
                Some(event) = self.events.recv() => Step::Event(event),
                joined = self.tasks.join_next() => match joined {
                    Some(joined) => Step::Joined(joined),
                    None => Step::Next(None),
                },
            };

            match step {
                Step::Cancelled => return Err(ReplayError::Cancelled),
                Step::Event(event) => self.on_event(event)?,
                Step::Joined(joined) => self.absorb(joined)?,
                Step::Next(_) => break,
            }
        }

        // Events sent by the last workers
        while let Ok(event) = self.events.try_recv() {
            self.on_event(event)?;
        }
        Ok(())
    }

    /// Stop every lane after a fatal error and collect what they reported
    async fn shutdown(&mut self) {
        self.ctx.cancel.cancel();
        self.lanes.clear();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = self.absorb(joined) {
                warn!("Lane failed during shutdown: {e}");
            }
        }
    }

    fn finish(self) -> Result<PlaySummary> {
        if !self.attempted.is_empty() && self.connected.is_empty() {
            error!("No lane could connect to {}", self.ctx.addr);
            return Err(ReplayError::NoLaneConnected {
                attempted: self.attempted.len(),
            });
        }

        let summary = PlaySummary {
            lanes_connected: self.connected.len(),
            ..self.summary
        };
        info!(
            lanes = summary.lanes_opened,
            played = summary.ops_played,
            failed = summary.ops_failed,
            "Replay complete"
        );
        Ok(summary)
    }
}
