//! Cursor translation between recorded and live cursor ids.
//!
//! The server hands out fresh cursor ids during replay. Every getmore and
//! kill-cursors must reference the live id, so each lane keeps a binding from
//! the id seen in the recording to the id the target returned for the same
//! logical cursor.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::router::LaneId;

/// Where cursor bindings live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorScope {
    /// Each lane has its own table (no locking)
    #[default]
    Lane,
    /// One table shared by every lane; cursors are valid across connections
    Global,
}

/// What to do when a cursor id has no live binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorMissPolicy {
    /// Send the recorded id verbatim and let the server reject it
    #[default]
    PassThrough,
    /// Do not send the operation; report it as a stale cursor
    Fail,
}

/// Outcome of resolving a recorded cursor id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorLookup {
    /// A live id is bound to the recorded id
    Bound(i64),
    /// No binding; carries the recorded id unchanged
    Miss(i64),
}

impl CursorLookup {
    /// Id to put on the wire
    #[must_use]
    pub fn live_id(&self) -> i64 {
        match self {
            Self::Bound(id) | Self::Miss(id) => *id,
        }
    }

    /// Whether the lookup missed
    #[must_use]
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss(_))
    }
}

/// Recorded → live cursor id table
pub trait CursorTranslator: Send {
    /// Bind `recorded` to `live`; last write wins
    fn record_binding(&mut self, lane: &LaneId, recorded: i64, live: i64);

    /// Live id for `recorded`, or a miss carrying `recorded`
    fn resolve(&self, lane: &LaneId, recorded: i64) -> CursorLookup;

    /// Forget the binding for `recorded`
    fn release(&mut self, lane: &LaneId, recorded: i64);

    /// Forget every binding created by `lane`
    fn release_lane(&mut self, lane: &LaneId);

    /// Number of bindings visible to this translator
    fn len(&self) -> usize;

    /// Whether no bindings are visible
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bindings owned by a single lane
#[derive(Debug, Default)]
pub struct LaneCursors {
    bindings: HashMap<i64, i64>,
}

impl LaneCursors {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CursorTranslator for LaneCursors {
    fn record_binding(&mut self, lane: &LaneId, recorded: i64, live: i64) {
        trace!(%lane, recorded, live, "Binding cursor");
        self.bindings.insert(recorded, live);
    }

    fn resolve(&self, _lane: &LaneId, recorded: i64) -> CursorLookup {
        match self.bindings.get(&recorded) {
            Some(live) => CursorLookup::Bound(*live),
            None => CursorLookup::Miss(recorded),
        }
    }

    fn release(&mut self, _lane: &LaneId, recorded: i64) {
        self.bindings.remove(&recorded);
    }

    fn release_lane(&mut self, _lane: &LaneId) {
        self.bindings.clear();
    }

    fn len(&self) -> usize {
        self.bindings.len()
    }
}

#[derive(Debug, Clone)]
struct SharedBinding {
    live: i64,
    owner: LaneId,
}

/// Bindings shared by every lane.
///
/// Each handle is cheap to clone. Access is serialized per key (sharded
/// locks), so unrelated lanes never contend on the whole table.
#[derive(Debug, Clone, Default)]
pub struct SharedCursors {
    bindings: Arc<DashMap<i64, SharedBinding>>,
}

impl SharedCursors {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CursorTranslator for SharedCursors {
    fn record_binding(&mut self, lane: &LaneId, recorded: i64, live: i64) {
        trace!(%lane, recorded, live, "Binding shared cursor");
        self.bindings.insert(
            recorded,
            SharedBinding {
                live,
                owner: lane.clone(),
            },
        );
    }

    fn resolve(&self, _lane: &LaneId, recorded: i64) -> CursorLookup {
        match self.bindings.get(&recorded) {
            Some(binding) => CursorLookup::Bound(binding.live),
            None => CursorLookup::Miss(recorded),
        }
    }

    fn release(&mut self, _lane: &LaneId, recorded: i64) {
        self.bindings.remove(&recorded);
    }

    fn release_lane(&mut self, lane: &LaneId) {
        self.bindings.retain(|_, binding| binding.owner != *lane);
    }

    fn len(&self) -> usize {
        self.bindings.len()
    }
}

/// Translator for a new lane under the given scope
#[must_use]
pub fn translator_for(scope: CursorScope, shared: &SharedCursors) -> Box<dyn CursorTranslator> {
    match scope {
        CursorScope::Lane => Box::new(LaneCursors::new()),
        CursorScope::Global => Box::new(shared.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Endpoint;

    fn lane(a: &str, b: &str) -> LaneId {
        LaneId::new(&Endpoint::from(a), &Endpoint::from(b))
    }

    #[test]
    fn test_lane_cursors_bind_resolve_release() {
        let l = lane("c", "s");
        let mut cursors = LaneCursors::new();

        assert_eq!(cursors.resolve(&l, 123), CursorLookup::Miss(123));

        cursors.record_binding(&l, 123, 9001);
        cursors.record_binding(&l, 456, 9002);
        assert_eq!(cursors.resolve(&l, 123), CursorLookup::Bound(9001));
        assert_eq!(cursors.resolve(&l, 456).live_id(), 9002);
        assert_eq!(cursors.len(), 2);

        cursors.release(&l, 123);
        assert!(cursors.resolve(&l, 123).is_miss());
        assert_eq!(cursors.resolve(&l, 456), CursorLookup::Bound(9002));

        cursors.release_lane(&l);
        assert!(cursors.is_empty());
    }

    #[test]
    fn test_last_binding_wins() {
        let l = lane("c", "s");
        let mut cursors = LaneCursors::new();
        cursors.record_binding(&l, 1, 10);
        cursors.record_binding(&l, 1, 20);
        assert_eq!(cursors.resolve(&l, 1), CursorLookup::Bound(20));
    }

    #[test]
    fn test_shared_cursors_visible_across_lanes() {
        let a = lane("c1", "s");
        let b = lane("c2", "s");
        let shared = SharedCursors::new();
        let mut on_a = translator_for(CursorScope::Global, &shared);
        let on_b = translator_for(CursorScope::Global, &shared);

        on_a.record_binding(&a, 77, 7000);
        assert_eq!(on_b.resolve(&b, 77), CursorLookup::Bound(7000));
    }

    #[test]
    fn test_shared_release_lane_only_drops_own_bindings() {
        let a = lane("c1", "s");
        let b = lane("c2", "s");
        let mut shared = SharedCursors::new();
        shared.record_binding(&a, 1, 100);
        shared.record_binding(&b, 2, 200);

        shared.release_lane(&a);
        assert!(shared.resolve(&a, 1).is_miss());
        assert_eq!(shared.resolve(&a, 2), CursorLookup::Bound(200));
        assert_eq!(shared.len(), 1);
    }

    #[test]
    fn test_lane_scope_is_isolated() {
        let a = lane("c1", "s");
        let shared = SharedCursors::new();
        let mut first = translator_for(CursorScope::Lane, &shared);
        let second = translator_for(CursorScope::Lane, &shared);

        first.record_binding(&a, 5, 50);
        assert!(second.resolve(&a, 5).is_miss());
        assert!(shared.is_empty());
    }
}
