//! Lane routing.
//!
//! A lane is one captured connection. Its identity is the unordered pair of
//! endpoints, so a reply (whose endpoints are swapped relative to its request)
//! lands on the same lane as the request.

use std::fmt;

use crate::record::{Endpoint, RecordedOp};

/// Canonical, unordered endpoint pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaneId {
    low: Endpoint,
    high: Endpoint,
}

impl LaneId {
    /// Build the key for a connection between `a` and `b`, in either direction
    #[must_use]
    pub fn new(a: &Endpoint, b: &Endpoint) -> Self {
        if a <= b {
            Self {
                low: a.clone(),
                high: b.clone(),
            }
        } else {
            Self {
                low: b.clone(),
                high: a.clone(),
            }
        }
    }

    /// The two endpoints, lower one first
    #[must_use]
    pub fn endpoints(&self) -> (&Endpoint, &Endpoint) {
        (&self.low, &self.high)
    }
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.low, self.high)
    }
}

/// Lane a record belongs to
#[must_use]
pub fn route(op: &RecordedOp) -> LaneId {
    LaneId::new(op.src(), op.dst())
}

/// Whether two records travel on the same captured connection
#[must_use]
pub fn same_lane(a: &RecordedOp, b: &RecordedOp) -> bool {
    route(a) == route(b)
}
