//! Replay engine: lane workers and the orchestrator that feeds them
//!
//! Every captured connection becomes a lane. The [`Player`] routes recorded
//! operations to lane workers, each of which owns one live connection and
//! issues its operations in capture order at the recorded pace.

mod cancel;
mod lane;
mod player;

pub use cancel::CancelSignal;
pub use lane::{LaneAbort, LaneReport, LaneState};
pub use player::{play, PlaySummary, Player};
