//! Mongotape - MongoDB wire-protocol traffic replay
//!
//! Replays captured operations against a live server at the recorded pace,
//! one live connection per captured connection, rewriting cursor ids the
//! server hands out along the way.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod cursor;
pub mod error;
pub mod network;
pub mod record;
pub mod replay;
pub mod router;
pub mod stats;
#[cfg(any(test, feature = "stub"))]
pub mod stub;
pub mod throttle;
pub mod wire;

pub use error::{OpErrorKind, ReplayError, Result};
