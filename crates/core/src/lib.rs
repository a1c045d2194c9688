//! `jobqueue-core` — foundation types shared by the scheduler crates.
//!
//! This crate contains **pure** primitives (no threads, no IO): identifiers,
//! the time source contract and the core error model.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{MockClock, SystemClock, TimeSource, Timestamp, check_monotonic};
pub use error::{CoreError, CoreResult};
pub use id::{JobId, SessionId};
