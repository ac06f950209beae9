//! `astra-core`: primitives shared by the event infrastructure crates.
//!
//! Nothing in here performs I/O.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::CoreError;
pub use id::EventId;
