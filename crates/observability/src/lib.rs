//! Process-wide tracing setup shared by the relay binary and tests.

pub mod logging;

pub use logging::{LogConfig, LogFormat, init};
