//! Process-wide tracing setup.

pub mod subscriber;

pub use subscriber::{init, init_with, LogFormat};
