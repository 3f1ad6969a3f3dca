//! Utility functions and helpers

pub mod backoff;
pub mod clock;

pub use backoff::RetryConfig;
pub use clock::{Clock, ManualClock, SystemClock};
