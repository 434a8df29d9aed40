//! Agent reports and the backoff they feed.

pub mod backoff;
pub mod processor;

pub use backoff::BackoffController;
pub use processor::{Ack, StatusStreamProcessor};
