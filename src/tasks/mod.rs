//! Background Tasks Module
//!
//! Scheduled work that runs on the tokio runtime.
//!
//! # Tasks
//! - Delayed action: a cancellable one-shot timer used to debounce
//!   subscription opens and closes

mod delayed;

pub use delayed::DelayedTask;
