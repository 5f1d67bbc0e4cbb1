//! Delivery policies, kept apart from the dispatcher so they can be tested
//! as plain functions.
//!
//! - [`RetryPolicy`]: backoff timing and the retry / fallback / give-up decision
//! - [`backoff`]: the exponential delay with jitter

pub mod backoff;
pub mod retry;

pub use retry::{RetryAction, RetryPolicy};
