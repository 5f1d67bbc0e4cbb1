//! Process wiring for the courier delivery engine: configuration loading,
//! simulated channel providers, batch submission and the run loop.

pub mod batch;
pub mod controller;
pub mod sender;
