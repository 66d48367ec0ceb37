//! Runtime glue: configuration, error taxonomy, progress cadence, telemetry,
//! and the job runner that ties a whole sync run together.

pub mod config;
pub mod error;
pub mod progress;
pub mod runner;
pub mod telemetry;
