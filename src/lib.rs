//! Core library for the N-SIM environmental sampling daemon.
//!
//! This library contains the transport adapters, instrument protocols and
//! drivers, and the sampling orchestrator that merges per-cycle readings from
//! two mass-flow controllers, a chilled-mirror hygrometer and a temperature
//! probe. The `nsim-daq` binary wires it to configuration, CSV logging and the
//! plot buffer.

pub mod adapters;
pub mod config;
pub mod data;
pub mod error;
pub mod instrument;
pub mod measurement;
pub mod orchestrator;
pub mod protocol;

pub use error::{AppResult, DaqError, DriverResult};
pub use orchestrator::SamplingOrchestrator;
