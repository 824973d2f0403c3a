//! Measurement records produced by the sampling loop.

pub mod reading;

pub use reading::{Channel, Reading, FIELD_NAMES};
