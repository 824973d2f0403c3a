//! Consumers of the per-cycle readings.
//!
//! The sampling loop only knows the two collaborator traits defined here:
//! [`DataLogger`] persists every reading, [`Plotter`] keeps a window of recent
//! readings for display. [`storage::CsvLogger`] and [`plot_buffer::PlotBuffer`]
//! are the implementations the binary uses.

pub mod plot_buffer;
pub mod storage;

pub use plot_buffer::{spawn_refresh, PlotBuffer, PlotGroup, PlotSnapshot};
pub use storage::CsvLogger;

use crate::error::AppResult;
use crate::measurement::Reading;
use async_trait::async_trait;

/// Persistent record of a monitoring session
#[async_trait]
pub trait DataLogger: Send {
    /// Begin a new log with the given column names. Called once per session
    /// before the first reading.
    async fn start_new_log(&mut self, field_names: &[&str]) -> AppResult<()>;

    /// Append one reading
    async fn log_data(&mut self, reading: &Reading) -> AppResult<()>;

    /// Flush and close the current log
    async fn close(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Live display feed. Must not block the sampling loop.
pub trait Plotter: Send {
    /// Append one reading to the display
    fn add_data_point(&mut self, reading: &Reading);
}
