//! CSV data logger with clean feature flag handling.
//!
//! Each monitoring session gets its own file, `<prefix>_<YYYYmmdd_HHMMSS>.csv`,
//! inside the configured output directory. Every row is flushed as soon as it is
//! written.

use super::DataLogger;
use crate::config::ApplicationConfig;
use crate::error::{AppResult, DaqError};
use crate::measurement::Reading;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// ============================================================================
// CSV Logger
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs::File;
    use tracing::info;

    /// Writes one CSV file per monitoring session
    pub struct CsvLogger {
        output_dir: PathBuf,
        prefix: String,
        path: Option<PathBuf>,
        fields: Vec<String>,
        writer: Option<csv::Writer<File>>,
    }

    impl CsvLogger {
        /// Logger writing `<prefix>_<timestamp>.csv` files into `output_dir`
        pub fn new(output_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
            Self {
                output_dir: output_dir.into(),
                prefix: prefix.into(),
                path: None,
                fields: Vec::new(),
                writer: None,
            }
        }

        /// Logger for the configured log directory and prefix
        pub fn from_config(config: &ApplicationConfig) -> Self {
            Self::new(&config.log_dir, &config.log_prefix)
        }

        /// File the current session is written to
        pub fn current_path(&self) -> Option<&Path> {
            self.path.as_deref()
        }

        fn next_path(&self) -> PathBuf {
            let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            let mut path = self.output_dir.join(format!("{}_{stamp}.csv", self.prefix));
            let mut n = 1;
            while path.exists() {
                path = self
                    .output_dir
                    .join(format!("{}_{stamp}_{n}.csv", self.prefix));
                n += 1;
            }
            path
        }

        /// Log files in the output directory carrying this logger's prefix,
        /// oldest name first.
        pub fn list_log_files(&self) -> AppResult<Vec<PathBuf>> {
            if !self.output_dir.exists() {
                return Ok(Vec::new());
            }
            let stem = format!("{}_", self.prefix);
            let mut files = Vec::new();
            for entry in std::fs::read_dir(&self.output_dir)? {
                let path = entry?.path();
                let matches = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&stem) && n.ends_with(".csv"));
                if matches && path.is_file() {
                    files.push(path);
                }
            }
            files.sort();
            Ok(files)
        }

        /// Read a log back as one column-name → cell map per row.
        pub fn read_log(path: &Path) -> AppResult<Vec<HashMap<String, String>>> {
            let mut reader = csv::Reader::from_path(path)?;
            let headers = reader.headers()?.clone();
            let mut rows = Vec::new();
            for record in reader.records() {
                let record = record?;
                rows.push(
                    headers
                        .iter()
                        .zip(record.iter())
                        .map(|(h, v)| (h.to_string(), v.to_string()))
                        .collect(),
                );
            }
            Ok(rows)
        }
    }

    #[async_trait]
    impl DataLogger for CsvLogger {
        async fn start_new_log(&mut self, field_names: &[&str]) -> AppResult<()> {
            if let Some(mut writer) = self.writer.take() {
                writer.flush()?;
            }
            std::fs::create_dir_all(&self.output_dir)?;
            let path = self.next_path();
            let mut writer = csv::Writer::from_path(&path)?;
            writer.write_record(field_names)?;
            writer.flush()?;

            info!(path = %path.display(), "Logging to new CSV file");
            self.fields = field_names.iter().map(|f| f.to_string()).collect();
            self.path = Some(path);
            self.writer = Some(writer);
            Ok(())
        }

        async fn log_data(&mut self, reading: &Reading) -> AppResult<()> {
            let writer = self
                .writer
                .as_mut()
                .ok_or_else(|| DaqError::Storage("no log file started".to_string()))?;
            writer.write_record(self.fields.iter().map(|f| reading.field(f)))?;
            writer.flush()?;
            Ok(())
        }

        async fn close(&mut self) -> AppResult<()> {
            if let Some(mut writer) = self.writer.take() {
                writer.flush()?;
                info!(path = ?self.path, "CSV log closed");
            }
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    /// Placeholder logger used when CSV support is compiled out
    pub struct CsvLogger;

    impl CsvLogger {
        /// Logger that refuses every write
        pub fn new(_output_dir: impl Into<PathBuf>, _prefix: impl Into<String>) -> Self {
            Self
        }

        /// Logger that refuses every write
        pub fn from_config(_config: &ApplicationConfig) -> Self {
            Self
        }

        /// Always `None`
        pub fn current_path(&self) -> Option<&Path> {
            None
        }

        /// Always fails with `FeatureNotEnabled`
        pub fn list_log_files(&self) -> AppResult<Vec<PathBuf>> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }

        /// Always fails with `FeatureNotEnabled`
        pub fn read_log(_path: &Path) -> AppResult<Vec<HashMap<String, String>>> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }

    #[async_trait]
    impl DataLogger for CsvLogger {
        async fn start_new_log(&mut self, _field_names: &[&str]) -> AppResult<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }

        async fn log_data(&mut self, _reading: &Reading) -> AppResult<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvLogger;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvLogger;
