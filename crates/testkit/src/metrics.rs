//! Run metrics exported as JSON by long-running integration tests.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    /// Every check passed.
    Pass,
    /// At least one check failed.
    Fail,
}

/// Counters collected over one scripted match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Test identifier.
    pub test_name: String,
    /// RFC 3339 timestamp of when the report was created.
    pub timestamp: String,
    /// Overall result.
    pub result: RunResult,
    /// Simulation steps executed.
    pub steps: u64,
    /// Sessions that connected.
    pub sessions_joined: u64,
    /// Sessions that disconnected.
    pub sessions_left: u64,
    /// Commands dispatched successfully.
    pub commands_dispatched: u64,
    /// Commands rejected.
    pub commands_rejected: u64,
    /// Snapshots broadcast.
    pub snapshots: u64,
}

impl RunMetrics {
    /// Empty report stamped with the current time.
    pub fn new(test_name: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            result: RunResult::Pass,
            steps: 0,
            sessions_joined: 0,
            sessions_left: 0,
            commands_dispatched: 0,
            commands_rejected: 0,
            snapshots: 0,
        }
    }

    /// Mark the run failed.
    pub fn fail(&mut self) {
        self.result = RunResult::Fail;
    }
}

/// Writes [`RunMetrics`] as pretty JSON.
pub struct MetricsSink {
    path: PathBuf,
}

impl MetricsSink {
    /// Target `path`, creating parent directories.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Write (or overwrite) the report.
    pub fn write(&self, metrics: &RunMetrics) -> Result<()> {
        let json = serde_json::to_string_pretty(metrics)?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write metrics to {}", self.path.display()))
    }
}
