#![warn(missing_docs)]
//! Test surfaces: session timelines as JSONL, tick traces and run metrics.

mod metrics;
mod snapshot;
mod trace;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use skirmish_core::{PeerId, SimTick};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

pub use metrics::{MetricsSink, RunMetrics, RunResult};
pub use snapshot::{assert_json_snapshot, canonical_json, UPDATE_SNAPSHOTS_ENV};
pub use trace::{record_trace, TickTrace, TraceFrame};

/// One entry of a session timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Tick when the event was observed.
    pub tick: SimTick,
    /// Short label, e.g. `connected` or `packet`.
    pub kind: String,
    /// Session involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerId>,
    /// Free-form detail.
    #[serde(default)]
    pub detail: String,
}

impl EventRecord {
    /// Event tied to a session.
    pub fn peer(tick: SimTick, kind: &str, peer: PeerId, detail: impl Into<String>) -> Self {
        Self {
            tick,
            kind: kind.to_string(),
            peer: Some(peer),
            detail: detail.into(),
        }
    }
}

/// Writes newline-delimited JSON records to disk.
pub struct JsonlSink {
    file: BufWriter<File>,
    written: usize,
}

impl JsonlSink {
    /// Create a sink at `path`, creating parent directories if needed.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self {
            file: BufWriter::new(file),
            written: 0,
        })
    }

    /// Append one record.
    pub fn write(&mut self, event: &EventRecord) -> Result<()> {
        serde_json::to_writer(&mut self.file, event)?;
        self.file.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    /// Records written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Flush buffered records to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        let _ = self.file.flush();
    }
}

/// Load every record from a JSONL file.
pub fn read_jsonl<P: AsRef<Path>>(path: P) -> Result<Vec<EventRecord>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut events = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid record", path.display(), index + 1))?;
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_sink_round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/timeline.jsonl");
        let events = vec![
            EventRecord::peer(SimTick(0), "connected", PeerId(1), "local"),
            EventRecord {
                tick: SimTick(3),
                kind: "tick".into(),
                peer: None,
                detail: String::new(),
            },
        ];

        let mut sink = JsonlSink::create(&path).unwrap();
        for event in &events {
            sink.write(event).unwrap();
        }
        assert_eq!(sink.written(), 2);
        sink.flush().unwrap();

        assert_eq!(read_jsonl(&path).unwrap(), events);
        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.lines().nth(1).unwrap().contains("peer"));
    }

    #[test]
    fn read_jsonl_reports_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        fs::write(&path, "{\"tick\":0,\"kind\":\"x\"}\nnot json\n").unwrap();
        let err = read_jsonl(&path).unwrap_err();
        assert!(format!("{err:#}").contains(":2:"));
    }
}
