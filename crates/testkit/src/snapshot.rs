//! Golden-file JSON comparison.
//!
//! Values are written as pretty JSON with object keys sorted, so field order in
//! Rust types never causes churn. Set `SKIRMISH_UPDATE_SNAPSHOTS=1` to rewrite goldens.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Environment variable that switches comparison into update mode.
pub const UPDATE_SNAPSHOTS_ENV: &str = "SKIRMISH_UPDATE_SNAPSHOTS";

/// Compare `value` against the golden file at `path`, or rewrite it in update mode.
pub fn assert_json_snapshot<P: AsRef<Path>, T: Serialize>(path: P, value: &T) -> Result<()> {
    let path = path.as_ref();
    let actual = canonical_json(value)?;

    if update_requested() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, &actual).with_context(|| format!("Failed to write {}", path.display()))?;
        return Ok(());
    }

    let expected = fs::read_to_string(path).with_context(|| {
        format!(
            "Snapshot missing at {} (run with {UPDATE_SNAPSHOTS_ENV}=1 to create it)",
            path.display()
        )
    })?;
    if expected != actual {
        bail!(
            "Snapshot mismatch at {} (run with {UPDATE_SNAPSHOTS_ENV}=1 to update)",
            path.display()
        );
    }
    Ok(())
}

/// Pretty JSON with sorted keys and a trailing newline.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value).context("Failed to serialize snapshot value")?;
    let mut out = serde_json::to_string_pretty(&sort_keys(value))?;
    out.push('\n');
    Ok(out)
}

fn update_requested() -> bool {
    matches!(
        std::env::var(UPDATE_SNAPSHOTS_ENV).as_deref(),
        Ok("1" | "true" | "yes")
    )
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect())
        }
        Value::Array(values) => Value::Array(values.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let text = canonical_json(&json!({"b": 1, "a": {"d": 2, "c": 3}})).unwrap();
        let a = text.find("\"a\"").unwrap();
        let b = text.find("\"b\"").unwrap();
        let c = text.find("\"c\"").unwrap();
        let d = text.find("\"d\"").unwrap();
        assert!(a < b && c < d);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn matching_golden_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("golden.json");
        let value = json!({"tick": 4});
        fs::write(&path, canonical_json(&value).unwrap()).unwrap();
        if !update_requested() {
            assert_json_snapshot(&path, &value).unwrap();
            assert!(assert_json_snapshot(&path, &json!({"tick": 5})).is_err());
        }
    }
}
