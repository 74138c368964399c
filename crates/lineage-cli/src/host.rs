//! File-backed host state.
//!
//! The CLI stands in for an execution engine: between invocations it keeps
//! the execution's identity and its [`ExecutionState`] in a JSON file, which
//! is all a suspended execution needs to be resumed.

use std::path::Path;

use anyhow::{Context, Result, bail};
use lineage_orchestrator::ExecutionState;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

/// What the host persists for one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    #[serde(default)]
    pub state: ExecutionState,
    /// Resume event the execution is parked on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parked_on: Option<String>,
}

/// Load the record at `path`. A missing file is an empty record.
pub fn load_record(path: &Path) -> Result<HostRecord> {
    if !path.exists() {
        debug!(path = %path.display(), "No state file, starting fresh");
        return Ok(HostRecord::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse state file {}", path.display()))
}

/// Write the record to `path` through a sibling temp file and a rename.
pub fn save_record(path: &Path, record: &HostRecord) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let content = serde_json::to_string_pretty(record)?;
    std::fs::write(&tmp, content)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Task parameters from an optional JSON file plus `key=value` pairs. Pairs
/// win; their values are read as JSON when they parse, as strings otherwise.
pub fn load_params(file: Option<&Path>, pairs: &[String]) -> Result<Map<String, Value>> {
    let mut params = match file {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read params file {}", path.display()))?;
            match serde_json::from_str::<Value>(&content)
                .with_context(|| format!("Failed to parse params file {}", path.display()))?
            {
                Value::Object(m) => m,
                _ => bail!("params file {} must hold a JSON object", path.display()),
            }
        }
        None => Map::new(),
    };

    for pair in pairs {
        let (key, value) = parse_pair(pair)?;
        params.insert(key, value);
    }
    Ok(params)
}

fn parse_pair(pair: &str) -> Result<(String, Value)> {
    let Some((key, raw)) = pair.split_once('=') else {
        bail!("expected key=value, got '{pair}'");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("empty parameter name in '{pair}'");
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
