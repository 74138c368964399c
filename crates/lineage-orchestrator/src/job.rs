//! Job configuration builder.
//!
//! [`JobConfigBuilder`] merges three parameter layers into one validated
//! [`JobConfig`]:
//!
//! 1. process-level defaults (lowest priority)
//! 2. the caller's parameter mapping
//! 3. explicit per-call fields (highest priority)
//!
//! Every heterogeneous input shape (delimited strings vs. lists, integer-like
//! strings, deprecated key aliases) is normalized here, once, so the rest of
//! the orchestrator only sees canonical values.

use std::path::PathBuf;

use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::warn;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// Parameter keys understood by the builder.
pub mod keys {
    pub const ACTIVE_PROFILES: &str = "activeProfiles";
    pub const API_KEY: &str = "apiKey";
    pub const ARGUMENTS: &str = "arguments";
    pub const BASE_URL: &str = "baseUrl";
    pub const DISABLE_ON_CANCEL: &str = "disableOnCancel";
    pub const DISABLE_ON_FAILURE: &str = "disableOnFailure";
    pub const ENTRY_POINT: &str = "entryPoint";
    pub const EXCLUSIVE_EXEC: &str = "exclusiveExec";
    pub const FORKS: &str = "forks";
    pub const IGNORE_FAILURES: &str = "ignoreFailures";
    pub const INSTANCE_ID: &str = "instanceId";
    pub const INSTANCES: &str = "instances";
    pub const ORG: &str = "org";
    pub const OUT_VARS: &str = "outVars";
    pub const PAYLOAD: &str = "payload";
    pub const PROJECT: &str = "project";
    pub const REPO: &str = "repo";
    pub const REPO_BRANCH_OR_TAG: &str = "repoBranchOrTag";
    pub const REPO_COMMIT_ID: &str = "repoCommitId";
    pub const START_AT: &str = "startAt";
    pub const SUSPEND: &str = "suspend";
    pub const SYNC: &str = "sync";
    pub const TAGS: &str = "tags";
    pub const TIMEOUT: &str = "timeout";

    /// Deprecated alias of [`PAYLOAD`].
    pub const ARCHIVE: &str = "archive";
    /// Deprecated alias of [`REPO`].
    pub const REPOSITORY: &str = "repository";
}

/// Deprecated key → canonical key.
const ALIASES: [(&str, &str); 2] = [
    (keys::ARCHIVE, keys::PAYLOAD),
    (keys::REPOSITORY, keys::REPO),
];

/// What the configuration is going to be used for. Decides which
/// cross-field requirements are enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Start a new (child or external) process: needs a payload or a project.
    Start,
    /// Fork the current process: needs an entry point, ignores payloads.
    Fork,
    /// Kill, list or wait: no launch target required.
    Control,
}

/// Where the code of a started process comes from, when not an inline payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectRef {
    pub org: Option<String>,
    pub project: Option<String>,
    pub repo: Option<String>,
    pub repo_branch_or_tag: Option<String>,
    pub repo_commit_id: Option<String>,
}

impl ProjectRef {
    /// A project reference is only resolvable by the service when it names a
    /// project.
    pub const fn is_resolvable(&self) -> bool {
        self.project.is_some()
    }
}

/// Remote service endpoint override. Empty means "the configured service".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl Endpoint {
    pub const fn is_default(&self) -> bool {
        self.base_url.is_none() && self.api_key.is_none()
    }
}

/// Validated job configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    pub target: ProjectRef,
    /// Payload path, relative to the execution's work directory.
    pub payload: Option<PathBuf>,
    pub entry_point: Option<String>,
    pub arguments: Map<String, Value>,
    pub tags: Option<Vec<String>>,
    pub active_profiles: Option<Vec<String>>,
    pub instances: u32,
    pub sync: bool,
    pub suspend: bool,
    pub ignore_failures: bool,
    pub disable_on_cancel: bool,
    pub disable_on_failure: bool,
    pub exclusive_exec: Option<bool>,
    /// RFC 3339 timestamp.
    pub start_at: Option<String>,
    /// `Some` (even when empty) means the caller wants output variables back.
    pub out_vars: Option<Vec<String>>,
    pub parent_instance_id: Option<Uuid>,
    pub endpoint: Endpoint,
    /// General wait timeout in milliseconds (`None` waits forever).
    pub timeout_ms: Option<u64>,
}

/// Builds a [`JobConfig`] from layered parameter maps.
#[derive(Debug, Clone, Default)]
pub struct JobConfigBuilder {
    defaults: Map<String, Value>,
    params: Map<String, Value>,
    overrides: Map<String, Value>,
    parent: Option<Uuid>,
}

impl JobConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-level defaults.
    #[must_use]
    pub fn defaults(mut self, defaults: &Map<String, Value>) -> Self {
        self.defaults = normalize_aliases(defaults);
        self
    }

    /// The caller's parameter mapping.
    #[must_use]
    pub fn params(mut self, params: &Map<String, Value>) -> Self {
        self.params = normalize_aliases(params);
        self
    }

    /// A whole map of explicit per-call fields (e.g. one fork specification).
    #[must_use]
    pub fn overrides(mut self, overrides: &Map<String, Value>) -> Self {
        self.overrides.extend(normalize_aliases(overrides));
        self
    }

    /// One explicit per-call field.
    #[must_use]
    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        let key = canonical_key(key);
        self.overrides.insert(key.to_string(), value.into());
        self
    }

    /// Mark the job as a child of `parent`.
    #[must_use]
    pub fn parent(mut self, parent: Uuid) -> Self {
        self.parent = Some(parent);
        self
    }

    /// The merged parameter map, highest layer winning.
    pub fn merged(&self) -> Map<String, Value> {
        let mut merged = self.defaults.clone();
        merged.extend(self.params.clone());
        merged.extend(self.overrides.clone());
        merged
    }

    /// Validate and build the configuration.
    pub fn build(self, purpose: Purpose) -> Result<JobConfig> {
        let m = self.merged();

        let target = ProjectRef {
            org: get_string(&m, keys::ORG)?,
            project: get_string(&m, keys::PROJECT)?,
            repo: get_string(&m, keys::REPO)?,
            repo_branch_or_tag: get_string(&m, keys::REPO_BRANCH_OR_TAG)?,
            repo_commit_id: get_string(&m, keys::REPO_COMMIT_ID)?,
        };

        let mut payload = get_string(&m, keys::PAYLOAD)?.map(PathBuf::from);
        let entry_point = get_string(&m, keys::ENTRY_POINT)?;

        match purpose {
            Purpose::Start => {
                if payload.is_none() && !target.is_resolvable() {
                    return Err(OrchestratorError::invalid(format!(
                        "'{}' and/or '{}' are required",
                        keys::PAYLOAD,
                        keys::PROJECT
                    )));
                }
            }
            Purpose::Fork => {
                if payload.take().is_some() {
                    warn!(
                        "'{}' parameter is not supported for fork action and will be ignored",
                        keys::PAYLOAD
                    );
                }
                if entry_point.is_none() {
                    return Err(OrchestratorError::invalid(format!(
                        "'{}' is required",
                        keys::ENTRY_POINT
                    )));
                }
            }
            Purpose::Control => {}
        }

        Ok(JobConfig {
            target,
            payload,
            entry_point,
            arguments: get_map(&m, keys::ARGUMENTS)?,
            tags: get_list(&m, keys::TAGS)?,
            active_profiles: get_list(&m, keys::ACTIVE_PROFILES)?,
            instances: get_instances(&m)?,
            sync: get_bool(&m, keys::SYNC)?.unwrap_or(false),
            suspend: get_bool(&m, keys::SUSPEND)?.unwrap_or(false),
            ignore_failures: get_bool(&m, keys::IGNORE_FAILURES)?.unwrap_or(false),
            disable_on_cancel: get_bool(&m, keys::DISABLE_ON_CANCEL)?.unwrap_or(false),
            disable_on_failure: get_bool(&m, keys::DISABLE_ON_FAILURE)?.unwrap_or(false),
            exclusive_exec: get_bool(&m, keys::EXCLUSIVE_EXEC)?,
            start_at: get_start_at(&m)?,
            out_vars: get_list(&m, keys::OUT_VARS)?,
            parent_instance_id: self.parent,
            endpoint: Endpoint {
                base_url: get_string(&m, keys::BASE_URL)?,
                api_key: get_string(&m, keys::API_KEY)?,
            },
            timeout_ms: get_timeout(&m)?,
        })
    }
}

fn canonical_key(key: &str) -> &str {
    ALIASES
        .iter()
        .find(|(old, _)| *old == key)
        .map_or(key, |(_, new)| *new)
}

/// Translate deprecated keys of one layer. The canonical key wins when a
/// layer carries both.
fn normalize_aliases(layer: &Map<String, Value>) -> Map<String, Value> {
    let mut out = layer.clone();
    for (old, new) in ALIASES {
        if let Some(v) = out.remove(old) {
            warn!("'{old}' is deprecated, please use '{new}' parameter");
            out.entry(new.to_string()).or_insert(v);
        }
    }
    out
}

fn get_string(m: &Map<String, Value>, key: &str) -> Result<Option<String>> {
    match m.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(OrchestratorError::invalid(format!(
            "'{key}' must be a string value: {other}"
        ))),
    }
}

fn get_bool(m: &Map<String, Value>, key: &str) -> Result<Option<bool>> {
    match m.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => Ok(Some(true)),
        Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => Ok(Some(false)),
        Some(other) => Err(OrchestratorError::invalid(format!(
            "'{key}' must be a boolean value: {other}"
        ))),
    }
}

fn get_map(m: &Map<String, Value>, key: &str) -> Result<Map<String, Value>> {
    match m.get(key) {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(o)) => Ok(o.clone()),
        Some(other) => Err(OrchestratorError::invalid(format!(
            "'{key}' must be a mapping: {other}"
        ))),
    }
}

/// Multi-valued field: a comma-separated string or a list of strings.
/// Duplicates are dropped, first occurrence order is kept.
fn get_list(m: &Map<String, Value>, key: &str) -> Result<Option<Vec<String>>> {
    let items: Vec<String> = match m.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Some(Value::Array(values)) => values
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                other => Err(OrchestratorError::invalid(format!(
                    "'{key}' must be a single string value or an array of strings: {other}"
                ))),
            })
            .collect::<Result<_>>()?,
        Some(other) => {
            return Err(OrchestratorError::invalid(format!(
                "'{key}' must be a single string value or an array of strings: {other}"
            )));
        }
    };

    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    Ok(Some(out))
}

fn integer_like(m: &Map<String, Value>, key: &str) -> Result<Option<i64>> {
    match m.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| {
            OrchestratorError::invalid(format!("'{key}' must be an integer: {n}"))
        }),
        Some(Value::String(s)) => s.trim().parse::<i64>().map(Some).map_err(|_| {
            OrchestratorError::invalid(format!("'{key}' must be an integer: {s}"))
        }),
        Some(other) => Err(OrchestratorError::invalid(format!(
            "'{key}' must be a number: {other}"
        ))),
    }
}

fn get_instances(m: &Map<String, Value>) -> Result<u32> {
    let Some(n) = integer_like(m, keys::INSTANCES)? else {
        return Ok(1);
    };
    if n <= 0 {
        return Err(OrchestratorError::invalid(format!(
            "'{}' must be a positive number: {n}",
            keys::INSTANCES
        )));
    }
    u32::try_from(n).map_err(|_| {
        OrchestratorError::invalid(format!("'{}' is too large: {n}", keys::INSTANCES))
    })
}

fn get_timeout(m: &Map<String, Value>) -> Result<Option<u64>> {
    match integer_like(m, keys::TIMEOUT)? {
        None => Ok(None),
        Some(n) if n <= 0 => Ok(None),
        Some(n) => Ok(u64::try_from(n).ok()),
    }
}

fn get_start_at(m: &Map<String, Value>) -> Result<Option<String>> {
    let Some(s) = get_string(m, keys::START_AT)? else {
        return Ok(None);
    };
    let parsed = OffsetDateTime::parse(&s, &Rfc3339).map_err(|e| {
        OrchestratorError::invalid(format!(
            "'{}' must be an RFC 3339 timestamp: {s} ({e})",
            keys::START_AT
        ))
    })?;
    parsed.format(&Rfc3339).map(Some).map_err(|e| {
        OrchestratorError::invalid(format!("'{}' cannot be formatted: {e}", keys::START_AT))
    })
}
