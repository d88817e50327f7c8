//! Shared data model for the model unification catalog.
//!
//! Every type here is plain data: no locking, no I/O, no async. The catalog
//! and lifecycle layers build behavior around these shapes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod clock;
pub mod error;
pub use clock::{Clock, SystemClock, VirtualClock};
pub use error::{Error, Result};

/// An open, string-keyed value bag. Reserved keys (`digest`, `publisher`,
/// `type`, `platform`, `metadata_confidence`) have documented expected
/// variants but any key may be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<MetadataValue>),
    Map(BTreeMap<String, MetadataValue>),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// A raw per-endpoint model record as reported by an inference backend.
///
/// Callers populate whichever fields their backend exposes; everything else
/// is `None`/empty. `unify`/`unify_batch` skip a descriptor whose `name` is
/// empty rather than erroring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// The name the endpoint reports for this model, e.g. `phi4:latest`.
    pub name: String,
    /// Platform-supplied family hint, if any (e.g. `"phi3"`).
    pub family: Option<String>,
    /// Raw parameter-size string as reported, e.g. `"14.7B"`.
    pub parameter_size: Option<String>,
    /// Raw quantization label, e.g. `"Q4_K_M"`.
    pub quantization_level: Option<String>,
    /// Raw architecture hint, e.g. `"llama"`, used by architecture_mappings.
    pub architecture: Option<String>,
    /// Content digest, when the backend can report one.
    pub digest: Option<String>,
    /// On-disk file format, e.g. `"gguf"`.
    pub format: Option<String>,
    /// Declared context window in tokens.
    pub max_context_length: Option<i64>,
    /// On-disk size in bytes, for this endpoint only.
    pub disk_size: Option<i64>,
    /// Declared model type, e.g. `"llm"`, `"vlm"`, `"embeddings"`.
    pub r#type: Option<String>,
    /// Declared publisher/org, e.g. `"mistralai"`.
    pub publisher: Option<String>,
    /// Caller-supplied platform hint; overrides name/format-based detection.
    pub platform_hint: Option<String>,
    /// Human-facing display name, if distinct from `name`.
    pub display_name: Option<String>,
    /// Open metadata bag (e.g. `ollama.version`, `lmstudio.version`).
    pub metadata: Metadata,
}

/// An alias by which a `UnifiedModel` may be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasEntry {
    pub name: String,
    pub source: String,
}

impl AliasEntry {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Operational state of a single endpoint as seen from the lifecycle layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    Online,
    Degraded,
    Offline,
    Removed,
}

impl Default for EndpointState {
    fn default() -> Self {
        Self::Online
    }
}

/// Per-endpoint health state tracked by the lifecycle unifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointStateInfo {
    pub state: EndpointState,
    pub last_state_change: i64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl EndpointStateInfo {
    pub fn new(now: i64) -> Self {
        Self {
            state: EndpointState::Online,
            last_state_change: now,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// The pair `(backend url, per-endpoint facts about this model)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEndpoint {
    pub url: String,
    pub display_name: String,
    pub native_name: String,
    pub state: EndpointState,
    pub disk_size: i64,
    pub last_seen: i64,
    pub last_state_check: i64,
    pub state_info: Option<EndpointStateInfo>,
}

/// The canonical, merged in-memory record for a model available somewhere
/// in the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedModel {
    pub id: String,
    pub family: String,
    pub variant: String,
    pub parameter_size: String,
    pub parameter_count: i64,
    pub quantization: String,
    pub format: String,
    pub aliases: Vec<AliasEntry>,
    pub source_endpoints: Vec<SourceEndpoint>,
    pub capabilities: Vec<String>,
    pub max_context_length: Option<i64>,
    pub disk_size: i64,
    pub last_seen: i64,
    pub metadata: Metadata,
    pub prompt_template_id: String,
}

impl UnifiedModel {
    /// Recomputes `disk_size` as the sum over all source endpoints.
    pub fn recompute_disk_size(&mut self) {
        self.disk_size = self.source_endpoints.iter().map(|e| e.disk_size).sum();
    }

    /// Recomputes `last_seen` as the max over all source endpoints.
    pub fn recompute_last_seen(&mut self) {
        self.last_seen = self.source_endpoints.iter().map(|e| e.last_seen).max().unwrap_or(0);
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c == cap)
    }

    pub fn has_alias_containing(&self, needle: &str) -> bool {
        self.aliases.iter().any(|a| a.name.to_lowercase().contains(needle))
    }
}

/// Aggregate merge counters, part of `Stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeStats {
    pub digest_matches: u64,
    pub name_matches: u64,
    pub conflicts_split: u64,
    pub creates: u64,
}

/// Snapshot of catalog-wide counters, returned by `stats()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub total_models: usize,
    pub total_aliases: usize,
    pub total_endpoints: usize,
    pub merge_stats: MergeStats,
}

/// Three-state circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time snapshot of a single endpoint's circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub half_open_requests: u32,
    pub last_failure_time: i64,
}
