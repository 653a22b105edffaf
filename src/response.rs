use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::FlowError;
use crate::task::{Complexity, ContextValue, DraftContent};

/// Query length bounds (characters).
pub const MAX_QUERY_CHARS: usize = 2048;

/// Context bounds: entry count and total serialized size.
pub const MAX_CONTEXT_ENTRIES: usize = 32;
pub const MAX_CONTEXT_BYTES: usize = 4096;

/// Caller timeout clamp range (ms).
pub const MIN_TIMEOUT_MS: u64 = 1_000;
pub const MAX_TIMEOUT_MS: u64 = 120_000;

/// One analytical question submitted to the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub tenant_id: String,
    #[serde(default)]
    pub context: BTreeMap<String, ContextValue>,
    pub timeout_ms: Option<u64>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            tenant_id: tenant_id.into(),
            context: BTreeMap::new(),
            timeout_ms: None,
        }
    }

    /// §6 input validation. Length limits are in characters for the query
    /// and serialized bytes for the context map.
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.query.trim().is_empty() {
            return Err(FlowError::InvalidRequest {
                detail: "query must not be empty".to_string(),
            });
        }
        let chars = self.query.chars().count();
        if chars > MAX_QUERY_CHARS {
            return Err(FlowError::InvalidRequest {
                detail: format!("query too long: {chars} chars (max {MAX_QUERY_CHARS})"),
            });
        }
        if self.tenant_id.trim().is_empty() {
            return Err(FlowError::InvalidRequest {
                detail: "tenant_id must not be empty".to_string(),
            });
        }
        if self.context.len() > MAX_CONTEXT_ENTRIES {
            return Err(FlowError::InvalidRequest {
                detail: format!(
                    "context has {} entries (max {MAX_CONTEXT_ENTRIES})",
                    self.context.len()
                ),
            });
        }
        let context_bytes = serde_json::to_vec(&self.context)
            .map(|v| v.len())
            .unwrap_or(usize::MAX);
        if context_bytes > MAX_CONTEXT_BYTES {
            return Err(FlowError::InvalidRequest {
                detail: format!("context is {context_bytes} bytes (max {MAX_CONTEXT_BYTES})"),
            });
        }
        Ok(())
    }

    /// Effective timeout: caller value clamped to the allowed range, or the
    /// configured default when absent.
    pub fn effective_timeout_ms(&self, default_ms: u64) -> u64 {
        match self.timeout_ms {
            Some(ms) => ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS),
            None => default_ms,
        }
    }
}

/// Caller-visible confidence label, derived from the validator's aggregate
/// quality score with fixed bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    #[serde(rename = "Very High")]
    VeryHigh,
    High,
    Moderate,
    Low,
    #[serde(rename = "Very Low")]
    VeryLow,
}

impl ConfidenceLevel {
    pub fn from_quality(score: f64) -> Self {
        if score >= 0.95 {
            Self::VeryHigh
        } else if score >= 0.85 {
            Self::High
        } else if score >= 0.70 {
            Self::Moderate
        } else if score >= 0.50 {
            Self::Low
        } else {
            Self::VeryLow
        }
    }
}

impl std::fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::VeryHigh => "Very High",
            Self::High => "High",
            Self::Moderate => "Moderate",
            Self::Low => "Low",
            Self::VeryLow => "Very Low",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VizKind {
    Line,
    Bar,
    Pie,
    Table,
    Heatmap,
    Scatter,
}

/// Rendering hint for the frontend. The engine never renders; it only
/// suggests a shape that fits the draft's data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visualization {
    #[serde(rename = "type")]
    pub kind: VizKind,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub task_id: String,
    pub complexity: Complexity,
    pub processing_time_ms: u64,
    pub revisions_used: u32,
    pub cached: bool,
}

/// The success payload for a delivered insight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightResponse {
    pub summary: String,
    pub detailed: DraftContent,
    pub confidence_level: ConfidenceLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visualization: Option<Visualization>,
    pub metadata: ResponseMetadata,
}

impl InsightResponse {
    /// Copy for a cache hit: same payload, `cached` flag flipped.
    pub fn as_cached(&self) -> Self {
        let mut copy = self.clone();
        copy.metadata.cached = true;
        copy
    }
}
