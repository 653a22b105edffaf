use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::error::FlowError;
use crate::task::Complexity;

/// Minimum quality_score the validator requires for approval, per complexity.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub simple: f64,
    pub standard: f64,
    pub complex: f64,
    pub critical: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            simple: 0.80,
            standard: 0.85,
            complex: 0.90,
            critical: 0.95,
        }
    }
}

impl Thresholds {
    pub fn for_complexity(&self, complexity: Complexity) -> f64 {
        match complexity {
            Complexity::Simple => self.simple,
            Complexity::Standard => self.standard,
            Complexity::Complex => self.complex,
            Complexity::Critical => self.critical,
        }
    }
}

/// Explicit configuration record threaded into the engine at construction.
/// No module-level state: everything tunable lives here.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Revision cycles allowed before a failing draft becomes a rejection.
    pub max_revisions: u32,
    /// Overall per-task deadline when the caller supplies none.
    pub query_timeout_ms: u64,
    /// Wall-time cap for a single model call, retries included.
    pub model_call_timeout_ms: u64,
    /// Wall-time cap for a single warehouse read.
    pub warehouse_call_timeout_ms: u64,
    /// Admission cap; arrivals beyond it fail with `overloaded`.
    pub max_active_tasks: usize,
    pub cache_capacity: usize,
    pub cache_ttl_ms: u64,
    /// Context keys that participate in cache fingerprints. Empty by default
    /// to maximise reuse; add keys only where context changes the answer.
    pub cache_context_keys: Vec<String>,
    /// Rows inlined verbatim into an analysis prompt; excess is summarised.
    pub max_rows_in_prompt: usize,
    /// Every validation axis must clear this floor regardless of aggregate.
    pub min_axis_score: f64,
    pub thresholds: Thresholds,
    /// Terminal tasks are retained this long for observability, then pruned.
    pub task_retention_ms: u64,
    pub model_retry_attempts: u32,
    pub model_retry_backoff_ms: u64,
    pub warehouse_row_cap: usize,
    pub warehouse_byte_cap: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_revisions: 2,
            query_timeout_ms: 30_000,
            model_call_timeout_ms: 12_000,
            warehouse_call_timeout_ms: 15_000,
            max_active_tasks: 256,
            cache_capacity: 1024,
            cache_ttl_ms: 3_600_000,
            cache_context_keys: Vec::new(),
            max_rows_in_prompt: 200,
            min_axis_score: 0.60,
            thresholds: Thresholds::default(),
            task_retention_ms: 300_000,
            model_retry_attempts: 3,
            model_retry_backoff_ms: 250,
            warehouse_row_cap: 10_000,
            warehouse_byte_cap: 4 * 1024 * 1024,
        }
    }
}

impl FlowConfig {
    /// Defaults overlaid with `FORECOURT_*` environment variables.
    /// A `.env` file is honoured if present; unparsable values are skipped
    /// with a warning rather than failing startup.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let mut config = Self::default();
        override_u32(&mut config.max_revisions, "FORECOURT_MAX_REVISIONS");
        override_u64(&mut config.query_timeout_ms, "FORECOURT_QUERY_TIMEOUT_MS");
        override_u64(
            &mut config.model_call_timeout_ms,
            "FORECOURT_MODEL_CALL_TIMEOUT_MS",
        );
        override_u64(
            &mut config.warehouse_call_timeout_ms,
            "FORECOURT_WAREHOUSE_CALL_TIMEOUT_MS",
        );
        override_usize(&mut config.max_active_tasks, "FORECOURT_MAX_ACTIVE_TASKS");
        override_usize(&mut config.cache_capacity, "FORECOURT_CACHE_CAPACITY");
        override_u64(&mut config.cache_ttl_ms, "FORECOURT_CACHE_TTL_MS");
        override_usize(
            &mut config.max_rows_in_prompt,
            "FORECOURT_MAX_ROWS_IN_PROMPT",
        );
        override_f64(&mut config.min_axis_score, "FORECOURT_MIN_AXIS_SCORE");
        override_u64(&mut config.task_retention_ms, "FORECOURT_TASK_RETENTION_MS");

        if let Ok(keys) = env::var("FORECOURT_CACHE_CONTEXT_KEYS") {
            config.cache_context_keys = keys
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
        }

        config
    }

    /// Load from a TOML file, then overlay environment overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, FlowError> {
        let raw = std::fs::read_to_string(path).map_err(|e| FlowError::InvalidRequest {
            detail: format!("cannot read config file {}: {e}", path.display()),
        })?;
        let config: Self = toml::from_str(&raw).map_err(|e| FlowError::InvalidRequest {
            detail: format!("cannot parse config file: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make the gate or the loop nonsensical.
    pub fn validate(&self) -> Result<(), FlowError> {
        if !(0.0..=1.0).contains(&self.min_axis_score) {
            return Err(FlowError::InvalidRequest {
                detail: format!("min_axis_score out of [0,1]: {}", self.min_axis_score),
            });
        }
        for (name, value) in [
            ("simple", self.thresholds.simple),
            ("standard", self.thresholds.standard),
            ("complex", self.thresholds.complex),
            ("critical", self.thresholds.critical),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(FlowError::InvalidRequest {
                    detail: format!("threshold {name} out of [0,1]: {value}"),
                });
            }
        }
        if self.query_timeout_ms == 0 || self.max_active_tasks == 0 || self.cache_capacity == 0 {
            return Err(FlowError::InvalidRequest {
                detail: "query_timeout_ms, max_active_tasks and cache_capacity must be non-zero"
                    .to_string(),
            });
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn model_call_timeout(&self) -> Duration {
        Duration::from_millis(self.model_call_timeout_ms)
    }

    pub fn warehouse_call_timeout(&self) -> Duration {
        Duration::from_millis(self.warehouse_call_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_millis(self.task_retention_ms)
    }
}

fn override_u64(slot: &mut u64, var: &str) {
    if let Ok(raw) = env::var(var) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!("{var}={raw} is not a valid integer — keeping {slot}"),
        }
    }
}

fn override_u32(slot: &mut u32, var: &str) {
    if let Ok(raw) = env::var(var) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!("{var}={raw} is not a valid integer — keeping {slot}"),
        }
    }
}

fn override_usize(slot: &mut usize, var: &str) {
    if let Ok(raw) = env::var(var) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!("{var}={raw} is not a valid integer — keeping {slot}"),
        }
    }
}

fn override_f64(slot: &mut f64, var: &str) {
    if let Ok(raw) = env::var(var) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!("{var}={raw} is not a valid number — keeping {slot}"),
        }
    }
}
