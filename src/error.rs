use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum FlowError {
    #[error("invalid request: {detail}")]
    InvalidRequest { detail: String },

    #[error("engine overloaded, retry after {retry_after_ms}ms")]
    Overloaded { retry_after_ms: u64 },

    #[error("task {task_id} timed out after {elapsed_ms}ms")]
    TimedOut { task_id: String, elapsed_ms: u64 },

    #[error("task {task_id} rejected after {revisions_used} revisions")]
    QualityRejected {
        task_id: String,
        last_feedback: Vec<String>,
        revisions_used: u32,
    },

    #[error("model unavailable: {detail}")]
    ModelUnavailable { task_id: String, detail: String },

    #[error("model response malformed: {detail}")]
    ModelMalformed { detail: String },

    #[error("classification failed for task {task_id}")]
    ClassificationFailed { task_id: String },

    #[error("specialist produced no draft for task {task_id}")]
    SpecialistFailed { task_id: String },

    #[error("warehouse unavailable: {detail}")]
    WarehouseUnavailable { task_id: String, detail: String },

    #[error("query template invalid: {detail}")]
    QueryInvalid { detail: String },

    #[error("warehouse query timed out: {detail}")]
    QueryTimeout { detail: String },

    #[error("warehouse access denied: {detail}")]
    AccessDenied { detail: String },

    #[error("task {task_id} not found")]
    TaskNotFound { task_id: String },

    #[error("precondition failed: {detail}")]
    PreconditionFailed { detail: String },

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {detail}")]
    Internal { detail: String },
}

impl FlowError {
    /// Stable machine-readable tag for the error kind. These are the strings
    /// the embedding layer serialises into the `error` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Overloaded { .. } => "overloaded",
            Self::TimedOut { .. } => "timed_out",
            Self::QualityRejected { .. } => "quality_rejected",
            Self::ModelUnavailable { .. } => "model_unavailable",
            Self::ModelMalformed { .. } => "model_malformed",
            Self::ClassificationFailed { .. } => "classification_failed",
            Self::SpecialistFailed { .. } => "specialist_failed",
            Self::WarehouseUnavailable { .. } => "warehouse_unavailable",
            Self::QueryInvalid { .. } => "query_invalid",
            Self::QueryTimeout { .. } => "query_timeout",
            Self::AccessDenied { .. } => "access_denied",
            Self::TaskNotFound { .. } => "task_not_found",
            Self::PreconditionFailed { .. } => "precondition_failed",
            Self::Cancelled => "cancelled",
            Self::Internal { .. } => "internal",
        }
    }

    /// Attach a task id to variants that carry one. Façades construct errors
    /// before a task identity exists; the engine fills it in at the boundary.
    pub fn with_task(self, id: &str) -> Self {
        match self {
            Self::TimedOut { elapsed_ms, .. } => Self::TimedOut {
                task_id: id.to_string(),
                elapsed_ms,
            },
            Self::ModelUnavailable { detail, .. } => Self::ModelUnavailable {
                task_id: id.to_string(),
                detail,
            },
            Self::ClassificationFailed { .. } => Self::ClassificationFailed {
                task_id: id.to_string(),
            },
            Self::SpecialistFailed { .. } => Self::SpecialistFailed {
                task_id: id.to_string(),
            },
            Self::WarehouseUnavailable { detail, .. } => Self::WarehouseUnavailable {
                task_id: id.to_string(),
                detail,
            },
            other => other,
        }
    }

    /// Produce a sanitized message safe for returning to callers.
    /// Does not leak upstream URLs, response bodies, or template text.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidRequest { detail } => format!("invalid request: {detail}"),
            Self::Overloaded { retry_after_ms } => {
                format!("engine at capacity — retry after {retry_after_ms}ms")
            }
            Self::TimedOut { elapsed_ms, .. } => format!("query timed out after {elapsed_ms}ms"),
            Self::QualityRejected { revisions_used, .. } => format!(
                "insight did not pass validation after {revisions_used} revisions — rephrase the question"
            ),
            Self::ModelUnavailable { .. } => "analysis model unavailable".to_string(),
            Self::ModelMalformed { .. } => {
                "analysis model returned an unusable response".to_string()
            }
            Self::ClassificationFailed { .. } => "could not classify the question".to_string(),
            Self::SpecialistFailed { .. } => "analysis could not be completed".to_string(),
            Self::WarehouseUnavailable { .. } => "dealership data store unavailable".to_string(),
            Self::QueryInvalid { .. } => "generated data query was rejected".to_string(),
            Self::QueryTimeout { .. } => "data query timed out".to_string(),
            Self::AccessDenied { .. } => "data access denied for this tenant".to_string(),
            Self::TaskNotFound { task_id } => format!("unknown task: {task_id}"),
            Self::PreconditionFailed { .. } | Self::Internal { .. } => {
                "an internal error occurred".to_string()
            }
            Self::Cancelled => "request cancelled".to_string(),
        }
    }

    /// The caller-visible failure payload. `precondition_failed` is a
    /// programming error and is reported as `internal` here; the real kind
    /// goes to logs only.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::InvalidRequest { detail } => {
                json!({"error": "invalid_request", "detail": detail})
            }
            Self::Overloaded { retry_after_ms } => {
                json!({"error": "overloaded", "retry_after_ms": retry_after_ms})
            }
            Self::TimedOut { task_id, elapsed_ms } => {
                json!({"error": "timed_out", "task_id": task_id, "elapsed_ms": elapsed_ms})
            }
            Self::QualityRejected {
                task_id,
                last_feedback,
                revisions_used,
            } => json!({
                "error": "quality_rejected",
                "task_id": task_id,
                "last_feedback": last_feedback,
                "revisions_used": revisions_used,
            }),
            Self::ModelUnavailable { task_id, .. } => {
                json!({"error": "model_unavailable", "task_id": task_id})
            }
            Self::ClassificationFailed { task_id } => {
                json!({"error": "classification_failed", "task_id": task_id})
            }
            Self::SpecialistFailed { task_id } => {
                json!({"error": "specialist_failed", "task_id": task_id})
            }
            Self::WarehouseUnavailable { task_id, .. } => {
                json!({"error": "warehouse_unavailable", "task_id": task_id})
            }
            Self::PreconditionFailed { .. } | Self::Internal { .. } => {
                json!({"error": "internal", "detail": self.user_message()})
            }
            other => json!({"error": other.kind(), "detail": other.user_message()}),
        }
    }
}
