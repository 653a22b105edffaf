use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::FlowError;

/// Complexity band assigned by the dispatcher. Drives specialist selection
/// and the validator's approval threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Standard,
    Complex,
    Critical,
}

impl Complexity {
    pub fn specialist(self) -> SpecialistKind {
        match self {
            Self::Simple | Self::Standard => SpecialistKind::Standard,
            Self::Complex | Self::Critical => SpecialistKind::Senior,
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Standard => write!(f, "standard"),
            Self::Complex => write!(f, "complex"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// The two tier-2 variants. A closed set: routing is a match, not dynamic
/// dispatch over open implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialistKind {
    Standard,
    Senior,
}

impl std::fmt::Display for SpecialistKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Senior => write!(f, "senior"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Analyzing,
    Generating,
    Validating,
    Revising,
    Approved,
    Rejected,
    Failed,
    TimedOut,
    Delivered,
}

impl TaskStatus {
    /// Statuses that admit no further transitions. `Approved` is excluded:
    /// it admits exactly one more step, to `Delivered`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Failed | Self::TimedOut | Self::Delivered
        )
    }

    /// True once the task has left the working stages for good, including
    /// `Approved` (which only formats and delivers from there).
    pub fn is_settled(self) -> bool {
        self.is_terminal() || self == Self::Approved
    }

    /// Which tier holds responsibility while in this status.
    pub fn tier(self) -> u8 {
        match self {
            Self::Pending | Self::Analyzing | Self::Approved | Self::Delivered => 1,
            Self::Generating | Self::Revising => 2,
            Self::Validating => 3,
            Self::Rejected | Self::Failed | Self::TimedOut => 3,
        }
    }

    /// The §4.H transition table. `Failed` and `TimedOut` are reachable from
    /// any non-terminal status; everything else is explicit.
    pub fn allows(self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Self::Failed) | (_, Self::TimedOut) => self != Self::Approved || next == Self::TimedOut,
            (Self::Pending, Self::Analyzing) => true,
            (Self::Analyzing, Self::Generating) => true,
            (Self::Generating, Self::Validating) => true,
            (Self::Validating, Self::Revising) => true,
            (Self::Validating, Self::Approved) => true,
            (Self::Validating, Self::Rejected) => true,
            (Self::Revising, Self::Generating) => true,
            (Self::Approved, Self::Delivered) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Generating => "generating",
            Self::Validating => "validating",
            Self::Revising => "revising",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Delivered => "delivered",
        };
        write!(f, "{s}")
    }
}

/// Caller-supplied context value. Opaque to the core except for pass-through
/// to the model and optional participation in cache fingerprints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Num(f64),
    Str(String),
}

impl std::fmt::Display for ContextValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Num(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

/// One recommendation inside a draft's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: String,
    pub action: String,
}

/// The structured payload a specialist produces and the dispatcher formats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DraftContent {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
    /// How each revision-feedback issue was addressed; present only on
    /// revised drafts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<String>>,
}

impl DraftContent {
    pub fn is_empty(&self) -> bool {
        self.summary.is_empty()
            && self.key_metrics.is_empty()
            && self.insights.is_empty()
            && self.recommendations.is_empty()
    }
}

/// Description of one warehouse read a specialist performed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryExecution {
    pub source: String,
    pub template: String,
    pub rows_returned: usize,
    pub truncated: bool,
}

/// Per-axis validation scores, each in [0, 1]. Written by the validator only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationScores {
    pub data_accuracy: f64,
    pub methodology: f64,
    pub business_logic: f64,
    pub compliance: f64,
}

impl ValidationScores {
    /// Weighted aggregate: accuracy dominates, compliance is the smallest
    /// slice but gated separately by the minimum-axis rule.
    pub fn aggregate(&self) -> f64 {
        0.35 * self.data_accuracy
            + 0.25 * self.methodology
            + 0.25 * self.business_logic
            + 0.15 * self.compliance
    }

    pub fn min_axis(&self) -> f64 {
        self.data_accuracy
            .min(self.methodology)
            .min(self.business_logic)
            .min(self.compliance)
    }
}

/// One specialist output under consideration by the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub author: SpecialistKind,
    pub content: DraftContent,
    pub queries_executed: Vec<QueryExecution>,
    pub self_confidence: f64,
    pub validation_scores: Option<ValidationScores>,
    pub quality_score: Option<f64>,
    pub validation_feedback: Vec<String>,
}

impl Draft {
    pub fn new(author: SpecialistKind, content: DraftContent, reads: Vec<QueryExecution>, self_confidence: f64) -> Self {
        Self {
            author,
            content,
            queries_executed: reads,
            self_confidence: self_confidence.clamp(0.0, 1.0),
            validation_scores: None,
            quality_score: None,
            validation_feedback: Vec::new(),
        }
    }
}

/// An event recorded on the task, oldest first.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub at: Instant,
    pub kind: String,
    pub message: String,
}

/// The unit of work: one end-to-end processing of a user query.
///
/// Mutated only through `TaskStore::update`; every mutation goes through the
/// methods below, which own the §3 invariants.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub query: String,
    pub tenant_id: String,
    pub context: BTreeMap<String, ContextValue>,
    pub fingerprint: String,
    pub complexity: Option<Complexity>,
    pub status: TaskStatus,
    pub current_tier: u8,
    pub drafts: Vec<Draft>,
    pub validated_draft: Option<usize>,
    pub revisions_used: u32,
    pub errors: Vec<TaskEvent>,
    pub created_at: Instant,
    pub updated_at: Instant,
    pub deadline: Instant,
    /// Copied from config at creation so the record can gate its own caps.
    pub max_revisions: u32,
}

impl Task {
    pub fn new(
        id: String,
        query: String,
        tenant_id: String,
        context: BTreeMap<String, ContextValue>,
        fingerprint: String,
        deadline: Instant,
        max_revisions: u32,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            query,
            tenant_id,
            context,
            fingerprint,
            complexity: None,
            status: TaskStatus::Pending,
            current_tier: 1,
            drafts: Vec::new(),
            validated_draft: None,
            revisions_used: 0,
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
            deadline,
            max_revisions,
        }
    }

    /// Apply a status transition, rejecting anything outside the §4.H table.
    /// Entering `Revising` consumes one revision from the budget.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), FlowError> {
        if !self.status.allows(next) {
            return Err(FlowError::PreconditionFailed {
                detail: format!("task {}: illegal transition {} -> {next}", self.id, self.status),
            });
        }
        if next == TaskStatus::Revising {
            if self.revisions_used >= self.max_revisions {
                return Err(FlowError::PreconditionFailed {
                    detail: format!(
                        "task {}: revision budget exhausted ({})",
                        self.id, self.max_revisions
                    ),
                });
            }
            self.revisions_used += 1;
        }
        if matches!(next, TaskStatus::Approved | TaskStatus::Delivered)
            && self.validated_draft.is_none()
        {
            return Err(FlowError::PreconditionFailed {
                detail: format!("task {}: {next} without a validated draft", self.id),
            });
        }
        self.status = next;
        self.current_tier = next.tier();
        self.updated_at = Instant::now();
        Ok(())
    }

    /// Append a specialist draft. Drafts are append-only and capped at
    /// `max_revisions + 1`.
    pub fn push_draft(&mut self, draft: Draft) -> Result<usize, FlowError> {
        if self.status.is_terminal() {
            return Err(FlowError::PreconditionFailed {
                detail: format!("task {}: draft appended to terminal task", self.id),
            });
        }
        let cap = self.max_revisions as usize + 1;
        if self.drafts.len() >= cap {
            return Err(FlowError::PreconditionFailed {
                detail: format!("task {}: draft cap {cap} reached", self.id),
            });
        }
        self.drafts.push(draft);
        self.updated_at = Instant::now();
        Ok(self.drafts.len() - 1)
    }

    /// Record the validator's verdict on a draft. Validation fields are
    /// written here and nowhere else.
    pub fn set_validation(
        &mut self,
        index: usize,
        scores: ValidationScores,
        quality: f64,
        feedback: Vec<String>,
    ) -> Result<(), FlowError> {
        let id = self.id.clone();
        let draft = self
            .drafts
            .get_mut(index)
            .ok_or_else(|| FlowError::PreconditionFailed {
                detail: format!("task {id}: no draft at index {index}"),
            })?;
        draft.validation_scores = Some(scores);
        draft.quality_score = Some(quality.clamp(0.0, 1.0));
        draft.validation_feedback = feedback;
        self.updated_at = Instant::now();
        Ok(())
    }

    /// Mark a validated draft as the approved one. Requires the validator to
    /// have scored it first.
    pub fn approve_draft(&mut self, index: usize) -> Result<(), FlowError> {
        let scored = self
            .drafts
            .get(index)
            .is_some_and(|d| d.quality_score.is_some());
        if !scored {
            return Err(FlowError::PreconditionFailed {
                detail: format!("task {}: approving unscored draft {index}", self.id),
            });
        }
        self.validated_draft = Some(index);
        self.updated_at = Instant::now();
        Ok(())
    }

    pub fn record_error(&mut self, kind: &str, message: impl Into<String>) {
        self.errors.push(TaskEvent {
            at: Instant::now(),
            kind: kind.to_string(),
            message: message.into(),
        });
        self.updated_at = Instant::now();
    }

    pub fn approved_draft(&self) -> Option<&Draft> {
        self.validated_draft.and_then(|i| self.drafts.get(i))
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }
}
