use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::clients::model::ModelClient;
use crate::config::Thresholds;
use crate::error::FlowError;
use crate::task::{Complexity, Draft, Task, ValidationScores};

/// System prompt for the validation assessment call. The model is an
/// analytical aid only: its axis estimates are clamped by the deterministic
/// cross-checks below before any decision is made.
pub const VALIDATE_SYSTEM_PROMPT: &str = "You are the validation tier of a dealership \
analytics assistant. Assess the draft insight against the question and the declared data \
reads. Reply with ONLY a JSON object of the form {\"data_accuracy\": 0..1, \
\"methodology\": 0..1, \"business_logic\": 0..1, \"compliance\": 0..1, \"issues\": [str]}.";

/// The quality gate's outcome for one draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Revise,
    Reject,
}

#[derive(Debug, Clone)]
pub struct Verdict {
    pub decision: Decision,
    pub scores: ValidationScores,
    pub quality: f64,
    pub feedback: Vec<String>,
}

/// Model-reported axis estimates. Missing axes default to a neutral 0.7 so
/// a sparse reply neither auto-approves nor auto-rejects.
#[derive(Debug, Deserialize)]
struct ModelAssessment {
    #[serde(default = "neutral")]
    data_accuracy: f64,
    #[serde(default = "neutral")]
    methodology: f64,
    #[serde(default = "neutral")]
    business_logic: f64,
    #[serde(default = "neutral")]
    compliance: f64,
    #[serde(default)]
    issues: Vec<String>,
}

fn neutral() -> f64 {
    0.7
}

impl Default for ModelAssessment {
    fn default() -> Self {
        Self {
            data_accuracy: neutral(),
            methodology: neutral(),
            business_logic: neutral(),
            compliance: neutral(),
            issues: vec!["validator assessment unavailable".to_string()],
        }
    }
}

/// An axis cap triggered by a deterministic cross-check.
struct Cap {
    limit: f64,
    remediation: &'static str,
}

/// Tier 3: scores drafts on four axes and decides approve/revise/reject.
/// Stateless; the threshold table and axis floor come from configuration.
pub struct Validator {
    model: Arc<ModelClient>,
    thresholds: Thresholds,
    min_axis: f64,
    max_revisions: u32,
}

impl Validator {
    pub fn new(
        model: Arc<ModelClient>,
        thresholds: Thresholds,
        min_axis: f64,
        max_revisions: u32,
    ) -> Self {
        Self {
            model,
            thresholds,
            min_axis,
            max_revisions,
        }
    }

    pub async fn validate(
        &self,
        task: &Task,
        draft: &Draft,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Verdict, FlowError> {
        let complexity = task.complexity.unwrap_or(Complexity::Standard);

        let assessment = match self
            .model
            .generate(
                &assessment_prompt(task, draft),
                Some(VALIDATE_SYSTEM_PROMPT),
                true,
                deadline,
                cancel,
            )
            .await
        {
            Ok(reply) => serde_json::from_str::<ModelAssessment>(&reply.text).unwrap_or_else(|e| {
                tracing::warn!(task = %task.id, "validator assessment unparsable: {e}");
                ModelAssessment::default()
            }),
            Err(FlowError::ModelMalformed { detail }) => {
                tracing::warn!(task = %task.id, "validator assessment malformed: {detail}");
                ModelAssessment::default()
            }
            Err(e) => return Err(e),
        };

        // Deterministic score assembly: model estimate, clamped to [0,1],
        // then capped by each triggered cross-check.
        let mut feedback: Vec<String> = Vec::new();

        let data_accuracy = apply_caps(
            assessment.data_accuracy,
            data_accuracy_caps(draft),
            &mut feedback,
        );
        let methodology = apply_caps(
            assessment.methodology,
            methodology_caps(&task.query, draft),
            &mut feedback,
        );
        let business_logic = apply_caps(
            assessment.business_logic,
            business_logic_caps(draft),
            &mut feedback,
        );
        let compliance = apply_caps(
            assessment.compliance,
            compliance_caps(draft),
            &mut feedback,
        );

        let scores = ValidationScores {
            data_accuracy,
            methodology,
            business_logic,
            compliance,
        };
        let quality = scores.aggregate();
        let threshold = self.thresholds.for_complexity(complexity);

        let approvable = quality >= threshold && scores.min_axis() >= self.min_axis;
        let decision = if approvable {
            Decision::Approve
        } else if task.revisions_used >= self.max_revisions {
            Decision::Reject
        } else {
            Decision::Revise
        };

        if decision != Decision::Approve {
            // Enumerate each failing axis with a remediation, then append the
            // model's own issues for the specialist to work from.
            for (axis, score, remediation) in [
                ("data_accuracy", data_accuracy, "cite the data source for each metric"),
                ("methodology", methodology, "state the analytical method used"),
                ("business_logic", business_logic, "tie each recommendation to a metric"),
                ("compliance", compliance, "remove out-of-scope or identifying content"),
            ] {
                if score < threshold {
                    let line = format!("{axis} at {score:.2} below {threshold:.2}: {remediation}");
                    if !feedback.contains(&line) {
                        feedback.push(line);
                    }
                }
            }
            for issue in assessment.issues {
                if !feedback.contains(&issue) {
                    feedback.push(issue);
                }
            }
        }

        tracing::debug!(
            task = %task.id,
            %complexity,
            quality,
            threshold,
            ?decision,
            "validation verdict"
        );

        Ok(Verdict {
            decision,
            scores,
            quality,
            feedback,
        })
    }
}

fn assessment_prompt(task: &Task, draft: &Draft) -> String {
    let reads: Vec<String> = draft
        .queries_executed
        .iter()
        .map(|q| {
            format!(
                "{} ({} rows{})",
                q.source,
                q.rows_returned,
                if q.truncated { ", truncated" } else { "" }
            )
        })
        .collect();
    format!(
        "Question: {}\nDeclared reads: {}\nDraft: {}",
        task.query,
        if reads.is_empty() {
            "none".to_string()
        } else {
            reads.join(", ")
        },
        serde_json::to_string(&draft.content).unwrap_or_else(|_| "{}".to_string()),
    )
}

fn apply_caps(model_score: f64, caps: Vec<Cap>, feedback: &mut Vec<String>) -> f64 {
    let mut score = model_score.clamp(0.0, 1.0);
    for cap in caps {
        if score > cap.limit {
            score = cap.limit;
        }
        feedback.push(cap.remediation.to_string());
    }
    score
}

/// Numbers must reconcile with the declared reads: no metrics without a
/// source, no unusable values, no empty draft scoring well.
fn data_accuracy_caps(draft: &Draft) -> Vec<Cap> {
    let mut caps = Vec::new();
    if draft.content.is_empty() {
        caps.push(Cap {
            limit: 0.2,
            remediation: "draft has no analyzable content",
        });
        return caps;
    }
    if draft.queries_executed.is_empty() {
        caps.push(Cap {
            limit: 0.3,
            remediation: "cite data source for each metric",
        });
    }
    if draft.content.key_metrics.is_empty() {
        caps.push(Cap {
            limit: 0.55,
            remediation: "include key metrics derived from the data",
        });
    }
    if draft
        .content
        .key_metrics
        .values()
        .any(|v| !v.is_finite())
    {
        caps.push(Cap {
            limit: 0.2,
            remediation: "replace non-finite metric values",
        });
    }
    if draft.queries_executed.iter().all(|q| q.rows_returned == 0)
        && !draft.queries_executed.is_empty()
        && !draft.content.key_metrics.is_empty()
    {
        caps.push(Cap {
            limit: 0.4,
            remediation: "metrics reported but all reads returned zero rows",
        });
    }
    caps
}

/// Forecasts need a stated horizon and method; comparisons need comparable
/// windows; rankings need a stated ordering key.
fn methodology_caps(query: &str, draft: &Draft) -> Vec<Cap> {
    let mut caps = Vec::new();
    let q = query.to_lowercase();
    let text = draft_text(draft);

    let forecast_query = ["forecast", "predict", "projection", "next "]
        .iter()
        .any(|k| q.contains(k));
    if forecast_query {
        let horizon_stated = ["horizon", "quarter", "month", "week", "year", "days"]
            .iter()
            .any(|k| text.contains(k));
        if !horizon_stated {
            caps.push(Cap {
                limit: 0.5,
                remediation: "state forecast horizon",
            });
        }
        let method_stated = ["trend", "average", "regression", "seasonal", "run-rate", "method"]
            .iter()
            .any(|k| text.contains(k));
        if !method_stated {
            caps.push(Cap {
                limit: 0.55,
                remediation: "state the forecast method class",
            });
        }
    }

    let comparison_query = ["compare", " vs ", "versus", "than last"]
        .iter()
        .any(|k| q.contains(k));
    if comparison_query {
        let window_stated = ["same period", "prior", "previous", "last year", "last quarter", "last month"]
            .iter()
            .any(|k| text.contains(k));
        if !window_stated {
            caps.push(Cap {
                limit: 0.55,
                remediation: "include prior-period comparison over comparable windows",
            });
        }
    }

    let ranking_query = ["top ", "rank", "best", "highest", "lowest"]
        .iter()
        .any(|k| q.contains(k));
    if ranking_query {
        let ordering_stated = text.contains(" by ") || text.contains("ordered");
        if !ordering_stated {
            caps.push(Cap {
                limit: 0.6,
                remediation: "state the ordering key for the ranking",
            });
        }
    }

    caps
}

/// Insights and recommendations must follow from the metrics.
fn business_logic_caps(draft: &Draft) -> Vec<Cap> {
    let mut caps = Vec::new();
    if draft.content.is_empty() {
        return caps; // already floored by data_accuracy
    }
    if !draft.content.recommendations.is_empty() && draft.content.key_metrics.is_empty() {
        caps.push(Cap {
            limit: 0.5,
            remediation: "support recommendations with metrics",
        });
    }
    if draft.content.insights.is_empty() {
        caps.push(Cap {
            limit: 0.6,
            remediation: "derive at least one insight from the data",
        });
    }
    caps
}

/// No personally-identifying fields, no out-of-scope advice, no instruction
/// echoes.
fn compliance_caps(draft: &Draft) -> Vec<Cap> {
    let mut caps = Vec::new();
    let text = draft_text(draft);

    let pii = text.contains('@')
        || text.contains("ssn")
        || text.contains("social security")
        || has_long_digit_run(&text, 9);
    if pii {
        caps.push(Cap {
            limit: 0.2,
            remediation: "remove personally-identifying data",
        });
    }

    let echo = ["as an ai", "system prompt", "i cannot", "reply with json"]
        .iter()
        .any(|k| text.contains(k));
    if echo {
        caps.push(Cap {
            limit: 0.3,
            remediation: "remove model-instruction echoes",
        });
    }

    caps
}

fn draft_text(draft: &Draft) -> String {
    let mut text = draft.content.summary.to_lowercase();
    for insight in &draft.content.insights {
        text.push(' ');
        text.push_str(&insight.to_lowercase());
    }
    for rec in &draft.content.recommendations {
        text.push(' ');
        text.push_str(&rec.action.to_lowercase());
    }
    text
}

fn has_long_digit_run(text: &str, run: usize) -> bool {
    let mut count = 0usize;
    for c in text.chars() {
        if c.is_ascii_digit() {
            count += 1;
            if count >= run {
                return true;
            }
        } else {
            count = 0;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ModelTransport, TransportError};
    use crate::task::{DraftContent, QueryExecution, Recommendation, SpecialistKind};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct CannedModel {
        reply: String,
    }

    #[async_trait]
    impl ModelTransport for CannedModel {
        async fn complete(
            &self,
            _prompt: &str,
            _system: Option<&str>,
            _cancel: &CancellationToken,
        ) -> Result<String, TransportError> {
            Ok(self.reply.clone())
        }
    }

    fn validator(assessment: &str, max_revisions: u32) -> Validator {
        let model = Arc::new(ModelClient::new(
            Arc::new(CannedModel {
                reply: assessment.into(),
            }),
            Duration::from_secs(5),
            3,
            Duration::from_millis(1),
        ));
        Validator::new(model, Thresholds::default(), 0.60, max_revisions)
    }

    fn task(query: &str, complexity: Complexity) -> Task {
        let mut t = Task::new(
            "t-1".into(),
            query.into(),
            "d1".into(),
            BTreeMap::new(),
            "fp".into(),
            Instant::now() + Duration::from_secs(30),
            2,
        );
        t.complexity = Some(complexity);
        t
    }

    fn good_draft() -> Draft {
        Draft::new(
            SpecialistKind::Standard,
            DraftContent {
                summary: "Sold 41 units by units sold".into(),
                key_metrics: BTreeMap::from([("units".to_string(), 41.0)]),
                insights: vec!["demand held steady month over month".into()],
                recommendations: vec![Recommendation {
                    priority: "medium".into(),
                    action: "keep current stocking levels".into(),
                }],
                changes: None,
            },
            vec![QueryExecution {
                source: "sales".into(),
                template: "SELECT ...".into(),
                rows_returned: 30,
                truncated: false,
            }],
            0.9,
        )
    }

    const HIGH_ASSESSMENT: &str = r#"{"data_accuracy": 0.95, "methodology": 0.9,
        "business_logic": 0.9, "compliance": 1.0, "issues": []}"#;

    #[tokio::test]
    async fn approves_above_threshold() {
        let v = validator(HIGH_ASSESSMENT, 2);
        let t = task("units sold last month", Complexity::Simple);
        let verdict = v
            .validate(
                &t,
                &good_draft(),
                Instant::now() + Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::Approve);
        assert!(verdict.quality >= 0.80, "quality: {}", verdict.quality);
    }

    #[tokio::test]
    async fn same_quality_fails_higher_band() {
        // 0.92 aggregate approves at complex but not at critical.
        let v = validator(
            r#"{"data_accuracy": 0.92, "methodology": 0.92,
                "business_logic": 0.92, "compliance": 0.92, "issues": []}"#,
            2,
        );
        let complex = v
            .validate(
                &task("units sold", Complexity::Complex),
                &good_draft(),
                Instant::now() + Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(complex.decision, Decision::Approve);

        let critical = v
            .validate(
                &task("units sold", Complexity::Critical),
                &good_draft(),
                Instant::now() + Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(critical.decision, Decision::Revise);
    }

    #[tokio::test]
    async fn low_axis_blocks_despite_aggregate() {
        // Aggregate 0.35·1 + 0.25·0.5 + 0.25·1 + 0.15·1 = 0.85 but
        // methodology 0.5 is below the 0.6 floor.
        let v = validator(
            r#"{"data_accuracy": 1.0, "methodology": 0.5,
                "business_logic": 1.0, "compliance": 1.0, "issues": []}"#,
            2,
        );
        let verdict = v
            .validate(
                &task("units sold", Complexity::Simple),
                &good_draft(),
                Instant::now() + Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::Revise);
    }

    #[tokio::test]
    async fn missing_horizon_caps_methodology() {
        let v = validator(HIGH_ASSESSMENT, 2);
        let t = task("forecast next quarter revenue", Complexity::Complex);
        let mut draft = good_draft();
        draft.content.summary = "Revenue will grow".into();
        draft.content.insights = vec!["growth continues".into()];
        let verdict = v
            .validate(
                &t,
                &draft,
                Instant::now() + Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::Revise);
        assert!(
            verdict
                .feedback
                .iter()
                .any(|f| f.contains("state forecast horizon")),
            "feedback: {:?}",
            verdict.feedback
        );
        assert!(verdict.scores.methodology <= 0.5);
    }

    #[tokio::test]
    async fn stated_horizon_passes_forecast_check() {
        let v = validator(HIGH_ASSESSMENT, 2);
        let t = task("forecast next quarter revenue", Complexity::Complex);
        let mut draft = good_draft();
        draft.content.summary =
            "Next quarter projects 1.2M using a seasonal trend method".into();
        let verdict = v
            .validate(
                &t,
                &draft,
                Instant::now() + Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::Approve);
    }

    #[tokio::test]
    async fn empty_draft_is_floored() {
        let v = validator(HIGH_ASSESSMENT, 2);
        let t = task("units sold", Complexity::Simple);
        let draft = Draft::new(SpecialistKind::Standard, DraftContent::default(), vec![], 0.7);
        let verdict = v
            .validate(
                &t,
                &draft,
                Instant::now() + Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(verdict.scores.data_accuracy <= 0.2);
        assert_ne!(verdict.decision, Decision::Approve);
    }

    #[tokio::test]
    async fn pii_caps_compliance() {
        let v = validator(HIGH_ASSESSMENT, 2);
        let t = task("units sold", Complexity::Simple);
        let mut draft = good_draft();
        draft.content.insights = vec!["call buyer jane@example.com about the Crown".into()];
        let verdict = v
            .validate(
                &t,
                &draft,
                Instant::now() + Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(verdict.scores.compliance <= 0.2);
        assert_ne!(verdict.decision, Decision::Approve);
    }

    #[tokio::test]
    async fn rejects_at_revision_cap() {
        let v = validator(
            r#"{"data_accuracy": 0.5, "methodology": 0.5,
                "business_logic": 0.5, "compliance": 0.5, "issues": ["weak"]}"#,
            2,
        );
        let mut t = task("units sold", Complexity::Simple);
        t.revisions_used = 2;
        let verdict = v
            .validate(
                &t,
                &good_draft(),
                Instant::now() + Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::Reject);
        assert!(verdict.feedback.iter().any(|f| f == "weak"));
    }

    #[tokio::test]
    async fn zero_budget_first_revise_becomes_reject() {
        let v = validator(
            r#"{"data_accuracy": 0.5, "methodology": 0.5,
                "business_logic": 0.5, "compliance": 0.5, "issues": []}"#,
            0,
        );
        let verdict = v
            .validate(
                &task("units sold", Complexity::Simple),
                &good_draft(),
                Instant::now() + Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::Reject);
    }

    #[tokio::test]
    async fn malformed_assessment_degrades_not_fails() {
        let v = validator("not json at all", 2);
        let verdict = v
            .validate(
                &task("units sold", Complexity::Simple),
                &good_draft(),
                Instant::now() + Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        // Neutral 0.7 axes cannot clear the 0.80 simple threshold.
        assert_eq!(verdict.decision, Decision::Revise);
    }

    #[test]
    fn digit_run_detection() {
        assert!(has_long_digit_run("vin 123456789", 9));
        assert!(!has_long_digit_run("q3 2024 had 41 units", 9));
    }
}
