use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::clients::RowSet;
use crate::clients::model::ModelClient;
use crate::clients::warehouse::WarehouseClient;
use crate::error::FlowError;
use crate::task::{Draft, DraftContent, QueryExecution, SpecialistKind, Task};

/// Prompt for simple/standard questions: aggregation, trends, basic ranking.
pub const STANDARD_SYSTEM_PROMPT: &str = "You are a dealership data analyst. Using ONLY the \
data provided, answer the question with a JSON object of the form {\"summary\": str, \
\"key_metrics\": {str: number}, \"insights\": [str], \"recommendations\": [{\"priority\": str, \
\"action\": str}]}. Focus on aggregates, trends, and rankings. Reply with JSON only.";

/// Prompt for complex/critical questions: adds forecasting, anomaly
/// callouts, and multi-axis comparison duties.
pub const SENIOR_SYSTEM_PROMPT: &str = "You are a senior dealership analyst. Using ONLY the \
data provided, answer the question with a JSON object of the form {\"summary\": str, \
\"key_metrics\": {str: number}, \"insights\": [str], \"recommendations\": [{\"priority\": str, \
\"action\": str}]}. For forecasts, always state the horizon and the method used. Call out \
anomalies explicitly and compare across time windows where the data allows. When revision \
feedback is present, address every listed issue and enumerate what changed in a \
\"changes\": [str] field. Reply with JSON only.";

/// Confidence heuristic weights.
const BASE_CONFIDENCE: f64 = 0.9;
const MISSING_SOURCE_PENALTY: f64 = 0.2;
const TRUNCATION_PENALTY: f64 = 0.1;
const RETRY_PENALTY: f64 = 0.15;

/// A planned warehouse read for one data source.
struct PlannedRead {
    source: &'static str,
    template: &'static str,
}

/// Fixed per-source read templates. The tenant filter is always a bound
/// parameter; specialists never interpolate identifiers or values.
const READ_TEMPLATES: &[PlannedRead] = &[
    PlannedRead {
        source: "sales",
        template: "SELECT sold_at, model, units, revenue FROM sales \
                   WHERE tenant_id = $tenant ORDER BY sold_at DESC",
    },
    PlannedRead {
        source: "inventory",
        template: "SELECT model, trim, days_on_lot, asking_price FROM inventory \
                   WHERE tenant_id = $tenant ORDER BY days_on_lot DESC",
    },
    PlannedRead {
        source: "service",
        template: "SELECT opened_at, category, labor_hours, parts_revenue FROM service_orders \
                   WHERE tenant_id = $tenant ORDER BY opened_at DESC",
    },
    PlannedRead {
        source: "customers",
        template: "SELECT segment, first_visit, lifetime_value FROM customer_segments \
                   WHERE tenant_id = $tenant",
    },
    PlannedRead {
        source: "finance",
        template: "SELECT month, gross_profit, floorplan_cost FROM finance_summary \
                   WHERE tenant_id = $tenant ORDER BY month DESC",
    },
];

/// What a drafting pass produced, beyond the draft itself.
pub struct SpecialistOutput {
    pub draft: Draft,
    /// (kind, message) pairs for the engine to record on the task.
    pub warnings: Vec<(String, String)>,
}

/// Tier 2: turns a classified question plus warehouse data into a draft
/// insight. Stateless; one instance per variant is shared across tasks.
pub struct Specialist {
    kind: SpecialistKind,
    model: Arc<ModelClient>,
    warehouse: Arc<WarehouseClient>,
    max_rows_in_prompt: usize,
}

impl Specialist {
    pub fn new(
        kind: SpecialistKind,
        model: Arc<ModelClient>,
        warehouse: Arc<WarehouseClient>,
        max_rows_in_prompt: usize,
    ) -> Self {
        Self {
            kind,
            model,
            warehouse,
            max_rows_in_prompt,
        }
    }

    pub fn kind(&self) -> SpecialistKind {
        self.kind
    }

    /// One drafting pass. `revision_feedback` is threaded verbatim into the
    /// prompt when the validator sent the task back.
    pub async fn draft(
        &self,
        task: &Task,
        required_sources: &[String],
        revision_feedback: Option<&[String]>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<SpecialistOutput, FlowError> {
        let mut warnings: Vec<(String, String)> = Vec::new();
        let mut executions: Vec<QueryExecution> = Vec::new();
        let mut data: Vec<(&'static str, RowSet)> = Vec::new();
        let mut missing_sources = 0usize;

        let mut params = BTreeMap::new();
        params.insert("tenant".to_string(), serde_json::json!(task.tenant_id));

        for source in required_sources {
            let Some(read) = READ_TEMPLATES.iter().find(|r| r.source == source) else {
                missing_sources += 1;
                warnings.push((
                    "unknown_source".to_string(),
                    format!("no read template for data source '{source}'"),
                ));
                continue;
            };
            match self
                .warehouse
                .run(read.template, &params, self.max_rows_in_prompt * 10, deadline, cancel)
                .await
            {
                Ok(rows) => {
                    executions.push(QueryExecution {
                        source: read.source.to_string(),
                        template: read.template.to_string(),
                        rows_returned: rows.row_count(),
                        truncated: rows.truncated,
                    });
                    data.push((read.source, rows));
                }
                Err(FlowError::Cancelled) => return Err(FlowError::Cancelled),
                Err(e) => {
                    missing_sources += 1;
                    warnings.push(("partial_data".to_string(), e.to_string()));
                    tracing::warn!(task = %task.id, source = %source, "warehouse read failed: {e}");
                }
            }
        }

        // Every read failed: emit an empty draft and let the validator
        // reject it, rather than failing the task outright.
        if data.is_empty() && !required_sources.is_empty() {
            let confidence =
                BASE_CONFIDENCE - MISSING_SOURCE_PENALTY * missing_sources as f64;
            return Ok(SpecialistOutput {
                draft: Draft::new(self.kind, DraftContent::default(), executions, confidence),
                warnings,
            });
        }

        let truncated_any = data.iter().any(|(_, rows)| rows.truncated);
        let prompt = self.build_prompt(task, &data, revision_feedback);
        let system = match self.kind {
            SpecialistKind::Standard => STANDARD_SYSTEM_PROMPT,
            SpecialistKind::Senior => SENIOR_SYSTEM_PROMPT,
        };

        let reply = match self
            .model
            .generate(&prompt, Some(system), true, deadline, cancel)
            .await
        {
            Ok(reply) => reply,
            Err(FlowError::Cancelled) => return Err(FlowError::Cancelled),
            Err(e) => {
                tracing::warn!(task = %task.id, "specialist model call failed: {e}");
                return Err(FlowError::SpecialistFailed {
                    task_id: task.id.clone(),
                });
            }
        };

        let mut content: DraftContent = match serde_json::from_str(&reply.text) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(task = %task.id, "specialist draft unparsable: {e}");
                return Err(FlowError::SpecialistFailed {
                    task_id: task.id.clone(),
                });
            }
        };

        // Every feedback issue must be visible in the changes record; fill
        // in any the model referenced only implicitly.
        if let Some(feedback) = revision_feedback {
            let mut changes = content.changes.take().unwrap_or_default();
            for issue in feedback {
                let referenced = changes
                    .iter()
                    .any(|c| c.to_lowercase().contains(&issue.to_lowercase()));
                if !referenced {
                    changes.push(format!("addressed: {issue}"));
                }
            }
            content.changes = Some(changes);
        }

        let mut confidence = BASE_CONFIDENCE;
        confidence -= MISSING_SOURCE_PENALTY * missing_sources as f64;
        if truncated_any {
            confidence -= TRUNCATION_PENALTY;
        }
        if reply.retried {
            confidence -= RETRY_PENALTY;
        }

        Ok(SpecialistOutput {
            draft: Draft::new(self.kind, content, executions, confidence),
            warnings,
        })
    }

    /// Assemble the analysis prompt: question, per-source data (row-bounded,
    /// excess summarised as aggregates), and any revision feedback verbatim.
    fn build_prompt(
        &self,
        task: &Task,
        data: &[(&'static str, RowSet)],
        revision_feedback: Option<&[String]>,
    ) -> String {
        let mut prompt = String::new();
        let _ = writeln!(prompt, "Question: {}", task.query);

        if !task.context.is_empty() {
            let _ = writeln!(prompt, "\nCaller context:");
            for (key, value) in &task.context {
                let _ = writeln!(prompt, "- {key}: {value}");
            }
        }

        for (source, rows) in data {
            let _ = writeln!(prompt, "\n== {source} ({} rows) ==", rows.row_count());
            let shown = rows.rows.len().min(self.max_rows_in_prompt);
            for row in &rows.rows[..shown] {
                let line: Vec<String> = rows
                    .columns
                    .iter()
                    .zip(row.iter())
                    .map(|(col, val)| format!("{col}={val}"))
                    .collect();
                let _ = writeln!(prompt, "{}", line.join(" "));
            }
            if rows.rows.len() > shown {
                let _ = writeln!(
                    prompt,
                    "... {} further rows summarised: {}",
                    rows.rows.len() - shown,
                    summarise_excess(rows, shown)
                );
            }
            if rows.truncated {
                let _ = writeln!(prompt, "(result set was truncated at the source)");
            }
        }

        if let Some(feedback) = revision_feedback {
            let _ = writeln!(prompt, "\nRevision feedback to address, verbatim:");
            for issue in feedback {
                let _ = writeln!(prompt, "- {issue}");
            }
            let _ = writeln!(
                prompt,
                "Keep previously correct parts and enumerate your changes in a \"changes\" field."
            );
        }

        prompt
    }
}

/// Aggregate the rows that do not fit the prompt: count, min, max, sum per
/// numeric column. Non-numeric columns are skipped.
fn summarise_excess(rows: &RowSet, from: usize) -> String {
    let mut parts = Vec::new();
    for (i, col) in rows.columns.iter().enumerate() {
        let values: Vec<f64> = rows.rows[from..]
            .iter()
            .filter_map(|row| row.get(i).and_then(serde_json::Value::as_f64))
            .collect();
        if values.is_empty() {
            continue;
        }
        let sum: f64 = values.iter().sum();
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        parts.push(format!(
            "{col}: n={} min={min} max={max} sum={sum}",
            values.len()
        ));
    }
    if parts.is_empty() {
        "no numeric columns".to_string()
    } else {
        parts.join("; ")
    }
}
