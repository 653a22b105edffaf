use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::clients::{RowSet, TransportError, WarehouseTransport};
use crate::error::FlowError;

/// Keywords that disqualify a template as read-only. Checked as whole
/// tokens after string literals are blanked out.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "merge", "drop", "alter", "create", "truncate", "grant",
    "revoke", "attach", "copy", "vacuum", "pragma", "call", "execute", "into",
];

/// Façade over a [`WarehouseTransport`]: structural read-only validation,
/// per-call timeout clamped to the task deadline, row and byte caps with a
/// `truncated` marker instead of hard failure.
pub struct WarehouseClient {
    transport: Arc<dyn WarehouseTransport>,
    call_timeout: Duration,
    row_cap: usize,
    byte_cap: usize,
}

impl WarehouseClient {
    pub fn new(
        transport: Arc<dyn WarehouseTransport>,
        call_timeout: Duration,
        row_cap: usize,
        byte_cap: usize,
    ) -> Self {
        Self {
            transport,
            call_timeout,
            row_cap,
            byte_cap,
        }
    }

    pub async fn run(
        &self,
        template: &str,
        params: &BTreeMap<String, serde_json::Value>,
        row_limit: usize,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<RowSet, FlowError> {
        validate_template(template, params)?;

        let mut limit = row_limit.min(self.row_cap);
        if limit == 0 {
            limit = 1;
        }
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .map(|d| d.min(self.call_timeout))
            .filter(|d| !d.is_zero())
            .ok_or_else(|| FlowError::QueryTimeout {
                detail: "task deadline exhausted before dispatch".to_string(),
            })?;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FlowError::Cancelled),
            result = tokio::time::timeout(
                remaining,
                self.transport.execute(template, params, limit, cancel),
            ) => result,
        };

        let mut rows = match outcome {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => return Err(map_transport_error(e)),
            Err(_elapsed) => {
                return Err(FlowError::QueryTimeout {
                    detail: format!("no result within {}ms", remaining.as_millis()),
                });
            }
        };

        if rows.rows.len() > limit {
            rows.rows.truncate(limit);
            rows.truncated = true;
        }
        self.enforce_byte_cap(&mut rows);
        Ok(rows)
    }

    /// Trim rows from the tail until the serialized payload fits the byte
    /// cap. Returns truncated rows, never an error: partial data is still
    /// data, and the validator discounts it.
    fn enforce_byte_cap(&self, rows: &mut RowSet) {
        let mut total = 0usize;
        let mut keep = rows.rows.len();
        for (i, row) in rows.rows.iter().enumerate() {
            let row_bytes: usize = row.iter().map(|v| v.to_string().len() + 1).sum();
            if total + row_bytes > self.byte_cap {
                keep = i;
                break;
            }
            total += row_bytes;
        }
        if keep < rows.rows.len() {
            rows.rows.truncate(keep);
            rows.truncated = true;
        }
    }
}

fn map_transport_error(e: TransportError) -> FlowError {
    match e {
        TransportError::RateLimited | TransportError::Unavailable(_) => {
            FlowError::WarehouseUnavailable {
                task_id: String::new(),
                detail: e.to_string(),
            }
        }
        TransportError::Denied(detail) => FlowError::AccessDenied { detail },
        TransportError::Invalid(detail) => FlowError::QueryInvalid { detail },
        TransportError::Timeout => FlowError::QueryTimeout {
            detail: "transport timeout".to_string(),
        },
        TransportError::Cancelled => FlowError::Cancelled,
    }
}

/// Structural read-only validation. Rejects anything that is not a single
/// SELECT (or WITH … SELECT) statement with fully-bound `$name` placeholders.
pub fn validate_template(
    template: &str,
    params: &BTreeMap<String, serde_json::Value>,
) -> Result<(), FlowError> {
    let trimmed = template.trim().trim_end_matches(';').trim_end();
    if trimmed.is_empty() {
        return Err(invalid("empty template"));
    }

    // Braces are checked on the raw text: value interpolation hides exactly
    // where literal blanking would erase it.
    if trimmed.contains('{') || trimmed.contains('}') {
        return Err(invalid("bare interpolation markers"));
    }

    let blanked = blank_string_literals(trimmed);
    if blanked.contains(';') {
        return Err(invalid("multiple statements"));
    }
    if blanked.contains("--") || blanked.contains("/*") {
        return Err(invalid("comments are not allowed"));
    }

    let lowered = blanked.to_lowercase();
    let mut tokens = lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
        .filter(|t| !t.is_empty());
    match tokens.next() {
        Some("select") | Some("with") => {}
        _ => return Err(invalid("template must start with SELECT or WITH")),
    }
    for token in lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
    {
        if FORBIDDEN_KEYWORDS.contains(&token) {
            return Err(invalid(&format!("forbidden keyword: {token}")));
        }
    }

    for placeholder in placeholders(&blanked) {
        if placeholder.is_empty() {
            return Err(invalid("dangling $ placeholder"));
        }
        if !params.contains_key(&placeholder) {
            return Err(invalid(&format!("unbound placeholder: ${placeholder}")));
        }
    }

    Ok(())
}

fn invalid(detail: &str) -> FlowError {
    FlowError::QueryInvalid {
        detail: detail.to_string(),
    }
}

/// Replace single-quoted literal contents with spaces so keyword and
/// structure scans cannot be smuggled past inside strings. Handles the
/// doubled-quote escape.
fn blank_string_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_string = false;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if in_string {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    out.push_str("  ");
                } else {
                    in_string = false;
                    out.push('\'');
                }
            } else {
                out.push(' ');
            }
        } else if c == '\'' {
            in_string = true;
            out.push('\'');
        } else {
            out.push(c);
        }
    }
    out
}

/// Collect `$name` placeholder names from a template.
fn placeholders(sql: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            let mut name = String::new();
            while let Some(&next) = chars.peek() {
                if next.is_alphanumeric() || next == '_' {
                    name.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            names.push(name);
        }
    }
    names
}
