use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::clients::{ModelTransport, TransportError};
use crate::error::FlowError;

/// Ceiling on a single backoff sleep; exponential growth stops here.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Minimum useful remaining budget. Below this we fail instead of firing a
/// request that cannot complete.
const MIN_REMAINING: Duration = Duration::from_millis(50);

/// A completed model call.
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub text: String,
    /// True when the reply needed more than one transport attempt. Feeds the
    /// specialist's self-confidence heuristic.
    pub retried: bool,
}

/// Retrying façade over a [`ModelTransport`].
///
/// Applies bounded retries with exponential backoff and jitter for
/// transport-class failures, caps total wall time per call, and extracts
/// strict JSON when the caller asks for it. Callers never see a raw
/// transport error: everything maps to a typed [`FlowError`].
pub struct ModelClient {
    transport: Arc<dyn ModelTransport>,
    call_timeout: Duration,
    attempts: u32,
    backoff_base: Duration,
}

impl ModelClient {
    pub fn new(
        transport: Arc<dyn ModelTransport>,
        call_timeout: Duration,
        attempts: u32,
        backoff_base: Duration,
    ) -> Self {
        Self {
            transport,
            call_timeout,
            attempts: attempts.max(1),
            backoff_base,
        }
    }

    /// One logical generation. `deadline` is the owning task's deadline; the
    /// effective budget is the sooner of it and `call_timeout` from now.
    pub async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        want_json: bool,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<ModelReply, FlowError> {
        let budget = Instant::now() + self.call_timeout;
        let call_deadline = budget.min(deadline);
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=self.attempts {
            let remaining = call_deadline
                .checked_duration_since(Instant::now())
                .filter(|d| *d > MIN_REMAINING)
                .ok_or_else(|| FlowError::ModelUnavailable {
                    task_id: String::new(),
                    detail: format!("call budget exhausted after {} attempts", attempt - 1),
                })?;

            let outcome = tokio::select! {
                // Biased: a cancelled task must never dispatch another call.
                biased;
                _ = cancel.cancelled() => return Err(FlowError::Cancelled),
                result = tokio::time::timeout(
                    remaining,
                    self.transport.complete(prompt, system, cancel),
                ) => result,
            };

            match outcome {
                Ok(Ok(text)) => {
                    let text = if want_json {
                        extract_json(&text)
                            .ok_or_else(|| FlowError::ModelMalformed {
                                detail: format!(
                                    "no balanced JSON object in {}-byte reply",
                                    text.len()
                                ),
                            })?
                            .to_string()
                    } else {
                        text
                    };
                    return Ok(ModelReply {
                        text,
                        retried: attempt > 1,
                    });
                }
                Ok(Err(TransportError::Cancelled)) => return Err(FlowError::Cancelled),
                Ok(Err(e)) if e.is_retryable() && attempt < self.attempts => {
                    last_error = e.to_string();
                    tracing::warn!(attempt, "model call failed, retrying: {e}");
                    let pause = self.backoff(attempt).min(
                        call_deadline
                            .checked_duration_since(Instant::now())
                            .unwrap_or(Duration::ZERO),
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FlowError::Cancelled),
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                Ok(Err(e)) => {
                    return Err(FlowError::ModelUnavailable {
                        task_id: String::new(),
                        detail: e.to_string(),
                    });
                }
                Err(_elapsed) if attempt < self.attempts => {
                    last_error = "attempt timed out".to_string();
                    tracing::warn!(attempt, "model call attempt timed out, retrying");
                }
                Err(_elapsed) => {
                    return Err(FlowError::ModelUnavailable {
                        task_id: String::new(),
                        detail: "all attempts timed out".to_string(),
                    });
                }
            }
        }

        Err(FlowError::ModelUnavailable {
            task_id: String::new(),
            detail: last_error,
        })
    }

    /// Exponential backoff with jitter: base · 2^(attempt−1) plus up to half
    /// the base again, capped at MAX_BACKOFF.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.backoff_base.saturating_mul(1u32 << (attempt - 1).min(8));
        let jitter_ms = rand::thread_rng().gen_range(0..=self.backoff_base.as_millis().max(1) as u64 / 2);
        (exp + Duration::from_millis(jitter_ms)).min(MAX_BACKOFF)
    }
}

/// Extract the first balanced top-level JSON object from free text.
///
/// Tolerates leading/trailing prose and fenced code blocks; respects string
/// literals and escapes so braces inside strings don't unbalance the scan.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}
