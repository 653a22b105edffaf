//! Deterministic stub transports shared by the integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use forecourt::{
    FlowConfig, FlowEngine, ModelTransport, RowSet, TransportError, WarehouseTransport,
};

/// Model stub that pops scripted replies in call order. One flow consumes
/// replies as: classify, draft, validate, (draft, validate)* per revision.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    pub calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(replies: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelTransport for ScriptedModel {
    async fn complete(
        &self,
        _prompt: &str,
        _system: Option<&str>,
        _cancel: &CancellationToken,
    ) -> Result<String, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TransportError::Unavailable("script exhausted".into()))
    }
}

/// Model stub that picks its reply by tier, recognised from the system
/// prompt. Order-independent, for tests that interleave concurrent flows.
pub struct RoleModel {
    pub classify: String,
    pub draft: String,
    pub assess: String,
    pub draft_calls: AtomicUsize,
    pub calls: AtomicUsize,
}

impl RoleModel {
    pub fn new(classify: String, draft: String, assess: String) -> Arc<Self> {
        Arc::new(Self {
            classify,
            draft,
            assess,
            draft_calls: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn drafting_passes(&self) -> usize {
        self.draft_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelTransport for RoleModel {
    async fn complete(
        &self,
        _prompt: &str,
        system: Option<&str>,
        _cancel: &CancellationToken,
    ) -> Result<String, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let system = system.unwrap_or_default();
        if system.contains("routing tier") {
            Ok(self.classify.clone())
        } else if system.contains("validation tier") {
            Ok(self.assess.clone())
        } else {
            self.draft_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.draft.clone())
        }
    }
}

/// Warehouse stub with fixed rows, an optional delay, and cancellation
/// observation for the timeout scenario.
pub struct StubWarehouse {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
    pub saw_cancel: AtomicBool,
}

impl StubWarehouse {
    pub fn sales(rows: usize) -> Arc<Self> {
        Arc::new(Self {
            columns: vec!["sold_at".into(), "model".into(), "units".into()],
            rows: (0..rows)
                .map(|i| {
                    vec![
                        serde_json::json!(format!("2026-07-{:02}", (i % 28) + 1)),
                        serde_json::json!(["Crown", "Aria", "Vale"][i % 3]),
                        serde_json::json!((i % 7) + 1),
                    ]
                })
                .collect(),
            delay: None,
            calls: AtomicUsize::new(0),
            saw_cancel: AtomicBool::new(false),
        })
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            columns: vec!["sold_at".into(), "model".into(), "units".into()],
            rows: Vec::new(),
            delay: None,
            calls: AtomicUsize::new(0),
            saw_cancel: AtomicBool::new(false),
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            columns: vec!["units".into()],
            rows: vec![vec![serde_json::json!(1)]],
            delay: Some(delay),
            calls: AtomicUsize::new(0),
            saw_cancel: AtomicBool::new(false),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WarehouseTransport for StubWarehouse {
    async fn execute(
        &self,
        _template: &str,
        _params: &BTreeMap<String, serde_json::Value>,
        _row_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<RowSet, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    self.saw_cancel.store(true, Ordering::SeqCst);
                    return Err(TransportError::Cancelled);
                }
            }
        }
        Ok(RowSet {
            columns: self.columns.clone(),
            rows: self.rows.clone(),
            truncated: false,
        })
    }
}

pub fn engine(
    config: FlowConfig,
    model: Arc<ScriptedModel>,
    warehouse: Arc<StubWarehouse>,
) -> FlowEngine {
    FlowEngine::new(config, model, warehouse).expect("engine construction")
}

/// Classification reply with the given intent signals, reading sales data.
pub fn classify_reply(intents: &[&str]) -> String {
    serde_json::json!({
        "intents": intents,
        "data_sources": ["sales"],
    })
    .to_string()
}

/// A well-formed draft reply that passes every deterministic cross-check
/// for lookup/aggregation questions.
pub fn draft_reply(summary: &str, metrics: &[(&str, f64)], insights: &[&str]) -> String {
    serde_json::json!({
        "summary": summary,
        "key_metrics": metrics.iter().cloned().collect::<BTreeMap<&str, f64>>(),
        "insights": insights,
        "recommendations": [
            {"priority": "medium", "action": "keep current stocking levels"}
        ],
    })
    .to_string()
}

/// Validator assessment reply with uniform axis scores.
pub fn assess_reply(score: f64, issues: &[&str]) -> String {
    serde_json::json!({
        "data_accuracy": score,
        "methodology": score,
        "business_logic": score,
        "compliance": score,
        "issues": issues,
    })
    .to_string()
}
