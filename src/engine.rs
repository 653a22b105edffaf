use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cache::{ResultCache, fingerprint};
use crate::clients::model::ModelClient;
use crate::clients::warehouse::WarehouseClient;
use crate::clients::{ModelTransport, WarehouseTransport};
use crate::config::FlowConfig;
use crate::error::FlowError;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::response::{InsightResponse, QueryRequest};
use crate::store::TaskStore;
use crate::task::{SpecialistKind, Task, TaskStatus};
use crate::tiers::dispatcher::Dispatcher;
use crate::tiers::specialist::Specialist;
use crate::tiers::validator::{Decision, Validator};

/// Fixed retry hint carried by `overloaded` rejections.
const RETRY_AFTER_MS: u64 = 1_000;

/// How long a cancelled flow gets to wind down cooperatively before its
/// driver task is aborted outright.
const CANCEL_GRACE: Duration = Duration::from_millis(250);

/// The shared outcome of one flow, as seen by the leader and any coalesced
/// followers. Approvals carry the response; everything else a typed error.
pub type FlowOutcome = Result<Arc<InsightResponse>, FlowError>;

/// Top-level state machine: accepts queries and drives the three tiers
/// under a per-task deadline, with caching, coalescing, admission control,
/// and metrics.
///
/// Cheap to clone; all state is behind `Arc`s. Collaborator transports are
/// injected at construction; no globals, no singletons.
#[derive(Clone)]
pub struct FlowEngine {
    config: FlowConfig,
    store: Arc<TaskStore>,
    cache: Arc<ResultCache>,
    dispatcher: Arc<Dispatcher>,
    standard: Arc<Specialist>,
    senior: Arc<Specialist>,
    validator: Arc<Validator>,
    metrics: Arc<Metrics>,
    inflight: Arc<DashMap<String, watch::Receiver<Option<FlowOutcome>>>>,
    active: Arc<AtomicUsize>,
}

impl FlowEngine {
    pub fn new(
        config: FlowConfig,
        model_transport: Arc<dyn ModelTransport>,
        warehouse_transport: Arc<dyn WarehouseTransport>,
    ) -> Result<Self, FlowError> {
        config.validate()?;

        let model = Arc::new(ModelClient::new(
            model_transport,
            config.model_call_timeout(),
            config.model_retry_attempts,
            Duration::from_millis(config.model_retry_backoff_ms),
        ));
        let warehouse = Arc::new(WarehouseClient::new(
            warehouse_transport,
            config.warehouse_call_timeout(),
            config.warehouse_row_cap,
            config.warehouse_byte_cap,
        ));

        Ok(Self {
            store: Arc::new(TaskStore::new(config.max_revisions)),
            cache: Arc::new(ResultCache::new(config.cache_capacity, config.cache_ttl())),
            dispatcher: Arc::new(Dispatcher::new(model.clone())),
            standard: Arc::new(Specialist::new(
                SpecialistKind::Standard,
                model.clone(),
                warehouse.clone(),
                config.max_rows_in_prompt,
            )),
            senior: Arc::new(Specialist::new(
                SpecialistKind::Senior,
                model.clone(),
                warehouse,
                config.max_rows_in_prompt,
            )),
            validator: Arc::new(Validator::new(
                model,
                config.thresholds,
                config.min_axis_score,
                config.max_revisions,
            )),
            metrics: Arc::new(Metrics::new()),
            inflight: Arc::new(DashMap::new()),
            active: Arc::new(AtomicUsize::new(0)),
            config,
        })
    }

    /// Process one analytical question end to end.
    ///
    /// Identical in-flight questions coalesce onto one task; identical
    /// recently-approved questions are served from cache with
    /// `metadata.cached = true`.
    pub async fn process(&self, request: QueryRequest) -> Result<InsightResponse, FlowError> {
        self.metrics.record_arrival();
        request.validate()?;

        let fp = fingerprint(
            &request.query,
            &request.tenant_id,
            &request.context,
            &self.config.cache_context_keys,
        );

        if let Some(hit) = self.cache.lookup(&fp) {
            tracing::debug!(fingerprint = %fp, "serving cached insight");
            self.metrics.record_cache_hit_delivery();
            return Ok(hit.as_cached());
        }

        // Coalesce onto an in-flight identical request, or become leader.
        // The entry call keeps check-and-claim atomic per fingerprint.
        let (tx, follower_rx) = watch::channel(None);
        let existing = match self.inflight.entry(fp.clone()) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(follower_rx);
                None
            }
        };
        if let Some(rx) = existing {
            tracing::debug!(fingerprint = %fp, "coalescing onto in-flight task");
            self.metrics.record_coalesced();
            return wait_shared(rx).await;
        }

        // Admission control applies to leaders only: followers attach to
        // work that is already admitted.
        let active = self.active.fetch_add(1, Ordering::SeqCst);
        if active >= self.config.max_active_tasks {
            self.active.fetch_sub(1, Ordering::SeqCst);
            let err = FlowError::Overloaded {
                retry_after_ms: RETRY_AFTER_MS,
            };
            // Racing followers receive the same rejection.
            let _ = tx.send(Some(Err(err.clone())));
            self.inflight.remove(&fp);
            self.metrics.record_overloaded();
            tracing::warn!(active, "arrival rejected: engine at capacity");
            return Err(err);
        }

        let timeout =
            Duration::from_millis(request.effective_timeout_ms(self.config.query_timeout_ms));
        let started = Instant::now();
        let deadline = started + timeout;

        let task = self.store.create(
            request.query,
            request.tenant_id,
            request.context,
            fp.clone(),
            deadline,
        );
        let task_id = task.id.clone();
        let cancel = CancellationToken::new();
        let mut guard = LeaderGuard {
            inflight: self.inflight.clone(),
            active: self.active.clone(),
            tx: Some(tx),
            cancel: cancel.clone(),
            fingerprint: fp.clone(),
            done: false,
        };

        tracing::info!(task = %task_id, fingerprint = %fp, timeout_ms = timeout.as_millis() as u64, "task admitted");

        let mut driver = tokio::spawn(self.clone().run_flow(
            task_id.clone(),
            fp.clone(),
            deadline,
            cancel.clone(),
        ));

        let outcome: FlowOutcome = tokio::select! {
            joined = &mut driver => flatten_join(joined, &task_id),
            _ = tokio::time::sleep(timeout) => {
                // Deadline exceeded: cancel outstanding sub-calls, give the
                // flow a short grace window to wind down, then abort it.
                cancel.cancel();
                match tokio::time::timeout(CANCEL_GRACE, &mut driver).await {
                    Ok(joined) => match flatten_join(joined, &task_id) {
                        // Finished inside the grace window: still a result.
                        Ok(response) => Ok(response),
                        Err(_) => self.timed_out(&task_id, started),
                    },
                    Err(_) => {
                        driver.abort();
                        self.timed_out(&task_id, started)
                    }
                }
            }
        };

        self.settle(&task_id, &outcome).await;

        if let Ok(final_task) = self.store.get(&task_id).await {
            self.metrics.record_final(
                final_task.status,
                final_task.complexity,
                started.elapsed().as_millis() as u64,
                final_task.revisions_used,
            );
        }

        guard.publish(&outcome);
        match outcome {
            Ok(response) => Ok(response.as_ref().clone()),
            Err(e) => Err(e),
        }
    }

    /// Snapshot of one task, for monitoring and audit.
    pub async fn task(&self, id: &str) -> Result<Task, FlowError> {
        self.store.get(id).await
    }

    /// Snapshots of all non-terminal tasks.
    pub async fn active_tasks(&self) -> Vec<Task> {
        self.store.list_active().await
    }

    /// The in-flight task id for a query identical to `request`, if any.
    pub fn in_flight_for(&self, request: &QueryRequest) -> Option<String> {
        let fp = fingerprint(
            &request.query,
            &request.tenant_id,
            &request.context,
            &self.config.cache_context_keys,
        );
        self.store.find_by_fingerprint(&fp)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.cache.stats(), self.active.load(Ordering::SeqCst))
    }

    /// Drop terminal task records past the retention window.
    pub async fn prune_terminal(&self) -> usize {
        self.store.prune_terminal(self.config.task_retention()).await
    }

    fn timed_out(&self, task_id: &str, started: Instant) -> FlowOutcome {
        Err(FlowError::TimedOut {
            task_id: task_id.to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Bring the task record in line with the final outcome for the paths
    /// the driver could not settle itself (timeout, panic).
    async fn settle(&self, task_id: &str, outcome: &FlowOutcome) {
        let wanted = match outcome {
            Err(FlowError::TimedOut { .. }) => Some(TaskStatus::TimedOut),
            Err(FlowError::Internal { .. }) => Some(TaskStatus::Failed),
            _ => None,
        };
        let Some(status) = wanted else { return };
        let result = self
            .store
            .update(task_id, |t| {
                if t.status.is_terminal() {
                    Ok(())
                } else {
                    t.transition(status)
                }
            })
            .await;
        if let Err(e) = result {
            tracing::error!(task = %task_id, "could not settle task to {status}: {e}");
        }
    }

    /// Driver for one task: runs on its own tokio task so the deadline arm
    /// in `process` can outlive (and cancel) it.
    async fn run_flow(
        self,
        task_id: String,
        fp: String,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> FlowOutcome {
        match self.drive(&task_id, &fp, deadline, &cancel).await {
            Ok(response) => Ok(response),
            Err(FlowError::Cancelled) => {
                // Timeout or caller abandonment: settle the record here; the
                // caller-facing outcome comes from the deadline arm.
                let _ = self
                    .store
                    .update(&task_id, |t| {
                        if t.status.is_terminal() {
                            Ok(())
                        } else {
                            t.transition(TaskStatus::TimedOut)
                        }
                    })
                    .await;
                Err(FlowError::Cancelled)
            }
            Err(e) => {
                // A failure racing the deadline is a timeout, not a fault:
                // façade deadline errors fire at the same instant the engine
                // cancels, and the task must settle as timed out either way.
                if cancel.is_cancelled() {
                    let _ = self
                        .store
                        .update(&task_id, |t| {
                            if t.status.is_terminal() {
                                Ok(())
                            } else {
                                t.transition(TaskStatus::TimedOut)
                            }
                        })
                        .await;
                    return Err(FlowError::Cancelled);
                }
                let e = e.with_task(&task_id);
                let kind = e.kind();
                let message = e.to_string();
                let settled = self
                    .store
                    .update(&task_id, |t| {
                        if t.status.is_terminal() {
                            return Ok(());
                        }
                        t.record_error(kind, message.clone());
                        t.transition(TaskStatus::Failed)
                    })
                    .await;
                if let Err(se) = settled {
                    tracing::error!(task = %task_id, "could not settle failed task: {se}");
                }
                Err(e)
            }
        }
    }

    /// The §4.H algorithm: classify, draft, validate, loop on revise within
    /// budget, then deliver or reject.
    async fn drive(
        &self,
        task_id: &str,
        fp: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> FlowOutcome {
        let (_, snapshot) = self
            .store
            .update(task_id, |t| t.transition(TaskStatus::Analyzing))
            .await?;

        let classification = self.dispatcher.classify(&snapshot, deadline, cancel).await?;
        let specialist = match classification.specialist {
            SpecialistKind::Standard => self.standard.clone(),
            SpecialistKind::Senior => self.senior.clone(),
        };
        let sources = classification.required_data_sources.clone();
        let complexity = classification.complexity;
        let degraded = classification.degraded;

        self.store
            .update(task_id, move |t| {
                if degraded {
                    t.record_error(
                        "classification_malformed",
                        "unusable classification payload — defaulted to standard",
                    );
                }
                t.complexity = Some(complexity);
                t.transition(TaskStatus::Generating)
            })
            .await?;

        tracing::info!(task = %task_id, %complexity, specialist = %specialist.kind(), "classified");

        let mut feedback: Option<Vec<String>> = None;
        loop {
            let snapshot = self.store.get(task_id).await?;
            let output = specialist
                .draft(&snapshot, &sources, feedback.as_deref(), deadline, cancel)
                .await?;

            let warnings = output.warnings;
            let draft = output.draft;
            let (draft_idx, _) = self
                .store
                .update(task_id, move |t| {
                    for (kind, message) in &warnings {
                        t.record_error(kind, message.clone());
                    }
                    let idx = t.push_draft(draft)?;
                    t.transition(TaskStatus::Validating)?;
                    Ok(idx)
                })
                .await?;

            let snapshot = self.store.get(task_id).await?;
            let verdict = self
                .validator
                .validate(&snapshot, &snapshot.drafts[draft_idx], deadline, cancel)
                .await?;

            let scores = verdict.scores;
            let quality = verdict.quality;
            let verdict_feedback = verdict.feedback.clone();
            self.store
                .update(task_id, move |t| {
                    t.set_validation(draft_idx, scores, quality, verdict_feedback)
                })
                .await?;

            match verdict.decision {
                Decision::Approve => {
                    let (_, approved) = self
                        .store
                        .update(task_id, move |t| {
                            t.approve_draft(draft_idx)?;
                            t.transition(TaskStatus::Approved)
                        })
                        .await?;

                    let processing_ms = approved.elapsed_ms();
                    let response = Arc::new(Dispatcher::format(
                        &approved,
                        &approved.drafts[draft_idx],
                        processing_ms,
                    ));
                    self.cache.store(fp.to_string(), response.clone());
                    self.store
                        .update(task_id, |t| t.transition(TaskStatus::Delivered))
                        .await?;
                    tracing::info!(task = %task_id, quality, revisions = approved.revisions_used, "insight delivered");
                    return Ok(response);
                }
                Decision::Revise => {
                    let snapshot = self.store.get(task_id).await?;
                    if snapshot.revisions_used >= snapshot.max_revisions {
                        // Budget exhausted after a revise verdict.
                        return self
                            .reject(task_id, verdict.feedback, snapshot.revisions_used)
                            .await;
                    }
                    self.store
                        .update(task_id, |t| {
                            t.transition(TaskStatus::Revising)?;
                            t.transition(TaskStatus::Generating)
                        })
                        .await?;
                    tracing::info!(task = %task_id, issues = verdict.feedback.len(), "revision requested");
                    feedback = Some(verdict.feedback);
                }
                Decision::Reject => {
                    let snapshot = self.store.get(task_id).await?;
                    return self
                        .reject(task_id, verdict.feedback, snapshot.revisions_used)
                        .await;
                }
            }
        }
    }

    async fn reject(
        &self,
        task_id: &str,
        feedback: Vec<String>,
        revisions_used: u32,
    ) -> FlowOutcome {
        self.store
            .update(task_id, |t| t.transition(TaskStatus::Rejected))
            .await?;
        tracing::info!(task = %task_id, revisions_used, "rejected at quality gate");
        Err(FlowError::QualityRejected {
            task_id: task_id.to_string(),
            last_feedback: feedback,
            revisions_used,
        })
    }
}

/// Follower side of coalescing: wait for the leader to publish the shared
/// outcome.
async fn wait_shared(
    mut rx: watch::Receiver<Option<FlowOutcome>>,
) -> Result<InsightResponse, FlowError> {
    loop {
        {
            let current = rx.borrow_and_update();
            if let Some(outcome) = current.as_ref() {
                return match outcome {
                    Ok(response) => Ok(response.as_ref().clone()),
                    Err(e) => Err(e.clone()),
                };
            }
        }
        if rx.changed().await.is_err() {
            return Err(FlowError::Internal {
                detail: "in-flight flow vanished without publishing".to_string(),
            });
        }
    }
}

fn flatten_join(
    joined: Result<FlowOutcome, tokio::task::JoinError>,
    task_id: &str,
) -> FlowOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(join_err) if join_err.is_panic() => {
            tracing::error!(task = %task_id, "flow driver panicked: {join_err}");
            Err(FlowError::Internal {
                detail: "flow driver panicked".to_string(),
            })
        }
        Err(_) => Err(FlowError::Cancelled),
    }
}

/// Cleanup for the leader path. Publishing the outcome disarms it; a leader
/// dropped mid-flight (caller abandoned the request) cancels the flow and
/// releases every resource it claimed.
struct LeaderGuard {
    inflight: Arc<DashMap<String, watch::Receiver<Option<FlowOutcome>>>>,
    active: Arc<AtomicUsize>,
    tx: Option<watch::Sender<Option<FlowOutcome>>>,
    cancel: CancellationToken,
    fingerprint: String,
    done: bool,
}

impl LeaderGuard {
    fn publish(&mut self, outcome: &FlowOutcome) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(outcome.clone()));
        }
        self.inflight.remove(&self.fingerprint);
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.done = true;
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.cancel.cancel();
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Err(FlowError::Cancelled)));
        }
        self.inflight.remove(&self.fingerprint);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
