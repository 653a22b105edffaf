//! Revision-loop behaviour: bounded revise-then-approve cycles and
//! rejection once the budget is exhausted.

mod common;

use common::{ScriptedModel, StubWarehouse, assess_reply, classify_reply, draft_reply, engine};
use forecourt::{ConfidenceLevel, FlowConfig, FlowError, QueryRequest, TaskStatus};

#[tokio::test]
async fn revision_then_approval() {
    let model = ScriptedModel::new(vec![
        classify_reply(&["forecast"]),
        // First draft states no horizon: the methodology cross-check caps
        // it below the complex threshold.
        draft_reply(
            "Revenue will grow",
            &[("revenue_m", 1.2)],
            &["growth continues"],
        ),
        assess_reply(0.95, &["include confidence band"]),
        // Second draft addresses the feedback.
        draft_reply(
            "Next quarter revenue projected at 1.2M via a seasonal trend method, confidence band ±8%",
            &[("revenue_m", 1.2)],
            &["projection derived from the prior four quarters"],
        ),
        assess_reply(0.92, &[]),
    ]);
    let warehouse = StubWarehouse::sales(40);
    let engine = engine(FlowConfig::default(), model.clone(), warehouse);

    let response = engine
        .process(QueryRequest::new("forecast next quarter revenue", "d1"))
        .await
        .unwrap();

    assert_eq!(response.metadata.revisions_used, 1);
    assert_eq!(response.metadata.complexity, forecourt::Complexity::Complex);
    assert_eq!(response.confidence_level, ConfidenceLevel::High);
    assert_eq!(model.call_count(), 5, "classify + 2×(draft + validate)");

    let task = engine.task(&response.metadata.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Delivered);
    assert_eq!(task.drafts.len(), 2);
    assert_eq!(task.validated_draft, Some(1));
    assert_eq!(task.revisions_used, 1);

    // The first draft carries the validator's feedback; the second
    // enumerates how each issue was addressed.
    let first = &task.drafts[0];
    assert!(
        first
            .validation_feedback
            .iter()
            .any(|f| f.contains("state forecast horizon")),
        "feedback: {:?}",
        first.validation_feedback
    );
    assert!(
        first
            .validation_feedback
            .iter()
            .any(|f| f.contains("include confidence band")),
        "feedback: {:?}",
        first.validation_feedback
    );
    let second = task.approved_draft().unwrap();
    let changes = second.content.changes.as_ref().expect("changes recorded");
    assert!(
        changes.iter().any(|c| c.contains("state forecast horizon")),
        "changes: {changes:?}"
    );
    assert!(second.quality_score.unwrap() >= 0.90);
}

#[tokio::test]
async fn rejection_after_max_revisions() {
    // Three consecutive below-threshold drafts on a critical question.
    let model = ScriptedModel::new(vec![
        classify_reply(&["strategic"]),
        draft_reply("plan A", &[("margin", 0.1)], &["thin data"]),
        assess_reply(0.85, &["needs deeper support"]),
        draft_reply("plan B", &[("margin", 0.1)], &["thin data"]),
        assess_reply(0.85, &["still short"]),
        draft_reply("plan C", &[("margin", 0.1)], &["thin data"]),
        assess_reply(0.85, &["still short of the bar"]),
    ]);
    let engine = engine(FlowConfig::default(), model.clone(), StubWarehouse::sales(10));

    let err = engine
        .process(QueryRequest::new(
            "strategic priorities for dealership growth",
            "d1",
        ))
        .await
        .unwrap_err();

    let (task_id, feedback, revisions_used) = match err {
        FlowError::QualityRejected {
            task_id,
            last_feedback,
            revisions_used,
        } => (task_id, last_feedback, revisions_used),
        other => panic!("expected quality_rejected, got {other:?}"),
    };
    assert_eq!(revisions_used, 2);
    assert!(
        feedback.iter().any(|f| f.contains("still short of the bar")),
        "feedback: {feedback:?}"
    );
    assert_eq!(model.call_count(), 7);

    let task = engine.task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Rejected);
    assert_eq!(task.drafts.len(), 3);
    assert_eq!(task.complexity, Some(forecourt::Complexity::Critical));
    assert!(task.validated_draft.is_none());
    // Every draft was scored, none approved.
    for draft in &task.drafts {
        assert!(draft.quality_score.is_some());
        assert!(draft.quality_score.unwrap() < 0.95);
    }

    // Rejections are not cached: the identical question starts a fresh
    // flow, which fails on the exhausted script instead of hitting cache.
    let err = engine
        .process(QueryRequest::new(
            "strategic priorities for dealership growth",
            "d1",
        ))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "classification_failed");
}

#[tokio::test]
async fn rejection_payload_carries_last_feedback() {
    let model = ScriptedModel::new(vec![
        classify_reply(&["lookup"]),
        draft_reply("41 units", &[("units", 41.0)], &["steady"]),
        assess_reply(0.5, &["metrics do not reconcile"]),
    ]);
    let config = FlowConfig {
        max_revisions: 0,
        ..FlowConfig::default()
    };
    let engine = engine(config, model, StubWarehouse::sales(5));

    let err = engine
        .process(QueryRequest::new("units sold last month", "d1"))
        .await
        .unwrap_err();
    let payload = err.payload();
    assert_eq!(payload["error"], "quality_rejected");
    assert_eq!(payload["revisions_used"], 0);
    assert!(
        payload["last_feedback"]
            .as_array()
            .unwrap()
            .iter()
            .any(|f| f.as_str().unwrap().contains("metrics do not reconcile")),
        "payload: {payload}"
    );
}

#[tokio::test]
async fn partial_data_is_recorded_and_rejected() {
    // The classifier demands a source the warehouse cannot serve; the
    // specialist still drafts from what it has... here, nothing, so the
    // validator floors the empty draft.
    let model = ScriptedModel::new(vec![
        serde_json::json!({"intents": ["lookup"], "data_sources": ["weather"]}).to_string(),
        assess_reply(0.9, &[]),
    ]);
    let config = FlowConfig {
        max_revisions: 0,
        ..FlowConfig::default()
    };
    let engine = engine(config, model, StubWarehouse::sales(5));

    let err = engine
        .process(QueryRequest::new("units sold during the storm", "d1"))
        .await
        .unwrap_err();
    let task_id = match err {
        FlowError::QualityRejected { task_id, .. } => task_id,
        other => panic!("expected quality_rejected, got {other:?}"),
    };
    let task = engine.task(&task_id).await.unwrap();
    assert!(
        task.errors.iter().any(|e| e.kind == "unknown_source"),
        "errors: {:?}",
        task.errors.iter().map(|e| e.kind.clone()).collect::<Vec<_>>()
    );
    assert!(task.drafts[0].content.is_empty());
}
