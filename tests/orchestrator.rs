mod common;

use common::*;
use sourcing_agent::Orchestrator;
use sourcing_agent::orchestrator::DispatchError;
use sourcing_agent::record_store::{InMemoryRecordStore, RecordStatus, TaskRecord};
use sourcing_agent::types::{RawCriteria, RunEvent};
use std::sync::Arc;

fn record(id: &str, criteria: RawCriteria) -> TaskRecord {
    TaskRecord {
        id: id.into(),
        name: format!("Seeker {id}"),
        criteria,
    }
}

fn orchestrator(harness: &Harness, store: Arc<InMemoryRecordStore>) -> Orchestrator {
    Orchestrator::new(Arc::new(fast_config()), harness.collaborators(), store)
}

#[tokio::test]
async fn batch_writes_every_outcome_back_and_keeps_going() {
    let mut bad = sample_criteria();
    bad.seniority.push("Grand Poobah".into());
    let store = Arc::new(InMemoryRecordStore::new(vec![
        record("recBad", bad),
        record("recGood", sample_criteria()),
    ]));
    let harness = Harness::new(FakeApp::default(), ScriptedDecisionMaker::unused());
    let orchestrator = orchestrator(&harness, store.clone());

    let summary = orchestrator.process_pending().await.unwrap();
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);

    let failed = store.writes("recBad");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, RecordStatus::Failed);
    let notes = failed[0].error_notes.as_deref().unwrap();
    assert!(notes.starts_with("CollaboratorError"), "{notes}");
    assert!(failed[0].completed_at.is_none());

    let ok = store.writes("recGood");
    assert_eq!(ok.len(), 1);
    assert_eq!(ok[0].status, RecordStatus::ReadyToLaunch);
    assert_eq!(ok[0].profiles_sent, Some(100));
    assert!(ok[0].completed_at.is_some());
    assert!(ok[0].error_notes.is_none());

    let status = orchestrator.status();
    assert_eq!(status.status, "idle");
    assert_eq!(status.runs_finished, 2);
    assert!(status.active.is_empty());
    assert_eq!(status.last_run.unwrap().subject_id, "recGood");

    let again = orchestrator.process_pending().await.unwrap();
    assert_eq!(again.processed, 0);
}

#[tokio::test]
async fn unknown_record_is_not_found() {
    let store = Arc::new(InMemoryRecordStore::new(Vec::new()));
    let harness = Harness::new(FakeApp::default(), ScriptedDecisionMaker::unused());
    let orchestrator = orchestrator(&harness, store);

    let err = orchestrator.run_record("recMissing").await.unwrap_err();
    assert!(matches!(err, DispatchError::NotFound(id) if id == "recMissing"));
    assert!(!orchestrator.is_busy());
}

#[tokio::test]
async fn run_events_are_streamed_from_start_to_finish() {
    let store = Arc::new(InMemoryRecordStore::new(vec![record("rec1", sample_criteria())]));
    let harness = Harness::new(FakeApp::default(), ScriptedDecisionMaker::unused());
    let orchestrator = orchestrator(&harness, store);
    let mut events = orchestrator.subscribe();

    let report = orchestrator.run_record("rec1").await.unwrap();
    assert!(report.outcome.is_success(), "{:?}", report.outcome);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(RunEvent::Started { subject_id, .. }) if subject_id == "rec1"));
    assert!(matches!(seen.last(), Some(RunEvent::Finished { run_id, .. }) if *run_id == report.run_id));
    let transitions = seen
        .iter()
        .filter(|e| matches!(e, RunEvent::StateChanged { .. }))
        .count();
    assert_eq!(transitions, 8);
}

#[tokio::test]
async fn connectivity_check_reports_the_rendered_page() {
    let app = FakeApp {
        signed_in: true,
        ..FakeApp::default()
    };
    let store = Arc::new(InMemoryRecordStore::new(Vec::new()));
    let harness = Harness::new(app, ScriptedDecisionMaker::unused());
    let orchestrator = orchestrator(&harness, store);

    let report = orchestrator.check_connectivity().await.unwrap();
    assert_eq!(report.url, TARGET_URL);
    assert_eq!(report.title, "Find people");
    assert!(report.elements > 0);
    assert_eq!(harness.app().launches, 1);
}

#[tokio::test]
async fn only_one_run_at_a_time_across_subjects() {
    let store = Arc::new(InMemoryRecordStore::new(Vec::new()));
    let harness = Harness::new(FakeApp::default(), ScriptedDecisionMaker::unused());
    let orchestrator = orchestrator(&harness, store);

    let mut first = task(sample_criteria());
    first.subject_id = "recA".into();
    let mut second = task(sample_criteria());
    second.subject_id = "recB".into();

    let (a, b) = tokio::join!(orchestrator.execute_task(first), orchestrator.execute_task(second));
    let (report, refused) = match (a, b) {
        (Ok(report), Err(err)) | (Err(err), Ok(report)) => (report, err),
        (a, b) => panic!("expected one run and one refusal, got {:?} and {:?}", a.is_ok(), b.is_ok()),
    };
    assert!(report.outcome.is_success(), "{:?}", report.outcome);
    assert!(matches!(refused, DispatchError::Busy(holder) if holder == report.subject_id));
    assert_eq!(harness.app().launches, 1);
    assert_eq!(orchestrator.status().runs_finished, 1);
}

#[tokio::test]
async fn a_held_slot_turns_every_other_request_away() {
    let store = Arc::new(InMemoryRecordStore::new(vec![record("rec1", sample_criteria())]));
    let harness = Harness::new(FakeApp::default(), ScriptedDecisionMaker::unused());
    let orchestrator = orchestrator(&harness, store);

    let slot = orchestrator.try_claim("rec9").unwrap();
    assert!(orchestrator.is_busy());
    assert_eq!(orchestrator.status().active[0].subject_id, "rec9");
    assert!(matches!(orchestrator.process_pending().await, Err(DispatchError::Busy(_))));
    assert!(matches!(orchestrator.run_record("rec1").await, Err(DispatchError::Busy(_))));
    assert!(matches!(orchestrator.try_claim("rec1"), Err(DispatchError::Busy(_))));

    drop(slot);
    assert!(!orchestrator.is_busy());
    let summary = orchestrator.process_pending().await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(harness.app().launches, 1);
}
