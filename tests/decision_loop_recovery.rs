mod common;

use common::*;
use sourcing_agent::audit::AuditStore;
use sourcing_agent::brain::{DecisionContext, Proposal};
use sourcing_agent::{ErrorKind, RunOutcome, RunState};

/// Open the hidden menu, add to table, confirm, then claim done once the
/// import shows.
fn import_through_menu(ctx: &DecisionContext) -> Proposal {
    let page = &ctx.page;
    if page.contains("\"Importing\"") {
        return Proposal::Done {
            summary: "import is running".into(),
        };
    }
    for name in ["Confirm", "Add to table", "More actions"] {
        if let Some(element) = element_ref(page, "button", name) {
            return Proposal::Click { element };
        }
    }
    Proposal::Fail {
        reason: "no way to import".into(),
    }
}

#[tokio::test]
async fn looping_filter_escalates_then_fails_structurally() {
    let mut app = FakeApp::default();
    app.broken_inputs.insert("Locations".into());
    let maker = ScriptedDecisionMaker::new(|ctx| match element_ref(&ctx.page, "textbox", "Locations") {
        Some(element) if ctx.turn % 2 == 1 => Proposal::Fill {
            element,
            value: "New York".into(),
        },
        Some(_) => Proposal::PressKey { key: "Enter".into() },
        None => Proposal::Fail {
            reason: "locations input missing".into(),
        },
    });
    let harness = Harness::new(app, maker);
    let report = harness.machine(fast_config()).execute(task(sample_criteria())).await;

    let RunOutcome::Failed { reason, progress, .. } = &report.outcome else {
        panic!("expected failure, got {:?}", report.outcome);
    };
    assert_eq!(*reason, ErrorKind::StructuralUi);
    assert_eq!(progress.last_verified, RunState::CriteriaReady);
    assert_eq!(progress.applied_filters.len(), 4);

    // Fill and Enter alternate; the fill stalls for the third time on turn 5.
    assert_eq!(harness.maker.contexts().len(), 5);
    assert_eq!(report.turns, 5);
    assert_eq!(harness.app().pill_values(), vec!["VP Sales", "Director BD", "VP", "Director"]);

    let record = harness.audit.record(&report.run_id).await.unwrap().unwrap();
    let escalated = record
        .status_history
        .iter()
        .find(|e| e.note.starts_with("decision loop escalated"))
        .expect("escalation recorded");
    assert_eq!(escalated.kind, Some(ErrorKind::LoopDetected));
    assert!(
        record
            .artifacts
            .iter()
            .any(|a| a.name == "turn_01_snapshot")
    );
}

#[tokio::test]
async fn premature_done_claim_is_rejected_and_the_loop_continues() {
    let app = FakeApp {
        import_behind_menu: true,
        ..FakeApp::default()
    };
    let maker = ScriptedDecisionMaker::new(|ctx| {
        if ctx.turn == 1 {
            Proposal::Done {
                summary: "the import already started".into(),
            }
        } else {
            import_through_menu(ctx)
        }
    });
    let harness = Harness::new(app, maker);
    let report = harness.machine(fast_config()).execute(task(sample_criteria())).await;

    assert!(report.outcome.is_success(), "{:?}", report.outcome);
    assert_eq!(report.turns, 5);
    let contexts = harness.maker.contexts();
    let feedback = contexts[1].feedback.as_deref().unwrap_or_default();
    assert!(feedback.contains("rejected"), "{feedback}");
    assert!(feedback.contains("no structural change"), "{feedback}");
    assert_eq!(contexts[1].history[0].outcome, "rejected: no structural change since the stage began");
    assert_eq!(harness.app().import_clicks, 1);
}

#[tokio::test]
async fn repeated_false_claims_fail_verification() {
    let app = FakeApp {
        import_behind_menu: true,
        ..FakeApp::default()
    };
    let maker = ScriptedDecisionMaker::new(|_| Proposal::Done {
        summary: "done".into(),
    });
    let harness = Harness::new(app, maker);
    let report = harness.machine(fast_config()).execute(task(sample_criteria())).await;

    let RunOutcome::Failed { reason, progress, .. } = &report.outcome else {
        panic!("expected failure, got {:?}", report.outcome);
    };
    assert_eq!(*reason, ErrorKind::VerificationFailed);
    assert_eq!(progress.last_verified, RunState::ResultsVerified);
    // Two rejections are tolerated, the third ends the stage.
    assert_eq!(harness.maker.contexts().len(), 3);
    assert_eq!(harness.app().import_clicks, 0);
}

#[tokio::test]
async fn recycling_the_browser_keeps_verified_progress() {
    let app = FakeApp {
        import_behind_menu: true,
        sign_out_on_relaunch: true,
        ..FakeApp::default()
    };
    let mut config = fast_config();
    config.session.recycle_every_turns = 3;
    let harness = Harness::new(app, ScriptedDecisionMaker::new(import_through_menu));
    let report = harness.machine(config).execute(task(sample_criteria())).await;

    assert!(report.outcome.is_success(), "{:?}", report.outcome);
    assert_eq!(report.turns, 6);

    {
        let app = harness.app();
        assert_eq!(app.launches, 3);
        assert!(app.signed_in);
        assert_eq!(app.pills.len(), 5);
        assert_eq!(app.import_clicks, 1);
        let logins = app
            .log
            .iter()
            .filter(|l| l.starts_with("fill") && l.contains(EMAIL))
            .count();
        assert_eq!(logins, 3);
    }

    let contexts = harness.maker.contexts();
    assert!(
        contexts[2]
            .feedback
            .as_deref()
            .is_some_and(|f| f.contains("restarted"))
    );

    let record = harness.audit.record(&report.run_id).await.unwrap().unwrap();
    for state in RunState::SEQUENCE {
        let seen = record
            .status_history
            .iter()
            .filter(|e| e.state == state && e.kind.is_none())
            .count();
        assert_eq!(seen, 1, "{state} recorded {seen} times");
    }
}

#[tokio::test]
async fn running_out_of_turns_times_the_run_out_at_the_last_verified_state() {
    let app = FakeApp {
        import_behind_menu: true,
        ..FakeApp::default()
    };
    let maker = ScriptedDecisionMaker::new(|_| Proposal::Invalid {
        raw: "Let me think about where the import button is.".into(),
        error: "expected value at line 1 column 1".into(),
    });
    let mut config = fast_config();
    config.budget.max_turns = 3;
    let harness = Harness::new(app, maker);
    let report = harness.machine(config).execute(task(sample_criteria())).await;

    match &report.outcome {
        RunOutcome::TimedOut { last_state, progress } => {
            assert_eq!(*last_state, RunState::ResultsVerified);
            assert_eq!(progress.last_verified, RunState::ResultsVerified);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(report.final_state, RunState::TimedOut);
    assert_eq!(report.turns, 3);
    assert_eq!(harness.maker.contexts().len(), 3);
    assert_eq!(harness.app().import_clicks, 0);

    let record = harness.audit.record(&report.run_id).await.unwrap().unwrap();
    let last = record.status_history.last().unwrap();
    assert_eq!(last.state, RunState::TimedOut);
    assert_eq!(last.kind, Some(ErrorKind::Timeout));
}

#[tokio::test]
async fn degraded_session_is_relaunched_and_the_stage_retried() {
    let app = FakeApp {
        outage_after_pills: Some(2),
        outage_snapshots: 4,
        ..FakeApp::default()
    };
    let harness = Harness::new(app, ScriptedDecisionMaker::unused());
    let report = harness.machine(fast_config()).execute(task(sample_criteria())).await;

    assert!(report.outcome.is_success(), "{:?}", report.outcome);
    assert!(harness.maker.contexts().is_empty());
    {
        let app = harness.app();
        assert_eq!(app.failed_snapshots, 4);
        assert_eq!(app.launches, 2);
        assert_eq!(
            app.pill_values(),
            vec!["VP Sales", "Director BD", "VP", "Director", "New York"]
        );
    }
    let progress = report.outcome.progress();
    assert_eq!(progress.applied_filters.len(), 5);

    let record = harness.audit.record(&report.run_id).await.unwrap().unwrap();
    let mut reached = Vec::new();
    for entry in record.status_history.iter().filter(|e| e.kind.is_none()) {
        if reached.last() != Some(&entry.state) {
            reached.push(entry.state);
        }
    }
    assert_eq!(reached, RunState::SEQUENCE.to_vec());
}
