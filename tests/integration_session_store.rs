// Session persistence across restarts, backed by an on-disk sqlite database.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tempfile::tempdir;

use timebox::backend::{Output, END_MARKER, START_MARKER};
use timebox::clock::ManualClock;
use timebox::config::Config;
use timebox::controller::{EditorController, SessionContext};
use timebox::language::Language;
use timebox::session::SessionState;
use timebox::signals::NoSignal;
use timebox::store::{ProblemStore, SqliteBackend};
use timebox::submit::OutboxSubmitter;
use timebox::surface::{EditorSurface, TextBuffer};

fn open(db: &std::path::Path, problem: &str, clock: &ManualClock) -> EditorController<TextBuffer> {
    let backend = SqliteBackend::open(db).unwrap();
    let store = ProblemStore::new(Arc::new(backend), problem);
    let ctx = SessionContext {
        problem_id: problem.into(),
        store,
        clock: Arc::new(clock.clone()),
        dataset: "AGCT\n".into(),
        config: Config {
            python_command: "timebox-missing-python".into(),
            node_command: "timebox-missing-node".into(),
            ..Config::default()
        },
        language: None,
        solved: Box::new(NoSignal),
        cooldown: Box::new(NoSignal),
        submitter: Box::new(OutboxSubmitter::new(db.with_extension("outbox"))),
    };
    EditorController::new(ctx, TextBuffer::new())
}

#[test]
fn restart_resumes_window_code_and_output() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("sessions.db");
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());

    {
        let mut controller = open(&db, "dna", &clock);
        controller.start().unwrap();
        controller.switch_language(Language::Javascript).unwrap();
        controller.surface_mut().set_text("console.log(dataset)");
        controller.on_code_changed();
        controller.push_output(Output::success(START_MARKER));
        controller.push_output(Output::plain("AGCT"));
        controller.push_output(Output::success(END_MARKER));
        controller.finish_run(None);
    }

    clock.advance(chrono::Duration::seconds(120));
    let controller = open(&db, "dna", &clock);
    assert_eq!(controller.state(), SessionState::Started);
    assert_eq!(controller.remaining_secs(), Some(180));
    assert_eq!(controller.language(), Language::Javascript);
    assert_eq!(controller.surface().text(), "console.log(dataset)");
    assert!(controller.surface().is_editable());
    assert_eq!(controller.transcript().submission_text(), "AGCT");
}

#[test]
fn restart_after_window_closed_is_expired() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("sessions.db");
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());

    open(&db, "dna", &clock).start().unwrap();
    clock.advance(chrono::Duration::seconds(301));

    let controller = open(&db, "dna", &clock);
    assert_eq!(controller.state(), SessionState::Expired);
    assert_eq!(controller.remaining_secs(), None);
    assert!(!controller.surface().is_editable());
    assert!(controller.can_start());
}

#[test]
fn problems_are_isolated() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("sessions.db");
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());

    open(&db, "dna", &clock).start().unwrap();
    let other = open(&db, "rna", &clock);
    assert_eq!(other.state(), SessionState::NotStarted);
    assert!(other.transcript().is_empty());
}
