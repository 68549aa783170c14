//! Session reconciler tests
//!
//! Push events, fetches and local writes are fed in arbitrary orders; the
//! collection has to converge the same way regardless.

mod helpers;

use helpers::{
    delete_event, drain, insert_event, session, status_event, transcript_event, wait_until,
    with_transcript, MemorySessionSource,
};
use scribe_common::config::ReconcileSettings;
use scribe_common::events::{ClientEvent, EventBus, ReprocessDetection};
use scribe_common::model::{RecordOrigin, Session, SessionPatch, SessionStatus};
use scribe_sync::reconciler::{SessionReconciler, SessionSource};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Fixture {
    source: Arc<MemorySessionSource>,
    reconciler: SessionReconciler,
    events: EventBus,
}

async fn loaded(rows: Vec<Session>) -> Fixture {
    let source = Arc::new(MemorySessionSource::new(rows));
    let events = EventBus::new(256);
    let dyn_source: Arc<dyn SessionSource> = source.clone();
    let reconciler = SessionReconciler::spawn(
        helpers::OWNER,
        dyn_source,
        &ReconcileSettings::default(),
        events.clone(),
        &CancellationToken::new(),
    );
    reconciler.load().await.unwrap();
    Fixture {
        source,
        reconciler,
        events,
    }
}

#[tokio::test(start_paused = true)]
async fn test_initial_load_sorted_newest_first() {
    let old = session(SessionStatus::Completed, 120);
    let new = session(SessionStatus::Created, 5);
    let fx = loaded(vec![old.clone(), new.clone()]).await;

    let snapshot = fx.reconciler.snapshot();
    assert!(snapshot.loaded);
    assert!(!snapshot.loading);
    let ids: Vec<_> = snapshot.sessions.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![new.id, old.id]);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_insert_is_idempotent() {
    let fx = loaded(vec![]).await;
    let s = session(SessionStatus::Created, 1);

    fx.reconciler.apply_event(insert_event(&s));
    fx.reconciler.apply_event(insert_event(&s));
    fx.reconciler.flush().await;

    let snapshot = fx.reconciler.snapshot();
    assert_eq!(snapshot.sessions.len(), 1);
    assert_eq!(snapshot.sessions[0].id, s.id);
}

#[tokio::test(start_paused = true)]
async fn test_inserts_schedule_one_deferred_refetch() {
    let fx = loaded(vec![]).await;
    assert_eq!(fx.source.fetches(), 1);

    for minutes in 1..=3 {
        fx.reconciler
            .apply_event(insert_event(&session(SessionStatus::Created, minutes)));
    }
    fx.reconciler.flush().await;
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(fx.source.fetches(), 1, "re-fetch is deferred");

    tokio::time::sleep(Duration::from_millis(200)).await;
    fx.reconciler.settle().await;
    assert_eq!(fx.source.fetches(), 2, "inserts coalesce into one re-fetch");

    // Id-keyed merge: pushed rows missing from the fetch survive
    assert_eq!(fx.reconciler.snapshot().sessions.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_update_for_unknown_id_is_noop() {
    let known = session(SessionStatus::Recording, 3);
    let fx = loaded(vec![known.clone()]).await;

    fx.reconciler
        .apply_event(status_event(uuid::Uuid::new_v4(), SessionStatus::Completed));
    fx.reconciler.settle().await;

    let snapshot = fx.reconciler.snapshot();
    assert_eq!(snapshot.sessions.len(), 1);
    assert_eq!(snapshot.sessions[0].status, SessionStatus::Recording);
    assert_eq!(fx.source.fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_completed_transition_refetches_immediately() {
    let s = session(SessionStatus::Processing, 3);
    let fx = loaded(vec![s.clone()]).await;

    let mut stored = s.clone();
    stored.status = SessionStatus::Completed;
    fx.source.set_rows(vec![with_transcript(stored, "final transcript")]);

    fx.reconciler
        .apply_event(status_event(s.id, SessionStatus::Completed));
    fx.reconciler.settle().await;

    assert_eq!(fx.source.fetches(), 2);
    let snapshot = fx.reconciler.snapshot();
    let merged = snapshot.get(s.id).unwrap();
    assert_eq!(merged.status, SessionStatus::Completed);
    assert_eq!(merged.artifacts.transcripts.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_status_regression_keeps_status() {
    let s = session(SessionStatus::Completed, 3);
    let fx = loaded(vec![s.clone()]).await;

    let mut patch = SessionPatch::status(s.id, SessionStatus::Recording);
    patch.title = Some("Renamed".to_string());
    fx.reconciler.apply_patch(patch);
    fx.reconciler.flush().await;

    let snapshot = fx.reconciler.snapshot();
    let merged = snapshot.get(s.id).unwrap();
    assert_eq!(merged.status, SessionStatus::Completed);
    assert_eq!(merged.title, "Renamed");
}

#[tokio::test(start_paused = true)]
async fn test_delete_is_terminal_until_fresh_fetch() {
    let s = session(SessionStatus::Completed, 3);
    let fx = loaded(vec![s.clone()]).await;

    fx.reconciler.apply_event(delete_event(s.id));
    fx.reconciler.apply_event(insert_event(&s));
    fx.reconciler
        .apply_event(status_event(s.id, SessionStatus::Completed));
    fx.reconciler.flush().await;
    assert!(fx.reconciler.snapshot().get(s.id).is_none());

    // Backend still returns it: the fetch wins
    fx.reconciler.fetch(false).await.unwrap();
    assert!(fx.reconciler.snapshot().get(s.id).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_push_delete_survives_fetch_started_earlier() {
    let s = session(SessionStatus::Completed, 3);
    let fx = loaded(vec![s.clone()]).await;
    fx.source.read_rows_at_start();
    fx.source.set_fetch_delay(Duration::from_millis(500));

    let fetches = fx.source.fetches();
    fx.reconciler.refresh();
    wait_until(|| fx.source.fetches() == fetches + 1).await;
    fx.source.remove_row(s.id);
    fx.reconciler.apply_event(delete_event(s.id));
    fx.reconciler.settle().await;

    assert!(fx.reconciler.snapshot().get(s.id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_acknowledged_delete_survives_fetch_started_earlier() {
    let s = session(SessionStatus::Completed, 3);
    let fx = loaded(vec![s.clone()]).await;
    fx.source.read_rows_at_start();
    fx.source.set_fetch_delay(Duration::from_millis(500));

    let fetches = fx.source.fetches();
    fx.reconciler.refresh();
    wait_until(|| fx.source.fetches() == fetches + 1).await;
    fx.source.remove_row(s.id);
    fx.reconciler.delete_local(s.id);
    fx.reconciler.delete_acked(s.id);
    fx.reconciler.settle().await;
    assert!(fx.reconciler.snapshot().get(s.id).is_none());

    // A fetch started afterwards agrees with the delete
    fx.reconciler.fetch(false).await.unwrap();
    assert!(fx.reconciler.snapshot().get(s.id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_pending_local_delete_not_resurrected() {
    let s = session(SessionStatus::Completed, 3);
    let fx = loaded(vec![s.clone()]).await;

    fx.reconciler.delete_local(s.id);
    fx.reconciler.fetch(false).await.unwrap();
    assert!(fx.reconciler.snapshot().get(s.id).is_none());

    fx.reconciler.delete_failed(s.id);
    fx.reconciler.flush().await;
    assert!(fx.reconciler.snapshot().get(s.id).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_optimistic_create_lifecycle() {
    let fx = loaded(vec![]).await;
    let draft = Session::optimistic(helpers::OWNER, "Draft");

    fx.reconciler.create_local(draft.clone());
    fx.reconciler.flush().await;
    assert_eq!(
        fx.reconciler.snapshot().get(draft.id).unwrap().origin,
        RecordOrigin::Optimistic
    );

    // Initial-load style full fetch keeps unconfirmed optimistic rows
    fx.reconciler.fetch(true).await.unwrap();
    assert!(fx.reconciler.snapshot().get(draft.id).is_some());

    fx.reconciler.create_failed(draft.id);
    fx.reconciler.flush().await;
    assert!(fx.reconciler.snapshot().sessions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_fetches_coalesce() {
    let fx = loaded(vec![session(SessionStatus::Created, 1)]).await;
    fx.source.set_fetch_delay(Duration::from_millis(500));

    fx.reconciler.refresh();
    fx.reconciler.refresh();
    fx.reconciler.refresh();
    fx.reconciler.flush().await;
    assert!(fx.reconciler.snapshot().loading);

    fx.reconciler.settle().await;
    // One in flight plus a single follow-up
    assert_eq!(fx.source.fetches(), 3);
    assert!(!fx.reconciler.snapshot().loading);
}

#[tokio::test(start_paused = true)]
async fn test_failed_fetch_clears_guard() {
    let fx = loaded(vec![session(SessionStatus::Created, 1)]).await;
    let mut rx = fx.events.subscribe();

    fx.source.fail_next_fetch();
    assert!(fx.reconciler.fetch(false).await.is_err());
    assert!(!fx.reconciler.snapshot().loading);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, ClientEvent::FetchFailed { .. })));

    fx.reconciler.fetch(false).await.unwrap();
    assert_eq!(fx.source.fetches(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_artifact_event_for_known_session_refetches() {
    let s = session(SessionStatus::Completed, 3);
    let fx = loaded(vec![s.clone()]).await;

    fx.reconciler.apply_event(transcript_event(uuid::Uuid::new_v4()));
    fx.reconciler.flush().await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fx.source.fetches(), 1, "unknown session ignored");

    fx.reconciler.apply_event(transcript_event(s.id));
    fx.reconciler.flush().await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    fx.reconciler.settle().await;
    assert_eq!(fx.source.fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reprocess_detected_by_signature_change() {
    let s = with_transcript(session(SessionStatus::Completed, 10), "old transcript");
    let fx = loaded(vec![s.clone()]).await;
    let mut rx = fx.events.subscribe();

    fx.reconciler.begin_reprocess(s.id);
    fx.reconciler.flush().await;
    assert!(fx.reconciler.snapshot().is_reprocessing(s.id));

    // Stale echo: still completed, same content
    fx.reconciler.fetch(false).await.unwrap();
    assert!(fx.reconciler.snapshot().is_reprocessing(s.id));

    // Processing never observed, but the transcript changed
    fx.source.set_rows(vec![with_transcript(
        s.clone(),
        "a much longer regenerated transcript",
    )]);
    fx.reconciler.fetch(false).await.unwrap();
    assert!(!fx.reconciler.snapshot().is_reprocessing(s.id));

    let finished = drain(&mut rx).into_iter().find_map(|e| match e {
        ClientEvent::ReprocessingFinished { detected_by, .. } => Some(detected_by),
        _ => None,
    });
    assert_eq!(finished, Some(ReprocessDetection::SignatureChange));
}

#[tokio::test(start_paused = true)]
async fn test_reprocess_detected_by_status_transition() {
    let s = with_transcript(session(SessionStatus::Completed, 10), "same");
    let fx = loaded(vec![s.clone()]).await;
    let mut rx = fx.events.subscribe();

    fx.reconciler.begin_reprocess(s.id);
    fx.reconciler
        .apply_event(status_event(s.id, SessionStatus::Processing));
    fx.reconciler
        .apply_event(status_event(s.id, SessionStatus::Completed));
    fx.reconciler.settle().await;

    assert!(!fx.reconciler.snapshot().is_reprocessing(s.id));
    let finished = drain(&mut rx).into_iter().find_map(|e| match e {
        ClientEvent::ReprocessingFinished { detected_by, .. } => Some(detected_by),
        _ => None,
    });
    assert_eq!(finished, Some(ReprocessDetection::StatusTransition));
}

#[tokio::test(start_paused = true)]
async fn test_reprocess_flag_force_cleared() {
    let s = with_transcript(session(SessionStatus::Completed, 10), "same");
    let fx = loaded(vec![s.clone()]).await;
    let mut rx = fx.events.subscribe();

    fx.reconciler.begin_reprocess(s.id);
    fx.reconciler.flush().await;

    tokio::time::sleep(Duration::from_millis(3900)).await;
    fx.reconciler.flush().await;
    assert!(fx.reconciler.snapshot().is_reprocessing(s.id));

    tokio::time::sleep(Duration::from_millis(200)).await;
    fx.reconciler.flush().await;
    assert!(!fx.reconciler.snapshot().is_reprocessing(s.id));
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, ClientEvent::ReprocessingTimedOut { session_id, .. } if *session_id == s.id)));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_push_schedules_corrective_fetch() {
    let fx = loaded(vec![]).await;

    fx.reconciler.apply_event(scribe_common::model::ChangeEvent::new(
        scribe_common::model::ChangeOperation::Insert,
        "sessions",
        None,
        Some(serde_json::json!({"id": "not-a-uuid"})),
    ));
    fx.reconciler.flush().await;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    fx.reconciler.settle().await;

    assert!(fx.reconciler.snapshot().sessions.is_empty());
    assert_eq!(fx.source.fetches(), 2);
}
