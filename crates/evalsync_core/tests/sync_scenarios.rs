mod common;

use std::time::Duration;

use common::{evaluation, snapshot, stamp, Sim};
use evalsync_core::{
    ClientConfig, ConnectionOptions, ErrorKind, EvaluationStatus, FetchFailure, Msg, Phase,
    StoreEvent, UpdateSource,
};
use pretty_assertions::assert_eq;
use serde_json::json;

const TICK: Duration = Duration::from_millis(5_000);

fn tracked(id: &str) -> Sim {
    let mut sim = Sim::new(ClientConfig::default());
    sim.send(Msg::Track(id.to_string()));
    sim
}

#[test]
fn newer_push_beats_older_poll() {
    let mut sim = tracked("e1");
    let channel = evaluation("e1");
    sim.open(&channel);
    sim.frame(
        &channel,
        &json!({
            "type": "progress",
            "percent_complete": 40,
            "current_step": "scoring",
            "timestamp": stamp(10),
        })
        .to_string(),
    );

    sim.advance(TICK);
    assert_eq!(sim.outstanding_fetches("e1"), 1);
    sim.respond(
        "e1",
        Ok(snapshot(
            "e1",
            json!({"status": "running", "progress_percent": 35, "updated_at": stamp(5)}),
        )),
    );

    let record = sim.store().get("e1").unwrap();
    assert_eq!(record.status, EvaluationStatus::Running);
    assert_eq!(record.progress_percent, 40.0);
    assert_eq!(record.current_step.as_deref(), Some("scoring"));
    assert_eq!(record.last_update_source, Some(UpdateSource::Push));
}

#[test]
fn poll_delivers_when_push_never_opens() {
    let mut sim = tracked("e1");
    assert_eq!(sim.store().connection(&evaluation("e1")).unwrap().phase, Phase::Connecting);

    sim.advance(TICK);
    sim.respond(
        "e1",
        Ok(snapshot("e1", json!({"status": "running", "progress": 20}))),
    );

    let record = sim.store().get("e1").unwrap();
    assert_eq!(record.progress_percent, 20.0);
    assert_eq!(record.last_update_source, Some(UpdateSource::Poll));
    assert!(!record.stale);
}

#[test]
fn late_running_poll_cannot_undo_completion() {
    let mut sim = tracked("e1");
    let channel = evaluation("e1");
    sim.open(&channel);
    sim.advance(TICK);
    let (late_request, _) = sim.fetches.iter().next().map(|(r, id)| (*r, id.clone())).unwrap();

    sim.frame(
        &channel,
        &json!({"type": "complete", "overall_score": 85, "pillar_scores": {"safety": 90}})
            .to_string(),
    );
    assert_eq!(sim.cancelled_fetches, 1);

    sim.send(Msg::StatusFetched {
        request: late_request,
        result: Ok(snapshot("e1", json!({"status": "running", "progress": 50}))),
    });

    let record = sim.store().get("e1").unwrap();
    assert_eq!(record.status, EvaluationStatus::Completed);
    assert_eq!(record.overall_score, Some(85.0));
    assert_eq!(record.progress_percent, 100.0);
    assert_eq!(record.pillar_results["safety"].score, Some(90.0));
    assert!(!sim.store().scheduler().is_running());
}

#[test]
fn push_only_completion_survives_loose_frame_shapes() {
    let config = ClientConfig {
        poll_while_push_open: false,
        ..ClientConfig::default()
    };
    for frame in [
        r#"{"type":"complete","overall_score":85,"pillar_scores":null}"#,
        r#"{"type":"complete","overall_score":85,"pillar_scores":{"privacy":{"score":90}}}"#,
    ] {
        let mut sim = Sim::new(config.clone());
        sim.send(Msg::Track("e1".into()));
        let channel = evaluation("e1");
        sim.open(&channel);
        assert!(!sim.store().scheduler().is_watched("e1"));

        sim.frame(&channel, frame);

        let record = sim.store().get("e1").unwrap();
        assert_eq!(record.status, EvaluationStatus::Completed);
        assert_eq!(record.overall_score, Some(85.0));
    }
}

#[test]
fn untimed_push_is_not_frozen_by_a_server_clock_ahead() {
    let mut sim = tracked("e1");
    let channel = evaluation("e1");
    sim.open(&channel);
    sim.advance(TICK);
    sim.respond(
        "e1",
        Ok(snapshot(
            "e1",
            json!({"status": "running", "progress": 35, "updated_at": stamp(65)}),
        )),
    );
    assert_eq!(sim.store().get("e1").unwrap().progress_percent, 35.0);

    sim.frame(&channel, r#"{"type":"progress","percent_complete":70}"#);
    assert_eq!(sim.store().get("e1").unwrap().progress_percent, 70.0);

    sim.advance(TICK);
    sim.respond(
        "e1",
        Ok(snapshot(
            "e1",
            json!({"status": "running", "progress": 30, "updated_at": stamp(62)}),
        )),
    );
    let record = sim.store().get("e1").unwrap();
    assert_eq!(record.progress_percent, 70.0);
    assert_eq!(record.last_update_source, Some(UpdateSource::Push));
}

#[test]
fn frames_naming_another_evaluation_are_dropped() {
    let mut sim = tracked("e1");
    let channel = evaluation("e1");
    sim.open(&channel);
    sim.frame(
        &channel,
        r#"{"type":"complete","evaluation_id":"e2","overall_score":10}"#,
    );

    assert!(sim.store().get("e2").is_none());
    assert_eq!(sim.store().get("e1").unwrap().status, EvaluationStatus::Pending);
}

#[test]
fn error_frame_fails_the_evaluation() {
    let mut sim = tracked("e1");
    let channel = evaluation("e1");
    sim.open(&channel);
    sim.frame(&channel, r#"{"type":"error","message":"judge crashed"}"#);

    let record = sim.store().get("e1").unwrap();
    assert_eq!(record.status, EvaluationStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("judge crashed"));
}

#[test]
fn malformed_and_unknown_frames_are_ignored() {
    let mut sim = tracked("e1");
    let channel = evaluation("e1");
    sim.open(&channel);
    let before = sim.store().get("e1").cloned();

    sim.frame(&channel, "{not json");
    sim.frame(&channel, r#"{"type":"mystery"}"#);
    sim.frame(&channel, "pong");

    assert_eq!(sim.store().get("e1").cloned(), before);
    assert_eq!(sim.store().connection(&channel).unwrap().phase, Phase::Open);
}

#[test]
fn heartbeat_pings_while_open() {
    let mut sim = tracked("e1");
    let channel = evaluation("e1");
    sim.open(&channel);
    let transport = sim.transport(&channel);

    sim.advance(Duration::from_millis(60_000));
    let pings = sim
        .sent
        .iter()
        .filter(|(t, text)| *t == transport && text == "ping")
        .count();
    assert_eq!(pings, 2);
}

#[test]
fn reconnect_is_bounded_by_attempts() {
    let config = ClientConfig {
        connection: ConnectionOptions {
            reconnect_attempts: 3,
            reconnect_delay_ms: 1_000,
            ..ConnectionOptions::default()
        },
        ..ClientConfig::default()
    };
    let mut sim = Sim::new(config);
    sim.send(Msg::Track("e1".into()));
    let channel = evaluation("e1");

    for _ in 0..5 {
        if sim.store().connection(&channel).unwrap().phase != Phase::Connecting {
            break;
        }
        sim.fail_connect(&channel);
        sim.advance(Duration::from_millis(1_000));
    }

    // One initial attempt plus three reconnects.
    assert_eq!(sim.opened.len(), 4);
    let state = sim.store().connection(&channel).unwrap();
    assert_eq!(state.phase, Phase::Closed);
    assert_eq!(state.reconnect_attempts, 3);
    assert_eq!(
        state.last_error.as_ref().map(|error| error.kind),
        Some(ErrorKind::ReconnectExhausted)
    );

    sim.advance(Duration::from_millis(30_000));
    assert_eq!(sim.opened.len(), 4);
    assert!(sim.store().scheduler().is_watched("e1"));
}

#[test]
fn successful_open_resets_the_attempt_counter() {
    let mut sim = tracked("e1");
    let channel = evaluation("e1");
    sim.fail_connect(&channel);
    sim.advance(Duration::from_millis(3_000));
    assert_eq!(sim.store().connection(&channel).unwrap().reconnect_attempts, 1);

    sim.open(&channel);
    let state = sim.store().connection(&channel).unwrap();
    assert_eq!(state.phase, Phase::Open);
    assert_eq!(state.reconnect_attempts, 0);

    sim.drop_connection(&channel);
    assert_eq!(sim.store().connection(&channel).unwrap().reconnect_attempts, 1);
}

#[test]
fn exhausted_push_and_failing_poll_mark_the_record_stale() {
    let config = ClientConfig {
        connection: ConnectionOptions {
            reconnect: false,
            ..ConnectionOptions::default()
        },
        ..ClientConfig::default()
    };
    let mut sim = Sim::new(config);
    sim.send(Msg::Track("e1".into()));
    let channel = evaluation("e1");
    sim.fail_connect(&channel);
    assert!(!sim.store().get("e1").unwrap().stale);

    sim.advance(TICK);
    sim.respond("e1", Err(FetchFailure::new("503 Service Unavailable")));
    assert!(sim.store().get("e1").unwrap().stale);
    assert!(sim.events.contains(&StoreEvent::RecordStale {
        evaluation_id: "e1".into(),
        stale: true,
    }));

    sim.advance(TICK);
    sim.respond(
        "e1",
        Ok(snapshot("e1", json!({"status": "running", "progress": 60}))),
    );
    let record = sim.store().get("e1").unwrap();
    assert!(!record.stale);
    assert_eq!(record.progress_percent, 60.0);
}

#[test]
fn push_only_mode_polls_while_the_channel_is_down() {
    let config = ClientConfig {
        poll_while_push_open: false,
        ..ClientConfig::default()
    };
    let mut sim = Sim::new(config);
    sim.send(Msg::Track("e1".into()));
    let channel = evaluation("e1");
    assert!(sim.store().scheduler().is_watched("e1"));

    sim.open(&channel);
    assert!(!sim.store().scheduler().is_watched("e1"));
    sim.advance(TICK);
    assert_eq!(sim.fetch_count, 0);

    sim.drop_connection(&channel);
    assert!(sim.store().scheduler().is_watched("e1"));
    sim.advance(TICK);
    assert_eq!(sim.outstanding_fetches("e1"), 1);
}

#[test]
fn list_refresh_merges_as_poll_data() {
    let mut sim = Sim::new(ClientConfig::default());
    sim.send(Msg::RefreshList);
    assert_eq!(sim.list_requests, 1);

    sim.send(Msg::ListFetched(Ok(vec![
        snapshot("a", json!({"status": "completed", "overall_score": 71})),
        snapshot("b", json!({"status": "pending"})),
    ])));

    let ids: Vec<_> = sim.store().list().map(|record| record.id.clone()).collect();
    assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(sim.store().get("a").unwrap().overall_score, Some(71.0));
    // Listing does not start tracking.
    assert_eq!(sim.store().tracked().count(), 0);
    assert_eq!(sim.pending_timers(), 0);
}
