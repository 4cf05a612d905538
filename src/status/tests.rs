use super::*;
use crate::clock::ManualClock;
use crate::event::EventKind;
use crate::location::IngestOutcome;
use crate::model::{Coordinate, LocationSample};
use crate::storage::MemoryDriver;
use std::sync::Mutex;

const T0: i64 = 1_700_000_000_000;

struct Fixture {
    engine: StatusEngine,
    storage: Arc<MemoryDriver>,
    clock: Arc<ManualClock>,
    events: Arc<Mutex<Vec<BeaconEvent>>>,
}

async fn fixture() -> Fixture {
    let storage = Arc::new(MemoryDriver::new());
    storage.initialize().await.unwrap();

    let events: Arc<Mutex<Vec<BeaconEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    storage
        .subscribe_events(Arc::new(move |e| {
            sink.lock().unwrap().push(e.clone());
            Ok(())
        }))
        .await
        .unwrap();

    let clock = Arc::new(ManualClock::new(T0));
    let engine = StatusEngine::new(
        Arc::clone(&storage) as Arc<dyn StorageDriver>,
        Thresholds::default(),
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    Fixture {
        engine,
        storage,
        clock,
        events,
    }
}

fn sample(agent_id: &str, ts: i64, speed_kmh: Option<f64>) -> LocationSample {
    LocationSample {
        agent_id: agent_id.to_string(),
        coordinate: Coordinate::new(40.7128, -74.0060),
        timestamp: ts,
        speed_kmh,
        heading_deg: None,
        metadata: None,
    }
}

fn outcome(
    agent_id: &str,
    ts: i64,
    speed_kmh: Option<f64>,
    previous: Option<LocationSample>,
) -> IngestOutcome {
    IngestOutcome {
        sample: sample(agent_id, ts, speed_kmh),
        previous,
        distance_m: 0.0,
    }
}

fn kinds(events: &[BeaconEvent]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind()).collect()
}

#[tokio::test]
async fn first_sample_classifies_active_from_offline() {
    let f = fixture().await;
    let status = f
        .engine
        .detect("a", &outcome("a", T0, None, None))
        .await
        .unwrap();
    assert_eq!(status, AgentStatus::Active);
    assert_eq!(f.storage.status("a").await.unwrap(), Some(AgentStatus::Active));

    let events = f.events.lock().unwrap();
    assert_eq!(
        kinds(&events),
        vec![EventKind::StatusChanged, EventKind::AgentBackOnline]
    );
    match &events[0].body {
        EventBody::StatusChanged {
            old_status,
            new_status,
            ..
        } => {
            assert_eq!(*old_status, AgentStatus::Offline);
            assert_eq!(*new_status, AgentStatus::Active);
        }
        other => panic!("unexpected body: {:?}", other),
    }
}

#[tokio::test]
async fn fast_sample_classifies_moving() {
    let f = fixture().await;
    let prev = sample("a", T0, None);
    f.engine
        .detect("a", &outcome("a", T0, None, None))
        .await
        .unwrap();
    f.events.lock().unwrap().clear();

    let status = f
        .engine
        .detect("a", &outcome("a", T0 + 10_000, Some(40.0), Some(prev)))
        .await
        .unwrap();
    assert_eq!(status, AgentStatus::Moving);

    let events = f.events.lock().unwrap();
    assert_eq!(kinds(&events), vec![EventKind::StatusChanged]);
}

#[tokio::test]
async fn slow_sample_classifies_stopped() {
    let f = fixture().await;
    let prev = sample("a", T0, None);
    let status = f
        .engine
        .detect("a", &outcome("a", T0 + 10_000, Some(0.5), Some(prev)))
        .await
        .unwrap();
    assert_eq!(status, AgentStatus::Stopped);
}

#[tokio::test]
async fn min_speed_boundary_is_moving() {
    let f = fixture().await;
    let prev = sample("a", T0, None);
    let status = f
        .engine
        .detect("a", &outcome("a", T0 + 10_000, Some(1.5), Some(prev)))
        .await
        .unwrap();
    assert_eq!(status, AgentStatus::Moving);
}

#[tokio::test]
async fn long_silence_overrides_speed_classification() {
    let f = fixture().await;
    // A prior sample 31 s old with default 30 s unreachable threshold:
    // the agent is "back online" even at zero speed.
    let prev = sample("a", T0, None);
    let status = f
        .engine
        .detect("a", &outcome("a", T0 + 31_000, Some(0.0), Some(prev)))
        .await
        .unwrap();
    assert_eq!(status, AgentStatus::Active);
}

#[tokio::test]
async fn repeated_classification_emits_no_event() {
    let f = fixture().await;
    f.engine
        .detect("a", &outcome("a", T0, None, None))
        .await
        .unwrap();
    f.events.lock().unwrap().clear();

    // Still ACTIVE on a re-detect with no prior sample.
    f.engine
        .detect("a", &outcome("a", T0 + 1_000, None, None))
        .await
        .unwrap();
    assert!(f.events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn check_by_time_marks_unknown_agents_offline() {
    let f = fixture().await;
    let status = f.engine.check_by_time("ghost").await.unwrap();
    assert_eq!(status, AgentStatus::Offline);
    // Already OFFLINE by default: no transition, no event.
    assert!(f.events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn check_by_time_degrades_to_unreachable_then_offline() {
    let f = fixture().await;
    f.storage
        .save_status("a", AgentStatus::Active, T0)
        .await
        .unwrap();
    let mut state = AgentState::synthesized("a", AgentStatus::Active, T0);
    state.last_update = T0;
    f.storage.save_agent_state(&state).await.unwrap();

    // 31 s of silence: UNREACHABLE.
    f.clock.set(T0 + 31_000);
    let status = f.engine.check_by_time("a").await.unwrap();
    assert_eq!(status, AgentStatus::Unreachable);
    {
        let events = f.events.lock().unwrap();
        assert_eq!(
            kinds(&events),
            vec![EventKind::StatusChanged, EventKind::AgentUnreachable]
        );
    }
    f.events.lock().unwrap().clear();

    // 11 minutes of silence: OFFLINE.
    f.clock.set(T0 + 660_000);
    let status = f.engine.check_by_time("a").await.unwrap();
    assert_eq!(status, AgentStatus::Offline);
    let events = f.events.lock().unwrap();
    assert_eq!(kinds(&events), vec![EventKind::StatusChanged]);
}

#[tokio::test]
async fn prolonged_silence_lands_on_offline_not_idle() {
    let f = fixture().await;
    f.storage
        .save_status("a", AgentStatus::Moving, T0)
        .await
        .unwrap();
    let mut state = AgentState::synthesized("a", AgentStatus::Moving, T0);
    state.last_update = T0;
    state.last_movement = Some(T0);
    f.storage.save_agent_state(&state).await.unwrap();

    // Past every threshold at once.
    f.clock.set(T0 + 700_000);
    let status = f.engine.check_by_time("a").await.unwrap();
    assert_eq!(status, AgentStatus::Offline);
}

#[tokio::test]
async fn stale_movement_degrades_active_to_idle() {
    let f = fixture().await;
    f.storage
        .save_status("a", AgentStatus::Active, T0)
        .await
        .unwrap();
    // Updates keep arriving (recent last_update) but nothing moved
    // for six minutes.
    let mut state = AgentState::synthesized("a", AgentStatus::Active, T0);
    state.last_update = T0 + 360_000;
    state.last_movement = Some(T0);
    f.storage.save_agent_state(&state).await.unwrap();

    f.clock.set(T0 + 361_000);
    let status = f.engine.check_by_time("a").await.unwrap();
    assert_eq!(status, AgentStatus::Idle);

    let events = f.events.lock().unwrap();
    assert_eq!(
        kinds(&events),
        vec![EventKind::StatusChanged, EventKind::AgentIdle]
    );
}

#[tokio::test]
async fn idle_agent_is_not_re_idled() {
    let f = fixture().await;
    f.storage
        .save_status("a", AgentStatus::Idle, T0)
        .await
        .unwrap();
    let mut state = AgentState::synthesized("a", AgentStatus::Idle, T0);
    state.last_update = f.clock.now_ms();
    state.last_movement = Some(T0 - 400_000);
    f.storage.save_agent_state(&state).await.unwrap();

    let status = f.engine.check_by_time("a").await.unwrap();
    assert_eq!(status, AgentStatus::Idle);
    assert!(f.events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn manual_override_emits_reason() {
    let f = fixture().await;
    f.engine
        .set_status("a", AgentStatus::Stopped, Some("maintenance".to_string()))
        .await
        .unwrap();
    assert_eq!(
        f.storage.status("a").await.unwrap(),
        Some(AgentStatus::Stopped)
    );

    let events = f.events.lock().unwrap();
    assert_eq!(kinds(&events), vec![EventKind::StatusChanged]);
    match &events[0].body {
        EventBody::StatusChanged { reason, .. } => {
            assert_eq!(reason.as_deref(), Some("maintenance"));
        }
        other => panic!("unexpected body: {:?}", other),
    }
}

#[tokio::test]
async fn manual_override_to_same_status_is_a_no_op() {
    let f = fixture().await;
    f.engine
        .set_status("a", AgentStatus::Offline, None)
        .await
        .unwrap();
    assert!(f.events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn recovery_from_stopped_emits_agent_active() {
    let f = fixture().await;
    f.storage
        .save_status("a", AgentStatus::Stopped, T0)
        .await
        .unwrap();
    f.engine
        .set_status("a", AgentStatus::Active, None)
        .await
        .unwrap();

    let events = f.events.lock().unwrap();
    assert_eq!(
        kinds(&events),
        vec![EventKind::StatusChanged, EventKind::AgentActive]
    );
}

#[tokio::test]
async fn every_status_changed_has_distinct_endpoints() {
    let f = fixture().await;
    f.engine
        .detect("a", &outcome("a", T0, None, None))
        .await
        .unwrap();
    let prev = sample("a", T0, None);
    f.engine
        .detect("a", &outcome("a", T0 + 5_000, Some(30.0), Some(prev)))
        .await
        .unwrap();
    f.engine
        .set_status("a", AgentStatus::Unreachable, None)
        .await
        .unwrap();

    for event in f.events.lock().unwrap().iter() {
        if let EventBody::StatusChanged {
            old_status,
            new_status,
            ..
        } = &event.body
        {
            assert_ne!(old_status, new_status);
        }
    }
}
