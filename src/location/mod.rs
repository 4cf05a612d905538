//! Location ingest pipeline.
//!
//! Validates a raw position report, derives movement metrics against
//! the previous sample, persists, and publishes `location.received`.
//! Anomaly detection is advisory: an implausible jump is logged but
//! the sample is still accepted.

use crate::clock::{self, Clock};
use crate::config::Thresholds;
use crate::error::BeaconError;
use crate::event::{BeaconEvent, EventBody};
use crate::geo;
use crate::model::{Coordinate, LocationSample};
use crate::storage::StorageDriver;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of one accepted ingest: the stored sample, the sample it
/// displaced, and the derived segment length.
pub struct IngestOutcome {
    pub sample: LocationSample,
    pub previous: Option<LocationSample>,
    pub distance_m: f64,
}

pub struct LocationEngine {
    storage: Arc<dyn StorageDriver>,
    thresholds: Thresholds,
    clock: Arc<dyn Clock>,
}

impl LocationEngine {
    pub fn new(
        storage: Arc<dyn StorageDriver>,
        thresholds: Thresholds,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            thresholds,
            clock,
        }
    }

    /// Validate, derive, persist and publish one position report.
    pub async fn ingest(
        &self,
        agent_id: &str,
        lat: f64,
        lon: f64,
        timestamp: Option<i64>,
        metadata: Option<HashMap<String, Value>>,
    ) -> Result<IngestOutcome, BeaconError> {
        if agent_id.trim().is_empty() {
            return Err(BeaconError::InvalidInput(
                "agent id must not be empty".to_string(),
            ));
        }
        if !geo::valid_coordinate(lat, lon) {
            return Err(BeaconError::InvalidInput(format!(
                "coordinate ({}, {}) is out of range",
                lat, lon
            )));
        }

        let now = self.clock.now_ms();
        let ts = clock::sanitize_timestamp(timestamp, now);
        let coordinate = Coordinate::new(lat, lon);

        let previous = self.storage.last_location(agent_id).await?;

        let mut distance_m = 0.0;
        let mut speed_kmh = None;
        let mut heading_deg = None;

        if let Some(prev) = &previous {
            distance_m = geo::distance_m(prev.coordinate, coordinate);
            let dt_ms = ts - prev.timestamp;

            if geo::abnormal_jump(distance_m, dt_ms, self.thresholds.max_jump_distance_m) {
                warn!(
                    agent_id = %agent_id,
                    distance_m = distance_m,
                    dt_ms = dt_ms,
                    max_jump_m = self.thresholds.max_jump_distance_m,
                    "abnormal location jump, accepting sample anyway"
                );
            }

            if dt_ms > 0 {
                speed_kmh = Some(geo::speed_kmh(distance_m, dt_ms));
            }
            if distance_m > geo::HEADING_NOISE_FLOOR_M {
                heading_deg = Some(geo::bearing_deg(prev.coordinate, coordinate));
            }
        }

        let sample = LocationSample {
            agent_id: agent_id.to_string(),
            coordinate,
            timestamp: ts,
            speed_kmh,
            heading_deg,
            metadata,
        };

        self.storage.save_location(agent_id, &sample).await?;

        let event = BeaconEvent::new(
            now,
            EventBody::LocationReceived {
                agent_id: agent_id.to_string(),
                sample: sample.clone(),
                distance_m,
                speed_kmh: speed_kmh.unwrap_or(0.0),
            },
        );
        self.storage.publish_event(&event).await?;

        debug!(
            agent_id = %agent_id,
            lat = lat,
            lon = lon,
            distance_m = distance_m,
            "location accepted"
        );

        Ok(IngestOutcome {
            sample,
            previous,
            distance_m,
        })
    }

    pub async fn current_location(
        &self,
        agent_id: &str,
    ) -> Result<Option<LocationSample>, BeaconError> {
        Ok(self.storage.last_location(agent_id).await?)
    }

    /// Great-circle meters between two agents' last samples, or `None`
    /// when either side has never reported.
    pub async fn distance_between(
        &self,
        agent_a: &str,
        agent_b: &str,
    ) -> Result<Option<f64>, BeaconError> {
        let a = self.storage.last_location(agent_a).await?;
        let b = self.storage.last_location(agent_b).await?;
        match (a, b) {
            (Some(a), Some(b)) => Ok(Some(geo::distance_m(a.coordinate, b.coordinate))),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Thresholds;
    use crate::event::EventKind;
    use crate::storage::MemoryDriver;
    use std::sync::Mutex;

    const T0: i64 = 1_700_000_000_000;

    struct Fixture {
        engine: LocationEngine,
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
        let engine = LocationEngine::new(
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

    #[tokio::test]
    async fn rejects_empty_agent_id() {
        let f = fixture().await;
        let err = f.engine.ingest("  ", 40.0, -74.0, None, None).await;
        assert!(matches!(err, Err(BeaconError::InvalidInput(_))));
        assert!(f.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_out_of_range_coordinates() {
        let f = fixture().await;
        assert!(f.engine.ingest("a", 91.0, 0.0, None, None).await.is_err());
        assert!(f.engine.ingest("a", 0.0, 181.0, None, None).await.is_err());
        assert!(f
            .engine
            .ingest("a", f64::NAN, 0.0, None, None)
            .await
            .is_err());
        // Nothing persisted for rejected input.
        assert!(f.storage.last_location("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn first_sample_has_no_derived_metrics() {
        let f = fixture().await;
        let outcome = f
            .engine
            .ingest("a", 40.7128, -74.0060, None, None)
            .await
            .unwrap();

        assert_eq!(outcome.sample.timestamp, T0);
        assert!(outcome.previous.is_none());
        assert_eq!(outcome.distance_m, 0.0);
        assert!(outcome.sample.speed_kmh.is_none());
        assert!(outcome.sample.heading_deg.is_none());

        let events = f.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::LocationReceived);
    }

    #[tokio::test]
    async fn second_sample_derives_speed_and_heading() {
        let f = fixture().await;
        f.engine
            .ingest("a", 40.7128, -74.0060, Some(T0), None)
            .await
            .unwrap();

        f.clock.advance(60_000);
        let outcome = f
            .engine
            .ingest("a", 40.7228, -74.0060, Some(T0 + 60_000), None)
            .await
            .unwrap();

        // ~1111 m north in one minute.
        assert!((outcome.distance_m - 1_112.0).abs() < 5.0);
        let speed = outcome.sample.speed_kmh.unwrap();
        assert!((speed - 66.7).abs() < 0.5, "got {}", speed);
        let heading = outcome.sample.heading_deg.unwrap();
        assert!(heading < 1.0 || heading > 359.0);
    }

    #[tokio::test]
    async fn stationary_sample_has_no_heading() {
        let f = fixture().await;
        f.engine
            .ingest("a", 40.7128, -74.0060, Some(T0), None)
            .await
            .unwrap();
        let outcome = f
            .engine
            .ingest("a", 40.7128, -74.0060, Some(T0 + 10_000), None)
            .await
            .unwrap();
        assert_eq!(outcome.sample.speed_kmh, Some(0.0));
        assert!(outcome.sample.heading_deg.is_none());
    }

    #[tokio::test]
    async fn abnormal_jump_is_accepted() {
        let f = fixture().await;
        f.engine
            .ingest("a", 40.7128, -74.0060, Some(T0), None)
            .await
            .unwrap();
        // ~111 km in 10 s: flagged, but still stored.
        let outcome = f
            .engine
            .ingest("a", 41.7128, -74.0060, Some(T0 + 10_000), None)
            .await
            .unwrap();
        assert!(outcome.distance_m > 100_000.0);
        let stored = f.storage.last_location("a").await.unwrap().unwrap();
        assert_eq!(stored.coordinate, outcome.sample.coordinate);
    }

    #[tokio::test]
    async fn future_timestamp_is_replaced_with_now() {
        let f = fixture().await;
        let outcome = f
            .engine
            .ingest("a", 40.0, -74.0, Some(T0 + 120_000), None)
            .await
            .unwrap();
        assert_eq!(outcome.sample.timestamp, T0);

        let outcome = f
            .engine
            .ingest("a", 40.0, -74.0, Some(-5), None)
            .await
            .unwrap();
        assert_eq!(outcome.sample.timestamp, T0);
    }

    #[tokio::test]
    async fn distance_between_requires_both_sides() {
        let f = fixture().await;
        f.engine
            .ingest("a", 40.7128, -74.0060, None, None)
            .await
            .unwrap();
        assert!(f
            .engine
            .distance_between("a", "b")
            .await
            .unwrap()
            .is_none());

        f.engine
            .ingest("b", 40.7228, -74.0060, None, None)
            .await
            .unwrap();
        let d = f.engine.distance_between("a", "b").await.unwrap().unwrap();
        assert!((d - 1_112.0).abs() < 5.0);
    }
}
