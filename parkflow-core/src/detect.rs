//! Change-detection processor: the stateful core of the pipeline. For each
//! batch it validates the raw readings, compares every facility's readings
//! against that facility's state entry, emits only the readings that carry
//! new information, and finishes with the inactivity eviction sweep.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::message::{Batch, Emission, Reading};
use crate::metrics::{forward_metrics, forward_metrics_labels};
use crate::state::{StateEntry, StateStoreHandle};

pub(crate) struct ChangeDetector {
    state: StateStoreHandle,
    /// Inactivity window after which a facility's entry is evicted and its
    /// next reading treated as first-seen again.
    state_ttl: Duration,
}

impl ChangeDetector {
    pub(crate) fn new(state: StateStoreHandle, state_ttl: Duration) -> Self {
        Self { state, state_ttl }
    }

    /// Process one batch. Emissions for a single facility come out in
    /// `observed_at` order; across facilities no order is guaranteed. The
    /// state store sees exactly one put per touched key, after that key's
    /// readings are fully folded, so a snapshot taken afterwards is never
    /// torn mid-key.
    pub(crate) async fn process(&self, batch: &Batch) -> crate::Result<Vec<Emission>> {
        let mut by_key: BTreeMap<String, Vec<Reading>> = BTreeMap::new();
        let mut horizon: Option<DateTime<Utc>> = None;

        for raw in batch.readings.iter().cloned() {
            match Reading::try_from(raw) {
                Ok(reading) => {
                    horizon = Some(match horizon {
                        Some(t) => t.max(reading.observed_at),
                        None => reading.observed_at,
                    });
                    by_key
                        .entry(reading.facility_id.clone())
                        .or_default()
                        .push(reading);
                }
                Err(e) => {
                    warn!(batch_id = batch.id, error = %e, "Dropping malformed reading");
                    forward_metrics()
                        .dropped_malformed_total
                        .get_or_create(forward_metrics_labels())
                        .inc();
                }
            }
        }

        let touched: HashSet<String> = by_key.keys().cloned().collect();
        let mut emissions = Vec::new();
        let mut seq = 0;

        for (key, mut readings) in by_key {
            // stable sort: arrival order breaks observed_at ties
            readings.sort_by_key(|r| r.observed_at);

            let mut entry = self.state.get(&key).await?;
            for reading in readings {
                let value = reading.value();
                match entry.as_mut() {
                    Some(e) if e.last_emitted == value => {
                        // duplicate: not emitted, but it still counts as a
                        // keep-alive for the eviction sweep
                        e.last_seen_at = reading.observed_at;
                    }
                    Some(e) => {
                        e.last_emitted = value;
                        e.last_seen_at = reading.observed_at;
                        emissions.push(Emission::from_reading(batch.id, seq, reading));
                        seq += 1;
                    }
                    None => {
                        // first observation for this key emits unconditionally
                        entry = Some(StateEntry {
                            last_emitted: value,
                            last_seen_at: reading.observed_at,
                        });
                        emissions.push(Emission::from_reading(batch.id, seq, reading));
                        seq += 1;
                    }
                }
            }
            if let Some(entry) = entry {
                self.state.put(key, entry).await?;
            }
        }

        if let Some(horizon) = horizon {
            self.sweep(horizon, &touched).await?;
        }

        debug!(
            batch_id = batch.id,
            readings = batch.readings.len(),
            emitted = emissions.len(),
            "Processed batch"
        );
        Ok(emissions)
    }

    /// Evict entries whose facilities went quiet for longer than the TTL.
    /// Event time (the newest `observed_at` in the batch) is the clock, so
    /// replaying a batch after recovery makes the same decisions. Keys the
    /// current batch touched were just refreshed and are exempt.
    async fn sweep(&self, horizon: DateTime<Utc>, touched: &HashSet<String>) -> crate::Result<()> {
        for (key, entry) in self.state.snapshot().await? {
            if touched.contains(&key) {
                continue;
            }
            if entry.last_seen_at + self.state_ttl < horizon {
                debug!(facility_id = %key, last_seen_at = %entry.last_seen_at, "Evicting inactive facility");
                forward_metrics()
                    .evicted_total
                    .get_or_create(forward_metrics_labels())
                    .inc();
                self.state.evict(key).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::message::RawReading;

    fn raw(
        facility_id: &str,
        spaces: Option<i64>,
        closed: bool,
        minute: u32,
    ) -> RawReading {
        RawReading {
            facility_id: Some(facility_id.to_string()),
            available_spaces: spaces,
            closed: Some(closed),
            observed_at: Some(Utc.with_ymd_and_hms(2024, 11, 2, 10, minute, 0).unwrap()),
        }
    }

    fn detector(state: &StateStoreHandle) -> ChangeDetector {
        ChangeDetector::new(state.clone(), Duration::hours(24))
    }

    fn spaces(emissions: &[Emission]) -> Vec<Option<u32>> {
        emissions.iter().map(|e| e.available_spaces).collect()
    }

    #[tokio::test]
    async fn test_scenario_a_consecutive_duplicate_collapsed() {
        let state = StateStoreHandle::new();
        let batch = Batch {
            id: 1,
            readings: vec![
                raw("P1", Some(10), false, 1),
                raw("P1", Some(10), false, 2),
                raw("P1", Some(8), false, 3),
            ],
        };

        let emissions = detector(&state).process(&batch).await.unwrap();
        assert_eq!(spaces(&emissions), vec![Some(10), Some(8)]);
        assert_eq!(
            emissions.first().unwrap().observed_at,
            Utc.with_ymd_and_hms(2024, 11, 2, 10, 1, 0).unwrap()
        );
        assert_eq!(
            emissions.last().unwrap().observed_at,
            Utc.with_ymd_and_hms(2024, 11, 2, 10, 3, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_scenario_b_closed_flag_flip_is_a_change() {
        let state = StateStoreHandle::new();
        let batch = Batch {
            id: 1,
            readings: vec![raw("P2", Some(5), false, 1), raw("P2", Some(5), true, 2)],
        };

        let emissions = detector(&state).process(&batch).await.unwrap();
        assert_eq!(emissions.len(), 2);
        assert!(!emissions.first().unwrap().closed);
        assert!(emissions.last().unwrap().closed);
    }

    #[tokio::test]
    async fn test_scenario_c_malformed_reading_dropped() {
        let state = StateStoreHandle::new();
        let mut malformed = raw("P1", Some(5), false, 1);
        malformed.facility_id = None;
        let batch = Batch {
            id: 1,
            readings: vec![malformed],
        };

        let dropped_before = forward_metrics()
            .dropped_malformed_total
            .get_or_create(forward_metrics_labels())
            .get();

        let emissions = detector(&state).process(&batch).await.unwrap();
        assert!(emissions.is_empty());
        assert_eq!(state.len().await.unwrap(), 0);

        // exactly one drop is recorded for the one malformed reading
        let dropped_after = forward_metrics()
            .dropped_malformed_total
            .get_or_create(forward_metrics_labels())
            .get();
        assert_eq!(dropped_after - dropped_before, 1);
    }

    #[tokio::test]
    async fn test_duplicates_across_batches_suppressed() {
        let state = StateStoreHandle::new();
        let det = detector(&state);

        let first = Batch {
            id: 1,
            readings: vec![raw("P1", Some(10), false, 1)],
        };
        assert_eq!(det.process(&first).await.unwrap().len(), 1);

        let second = Batch {
            id: 2,
            readings: vec![raw("P1", Some(10), false, 2)],
        };
        assert!(det.process(&second).await.unwrap().is_empty());

        // the duplicate still advanced last_seen_at
        let entry = state.get("P1").await.unwrap().unwrap();
        assert_eq!(
            entry.last_seen_at,
            Utc.with_ymd_and_hms(2024, 11, 2, 10, 2, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_flip_flop_within_batch_preserved() {
        let state = StateStoreHandle::new();
        let batch = Batch {
            id: 1,
            readings: vec![
                raw("P1", Some(5), false, 1),
                raw("P1", Some(5), true, 2),
                raw("P1", Some(5), false, 3),
            ],
        };

        let emissions = detector(&state).process(&batch).await.unwrap();
        let flags: Vec<bool> = emissions.iter().map(|e| e.closed).collect();
        assert_eq!(flags, vec![false, true, false]);
    }

    #[tokio::test]
    async fn test_out_of_order_readings_sorted_by_observed_at() {
        let state = StateStoreHandle::new();
        let batch = Batch {
            id: 1,
            readings: vec![raw("P1", Some(8), false, 3), raw("P1", Some(10), false, 1)],
        };

        let emissions = detector(&state).process(&batch).await.unwrap();
        assert_eq!(spaces(&emissions), vec![Some(10), Some(8)]);
    }

    #[tokio::test]
    async fn test_unknown_count_transition_is_a_change() {
        let state = StateStoreHandle::new();
        let det = detector(&state);

        let first = Batch {
            id: 1,
            readings: vec![raw("P1", Some(10), false, 1)],
        };
        assert_eq!(det.process(&first).await.unwrap().len(), 1);

        // present -> absent counts as a change, and so does absent -> present
        let second = Batch {
            id: 2,
            readings: vec![raw("P1", None, false, 2), raw("P1", Some(10), false, 3)],
        };
        let emissions = det.process(&second).await.unwrap();
        assert_eq!(spaces(&emissions), vec![None, Some(10)]);
    }

    #[tokio::test]
    async fn test_eviction_then_reappearance_emits_unconditionally() {
        let state = StateStoreHandle::new();
        let det = ChangeDetector::new(state.clone(), Duration::minutes(10));

        let first = Batch {
            id: 1,
            readings: vec![raw("P1", Some(10), false, 0), raw("P2", Some(3), false, 0)],
        };
        assert_eq!(det.process(&first).await.unwrap().len(), 2);

        // P1 goes quiet; P2 keeps reporting the same value past the TTL,
        // which evicts P1 during the sweep
        let second = Batch {
            id: 2,
            readings: vec![raw("P2", Some(3), false, 20)],
        };
        assert!(det.process(&second).await.unwrap().is_empty());
        assert_eq!(state.get("P1").await.unwrap(), None);

        // P1 reappears with its old value and is treated as first-seen
        let third = Batch {
            id: 3,
            readings: vec![raw("P1", Some(10), false, 21)],
        };
        let emissions = det.process(&third).await.unwrap();
        assert_eq!(spaces(&emissions), vec![Some(10)]);
    }

    #[tokio::test]
    async fn test_keys_touched_by_batch_survive_sweep() {
        let state = StateStoreHandle::new();
        let det = ChangeDetector::new(state.clone(), Duration::minutes(10));

        let first = Batch {
            id: 1,
            readings: vec![raw("P1", Some(10), false, 0)],
        };
        assert_eq!(det.process(&first).await.unwrap().len(), 1);

        // P1's only reading is far behind the horizon it itself establishes,
        // but a key seen in the batch is never swept
        let second = Batch {
            id: 2,
            readings: vec![raw("P1", Some(10), false, 30)],
        };
        assert!(det.process(&second).await.unwrap().is_empty());
        assert!(state.get("P1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_replay_from_own_checkpoint_is_idempotent() {
        let state = StateStoreHandle::new();
        let det = detector(&state);
        let batch = Batch {
            id: 1,
            readings: vec![
                raw("P1", Some(10), false, 1),
                raw("P1", Some(8), false, 2),
                raw("P2", Some(5), true, 1),
            ],
        };
        assert_eq!(det.process(&batch).await.unwrap().len(), 3);
        let snapshot = state.snapshot().await.unwrap();

        // a fresh store seeded from the batch's own checkpoint replays to
        // zero new emissions
        let restored = StateStoreHandle::new();
        restored.seed(snapshot).await.unwrap();
        let det = detector(&restored);
        assert!(det.process(&batch).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_emissions_across_keys_each_in_order() {
        let state = StateStoreHandle::new();
        let batch = Batch {
            id: 1,
            readings: vec![
                raw("P2", Some(1), false, 2),
                raw("P1", Some(10), false, 1),
                raw("P2", Some(2), false, 3),
                raw("P1", Some(9), false, 4),
            ],
        };

        let emissions = detector(&state).process(&batch).await.unwrap();
        let p1: Vec<_> = emissions
            .iter()
            .filter(|e| e.facility_id == "P1")
            .map(|e| e.available_spaces)
            .collect();
        let p2: Vec<_> = emissions
            .iter()
            .filter(|e| e.facility_id == "P2")
            .map(|e| e.available_spaces)
            .collect();
        assert_eq!(p1, vec![Some(10), Some(9)]);
        assert_eq!(p2, vec![Some(1), Some(2)]);
    }
}
