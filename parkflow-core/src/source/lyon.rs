use chrono::Utc;
use parkflow_lyon::{LyonApiClient, ParkingRecord};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::message::{Batch, RawReading};
use crate::source::{SourceAcker, SourceReader};

impl From<ParkingRecord> for RawReading {
    fn from(record: ParkingRecord) -> Self {
        RawReading {
            facility_id: record.identifier,
            available_spaces: record.available_spaces,
            closed: record.closed,
            observed_at: record.date,
        }
    }
}

/// Polls the Grand Lyon feed once per configured interval and wraps each
/// snapshot in a [Batch]. A failed poll is logged and yields an empty batch;
/// the forwarder skips empty batches without committing, so the next
/// successful poll picks up where we left off.
pub(crate) struct LyonSource {
    client: LyonApiClient,
    ticker: Interval,
    /// Highest batch id handed out so far. Seeded with the last committed id
    /// at startup so that ids stay strictly increasing even when the wall
    /// clock steps backwards.
    last_id: u64,
}

impl LyonSource {
    pub(crate) fn new(url: &str, poll_interval: std::time::Duration, id_floor: u64) -> Self {
        let mut ticker = tokio::time::interval(poll_interval);
        // a slow cycle must not cause a burst of catch-up polls
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            client: LyonApiClient::new(url),
            ticker,
            last_id: id_floor,
        }
    }
}

impl SourceReader for LyonSource {
    fn name(&self) -> &'static str {
        "lyon"
    }

    async fn read(&mut self) -> crate::Result<Option<Batch>> {
        self.ticker.tick().await;

        // Batch ids come off the wall clock, clamped to stay above every id
        // handed out before, so a committed id is never reused even across a
        // backwards clock step (NTP correction).
        let id = (Utc::now().timestamp_millis() as u64).max(self.last_id + 1);
        self.last_id = id;

        let readings = match self.client.fetch().await {
            Ok(records) => records.into_iter().map(RawReading::from).collect(),
            Err(e) => {
                warn!(%e, "Failed to poll the parking feed, will retry next cycle");
                Vec::new()
            }
        };

        debug!(batch_id = id, count = readings.len(), "Polled parking feed");
        Ok(Some(Batch { id, readings }))
    }
}

/// The feed is a rolling snapshot with no replay cursor, so there is nothing
/// to acknowledge upstream. Recovery relies on the checkpoint instead.
pub(crate) struct LyonAcker;

impl SourceAcker for LyonAcker {
    async fn ack(&mut self, _batch_id: u64) -> crate::Result<()> {
        Ok(())
    }
}
