//! Forwarder: drives the read, detect, sink, checkpoint, ack cycle, one batch
//! at a time. The checkpoint is committed only after the batch's emissions
//! were fully written to the sink, which is what makes delivery at-least-once:
//! a crash between sink write and commit replays the batch and re-emits.

use std::collections::HashMap;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::config::config;
use crate::detect::ChangeDetector;
use crate::error::{Error, Result};
use crate::message::{Batch, Emission};
use crate::metrics;
use crate::metrics::forward_metrics;
use crate::sink::{ResponseStatusFromSink, SinkHandle};
use crate::source::SourceHandle;
use crate::state::StateStoreHandle;

/// Forwarder reads batches from the source, runs them through the change
/// detector, writes the emissions to the sink, checkpoints, and then
/// acknowledges the batch back to the source.
pub(crate) struct Forwarder {
    source: SourceHandle,
    sink: SinkHandle,
    detector: ChangeDetector,
    state: StateStoreHandle,
    checkpoint: CheckpointManager,
    cln_token: CancellationToken,
    /// Highest batch id covered by a committed checkpoint. Batches at or
    /// below it were fully processed in a previous life and are only acked.
    last_committed: Option<u64>,
    common_labels: Vec<(String, String)>,
}

/// ForwarderBuilder is used to build a Forwarder instance with mandatory fields.
pub(crate) struct ForwarderBuilder {
    source: SourceHandle,
    sink: SinkHandle,
    detector: ChangeDetector,
    state: StateStoreHandle,
    checkpoint: CheckpointManager,
    cln_token: CancellationToken,
}

impl ForwarderBuilder {
    pub(crate) fn new(
        source: SourceHandle,
        sink: SinkHandle,
        detector: ChangeDetector,
        state: StateStoreHandle,
        checkpoint: CheckpointManager,
        cln_token: CancellationToken,
    ) -> Self {
        Self {
            source,
            sink,
            detector,
            state,
            checkpoint,
            cln_token,
        }
    }

    /// Build the Forwarder instance
    #[must_use]
    pub(crate) fn build(self) -> Forwarder {
        let common_labels = metrics::forward_metrics_labels().clone();
        Forwarder {
            source: self.source,
            sink: self.sink,
            detector: self.detector,
            state: self.state,
            checkpoint: self.checkpoint,
            cln_token: self.cln_token,
            last_committed: None,
            common_labels,
        }
    }
}

impl Forwarder {
    /// Restore from the last checkpoint if one exists, then run the
    /// process-a-batch loop until the source is exhausted or shutdown is
    /// requested. A batch in flight is always finished before the loop exits.
    /// This function returns on any error and will end up in a non-0 exit code.
    pub(crate) async fn start(&mut self) -> Result<()> {
        if let Some((batch_id, entries)) = self.checkpoint.restore().await? {
            self.state.seed(entries).await?;
            self.last_committed = Some(batch_id);
        }

        loop {
            if self.cln_token.is_cancelled() {
                info!("Shutdown requested, stopping the forwarder");
                break;
            }

            let batch = tokio::select! {
                _ = self.cln_token.cancelled() => {
                    info!("Shutdown requested, stopping the forwarder");
                    break;
                }
                batch = self.source.read() => batch?,
            };

            let Some(batch) = batch else {
                info!("Source is exhausted, stopping the forwarder");
                break;
            };

            // A batch covered by the checkpoint was fully processed before a
            // restart; acknowledge it without re-emitting.
            if self.last_committed.is_some_and(|committed| batch.id <= committed) {
                debug!(batch_id = batch.id, "Skipping already committed batch");
                self.source.ack(batch.id).await?;
                continue;
            }

            self.process_batch(batch).await?;
        }
        Ok(())
    }

    /// Run one batch through detect, sink, checkpoint and ack, in that order.
    async fn process_batch(&mut self, batch: Batch) -> Result<()> {
        let start_time = tokio::time::Instant::now();

        forward_metrics()
            .read_total
            .get_or_create(&self.common_labels)
            .inc_by(batch.readings.len() as u64);

        // an empty batch (e.g. a failed poll) carries no information and is
        // not worth a checkpoint
        if batch.readings.is_empty() {
            return Ok(());
        }

        let emissions = self.detector.process(&batch).await?;
        forward_metrics()
            .emitted_total
            .get_or_create(&self.common_labels)
            .inc_by(emissions.len() as u64);

        self.write_to_sink(emissions).await?;

        let snapshot = self.state.snapshot().await?;
        self.checkpoint.commit(batch.id, snapshot).await?;
        self.last_committed = Some(batch.id);
        forward_metrics()
            .checkpoint_total
            .get_or_create(&self.common_labels)
            .inc();

        self.source.ack(batch.id).await?;

        forward_metrics()
            .e2e_time
            .get_or_create(&self.common_labels)
            .observe(start_time.elapsed().as_micros() as f64);
        Ok(())
    }

    /// Write the emissions to the sink, retrying the records that failed.
    /// Running out of retries is fatal; dropping emissions would silently
    /// break the at-least-once guarantee.
    async fn write_to_sink(&mut self, emissions: Vec<Emission>) -> Result<()> {
        if emissions.is_empty() {
            return Ok(());
        }

        let emission_count = emissions.len() as u64;
        let start_time = tokio::time::Instant::now();

        let mut attempts = 0;
        let mut error_map = HashMap::new();
        // we will overwrite this vec with failed emissions and keep retrying
        let mut emissions_to_send = emissions;
        while attempts <= config().sink_max_retry_attempts {
            let responses = self.sink.sink(emissions_to_send.clone()).await?;
            attempts += 1;

            // map id to result, since there is no strict requirement for the
            // sink to return the results in the same order as the requests
            let result_map: HashMap<_, _> = responses
                .into_iter()
                .map(|response| (response.id, response.status))
                .collect();

            error_map.clear();
            // drain the emissions that were successfully written and keep
            // only the failed ones to send again
            emissions_to_send.retain(|emission| match result_map.get(&emission.id) {
                Some(ResponseStatusFromSink::Success) | None => false,
                Some(ResponseStatusFromSink::Failed(err_msg)) => {
                    *error_map.entry(err_msg.clone()).or_insert(0) += 1;
                    true
                }
            });

            if emissions_to_send.is_empty() {
                break;
            }

            warn!(
                "Retry attempt {} due to retryable error. Errors: {:?}",
                attempts, error_map
            );
            sleep(tokio::time::Duration::from_millis(
                config().sink_retry_interval_in_ms,
            ))
            .await;
        }

        if !emissions_to_send.is_empty() {
            return Err(Error::Sink(format!(
                "Failed to write {} emissions after {} attempts. Errors: {:?}",
                emissions_to_send.len(),
                attempts,
                error_map
            )));
        }

        forward_metrics()
            .sink_time
            .get_or_create(&self.common_labels)
            .observe(start_time.elapsed().as_micros() as f64);
        forward_metrics()
            .sink_write_total
            .get_or_create(&self.common_labels)
            .inc_by(emission_count);
        Ok(())
    }
}
