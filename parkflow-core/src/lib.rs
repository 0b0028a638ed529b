//! Change-detection pipeline for parking facility occupancy readings.
//!
//! The pipeline polls a source for batches of occupancy readings, keeps one
//! state entry per facility, and forwards only the readings that differ from
//! the last value it emitted for that facility. State and the id of the last
//! fully processed batch are checkpointed atomically after every batch, so a
//! restart resumes without re-emitting and without missing changes.

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::checkpoint::CheckpointManager;
use crate::config::config;
use crate::detect::ChangeDetector;
use crate::forwarder::ForwarderBuilder;
use crate::metrics::start_metrics_http_server;
use crate::sink::SinkHandle;
use crate::sink::log::LogSink;
use crate::source::SourceHandle;
use crate::source::lyon::{LyonAcker, LyonSource};
use crate::state::StateStoreHandle;

pub use self::error::{Error, Result};

pub mod error;

pub(crate) mod checkpoint;

pub(crate) mod config;

pub(crate) mod detect;

pub(crate) mod forwarder;

pub(crate) mod message;

pub(crate) mod sink;

pub(crate) mod source;

pub(crate) mod state;

mod metrics;

/// Wire up the pipeline against the Grand Lyon feed and the log sink, and run
/// it until the cancellation token fires. Returns only after the batch in
/// flight, if any, was fully processed.
pub async fn run(cln_token: CancellationToken) -> Result<()> {
    let config = config();

    // Start the metrics server in a separate background async spawn.
    // This should be running throughout the lifetime of the application,
    // hence the handle is not joined.
    let metrics_addr: SocketAddr = format!("0.0.0.0:{}", config.metrics_server_listen_port)
        .parse()
        .map_err(|e| Error::Metrics(format!("Invalid metrics address: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_http_server(metrics_addr).await {
            error!("Metrics server error: {:?}", e);
        }
    });

    let checkpoint = CheckpointManager::new(config.checkpoint_dir.clone()).await?;
    // the last committed id floors the source's batch ids, so a backwards
    // clock step can never reissue an id the forwarder would skip as already
    // committed
    let id_floor = checkpoint
        .restore()
        .await?
        .map(|(batch_id, _)| batch_id)
        .unwrap_or(0);

    let source = SourceHandle::new(
        LyonSource::new(&config.api_url, config.poll_interval, id_floor),
        LyonAcker,
    );
    let sink = SinkHandle::new(LogSink);
    let state = StateStoreHandle::new();
    let detector = ChangeDetector::new(
        state.clone(),
        chrono::Duration::seconds(config.state_ttl_secs),
    );

    let mut forwarder =
        ForwarderBuilder::new(source, sink, detector, state, checkpoint, cln_token).build();

    // the forwarder returns only on shutdown or on a fatal error
    forwarder.start().await?;

    info!("Forwarder stopped gracefully");
    Ok(())
}
