use std::sync::OnceLock;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Router, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::debug;

use crate::config::config;
use crate::error::Error;

// Define the labels for the metrics
const PIPELINE_NAME_LABEL: &str = "pipeline";
const REPLICA_LABEL: &str = "replica";

// Define the metrics
// Note: We do not add a suffix to the metric name, as the suffix is inferred through the metric type
// by the prometheus client library
// refer: https://github.com/prometheus/client_rust/blob/master/src/registry.rs#L102

// counters (please note the prefix _total, and read above link)
const READ_TOTAL: &str = "parkflow_read";
const EMITTED_TOTAL: &str = "parkflow_emitted";
const DROPPED_MALFORMED_TOTAL: &str = "parkflow_dropped_malformed";
const EVICTED_TOTAL: &str = "parkflow_evicted";
const SINK_WRITE_TOTAL: &str = "parkflow_sink_write";
const CHECKPOINT_TOTAL: &str = "parkflow_checkpoint";

// processing times as timers
const E2E_TIME: &str = "parkflow_processing_time";
const SINK_TIME: &str = "parkflow_sink_time";

/// The global register of all metrics.
#[derive(Default)]
pub(crate) struct GlobalRegistry {
    // It is okay to use std mutex because we register each metric only one time.
    pub(crate) registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::default()),
        }
    }
}

/// GLOBAL_REGISTER is the static global registry which is initialized
// only once.
static GLOBAL_REGISTER: OnceLock<GlobalRegistry> = OnceLock::new();

/// global_registry is a helper function to get the GLOBAL_REGISTER
fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTER.get_or_init(GlobalRegistry::new)
}

/// PipelineMetrics is a struct which is used for storing the metrics of the
/// change-detection pipeline.
// These fields are exposed as pub(crate) to be used by other modules for
// changing the value of the metrics.
// Each metric is defined as family of metrics, which means that they can be
// differentiated by their label values assigned.
// The labels are provided in the form of Vec<(String, String)>.
pub(crate) struct PipelineMetrics {
    // counters
    pub(crate) read_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) emitted_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) dropped_malformed_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) evicted_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) sink_write_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) checkpoint_total: Family<Vec<(String, String)>, Counter>,

    // timers
    pub(crate) e2e_time: Family<Vec<(String, String)>, Histogram>,
    pub(crate) sink_time: Family<Vec<(String, String)>, Histogram>,
}

impl PipelineMetrics {
    fn new() -> Self {
        let metrics = Self {
            read_total: Family::<Vec<(String, String)>, Counter>::default(),
            emitted_total: Family::<Vec<(String, String)>, Counter>::default(),
            dropped_malformed_total: Family::<Vec<(String, String)>, Counter>::default(),
            evicted_total: Family::<Vec<(String, String)>, Counter>::default(),
            sink_write_total: Family::<Vec<(String, String)>, Counter>::default(),
            checkpoint_total: Family::<Vec<(String, String)>, Counter>::default(),
            // timers
            e2e_time: Family::<Vec<(String, String)>, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(100.0, 10.0, 9))
            }),
            sink_time: Family::<Vec<(String, String)>, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(100.0, 10.0, 9))
            }),
        };

        let mut registry = global_registry().registry.lock();
        // Register all the metrics to the global registry
        registry.register(
            READ_TOTAL,
            "A Counter to keep track of the total number of readings read from the source",
            metrics.read_total.clone(),
        );
        registry.register(
            EMITTED_TOTAL,
            "A Counter to keep track of the total number of readings emitted as changes",
            metrics.emitted_total.clone(),
        );
        registry.register(
            DROPPED_MALFORMED_TOTAL,
            "A Counter to keep track of the total number of malformed readings dropped",
            metrics.dropped_malformed_total.clone(),
        );
        registry.register(
            EVICTED_TOTAL,
            "A Counter to keep track of the total number of stale keys evicted from the state store",
            metrics.evicted_total.clone(),
        );
        registry.register(
            SINK_WRITE_TOTAL,
            "A Counter to keep track of the total number of emissions written to the sink",
            metrics.sink_write_total.clone(),
        );
        registry.register(
            CHECKPOINT_TOTAL,
            "A Counter to keep track of the total number of checkpoints committed",
            metrics.checkpoint_total.clone(),
        );
        // timers
        registry.register(
            E2E_TIME,
            "A Histogram to keep track of the total time taken to process a batch, in microseconds",
            metrics.e2e_time.clone(),
        );
        registry.register(
            SINK_TIME,
            "A Histogram to keep track of the total time taken to write to the sink, in microseconds",
            metrics.sink_time.clone(),
        );
        metrics
    }
}

/// PIPELINE_METRICS is the PipelineMetrics object which stores the metrics
static PIPELINE_METRICS: OnceLock<PipelineMetrics> = OnceLock::new();

// forward_metrics is a helper function used to fetch the
// PipelineMetrics object
pub(crate) fn forward_metrics() -> &'static PipelineMetrics {
    PIPELINE_METRICS.get_or_init(PipelineMetrics::new)
}

/// PIPELINE_METRICS_LABELS are used to store the common labels used in the metrics
static PIPELINE_METRICS_LABELS: OnceLock<Vec<(String, String)>> = OnceLock::new();

// forward_metrics_labels is a helper function used to fetch the
// PIPELINE_METRICS_LABELS object
pub(crate) fn forward_metrics_labels() -> &'static Vec<(String, String)> {
    PIPELINE_METRICS_LABELS.get_or_init(|| {
        vec![
            (
                PIPELINE_NAME_LABEL.to_string(),
                config().pipeline_name.clone(),
            ),
            (REPLICA_LABEL.to_string(), config().replica.to_string()),
        ]
    })
}

// metrics_handler is used to generate and return a snapshot of the
// current state of the metrics in the global registry
async fn metrics_handler() -> impl IntoResponse {
    let state = global_registry().registry.lock();
    let mut buffer = String::new();
    match encode(&mut buffer, &state) {
        Ok(()) => {
            debug!("Exposing Metrics: {:?}", buffer);
            (StatusCode::OK, buffer).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Collect and emit prometheus metrics.
/// Metrics router and server over HTTP endpoint.
pub(crate) async fn start_metrics_http_server<A>(addr: A) -> crate::Result<()>
where
    A: ToSocketAddrs + std::fmt::Debug,
{
    let metrics_app = metrics_router();

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Metrics(format!("Creating listener on {:?}: {}", addr, e)))?;

    debug!("metrics server started at addr: {:?}", addr);

    axum::serve(listener, metrics_app)
        .await
        .map_err(|e| Error::Metrics(format!("Starting web server for metrics: {}", e)))?;
    Ok(())
}

/// router for metrics and health endpoints
fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}
