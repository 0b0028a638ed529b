use std::env;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::Error;

const ENV_API_URL: &str = "PARKFLOW_API_URL";
const ENV_PIPELINE_NAME: &str = "PARKFLOW_PIPELINE_NAME";
const ENV_POD_REPLICA: &str = "PARKFLOW_REPLICA";
const ENV_POLL_INTERVAL_SECS: &str = "PARKFLOW_POLL_INTERVAL_SECS";
const ENV_STATE_TTL_SECS: &str = "PARKFLOW_STATE_TTL_SECS";
const ENV_CHECKPOINT_DIR: &str = "PARKFLOW_CHECKPOINT_DIR";
const ENV_SINK_MAX_RETRY_ATTEMPTS: &str = "PARKFLOW_SINK_MAX_RETRY_ATTEMPTS";
const ENV_SINK_RETRY_INTERVAL_IN_MS: &str = "PARKFLOW_SINK_RETRY_INTERVAL_MS";
const ENV_METRICS_PORT: &str = "PARKFLOW_METRICS_PORT";

const DEFAULT_PIPELINE_NAME: &str = "parkflow";
// The feed refreshes server-side about once a minute; polling faster only
// re-reads the same snapshot.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_STATE_TTL_SECS: i64 = 24 * 60 * 60;
const DEFAULT_CHECKPOINT_DIR: &str = "/var/run/parkflow/checkpoints";
const DEFAULT_MAX_SINK_RETRY_ATTEMPTS: u16 = 10;
const DEFAULT_SINK_RETRY_INTERVAL_IN_MS: u64 = 500;
const DEFAULT_METRICS_PORT: u16 = 2469;

pub(crate) fn config() -> &'static Settings {
    static CONF: OnceLock<Settings> = OnceLock::new();
    CONF.get_or_init(|| match Settings::load() {
        Ok(v) => v,
        Err(e) => {
            panic!("Failed to load configuration: {:?}", e);
        }
    })
}

pub(crate) struct Settings {
    pub(crate) pipeline_name: String,
    pub(crate) replica: u32,
    pub(crate) api_url: String,
    pub(crate) poll_interval: Duration,
    /// Inactivity window (seconds) after which a facility's state entry is
    /// evicted; its next reading is then treated as first-seen again.
    pub(crate) state_ttl_secs: i64,
    pub(crate) checkpoint_dir: String,
    pub(crate) sink_max_retry_attempts: u16,
    pub(crate) sink_retry_interval_in_ms: u64,
    pub(crate) metrics_server_listen_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pipeline_name: DEFAULT_PIPELINE_NAME.to_string(),
            replica: 0,
            api_url: parkflow_lyon::DEFAULT_FEED_URL.to_string(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            state_ttl_secs: DEFAULT_STATE_TTL_SECS,
            checkpoint_dir: DEFAULT_CHECKPOINT_DIR.to_string(),
            sink_max_retry_attempts: DEFAULT_MAX_SINK_RETRY_ATTEMPTS,
            sink_retry_interval_in_ms: DEFAULT_SINK_RETRY_INTERVAL_IN_MS,
            metrics_server_listen_port: DEFAULT_METRICS_PORT,
        }
    }
}

impl Settings {
    fn load() -> Result<Self, Error> {
        let mut settings = Settings::default();

        if let Ok(name) = env::var(ENV_PIPELINE_NAME) {
            settings.pipeline_name = name;
        }
        if let Ok(url) = env::var(ENV_API_URL) {
            settings.api_url = url;
        }
        if let Ok(dir) = env::var(ENV_CHECKPOINT_DIR) {
            settings.checkpoint_dir = dir;
        }

        settings.replica = parse_env(ENV_POD_REPLICA)?.unwrap_or(0);
        settings.poll_interval = Duration::from_secs(
            parse_env(ENV_POLL_INTERVAL_SECS)?.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
        );
        settings.state_ttl_secs = parse_env(ENV_STATE_TTL_SECS)?.unwrap_or(DEFAULT_STATE_TTL_SECS);
        settings.sink_max_retry_attempts =
            parse_env(ENV_SINK_MAX_RETRY_ATTEMPTS)?.unwrap_or(DEFAULT_MAX_SINK_RETRY_ATTEMPTS);
        settings.sink_retry_interval_in_ms =
            parse_env(ENV_SINK_RETRY_INTERVAL_IN_MS)?.unwrap_or(DEFAULT_SINK_RETRY_INTERVAL_IN_MS);
        settings.metrics_server_listen_port =
            parse_env(ENV_METRICS_PORT)?.unwrap_or(DEFAULT_METRICS_PORT);

        if settings.state_ttl_secs <= 0 {
            return Err(Error::Config(format!(
                "{} must be positive, got {}",
                ENV_STATE_TTL_SECS, settings.state_ttl_secs
            )));
        }

        Ok(settings)
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>, Error>
where
    T: FromStr,
    T::Err: std::fmt::Debug,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {:?}", name, e))),
        Err(_) => Ok(None),
    }
}
