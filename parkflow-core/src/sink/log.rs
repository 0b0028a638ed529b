use tracing::{error, info};

use crate::message::Emission;
use crate::sink::{ResponseFromSink, ResponseStatusFromSink, Sink};

/// Writes each emission to the log as one JSON row, in the shape the
/// downstream `parking_data` table expects.
pub(crate) struct LogSink;

impl Sink for LogSink {
    async fn sink(&mut self, emissions: Vec<Emission>) -> crate::Result<Vec<ResponseFromSink>> {
        let mut responses = Vec::with_capacity(emissions.len());
        for emission in emissions {
            let status = match serde_json::to_string(&emission) {
                Ok(row) => {
                    info!(facility_id = %emission.facility_id, "{row}");
                    ResponseStatusFromSink::Success
                }
                Err(e) => {
                    error!(%e, facility_id = %emission.facility_id, "Failed to serialize row");
                    ResponseStatusFromSink::Failed(e.to_string())
                }
            };
            responses.push(ResponseFromSink {
                id: emission.id,
                status,
            });
        }
        Ok(responses)
    }
}
