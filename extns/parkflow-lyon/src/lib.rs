//! Client for the Grand Lyon real-time parking availability feed.
//!
//! The feed is a single JSON document listing every facility operated by LPA,
//! refreshed server-side roughly once a minute. Field names are namespaced
//! (`Parking_schema:identifier`, `mv:currentValue`, ...) and most of them are
//! optional in practice, so [ParkingRecord] keeps everything loose; validation
//! into a strict reading shape happens downstream.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

/// Public URL of the real-time feed.
pub const DEFAULT_FEED_URL: &str =
    "https://download.data.grandlyon.com/files/rdata/lpa_mobilite.donnees/parking_temps_reel.json";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("HTTP error - {0}")]
    Http(String),

    #[error("Decode error - {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One facility entry as published by the feed.
#[derive(Debug, Clone, Deserialize)]
pub struct ParkingRecord {
    /// Stable facility identifier.
    #[serde(rename = "Parking_schema:identifier")]
    pub identifier: Option<String>,
    /// Human readable facility name. Unused downstream, the identifier
    /// suffices.
    #[serde(rename = "Parking_schema:name")]
    pub name: Option<String>,
    /// Number of free spaces at `date`.
    #[serde(rename = "mv:currentValue")]
    pub available_spaces: Option<i64>,
    /// Whether the facility reports as closed. Omitted for open facilities.
    #[serde(rename = "ferme")]
    pub closed: Option<bool>,
    /// Server-side observation timestamp.
    #[serde(rename = "dct:date")]
    pub date: Option<DateTime<Utc>>,
}

/// Thin wrapper over the feed endpoint. Cheap to clone.
#[derive(Clone)]
pub struct LyonApiClient {
    client: reqwest::Client,
    url: String,
}

impl LyonApiClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// Fetch the current snapshot, one record per facility.
    pub async fn fetch(&self) -> Result<Vec<ParkingRecord>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Http(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }

        let records: Vec<ParkingRecord> = response
            .json()
            .await
            .map_err(|e| Error::Decode(e.to_string()))?;

        debug!(count = records.len(), "Fetched parking snapshot");
        Ok(records)
    }
}
