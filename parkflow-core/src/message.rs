//! Domain types that flow through the pipeline. A [RawReading] is whatever the
//! source handed us, a [Reading] has survived boundary validation, and an
//! [Emission] is a reading the detector judged to be new information, on its
//! way to the sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A reading as delivered by a source, before validation. Every field the
/// upstream payload could omit is optional here; coercion into the strict
/// [Reading] shape happens in one place so that malformed payloads never
/// propagate as implicit-null surprises downstream.
#[derive(Debug, Clone, Default)]
pub(crate) struct RawReading {
    pub(crate) facility_id: Option<String>,
    pub(crate) available_spaces: Option<i64>,
    pub(crate) closed: Option<bool>,
    pub(crate) observed_at: Option<DateTime<Utc>>,
}

/// One validated occupancy observation for one facility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Reading {
    pub(crate) facility_id: String,
    /// `None` means the facility did not report a count (unknown), which is a
    /// valid observation, distinct from zero.
    pub(crate) available_spaces: Option<u32>,
    pub(crate) closed: bool,
    pub(crate) observed_at: DateTime<Utc>,
}

impl Reading {
    /// The comparable fields of this reading. `observed_at` is deliberately
    /// excluded, otherwise every reading would trivially count as a change.
    pub(crate) fn value(&self) -> ReadingValue {
        ReadingValue {
            available_spaces: self.available_spaces,
            closed: self.closed,
        }
    }
}

impl TryFrom<RawReading> for Reading {
    type Error = Error;

    fn try_from(raw: RawReading) -> Result<Self, Self::Error> {
        let facility_id = match raw.facility_id {
            Some(id) if !id.is_empty() => id,
            _ => return Err(Error::Source("reading without a facility id".to_string())),
        };

        let available_spaces = match raw.available_spaces {
            Some(n) => Some(u32::try_from(n).map_err(|_| {
                Error::Source(format!(
                    "facility {facility_id} reported {n} available spaces"
                ))
            })?),
            None => None,
        };

        let observed_at = raw.observed_at.ok_or_else(|| {
            Error::Source(format!(
                "facility {facility_id} reading without a timestamp"
            ))
        })?;

        Ok(Reading {
            facility_id,
            available_spaces,
            // the feed omits the flag for open facilities
            closed: raw.closed.unwrap_or(false),
            observed_at,
        })
    }
}

/// Comparable fields of a reading; the per-key memory the detector keeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ReadingValue {
    pub(crate) available_spaces: Option<u32>,
    pub(crate) closed: bool,
}

/// A reading judged to represent a change. Immutable once produced, delivered
/// to the sink at-least-once. The serde names match the columns of the
/// `parking_data` table the downstream writer appends to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Emission {
    /// Identifies the emission within its batch; used to map per-record sink
    /// responses back to the records that need a retry.
    #[serde(skip)]
    pub(crate) id: String,
    #[serde(rename = "parking_id")]
    pub(crate) facility_id: String,
    #[serde(rename = "nb_of_available_parking_spaces")]
    pub(crate) available_spaces: Option<u32>,
    #[serde(rename = "ferme")]
    pub(crate) closed: bool,
    #[serde(rename = "date")]
    pub(crate) observed_at: DateTime<Utc>,
}

impl Emission {
    pub(crate) fn from_reading(batch_id: u64, seq: usize, reading: Reading) -> Self {
        Self {
            id: format!("{}-{}-{}", batch_id, reading.facility_id, seq),
            facility_id: reading.facility_id,
            available_spaces: reading.available_spaces,
            closed: reading.closed,
            observed_at: reading.observed_at,
        }
    }
}

/// One polling cycle's worth of readings. Ids increase monotonically across
/// process restarts so that a committed batch id is never reused.
#[derive(Debug, Clone, Default)]
pub(crate) struct Batch {
    pub(crate) id: u64,
    pub(crate) readings: Vec<RawReading>,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn raw(facility_id: &str, spaces: Option<i64>, closed: Option<bool>) -> RawReading {
        RawReading {
            facility_id: Some(facility_id.to_string()),
            available_spaces: spaces,
            closed,
            observed_at: Some(Utc.with_ymd_and_hms(2024, 11, 2, 10, 15, 0).unwrap()),
        }
    }

    #[test]
    fn test_valid_reading() {
        let reading = Reading::try_from(raw("P1", Some(10), Some(false))).unwrap();
        assert_eq!(reading.facility_id, "P1");
        assert_eq!(reading.available_spaces, Some(10));
        assert!(!reading.closed);
    }

    #[test]
    fn test_missing_facility_id_is_malformed() {
        let mut raw = raw("P1", Some(10), None);
        raw.facility_id = None;
        assert!(Reading::try_from(raw).is_err());

        let raw = RawReading {
            facility_id: Some(String::new()),
            observed_at: Some(Utc::now()),
            ..Default::default()
        };
        assert!(Reading::try_from(raw).is_err());
    }

    #[test]
    fn test_negative_spaces_is_malformed() {
        assert!(Reading::try_from(raw("P1", Some(-5), None)).is_err());
    }

    #[test]
    fn test_missing_timestamp_is_malformed() {
        let mut raw = raw("P1", Some(10), None);
        raw.observed_at = None;
        assert!(Reading::try_from(raw).is_err());
    }

    #[test]
    fn test_missing_closed_flag_defaults_to_open() {
        let reading = Reading::try_from(raw("P1", Some(10), None)).unwrap();
        assert!(!reading.closed);
    }

    #[test]
    fn test_missing_count_is_a_valid_unknown() {
        let reading = Reading::try_from(raw("P1", None, Some(true))).unwrap();
        assert_eq!(reading.available_spaces, None);
        assert!(reading.closed);
    }

    #[test]
    fn test_value_excludes_timestamp() {
        let a = Reading::try_from(raw("P1", Some(10), Some(false))).unwrap();
        let mut b = a.clone();
        b.observed_at = Utc.with_ymd_and_hms(2024, 11, 2, 10, 16, 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.value(), b.value());
    }

    #[test]
    fn test_emission_row_shape() {
        let reading = Reading::try_from(raw("P1", Some(10), Some(false))).unwrap();
        let emission = Emission::from_reading(42, 0, reading);
        assert_eq!(emission.id, "42-P1-0");

        let row = serde_json::to_string(&emission).unwrap();
        assert!(row.contains("\"parking_id\":\"P1\""));
        assert!(row.contains("\"nb_of_available_parking_spaces\":10"));
        assert!(row.contains("\"ferme\":false"));
        assert!(row.contains("\"date\""));
        // the in-batch id is transport metadata, not part of the row
        assert!(!row.contains("\"id\""));
    }
}
