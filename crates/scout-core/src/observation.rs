//! # Observation Records
//!
//! One [`Observation`] is a single decoded scan report: which scanner saw
//! it, when, what the advertiser called itself, and how strong the signal
//! was. Once built it is immutable; the bridge treats it as an opaque JSON
//! object and never inspects the fields again.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A single decoded advertisement observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Identifier of the scanner that produced this observation.
    /// Becomes the last segment of the publish topic.
    pub scanner_thing_name: String,

    /// Observation time as fractional unix seconds.
    pub timestamp: f64,

    /// Human-readable UTC datetime for the same instant.
    #[serde(rename = "DATETIME")]
    pub datetime: String,

    /// Complete Local Name from the advertisement, if present.
    #[serde(rename = "COMPLETE_LOCAL_NAME", skip_serializing_if = "Option::is_none")]
    pub complete_local_name: Option<String>,

    /// Shortened Local Name from the advertisement, if present.
    #[serde(rename = "SHORT_LOCAL_NAME", skip_serializing_if = "Option::is_none")]
    pub short_local_name: Option<String>,

    /// Received signal strength in dBm.
    #[serde(rename = "RSSI")]
    pub rssi: f64,

    /// Advertiser address, if the radio reported one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Observation {
    /// Creates an observation stamped with the given instant.
    pub fn at(scanner_thing_name: impl Into<String>, when: DateTime<Utc>) -> Self {
        Observation {
            scanner_thing_name: scanner_thing_name.into(),
            timestamp: when.timestamp_millis() as f64 / 1000.0,
            datetime: when.to_rfc3339_opts(SecondsFormat::Secs, true),
            complete_local_name: None,
            short_local_name: None,
            rssi: 0.0,
            address: None,
        }
    }

    /// Creates an observation stamped with the current time.
    pub fn now(scanner_thing_name: impl Into<String>) -> Self {
        Self::at(scanner_thing_name, Utc::now())
    }

    /// Sets the local names decoded from the advertisement.
    pub fn with_names(
        mut self,
        complete: Option<String>,
        short: Option<String>,
    ) -> Self {
        self.complete_local_name = complete;
        self.short_local_name = short;
        self
    }

    /// Sets the received signal strength.
    pub fn with_rssi(mut self, rssi: f64) -> Self {
        self.rssi = rssi;
        self
    }

    /// Sets the advertiser address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_serializes_expected_field_names() {
        let when = Utc.with_ymd_and_hms(2024, 5, 4, 12, 30, 0).unwrap();
        let obs = Observation::at("scanner_sim_1", when)
            .with_names(Some("one_advertiser_name".into()), None)
            .with_rssi(-62.5);

        let json = serde_json::to_value(&obs).unwrap();
        assert_eq!(json["scanner_thing_name"], "scanner_sim_1");
        assert_eq!(json["COMPLETE_LOCAL_NAME"], "one_advertiser_name");
        assert_eq!(json["RSSI"], -62.5);
        assert_eq!(json["DATETIME"], "2024-05-04T12:30:00Z");
        // Absent optionals are omitted, not null.
        assert!(json.get("SHORT_LOCAL_NAME").is_none());
        assert!(json.get("address").is_none());
    }

    #[test]
    fn test_timestamp_matches_datetime() {
        let when = Utc.with_ymd_and_hms(2024, 5, 4, 12, 30, 0).unwrap();
        let obs = Observation::at("s1", when);
        assert_eq!(obs.timestamp, when.timestamp() as f64);
    }

    #[test]
    fn test_roundtrip() {
        let obs = Observation::now("s1").with_rssi(-70.0).with_address("aa:bb");
        let json = serde_json::to_string(&obs).unwrap();
        let back: Observation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, obs);
    }
}
