use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One completed speed-test sample.
///
/// `timestamp` marks when the test finished; `speed_mbps` is already
/// normalized to megabits per second by the probe. `test_time_seconds` is
/// carried through for the log and the raw query output but takes no part
/// in aggregation.
///
/// Wire keys match the historical log and chart consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(rename = "Date")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "SpeedMbps")]
    pub speed_mbps: f64,
    #[serde(rename = "TestTimeSeconds", skip_serializing_if = "Option::is_none")]
    pub test_time_seconds: Option<i64>,
}

impl Measurement {
    pub fn new(timestamp: DateTime<Utc>, speed_mbps: f64) -> Self {
        Self {
            timestamp,
            speed_mbps,
            test_time_seconds: None,
        }
    }

    pub fn with_test_time(mut self, seconds: i64) -> Self {
        self.test_time_seconds = Some(seconds);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Measurement {
        Measurement::new("2024-05-06T07:08:09Z".parse().expect("test timestamp"), 87.3)
    }

    #[test]
    fn serializes_with_wire_keys() {
        let value = serde_json::to_value(sample().with_test_time(12)).expect("serialize");
        assert_eq!(
            value,
            json!({
                "Date": "2024-05-06T07:08:09Z",
                "SpeedMbps": 87.3,
                "TestTimeSeconds": 12,
            })
        );
    }

    #[test]
    fn test_time_key_is_omitted_when_absent() {
        let value = serde_json::to_value(sample()).expect("serialize");
        assert_eq!(
            value,
            json!({
                "Date": "2024-05-06T07:08:09Z",
                "SpeedMbps": 87.3,
            })
        );
    }
}
