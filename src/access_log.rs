//! Access log records aggregated by host and annotated with an anomaly score.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Aggregated access statistics of one host.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessSummary {
    pub key: String,
    pub count: u64,
    pub size_sum: u64,
    /// response time sum in microseconds
    pub time_sum: u64,
    pub recorded_time: Option<String>,
    pub anomaly_score: f64,
}

impl AccessSummary {
    /// The neutral element of `combine`.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Adds up two summaries. The first non empty key and the first recorded time are kept,
    /// along with the highest anomaly score.
    pub fn combine(self, other: &AccessSummary) -> Self {
        let key = if self.key.is_empty() {
            other.key.clone()
        } else {
            self.key
        };
        Self {
            key,
            count: self.count + other.count,
            size_sum: self.size_sum + other.size_sum,
            time_sum: self.time_sum + other.time_sum,
            recorded_time: self.recorded_time.or_else(|| other.recorded_time.clone()),
            anomaly_score: self.anomaly_score.max(other.anomaly_score),
        }
    }

    /// Mean response time, `0` for an empty summary.
    pub fn average_time(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.time_sum / self.count
        }
    }

    /// Parses an access log line, a JSON object with `hostname`, `size`, `reqtime_microsec`
    /// and `time` fields.
    ///
    /// Missing numbers and `-` count as zero.
    pub fn parse(line: &str) -> Result<Self> {
        let fields: Map<String, Value> =
            serde_json::from_str(line).map_err(|e| Error::parse(line, e))?;
        let key = fields
            .get("hostname")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            key,
            count: 1,
            size_sum: parse_count(line, fields.get("size"))?,
            time_sum: parse_count(line, fields.get("reqtime_microsec"))?,
            recorded_time: fields.get("time").and_then(Value::as_str).map(String::from),
            anomaly_score: 0.,
        })
    }
}

fn parse_count(line: &str, value: Option<&Value>) -> Result<u64> {
    match value {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| Error::parse(line, format!("{} is not a count", n))),
        Some(Value::String(s)) if s.trim() == "-" => Ok(0),
        Some(Value::String(s)) => s.trim().parse().map_err(|e| Error::parse(line, e)),
        Some(other) => Err(Error::parse(line, format!("{} is not a count", other))),
    }
}

#[cfg(test)]
mod tests {
    use crate::access_log::*;

    #[test]
    fn test_parse() {
        let line = concat!(
            r#"{"hostname":"10.0.0.1","size":"512","reqtime_microsec":1200,"#,
            r#""time":"2014-01-01T00:00:000+0900"}"#
        );
        let summary = AccessSummary::parse(line).unwrap();
        assert_eq!("10.0.0.1", summary.key);
        assert_eq!(1, summary.count);
        assert_eq!(512, summary.size_sum);
        assert_eq!(1200, summary.time_sum);
        assert_eq!(Some("2014-01-01T00:00:000+0900".to_string()), summary.recorded_time);
    }

    #[test]
    fn test_parse_dash_and_missing() {
        let summary = AccessSummary::parse(r#"{"hostname":"h","size":"-"}"#).unwrap();
        assert_eq!(0, summary.size_sum);
        assert_eq!(0, summary.time_sum);
        assert_eq!(None, summary.recorded_time);
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            AccessSummary::parse("not json"),
            Err(Error::Parse { .. })
        ));
        assert!(matches!(
            AccessSummary::parse(r#"{"hostname":"h","size":"big"}"#),
            Err(Error::Parse { .. })
        ));
    }

    #[test]
    fn test_combine() {
        let a = AccessSummary {
            key: "".into(),
            count: 1,
            size_sum: 10,
            time_sum: 100,
            recorded_time: None,
            anomaly_score: 2.,
        };
        let b = AccessSummary {
            key: "h".into(),
            count: 2,
            size_sum: 5,
            time_sum: 300,
            recorded_time: Some("t".into()),
            anomaly_score: 1.,
        };
        let c = AccessSummary::zero().combine(&a).combine(&b);
        assert_eq!("h", c.key);
        assert_eq!(3, c.count);
        assert_eq!(15, c.size_sum);
        assert_eq!(400, c.time_sum);
        assert_eq!(Some("t".to_string()), c.recorded_time);
        assert_eq!(2., c.anomaly_score);
        assert_eq!(133, c.average_time());
        assert_eq!(0, AccessSummary::zero().average_time());
    }

    #[test]
    fn test_serialize_anomaly_score() {
        let json = serde_json::to_string(&AccessSummary::zero()).unwrap();
        assert!(json.contains(r#""anomalyScore":0.0"#));
    }
}
