use crate::config::{PriceSourceConfig, TimestampConfig};
use crate::error::PriceError;
use chrono::{DateTime, TimeZone, Utc};
use jsonpath_lib as jsonpath;
use serde::Serialize;
use serde_json::Value;

/// One price observation (c/kWh). Sign matters: zero or negative usually curtails.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceSample {
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

impl PriceSample {
    pub fn new(value: f64, observed_at: DateTime<Utc>) -> Self {
        Self { value, observed_at }
    }
}

/// States Home Assistant (and most bridges) publish for a sensor without a value.
const UNAVAILABLE_STATES: [&str; 4] = ["", "unavailable", "unknown", "none"];

/// Parse a price update published on the device's price topic.
///
/// Without `value_path` the payload is the bare number (statestream style).
/// With it, the payload is JSON and the path selects the price; a string
/// value holding a number is accepted too.
pub fn parse_price_sample(
    source: &PriceSourceConfig,
    payload: &[u8],
    now: DateTime<Utc>,
) -> Result<PriceSample, PriceError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| PriceError::NotNumeric("payload is not utf-8".into()))?
        .trim();
    if is_unavailable(text) {
        return Err(PriceError::Unavailable);
    }

    let Some(path) = &source.value_path else {
        let value = parse_number(text)?;
        return Ok(PriceSample::new(value, now));
    };

    let json: Value = serde_json::from_str(text)
        .map_err(|e| PriceError::NotNumeric(format!("invalid JSON: {e}")))?;
    let raw = first_jsonpath(path, &json).ok_or_else(|| PriceError::Missing(path.clone()))?;
    let value = match &raw {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| PriceError::NotNumeric(n.to_string()))?,
        Value::String(s) if is_unavailable(s.trim()) => return Err(PriceError::Unavailable),
        Value::String(s) => parse_number(s.trim())?,
        Value::Null => return Err(PriceError::Unavailable),
        other => return Err(PriceError::NotNumeric(other.to_string())),
    };

    let observed_at = extract_ts(&source.timestamp, &json)?.unwrap_or(now);
    Ok(PriceSample::new(value, observed_at))
}

fn is_unavailable(text: &str) -> bool {
    UNAVAILABLE_STATES
        .iter()
        .any(|s| text.eq_ignore_ascii_case(s))
}

fn parse_number(text: &str) -> Result<f64, PriceError> {
    match text.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(PriceError::NotNumeric(text.to_string())),
    }
}

fn extract_ts(tc: &TimestampConfig, json: &Value) -> Result<Option<DateTime<Utc>>, PriceError> {
    let Some(path) = &tc.path else {
        return Ok(None);
    };
    let Some(v) = first_jsonpath(path, json) else {
        return Ok(None);
    };
    let ts = match tc.format.as_str() {
        "rfc3339" => DateTime::parse_from_rfc3339(&stringify_json(&v))
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| PriceError::Timestamp(format!("rfc3339 parse: {}", e)))?,
        "unix_ms" => {
            let ms = v
                .as_i64()
                .ok_or_else(|| PriceError::Timestamp("unix_ms not i64".into()))?;
            Utc.timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| PriceError::Timestamp("unix_ms out of range".into()))?
        }
        "unix_s" => {
            let s = v
                .as_i64()
                .ok_or_else(|| PriceError::Timestamp("unix_s not i64".into()))?;
            Utc.timestamp_opt(s, 0)
                .single()
                .ok_or_else(|| PriceError::Timestamp("unix_s out of range".into()))?
        }
        "iso8601" => {
            let naive =
                chrono::NaiveDateTime::parse_from_str(&stringify_json(&v), "%Y-%m-%dT%H:%M:%S")
                    .map_err(|e| PriceError::Timestamp(format!("iso8601 parse: {}", e)))?;
            DateTime::from_naive_utc_and_offset(naive, Utc)
        }
        other => return Err(PriceError::Timestamp(format!("unknown ts format: {}", other))),
    };
    Ok(Some(ts))
}

fn first_jsonpath(path: &str, json: &Value) -> Option<Value> {
    jsonpath::select(json, path)
        .ok()
        .and_then(|v| v.into_iter().next().cloned())
}

fn stringify_json(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
