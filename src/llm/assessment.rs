use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// What the model said about a conversation. Every field is optional and taken as-is;
/// values of the wrong shape become empty rather than failing the whole reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    #[serde(default, deserialize_with = "lenient_string")]
    pub llm_summary_250: Option<String>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub conversation_rating: Option<i64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub problem_extract: Option<String>,
    /// Misspelt key kept by the response schema; read when `problem_extract` is empty.
    #[serde(default, deserialize_with = "lenient_string", skip_serializing)]
    pub extract_customer_probelm: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub resolution_extract: Option<String>,
    #[serde(default, deserialize_with = "lenient_steps")]
    pub steps_extract: Vec<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub resolution_timestamp_iso: Option<String>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub resolution_message_index: Option<i64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub contact_reason: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub contact_reason_change: Option<bool>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub reason_override_why: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub resolution_why: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub customer_sentiment_primary: Option<String>,
    #[serde(default, deserialize_with = "lenient_scores")]
    pub customer_sentiment_scores: BTreeMap<String, f64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub agent_score: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub customer_score: Option<i64>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub resolved: Option<bool>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_resolved: Option<bool>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub improvement_tip: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub agent_profanity_detected: Option<bool>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub agent_profanity_count: Option<i64>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub customer_abuse_detected: Option<bool>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub customer_abuse_count: Option<i64>,
}

impl QualityAssessment {
    pub fn from_object(object: Map<String, Value>) -> Self {
        // Every field tolerates any JSON value, so only a non-object could fail here.
        serde_json::from_value(Value::Object(object)).unwrap_or_default()
    }

    pub fn problem(&self) -> Option<&str> {
        self.problem_extract
            .as_deref()
            .filter(|text| !text.is_empty())
            .or(self.extract_customer_probelm.as_deref())
    }
}

fn as_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(as_string(Value::deserialize(d)?))
}

fn lenient_int<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let value = Value::deserialize(d)?;
    if let Some(n) = value.as_i64() {
        return Ok(Some(n));
    }
    Ok(as_f64(&value).filter(|f| f.is_finite()).map(|f| f.round() as i64))
}

fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Bool(b) => Some(b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    })
}

fn lenient_steps<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(as_string)
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) => match serde_json::from_str::<Vec<String>>(&s) {
            Ok(steps) => steps,
            Err(_) if s.trim().is_empty() => Vec::new(),
            Err(_) => vec![s.trim().to_string()],
        },
        _ => Vec::new(),
    })
}

fn lenient_scores<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<String, f64>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Object(map) => map
            .into_iter()
            .filter_map(|(label, score)| as_f64(&score).map(|s| (label, s)))
            .collect(),
        _ => BTreeMap::new(),
    })
}
