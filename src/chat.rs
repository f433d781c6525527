use crate::entity::Role;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One conversation turn after normalisation. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub timestamp: Option<DateTime<Utc>>,
    pub author: String,
    pub role: Role,
    pub text: String,
}

/// A comment as it appears inside a prepared ticket payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawComment {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub internal_note: bool,
    #[serde(default)]
    pub index: usize,
}

/// A Jira issue flattened into the JSONL shape shared by `prepare`, `load` and `score`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreparedTicket {
    #[serde(default)]
    pub issue_key: String,
    #[serde(default)]
    pub user_summary: String,
    #[serde(default)]
    pub reporter: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub resolution: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub updated: String,
    #[serde(default)]
    pub due_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_csv: Option<String>,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub comments: Vec<RawComment>,
    #[serde(default)]
    pub merged_text: String,
    #[serde(default)]
    pub merge_context_size_tokens: usize,
}

impl PreparedTicket {
    pub fn custom_field(&self, name: &str) -> &str {
        self.custom_fields.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn contact_reason(&self) -> &str {
        self.custom_field("contact_reason").trim()
    }
}

/// Parse an ISO-8601-ish timestamp into UTC. Naive values are taken as UTC.
/// Anything unparseable yields `None` rather than an error.
pub fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    let text = value.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(parsed) = DateTime::parse_from_str(text, fmt) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Turn raw comments into an ordered conversation: by timestamp, then role name.
/// Comments without a timestamp sort first.
pub fn parse_comments(raw: &[RawComment]) -> Vec<Message> {
    let mut messages: Vec<Message> = raw
        .iter()
        .map(|comment| {
            let author = comment.author.clone().unwrap_or_default();
            Message {
                timestamp: comment.date.as_deref().and_then(parse_datetime),
                role: Role::resolve(&author, comment.role.as_deref()),
                author,
                text: comment.text.trim().to_string(),
            }
        })
        .collect();

    messages.sort_by_key(|m| (m.timestamp, m.role));
    messages
}

pub fn format_timestamp(value: Option<DateTime<Utc>>) -> String {
    value.map(|ts| ts.to_rfc3339()).unwrap_or_default()
}
