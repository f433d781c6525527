use crate::chat::{format_timestamp, parse_datetime, PreparedTicket};
use crate::llm::{QualityAssessment, TokenUsage};
use crate::metrics::{minutes_between, ConversationMetrics};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::warn;

/// A scored ticket: metrics always, the model's assessment when one was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredConversation {
    pub issue_key: String,
    pub status: String,
    pub resolution: String,
    pub hub: String,
    pub contact_reason_original: String,
    pub metrics: ConversationMetrics,
    pub assessment: Option<QualityAssessment>,
    pub model: String,
    pub usage: Option<TokenUsage>,
    pub cost_usd: Option<f64>,
}

impl ScoredConversation {
    pub fn new(ticket: &PreparedTicket, metrics: ConversationMetrics, model: &str) -> Self {
        Self {
            issue_key: ticket.issue_key.clone(),
            status: ticket.status.clone(),
            resolution: ticket.resolution.clone(),
            hub: ticket.custom_field("hub").to_string(),
            contact_reason_original: ticket.custom_field("contact_reason").to_string(),
            metrics,
            assessment: None,
            model: model.to_string(),
            usage: None,
            cost_usd: None,
        }
    }

    pub fn duration_to_resolution(&self) -> Option<f64> {
        duration_to_resolution(
            self.metrics.conversation_start,
            self.assessment
                .as_ref()
                .and_then(|a| a.resolution_timestamp_iso.as_deref()),
        )
    }

    pub fn to_row(&self) -> QualityRow {
        let m = &self.metrics;
        let a = self.assessment.clone().unwrap_or_default();
        let has_llm = self.assessment.is_some();
        let int = |v: Option<i64>| v.map(|n| n.to_string()).unwrap_or_default();
        let text = |v: Option<String>| v.unwrap_or_default();
        let problem = a.problem().unwrap_or_default().to_string();

        QualityRow {
            issue_key: self.issue_key.clone(),
            status: self.status.clone(),
            resolution: self.resolution.clone(),
            custom_field_hub: self.hub.clone(),
            conversation_start: format_timestamp(m.conversation_start),
            conversation_end: format_timestamp(m.conversation_end),
            duration_minutes: format_minutes(m.duration_minutes),
            duration_to_resolution: format_minutes(self.duration_to_resolution()),
            first_agent_response_minutes: format_minutes(m.first_agent_response_minutes),
            avg_agent_response_minutes: format_minutes(m.avg_agent_response_minutes),
            avg_customer_response_minutes: format_minutes(m.avg_customer_response_minutes),
            messages_total: m.messages_total,
            messages_agent: m.messages_agent,
            messages_customer: m.messages_customer,
            turns: m.turns,
            agent_authors: join_authors(m.agent_authors.iter()),
            customer_authors: join_authors(m.customer_authors.iter()),
            initial_response_sla_5m: format_bool(m.initial_response_sla_5m),
            initial_response_sla_15m: format_bool(m.initial_response_sla_15m),
            agent_profanity_detected: format_bool(Some(m.agent_profanity_count > 0)),
            agent_profanity_count: m.agent_profanity_count,
            customer_abuse_detected: format_bool(Some(m.customer_abuse_count > 0)),
            customer_abuse_count: m.customer_abuse_count,
            llm_summary_250: text(a.llm_summary_250),
            conversation_rating: int(a.conversation_rating),
            problem_extract: problem,
            resolution_extract: text(a.resolution_extract),
            steps_extract: serde_json::to_string(&a.steps_extract).unwrap_or_else(|_| "[]".into()),
            resolution_timestamp_iso: text(a.resolution_timestamp_iso),
            resolution_message_index: int(a.resolution_message_index),
            contact_reason: text(a.contact_reason),
            contact_reason_original: self.contact_reason_original.clone(),
            contact_reason_change: if has_llm {
                format_bool(Some(a.contact_reason_change.unwrap_or(false)))
            } else {
                String::new()
            },
            reason_override_why: text(a.reason_override_why),
            resolution_why: text(a.resolution_why),
            customer_sentiment_primary: text(a.customer_sentiment_primary),
            customer_sentiment_scores: if a.customer_sentiment_scores.is_empty() {
                String::new()
            } else {
                serde_json::to_string(&a.customer_sentiment_scores).unwrap_or_default()
            },
            llm_agent_profanity_detected: format_bool(a.agent_profanity_detected),
            llm_agent_profanity_count: int(a.agent_profanity_count),
            llm_customer_abuse_detected: format_bool(a.customer_abuse_detected),
            llm_customer_abuse_count: int(a.customer_abuse_count),
            agent_score: int(a.agent_score),
            customer_score: int(a.customer_score),
            resolved: format_bool(a.resolved),
            is_resolved: format_bool(a.is_resolved),
            improvement_tip: text(a.improvement_tip),
            llm_model: self.model.clone(),
            llm_input_tokens: self.usage.map(|u| u.prompt.to_string()).unwrap_or_default(),
            llm_output_tokens: self.usage.map(|u| u.completion.to_string()).unwrap_or_default(),
            llm_cost_usd: self.cost_usd.map(|c| format!("{c:.6}")).unwrap_or_default(),
        }
    }
}

/// One CSV line. Field order is the column order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityRow {
    pub issue_key: String,
    pub status: String,
    pub resolution: String,
    pub custom_field_hub: String,
    pub conversation_start: String,
    pub conversation_end: String,
    pub duration_minutes: String,
    pub duration_to_resolution: String,
    pub first_agent_response_minutes: String,
    pub avg_agent_response_minutes: String,
    pub avg_customer_response_minutes: String,
    pub messages_total: usize,
    pub messages_agent: usize,
    pub messages_customer: usize,
    pub turns: usize,
    pub agent_authors: String,
    pub customer_authors: String,
    pub initial_response_sla_5m: String,
    pub initial_response_sla_15m: String,
    pub agent_profanity_detected: String,
    pub agent_profanity_count: usize,
    pub customer_abuse_detected: String,
    pub customer_abuse_count: usize,
    pub llm_summary_250: String,
    pub conversation_rating: String,
    pub problem_extract: String,
    pub resolution_extract: String,
    pub steps_extract: String,
    pub resolution_timestamp_iso: String,
    pub resolution_message_index: String,
    pub contact_reason: String,
    pub contact_reason_original: String,
    pub contact_reason_change: String,
    pub reason_override_why: String,
    pub resolution_why: String,
    pub customer_sentiment_primary: String,
    pub customer_sentiment_scores: String,
    pub llm_agent_profanity_detected: String,
    pub llm_agent_profanity_count: String,
    pub llm_customer_abuse_detected: String,
    pub llm_customer_abuse_count: String,
    pub agent_score: String,
    pub customer_score: String,
    pub resolved: String,
    pub is_resolved: String,
    pub improvement_tip: String,
    pub llm_model: String,
    pub llm_input_tokens: String,
    pub llm_output_tokens: String,
    pub llm_cost_usd: String,
}

impl QualityRow {
    pub const COLUMNS: [&'static str; 50] = [
        "issue_key",
        "status",
        "resolution",
        "custom_field_hub",
        "conversation_start",
        "conversation_end",
        "duration_minutes",
        "duration_to_resolution",
        "first_agent_response_minutes",
        "avg_agent_response_minutes",
        "avg_customer_response_minutes",
        "messages_total",
        "messages_agent",
        "messages_customer",
        "turns",
        "agent_authors",
        "customer_authors",
        "initial_response_sla_5m",
        "initial_response_sla_15m",
        "agent_profanity_detected",
        "agent_profanity_count",
        "customer_abuse_detected",
        "customer_abuse_count",
        "llm_summary_250",
        "conversation_rating",
        "problem_extract",
        "resolution_extract",
        "steps_extract",
        "resolution_timestamp_iso",
        "resolution_message_index",
        "contact_reason",
        "contact_reason_original",
        "contact_reason_change",
        "reason_override_why",
        "resolution_why",
        "customer_sentiment_primary",
        "customer_sentiment_scores",
        "llm_agent_profanity_detected",
        "llm_agent_profanity_count",
        "llm_customer_abuse_detected",
        "llm_customer_abuse_count",
        "agent_score",
        "customer_score",
        "resolved",
        "is_resolved",
        "improvement_tip",
        "llm_model",
        "llm_input_tokens",
        "llm_output_tokens",
        "llm_cost_usd",
    ];
}

pub fn format_minutes(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.2}")).unwrap_or_default()
}

pub fn format_bool(value: Option<bool>) -> String {
    value.map(|b| b.to_string()).unwrap_or_default()
}

fn join_authors<'a>(authors: impl Iterator<Item = &'a String>) -> String {
    authors.map(String::as_str).collect::<Vec<_>>().join(";")
}

/// Minutes from conversation start to the reported resolution, if both parse and the
/// resolution does not precede the start.
pub fn duration_to_resolution(
    start: Option<DateTime<Utc>>,
    resolution_iso: Option<&str>,
) -> Option<f64> {
    let start = start?;
    let resolved = parse_datetime(resolution_iso?)?;
    let minutes = minutes_between(start, resolved);
    (minutes >= 0.0).then_some(minutes)
}

/// Append-only CSV output with one flush per row.
pub struct CsvSink {
    writer: csv::Writer<File>,
    path: PathBuf,
}

impl CsvSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let is_new = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if is_new {
            writer.write_record(QualityRow::COLUMNS)?;
            writer.flush()?;
        }
        Ok(Self {
            writer,
            path: path.to_path_buf(),
        })
    }

    pub fn append(&mut self, row: &QualityRow) -> Result<()> {
        self.writer
            .serialize(row)
            .with_context(|| format!("Failed to write row for {}", row.issue_key))?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Issue keys already present in an output CSV. Read problems are logged and yield what was read.
pub fn existing_issue_keys(path: &Path) -> HashSet<String> {
    let mut keys = HashSet::new();
    if !path.exists() {
        return keys;
    }
    let mut reader = match csv::Reader::from_path(path) {
        Ok(reader) => reader,
        Err(e) => {
            warn!("failed to read {} for resume: {}", path.display(), e);
            return keys;
        }
    };
    let column = match reader.headers() {
        Ok(headers) => headers.iter().position(|h| h == "issue_key"),
        Err(e) => {
            warn!("failed to read header of {}: {}", path.display(), e);
            None
        }
    };
    let Some(column) = column else {
        return keys;
    };
    for record in reader.records() {
        match record {
            Ok(record) => {
                if let Some(key) = record.get(column).map(str::trim).filter(|k| !k.is_empty()) {
                    keys.insert(key.to_string());
                }
            }
            Err(e) => {
                warn!("stopped reading {} for resume: {}", path.display(), e);
                break;
            }
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::parse_comments;
    use crate::chat::RawComment;
    use crate::metrics::compute_metrics;
    use chrono::TimeZone;

    fn scored() -> ScoredConversation {
        let mut ticket = PreparedTicket {
            issue_key: "SUP-7".into(),
            status: "Done".into(),
            resolution: "Fixed".into(),
            ..Default::default()
        };
        ticket.custom_fields.insert("hub".into(), "Leeds".into());
        ticket.custom_fields.insert("contact_reason".into(), "Dock".into());
        ticket.comments = vec![
            RawComment {
                date: Some("2024-03-01T10:00:00Z".into()),
                author: Some("qm:1".into()),
                text: "help".into(),
                ..Default::default()
            },
            RawComment {
                date: Some("2024-03-01T10:04:30Z".into()),
                author: Some("712020-bo".into()),
                text: "on it".into(),
                ..Default::default()
            },
        ];
        let metrics = compute_metrics(&parse_comments(&ticket.comments));
        ScoredConversation::new(&ticket, metrics, "gpt-5-nano")
    }

    #[test]
    fn metrics_only_row() {
        let row = scored().to_row();
        assert_eq!(row.issue_key, "SUP-7");
        assert_eq!(row.custom_field_hub, "Leeds");
        assert_eq!(row.first_agent_response_minutes, "4.50");
        assert_eq!(row.initial_response_sla_5m, "true");
        assert_eq!(row.agent_profanity_detected, "false");
        assert_eq!(row.agent_authors, "712020-bo");
        assert_eq!(row.steps_extract, "[]");
        assert_eq!(row.contact_reason_change, "");
        assert_eq!(row.contact_reason_original, "Dock");
        assert_eq!(row.llm_cost_usd, "");
        assert_eq!(row.llm_model, "gpt-5-nano");
    }

    #[test]
    fn assessment_fields_flow_into_row() {
        let mut scored = scored();
        scored.assessment = Some(QualityAssessment {
            conversation_rating: Some(4),
            extract_customer_probelm: Some("Dock stuck".into()),
            steps_extract: vec!["restarted dock".into()],
            resolution_timestamp_iso: Some("2024-03-01T10:30:00Z".into()),
            resolved: Some(true),
            ..Default::default()
        });
        scored.usage = Some(TokenUsage {
            prompt: 1200,
            completion: 300,
            ..Default::default()
        });
        scored.cost_usd = Some(0.000181);
        let row = scored.to_row();
        assert_eq!(row.conversation_rating, "4");
        assert_eq!(row.problem_extract, "Dock stuck");
        assert_eq!(row.steps_extract, "[\"restarted dock\"]");
        assert_eq!(row.duration_to_resolution, "30.00");
        assert_eq!(row.contact_reason_change, "false");
        assert_eq!(row.resolved, "true");
        assert_eq!(row.is_resolved, "");
        assert_eq!(row.llm_input_tokens, "1200");
        assert_eq!(row.llm_cost_usd, "0.000181");
    }

    #[test]
    fn resolution_before_start_is_dropped() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(duration_to_resolution(Some(start), Some("2024-03-01T09:00:00Z")), None);
        assert_eq!(duration_to_resolution(Some(start), Some("not a time")), None);
        assert_eq!(duration_to_resolution(None, Some("2024-03-01T11:00:00Z")), None);
        assert_eq!(duration_to_resolution(Some(start), Some("2024-03-01T10:00:00Z")), Some(0.0));
    }

    #[test]
    fn columns_match_serialised_header() {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.serialize(QualityRow::default()).unwrap();
        let out = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let header = out.lines().next().unwrap();
        assert_eq!(header, QualityRow::COLUMNS.join(","));
    }

    #[test]
    fn sink_writes_header_once_and_supports_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.csv");

        let mut sink = CsvSink::open(&path).unwrap();
        sink.append(&scored().to_row()).unwrap();
        drop(sink);

        let mut sink = CsvSink::open(&path).unwrap();
        let mut second = scored().to_row();
        second.issue_key = "SUP-8".into();
        sink.append(&second).unwrap();
        drop(sink);

        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body.matches("issue_key,status").count(), 1);
        assert_eq!(body.lines().count(), 3);

        let keys = existing_issue_keys(&path);
        assert!(keys.contains("SUP-7") && keys.contains("SUP-8"));
        assert!(existing_issue_keys(&dir.path().join("missing.csv")).is_empty());
    }
}
