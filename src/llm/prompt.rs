use crate::chat::{format_timestamp, Message, PreparedTicket};
use crate::metrics::ConversationMetrics;
use crate::report::format_minutes;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

pub const MAX_SUMMARY_CHARS: usize = 250;
pub const MAX_IMPROVEMENT_TIP_CHARS: usize = 200;
pub const MAX_REASON_CHARS: usize = 600;
pub const MAX_STEPS: usize = 8;
pub const DEFAULT_TAXONOMY_HINTS: usize = 3;

pub const SENTIMENT_BUCKETS: &[&str] = &[
    "Delight",
    "Convenience",
    "Trust",
    "Frustration",
    "Disappointment",
    "Concern",
    "Hostility",
    "Neutral",
];

const SYSTEM_PROMPT: &str = "You are a meticulous quality assurance analyst who responds in JSON. \
Conversation transcript lines use 'A:' for agent and 'C:' for customer to optimise tokens.";

const TASKS: &str = r#"Review the conversation above and respond with a SINGLE JSON object that satisfies the schema below.

Tasks (complete all of them):
1. Compare the customer's stated problem with the original contact reason. If the original is "Duplicate", keep contact_reason="Duplicate" and contact_reason_change=false. Otherwise set contact_reason_change=true when your contact_reason differs and justify it in reason_override_why with phrases or timestamps from the transcript.
2. Decide whether the issue was resolved. Set resolved and is_resolved, and explain the evidence in resolution_why.
3. problem_extract: the concrete customer problem in one sentence (<=250 chars). resolution_extract: the outcome in under 15 words.
4. steps_extract: chronological agent actions that moved the ticket forward (max 8 short strings, earliest first).
5. resolution_timestamp_iso and resolution_message_index (1-based transcript index) for the decisive message; null for both when unresolved.
6. customer_sentiment_primary is one of: Delight, Convenience, Trust, Frustration, Disappointment, Concern, Hostility, Neutral. customer_sentiment_scores maps all eight labels to floats in [0, 1] summing to ~1.00.
7. llm_summary_250 (<=250 chars), conversation_rating, agent_score and customer_score (integers 1-5), improvement_tip (<=200 chars, actionable).
8. agent_profanity_detected / agent_profanity_count and customer_abuse_detected / customer_abuse_count: only explicit insults, slurs or profanity aimed at the other party or the company.

JSON keys: llm_summary_250, conversation_rating, extract_customer_probelm, problem_extract, resolution_extract, contact_reason, contact_reason_change, reason_override_why, agent_score, customer_score, resolved, is_resolved, resolution_why, steps_extract, resolution_timestamp_iso, resolution_message_index, customer_sentiment_primary, customer_sentiment_scores, agent_profanity_detected, agent_profanity_count, customer_abuse_detected, customer_abuse_count, improvement_tip."#;

/// Contact reason labels, optionally with keyword hints per label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Taxonomy {
    labels: Vec<String>,
    hints: BTreeMap<String, Vec<String>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TaxonomyFile {
    Labels(Vec<String>),
    WithHints(BTreeMap<String, Vec<String>>),
}

impl Taxonomy {
    pub fn new(labels: Vec<String>) -> Self {
        Self {
            labels,
            hints: BTreeMap::new(),
        }
    }

    pub fn with_hints(mut self, label: impl Into<String>, hints: Vec<String>) -> Self {
        self.hints.insert(label.into(), hints);
        self
    }

    /// Load from a JSON array of labels or an object of `label -> [keywords]`.
    /// A missing or malformed file yields an empty taxonomy.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        let body = match std::fs::read_to_string(path) {
            Ok(body) => body,
            Err(e) => {
                warn!("taxonomy file {} unreadable: {}", path.display(), e);
                return Self::default();
            }
        };
        match serde_json::from_str::<TaxonomyFile>(&body) {
            Ok(TaxonomyFile::Labels(labels)) => Self::new(labels),
            Ok(TaxonomyFile::WithHints(map)) => Self {
                labels: map.keys().cloned().collect(),
                hints: map,
            },
            Err(e) => {
                warn!("taxonomy file {} must be a JSON array or object: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn render(&self, hints_per_label: usize) -> String {
        if self.labels.is_empty() {
            return "None provided.".to_string();
        }
        self.labels
            .iter()
            .map(|label| {
                let mut unique: Vec<&str> = Vec::new();
                if hints_per_label > 0 {
                    for hint in self.hints.get(label).into_iter().flatten() {
                        if unique.len() == hints_per_label {
                            break;
                        }
                        if !unique.contains(&hint.as_str()) {
                            unique.push(hint);
                        }
                    }
                }
                if unique.is_empty() {
                    format!("- {label}")
                } else {
                    format!("- {label}: {}", unique.join(", "))
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub fn build_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .enumerate()
        .map(|(idx, message)| {
            let timestamp = message
                .timestamp
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            format!(
                "{:02}. {}: [{}] {}",
                idx + 1,
                message.role.short(),
                timestamp,
                message.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prompts {
    pub system: String,
    pub user: String,
}

pub fn build_prompts(
    ticket: &PreparedTicket,
    metrics: &ConversationMetrics,
    transcript: &str,
    taxonomy: &Taxonomy,
) -> Prompts {
    let original_reason = match ticket.contact_reason() {
        "" => "Not specified",
        reason => reason,
    };
    let or_unknown = |value: String| {
        if value.is_empty() {
            "unknown".to_string()
        } else {
            value
        }
    };

    let meta = format!(
        "Issue key: {key}\n\
         Status: {status}\n\
         Resolution: {resolution}\n\
         Conversation start (UTC): {start}\n\
         Conversation end (UTC): {end}\n\
         Total messages: {total}\n\
         Agent messages: {agent}\n\
         Customer messages: {customer}\n\
         Estimated duration (minutes): {duration}\n\
         Original contact reason: {original_reason}\n\
         Contact taxonomy:\n{taxonomy}\n\n\
         Transcript (A = agent, C = customer, U = unknown):\n{transcript}",
        key = ticket.issue_key,
        status = ticket.status,
        resolution = ticket.resolution,
        start = or_unknown(format_timestamp(metrics.conversation_start)),
        end = or_unknown(format_timestamp(metrics.conversation_end)),
        total = metrics.messages_total,
        agent = metrics.messages_agent,
        customer = metrics.messages_customer,
        duration = or_unknown(format_minutes(metrics.duration_minutes)),
        taxonomy = taxonomy.render(DEFAULT_TAXONOMY_HINTS),
    );

    Prompts {
        system: SYSTEM_PROMPT.to_string(),
        user: format!("{meta}\n\n{TASKS}"),
    }
}

pub fn model_supports_temperature(model: &str) -> bool {
    !model.to_lowercase().starts_with("gpt-5")
}

pub fn model_uses_responses_api(model: &str) -> bool {
    let name = model.to_lowercase();
    name.starts_with("gpt-5") || name.starts_with("gpt-4.1")
}

fn response_schema() -> Value {
    let sentiment_properties: serde_json::Map<String, Value> = SENTIMENT_BUCKETS
        .iter()
        .map(|label| {
            (
                label.to_string(),
                json!({"type": "number", "minimum": 0, "maximum": 1}),
            )
        })
        .collect();
    let nullable = |schema: Value| json!({"anyOf": [schema, {"type": "null"}]});

    let properties = json!({
        "llm_summary_250": {"type": "string", "maxLength": MAX_SUMMARY_CHARS},
        "conversation_rating": {"type": "integer", "minimum": 1, "maximum": 5},
        "extract_customer_probelm": {"type": "string", "maxLength": MAX_SUMMARY_CHARS},
        "problem_extract": {"type": "string", "maxLength": MAX_SUMMARY_CHARS},
        "resolution_extract": {"type": "string", "maxLength": MAX_SUMMARY_CHARS},
        "contact_reason": {"type": "string"},
        "contact_reason_change": {"type": "boolean"},
        "reason_override_why": {"type": "string", "maxLength": MAX_REASON_CHARS},
        "agent_score": {"type": "integer", "minimum": 1, "maximum": 5},
        "customer_score": {"type": "integer", "minimum": 1, "maximum": 5},
        "resolved": {"type": "boolean"},
        "is_resolved": {"type": "boolean"},
        "resolution_why": {"type": "string", "maxLength": MAX_REASON_CHARS},
        "steps_extract": {
            "type": "array",
            "items": {"type": "string", "maxLength": MAX_REASON_CHARS},
            "maxItems": MAX_STEPS
        },
        "resolution_timestamp_iso": nullable(json!({"type": "string", "format": "date-time"})),
        "resolution_message_index": nullable(json!({"type": "integer", "minimum": 1})),
        "customer_sentiment_primary": {"type": "string", "enum": SENTIMENT_BUCKETS},
        "customer_sentiment_scores": {
            "type": "object",
            "properties": sentiment_properties,
            "required": SENTIMENT_BUCKETS,
            "additionalProperties": false
        },
        "agent_profanity_detected": {"type": "boolean"},
        "agent_profanity_count": {"type": "integer", "minimum": 0},
        "customer_abuse_detected": {"type": "boolean"},
        "customer_abuse_count": {"type": "integer", "minimum": 0},
        "improvement_tip": {"type": "string", "maxLength": MAX_IMPROVEMENT_TIP_CHARS}
    });
    let required: Vec<String> = properties
        .as_object()
        .map(|props| props.keys().cloned().collect())
        .unwrap_or_default();

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}

/// Request body for either the Responses API or Chat Completions, picked by model name.
pub fn build_request_payload(
    model: &str,
    temperature: Option<f64>,
    max_output_tokens: u32,
    prompts: &Prompts,
) -> Value {
    if model_uses_responses_api(model) {
        let mut payload = json!({
            "model": model,
            "input": [
                {"role": "system", "content": [{"type": "input_text", "text": prompts.system}]},
                {"role": "user", "content": [{"type": "input_text", "text": prompts.user}]}
            ],
            "max_output_tokens": max_output_tokens,
            "text": {
                "format": {
                    "type": "json_schema",
                    "name": "conversation_quality_response",
                    "schema": response_schema(),
                    "strict": true
                }
            },
            "reasoning": {"effort": "low"}
        });
        if let Some(t) = temperature.filter(|_| model_supports_temperature(model)) {
            payload["temperature"] = json!(t);
        }
        return payload;
    }

    let mut payload = json!({
        "model": model,
        "messages": [
            {"role": "system", "content": prompts.system},
            {"role": "user", "content": prompts.user}
        ]
    });
    let limit_key = if model.to_lowercase().starts_with("gpt-5") {
        "max_completion_tokens"
    } else {
        "max_tokens"
    };
    payload[limit_key] = json!(max_output_tokens);
    if let Some(t) = temperature {
        payload["temperature"] = json!(t);
    }
    payload
}
