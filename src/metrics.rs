//! Response-time, volume and keyword signals for a single conversation.
//!
//! [`compute_metrics`] is a pure fold over an ordered message list: it never fails, never
//! touches shared state, and returns the same value for the same input.

use crate::chat::Message;
use crate::entity::Role;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::LazyLock;
use tracing::debug;

pub const PROFANITY_TERMS: &[&str] = &[
    "fuck", "shit", "damn", "hell", "bitch", "bastard", "asshole", "crap",
];

pub const INSULT_TERMS: &[&str] = &[
    "idiot",
    "stupid",
    "useless",
    "moron",
    "dumb",
    "terrible",
    "awful",
    "worthless",
    "incompetent",
    "hate",
];

pub const SLA_FAST_MINUTES: f64 = 5.0;
pub const SLA_STANDARD_MINUTES: f64 = 15.0;

/// Case-insensitive whole-word counter over a fixed term list.
#[derive(Debug, Clone)]
pub struct KeywordCounter {
    pattern: Option<Regex>,
}

impl KeywordCounter {
    pub fn new<'a>(terms: impl IntoIterator<Item = &'a str>) -> Self {
        let alternation = terms
            .into_iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join("|");
        if alternation.is_empty() {
            return Self { pattern: None };
        }
        // Escaped literals only, so the pattern always compiles.
        let pattern = Regex::new(&format!(r"(?i)\b(?:{alternation})\b")).ok();
        Self { pattern }
    }

    /// Every occurrence counts, not just presence.
    pub fn count(&self, text: &str) -> usize {
        self.pattern
            .as_ref()
            .map(|re| re.find_iter(text).count())
            .unwrap_or(0)
    }
}

/// The term lists used to flag agent profanity and customer abuse.
#[derive(Debug, Clone)]
pub struct Lexicon {
    pub agent_profanity: KeywordCounter,
    pub customer_abuse: KeywordCounter,
}

impl Default for Lexicon {
    fn default() -> Self {
        Self {
            agent_profanity: KeywordCounter::new(PROFANITY_TERMS.iter().copied()),
            customer_abuse: KeywordCounter::new(
                PROFANITY_TERMS.iter().chain(INSULT_TERMS).copied(),
            ),
        }
    }
}

static DEFAULT_LEXICON: LazyLock<Lexicon> = LazyLock::new(Lexicon::default);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversationMetrics {
    pub conversation_start: Option<DateTime<Utc>>,
    pub conversation_end: Option<DateTime<Utc>>,
    pub duration_minutes: Option<f64>,
    pub first_agent_response_minutes: Option<f64>,
    pub avg_agent_response_minutes: Option<f64>,
    pub avg_customer_response_minutes: Option<f64>,
    pub messages_total: usize,
    pub messages_agent: usize,
    pub messages_customer: usize,
    pub turns: usize,
    pub agent_authors: BTreeSet<String>,
    pub customer_authors: BTreeSet<String>,
    pub initial_response_sla_5m: Option<bool>,
    pub initial_response_sla_15m: Option<bool>,
    pub agent_profanity_count: usize,
    pub customer_abuse_count: usize,
}

pub fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 60_000.0
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

pub fn compute_metrics(messages: &[Message]) -> ConversationMetrics {
    compute_metrics_with(messages, &DEFAULT_LEXICON)
}

pub fn compute_metrics_with(messages: &[Message], lexicon: &Lexicon) -> ConversationMetrics {
    if messages.is_empty() {
        return ConversationMetrics::default();
    }

    let conversation_start = messages.iter().filter_map(|m| m.timestamp).min();
    let conversation_end = messages.iter().filter_map(|m| m.timestamp).max();
    let duration_minutes = match (conversation_start, conversation_end) {
        (Some(start), Some(end)) => Some(minutes_between(start, end)),
        _ => None,
    };

    let mut metrics = ConversationMetrics {
        conversation_start,
        conversation_end,
        duration_minutes,
        messages_total: messages.len(),
        ..Default::default()
    };

    let mut agent_deltas: Vec<f64> = Vec::new();
    let mut customer_deltas: Vec<f64> = Vec::new();
    // Earliest customer message in the current unanswered burst.
    let mut pending_customer: Option<DateTime<Utc>> = None;
    let mut last_agent: Option<DateTime<Utc>> = None;
    let mut last_turn_role: Option<Role> = None;

    for message in messages {
        match message.role {
            Role::Agent => {
                metrics.messages_agent += 1;
                if let (Some(pending), Some(ts)) = (pending_customer, message.timestamp) {
                    let delta = minutes_between(pending, ts);
                    if delta >= 0.0 {
                        agent_deltas.push(delta);
                        metrics.first_agent_response_minutes.get_or_insert(delta);
                    } else {
                        debug!(delta, author = %message.author, "skipping negative agent response delta");
                    }
                    pending_customer = None;
                }
                if message.timestamp.is_some() {
                    last_agent = message.timestamp;
                }
                metrics.agent_profanity_count += lexicon.agent_profanity.count(&message.text);
                if !message.author.is_empty() {
                    metrics.agent_authors.insert(message.author.clone());
                }
            }
            Role::Customer => {
                metrics.messages_customer += 1;
                if let (Some(agent_ts), Some(ts)) = (last_agent, message.timestamp) {
                    let delta = minutes_between(agent_ts, ts);
                    if delta >= 0.0 {
                        customer_deltas.push(delta);
                    } else {
                        debug!(delta, author = %message.author, "skipping negative customer response delta");
                    }
                }
                if pending_customer.is_none() {
                    pending_customer = message.timestamp;
                }
                metrics.customer_abuse_count += lexicon.customer_abuse.count(&message.text);
                if !message.author.is_empty() {
                    metrics.customer_authors.insert(message.author.clone());
                }
            }
            Role::Unknown => continue,
        }

        if last_turn_role.is_some_and(|previous| previous != message.role) {
            metrics.turns += 1;
        }
        last_turn_role = Some(message.role);
    }

    metrics.avg_agent_response_minutes = mean(&agent_deltas);
    metrics.avg_customer_response_minutes = mean(&customer_deltas);
    metrics.initial_response_sla_5m = metrics
        .first_agent_response_minutes
        .map(|first| first <= SLA_FAST_MINUTES);
    metrics.initial_response_sla_15m = metrics
        .first_agent_response_minutes
        .map(|first| first <= SLA_STANDARD_MINUTES);

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(minutes: f64) -> Option<DateTime<Utc>> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Some(start + Duration::milliseconds((minutes * 60_000.0) as i64))
    }

    fn msg(role: Role, minutes: Option<f64>, text: &str) -> Message {
        let author = match role {
            Role::Agent => "712020-agent",
            Role::Customer => "qm:customer",
            Role::Unknown => "bot",
        };
        Message {
            timestamp: minutes.and_then(at),
            author: author.to_string(),
            role,
            text: text.to_string(),
        }
    }

    #[test]
    fn empty_conversation_is_all_null_and_zero() {
        let metrics = compute_metrics(&[]);
        assert_eq!(metrics, ConversationMetrics::default());
        assert!(metrics.conversation_start.is_none());
        assert!(metrics.initial_response_sla_5m.is_none());
        assert!(metrics.agent_authors.is_empty());
        assert_eq!(metrics.turns, 0);
    }

    #[test]
    fn first_response_equals_average_for_single_exchange() {
        let messages = vec![
            msg(Role::Customer, Some(0.0), "help"),
            msg(Role::Agent, Some(2.0), "on it"),
        ];
        let metrics = compute_metrics(&messages);
        assert_eq!(metrics.first_agent_response_minutes, Some(2.0));
        assert_eq!(metrics.avg_agent_response_minutes, Some(2.0));
        assert_eq!(metrics.duration_minutes, Some(2.0));
        assert_eq!(metrics.turns, 1);
    }

    #[test]
    fn follow_ups_do_not_open_new_response_windows() {
        let messages = vec![
            msg(Role::Customer, Some(0.0), "Need help"),
            msg(Role::Agent, Some(2.0), "Sure"),
            msg(Role::Agent, Some(7.0), "Following up"),
            msg(Role::Customer, Some(10.0), "Still waiting"),
            msg(Role::Customer, Some(11.0), "Any update?"),
            msg(Role::Agent, Some(15.0), "Resolved"),
        ];
        let metrics = compute_metrics(&messages);
        assert_eq!(metrics.first_agent_response_minutes, Some(2.0));
        let avg = metrics.avg_agent_response_minutes.unwrap();
        assert!((avg - 3.5).abs() < 1e-9);
        // customer re-engagement is measured from the last agent message (t=7)
        let avg_customer = metrics.avg_customer_response_minutes.unwrap();
        assert!((avg_customer - 3.5).abs() < 1e-9);
        assert_eq!(metrics.messages_agent, 3);
        assert_eq!(metrics.messages_customer, 3);
    }

    #[test]
    fn turns_count_role_switches_only() {
        let roles = [
            Role::Customer,
            Role::Customer,
            Role::Agent,
            Role::Customer,
            Role::Agent,
        ];
        let messages: Vec<Message> = roles
            .iter()
            .enumerate()
            .map(|(i, role)| msg(*role, Some(i as f64), "x"))
            .collect();
        assert_eq!(compute_metrics(&messages).turns, 3);
    }

    #[test]
    fn unknown_messages_are_counted_but_not_timed() {
        let messages = vec![
            msg(Role::Customer, Some(0.0), "hello"),
            msg(Role::Unknown, Some(1.0), "automation"),
            msg(Role::Agent, Some(4.0), "hi"),
        ];
        let metrics = compute_metrics(&messages);
        assert_eq!(metrics.messages_total, 3);
        assert_eq!(metrics.first_agent_response_minutes, Some(4.0));
        assert_eq!(metrics.turns, 1);
    }

    #[test]
    fn sla_boundaries() {
        let on_time = compute_metrics(&[
            msg(Role::Customer, Some(0.0), "a"),
            msg(Role::Agent, Some(5.0), "b"),
        ]);
        assert_eq!(on_time.initial_response_sla_5m, Some(true));
        assert_eq!(on_time.initial_response_sla_15m, Some(true));

        let late = compute_metrics(&[
            msg(Role::Customer, Some(0.0), "a"),
            msg(Role::Agent, Some(5.01), "b"),
        ]);
        assert_eq!(late.initial_response_sla_5m, Some(false));
        assert_eq!(late.initial_response_sla_15m, Some(true));

        let unanswered = compute_metrics(&[msg(Role::Customer, Some(0.0), "a")]);
        assert_eq!(unanswered.initial_response_sla_5m, None);
        assert_eq!(unanswered.initial_response_sla_15m, None);
    }

    #[test]
    fn keyword_hits_count_every_occurrence() {
        let metrics = compute_metrics(&[
            msg(Role::Customer, Some(0.0), "Damn this, DAMN it. You idiot."),
            msg(Role::Agent, Some(1.0), "What the hell. Hello there, shell script."),
        ]);
        assert_eq!(metrics.customer_abuse_count, 3);
        assert_eq!(metrics.agent_profanity_count, 1);
    }

    #[test]
    fn insults_only_count_for_customers() {
        let metrics = compute_metrics(&[msg(Role::Agent, Some(0.0), "that was a stupid bug")]);
        assert_eq!(metrics.agent_profanity_count, 0);
    }

    #[test]
    fn missing_timestamps_still_count_messages() {
        let metrics = compute_metrics(&[
            msg(Role::Customer, None, "a"),
            msg(Role::Agent, None, "b"),
        ]);
        assert_eq!(metrics.messages_total, 2);
        assert!(metrics.conversation_start.is_none());
        assert!(metrics.duration_minutes.is_none());
        assert!(metrics.first_agent_response_minutes.is_none());
        assert_eq!(metrics.turns, 1);
    }

    #[test]
    fn negative_deltas_are_skipped() {
        // Out-of-order input: the agent answer predates the customer message.
        let metrics = compute_metrics(&[
            msg(Role::Customer, Some(10.0), "a"),
            msg(Role::Agent, Some(4.0), "b"),
            msg(Role::Customer, Some(2.0), "c"),
        ]);
        assert_eq!(metrics.first_agent_response_minutes, None);
        assert_eq!(metrics.avg_agent_response_minutes, None);
        assert_eq!(metrics.avg_customer_response_minutes, None);
    }

    #[test]
    fn authors_are_deduplicated_and_sorted() {
        let mut second = msg(Role::Agent, Some(2.0), "x");
        second.author = "712020-aaa".to_string();
        let metrics = compute_metrics(&[
            msg(Role::Customer, Some(0.0), "x"),
            msg(Role::Agent, Some(1.0), "x"),
            second,
            msg(Role::Agent, Some(3.0), "x"),
        ]);
        let authors: Vec<&str> = metrics.agent_authors.iter().map(String::as_str).collect();
        assert_eq!(authors, vec!["712020-aaa", "712020-agent"]);
    }

    #[test]
    fn computation_is_idempotent() {
        let messages = vec![
            msg(Role::Customer, Some(0.0), "damn"),
            msg(Role::Agent, Some(3.0), "ok"),
            msg(Role::Customer, Some(9.0), "thanks"),
        ];
        assert_eq!(compute_metrics(&messages), compute_metrics(&messages));
    }

    #[test]
    fn empty_term_list_never_matches() {
        let counter = KeywordCounter::new(Vec::<&str>::new());
        assert_eq!(counter.count("damn"), 0);
    }
}
