//! Improvement-tip grouping: cluster recent coaching notes into ranked themes with one LLM call.

use crate::llm::extract::extract_json;
use crate::llm::prompt::{model_supports_temperature, model_uses_responses_api, Prompts};
use crate::llm::{LlmClient, TokenUsage};
use crate::store::Store;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use tracing::{info, warn};

pub const DEFAULT_GROUPING_MODEL: &str = "gpt-5-mini";
pub const DEFAULT_GROUPING_MAX_TOKENS: u32 = 6000;
pub const DEFAULT_WINDOW_HOURS: f64 = 24.0;

const GROUPING_TEMPERATURE: f64 = 1.0;

const GROUPING_SYSTEM_PROMPT: &str = "You are an e-bike rental customer support team leader. \
Produce themes from coaching notes to your agents. \
Rules: follow the provided JSON schema exactly; preserve all key_ids and never invent ids; \
output only the JSON object (no markdown, no commentary).";

const GROUPING_RULES: &str = r#"Grouping rules:
- Create as many groups as needed; minimum count of 5.
- Combine closely related notes; minimize overlap. Each note must be assigned to exactly one group OR to ungrouped_key_ids.
- If a note fits multiple groups, assign it to the single best-fitting group.

Scoring and ranking:
- For each group compute:
  - group_size = number of notes in group (occurrence proxy)
  - actionability_score (1-5; 5 = easiest to fix via training/process/product)
  - severity_score (1-5; 5 = highest customer/ops/compliance impact)
  - overall_score = round(50*(group_size/max_group_size) + 30*(actionability_score/5) + 20*(severity_score/5))
  - max_group_size = size of the largest group you produce (use 1 if only one item).
- Rank groups descending by overall_score (tie-breaker: larger group_size)."#;

const GROUPING_GUIDANCE: &str = r#"Tip and description:
- tip must be 1 sentence and <=150 chars when possible.
- description must summarize the common pattern across grouped notes in 1-3 sentences.

Ungrouped:
- Put one-off notes that do not reasonably cluster into ungrouped_key_ids (manager review queue). Do not drop anything.

Next steps for manager training (per group):
- training_cue: single directive for Tier-1 agents (imperative: "Always...", "Never...", "If X then Y...").
- success_signals: one or two simple observable indicators the cue is being followed.

Keep the JSON concise: aim for <=8 groups, exactly one next_steps entry per group, and <=2 success_signals per group. Keep total output under ~1200 tokens."#;

#[derive(Debug, Clone, PartialEq)]
pub struct ImprovementTip {
    pub issue_key: String,
    pub text: String,
    pub conversation_start: DateTime<Utc>,
}

/// Inclusive time window over conversation start times.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TipWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TipWindow {
    pub fn ending_at(end: DateTime<Utc>, hours: f64) -> Result<Self> {
        if !(hours > 0.0) {
            bail!("window hours must be positive, got {hours}");
        }
        let span = Duration::milliseconds((hours * 3_600_000.0).round() as i64);
        Ok(Self {
            start: end - span,
            end,
        })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

impl fmt::Display for TipWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to {} UTC",
            self.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.end.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

#[derive(Debug, Serialize)]
struct Note<'a> {
    key_id: &'a str,
    text: &'a str,
}

pub fn unique_tip_count(tips: &[ImprovementTip]) -> usize {
    tips.iter().map(|t| t.text.as_str()).collect::<HashSet<_>>().len()
}

fn output_skeleton(window: &TipWindow, total: usize, unique: usize) -> Value {
    json!({
        "time_window": {"start_utc": window.start.to_rfc3339(), "end_utc": window.end.to_rfc3339()},
        "totals": {"notes": total, "unique_notes": unique},
        "groups": [{
            "group_id": "snake_case_id",
            "title": "Short title",
            "description": "1-3 sentence aggregate summary of the grouped inputs",
            "tip": "One-sentence improvement tip",
            "key_ids": ["k1", "k2"],
            "metrics": {
                "group_size": 0,
                "coverage_pct": 0.0,
                "actionability_score": 1,
                "severity_score": 1,
                "overall_score": 0
            },
            "next_steps": [{"training_cue": "directive", "success_signals": ["signal 1", "signal 2"]}]
        }],
        "ungrouped_key_ids": []
    })
}

pub fn build_grouping_prompts(tips: &[ImprovementTip], window: &TipWindow) -> Result<Prompts> {
    let total = tips.len();
    let unique = unique_tip_count(tips);
    let notes: Vec<Note> = tips
        .iter()
        .map(|t| Note {
            key_id: &t.issue_key,
            text: &t.text,
        })
        .collect();
    let notes_json = serde_json::to_string_pretty(&notes).context("Failed to encode notes")?;
    let skeleton = serde_json::to_string_pretty(&output_skeleton(window, total, unique))?;

    let user = format!(
        "You are given anonymised agent coaching notes from customer support chats. Each note has a \
stable key_id and a text improvement tip. Group related notes into themes and return STRICT JSON only \
(no markdown, no extra text) matching the output schema. Do NOT invent ids; only use provided key_ids.\n\n\
Input notes: array notes[] where each item is {{ \"key_id\": \"...\", \"text\": \"...\" }}.\n\n\
Context:\n- Time window: {window}\n- Total notes: {total}\n- Unique improvement tips: {unique}\n\n\
{GROUPING_RULES}\n- coverage_pct = round(100 * group_size / {total}, 2).\n\n\
{GROUPING_GUIDANCE}\n\nOutput JSON (strict, no markdown):\n{skeleton}\n\n\
NOTES JSON:\n{notes_json}\n\n\
Ensure your reply is exactly the JSON object above (no markdown, no extra text)."
    );
    Ok(Prompts {
        system: GROUPING_SYSTEM_PROMPT.to_string(),
        user,
    })
}

/// Request body for the grouping call. No response schema: the prompt carries the shape.
pub fn build_grouping_payload(model: &str, max_output_tokens: u32, prompts: &Prompts) -> Value {
    let mut payload = if model_uses_responses_api(model) {
        json!({
            "model": model,
            "input": [
                {"role": "system", "content": prompts.system},
                {"role": "user", "content": prompts.user}
            ],
            "max_output_tokens": max_output_tokens,
            "reasoning": {"effort": "low"}
        })
    } else {
        json!({
            "model": model,
            "messages": [
                {"role": "system", "content": prompts.system},
                {"role": "user", "content": prompts.user}
            ],
            "max_completion_tokens": max_output_tokens
        })
    };
    if model_supports_temperature(model) {
        payload["temperature"] = json!(GROUPING_TEMPERATURE);
    }
    payload
}

#[derive(Debug, Clone)]
pub struct GroupingOptions {
    pub model: String,
    pub max_output_tokens: u32,
    pub hours: f64,
    pub reference_time: Option<DateTime<Utc>>,
    pub persist: bool,
    pub dry_run: bool,
}

impl Default for GroupingOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_GROUPING_MODEL.to_string(),
            max_output_tokens: DEFAULT_GROUPING_MAX_TOKENS,
            hours: DEFAULT_WINDOW_HOURS,
            reference_time: None,
            persist: true,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupingSummary {
    pub model: String,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub total_notes: usize,
    pub unique_notes: usize,
    pub grouping: Option<Value>,
    pub grouping_id: Option<i64>,
    pub usage: Option<TokenUsage>,
    /// The request body, only when the model call was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
}

impl GroupingSummary {
    pub fn group_count(&self) -> usize {
        self.grouping
            .as_ref()
            .and_then(|g| g.get("groups"))
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }
}

impl fmt::Display for GroupingSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tips ({} unique) grouped into {} themes with {}",
            self.total_notes,
            self.unique_notes,
            self.group_count(),
            self.model
        )?;
        if let Some(id) = self.grouping_id {
            write!(f, ", saved as grouping {id}")?;
        }
        Ok(())
    }
}

/// Group the improvement tips from conversations started in the window ending at
/// `reference_time` (default now).
pub async fn run_tip_grouping(
    store: &Store,
    client: Option<&LlmClient>,
    options: &GroupingOptions,
) -> Result<GroupingSummary> {
    let window = TipWindow::ending_at(options.reference_time.unwrap_or_else(Utc::now), options.hours)?;
    let tips = store.fetch_improvement_tips(&window).await?;
    let mut summary = GroupingSummary {
        model: options.model.clone(),
        window_start: Some(window.start),
        window_end: Some(window.end),
        total_notes: tips.len(),
        unique_notes: unique_tip_count(&tips),
        ..Default::default()
    };
    if tips.is_empty() {
        info!("no improvement tips between {}", window);
        return Ok(summary);
    }

    let prompts = build_grouping_prompts(&tips, &window)?;
    let payload = build_grouping_payload(&options.model, options.max_output_tokens, &prompts);
    if options.dry_run {
        info!("dry run: skipping grouping call for {} tips", tips.len());
        summary.request = Some(payload);
        return Ok(summary);
    }
    let Some(client) = client else {
        bail!("OPENAI_API_KEY not set; cannot group improvement tips");
    };

    let reply = client.complete(&payload).await?;
    summary.usage = Some(reply.usage);
    match extract_json(&reply.text) {
        Ok(extraction) => summary.grouping = Some(Value::Object(extraction.object)),
        Err(e) => warn!("grouping reply was not JSON: {}", e),
    }

    if let (true, Some(grouping)) = (options.persist, &summary.grouping) {
        let id = store
            .save_tip_grouping(&window, summary.total_notes, summary.unique_notes, &options.model, grouping)
            .await?;
        summary.grouping_id = Some(id);
    }
    info!("{}", summary);
    Ok(summary)
}
