use super::LlmError;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("fenced block pattern is valid")
});

const SNIPPET_CHARS: usize = 500;

/// Ways of pulling a JSON object out of free-form model output, tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// The trimmed body is the object.
    WholeBody,
    /// The object sits inside a markdown code fence.
    FencedBlock,
    /// The object is the span between the first `{` and the last `}`.
    BraceSpan,
}

impl Strategy {
    pub const ORDER: [Strategy; 3] = [Strategy::WholeBody, Strategy::FencedBlock, Strategy::BraceSpan];

    pub fn apply(self, content: &str) -> Option<Map<String, Value>> {
        match self {
            Strategy::WholeBody => parse_object(content.trim().trim_matches('`').trim()),
            Strategy::FencedBlock => FENCED_BLOCK
                .captures_iter(content)
                .filter_map(|caps| caps.get(1))
                .find_map(|block| parse_object(block.as_str().trim())),
            Strategy::BraceSpan => {
                let start = content.find('{')?;
                let end = content.rfind('}')?;
                if end <= start {
                    return None;
                }
                parse_object(&content[start..=end])
            }
        }
    }
}

/// A JSON object along with the strategy that found it.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub strategy: Strategy,
    pub object: Map<String, Value>,
}

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

pub fn extract_json(content: &str) -> Result<Extraction, LlmError> {
    Strategy::ORDER
        .into_iter()
        .find_map(|strategy| {
            strategy
                .apply(content)
                .map(|object| Extraction { strategy, object })
        })
        .ok_or_else(|| LlmError::Unparseable {
            snippet: content.chars().take(SNIPPET_CHARS).collect(),
        })
}
