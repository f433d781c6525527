/// USD per one million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input: f64,
    pub cached_input: Option<f64>,
    pub output: f64,
}

const fn price(input: f64, cached_input: Option<f64>, output: f64) -> ModelPrice {
    ModelPrice {
        input,
        cached_input,
        output,
    }
}

pub const MODEL_PRICING: &[(&str, ModelPrice)] = &[
    ("gpt-4o", price(10.0, None, 30.0)),
    ("gpt-4o-mini", price(2.5, None, 10.0)),
    ("gpt-4.1-nano", price(0.20, Some(0.05), 0.80)),
    ("gpt-4.1-nano-ft", price(0.80, Some(0.20), 3.20)),
    ("gpt-5-nano", price(0.05, Some(0.005), 0.40)),
    ("gpt-5-nano-ft", price(0.25, Some(0.025), 2.00)),
    ("gpt-5.0", price(5.0, None, 15.0)),
    ("gpt-5.0-mini", price(2.0, None, 6.0)),
    ("gpt-5.0-pro", price(10.0, None, 30.0)),
];

pub fn model_price(model: &str) -> Option<ModelPrice> {
    MODEL_PRICING
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, price)| *price)
}

/// Whitespace word count scaled by 1.33, at least 1 for non-empty text.
///
/// This is the only token estimator in the crate; no model tokenizer is consulted.
/// Counts and costs derived from it (flagged `estimated` on [`TokenUsage`]) are
/// approximate.
///
/// [`TokenUsage`]: super::TokenUsage
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let words = text.split_whitespace().count() as f64;
    ((words * 1.33) as u64).max(1)
}

/// Cost in USD, or `None` for models missing from the table.
/// Cached prompt tokens are clamped to the prompt total and billed at the cached rate.
pub fn estimate_cost(
    model: &str,
    prompt_tokens: u64,
    completion_tokens: u64,
    cached_prompt_tokens: u64,
) -> Option<f64> {
    let price = model_price(model)?;
    let cached = cached_prompt_tokens.min(prompt_tokens);
    let fresh = prompt_tokens - cached;
    let per_token = |tokens: u64, rate: f64| tokens as f64 / 1_000_000.0 * rate;

    Some(
        per_token(fresh, price.input)
            + per_token(cached, price.cached_input.unwrap_or(price.input))
            + per_token(completion_tokens, price.output),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_scales_word_count() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("   "), 1);
        assert_eq!(estimate_tokens("one"), 1);
        assert_eq!(estimate_tokens("one two three"), 3);
        assert_eq!(estimate_tokens(&"w ".repeat(100)), 133);
    }

    #[test]
    fn cost_uses_cached_rate_when_known() {
        let cost = estimate_cost("gpt-5-nano", 1_000_000, 1_000_000, 0).unwrap();
        assert!((cost - 0.45).abs() < 1e-9);

        let cost = estimate_cost("gpt-5-nano", 1_000_000, 0, 400_000).unwrap();
        assert!((cost - (0.6 * 0.05 + 0.4 * 0.005)).abs() < 1e-9);

        // no cached tier: cached tokens bill at the input rate
        let cost = estimate_cost("gpt-4o", 1_000_000, 0, 500_000).unwrap();
        assert!((cost - 10.0).abs() < 1e-9);
    }

    #[test]
    fn cached_tokens_clamp_to_prompt() {
        let a = estimate_cost("gpt-4.1-nano", 100, 0, 1_000).unwrap();
        let b = estimate_cost("gpt-4.1-nano", 100, 0, 100).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_model_has_no_cost() {
        assert_eq!(estimate_cost("claude-x", 10, 10, 0), None);
    }
}
