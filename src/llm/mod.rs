pub mod assessment;
pub mod client;
pub mod extract;
pub mod pricing;
pub mod prompt;

pub use assessment::QualityAssessment;
pub use client::{LlmClient, TokenUsage};

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("response_incomplete:{0}")]
    Incomplete(String),
    #[error("model returned no content")]
    Empty,
    #[error("no valid JSON object in reply; raw={snippet}")]
    Unparseable { snippet: String },
}
