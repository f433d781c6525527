use std::{path::PathBuf, sync::Arc};

use axum::{
    extract::{Json, State},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::ingest::DEFAULT_MAX_MERGED_TOKENS;
use crate::jira::{pull_into_store, JiraClient, PullOptions};
use crate::llm::LlmClient;
use crate::pipeline::{run_ingest_job, run_store_job, Scorer, StoreJobOptions, DEFAULT_PROCESS_LIMIT};
use crate::store::Store;
use crate::tips::{run_tip_grouping, GroupingOptions};

// -----------------------------------------------------------------------------
// Request bodies
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestSource {
    Csv,
    Jira,
}

#[derive(Debug, Default, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub inputs: Option<Vec<PathBuf>>,
    #[serde(default)]
    pub source: Option<IngestSource>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProcessRequest {
    #[serde(default)]
    pub limit: Option<Value>,
}

/// Parse a positive integer given as a JSON number or numeric string.
fn positive_int(value: Option<&Value>) -> Option<u64> {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed.filter(|n| *n > 0)
}

impl ProcessRequest {
    /// A positive integer (or numeric string) limit; anything else falls back to the default.
    pub fn limit(&self) -> usize {
        positive_int(self.limit.as_ref())
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_PROCESS_LIMIT)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct GroupingRequest {
    #[serde(default, alias = "maxTokens")]
    pub max_tokens: Option<Value>,
}

impl GroupingRequest {
    /// `Ok(None)` when absent, `Err` when present but not a positive integer.
    pub fn max_tokens(&self) -> Result<Option<u32>, String> {
        match &self.max_tokens {
            None | Some(Value::Null) => Ok(None),
            value => positive_int(value.as_ref())
                .and_then(|n| u32::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| "max_tokens must be a positive integer".to_string()),
        }
    }
}

// -----------------------------------------------------------------------------
// Server State
// -----------------------------------------------------------------------------

pub struct TriggerState {
    pub store: Store,
    pub scorer: Scorer,
    pub ingest_inputs: Vec<PathBuf>,
    pub jira: Option<(JiraClient, PullOptions)>,
    pub llm: Option<Arc<LlmClient>>,
    pub grouping: GroupingOptions,
}

pub struct TriggerServer {
    state: TriggerState,
}

impl TriggerServer {
    pub fn new(store: Store, scorer: Scorer, ingest_inputs: Vec<PathBuf>) -> Self {
        Self {
            state: TriggerState {
                store,
                scorer,
                ingest_inputs,
                jira: None,
                llm: None,
                grouping: GroupingOptions::default(),
            },
        }
    }

    /// Enable `"source": "jira"` on the ingest trigger.
    pub fn with_jira(mut self, client: JiraClient, options: PullOptions) -> Self {
        self.state.jira = Some((client, options));
        self
    }

    pub fn with_grouping(mut self, llm: Option<Arc<LlmClient>>, options: GroupingOptions) -> Self {
        self.state.llm = llm;
        self.state.grouping = options;
        self
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/api/ingest", get(ingest_ready).post(ingest_handler))
            .route("/api/process", get(process_ready).post(process_handler))
            .route(
                "/api/improvement-groups",
                get(grouping_ready).post(grouping_handler),
            )
            .route("/health", get(|| async { "ok" }))
            .with_state(Arc::new(self.state))
            .layer(TraceLayer::new_for_http())
            // Triggers are unauthenticated; browsers may only read.
            .layer(CorsLayer::new().allow_methods([Method::GET]))
    }
}

fn stamped(message: impl std::fmt::Display) -> String {
    format!(
        "[{}] {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        message
    )
}

fn job_failed(job: &str, err: anyhow::Error) -> (StatusCode, String) {
    error!("{} job failed: {:#}", job, err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("error in {job}; see logs"),
    )
}

fn bad_request(message: impl Into<String>) -> (StatusCode, String) {
    let message = message.into();
    warn!("rejected trigger: {}", message);
    (StatusCode::BAD_REQUEST, message)
}

async fn ingest_ready() -> &'static str {
    "ingest trigger ready; POST to run"
}

async fn process_ready() -> &'static str {
    "process trigger ready; POST to run"
}

async fn grouping_ready() -> &'static str {
    "improvement grouping trigger ready; POST to run"
}

/// Requested inputs must come from the configured list; none means all of them.
fn resolve_inputs(
    requested: Option<Vec<PathBuf>>,
    configured: &[PathBuf],
) -> Result<Vec<PathBuf>, String> {
    let requested = requested.unwrap_or_default();
    if requested.is_empty() {
        if configured.is_empty() {
            return Err("no ingest inputs configured".to_string());
        }
        return Ok(configured.to_vec());
    }
    if let Some(unknown) = requested.iter().find(|p| !configured.contains(p)) {
        return Err(format!("input not in configured list: {}", unknown.display()));
    }
    Ok(requested)
}

async fn ingest_handler(
    State(state): State<Arc<TriggerState>>,
    body: Option<Json<IngestRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let wants_files = request.inputs.as_ref().is_some_and(|i| !i.is_empty());
    let source = request.source.unwrap_or(if state.jira.is_some() && !wants_files {
        IngestSource::Jira
    } else {
        IngestSource::Csv
    });

    if source == IngestSource::Jira {
        let Some((client, options)) = &state.jira else {
            return bad_request("Jira credentials not configured");
        };
        info!("ingest triggered from Jira project {}", options.project);
        return match pull_into_store(client, &state.store, options).await {
            Ok(summary) => {
                for failure in &summary.failures {
                    error!("{}", failure);
                }
                (StatusCode::OK, stamped(summary))
            }
            Err(e) => job_failed("ingest", e),
        };
    }

    let inputs = match resolve_inputs(request.inputs, &state.ingest_inputs) {
        Ok(inputs) => inputs,
        Err(message) => return bad_request(message),
    };
    info!("ingest triggered for {} input(s)", inputs.len());

    match run_ingest_job(&state.store, &inputs, Some(DEFAULT_MAX_MERGED_TOKENS)).await {
        Ok(summary) => (StatusCode::OK, stamped(summary)),
        Err(e) => job_failed("ingest", e),
    }
}

async fn process_handler(
    State(state): State<Arc<TriggerState>>,
    body: Option<Json<ProcessRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let options = StoreJobOptions {
        limit: request.limit(),
        dry_run: false,
    };
    info!("process triggered with limit {}", options.limit);

    match run_store_job(&state.store, &state.scorer, &options).await {
        Ok(summary) => (StatusCode::OK, stamped(summary)),
        Err(e) => job_failed("process", e),
    }
}

async fn grouping_handler(
    State(state): State<Arc<TriggerState>>,
    body: Option<Json<GroupingRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let max_tokens = match request.max_tokens() {
        Ok(value) => value.unwrap_or(state.grouping.max_output_tokens),
        Err(message) => {
            warn!("rejected trigger: {}", message);
            return (StatusCode::BAD_REQUEST, Json(json!({"ok": false, "error": message})));
        }
    };
    let options = GroupingOptions {
        max_output_tokens: max_tokens,
        ..state.grouping.clone()
    };
    info!("improvement grouping triggered with max_tokens {}", max_tokens);

    match run_tip_grouping(&state.store, state.llm.as_deref(), &options).await {
        Ok(summary) => (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "max_tokens": max_tokens,
                "summary": stamped(&summary),
                "result": summary,
            })),
        ),
        Err(e) => {
            error!("grouping job failed: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"ok": false, "error": "error in grouping; see logs"})),
            )
        }
    }
}
