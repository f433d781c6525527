use crate::chat::{parse_comments, PreparedTicket};
use crate::ingest::{load_exports, prepare_tickets};
use crate::llm::extract::extract_json;
use crate::llm::pricing::estimate_cost;
use crate::llm::prompt::{
    build_prompts, build_request_payload, build_transcript, model_supports_temperature, Taxonomy,
};
use crate::llm::{LlmClient, LlmError, QualityAssessment, TokenUsage};
use crate::metrics::compute_metrics;
use crate::report::{existing_issue_keys, CsvSink, ScoredConversation};
use crate::store::Store;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use rand::Rng;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_MODEL: &str = "gpt-5-nano";
pub const DEFAULT_TEMPERATURE: f64 = 0.2;
pub const FILE_MAX_OUTPUT_TOKENS: u32 = 4000;
pub const STORE_MAX_OUTPUT_TOKENS: u32 = 8000;
pub const DEFAULT_PROCESS_LIMIT: usize = 50;

const MAX_ATTEMPTS: usize = 2;
const MAX_CONSECUTIVE_FAILURES: usize = 3;
const MAX_JITTER_MS: u64 = 500;

static UNSAFE_FILE_CHARS: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"[^A-Za-z0-9_-]").expect("static regex"));

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("payload missing issue_key")]
    MissingIssueKey,
    #[error("conversation {0} has no comments; cannot run LLM")]
    NoComments(String),
    #[error("LLM failed for {issue_key}: {source}")]
    Llm {
        issue_key: String,
        #[source]
        source: LlmError,
    },
}

#[derive(Debug, Clone)]
pub struct ScoringSettings {
    pub model: String,
    pub temperature: Option<f64>,
    pub max_output_tokens: u32,
    pub taxonomy: Taxonomy,
    pub use_llm: bool,
    pub concurrency: usize,
}

impl ScoringSettings {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: Some(DEFAULT_TEMPERATURE),
            max_output_tokens: FILE_MAX_OUTPUT_TOKENS,
            taxonomy: Taxonomy::default(),
            use_llm: true,
            concurrency: 1,
        }
    }

    /// The configured temperature, or `None` for models that reject one.
    pub fn effective_temperature(&self) -> Option<f64> {
        self.temperature
            .filter(|_| model_supports_temperature(&self.model))
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.max(1)
    }
}

/// Turns prepared tickets into scored conversations.
pub struct Scorer {
    settings: ScoringSettings,
    client: Option<Arc<LlmClient>>,
}

impl Scorer {
    pub fn new(settings: ScoringSettings, client: Option<Arc<LlmClient>>) -> Self {
        if settings.use_llm && client.is_none() {
            warn!("no LLM client configured; scoring with metrics only");
        }
        Self { settings, client }
    }

    pub fn settings(&self) -> &ScoringSettings {
        &self.settings
    }

    pub fn llm_enabled(&self) -> bool {
        self.settings.use_llm && self.client.is_some()
    }

    /// The request body that would be sent for `ticket`.
    pub fn request_payload(&self, ticket: &PreparedTicket) -> Value {
        let messages = parse_comments(&ticket.comments);
        let metrics = compute_metrics(&messages);
        let transcript = build_transcript(&messages);
        let prompts = build_prompts(ticket, &metrics, &transcript, &self.settings.taxonomy);
        build_request_payload(
            &self.settings.model,
            self.settings.effective_temperature(),
            self.settings.max_output_tokens,
            &prompts,
        )
    }

    /// Score one ticket. With `require_llm`, an empty conversation or a failed model call
    /// is an error; otherwise the row keeps its metrics and loses only the model fields.
    pub async fn score(
        &self,
        ticket: &PreparedTicket,
        require_llm: bool,
    ) -> Result<ScoredConversation, ProcessingError> {
        let messages = parse_comments(&ticket.comments);
        let metrics = compute_metrics(&messages);

        let client = match &self.client {
            Some(client) if self.settings.use_llm => client,
            _ => return Ok(ScoredConversation::new(ticket, metrics, "")),
        };
        let mut scored = ScoredConversation::new(ticket, metrics, &self.settings.model);

        if messages.is_empty() {
            if require_llm {
                return Err(ProcessingError::NoComments(ticket.issue_key.clone()));
            }
            debug!("{} has no comments; skipping LLM", ticket.issue_key);
            return Ok(scored);
        }

        let transcript = build_transcript(&messages);
        let prompts = build_prompts(ticket, &scored.metrics, &transcript, &self.settings.taxonomy);
        let payload = build_request_payload(
            &self.settings.model,
            self.settings.effective_temperature(),
            self.settings.max_output_tokens,
            &prompts,
        );

        match call_llm(client, &payload).await {
            Ok((assessment, usage)) => {
                scored.cost_usd = estimate_cost(
                    &self.settings.model,
                    usage.prompt,
                    usage.completion,
                    usage.cached,
                );
                scored.usage = Some(usage);
                scored.assessment = Some(assessment);
            }
            Err(source) if require_llm => {
                return Err(ProcessingError::Llm {
                    issue_key: ticket.issue_key.clone(),
                    source,
                });
            }
            Err(e) => warn!("LLM call failed for {}: {}", ticket.issue_key, e),
        }
        Ok(scored)
    }
}

async fn call_llm(
    client: &LlmClient,
    payload: &Value,
) -> Result<(QualityAssessment, TokenUsage), LlmError> {
    let reply = client.complete(payload).await?;
    let extraction = extract_json(&reply.text)?;
    debug!("LLM reply parsed via {:?}", extraction.strategy);
    Ok((QualityAssessment::from_object(extraction.object), reply.usage))
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

impl UsageTotals {
    fn add(&mut self, scored: &ScoredConversation) {
        if let Some(usage) = scored.usage {
            self.prompt_tokens += usage.prompt;
            self.completion_tokens += usage.completion;
        }
        self.cost_usd += scored.cost_usd.unwrap_or(0.0);
    }
}

/// Read prepared tickets from JSONL. Blank lines are ignored, malformed lines logged and skipped.
pub fn read_jsonl(path: &Path, limit: Option<usize>) -> Result<Vec<PreparedTicket>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let limit = limit.filter(|n| *n > 0).unwrap_or(usize::MAX);
    let mut tickets = Vec::new();

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        if tickets.len() >= limit {
            break;
        }
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<PreparedTicket>(&line) {
            Ok(ticket) => tickets.push(ticket),
            Err(e) => warn!("{}:{} is not a prepared ticket: {}", path.display(), idx + 1, e),
        }
    }
    Ok(tickets)
}

fn model_file_suffix(model: &str) -> String {
    model.replace('.', "_")
}

/// Output CSV for one model of a run. Several models share `base` with the model appended
/// to the stem; no base means a timestamped file under `data/`.
pub fn output_path_for(
    base: Option<&Path>,
    model: &str,
    benchmarking: bool,
    now: DateTime<Utc>,
) -> PathBuf {
    let suffix = model_file_suffix(model);
    match base {
        Some(base) if benchmarking => {
            let stem = base
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let name = match base.extension() {
                Some(ext) => format!("{stem}_{suffix}.{}", ext.to_string_lossy()),
                None => format!("{stem}_{suffix}"),
            };
            base.with_file_name(name)
        }
        Some(base) => base.to_path_buf(),
        None => PathBuf::from("data").join(format!(
            "conversation_quality_{suffix}_{}.csv",
            now.format("%Y%m%d_%H%M%S")
        )),
    }
}

pub fn payload_file_name(position: usize, model: &str, issue_key: &str) -> String {
    let key = if issue_key.is_empty() { "job" } else { issue_key };
    format!(
        "payload_{position:04}_{}_{}.json",
        model_file_suffix(model),
        UNSAFE_FILE_CHARS.replace_all(key, "_")
    )
}

#[derive(Debug, Clone)]
pub struct FileJobOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    pub limit: Option<usize>,
    pub resume: bool,
    pub payload_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub model: String,
    pub output: PathBuf,
    pub written: usize,
    pub skipped_existing: usize,
    pub payloads_written: usize,
    pub usage: UsageTotals,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "model {}: processed={}, total_tokens={}, cost=${:.6} -> {}",
            self.model,
            self.written,
            self.usage.prompt_tokens + self.usage.completion_tokens,
            self.usage.cost_usd,
            self.output.display()
        )
    }
}

/// Score a JSONL file into a CSV, preserving input order in the output.
pub async fn run_file_job(scorer: &Scorer, options: &FileJobOptions) -> Result<RunSummary> {
    let mut sink = CsvSink::open(&options.output)?;
    let skip = if options.resume {
        existing_issue_keys(&options.output)
    } else {
        HashSet::new()
    };

    let tickets = read_jsonl(&options.input, options.limit)?;
    let mut summary = RunSummary {
        model: scorer.settings().model.clone(),
        output: sink.path().to_path_buf(),
        ..Default::default()
    };

    let mut todo = Vec::with_capacity(tickets.len());
    for (idx, ticket) in tickets.iter().enumerate() {
        if !ticket.issue_key.is_empty() && skip.contains(&ticket.issue_key) {
            summary.skipped_existing += 1;
            continue;
        }
        todo.push((idx + 1, ticket));
    }

    if let Some(dir) = &options.payload_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        for (position, ticket) in &todo {
            let path = dir.join(payload_file_name(
                *position,
                &scorer.settings().model,
                &ticket.issue_key,
            ));
            let body = serde_json::to_string_pretty(&scorer.request_payload(ticket))?;
            std::fs::write(&path, body)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            debug!("wrote payload {}", path.display());
            summary.payloads_written += 1;
        }
    }

    info!(
        model = %summary.model,
        conversations = todo.len(),
        skipped = summary.skipped_existing,
        llm = scorer.llm_enabled(),
        "scoring conversations"
    );

    let pending: Vec<_> = todo.iter().map(|(_, t)| scorer.score(t, false)).collect();
    let mut results = stream::iter(pending).buffered(scorer.settings().concurrency());

    while let Some(result) = results.next().await {
        match result {
            Ok(scored) => {
                sink.append(&scored.to_row())?;
                summary.usage.add(&scored);
                summary.written += 1;
            }
            Err(e) => error!("scoring failed: {}", e),
        }
    }

    info!("{}", summary);
    Ok(summary)
}

/// Run the file job once per model, each into its own output.
pub async fn run_benchmark(
    settings: &ScoringSettings,
    client: Option<Arc<LlmClient>>,
    models: &[String],
    output: Option<&Path>,
    options: &FileJobOptions,
) -> Result<Vec<RunSummary>> {
    let benchmarking = models.len() > 1;
    let mut summaries = Vec::with_capacity(models.len());

    for (idx, model) in models.iter().enumerate() {
        info!("({}/{}) processing model {}", idx + 1, models.len(), model);
        let mut model_settings = settings.clone();
        model_settings.model = model.clone();
        let scorer = Scorer::new(model_settings, client.clone());
        let job = FileJobOptions {
            output: output_path_for(output, model, benchmarking, Utc::now()),
            ..options.clone()
        };
        summaries.push(run_file_job(&scorer, &job).await?);
    }
    Ok(summaries)
}

#[derive(Debug, Clone)]
pub struct StoreJobOptions {
    pub limit: usize,
    pub dry_run: bool,
}

impl Default for StoreJobOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PROCESS_LIMIT,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreRunSummary {
    pub run_id: Uuid,
    pub fetched: usize,
    pub processed: usize,
    pub failed: usize,
    pub dry_run: bool,
    pub usage: UsageTotals,
}

impl fmt::Display for StoreRunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.dry_run { "computed" } else { "stored" };
        write!(
            f,
            "{verb} {} of {} conversations ({} failed), cost=${:.6}, run {}",
            self.processed, self.fetched, self.failed, self.usage.cost_usd, self.run_id
        )
    }
}

async fn score_with_retry(
    scorer: &Scorer,
    ticket: &PreparedTicket,
) -> Result<ScoredConversation, ProcessingError> {
    if ticket.issue_key.trim().is_empty() {
        return Err(ProcessingError::MissingIssueKey);
    }
    let mut last_error = None;
    for attempt in 1..=MAX_ATTEMPTS {
        let jitter = rand::thread_rng().gen_range(0..=MAX_JITTER_MS);
        tokio::time::sleep(Duration::from_millis(jitter)).await;
        match scorer.score(ticket, true).await {
            Ok(scored) => return Ok(scored),
            Err(e) => {
                warn!("attempt {}/{} for {} failed: {}", attempt, MAX_ATTEMPTS, ticket.issue_key, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or(ProcessingError::MissingIssueKey))
}

async fn score_entry<'a>(
    scorer: &'a Scorer,
    ticket: &'a PreparedTicket,
) -> (&'a PreparedTicket, Result<ScoredConversation, ProcessingError>) {
    (ticket, score_with_retry(scorer, ticket).await)
}

/// Score unprocessed tickets from the store and write the results back.
/// Three failures in a row abort the run.
pub async fn run_store_job(
    store: &Store,
    scorer: &Scorer,
    options: &StoreJobOptions,
) -> Result<StoreRunSummary> {
    let run_id = Uuid::new_v4();
    info!(%run_id, limit = options.limit, dry_run = options.dry_run, "store job started");
    let processed_keys = store.fetch_processed_keys().await?;
    let tickets = store
        .fetch_prepared(options.limit.max(1), &processed_keys)
        .await?;

    let mut summary = StoreRunSummary {
        run_id,
        fetched: tickets.len(),
        dry_run: options.dry_run,
        ..Default::default()
    };
    if tickets.is_empty() {
        info!("no new conversations to process");
        return Ok(summary);
    }

    let pending: Vec<_> = tickets.iter().map(|t| score_entry(scorer, t)).collect();
    let mut results = stream::iter(pending).buffered(scorer.settings().concurrency());

    let mut consecutive_failures = 0;
    while let Some((ticket, result)) = results.next().await {
        let scored = match result {
            Ok(scored) => scored,
            Err(e) => {
                consecutive_failures += 1;
                summary.failed += 1;
                error!(
                    %run_id,
                    "processing failed for {}: {} (consecutive failures: {})",
                    ticket.issue_key, e, consecutive_failures
                );
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    bail!("run {run_id}: aborting after {consecutive_failures} consecutive failures");
                }
                continue;
            }
        };

        consecutive_failures = 0;
        summary.processed += 1;
        summary.usage.add(&scored);
        info!(
            "processing progress: {}/{} ({:.1}%) [{}]",
            summary.processed,
            summary.fetched,
            summary.processed as f64 / summary.fetched as f64 * 100.0,
            scored.issue_key
        );

        if !options.dry_run {
            store.upsert_processed(&scored).await?;
            store
                .mark_prepared_processed(std::slice::from_ref(&scored.issue_key))
                .await?;
        }
    }

    info!("{}", summary);
    Ok(summary)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestSummary {
    pub source_rows: usize,
    pub saved: usize,
    pub skipped_token_limit: usize,
}

impl fmt::Display for IngestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "saved {} prepared conversations from {} rows ({} over token cap)",
            self.saved, self.source_rows, self.skipped_token_limit
        )
    }
}

/// Prepare Jira CSV exports in memory and queue them in the store.
pub async fn run_ingest_job(
    store: &Store,
    inputs: &[PathBuf],
    max_merged_tokens: Option<usize>,
) -> Result<IngestSummary> {
    let exports = load_exports(inputs)?;
    let batch = prepare_tickets(&exports, None, max_merged_tokens);
    let saved = store.save_prepared(&batch.tickets).await?;
    let summary = IngestSummary {
        source_rows: exports.source_rows(),
        saved,
        skipped_token_limit: batch.skipped_token_limit,
    };
    info!("{}", summary);
    Ok(summary)
}

/// Load an already-prepared JSONL file into the store.
pub async fn load_jsonl_into_store(store: &Store, path: &Path) -> Result<usize> {
    let tickets = read_jsonl(path, None)?;
    let saved = store.save_prepared(&tickets).await?;
    info!("loaded {} prepared conversations from {}", saved, path.display());
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::RawComment;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ticket(key: &str, comments: usize) -> PreparedTicket {
        PreparedTicket {
            issue_key: key.to_string(),
            comments: (0..comments)
                .map(|i| RawComment {
                    date: Some(format!("2024-02-01T10:0{i}:00Z")),
                    author: Some(if i % 2 == 0 { "qm:1" } else { "712020x" }.to_string()),
                    text: format!("message {i}"),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn write_input(dir: &Path, tickets: &[PreparedTicket]) -> PathBuf {
        let path = dir.join("prepared.jsonl");
        let body: Vec<String> = tickets
            .iter()
            .map(|t| serde_json::to_string(t).unwrap())
            .collect();
        std::fs::write(&path, body.join("\n\n") + "\nnot json\n").unwrap();
        path
    }

    async fn mock_llm(status: StatusCode, hits: Arc<AtomicUsize>) -> Arc<LlmClient> {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let body = json!({
                        "choices": [{"message": {"content": "```json\n{\"agent_score\": \"4\", \"resolved\": true}\n```"}}],
                        "usage": {"prompt_tokens": 1000, "completion_tokens": 100}
                    });
                    (status, Json(body))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Arc::new(LlmClient::new("test", Some(format!("http://{addr}/v1"))).unwrap())
    }

    fn settings(model: &str) -> ScoringSettings {
        ScoringSettings {
            concurrency: 3,
            ..ScoringSettings::new(model)
        }
    }

    #[test]
    fn temperature_dropped_for_reasoning_models() {
        assert_eq!(ScoringSettings::new("gpt-5-nano").effective_temperature(), None);
        assert_eq!(ScoringSettings::new("gpt-4o").effective_temperature(), Some(0.2));
        let zero = ScoringSettings {
            concurrency: 0,
            ..ScoringSettings::new("gpt-4o")
        };
        assert_eq!(zero.concurrency(), 1);
    }

    #[test]
    fn output_paths_follow_model_names() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap();
        let base = Path::new("out/quality.csv");
        assert_eq!(output_path_for(Some(base), "gpt-4.1-nano", false, now), base);
        assert_eq!(
            output_path_for(Some(base), "gpt-4.1-nano", true, now),
            PathBuf::from("out/quality_gpt-4_1-nano.csv")
        );
        assert_eq!(
            output_path_for(None, "gpt-5-nano", false, now),
            PathBuf::from("data/conversation_quality_gpt-5-nano_20240601_083000.csv")
        );
    }

    #[test]
    fn payload_names_are_filesystem_safe() {
        assert_eq!(
            payload_file_name(7, "gpt-4.1", "SUP/12 x"),
            "payload_0007_gpt-4_1_SUP_12_x.json"
        );
        assert_eq!(payload_file_name(1, "m", ""), "payload_0001_m_job.json");
    }

    #[test]
    fn jsonl_reader_skips_blank_and_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_input(dir.path(), &[ticket("SUP-1", 1), ticket("SUP-2", 1)]);
        assert_eq!(read_jsonl(&path, None).unwrap().len(), 2);
        assert_eq!(read_jsonl(&path, Some(1)).unwrap().len(), 1);
        assert_eq!(read_jsonl(&path, Some(0)).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn file_job_without_llm_writes_rows_in_order_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(
            dir.path(),
            &[ticket("SUP-3", 2), ticket("SUP-1", 3), ticket("SUP-2", 0)],
        );
        let options = FileJobOptions {
            input,
            output: dir.path().join("out/quality.csv"),
            limit: None,
            resume: true,
            payload_dir: None,
        };
        let scorer = Scorer::new(settings("gpt-4o-mini"), None);

        let summary = run_file_job(&scorer, &options).await.unwrap();
        assert_eq!(summary.written, 3);
        assert_eq!(summary.usage, UsageTotals::default());

        let mut reader = csv::Reader::from_path(&options.output).unwrap();
        let keys: Vec<String> = reader
            .records()
            .map(|r| r.unwrap().get(0).unwrap().to_string())
            .collect();
        assert_eq!(keys, vec!["SUP-3", "SUP-1", "SUP-2"]);

        let again = run_file_job(&scorer, &options).await.unwrap();
        assert_eq!(again.written, 0);
        assert_eq!(again.skipped_existing, 3);
    }

    #[tokio::test]
    async fn file_job_writes_request_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), &[ticket("SUP-1", 2)]);
        let options = FileJobOptions {
            input,
            output: dir.path().join("q.csv"),
            limit: None,
            resume: false,
            payload_dir: Some(dir.path().join("payloads")),
        };
        let scorer = Scorer::new(settings("gpt-5-nano"), None);
        let summary = run_file_job(&scorer, &options).await.unwrap();
        assert_eq!(summary.payloads_written, 1);

        let path = dir.path().join("payloads/payload_0001_gpt-5-nano_SUP-1.json");
        let payload: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(payload["model"], "gpt-5-nano");
        assert!(payload["input"][1]["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("Issue key: SUP-1"));
    }

    #[tokio::test]
    async fn file_job_with_llm_totals_usage() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), &[ticket("SUP-1", 2), ticket("SUP-2", 0)]);
        let hits = Arc::new(AtomicUsize::new(0));
        let client = mock_llm(StatusCode::OK, hits.clone()).await;
        let scorer = Scorer::new(settings("gpt-4o-mini"), Some(client));
        let options = FileJobOptions {
            input,
            output: dir.path().join("q.csv"),
            limit: None,
            resume: false,
            payload_dir: None,
        };

        let summary = run_file_job(&scorer, &options).await.unwrap();
        assert_eq!(summary.written, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(summary.usage.prompt_tokens, 1000);
        assert!((summary.usage.cost_usd - 0.0035).abs() < 1e-9);

        let body = std::fs::read_to_string(&options.output).unwrap();
        assert!(body.contains("gpt-4o-mini"));
    }

    #[tokio::test]
    async fn file_mode_keeps_rows_when_llm_fails() {
        let hits = Arc::new(AtomicUsize::new(0));
        let client = mock_llm(StatusCode::INTERNAL_SERVER_ERROR, hits).await;
        let scorer = Scorer::new(settings("gpt-4o-mini"), Some(client));
        let scored = scorer.score(&ticket("SUP-1", 2), false).await.unwrap();
        assert!(scored.assessment.is_none());
        assert_eq!(scored.metrics.messages_total, 2);

        let err = scorer.score(&ticket("SUP-1", 2), true).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Llm { .. }));
        let err = scorer.score(&ticket("SUP-2", 0), true).await.unwrap_err();
        assert!(matches!(err, ProcessingError::NoComments(_)));
    }

    #[tokio::test]
    async fn store_job_scores_and_marks_tickets() {
        let store = Store::in_memory().await.unwrap();
        store.init().await.unwrap();
        store
            .save_prepared(&[ticket("SUP-1", 2), ticket("SUP-2", 3)])
            .await
            .unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let client = mock_llm(StatusCode::OK, hits).await;
        let scorer = Scorer::new(settings("gpt-4o-mini"), Some(client));

        let dry = run_store_job(&store, &scorer, &StoreJobOptions { limit: 10, dry_run: true })
            .await
            .unwrap();
        assert_eq!(dry.processed, 2);
        assert!(store.fetch_processed_keys().await.unwrap().is_empty());

        let summary = run_store_job(&store, &scorer, &StoreJobOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(store.fetch_processed_keys().await.unwrap().len(), 2);

        let rerun = run_store_job(&store, &scorer, &StoreJobOptions::default())
            .await
            .unwrap();
        assert_eq!(rerun.fetched, 0);
    }

    #[tokio::test]
    async fn store_job_aborts_after_consecutive_failures() {
        let store = Store::in_memory().await.unwrap();
        store.init().await.unwrap();
        let tickets: Vec<PreparedTicket> = (1..=4).map(|i| ticket(&format!("SUP-{i}"), 2)).collect();
        store.save_prepared(&tickets).await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let client = mock_llm(StatusCode::INTERNAL_SERVER_ERROR, hits.clone()).await;
        let scorer = Scorer::new(settings("gpt-4o-mini"), Some(client));

        let err = run_store_job(&store, &scorer, &StoreJobOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("3 consecutive failures"));
        assert!(hits.load(Ordering::SeqCst) >= 6);
        assert!(store.fetch_processed_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ingest_and_load_queue_tickets() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::in_memory().await.unwrap();
        store.init().await.unwrap();

        let jsonl = write_input(dir.path(), &[ticket("SUP-8", 1)]);
        assert_eq!(load_jsonl_into_store(&store, &jsonl).await.unwrap(), 1);

        let csv = dir.path().join("export.csv");
        std::fs::write(
            &csv,
            "Issue key,Summary,Status,Comments\nSUP-9,Dock,Open,2024-01-01 10:00;qm:1;hello\n",
        )
        .unwrap();
        let summary = run_ingest_job(&store, &[csv], None).await.unwrap();
        assert_eq!(summary.saved, 1);
        assert_eq!(summary.source_rows, 1);

        let pending = store.fetch_prepared(10, &HashSet::new()).await.unwrap();
        assert_eq!(pending.len(), 2);
    }
}
