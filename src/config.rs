use crate::ingest::DEFAULT_MAX_MERGED_TOKENS;
use crate::jira::{
    JiraClient, PullOptions, DEFAULT_BATCH_SIZE, DEFAULT_PROJECT, DEFAULT_STATUS_CATEGORY,
};
use crate::llm::prompt::Taxonomy;
use crate::llm::LlmClient;
use crate::pipeline::{ScoringSettings, DEFAULT_MODEL, DEFAULT_PROCESS_LIMIT, DEFAULT_TEMPERATURE};
use crate::tips::{DEFAULT_GROUPING_MAX_TOKENS, DEFAULT_GROUPING_MODEL, DEFAULT_WINDOW_HOURS};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Score Jira support conversations", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Flatten Jira CSV exports into prepared JSONL
    Prepare {
        /// One or more Jira CSV exports
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        #[arg(short, long, default_value = "data/prepared_conversations.jsonl")]
        output: PathBuf,

        /// Append to the output instead of overwriting it
        #[arg(long)]
        append: bool,

        /// Keep only the first N issues after sorting
        #[arg(long)]
        sample: Option<usize>,

        /// Drop tickets whose merged text exceeds this many tokens
        #[arg(long, default_value_t = DEFAULT_MAX_MERGED_TOKENS)]
        max_tokens: usize,

        /// Keep every ticket regardless of size
        #[arg(long, conflicts_with = "max_tokens")]
        no_token_cap: bool,
    },

    /// Score prepared JSONL into a CSV
    Score {
        input: PathBuf,

        /// Output CSV (default: data/conversation_quality_<model>_<timestamp>.csv)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stop after N conversations (0 = all)
        #[arg(long)]
        limit: Option<usize>,

        /// Skip issue keys already present in the output
        #[arg(long)]
        resume: bool,

        /// Write request payloads to DIR instead of calling the model
        #[arg(long, value_name = "DIR")]
        generate_payloads: Option<PathBuf>,

        /// Run the same input through several models in turn
        #[arg(long, num_args = 1..)]
        benchmark_models: Vec<String>,

        #[command(flatten)]
        llm: LlmArgs,
    },

    /// Load prepared JSONL into the store
    Load {
        input: PathBuf,

        #[command(flatten)]
        db: DbArgs,
    },

    /// Pull new issues from Jira Cloud into the store
    Pull {
        /// Lower bound for created date; never earlier than 2025-11-01
        #[arg(long)]
        start_date: Option<NaiveDate>,

        /// Exclusive upper bound for created date
        #[arg(long)]
        end_date: Option<NaiveDate>,

        /// Issues requested per search call
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        /// Stop after this many new issues
        #[arg(long)]
        max_issues: Option<usize>,

        /// Use this JQL instead of the generated window
        #[arg(long)]
        jql: Option<String>,

        /// Ignore stored checkpoints when building the window
        #[arg(long)]
        force_full_refresh: bool,

        /// Fetch and build tickets without saving them
        #[arg(long)]
        dry_run: bool,

        /// Only report how many new issues would be ingested
        #[arg(long)]
        count_only: bool,

        #[command(flatten)]
        jira: JiraArgs,

        #[command(flatten)]
        db: DbArgs,
    },

    /// Score unprocessed tickets in the store
    Process {
        #[arg(long, default_value_t = DEFAULT_PROCESS_LIMIT)]
        limit: usize,

        /// Compute without writing results
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        llm: LlmArgs,

        #[command(flatten)]
        db: DbArgs,
    },

    /// Group recent improvement tips into ranked themes
    GroupTips {
        /// Size of the window in hours
        #[arg(long, default_value_t = DEFAULT_WINDOW_HOURS)]
        hours: f64,

        /// End of the window (RFC 3339); defaults to now
        #[arg(long)]
        reference_time: Option<DateTime<Utc>>,

        #[arg(long, env = "CONVOSCORE_GROUPING_MODEL", default_value = DEFAULT_GROUPING_MODEL)]
        model: String,

        #[arg(long, env = "IMPROVEMENT_GROUP_MAX_TOKENS", default_value_t = DEFAULT_GROUPING_MAX_TOKENS)]
        max_tokens: u32,

        /// Do not save the grouping
        #[arg(long)]
        no_persist: bool,

        /// Print the request body instead of calling the model
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        api: ApiArgs,

        #[command(flatten)]
        db: DbArgs,
    },

    /// Serve the ingest, process and grouping HTTP triggers
    Serve {
        #[arg(long, env = "CONVOSCORE_BIND", default_value = "127.0.0.1:3000")]
        bind: String,

        /// CSV exports ingested when a request names none
        #[arg(long, env = "CONVOSCORE_INGEST_INPUTS", value_delimiter = ',')]
        ingest_inputs: Vec<PathBuf>,

        #[arg(long, env = "CONVOSCORE_GROUPING_MODEL", default_value = DEFAULT_GROUPING_MODEL)]
        grouping_model: String,

        #[command(flatten)]
        llm: LlmArgs,

        #[command(flatten)]
        jira: JiraArgs,

        #[command(flatten)]
        db: DbArgs,
    },
}

#[derive(Args, Debug, Clone)]
pub struct JiraArgs {
    #[arg(long, env = "JIRA_BASE_URL")]
    pub jira_base_url: Option<String>,

    #[arg(long, env = "JIRA_EMAIL")]
    pub jira_email: Option<String>,

    #[arg(long, env = "JIRA_API_KEY", hide_env_values = true)]
    pub jira_api_key: Option<String>,

    #[arg(long, env = "JIRA_PROJECT", default_value = DEFAULT_PROJECT)]
    pub jira_project: String,

    #[arg(long, env = "JIRA_STATUS_CATEGORY", default_value = DEFAULT_STATUS_CATEGORY)]
    pub jira_status_category: String,
}

impl JiraArgs {
    /// The Jira client, or `None` when any credential is missing.
    pub fn client(&self) -> Result<Option<JiraClient>> {
        let present = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        let (Some(base), Some(email), Some(key)) = (
            present(&self.jira_base_url),
            present(&self.jira_email),
            present(&self.jira_api_key),
        ) else {
            return Ok(None);
        };
        let client = JiraClient::new(&base, email, key).context("Failed to build Jira client")?;
        Ok(Some(client))
    }

    pub fn pull_options(&self) -> PullOptions {
        PullOptions {
            project: self.jira_project.clone(),
            status_category: self.jira_status_category.clone(),
            ..Default::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DbArgs {
    /// SQLite database file
    #[arg(long, env = "CONVOSCORE_DB", default_value = "data/convoscore.db")]
    pub db: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct LlmArgs {
    #[arg(long, env = "CONVOSCORE_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    #[arg(long, default_value_t = DEFAULT_TEMPERATURE)]
    pub temperature: f64,

    /// Defaults to 4000 for file scoring and 8000 for store processing
    #[arg(long)]
    pub max_output_tokens: Option<u32>,

    /// JSON array of labels, or an object of label -> keyword hints
    #[arg(long, env = "CONVOSCORE_TAXONOMY")]
    pub taxonomy_file: Option<PathBuf>,

    /// Metrics only; never call the model
    #[arg(long)]
    pub no_llm: bool,

    #[arg(long, env = "CONVOSCORE_CONCURRENCY", default_value_t = 1)]
    pub concurrency: usize,

    #[command(flatten)]
    pub api: ApiArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ApiArgs {
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "OPENAI_API_BASE")]
    pub api_base: Option<String>,
}

impl ApiArgs {
    /// The shared model client, or `None` when no key is configured.
    pub fn client(&self) -> Option<Arc<LlmClient>> {
        let Some(key) = self.api_key.as_deref().filter(|k| !k.trim().is_empty()) else {
            warn!("OPENAI_API_KEY not set; proceeding without LLM augmentation");
            return None;
        };
        match LlmClient::new(key, self.api_base.clone()) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                error!("failed to build LLM client: {}", e);
                None
            }
        }
    }
}

impl LlmArgs {
    pub fn settings(&self, default_max_output_tokens: u32) -> ScoringSettings {
        ScoringSettings {
            model: self.model.clone(),
            temperature: Some(self.temperature),
            max_output_tokens: self.max_output_tokens.unwrap_or(default_max_output_tokens),
            taxonomy: Taxonomy::load(self.taxonomy_file.as_deref()),
            use_llm: !self.no_llm,
            concurrency: self.concurrency.max(1),
        }
    }

    /// The shared model client, or `None` when disabled or unconfigured.
    pub fn client(&self) -> Option<Arc<LlmClient>> {
        if self.no_llm {
            return None;
        }
        self.api.client()
    }
}
