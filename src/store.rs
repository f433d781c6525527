use crate::chat::{parse_datetime, PreparedTicket};
use crate::report::ScoredConversation;
use crate::tips::{ImprovementTip, TipWindow};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    ConnectOptions, QueryBuilder, Row, Sqlite, SqlitePool,
};
use std::{collections::HashSet, path::Path, str::FromStr};
use tracing::{debug, warn};

const FETCH_PAGE: i64 = 200;
const MARK_CHUNK: usize = 100;

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database file at `db_path`.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// A private in-memory database. One connection, so every query sees the same data.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .log_statements(tracing::log::LevelFilter::Trace);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prepared_conversations (
                issue_key TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                merge_context_size_tokens INTEGER NOT NULL DEFAULT 0,
                prepared_at DATETIME NOT NULL,
                processed BOOLEAN NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_prepared_pending ON prepared_conversations(processed, issue_key);

            CREATE TABLE IF NOT EXISTS processed_conversations (
                issue_key TEXT PRIMARY KEY,
                status TEXT,
                resolution TEXT,
                custom_field_hub TEXT,
                conversation_start DATETIME,
                conversation_end DATETIME,
                duration_minutes REAL,
                duration_to_resolution REAL,
                first_agent_response_minutes REAL,
                avg_agent_response_minutes REAL,
                avg_customer_response_minutes REAL,
                messages_total INTEGER,
                messages_agent INTEGER,
                messages_customer INTEGER,
                turns INTEGER,
                agent_authors TEXT,
                customer_authors TEXT,
                initial_response_sla_5m BOOLEAN,
                initial_response_sla_15m BOOLEAN,
                agent_profanity_detected BOOLEAN,
                agent_profanity_count INTEGER,
                customer_abuse_detected BOOLEAN,
                customer_abuse_count INTEGER,
                llm_summary_250 TEXT,
                conversation_rating INTEGER,
                problem_extract TEXT,
                resolution_extract TEXT,
                steps_extract TEXT,
                resolution_timestamp_iso DATETIME,
                resolution_message_index INTEGER,
                contact_reason TEXT,
                contact_reason_original TEXT,
                contact_reason_change BOOLEAN,
                reason_override_why TEXT,
                resolution_why TEXT,
                customer_sentiment_primary TEXT,
                customer_sentiment_scores TEXT,
                llm_agent_profanity_detected BOOLEAN,
                llm_agent_profanity_count INTEGER,
                llm_customer_abuse_detected BOOLEAN,
                llm_customer_abuse_count INTEGER,
                agent_score INTEGER,
                customer_score INTEGER,
                resolved BOOLEAN,
                is_resolved BOOLEAN,
                improvement_tip TEXT,
                llm_model TEXT,
                llm_input_tokens INTEGER,
                llm_output_tokens INTEGER,
                llm_cost_usd REAL,
                processed_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS improvement_tip_groupings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                time_window_start DATETIME NOT NULL,
                time_window_end DATETIME NOT NULL,
                total_notes INTEGER NOT NULL,
                unique_notes INTEGER NOT NULL,
                model TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at DATETIME NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    /// Upsert prepared tickets. A re-prepared ticket is queued for scoring again.
    pub async fn save_prepared(&self, tickets: &[PreparedTicket]) -> Result<usize> {
        let prepared_at = Utc::now();
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let mut saved = 0;

        for ticket in tickets {
            if ticket.issue_key.trim().is_empty() {
                warn!("skipping prepared ticket without issue key");
                continue;
            }
            let payload = serde_json::to_string(ticket).context("Failed to encode ticket")?;
            sqlx::query(
                r#"
                INSERT INTO prepared_conversations
                    (issue_key, payload, merge_context_size_tokens, prepared_at, processed)
                VALUES (?, ?, ?, ?, 0)
                ON CONFLICT(issue_key) DO UPDATE SET
                    payload = excluded.payload,
                    merge_context_size_tokens = excluded.merge_context_size_tokens,
                    prepared_at = excluded.prepared_at,
                    processed = 0
                "#,
            )
            .bind(&ticket.issue_key)
            .bind(payload)
            .bind(ticket.merge_context_size_tokens as i64)
            .bind(prepared_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to save prepared ticket {}", ticket.issue_key))?;
            saved += 1;
        }

        tx.commit().await.context("Failed to commit prepared tickets")?;
        Ok(saved)
    }

    pub async fn fetch_processed_keys(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT issue_key FROM processed_conversations")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch processed keys")?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("issue_key").map_err(Into::into))
            .collect()
    }

    /// Every prepared issue key, processed or not.
    pub async fn fetch_prepared_keys(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT issue_key FROM prepared_conversations")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch prepared keys")?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("issue_key").map_err(Into::into))
            .collect()
    }

    /// Newest `created` timestamp among prepared payloads.
    pub async fn latest_prepared_created(&self) -> Result<Option<DateTime<Utc>>> {
        let rows = sqlx::query(
            "SELECT json_extract(payload, '$.created') AS created FROM prepared_conversations",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to read prepared checkpoint")?;

        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<Option<String>, _>("created").ok().flatten())
            .filter_map(|created| parse_datetime(&created))
            .max())
    }

    /// Highest processed issue key, used as the ingest stop marker.
    pub async fn latest_processed_key(&self) -> Result<Option<String>> {
        let key: Option<String> = sqlx::query_scalar(
            "SELECT issue_key FROM processed_conversations ORDER BY issue_key DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read processed checkpoint")?;
        Ok(key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty()))
    }

    /// Unprocessed tickets in issue-key order, skipping `skip_keys`, up to `limit`.
    pub async fn fetch_prepared(
        &self,
        limit: usize,
        skip_keys: &HashSet<String>,
    ) -> Result<Vec<PreparedTicket>> {
        let mut collected = Vec::new();
        let mut offset: i64 = 0;

        while collected.len() < limit {
            let rows = sqlx::query(
                r#"
                SELECT issue_key, payload
                FROM prepared_conversations
                WHERE processed = 0
                ORDER BY issue_key ASC
                LIMIT ? OFFSET ?
                "#,
            )
            .bind(FETCH_PAGE)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch prepared tickets")?;

            if rows.is_empty() {
                break;
            }
            offset += rows.len() as i64;

            for row in rows {
                let issue_key: String = row.try_get("issue_key")?;
                let issue_key = issue_key.trim().to_string();
                if issue_key.is_empty() || skip_keys.contains(&issue_key) {
                    continue;
                }
                let payload: String = row.try_get("payload")?;
                match serde_json::from_str::<PreparedTicket>(&payload) {
                    Ok(mut ticket) => {
                        ticket.issue_key = issue_key;
                        collected.push(ticket);
                    }
                    Err(e) => warn!("prepared payload for {} is not a ticket: {}", issue_key, e),
                }
                if collected.len() >= limit {
                    break;
                }
            }
        }

        debug!("fetched {} prepared tickets", collected.len());
        Ok(collected)
    }

    pub async fn upsert_processed(&self, scored: &ScoredConversation) -> Result<()> {
        let row = scored.to_row();
        let m = &scored.metrics;
        let a = scored.assessment.clone().unwrap_or_default();
        let has_llm = scored.assessment.is_some();
        let steps = serde_json::to_string(&a.steps_extract)?;
        let scores = if a.customer_sentiment_scores.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&a.customer_sentiment_scores)?)
        };
        let resolution_ts = a.resolution_timestamp_iso.as_deref().and_then(parse_datetime);
        let non_empty = |s: String| (!s.is_empty()).then_some(s);

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO processed_conversations (
                issue_key, status, resolution, custom_field_hub,
                conversation_start, conversation_end, duration_minutes, duration_to_resolution,
                first_agent_response_minutes, avg_agent_response_minutes, avg_customer_response_minutes,
                messages_total, messages_agent, messages_customer, turns,
                agent_authors, customer_authors, initial_response_sla_5m, initial_response_sla_15m,
                agent_profanity_detected, agent_profanity_count, customer_abuse_detected, customer_abuse_count,
                llm_summary_250, conversation_rating, problem_extract, resolution_extract, steps_extract,
                resolution_timestamp_iso, resolution_message_index,
                contact_reason, contact_reason_original, contact_reason_change, reason_override_why,
                resolution_why, customer_sentiment_primary, customer_sentiment_scores,
                llm_agent_profanity_detected, llm_agent_profanity_count,
                llm_customer_abuse_detected, llm_customer_abuse_count,
                agent_score, customer_score, resolved, is_resolved, improvement_tip,
                llm_model, llm_input_tokens, llm_output_tokens, llm_cost_usd, processed_at
            ) VALUES (
                ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            )
            "#,
        )
        .bind(&scored.issue_key)
        .bind(&scored.status)
        .bind(&scored.resolution)
        .bind(&scored.hub)
        .bind(m.conversation_start)
        .bind(m.conversation_end)
        .bind(m.duration_minutes)
        .bind(scored.duration_to_resolution())
        .bind(m.first_agent_response_minutes)
        .bind(m.avg_agent_response_minutes)
        .bind(m.avg_customer_response_minutes)
        .bind(m.messages_total as i64)
        .bind(m.messages_agent as i64)
        .bind(m.messages_customer as i64)
        .bind(m.turns as i64)
        .bind(row.agent_authors)
        .bind(row.customer_authors)
        .bind(m.initial_response_sla_5m)
        .bind(m.initial_response_sla_15m)
        .bind(m.agent_profanity_count > 0)
        .bind(m.agent_profanity_count as i64)
        .bind(m.customer_abuse_count > 0)
        .bind(m.customer_abuse_count as i64)
        .bind(a.llm_summary_250.clone())
        .bind(a.conversation_rating)
        .bind(non_empty(row.problem_extract))
        .bind(a.resolution_extract.clone())
        .bind(steps)
        .bind(resolution_ts)
        .bind(a.resolution_message_index)
        .bind(a.contact_reason.clone())
        .bind(&scored.contact_reason_original)
        .bind(has_llm.then(|| a.contact_reason_change.unwrap_or(false)))
        .bind(a.reason_override_why.clone())
        .bind(a.resolution_why.clone())
        .bind(a.customer_sentiment_primary.clone())
        .bind(scores)
        .bind(a.agent_profanity_detected)
        .bind(a.agent_profanity_count)
        .bind(a.customer_abuse_detected)
        .bind(a.customer_abuse_count)
        .bind(a.agent_score)
        .bind(a.customer_score)
        .bind(a.resolved)
        .bind(a.is_resolved)
        .bind(a.improvement_tip.clone())
        .bind(non_empty(scored.model.clone()))
        .bind(scored.usage.map(|u| u.prompt as i64))
        .bind(scored.usage.map(|u| u.completion as i64))
        .bind(scored.cost_usd)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to upsert processed row {}", scored.issue_key))?;

        Ok(())
    }

    /// Improvement tips from conversations that started inside `window`, oldest first.
    pub async fn fetch_improvement_tips(&self, window: &TipWindow) -> Result<Vec<ImprovementTip>> {
        let rows = sqlx::query(
            r#"
            SELECT issue_key, improvement_tip, conversation_start
            FROM processed_conversations
            WHERE improvement_tip IS NOT NULL AND conversation_start IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch improvement tips")?;

        let mut tips = Vec::new();
        for row in rows {
            let issue_key: String = row.try_get("issue_key")?;
            let text: String = row.try_get("improvement_tip")?;
            let started: DateTime<Utc> = row.try_get("conversation_start")?;
            let (issue_key, text) = (issue_key.trim(), text.trim());
            if issue_key.is_empty() || text.is_empty() || !window.contains(started) {
                continue;
            }
            tips.push(ImprovementTip {
                issue_key: issue_key.to_string(),
                text: text.to_string(),
                conversation_start: started,
            });
        }
        tips.sort_by_key(|tip| tip.conversation_start);
        Ok(tips)
    }

    /// Store one grouping result and return its id.
    pub async fn save_tip_grouping(
        &self,
        window: &TipWindow,
        total_notes: usize,
        unique_notes: usize,
        model: &str,
        payload: &Value,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO improvement_tip_groupings
                (time_window_start, time_window_end, total_notes, unique_notes, model, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(window.start)
        .bind(window.end)
        .bind(total_notes as i64)
        .bind(unique_notes as i64)
        .bind(model)
        .bind(payload.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to save improvement tip grouping")?;

        Ok(result.last_insert_rowid())
    }

    pub async fn mark_prepared_processed(&self, issue_keys: &[String]) -> Result<()> {
        for chunk in issue_keys.chunks(MARK_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "UPDATE prepared_conversations SET processed = 1 WHERE issue_key IN (",
            );
            let mut keys = builder.separated(", ");
            for key in chunk {
                keys.push_bind(key.as_str());
            }
            keys.push_unseparated(")");

            builder
                .build()
                .execute(&self.pool)
                .await
                .context("Failed to mark prepared tickets processed")?;
        }
        Ok(())
    }
}
