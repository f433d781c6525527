//! Jira Cloud REST ingestion.
//!
//! Searches a JQL window newest-first, pages through each issue's comments, renders
//! Atlassian Document Format bodies to text and queues the result as prepared tickets.

use crate::chat::{PreparedTicket, RawComment};
use crate::entity::Role;
use crate::ingest::{estimate_merged_tokens, normalise_text};
use crate::store::Store;
use anyhow::Result;
use chrono::NaiveDate;
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_PROJECT: &str = "CC";
pub const DEFAULT_STATUS_CATEGORY: &str = "Done";
pub const DEFAULT_BATCH_SIZE: usize = 100;

const COMMENT_PAGE: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ERROR_BODY_CHARS: usize = 300;

const SYSTEM_FIELDS: &[&str] = &[
    "summary",
    "project",
    "issuetype",
    "reporter",
    "status",
    "resolution",
    "created",
    "updated",
    "duedate",
    "comment",
];

/// Prepared custom-field key and the Jira field names it may appear under.
const CUSTOM_FIELD_NAMES: &[(&str, &[&str])] = &[
    ("rental_id", &["Custom field (Rental ID)", "Rental ID"]),
    ("bike_qr_code", &["Custom field (Bike QR Code)", "Bike QR Code"]),
    ("hub", &["Custom field (Hub)", "Hub"]),
    ("refund_reason", &["Custom field (Refund Reason)", "Refund Reason"]),
    ("dock", &["Custom field (Dock)", "Dock"]),
    ("satisfaction_rating", &["Satisfaction rating"]),
    ("contact_reason", &["Custom field (Contact Reason)", "Contact Reason"]),
];

/// Issues created before this date are never pulled.
pub fn earliest_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 11, 1).unwrap_or(NaiveDate::MIN)
}

#[derive(Debug, thiserror::Error)]
pub enum JiraError {
    #[error("jira request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("jira api returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("unexpected jira response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Issue {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub is_last: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FieldInfo {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct CommentPage {
    #[serde(default)]
    comments: Vec<Value>,
}

#[derive(Clone)]
pub struct JiraClient {
    http: reqwest::Client,
    base_url: String,
    email: String,
    api_token: String,
}

impl JiraClient {
    pub fn new(
        base_url: &str,
        email: impl Into<String>,
        api_token: impl Into<String>,
    ) -> Result<Self, JiraError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            email: email.into(),
            api_token: api_token.into(),
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, JiraError> {
        let response = request
            .basic_auth(&self.email, Some(&self.api_token))
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(JiraError::Api {
                status: status.as_u16(),
                body: body.trim().chars().take(ERROR_BODY_CHARS).collect(),
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn search(
        &self,
        jql: &str,
        max_results: usize,
        fields: &[String],
        next_page_token: Option<&str>,
    ) -> Result<SearchPage, JiraError> {
        let mut payload = json!({"jql": jql, "maxResults": max_results});
        if let Some(token) = next_page_token {
            payload["nextPageToken"] = json!(token);
        }
        if !fields.is_empty() {
            payload["fields"] = json!(fields);
        }
        let url = format!("{}/rest/api/3/search/jql", self.base_url);
        self.send_json(self.http.post(url).json(&payload)).await
    }

    /// Field id -> display name for every field on the site.
    pub async fn fetch_field_names(&self) -> Result<HashMap<String, String>, JiraError> {
        let url = format!("{}/rest/api/3/field", self.base_url);
        let fields: Vec<FieldInfo> = self.send_json(self.http.get(url)).await?;
        Ok(fields
            .into_iter()
            .filter_map(|f| f.id.filter(|id| !id.is_empty()).map(|id| (id, f.name)))
            .collect())
    }

    pub async fn fetch_comments(&self, issue_key: &str) -> Result<Vec<Value>, JiraError> {
        let url = format!("{}/rest/api/3/issue/{}/comment", self.base_url, issue_key);
        let mut comments = Vec::new();
        let mut start_at = 0;
        loop {
            let request = self.http.get(&url).query(&[
                ("startAt", start_at.to_string()),
                ("maxResults", COMMENT_PAGE.to_string()),
                ("expand", "renderedBody".to_string()),
            ]);
            let page: CommentPage = self.send_json(request).await?;
            let count = page.comments.len();
            comments.extend(page.comments);
            if count < COMMENT_PAGE {
                break;
            }
            start_at += count;
        }
        Ok(comments)
    }
}

pub fn build_jql(
    project: &str,
    status_category: &str,
    start: NaiveDate,
    end: Option<NaiveDate>,
) -> String {
    let mut clauses = vec![
        format!("project = {project}"),
        format!("statusCategory = \"{status_category}\""),
        format!("created >= \"{}\"", start.format("%Y-%m-%d")),
    ];
    if let Some(end) = end {
        clauses.push(format!("created < \"{}\"", end.format("%Y-%m-%d")));
    }
    format!("{} ORDER BY created DESC", clauses.join(" AND "))
}

/// Flatten an Atlassian Document Format node to plain text.
pub fn render_adf(node: &Value) -> String {
    match node {
        Value::String(text) => text.clone(),
        Value::Array(children) => children.iter().map(render_adf).collect(),
        Value::Object(map) => {
            let node_type = map.get("type").and_then(Value::as_str).unwrap_or("");
            match node_type {
                "text" => map
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                "hardBreak" => "\n".to_string(),
                _ => {
                    let rendered = map.get("content").map(render_adf).unwrap_or_default();
                    match node_type {
                        "paragraph" | "heading" | "blockquote" | "panel" | "bulletList"
                        | "orderedList" => rendered + "\n",
                        _ => rendered,
                    }
                }
            }
        }
        _ => String::new(),
    }
}

/// Collapse a Jira field value (option, user, list, scalar) to display text.
pub fn normalise_field_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.trim().to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(normalise_field_value)
                .filter(|s| !s.is_empty())
                .collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        Value::Object(map) => {
            let named = ["value", "name", "displayName", "text"]
                .iter()
                .filter_map(|key| map.get(*key))
                .find_map(|v| match v {
                    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                });
            named.or_else(|| Some(value.to_string()))
        }
    }
}

/// Account id, else email, else display name.
pub fn account_identifier(user: Option<&Value>) -> Option<String> {
    let user = user?;
    ["accountId", "emailAddress", "displayName"]
        .iter()
        .filter_map(|key| user.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Staff accounts start with `712020` or show as `Port <name>`; portal customers are `qm:`.
pub fn classify_author(author: Option<&Value>) -> Role {
    let Some(author) = author else {
        return Role::Unknown;
    };
    let text = |key: &str| {
        author
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_lowercase()
    };
    if text("displayName").starts_with("port ") {
        return Role::Agent;
    }
    Role::from_author(&text("accountId"))
}

/// Map prepared custom-field keys to this site's field ids.
pub fn resolve_custom_field_ids(names: &HashMap<String, String>) -> BTreeMap<&'static str, String> {
    let by_name: HashMap<&str, &str> = names
        .iter()
        .map(|(id, name)| (name.trim(), id.as_str()))
        .collect();
    CUSTOM_FIELD_NAMES
        .iter()
        .filter_map(|(key, candidates)| {
            candidates
                .iter()
                .find_map(|name| by_name.get(name))
                .map(|id| (*key, id.to_string()))
        })
        .collect()
}

/// System fields followed by the resolved custom field ids, without duplicates.
pub fn field_request_list(resolved: &BTreeMap<&'static str, String>) -> Vec<String> {
    let mut seen = HashSet::new();
    SYSTEM_FIELDS
        .iter()
        .map(|f| f.to_string())
        .chain(resolved.values().cloned())
        .filter(|f| !f.is_empty() && seen.insert(f.clone()))
        .collect()
}

fn comment_text(body: Option<&Value>) -> String {
    let text = match body {
        Some(body @ Value::Object(_)) => render_adf(body),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    normalise_text(&text).trim().to_string()
}

/// Build the prepared ticket for one issue and its comments.
pub fn build_prepared_payload(
    issue: &Issue,
    comments: &[Value],
    field_lookup: &BTreeMap<&'static str, String>,
) -> PreparedTicket {
    let fields = &issue.fields;
    let text = |name: &str| fields.get(name).and_then(normalise_field_value).unwrap_or_default();
    let named = |name: &str| {
        fields
            .get(name)
            .and_then(|v| v.get("name"))
            .and_then(normalise_field_value)
            .unwrap_or_default()
    };
    let raw = |name: &str| {
        fields
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    };

    let custom_fields = field_lookup
        .iter()
        .map(|(key, id)| (key.to_string(), text(id.as_str())))
        .collect();

    let mut ordered: Vec<&Value> = comments.iter().collect();
    ordered.sort_by_key(|c| c.get("created").and_then(Value::as_str).unwrap_or(""));

    let mut merged = Vec::new();
    let prepared: Vec<RawComment> = ordered
        .into_iter()
        .enumerate()
        .map(|(idx, comment)| {
            let author = comment.get("author");
            let role = classify_author(author);
            let text = comment_text(comment.get("body"));
            if !text.is_empty() {
                merged.push(format!("{}:{}", role.hint(), text));
            }
            RawComment {
                date: comment
                    .get("created")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                author: account_identifier(author),
                role: Some(role.hint().to_string()),
                text,
                internal_note: !comment
                    .get("jsdPublic")
                    .and_then(Value::as_bool)
                    .unwrap_or(true),
                index: idx + 1,
            }
        })
        .collect();

    let merged_text = merged.join(" ").trim().to_string();
    PreparedTicket {
        issue_key: issue.key.clone(),
        user_summary: text("summary"),
        reporter: account_identifier(fields.get("reporter")).unwrap_or_default(),
        status: named("status"),
        resolution: named("resolution"),
        created: raw("created"),
        updated: raw("updated"),
        due_date: raw("duedate"),
        source_csv: None,
        custom_fields,
        comments: prepared,
        merge_context_size_tokens: estimate_merged_tokens(&merged_text),
        merged_text,
    }
}

#[derive(Debug, Clone)]
pub struct PullOptions {
    pub project: String,
    pub status_category: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub batch_size: usize,
    pub max_issues: Option<usize>,
    pub jql_override: Option<String>,
    pub force_full_refresh: bool,
    pub dry_run: bool,
    pub count_only: bool,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            project: DEFAULT_PROJECT.to_string(),
            status_category: DEFAULT_STATUS_CATEGORY.to_string(),
            start_date: None,
            end_date: None,
            batch_size: DEFAULT_BATCH_SIZE,
            max_issues: None,
            jql_override: None,
            force_full_refresh: false,
            dry_run: false,
            count_only: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullSummary {
    pub jql: String,
    pub fetched: usize,
    pub prepared: usize,
    pub saved: usize,
    pub skipped_existing: usize,
    pub failures: Vec<String>,
    pub count_only: bool,
}

impl fmt::Display for PullSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.count_only {
            return write!(f, "{} new Jira issues would be ingested", self.prepared);
        }
        write!(
            f,
            "ingested {} Jira issues ({} saved, {} fetched, {} already stored, {} failures)",
            self.prepared,
            self.saved,
            self.fetched,
            self.skipped_existing,
            self.failures.len()
        )
    }
}

/// Pull new Jira issues into the prepared table. Issues already stored are skipped, and
/// unless `force_full_refresh` the window starts at the newest stored `created` date and
/// stops at the newest processed key.
pub async fn pull_into_store(
    jira: &JiraClient,
    store: &Store,
    options: &PullOptions,
) -> Result<PullSummary> {
    let mut existing = store.fetch_prepared_keys().await?;
    let mut start = options
        .start_date
        .unwrap_or_else(earliest_start_date)
        .max(earliest_start_date());
    let mut stop_key = None;
    if !options.force_full_refresh {
        if let Some(latest) = store.latest_prepared_created().await? {
            start = start.max(latest.date_naive());
        }
        stop_key = store.latest_processed_key().await?;
    }

    let jql = match options.jql_override.as_deref().map(str::trim) {
        Some(custom) if !custom.is_empty() => custom.to_string(),
        _ => build_jql(&options.project, &options.status_category, start, options.end_date),
    };
    info!("running Jira ingest with JQL: {}", jql);

    let field_names = jira.fetch_field_names().await.unwrap_or_else(|e| {
        warn!("failed to fetch Jira field metadata: {}", e);
        HashMap::new()
    });
    let resolved = resolve_custom_field_ids(&field_names);
    let fields = field_request_list(&resolved);

    let mut summary = PullSummary {
        jql: jql.clone(),
        count_only: options.count_only,
        ..Default::default()
    };
    let mut next_page_token: Option<String> = None;

    loop {
        let batch_size = match options.max_issues {
            Some(cap) if summary.prepared >= cap => break,
            Some(cap) => options.batch_size.min(cap - summary.prepared).max(1),
            None => options.batch_size.max(1),
        };
        let page = jira
            .search(&jql, batch_size, &fields, next_page_token.as_deref())
            .await?;
        if page.issues.is_empty() {
            break;
        }
        debug!(
            "fetched {} issues (page token={})",
            page.issues.len(),
            next_page_token.as_deref().unwrap_or("initial")
        );
        summary.fetched += page.issues.len();

        let mut batch = Vec::new();
        let mut stop = false;
        for issue in &page.issues {
            if issue.key.is_empty() {
                continue;
            }
            if stop_key.as_deref() == Some(issue.key.as_str()) {
                info!("reached processed checkpoint {}; stopping ingest", issue.key);
                stop = true;
                break;
            }
            if existing.contains(&issue.key) {
                summary.skipped_existing += 1;
                continue;
            }
            existing.insert(issue.key.clone());

            if !options.count_only {
                let comments = jira.fetch_comments(&issue.key).await.unwrap_or_else(|e| {
                    summary
                        .failures
                        .push(format!("comments for {}: {}", issue.key, e));
                    Vec::new()
                });
                batch.push(build_prepared_payload(issue, &comments, &resolved));
            }
            summary.prepared += 1;
            if options.max_issues.is_some_and(|cap| summary.prepared >= cap) {
                info!("reached max issues cap");
                stop = true;
                break;
            }
        }

        if !batch.is_empty() {
            if options.dry_run {
                info!("[dry-run] would upsert {} prepared rows", batch.len());
            } else {
                summary.saved += store.save_prepared(&batch).await?;
            }
        }

        next_page_token = page.next_page_token;
        if stop || next_page_token.is_none() || page.is_last == Some(true) {
            break;
        }
    }

    for failure in &summary.failures {
        warn!("jira ingest failure: {}", failure);
    }
    info!("{}", summary);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, Query},
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use std::sync::{Arc, Mutex};

    fn adf(paragraphs: &[&str]) -> Value {
        json!({
            "type": "doc",
            "content": paragraphs
                .iter()
                .map(|p| json!({"type": "paragraph", "content": [{"type": "text", "text": p}]}))
                .collect::<Vec<_>>()
        })
    }

    #[test]
    fn jql_covers_window_and_order() {
        let start = NaiveDate::from_ymd_opt(2025, 11, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 12, 1).unwrap();
        assert_eq!(
            build_jql("CC", "Done", start, Some(end)),
            "project = CC AND statusCategory = \"Done\" AND created >= \"2025-11-01\" \
             AND created < \"2025-12-01\" ORDER BY created DESC"
        );
        assert!(build_jql("CC", "Done", start, None).ends_with("\"2025-11-01\" ORDER BY created DESC"));
    }

    #[test]
    fn adf_renders_blocks_and_breaks() {
        let doc = json!({
            "type": "doc",
            "content": [
                {"type": "paragraph", "content": [
                    {"type": "text", "text": "Hello"},
                    {"type": "hardBreak"},
                    {"type": "text", "text": "there"}
                ]},
                {"type": "bulletList", "content": [
                    {"type": "listItem", "content": [{"type": "text", "text": "one"}]}
                ]},
                {"type": "mention", "attrs": {"id": "x"}}
            ]
        });
        assert_eq!(render_adf(&doc), "Hello\nthere\none\n");
        assert_eq!(render_adf(&json!("plain")), "plain");
        assert_eq!(render_adf(&Value::Null), "");
    }

    #[test]
    fn field_values_collapse_to_text() {
        assert_eq!(normalise_field_value(&json!({"value": " Berlin "})), Some("Berlin".into()));
        assert_eq!(normalise_field_value(&json!([{"name": "a"}, null, "b"])), Some("a, b".into()));
        assert_eq!(normalise_field_value(&json!([])), None);
        assert_eq!(normalise_field_value(&json!(4)), Some("4".into()));
        assert_eq!(normalise_field_value(&json!({"rating": 5})), Some("{\"rating\":5}".into()));
        assert_eq!(normalise_field_value(&Value::Null), None);
    }

    #[test]
    fn authors_classify_by_account_and_display_name() {
        assert_eq!(classify_author(Some(&json!({"accountId": "712020:abc"}))), Role::Agent);
        assert_eq!(
            classify_author(Some(&json!({"accountId": "5b10", "displayName": "Port Anna"}))),
            Role::Agent
        );
        assert_eq!(classify_author(Some(&json!({"accountId": "qm:77"}))), Role::Customer);
        assert_eq!(classify_author(Some(&json!({"displayName": "Someone"}))), Role::Unknown);
        assert_eq!(classify_author(None), Role::Unknown);

        let user = json!({"accountId": " ", "emailAddress": "a@b.c", "displayName": "A"});
        assert_eq!(account_identifier(Some(&user)).as_deref(), Some("a@b.c"));
    }

    #[test]
    fn custom_fields_resolve_through_aliases() {
        let names: HashMap<String, String> = [
            ("customfield_1", "Hub"),
            ("customfield_2", "Custom field (Contact Reason)"),
            ("summary", "Summary"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let resolved = resolve_custom_field_ids(&names);
        assert_eq!(resolved.get("hub").map(String::as_str), Some("customfield_1"));
        assert_eq!(resolved.get("contact_reason").map(String::as_str), Some("customfield_2"));
        assert!(!resolved.contains_key("dock"));

        let fields = field_request_list(&resolved);
        assert_eq!(fields.len(), SYSTEM_FIELDS.len() + 2);
        assert_eq!(fields[0], "summary");
    }

    #[test]
    fn prepared_payload_orders_and_merges_comments() {
        let issue: Issue = serde_json::from_value(json!({
            "key": "CC-7",
            "fields": {
                "summary": "Bike locked",
                "reporter": {"accountId": "qm:1"},
                "status": {"name": "Closed"},
                "resolution": null,
                "created": "2025-11-03T10:00:00.000+0000",
                "customfield_1": {"value": "Berlin"}
            }
        }))
        .unwrap();
        let comments = vec![
            json!({
                "created": "2025-11-03T10:05:00.000+0000",
                "author": {"accountId": "712020:9"},
                "body": adf(&["See https://x.y/z"]),
                "jsdPublic": false
            }),
            json!({
                "created": "2025-11-03T10:01:00.000+0000",
                "author": {"accountId": "qm:1"},
                "body": "photo.png attached"
            }),
        ];
        let lookup: BTreeMap<&'static str, String> = [("hub", "customfield_1".to_string())].into();

        let ticket = build_prepared_payload(&issue, &comments, &lookup);
        assert_eq!(ticket.issue_key, "CC-7");
        assert_eq!(ticket.status, "Closed");
        assert_eq!(ticket.resolution, "");
        assert_eq!(ticket.reporter, "qm:1");
        assert_eq!(ticket.custom_field("hub"), "Berlin");
        assert_eq!(ticket.comments[0].text, "[image file] attached");
        assert_eq!(ticket.comments[0].role.as_deref(), Some("~C"));
        assert_eq!(ticket.comments[1].index, 2);
        assert!(ticket.comments[1].internal_note);
        assert_eq!(ticket.merged_text, "~C:[image file] attached ~A:See [link]");
        assert_eq!(ticket.merge_context_size_tokens, estimate_merged_tokens(&ticket.merged_text));
    }

    async fn mock_jira(searches: Arc<Mutex<Vec<Value>>>) -> String {
        let router = Router::new()
            .route(
                "/rest/api/3/field",
                get(|| async { Json(json!([{"id": "customfield_1", "name": "Hub"}, {"name": "no id"}])) }),
            )
            .route(
                "/rest/api/3/search/jql",
                post(move |Json(body): Json<Value>| {
                    let searches = searches.clone();
                    async move {
                        let token = body.get("nextPageToken").cloned();
                        searches.lock().unwrap().push(body);
                        let issue = |key: &str| {
                            json!({"key": key, "fields": {
                                "status": {"name": "Done"},
                                "created": "2025-11-05T09:00:00.000+0000",
                                "customfield_1": "Hub A"
                            }})
                        };
                        if token.is_none() {
                            Json(json!({"issues": [issue("CC-3"), issue("CC-2")], "nextPageToken": "p2"}))
                        } else {
                            Json(json!({"issues": [issue("CC-1")], "isLast": true}))
                        }
                    }
                }),
            )
            .route(
                "/rest/api/3/issue/:key/comment",
                get(|Path(key): Path<String>, Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(q.get("startAt").map(String::as_str), Some("0"));
                    if key == "CC-1" {
                        return (StatusCode::NOT_FOUND, Json(json!({})));
                    }
                    (
                        StatusCode::OK,
                        Json(json!({"comments": [{
                            "created": "2025-11-05T09:01:00.000+0000",
                            "author": {"accountId": "qm:5"},
                            "body": adf(&["my bike"])
                        }]})),
                    )
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn pull_pages_skips_existing_and_saves_new_issues() {
        let searches = Arc::new(Mutex::new(Vec::new()));
        let base = mock_jira(searches.clone()).await;
        let jira = JiraClient::new(&base, "me@example.com", "token").unwrap();
        let store = Store::in_memory().await.unwrap();
        store.init().await.unwrap();
        store
            .save_prepared(&[PreparedTicket {
                issue_key: "CC-2".into(),
                created: "2025-11-02T08:00:00.000+0000".into(),
                ..Default::default()
            }])
            .await
            .unwrap();

        let summary = pull_into_store(&jira, &store, &PullOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.fetched, 3);
        assert_eq!(summary.skipped_existing, 1);
        assert_eq!(summary.prepared, 2);
        assert_eq!(summary.saved, 2);
        assert_eq!(summary.failures.len(), 1);
        assert!(summary.jql.contains("created >= \"2025-11-02\""));

        let searches = searches.lock().unwrap();
        assert_eq!(searches.len(), 2);
        assert_eq!(searches[1]["nextPageToken"], "p2");
        assert!(searches[0]["fields"]
            .as_array()
            .unwrap()
            .contains(&json!("customfield_1")));
        drop(searches);

        let tickets = store.fetch_prepared(10, &HashSet::new()).await.unwrap();
        let keys: Vec<&str> = tickets.iter().map(|t| t.issue_key.as_str()).collect();
        assert_eq!(keys, vec!["CC-1", "CC-2", "CC-3"]);
        let cc3 = &tickets[2];
        assert_eq!(cc3.custom_field("hub"), "Hub A");
        assert_eq!(cc3.merged_text, "~C:my bike");
        assert!(tickets[0].comments.is_empty());
    }

    #[tokio::test]
    async fn count_only_and_caps_do_not_write() {
        let searches = Arc::new(Mutex::new(Vec::new()));
        let base = mock_jira(searches.clone()).await;
        let jira = JiraClient::new(&base, "me", "t").unwrap();
        let store = Store::in_memory().await.unwrap();
        store.init().await.unwrap();

        let options = PullOptions {
            count_only: true,
            max_issues: Some(1),
            ..Default::default()
        };
        let summary = pull_into_store(&jira, &store, &options).await.unwrap();
        assert_eq!(summary.prepared, 1);
        assert_eq!(summary.saved, 0);
        assert_eq!(summary.to_string(), "1 new Jira issues would be ingested");
        assert_eq!(searches.lock().unwrap()[0]["maxResults"], 1);
        assert!(store.fetch_prepared(10, &HashSet::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn api_errors_keep_status_and_body() {
        let router = Router::new().route(
            "/rest/api/3/field",
            get(|| async { (StatusCode::UNAUTHORIZED, "Unauthorized") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let jira = JiraClient::new(&format!("http://{addr}"), "me", "bad").unwrap();
        match jira.fetch_field_names().await.unwrap_err() {
            JiraError::Api { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "Unauthorized");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
