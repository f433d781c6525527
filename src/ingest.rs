//! Jira CSV export → prepared JSONL tickets.
//!
//! Jira exports repeat the `Comments` column once per comment and may duplicate
//! `Custom field (Contact Reason)`. Each comment cell looks like `<date>;<author>;<text>`.

use crate::chat::{parse_datetime, PreparedTicket, RawComment};
use crate::entity::Role;
use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{info, warn};

pub const DEFAULT_MAX_MERGED_TOKENS: usize = 5000;

const ISSUE_KEY_HEADER: &str = "Issue key";
const COMMENTS_HEADER: &str = "Comments";
const CONTACT_REASON_HEADER: &str = "Custom field (Contact Reason)";

const KEEP_FIELDS: &[(&str, &str)] = &[
    ("Issue key", "issue_key"),
    ("Summary", "user_summary"),
    ("Reporter", "reporter"),
    ("Status", "status"),
    ("Resolution", "resolution"),
    ("Created", "created"),
    ("Updated", "updated"),
    ("Due date", "due_date"),
];

const CUSTOM_FIELDS: &[(&str, &str)] = &[
    ("Custom field (Hub)", "hub"),
    ("Custom field (Refund Reason)", "refund_reason"),
    ("Custom field (Dock)", "dock"),
    ("Satisfaction rating", "satisfaction_rating"),
];

/// Formats seen in Jira exports, tried after ISO-8601.
const JIRA_DATE_FORMATS: &[&str] = &[
    "%d/%b/%y %I:%M %p",
    "%d/%b/%Y %I:%M %p",
    "%d/%b/%y %H:%M",
    "%d/%b/%Y %H:%M",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %H:%M",
    "%m/%d/%y %H:%M",
    "%Y/%m/%d %H:%M",
];

static JIRA_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!([^!|\n]+)(?:\|[^!]*)?!").expect("static regex"));
static IMAGE_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[\w\-.]+\.(?:png|jpe?g|gif|bmp|tiff|svg)\b").expect("static regex")
});
static VIDEO_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[\w\-.]+\.(?:mp4|mov|avi|wmv|mkv|webm)\b").expect("static regex")
});
static LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+").expect("static regex"));
static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\w+|[^\w\s]").expect("static regex"));

/// Trim a CSV cell; spreadsheet-style null markers become empty.
pub fn clean_cell(value: &str) -> String {
    let text = value.trim();
    match text.to_ascii_lowercase().as_str() {
        "nan" | "none" | "null" => String::new(),
        _ => text.to_string(),
    }
}

/// Parse a comment date into an ISO string, or `None` when nothing matches.
pub fn parse_jira_date(value: &str) -> Option<String> {
    let text = value.trim();
    if text.is_empty() {
        return None;
    }
    if let Some(ts) = parse_datetime(text) {
        return Some(ts.format("%Y-%m-%dT%H:%M:%S").to_string());
    }
    JIRA_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.format("%Y-%m-%dT%H:%M:%S").to_string())
}

/// Replace inline media and hyperlinks with short placeholder tokens.
pub fn normalise_text(text: &str) -> String {
    let text = JIRA_IMAGE.replace_all(text, "[image file]");
    let text = IMAGE_FILE.replace_all(&text, "[image file]");
    let text = VIDEO_FILE.replace_all(&text, "[video file]");
    LINK.replace_all(&text, "[link]").into_owned()
}

pub fn is_internal_note(text: &str) -> bool {
    (text.contains("----") && text.contains("*Note:")) || text.trim_start().starts_with("[~accountid:")
}

/// Split `date;author;text`. Anything that is not three parts is treated as bare text.
pub fn parse_comment(raw: &str) -> RawComment {
    let raw = raw.trim();
    let parts: Vec<&str> = raw.splitn(3, ';').collect();
    let (date, author, text) = match parts.as_slice() {
        [date, author, text] => (
            parse_jira_date(date),
            Some(author.trim().to_string()).filter(|a| !a.is_empty()),
            text.trim(),
        ),
        _ => (None, None, raw),
    };

    let internal_note = is_internal_note(text);
    let role = Role::from_author(author.as_deref().unwrap_or(""));

    RawComment {
        date,
        author,
        role: Some(role.hint().to_string()),
        text: normalise_text(text),
        internal_note,
        index: 0,
    }
}

/// Rough token count: words plus individual punctuation marks.
pub fn estimate_merged_tokens(text: &str) -> usize {
    TOKEN.find_iter(text).count()
}

#[derive(Debug, Clone)]
struct ExportLayout {
    source_name: String,
    keep: Vec<(usize, &'static str)>,
    custom: Vec<(usize, &'static str)>,
    comments: Vec<usize>,
    contact_reasons: Vec<usize>,
    issue_key: Option<usize>,
}

impl ExportLayout {
    fn from_headers(source_name: String, headers: &csv::StringRecord) -> Self {
        let position = |name: &str| headers.iter().position(|h| h.trim() == name);
        let is_repeat = |header: &str, base: &str| {
            header == base
                || header
                    .strip_prefix(base)
                    .and_then(|rest| rest.strip_prefix('.'))
                    .is_some_and(|n| n.chars().all(|c| c.is_ascii_digit()))
        };

        Self {
            source_name,
            keep: KEEP_FIELDS
                .iter()
                .filter_map(|(src, dst)| position(*src).map(|idx| (idx, *dst)))
                .collect(),
            custom: CUSTOM_FIELDS
                .iter()
                .filter_map(|(src, dst)| position(*src).map(|idx| (idx, *dst)))
                .collect(),
            comments: headers
                .iter()
                .enumerate()
                .filter(|(_, h)| is_repeat(h.trim(), COMMENTS_HEADER))
                .map(|(idx, _)| idx)
                .collect(),
            contact_reasons: headers
                .iter()
                .enumerate()
                .filter(|(_, h)| is_repeat(h.trim(), CONTACT_REASON_HEADER))
                .map(|(idx, _)| idx)
                .collect(),
            issue_key: position(ISSUE_KEY_HEADER),
        }
    }
}

#[derive(Debug, Clone)]
struct ExportRow {
    layout: usize,
    record: csv::StringRecord,
}

impl ExportRow {
    fn cell(&self, idx: usize) -> String {
        clean_cell(self.record.get(idx).unwrap_or(""))
    }
}

/// All rows from one or more exports, each remembering the header layout it came from.
#[derive(Debug, Default)]
pub struct LoadedExports {
    layouts: Vec<ExportLayout>,
    rows: Vec<ExportRow>,
    pub per_file_counts: BTreeMap<String, usize>,
}

impl LoadedExports {
    pub fn source_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn comment_columns(&self) -> usize {
        self.layouts.iter().map(|l| l.comments.len()).max().unwrap_or(0)
    }

    pub fn contact_reason_columns(&self) -> usize {
        self.layouts
            .iter()
            .map(|l| l.contact_reasons.len())
            .max()
            .unwrap_or(0)
    }
}

/// Read every export that exists; missing or duplicate paths are skipped with a warning.
pub fn load_exports(inputs: &[PathBuf]) -> Result<LoadedExports> {
    let mut seen = HashSet::new();
    let mut loaded = LoadedExports::default();

    for path in inputs {
        if !path.exists() {
            warn!("input CSV not found, skipping: {}", path.display());
            continue;
        }
        if !seen.insert(path.clone()) {
            continue;
        }

        let mut reader = match csv::ReaderBuilder::new().flexible(true).from_path(path) {
            Ok(reader) => reader,
            Err(e) => {
                warn!("failed to read {}: {}", path.display(), e);
                continue;
            }
        };
        let headers = reader
            .headers()
            .with_context(|| format!("Failed to read headers of {}", path.display()))?
            .clone();
        let source_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let layout = loaded.layouts.len();
        loaded
            .layouts
            .push(ExportLayout::from_headers(source_name.clone(), &headers));

        let mut count = 0;
        for record in reader.records() {
            let record =
                record.with_context(|| format!("Malformed CSV row in {}", path.display()))?;
            loaded.rows.push(ExportRow { layout, record });
            count += 1;
        }
        *loaded.per_file_counts.entry(source_name).or_default() += count;
    }

    if loaded.layouts.is_empty() {
        bail!("no input CSV files could be read");
    }
    Ok(loaded)
}

fn build_ticket(layout: &ExportLayout, row: &ExportRow) -> PreparedTicket {
    let mut ticket = PreparedTicket {
        source_csv: Some(layout.source_name.clone()),
        ..Default::default()
    };
    for (idx, dst) in &layout.keep {
        let value = row.cell(*idx);
        match *dst {
            "issue_key" => ticket.issue_key = value,
            "user_summary" => ticket.user_summary = value,
            "reporter" => ticket.reporter = value,
            "status" => ticket.status = value,
            "resolution" => ticket.resolution = value,
            "created" => ticket.created = value,
            "updated" => ticket.updated = value,
            "due_date" => ticket.due_date = value,
            _ => {}
        }
    }

    for (idx, dst) in &layout.custom {
        ticket.custom_fields.insert(dst.to_string(), row.cell(*idx));
    }
    if !layout.contact_reasons.is_empty() {
        let reason = layout
            .contact_reasons
            .iter()
            .map(|idx| row.cell(*idx))
            .find(|v| !v.is_empty())
            .unwrap_or_default();
        ticket.custom_fields.insert("contact_reason".to_string(), reason);
    }

    let mut merged = Vec::new();
    for idx in &layout.comments {
        let value = row.cell(*idx);
        if value.is_empty() {
            continue;
        }
        let mut comment = parse_comment(&value);
        comment.index = ticket.comments.len() + 1;
        merged.push(format!(
            "{}:{}",
            comment.role.as_deref().unwrap_or(Role::Unknown.hint()),
            comment.text
        ));
        ticket.comments.push(comment);
    }
    ticket.merged_text = merged.join(" ");
    ticket.merge_context_size_tokens = estimate_merged_tokens(&ticket.merged_text);
    ticket
}

/// Outcome of turning loaded exports into tickets.
#[derive(Debug, Default)]
pub struct PreparedBatch {
    pub tickets: Vec<PreparedTicket>,
    pub skipped_token_limit: usize,
}

/// Sort by issue key (descending, stable), sample, and drop tickets over the token cap.
pub fn prepare_tickets(
    exports: &LoadedExports,
    sample_issues: Option<usize>,
    max_merged_tokens: Option<usize>,
) -> PreparedBatch {
    let issue_key = |row: &ExportRow| {
        exports.layouts[row.layout]
            .issue_key
            .map(|idx| row.cell(idx))
            .unwrap_or_default()
    };
    let mut order: Vec<&ExportRow> = exports.rows.iter().collect();
    order.sort_by_cached_key(|row| std::cmp::Reverse(issue_key(*row)));
    if let Some(limit) = sample_issues {
        order.truncate(limit);
    }

    let mut batch = PreparedBatch::default();
    for row in order {
        let ticket = build_ticket(&exports.layouts[row.layout], row);
        if max_merged_tokens.is_some_and(|cap| ticket.merge_context_size_tokens > cap) {
            batch.skipped_token_limit += 1;
            continue;
        }
        batch.tickets.push(ticket);
    }
    batch
}

#[derive(Debug, Clone)]
pub struct PrepareOptions {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub append: bool,
    pub sample_issues: Option<usize>,
    pub max_merged_tokens: Option<usize>,
}

#[derive(Debug, Default)]
pub struct PrepareSummary {
    pub written: usize,
    pub skipped_token_limit: usize,
    pub source_rows: usize,
    pub per_file_counts: BTreeMap<String, usize>,
    pub comment_columns: usize,
    pub contact_reason_columns: usize,
}

pub fn write_jsonl(path: &Path, tickets: &[PreparedTicket], append: bool) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create output directory")?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for ticket in tickets {
        serde_json::to_writer(&mut out, ticket)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

pub fn prepare_exports(options: &PrepareOptions) -> Result<PrepareSummary> {
    let exports = load_exports(&options.inputs)?;
    let batch = prepare_tickets(&exports, options.sample_issues, options.max_merged_tokens);
    write_jsonl(&options.output, &batch.tickets, options.append)?;

    let summary = PrepareSummary {
        written: batch.tickets.len(),
        skipped_token_limit: batch.skipped_token_limit,
        source_rows: exports.source_rows(),
        per_file_counts: exports.per_file_counts.clone(),
        comment_columns: exports.comment_columns(),
        contact_reason_columns: exports.contact_reason_columns(),
    };
    info!(
        output = %options.output.display(),
        written = summary.written,
        source_rows = summary.source_rows,
        skipped_over_cap = summary.skipped_token_limit,
        mode = if options.append { "append" } else { "overwrite" },
        "prepared Jira export"
    );
    Ok(summary)
}
