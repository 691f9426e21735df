//! Record codec: one work item <-> one Markdown file.
//!
//! ```text
//! ---
//! id: APP-TSK-0007
//! type: Task
//! title: Wire login
//! state: Ready
//! ...any other header keys, preserved verbatim...
//! ---
//!
//! # Context
//!
//! free text
//!
//! # Worklog
//!
//! 2026-03-01T09:30:00.125Z [agent=codex] Created item.
//! ```
//!
//! Decoding is lenient about section order and strict about the `id`,
//! `type` and `state` header keys. Section bodies may use `##` and deeper
//! headings; a level-1 heading always starts a new section, except inside
//! a fenced code block.

use crate::error::{Result, StoreError};
use crate::layout;
use crate::model::item::{
    Kind, STANDARD_SECTIONS, WORKLOG_SECTION, WorkItem, WorklogEntry, default_area,
    default_priority,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Error raised while encoding or decoding a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecError {
    /// One-based line in the record text, when known.
    pub line: Option<usize>,
    pub message: String,
}

impl CodecError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            line: None,
            message: message.into(),
        }
    }

    fn at(line: usize, message: impl Into<String>) -> Self {
        Self {
            line: Some(line),
            message: message.into(),
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {line}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for CodecError {}

/// Header keys as they appear in the YAML front matter.
#[derive(Debug, Serialize, Deserialize)]
struct RecordHeader {
    id: String,
    #[serde(
        rename = "type",
        alias = "kind",
        serialize_with = "ser_kind",
        deserialize_with = "de_kind"
    )]
    kind: Kind,
    #[serde(default)]
    title: String,
    state: String,
    #[serde(default = "default_priority")]
    priority: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<String>,
    #[serde(default = "default_area")]
    area: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iteration: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "timestamp")]
    created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "timestamp")]
    updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    owner: Option<String>,
    #[serde(default)]
    links: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    decisions: Vec<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

fn ser_kind<S: Serializer>(kind: &Kind, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(kind.as_str())
}

fn de_kind<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Kind, D::Error> {
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

/// Header timestamps: written as RFC 3339 UTC, read as RFC 3339 or a bare
/// `YYYY-MM-DD` date.
mod timestamp {
    use super::{DateTime, Utc, format_timestamp, parse_timestamp};
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_str(&format_timestamp(*ts)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|text| {
            parse_timestamp(&text)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{text}'")))
        })
        .transpose()
    }
}

/// Format a timestamp the way records store it (UTC, lossless sub-seconds).
#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse RFC 3339, `YYYY-MM-DD HH:MM` or `YYYY-MM-DD` as UTC.
#[must_use]
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

fn heading_name(line: &str) -> Option<&str> {
    if line == "#" {
        Some("")
    } else {
        line.strip_prefix("# ").map(str::trim)
    }
}

/// Check that `body` can be stored as a section body.
///
/// # Errors
///
/// Returns a reason when the body contains a level-1 heading outside a
/// code fence or leaves a code fence open.
pub fn validate_section_body(body: &str) -> std::result::Result<(), String> {
    let mut in_fence = false;
    for (idx, line) in body.lines().enumerate() {
        if is_fence(line) {
            in_fence = !in_fence;
        } else if !in_fence && heading_name(line).is_some() {
            return Err(format!(
                "line {} is a level-1 heading; use '##' inside sections",
                idx + 1
            ));
        }
    }
    if in_fence {
        return Err("unterminated code fence".to_string());
    }
    Ok(())
}

/// Check that `agent` can be written into a worklog line.
///
/// # Errors
///
/// Returns a reason when the name is empty or contains `]` or a line break.
pub fn validate_agent(agent: &str) -> std::result::Result<(), String> {
    if agent.trim().is_empty() {
        return Err("agent name is empty".to_string());
    }
    if agent.contains([']', '\n', '\r']) {
        return Err("agent name must not contain ']' or line breaks".to_string());
    }
    Ok(())
}

/// Strip leading and trailing blank lines from a section body.
#[must_use]
pub fn normalize_body(body: &str) -> String {
    let lines: Vec<&str> = body.lines().collect();
    let start = lines.iter().position(|l| !l.trim().is_empty());
    let end = lines.iter().rposition(|l| !l.trim().is_empty());
    match (start, end) {
        (Some(start), Some(end)) => lines[start..=end].join("\n"),
        _ => String::new(),
    }
}

fn escape_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for c in message.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_message(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Render one worklog entry as a single line.
#[must_use]
pub fn format_worklog_line(entry: &WorklogEntry) -> String {
    format!(
        "{} [agent={}] {}",
        format_timestamp(entry.timestamp),
        entry.agent,
        escape_message(&entry.message)
    )
}

fn parse_worklog_line(line: &str) -> Option<WorklogEntry> {
    let (ts, rest) = line.split_once(" [agent=")?;
    let timestamp = parse_timestamp(ts)?;
    let (agent, message) = rest.split_once(']')?;
    if agent.is_empty() {
        return None;
    }
    let message = message.strip_prefix(' ').unwrap_or(message);
    Some(WorklogEntry {
        timestamp,
        agent: agent.to_string(),
        message: unescape_message(message),
    })
}

fn flush_section(current: Option<(String, Vec<&str>)>, sections: &mut BTreeMap<String, String>) {
    if let Some((name, body)) = current {
        sections.insert(name, normalize_body(&body.join("\n")));
    }
}

fn parse_worklog(lines: &[(usize, &str)]) -> std::result::Result<Vec<WorklogEntry>, CodecError> {
    let mut entries: Vec<WorklogEntry> = Vec::new();
    for &(line_no, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(entry) = parse_worklog_line(line) {
            entries.push(entry);
        } else if let Some(last) = entries.last_mut() {
            // Hand-wrapped entry.
            last.message.push('\n');
            last.message.push_str(line.trim_end());
        } else {
            return Err(CodecError::at(
                line_no,
                format!("worklog line is not '<timestamp> [agent=<name>] <message>': {line}"),
            ));
        }
    }
    Ok(entries)
}

/// Serialize a work item to record text.
///
/// # Errors
///
/// Fails when a section name or body, or a worklog agent, cannot be
/// represented without changing its meaning on the next decode.
pub fn encode(item: &WorkItem) -> std::result::Result<String, CodecError> {
    let header = RecordHeader {
        id: item.id.clone(),
        kind: item.kind,
        title: item.title.clone(),
        state: item.state.clone(),
        priority: item.priority.clone(),
        parent: item.parent.clone(),
        area: item.area.clone(),
        iteration: item.iteration.clone(),
        tags: item.tags.clone(),
        created: item.created,
        updated: item.updated,
        owner: item.owner.clone(),
        links: item.links.clone(),
        decisions: item.decisions.clone(),
        extra: item.extra.clone(),
    };
    let yaml = serde_yaml::to_string(&header)
        .map_err(|e| CodecError::new(format!("cannot serialize header: {e}")))?;

    let mut out = String::with_capacity(yaml.len() + 512);
    out.push_str("---\n");
    out.push_str(&yaml);
    out.push_str("---\n\n");

    let standard = STANDARD_SECTIONS
        .iter()
        .filter_map(|name| item.sections.get_key_value(*name));
    let custom = item
        .sections
        .iter()
        .filter(|(name, _)| !STANDARD_SECTIONS.contains(&name.as_str()));
    for (name, body) in standard.chain(custom) {
        if name.is_empty() || name.trim() != name.as_str() || name.contains(['\n', '\r']) {
            return Err(CodecError::new(format!("invalid section name '{name}'")));
        }
        if name == WORKLOG_SECTION {
            return Err(CodecError::new("worklog cannot be stored as a plain section"));
        }
        validate_section_body(body)
            .map_err(|reason| CodecError::new(format!("section '{name}': {reason}")))?;
        out.push_str("# ");
        out.push_str(name);
        out.push_str("\n\n");
        let body = normalize_body(body);
        if !body.is_empty() {
            out.push_str(&body);
            out.push_str("\n\n");
        }
    }

    out.push_str("# ");
    out.push_str(WORKLOG_SECTION);
    out.push_str("\n\n");
    for entry in &item.worklog {
        validate_agent(&entry.agent)
            .map_err(|reason| CodecError::new(format!("worklog entry: {reason}")))?;
        out.push_str(&format_worklog_line(entry));
        out.push('\n');
    }
    Ok(out)
}

/// Parse record text into a work item.
///
/// # Errors
///
/// Fails on a missing or malformed front matter block, a missing `id`,
/// `type` or `state` key, text outside any section, a duplicated section,
/// or an unparseable worklog line.
pub fn decode(text: &str) -> std::result::Result<WorkItem, CodecError> {
    let text = text.trim_start_matches('\u{feff}').replace("\r\n", "\n");
    let lines: Vec<&str> = text.split('\n').collect();

    if lines.first().map(|l| l.trim_end()) != Some("---") {
        return Err(CodecError::at(1, "record must start with a '---' header line"));
    }
    let header_end = lines
        .iter()
        .skip(1)
        .position(|l| l.trim_end() == "---")
        .map(|idx| idx + 1)
        .ok_or_else(|| CodecError::new("header block is not closed with '---'"))?;

    let yaml = lines[1..header_end].join("\n");
    let header: RecordHeader = serde_yaml::from_str(&yaml).map_err(|e| CodecError {
        line: e.location().map(|loc| loc.line() + 1),
        message: format!("invalid header: {e}"),
    })?;

    let mut sections: BTreeMap<String, String> = BTreeMap::new();
    let mut worklog_lines: Option<Vec<(usize, &str)>> = None;
    let mut current: Option<(String, Vec<&str>)> = None;
    let mut in_fence = false;

    for (idx, &line) in lines.iter().enumerate().skip(header_end + 1) {
        let line_no = idx + 1;
        let heading = if in_fence { None } else { heading_name(line) };
        if let Some(name) = heading {
            if name.is_empty() {
                return Err(CodecError::at(line_no, "section heading without a name"));
            }
            let duplicate = sections.contains_key(name)
                || current.as_ref().is_some_and(|(n, _)| n == name)
                || (name == WORKLOG_SECTION && worklog_lines.is_some());
            if duplicate {
                return Err(CodecError::at(line_no, format!("duplicate section '{name}'")));
            }
            flush_section(current.take(), &mut sections);
            if name == WORKLOG_SECTION {
                worklog_lines = Some(Vec::new());
            } else {
                current = Some((name.to_string(), Vec::new()));
            }
            continue;
        }

        if is_fence(line) {
            in_fence = !in_fence;
        }
        if let Some((_, body)) = current.as_mut() {
            body.push(line);
        } else if let Some(log) = worklog_lines.as_mut() {
            log.push((line_no, line));
        } else if !line.trim().is_empty() {
            return Err(CodecError::at(line_no, "text outside of any section"));
        }
    }
    flush_section(current.take(), &mut sections);

    let worklog = parse_worklog(worklog_lines.as_deref().unwrap_or_default())?;

    Ok(WorkItem {
        id: header.id,
        kind: header.kind,
        title: header.title,
        state: header.state,
        priority: header.priority,
        parent: header.parent,
        area: header.area,
        iteration: header.iteration,
        tags: header.tags,
        created: header.created,
        updated: header.updated,
        owner: header.owner,
        links: header.links,
        decisions: header.decisions,
        extra: header.extra,
        sections,
        worklog,
    })
}

/// Read and decode the record at `path`.
///
/// # Errors
///
/// Returns [`StoreError::Io`] when the file cannot be read and
/// [`StoreError::ParseError`] when it does not decode.
pub fn read_record(path: &Path) -> Result<WorkItem> {
    let text = std::fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
    decode(&text).map_err(|e| StoreError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Encode `item` and atomically replace the record at `path`.
///
/// # Errors
///
/// Returns [`StoreError::InvalidSection`] when the item cannot be encoded
/// and [`StoreError::Io`] when the write fails.
pub fn write_record(path: &Path, item: &WorkItem) -> Result<()> {
    let text = encode(item).map_err(|e| StoreError::InvalidSection {
        item_id: item.id.clone(),
        section: "record".to_string(),
        reason: e.to_string(),
    })?;
    layout::write_atomic(path, text.as_bytes())
}
