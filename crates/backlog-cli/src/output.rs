//! Shared output layer: pretty or text for people and pipes, JSON for agents.
//!
//! # Output mode resolution
//!
//! Precedence (highest wins):
//! 1. `--format`
//! 2. `--json`
//! 3. `BACKLOG_FORMAT` env var → `pretty` | `text` | `json`
//! 4. `output` in the user config
//! 5. Default: pretty if stdout is a TTY, text if piped.
//!
//! Warnings from the store go to stderr in pretty/text mode and into the
//! payload's `warnings` array in JSON mode.

use backlog_core::{StoreError, config};
use clap::ValueEnum;
use serde::Serialize;
use std::io::{self, Write};

use crate::agent::AgentResolutionError;

/// Shared width for human pretty separators.
pub const PRETTY_RULE_WIDTH: usize = 72;

/// Write a horizontal separator used by pretty human output.
pub fn pretty_rule(w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, "{:-<width$}", "", width = PRETTY_RULE_WIDTH)
}

/// Write a section heading followed by a separator.
pub fn pretty_section(w: &mut dyn Write, heading: &str) -> io::Result<()> {
    writeln!(w, "{heading}")?;
    pretty_rule(w)
}

/// Render a left-aligned key/value line in human output.
pub fn pretty_kv(w: &mut dyn Write, key: &str, value: impl AsRef<str>) -> io::Result<()> {
    writeln!(w, "{:<12} {}", format!("{key}:"), value.as_ref())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputMode {
    /// Human-optimized output (sections, visual framing).
    Pretty,
    /// Plain rows for agents and pipes.
    Text,
    /// Machine-readable JSON.
    Json,
}

impl OutputMode {
    pub const fn is_json(self) -> bool {
        matches!(self, Self::Json)
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "pretty" => Some(Self::Pretty),
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Resolve the output mode from flags, environment, user config and TTY.
pub fn resolve_output_mode(
    format_flag: Option<OutputMode>,
    json_flag: bool,
    user_output: Option<&str>,
) -> OutputMode {
    if let Some(mode) = format_flag {
        return mode;
    }
    OutputMode::from_name(&config::resolve_output(json_flag, user_output))
        .unwrap_or(OutputMode::Text)
}

/// A non-fatal finding attached to a command result.
#[derive(Debug, Clone, Serialize)]
pub struct WarningView {
    pub code: &'static str,
    pub message: String,
}

impl From<&StoreError> for WarningView {
    fn from(err: &StoreError) -> Self {
        Self {
            code: err.code().code(),
            message: err.to_string(),
        }
    }
}

pub fn warning_views(warnings: &[StoreError]) -> Vec<WarningView> {
    warnings.iter().map(WarningView::from).collect()
}

/// Print warnings to stderr unless they travel inside a JSON payload.
pub fn render_warnings(mode: OutputMode, warnings: &[WarningView]) -> io::Result<()> {
    if mode.is_json() || warnings.is_empty() {
        return Ok(());
    }
    let stderr = io::stderr();
    let mut err = stderr.lock();
    for warning in warnings {
        writeln!(err, "warning[{}]: {}", warning.code, warning.message)?;
    }
    Ok(())
}

/// A structured error with optional suggestion and error code.
#[derive(Debug, Serialize)]
pub struct CliError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Machine-readable error code (`E####` for store errors).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl CliError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            suggestion: None,
            error_code: None,
        }
    }

    /// Classify an error returned by a command handler.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(store) = err.downcast_ref::<StoreError>() {
            return Self::from(store);
        }
        if let Some(agent) = err.downcast_ref::<AgentResolutionError>() {
            return Self {
                message: agent.message.clone(),
                suggestion: Some("Set --agent, BACKLOG_AGENT, or AGENT".to_string()),
                error_code: Some(agent.code.to_string()),
            };
        }
        Self::new(format!("{err:#}"))
    }
}

impl From<&StoreError> for CliError {
    fn from(err: &StoreError) -> Self {
        Self {
            message: err.to_string(),
            suggestion: err.hint().map(str::to_string),
            error_code: Some(err.code().code().to_string()),
        }
    }
}

/// Render a serializable value to stdout in the requested format.
///
/// JSON mode serializes `value`; pretty and text mode call `human_fn`.
pub fn render<T: Serialize>(
    mode: OutputMode,
    value: &T,
    human_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
) -> anyhow::Result<()> {
    render_mode(mode, value, human_fn, |_, _| Ok(()), false)
}

/// Render with distinct text and pretty renderers.
pub fn render_split<T: Serialize>(
    mode: OutputMode,
    value: &T,
    text_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
    pretty_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
) -> anyhow::Result<()> {
    render_mode(mode, value, text_fn, pretty_fn, true)
}

fn render_mode<T: Serialize>(
    mode: OutputMode,
    value: &T,
    text_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
    pretty_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
    split: bool,
) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match mode {
        OutputMode::Json => {
            serde_json::to_writer_pretty(&mut out, value)?;
            writeln!(out)?;
        }
        OutputMode::Pretty if split => pretty_fn(value, &mut out)?,
        OutputMode::Pretty | OutputMode::Text => text_fn(value, &mut out)?,
    }
    Ok(())
}

/// Render an error to stderr in the requested format.
pub fn render_error(mode: OutputMode, error: &CliError) -> anyhow::Result<()> {
    let stderr = io::stderr();
    let mut out = stderr.lock();
    match mode {
        OutputMode::Json => {
            let wrapper = serde_json::json!({ "error": error });
            serde_json::to_writer_pretty(&mut out, &wrapper)?;
            writeln!(out)?;
        }
        OutputMode::Pretty | OutputMode::Text => {
            match &error.error_code {
                Some(code) => writeln!(out, "error[{code}]: {}", error.message)?,
                None => writeln!(out, "error: {}", error.message)?,
            }
            if let Some(suggestion) = &error.suggestion {
                writeln!(out, "  suggestion: {suggestion}")?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_flag_wins() {
        let mode = resolve_output_mode(Some(OutputMode::Pretty), true, Some("json"));
        assert_eq!(mode, OutputMode::Pretty);
    }

    #[test]
    fn json_flag_forces_json() {
        assert_eq!(resolve_output_mode(None, true, Some("text")), OutputMode::Json);
    }

    #[test]
    fn store_errors_carry_code_and_hint() {
        let err = StoreError::OwnershipConflict {
            item_id: "A-TSK-0001".into(),
            holder: "codex".into(),
            agent: "claude".into(),
        };
        let cli = CliError::from(&err);
        assert_eq!(cli.error_code.as_deref(), Some("E3001"));
        assert!(cli.message.contains("A-TSK-0001"));
        assert!(cli.suggestion.is_some());

        let wrapped = anyhow::Error::from(err);
        assert_eq!(
            CliError::from_anyhow(&wrapped).error_code.as_deref(),
            Some("E3001")
        );
    }

    #[test]
    fn plain_errors_have_no_code() {
        let err = anyhow::anyhow!("boom").context("while listing");
        let cli = CliError::from_anyhow(&err);
        assert!(cli.error_code.is_none());
        assert_eq!(cli.message, "while listing: boom");
    }

    #[test]
    fn warning_view_uses_store_code() {
        let warnings = [StoreError::IndexStale {
            reason: "fingerprint mismatch".into(),
        }];
        let views = warning_views(&warnings);
        assert_eq!(views[0].code, "E6001");
        assert!(views[0].message.contains("fingerprint mismatch"));
    }

    #[test]
    fn cli_error_json_omits_empty_fields() {
        let json = serde_json::to_value(CliError::new("nope")).expect("serialize");
        assert_eq!(json, serde_json::json!({ "message": "nope" }));
    }
}
