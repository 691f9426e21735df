use crate::cmd::Context;
use crate::output::{WarningView, render, render_warnings, warning_views};
use anyhow::{Context as _, Result};
use clap::Args;
use serde::Serialize;
use std::io::{Read, Write};
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct SectionArgs {
    /// Item ID.
    pub id: String,

    /// Section heading, e.g. "Acceptance Criteria".
    pub name: String,

    /// New section text. Read from stdin when neither this nor --file is given.
    #[arg(long, conflicts_with = "file")]
    pub text: Option<String>,

    /// Read the section text from a file.
    #[arg(long)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct SectionOutput {
    id: String,
    section: String,
    missing_for_ready: Vec<String>,
    warnings: Vec<WarningView>,
}

fn section_text(args: &SectionArgs) -> Result<String> {
    if let Some(text) = &args.text {
        return Ok(text.clone());
    }
    if let Some(path) = &args.file {
        return std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()));
    }
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("Failed to read section text from stdin")?;
    Ok(text)
}

/// Replace one section's text. The worklog section is rejected.
pub fn run_section(args: &SectionArgs, ctx: &Context) -> Result<()> {
    let agent = ctx.agent()?;
    let text = section_text(args)?;
    let store = ctx.open_store()?;
    let written = store.set_section(&args.id, &args.name, &text, &agent)?;
    let item = written.value;

    let payload = SectionOutput {
        missing_for_ready: store.profile().missing_sections(&item),
        id: item.id,
        section: args.name.trim().to_string(),
        warnings: warning_views(&written.warnings),
    };
    render_warnings(ctx.output, &payload.warnings)?;
    render(ctx.output, &payload, |o, w| {
        writeln!(w, "{}  updated section '{}'", o.id, o.section)?;
        if !o.missing_for_ready.is_empty() {
            writeln!(w, "  still empty for Ready: {}", o.missing_for_ready.join(", "))?;
        }
        Ok(())
    })
}
