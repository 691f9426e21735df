use crate::cmd::Context;
use crate::output::render;
use anyhow::{Context as _, Result};
use backlog_core::InitOptions;
use clap::Args;
use serde::Serialize;
use std::io::Write;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Product name; records live under `<root>/products/<PRODUCT>/`.
    #[arg(value_name = "PRODUCT")]
    pub name: Option<String>,

    /// Identifier prefix (default: initials of the product name).
    #[arg(long)]
    pub prefix: Option<String>,

    /// Process profile name.
    #[arg(long)]
    pub profile: Option<String>,

    /// Enable the derived SQLite index and build it now.
    #[arg(long)]
    pub index: bool,
}

/// Per-checkout state that must not be committed.
const GITIGNORE: &str = "_index/\n_meta/locks/\n_meta/counters/*.lock\n";

#[derive(Debug, Serialize)]
struct InitOutput {
    product: String,
    prefix: String,
    profile: String,
    path: String,
    index: bool,
}

/// Execute `bkl init`. Creates the product skeleton:
///
/// ```text
/// <root>/
///   _shared/defaults.toml
///   products/<product>/
///     _config/config.toml
///     _meta/counters/  _meta/locks/
///     items/
///     .gitignore
/// ```
///
/// Re-running on an existing product keeps its configuration.
///
/// # Errors
///
/// Returns an error for an invalid prefix or profile, or if any filesystem
/// operation fails.
pub fn run_init(args: &InitArgs, ctx: &Context) -> Result<()> {
    let product = args
        .name
        .as_deref()
        .or(ctx.product.as_deref())
        .context("product name required: `bkl init <PRODUCT>`")?;

    let options = InitOptions {
        prefix: args.prefix.clone(),
        profile: args.profile.clone(),
        index: args.index,
    };
    let store = backlog_core::Store::init(&ctx.root, product, &options)?;

    let gitignore = store.layout().root().join(".gitignore");
    if !gitignore.exists() {
        std::fs::write(&gitignore, GITIGNORE)
            .with_context(|| format!("Failed to write {}", gitignore.display()))?;
    }
    if store.config().index.enabled {
        store.rebuild_index()?;
    }

    let payload = InitOutput {
        product: store.product().to_string(),
        prefix: store.prefix().to_string(),
        profile: store.profile().name.clone(),
        path: store.layout().root().display().to_string(),
        index: store.config().index.enabled,
    };
    render(ctx.output, &payload, |o, w| {
        writeln!(
            w,
            "Initialized product {} (prefix {}, profile {}) at {}",
            o.product, o.prefix, o.profile, o.path
        )?;
        if o.index {
            writeln!(w, "Derived index enabled and built")?;
        }
        Ok(())
    })
}
