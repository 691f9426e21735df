#![forbid(unsafe_code)]

mod agent;
mod cmd;
mod output;

use backlog_core::config::{self, UserConfig};
use clap::{CommandFactory, Parser, Subcommand};
use output::{CliError, OutputMode};
use std::env;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    name = "bkl",
    author,
    version,
    about = "bkl: file-backed work items for agents and humans",
    long_about = None
)]
struct Cli {
    /// Backlog root holding `products/` and `_shared/`.
    #[arg(
        long,
        global = true,
        env = "BACKLOG_ROOT",
        default_value = config::DEFAULT_BACKLOG_ROOT
    )]
    root: PathBuf,

    /// Product to operate on (default: `_shared/defaults.toml`, or the only one).
    #[arg(long, short = 'p', global = true, env = "BACKLOG_PRODUCT")]
    product: Option<String>,

    /// Output format.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    /// Shorthand for `--format json`.
    #[arg(long, global = true)]
    json: bool,

    /// Override agent identity (skips env resolution).
    #[arg(long, global = true)]
    agent: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Setup",
        about = "Initialize a product",
        after_help = "EXAMPLES:\n    # Create products/billing-api with prefix BA\n    bkl init billing-api\n\n    # Pick the prefix and enable the derived index\n    bkl init billing-api --prefix BILL --index"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        next_help_heading = "Lifecycle",
        about = "Create a new work item",
        after_help = "EXAMPLES:\n    # Create a task\n    bkl create --title \"Fix session TTL\"\n\n    # Create a story under a feature\n    bkl create --kind userstory --title \"Remember me\" --parent BA-FTR-0001"
    )]
    Create(cmd::create::CreateArgs),

    #[command(
        next_help_heading = "Lifecycle",
        about = "Move an item to another state",
        after_help = "EXAMPLES:\n    # Start work (takes ownership)\n    bkl transition BA-TSK-0004 InProgress\n\n    # Finish with a note\n    bkl transition BA-TSK-0004 Done --note \"merged\""
    )]
    Transition(cmd::transition::TransitionArgs),

    #[command(
        next_help_heading = "Lifecycle",
        about = "Append a worklog entry",
        after_help = "EXAMPLES:\n    bkl worklog BA-TSK-0004 \"reproduced on staging\""
    )]
    Worklog(cmd::worklog::WorklogArgs),

    #[command(
        next_help_heading = "Lifecycle",
        about = "Replace the text of a section",
        after_help = "EXAMPLES:\n    bkl section BA-TSK-0004 Goal --text \"Sessions last the configured TTL\"\n\n    # Read the text from stdin\n    cat criteria.md | bkl section BA-TSK-0004 \"Acceptance Criteria\""
    )]
    Section(cmd::section::SectionArgs),

    #[command(
        next_help_heading = "Read",
        about = "Show one work item",
        after_help = "EXAMPLES:\n    bkl show BA-TSK-0004\n\n    bkl show BA-TSK-0004 --tail 5 --json"
    )]
    Show(cmd::show::ShowArgs),

    #[command(
        next_help_heading = "Read",
        about = "List work items",
        after_help = "EXAMPLES:\n    # Non-terminal items\n    bkl list\n\n    # Everything one agent holds\n    bkl list --owner codex --state InProgress"
    )]
    List(cmd::list::ListArgs),

    #[command(
        next_help_heading = "Read",
        about = "Report missing Ready-gate sections",
        after_help = "EXAMPLES:\n    bkl check-ready BA-TSK-0004"
    )]
    CheckReady(cmd::check_ready::CheckReadyArgs),

    #[command(next_help_heading = "Maintenance", about = "Manage the derived index")]
    Index {
        #[command(subcommand)]
        command: cmd::index::IndexCommand,
    },

    #[command(next_help_heading = "Maintenance", about = "Inspect or break ownership locks")]
    Lock {
        #[command(subcommand)]
        command: cmd::lock::LockCommand,
    },

    #[command(
        next_help_heading = "Maintenance",
        about = "Generate shell completion scripts",
        after_help = "EXAMPLES:\n    bkl completions zsh > ~/.zfunc/_bkl"
    )]
    Completions(cmd::completions::CompletionsArgs),
}

/// Log level from the product config, used when `BACKLOG_LOG` is unset.
fn configured_log_level(cli: &Cli) -> String {
    config::resolve_product_root(&cli.root, cli.product.as_deref())
        .and_then(|root| config::load_product_config(&root))
        .map_or_else(
            |_| "info".to_string(),
            |cfg| cfg.log.filter_directive().to_string(),
        )
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_env("BACKLOG_LOG").unwrap_or_else(|_| {
        EnvFilter::new(format!("backlog_core={level},bkl={level},warn"))
    });

    let format = env::var("BACKLOG_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(io::stderr))
                .init();
        }
    }
}

fn dispatch(command: &Commands, ctx: &cmd::Context) -> anyhow::Result<()> {
    match command {
        Commands::Init(args) => cmd::init::run_init(args, ctx),
        Commands::Create(args) => cmd::create::run_create(args, ctx),
        Commands::Transition(args) => cmd::transition::run_transition(args, ctx),
        Commands::Worklog(args) => cmd::worklog::run_worklog(args, ctx),
        Commands::Section(args) => cmd::section::run_section(args, ctx),
        Commands::Show(args) => cmd::show::run_show(args, ctx),
        Commands::List(args) => cmd::list::run_list(args, ctx),
        Commands::CheckReady(args) => cmd::check_ready::run_check_ready(args, ctx),
        Commands::Index { command } => cmd::index::run_index(command, ctx),
        Commands::Lock { command } => cmd::lock::run_lock(command, ctx),
        Commands::Completions(args) => {
            cmd::completions::run_completions(args, &mut Cli::command())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&configured_log_level(&cli));

    let user = config::load_user_config().unwrap_or_else(|e| {
        warn!(error = %e, "ignoring unreadable user config");
        UserConfig::default()
    });
    let output = output::resolve_output_mode(cli.format, cli.json, user.output.as_deref());
    let ctx = cmd::Context {
        root: cli.root.clone(),
        product: cli.product.clone(),
        agent_flag: cli.agent.clone(),
        user_agent: user.agent,
        output,
    };

    match dispatch(&cli.command, &ctx) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Err(render_err) = output::render_error(output, &CliError::from_anyhow(&err)) {
                eprintln!("error: {err:#} ({render_err})");
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_flag_parses_after_subcommand() {
        let cli = Cli::parse_from(["bkl", "list", "--json"]);
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::List(_)));
    }

    #[test]
    fn global_flags_parse_before_subcommand() {
        let cli = Cli::parse_from([
            "bkl", "--root", "/tmp/bl", "--product", "app", "--agent", "codex", "show", "A-TSK-0001",
        ]);
        assert_eq!(cli.root, PathBuf::from("/tmp/bl"));
        assert_eq!(cli.product.as_deref(), Some("app"));
        assert_eq!(cli.agent.as_deref(), Some("codex"));
        assert!(matches!(cli.command, Commands::Show(_)));
    }

    #[test]
    fn create_parses_kind_and_tags() {
        let cli = Cli::parse_from([
            "bkl", "create", "--kind", "user-story", "--title", "Remember me", "--tag", "auth",
            "--tag", "web",
        ]);
        let Commands::Create(args) = cli.command else {
            panic!("expected create");
        };
        assert_eq!(args.kind, backlog_core::Kind::UserStory);
        assert_eq!(args.tags, vec!["auth".to_string(), "web".to_string()]);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let result = Cli::try_parse_from(["bkl", "create", "--kind", "goal", "--title", "x"]);
        assert!(result.is_err());
    }

    #[test]
    fn transition_flags_parse() {
        let cli = Cli::parse_from([
            "bkl", "transition", "A-TSK-0001", "Done", "--note", "merged", "--no-sync", "--force",
        ]);
        let Commands::Transition(args) = cli.command else {
            panic!("expected transition");
        };
        assert_eq!(args.state, "Done");
        assert_eq!(args.note.as_deref(), Some("merged"));
        assert!(args.no_sync && args.force);
    }

    #[test]
    fn all_subcommands_parse() {
        let subcommands = [
            vec!["bkl", "init", "app"],
            vec!["bkl", "create", "--title", "x"],
            vec!["bkl", "transition", "x", "Ready"],
            vec!["bkl", "worklog", "x", "note"],
            vec!["bkl", "section", "x", "Goal", "--text", "t"],
            vec!["bkl", "show", "x"],
            vec!["bkl", "list", "--all"],
            vec!["bkl", "check-ready", "x"],
            vec!["bkl", "index", "rebuild"],
            vec!["bkl", "index", "status"],
            vec!["bkl", "lock", "inspect", "x"],
            vec!["bkl", "lock", "list"],
            vec!["bkl", "lock", "break", "x"],
            vec!["bkl", "completions", "bash"],
        ];
        for args in &subcommands {
            let result = Cli::try_parse_from(args.iter());
            assert!(result.is_ok(), "failed to parse {args:?}: {:?}", result.err());
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
