pub mod check_ready;
pub mod completions;
pub mod create;
pub mod index;
pub mod init;
pub mod list;
pub mod lock;
pub mod section;
pub mod show;
pub mod transition;
pub mod worklog;

use crate::agent;
use crate::output::OutputMode;
use backlog_core::Store;
use std::path::PathBuf;

/// Global flags every command handler needs.
#[derive(Debug, Clone)]
pub struct Context {
    pub root: PathBuf,
    pub product: Option<String>,
    pub agent_flag: Option<String>,
    /// `agent` from the user config file.
    pub user_agent: Option<String>,
    pub output: OutputMode,
}

impl Context {
    /// Open the selected product.
    pub fn open_store(&self) -> anyhow::Result<Store> {
        Ok(Store::open(&self.root, self.product.as_deref())?)
    }

    /// Agent identity for a mutating command.
    pub fn agent(&self) -> anyhow::Result<String> {
        Ok(agent::require_agent(
            self.agent_flag.as_deref(),
            self.user_agent.as_deref(),
        )?)
    }
}
