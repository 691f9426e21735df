//! Agent identity resolution for CLI commands.
//!
//! The resolution chain: `--agent` flag > `BACKLOG_AGENT` env > `AGENT` env >
//! user config `agent` > `USER` env (TTY only). Mutating commands require
//! an agent identity; read-only commands work without one.

use std::env;

/// Errors from agent resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResolutionError {
    /// Human-readable description.
    pub message: String,
    /// Machine error code.
    pub code: &'static str,
}

impl std::fmt::Display for AgentResolutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AgentResolutionError {}

/// Environment reader trait for dependency injection in tests.
trait EnvReader {
    fn get(&self, key: &str) -> Option<String>;
    fn is_tty(&self) -> bool;
}

struct RealEnv;

impl EnvReader for RealEnv {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok().filter(|v| !v.trim().is_empty())
    }

    fn is_tty(&self) -> bool {
        use std::io::IsTerminal;
        std::io::stdin().is_terminal()
    }
}

fn resolve_agent_with(
    cli_flag: Option<&str>,
    user_agent: Option<&str>,
    env: &dyn EnvReader,
) -> Option<String> {
    if let Some(agent) = cli_flag.filter(|a| !a.trim().is_empty()) {
        return Some(agent.to_string());
    }

    if let Some(val) = env.get("BACKLOG_AGENT") {
        return Some(val);
    }

    if let Some(val) = env.get("AGENT") {
        return Some(val);
    }

    if let Some(agent) = user_agent.filter(|a| !a.trim().is_empty()) {
        return Some(agent.to_string());
    }

    // USER only identifies a person at a terminal, never a script.
    if env.is_tty() {
        if let Some(val) = env.get("USER") {
            return Some(val);
        }
    }

    None
}

/// Resolve the agent identity, or `None` if nothing in the chain is set.
pub fn resolve_agent(cli_flag: Option<&str>, user_agent: Option<&str>) -> Option<String> {
    resolve_agent_with(cli_flag, user_agent, &RealEnv)
}

/// Resolve agent identity, returning an error if not found.
///
/// Use this for mutating commands; every write lands in a worklog under
/// this name.
pub fn require_agent(
    cli_flag: Option<&str>,
    user_agent: Option<&str>,
) -> Result<String, AgentResolutionError> {
    resolve_agent(cli_flag, user_agent).ok_or_else(|| AgentResolutionError {
        message: "Agent identity required for this command. \
                  Set --agent, BACKLOG_AGENT, or AGENT environment variable."
            .to_string(),
        code: "missing_agent",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MockEnv {
        vars: HashMap<String, String>,
        tty: bool,
    }

    impl MockEnv {
        fn new() -> Self {
            Self {
                vars: HashMap::new(),
                tty: false,
            }
        }

        fn var(mut self, key: &str, val: &str) -> Self {
            self.vars.insert(key.to_string(), val.to_string());
            self
        }

        fn tty(mut self) -> Self {
            self.tty = true;
            self
        }
    }

    impl EnvReader for MockEnv {
        fn get(&self, key: &str) -> Option<String> {
            self.vars.get(key).filter(|v| !v.trim().is_empty()).cloned()
        }

        fn is_tty(&self) -> bool {
            self.tty
        }
    }

    #[test]
    fn cli_flag_takes_priority() {
        let env = MockEnv::new()
            .var("BACKLOG_AGENT", "env-backlog")
            .var("AGENT", "env-agent");
        let result = resolve_agent_with(Some("flag-agent"), Some("config-agent"), &env);
        assert_eq!(result.as_deref(), Some("flag-agent"));
    }

    #[test]
    fn backlog_agent_beats_agent() {
        let env = MockEnv::new()
            .var("BACKLOG_AGENT", "env-backlog")
            .var("AGENT", "env-agent");
        assert_eq!(
            resolve_agent_with(None, None, &env).as_deref(),
            Some("env-backlog")
        );
    }

    #[test]
    fn env_beats_user_config() {
        let env = MockEnv::new().var("AGENT", "env-agent");
        assert_eq!(
            resolve_agent_with(None, Some("config-agent"), &env).as_deref(),
            Some("env-agent")
        );
    }

    #[test]
    fn user_config_beats_user_env() {
        let env = MockEnv::new().var("USER", "alice").tty();
        assert_eq!(
            resolve_agent_with(None, Some("config-agent"), &env).as_deref(),
            Some("config-agent")
        );
    }

    #[test]
    fn user_env_only_on_tty() {
        let piped = MockEnv::new().var("USER", "alice");
        assert_eq!(resolve_agent_with(None, None, &piped), None);

        let tty = MockEnv::new().var("USER", "alice").tty();
        assert_eq!(resolve_agent_with(None, None, &tty).as_deref(), Some("alice"));
    }

    #[test]
    fn blank_values_are_skipped() {
        let env = MockEnv::new().var("BACKLOG_AGENT", "  ").var("AGENT", "env-agent");
        assert_eq!(
            resolve_agent_with(Some(""), Some(" "), &env).as_deref(),
            Some("env-agent")
        );
    }
}
