use anyhow::{Context as _, Result};
use clap::Args;
use clap_complete::{Shell, generate};
use std::io::{self, Write};

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// bash, zsh, fish, elvish or powershell.
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Print the completion script for `args.shell` to stdout.
///
/// # Errors
///
/// Returns an error if stdout cannot be written or flushed.
pub fn run_completions(args: &CompletionsArgs, command: &mut clap::Command) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_script(args.shell, command, &mut out)?;
    out.flush().context("flush completion script")
}

/// Render the script under the command's own binary name.
fn write_script(shell: Shell, command: &mut clap::Command, out: &mut dyn Write) -> Result<()> {
    let bin = command.get_name().to_string();
    generate(shell, command, bin, out);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(shell: Shell) -> String {
        let mut command = clap::Command::new("bkl")
            .subcommand(clap::Command::new("transition"))
            .subcommand(clap::Command::new("check-ready"));
        let mut buf = Vec::new();
        write_script(shell, &mut command, &mut buf).expect("generate");
        String::from_utf8(buf).expect("utf8")
    }

    #[test]
    fn scripts_name_the_binary_and_subcommands() {
        for shell in [Shell::Bash, Shell::Zsh, Shell::Fish] {
            let text = script(shell);
            assert!(text.contains("bkl"), "{shell}");
            assert!(text.contains("check-ready"), "{shell}");
        }
    }
}
