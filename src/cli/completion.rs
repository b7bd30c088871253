//! Shell completion generation for export-queue
//!
//! Generates completion scripts for bash, zsh, fish, PowerShell and elvish.

use clap::CommandFactory;
use clap_complete::{Shell, generate};
use std::io;

use crate::cli::CliArgs;
use crate::error::{ExportError, Result};

const BIN_NAME: &str = "export-queue";

/// Print the completion script for `shell_name` to stdout
pub fn generate_completion(shell_name: &str) -> Result<()> {
    let shell = parse_shell(shell_name)?;
    write_completion(shell, &mut io::stdout());
    Ok(())
}

/// Write the completion script for `shell` into `out`
pub fn write_completion<W: io::Write>(shell: Shell, out: &mut W) {
    let mut cmd = CliArgs::command();
    generate(shell, &mut cmd, BIN_NAME, out);
}

/// Parse shell name string to Shell enum
fn parse_shell(shell_name: &str) -> Result<Shell> {
    match shell_name.to_lowercase().as_str() {
        "bash" => Ok(Shell::Bash),
        "zsh" => Ok(Shell::Zsh),
        "fish" => Ok(Shell::Fish),
        "powershell" | "pwsh" => Ok(Shell::PowerShell),
        "elvish" => Ok(Shell::Elvish),
        _ => Err(ExportError::Generic(format!(
            "Unsupported shell: {}. Supported shells: bash, zsh, fish, powershell, elvish",
            shell_name
        ))),
    }
}
