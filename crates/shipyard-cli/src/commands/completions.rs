//! `shipyard completions`: shell completion scripts.

use anyhow::{Context, Result};
use clap_complete::Shell;
use std::fs;
use std::path::Path;

/// Completion script for `shell`
pub fn generate_completions(shell: Shell) -> Result<String> {
    let mut cmd = super::build_cli();
    let mut buf = Vec::new();
    clap_complete::generate(shell, &mut cmd, "shipyard", &mut buf);

    String::from_utf8(buf).context("Failed to generate completions")
}

/// Writes the script to `output`, or stdout
pub fn write_completions(shell: Shell, output: Option<&Path>) -> Result<()> {
    let script = generate_completions(shell)?;
    match output {
        Some(path) => fs::write(path, script)
            .with_context(|| format!("Failed to write completions to: {}", path.display())),
        None => {
            print!("{script}");
            Ok(())
        }
    }
}
