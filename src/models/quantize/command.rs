//! External conversion toolchain
//!
//! Runs a configured program once per conversion. Argument templates may use
//! `{input}`, `{output}`, `{from}` and `{precision}` placeholders.

use super::{Converter, PrecisionLevel};
use anyhow::{Context, bail};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct CommandConverter {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandConverter {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments with placeholders filled in
    pub fn render_args(
        &self,
        input: &Path,
        output: &Path,
        from: PrecisionLevel,
        to: PrecisionLevel,
    ) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        let from = from.to_string();
        let to = to.to_string();

        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input)
                    .replace("{output}", &output)
                    .replace("{from}", &from)
                    .replace("{precision}", &to)
            })
            .collect()
    }
}

#[async_trait]
impl Converter for CommandConverter {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        from: PrecisionLevel,
        to: PrecisionLevel,
    ) -> anyhow::Result<()> {
        let args = self.render_args(input, output, from, to);
        tracing::debug!(program = %self.program, args = ?args, "Running conversion command");

        let mut cmd = Command::new(&self.program);
        cmd.args(&args).kill_on_drop(true);

        let result = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .with_context(|| format!("{} timed out after {:?}", self.program, self.timeout))?
            .with_context(|| format!("failed to spawn {}", self.program))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            bail!(
                "{} exited with {}: {}",
                self.program,
                result.status,
                stderr.trim()
            );
        }

        if !output.exists() {
            bail!("{} exited cleanly but wrote no {:?}", self.program, output);
        }

        Ok(())
    }

    fn name(&self) -> &str {
        &self.program
    }
}
