//! External command execution
//!
//! Every call into the provider CLI goes through [`CommandRunner`] so that
//! workflows can be driven by canned output in tests.

use std::process::Output;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::debug;

use crate::Error;

/// Captured result of an external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the command exited zero
    pub success: bool,
    /// Exit code, `None` when terminated by a signal
    pub exit_code: Option<i32>,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl CommandOutput {
    /// A successful run with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed run with the given exit code and stderr
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Stdout followed by stderr, trimmed
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim_end().to_string();
        let err = self.stderr.trim_end();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }

    /// Convert a non-zero exit into [`Error::ExternalCommand`]
    pub fn into_checked(self, command: &str) -> Result<String, Error> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(Error::ExternalCommand {
                command: command.to_string(),
                exit_code: self.exit_code,
                output: self.combined(),
            })
        }
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// Trait for executing external commands (allows mocking in tests)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, capturing output. Only spawn failures are
    /// errors; a non-zero exit is reported through [`CommandOutput`].
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, Error>;
}

/// Real command runner that executes actual system commands
#[derive(Debug, Default, Clone)]
pub struct RealCommandRunner;

#[async_trait]
impl CommandRunner for RealCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, Error> {
        debug!(program, args = ?args, "Executing command");
        let output = Command::new(program).args(args).output().await?;
        Ok(CommandOutput::from(output))
    }
}

/// Render a command line for error messages and logs
pub fn command_line(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Run a command and fail with [`Error::ExternalCommand`] on non-zero exit
pub async fn run_checked<R: CommandRunner + ?Sized>(
    runner: &R,
    program: &str,
    args: &[String],
) -> Result<String, Error> {
    let output = runner.run(program, args).await?;
    output.into_checked(&command_line(program, args))
}
