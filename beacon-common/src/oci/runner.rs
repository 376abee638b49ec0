use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::OciError;

/// Executes engine commands on the host and returns their standard output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, OciError>;
}

/// How a command line reaches the operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellDialect {
    /// Execute the program directly.
    Posix,
    /// Go through `powershell -Command`, where engine binaries are usually shims.
    PowerShell,
}

impl ShellDialect {
    pub fn for_host() -> Self {
        if cfg!(windows) {
            ShellDialect::PowerShell
        } else {
            ShellDialect::Posix
        }
    }
}

fn powershell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "''"))
}

fn display_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    dialect: ShellDialect,
}

impl ProcessRunner {
    pub fn new(dialect: ShellDialect) -> Self {
        Self { dialect }
    }

    fn command(&self, program: &str, args: &[String]) -> Command {
        let mut command = match self.dialect {
            ShellDialect::Posix => {
                let mut command = Command::new(program);
                command.args(args);
                command
            }
            ShellDialect::PowerShell => {
                let script = std::iter::once(program.to_owned())
                    .chain(args.iter().map(|arg| powershell_quote(arg)))
                    .collect::<Vec<_>>()
                    .join(" ");
                let mut command = Command::new("powershell");
                command.args(["-NoProfile", "-NonInteractive", "-Command", script.as_str()]);
                command
            }
        };

        // Dropping the future (e.g. on timeout) must not leave the engine command behind.
        command
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, OciError> {
        let rendered = display_command(program, args);
        tracing::debug!(command = %rendered, "running engine command");

        let output = self
            .command(program, args)
            .output()
            .await
            .map_err(|error| OciError::Spawn {
                command: rendered.clone(),
                error,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(OciError::Command {
            command: rendered,
            status: output.status.to_string(),
            output: format!("{}{}", stdout, stderr).trim().to_owned(),
        })
    }
}
