//! Host command execution
//!
//! Every external tool fcnest drives (`ip`, `iptables`, `mount`, `systemctl`,
//! `docker`, ...) goes through [`CommandRunner`], so provisioning logic can be
//! exercised against in-memory hosts in tests.

use std::fs::File;
use std::io;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use crate::error::{Error, Result};

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn status_text(&self) -> String {
        match self.code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// A long-running process started in the background
pub trait BackgroundProcess: Send {
    /// OS process identifier
    fn id(&self) -> u32;

    /// Exit code if the process has already terminated, without blocking
    fn try_exit_code(&mut self) -> io::Result<Option<i32>>;
}

/// Runs external programs on behalf of the provisioning code
pub trait CommandRunner: Send + Sync {
    /// Run a program to completion and capture its output
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput>;

    /// Start a program in the background with stdout/stderr appended to `log_path`
    fn spawn_logged(
        &self,
        program: &str,
        args: &[&str],
        log_path: &Path,
    ) -> io::Result<Box<dyn BackgroundProcess>>;
}

/// [`CommandRunner`] backed by real processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        tracing::trace!(program, ?args, "exec");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn_logged(
        &self,
        program: &str,
        args: &[&str],
        log_path: &Path,
    ) -> io::Result<Box<dyn BackgroundProcess>> {
        let log = File::options().create(true).append(true).open(log_path)?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()?;
        Ok(Box::new(SystemProcess(child)))
    }
}

struct SystemProcess(Child);

impl BackgroundProcess for SystemProcess {
    fn id(&self) -> u32 {
        self.0.id()
    }

    fn try_exit_code(&mut self) -> io::Result<Option<i32>> {
        Ok(self.0.try_wait()?.map(|status| status.code().unwrap_or(-1)))
    }
}

/// Render a command line for logs and error messages
pub fn display_command(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run a command and turn a non-zero exit into [`Error::CommandFailed`]
pub fn run_checked(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> Result<String> {
    let output = runner.run(program, args)?;
    if output.success() {
        Ok(output.stdout)
    } else {
        Err(Error::CommandFailed {
            command: display_command(program, args),
            status: output.status_text(),
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// Run a command and report only whether it succeeded
///
/// Spawn failures (missing binary) count as failure.
pub fn run_succeeds(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> bool {
    match runner.run(program, args) {
        Ok(output) => output.success(),
        Err(e) => {
            tracing::debug!(command = %display_command(program, args), error = %e, "spawn failed");
            false
        }
    }
}
