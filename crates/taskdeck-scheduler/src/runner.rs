//! Command execution capability for `Command` tasks and static entries.

use async_trait::async_trait;
use std::path::PathBuf;

use taskdeck_core::config::CommandConfig;
use taskdeck_core::error::{Result, TaskdeckError};

/// Captured result of one command invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, as stored in the execution log.
    pub fn combined(&self) -> String {
        match (self.stdout.trim_end().is_empty(), self.stderr.trim_end().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

/// Runs a command line with extra arguments.
///
/// A nonzero exit is reported through [`CommandOutput::exit_code`], not as an
/// error; `Err` means the command could not be started at all.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, arguments: &[String]) -> Result<CommandOutput>;
}

/// Spawns real processes via `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct ShellCommandRunner {
    prefix: Vec<String>,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl ShellCommandRunner {
    pub fn new(config: &CommandConfig) -> Self {
        Self {
            prefix: config.prefix.clone(),
            working_dir: config
                .working_dir
                .as_deref()
                .map(|dir| PathBuf::from(shellexpand::tilde(dir).into_owned())),
            env: config.env.clone(),
        }
    }

    /// Full argv: prefix, the command line split on whitespace, then arguments.
    ///
    /// The command line is not shell-parsed: quotes are not honoured there.
    /// Values that contain spaces belong in task parameters, which arrive
    /// here already as separate arguments and are passed through unsplit.
    pub fn argv(&self, command: &str, arguments: &[String]) -> Vec<String> {
        self.prefix
            .iter()
            .cloned()
            .chain(command.split_whitespace().map(str::to_string))
            .chain(arguments.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(&self, command: &str, arguments: &[String]) -> Result<CommandOutput> {
        let argv = self.argv(command, arguments);
        let Some((program, args)) = argv.split_first() else {
            return Err(TaskdeckError::validation("empty command line"));
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args).kill_on_drop(true).stdin(std::process::Stdio::null());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        tracing::debug!("▶️ Spawning: {}", argv.join(" "));
        let output = cmd
            .output()
            .await
            .map_err(|e| TaskdeckError::Execution(format!("failed to start '{program}': {e}")))?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_values_keep_their_spaces() {
        let runner = ShellCommandRunner::default();
        assert_eq!(
            runner.argv("report:send", &["--subject=Daily sales report".into(), "--dry-run".into()]),
            vec!["report:send", "--subject=Daily sales report", "--dry-run"]
        );
    }

    #[test]
    fn test_argv_with_prefix() {
        let runner = ShellCommandRunner::new(&CommandConfig {
            prefix: vec!["/opt/app/bin/console".into()],
            working_dir: None,
            env: Vec::new(),
        });
        assert_eq!(
            runner.argv("backup:run  --only-db", &["--disk=s3".into()]),
            vec!["/opt/app/bin/console", "backup:run", "--only-db", "--disk=s3"]
        );
    }

    #[test]
    fn test_combined_output() {
        let out = CommandOutput {
            exit_code: Some(1),
            stdout: "done\n".into(),
            stderr: "warning\n".into(),
        };
        assert_eq!(out.combined(), "done\nwarning");
        assert!(!out.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_real_process() {
        let runner = ShellCommandRunner::default();
        let ok = runner.run("echo hello", &[]).await.unwrap();
        assert!(ok.success());
        assert_eq!(ok.stdout.trim(), "hello");

        let failed = runner.run("false", &[]).await.unwrap();
        assert_eq!(failed.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let runner = ShellCommandRunner::default();
        let err = runner.run("definitely-not-a-real-binary-xyz", &[]).await.unwrap_err();
        assert!(matches!(err, TaskdeckError::Execution(_)));
        assert!(runner.run("   ", &[]).await.is_err());
    }
}
