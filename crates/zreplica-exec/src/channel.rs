//! Command channel contract
//!
//! A [`CommandChannel`] runs scripts on a [`Host`] and starts long-lived
//! stream endpoints there. The snapshot engine adapter is written against
//! this trait only.

use crate::{CommandLine, Script};
use async_trait::async_trait;
use zreplica_types::{ByteSink, ByteSource, Error, Host, Result};

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal
    pub status: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Standard output on success, a [`Error::Command`] otherwise
    pub fn into_result(self, command: &str) -> Result<String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(Error::command(command, self.status, self.stderr.trim()))
        }
    }
}

/// Runs commands and stream endpoints on local or remote hosts
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Run a script to completion and capture its output
    async fn run(&self, host: &Host, script: &Script) -> Result<CommandOutput>;

    /// Run several commands in one round-trip, stopping at the first failure
    async fn run_script(&self, host: &Host, commands: Vec<CommandLine>) -> Result<CommandOutput> {
        self.run(host, &Script::new(commands)).await
    }

    /// Start a script whose standard output is read as a stream
    async fn spawn_reader(&self, host: &Host, script: &Script) -> Result<ByteSource>;

    /// Start a script whose standard input is written as a stream
    async fn spawn_writer(&self, host: &Host, script: &Script) -> Result<ByteSink>;
}

/// Node name of `host`, as reported by `uname -n`
pub async fn node_name(channel: &dyn CommandChannel, host: &Host) -> Result<String> {
    let command = CommandLine::new("uname").arg("-n");
    let rendered = command.to_shell();
    let stdout = channel
        .run(host, &Script::from(command))
        .await?
        .into_result(&rendered)?;

    let name = stdout.trim();
    if name.is_empty() {
        return Err(Error::parse("uname -n output", "empty node name"));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_into_result() {
        let ok = CommandOutput {
            status: Some(0),
            stdout: "tank\n".into(),
            stderr: String::new(),
        };
        assert_eq!(ok.into_result("zfs list").unwrap(), "tank\n");

        let failed = CommandOutput {
            status: Some(1),
            stdout: String::new(),
            stderr: "cannot open 'tank/x': dataset does not exist\n".into(),
        };
        let error = failed.into_result("zfs list tank/x").unwrap_err();
        assert_eq!(
            error.to_string(),
            "Command `zfs list tank/x` failed (exit status 1): cannot open 'tank/x': dataset does not exist"
        );
    }

    #[test]
    fn test_signal_is_not_success() {
        let killed = CommandOutput {
            status: None,
            ..CommandOutput::default()
        };
        assert!(!killed.success());
    }
}
