//! Process-backed command channel
//!
//! Local scripts run directly (single commands) or through `sh -c`; remote
//! scripts run through the configured ssh client as one quoted argument.
//! Every child is spawned with kill-on-drop.

use crate::{CommandChannel, CommandOutput, Script};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use zreplica_types::{ByteSink, ByteSource, Error, Host, Result, StreamHandle};

/// How remote hosts are reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    /// ssh client binary
    pub program: String,
    /// Port, when not the client default
    pub port: Option<u16>,
    /// Identity file
    pub identity_file: Option<PathBuf>,
    /// Extra `-o` options
    pub options: Vec<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            port: None,
            identity_file: None,
            options: Vec::new(),
        }
    }
}

impl SshOptions {
    /// Client arguments preceding the remote command
    pub fn args(&self, destination: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        for option in &self.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args.push(destination.to_string());
        args.push("--".to_string());
        args
    }
}

/// [`CommandChannel`] over `tokio::process` and an ssh client
#[derive(Debug, Clone, Default)]
pub struct ProcessChannel {
    ssh: SshOptions,
}

impl ProcessChannel {
    /// Create a channel using the given ssh settings
    pub fn new(ssh: SshOptions) -> Self {
        Self { ssh }
    }

    /// The ssh settings in use
    pub fn ssh(&self) -> &SshOptions {
        &self.ssh
    }

    /// Build the OS command that runs `script` on `host`
    pub fn build_command(&self, host: &Host, script: &Script) -> Result<Command> {
        script.validate()?;

        let command = match host.destination() {
            Some(destination) => {
                let mut command = Command::new(&self.ssh.program);
                command
                    .args(self.ssh.args(&destination))
                    .arg(script.to_shell());
                command
            }
            None => match script.as_single() {
                Some(single) => {
                    let mut command = Command::new(single.program());
                    command.args(single.arguments());
                    command
                }
                None => {
                    let mut command = Command::new("sh");
                    command.arg("-c").arg(script.to_shell());
                    command
                }
            },
        };

        Ok(command)
    }

    fn spawn(&self, host: &Host, script: &Script, mut command: Command) -> Result<Child> {
        debug!(host = %host, script = %script, "Spawning command");
        command.kill_on_drop(true).spawn().map_err(|e| {
            Error::command(
                describe(host, script),
                None,
                format!("failed to start: {}", e),
            )
        })
    }
}

fn describe(host: &Host, script: &Script) -> String {
    match host {
        Host::Local => script.to_shell(),
        remote => format!("{} on {}", script.to_shell(), remote),
    }
}

#[async_trait]
impl CommandChannel for ProcessChannel {
    async fn run(&self, host: &Host, script: &Script) -> Result<CommandOutput> {
        trace!(host = %host, script = %script, "Executing command");

        let mut command = self.build_command(host, script)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = self.spawn(host, script, command)?;

        let output = child.wait_with_output().await.map_err(|e| {
            Error::command(describe(host, script), None, format!("wait failed: {}", e))
        })?;

        let output = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!(status = ?output.status, "Command finished");
        Ok(output)
    }

    async fn spawn_reader(&self, host: &Host, script: &Script) -> Result<ByteSource> {
        let mut command = self.build_command(host, script)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = self.spawn(host, script, command)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::other("child stdout was not captured"))?;
        let handle = ChildHandle::new(child, describe(host, script));

        Ok(ByteSource {
            reader: Box::new(stdout),
            handle: Box::new(handle),
        })
    }

    async fn spawn_writer(&self, host: &Host, script: &Script) -> Result<ByteSink> {
        let mut command = self.build_command(host, script)?;
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut child = self.spawn(host, script, command)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::other("child stdin was not captured"))?;
        let handle = ChildHandle::new(child, describe(host, script));

        Ok(ByteSink {
            writer: Box::new(stdin),
            handle: Box::new(handle),
        })
    }
}

/// Owns a streaming child process and drains its stderr in the background
struct ChildHandle {
    child: Child,
    stderr: Option<JoinHandle<String>>,
    command: String,
}

impl ChildHandle {
    fn new(mut child: Child, command: String) -> Self {
        let stderr = child.stderr.take().map(|stderr| tokio::spawn(drain(stderr)));
        Self {
            child,
            stderr,
            command,
        }
    }
}

async fn drain(mut stderr: ChildStderr) -> String {
    let mut buffer = Vec::new();
    if let Err(e) = stderr.read_to_end(&mut buffer).await {
        warn!("Failed to read child stderr: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[async_trait]
impl StreamHandle for ChildHandle {
    async fn finish(mut self: Box<Self>) -> Result<()> {
        let status = self.child.wait().await.map_err(|e| {
            Error::command(&self.command, None, format!("wait failed: {}", e))
        })?;

        let stderr = match self.stderr.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            if !stderr.trim().is_empty() {
                debug!(command = %self.command, stderr = %stderr.trim(), "Stream endpoint stderr");
            }
            Ok(())
        } else {
            Err(Error::command(&self.command, status.code(), stderr.trim()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommandLine;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn remote() -> Host {
        Host::remote(Some("backup".to_string()), "nas")
    }

    #[test]
    fn test_ssh_args() {
        let ssh = SshOptions {
            program: "ssh".into(),
            port: Some(2222),
            identity_file: Some(PathBuf::from("/root/.ssh/id_backup")),
            options: vec!["BatchMode=yes".into()],
        };
        assert_eq!(
            ssh.args("backup@nas"),
            vec![
                "-p",
                "2222",
                "-i",
                "/root/.ssh/id_backup",
                "-o",
                "BatchMode=yes",
                "backup@nas",
                "--"
            ]
        );
    }

    #[test]
    fn test_remote_command_is_one_quoted_argument() {
        let channel = ProcessChannel::default();
        let script = Script::from(CommandLine::new("zfs").args(["list", "tank/my data"]));
        let command = channel.build_command(&remote(), &script).unwrap();
        let std_command = command.as_std();

        assert_eq!(std_command.get_program(), "ssh");
        let args: Vec<_> = std_command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["backup@nas", "--", "zfs list 'tank/my data'"]);
    }

    #[test]
    fn test_local_single_command_skips_shell() {
        let channel = ProcessChannel::default();
        let script = Script::from(CommandLine::new("zfs").args(["list", "tank/my data"]));
        let command = channel.build_command(&Host::Local, &script).unwrap();
        let std_command = command.as_std();

        assert_eq!(std_command.get_program(), "zfs");
        assert_eq!(std_command.get_args().count(), 2);
    }

    #[tokio::test]
    async fn test_run_local_script() {
        let channel = ProcessChannel::default();
        let output = channel
            .run_script(
                &Host::Local,
                vec![
                    CommandLine::new("echo").arg("first"),
                    CommandLine::new("echo").arg("second"),
                ],
            )
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout, "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_run_reports_failure_status() {
        let channel = ProcessChannel::default();
        let output = channel
            .run(&Host::Local, &Script::from(CommandLine::new("false")))
            .await
            .unwrap();
        assert_eq!(output.status, Some(1));
    }

    #[tokio::test]
    async fn test_missing_program_is_command_error() {
        let channel = ProcessChannel::default();
        let error = channel
            .run(
                &Host::Local,
                &Script::from(CommandLine::new("/nonexistent/zfs")),
            )
            .await
            .unwrap_err();
        assert_eq!(error.kind(), zreplica_types::ErrorKind::Command);
    }

    #[tokio::test]
    async fn test_stream_endpoints() {
        let channel = ProcessChannel::default();

        let mut source = channel
            .spawn_reader(
                &Host::Local,
                &Script::from(CommandLine::new("printf").arg("payload")),
            )
            .await
            .unwrap();
        let mut received = Vec::new();
        source.reader.read_to_end(&mut received).await.unwrap();
        source.handle.finish().await.unwrap();
        assert_eq!(received, b"payload");

        let mut sink = channel
            .spawn_writer(&Host::Local, &Script::from(CommandLine::new("cat")))
            .await
            .unwrap();
        sink.writer.write_all(b"payload").await.unwrap();
        sink.writer.shutdown().await.unwrap();
        drop(sink.writer);
        sink.handle.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_stream_reports_stderr() {
        let channel = ProcessChannel::default();
        let script = Script::new([crate::Pipeline::new(
            CommandLine::new("sh").args(["-c", "echo broken >&2; exit 3"]),
        )]);
        let source = channel.spawn_reader(&Host::Local, &script).await.unwrap();
        drop(source.reader);

        let error = source.handle.finish().await.unwrap_err();
        assert!(error.to_string().contains("exit status 3"));
        assert!(error.to_string().contains("broken"));
    }
}
