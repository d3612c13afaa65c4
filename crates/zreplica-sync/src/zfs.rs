//! ZFS snapshot engine adapter
//!
//! Implements [`SnapshotEngine`] by running `zfs` (and `zstd` for
//! producer-side compression) through a [`CommandChannel`].

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};
use zreplica_exec::{CommandChannel, CommandLine, CommandOutput, Pipeline, Script};
use zreplica_types::{
    snapshot_entity, ByteSink, ByteSource, ChangeSet, CompressionLevel, Error, Host, PropertyMap,
    PropertySetting, PropertySource, Result, SnapshotEngine,
};

/// Locations of the binaries the adapter runs on its host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZfsTools {
    /// `zfs` binary
    pub zfs: String,
    /// `zstd` binary
    pub zstd: String,
}

impl Default for ZfsTools {
    fn default() -> Self {
        Self {
            zfs: "zfs".to_string(),
            zstd: "zstd".to_string(),
        }
    }
}

impl From<&zreplica_config::ToolsConfig> for ZfsTools {
    fn from(tools: &zreplica_config::ToolsConfig) -> Self {
        Self {
            zfs: tools.zfs.clone(),
            zstd: tools.zstd.clone(),
        }
    }
}

/// [`SnapshotEngine`] backed by the `zfs` command line on one host
pub struct ZfsEngine {
    host: Host,
    channel: Arc<dyn CommandChannel>,
    tools: ZfsTools,
}

impl std::fmt::Debug for ZfsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZfsEngine")
            .field("host", &self.host)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl ZfsEngine {
    /// Create an adapter for `host`
    pub fn new(host: Host, channel: Arc<dyn CommandChannel>, tools: ZfsTools) -> Self {
        Self {
            host,
            channel,
            tools,
        }
    }

    fn zfs(&self) -> CommandLine {
        CommandLine::new(&self.tools.zfs)
    }

    async fn output(&self, command: CommandLine) -> Result<CommandOutput> {
        trace!(host = %self.host, command = %command, "zfs");
        self.channel.run(&self.host, &Script::from(command)).await
    }

    async fn execute(&self, command: CommandLine) -> Result<String> {
        let rendered = command.to_shell();
        self.output(command).await?.into_result(&rendered)
    }

    fn send_command(&self, path: &str, from: Option<&str>, to: &str, dry_run: bool) -> CommandLine {
        let mut command = self.zfs().arg("send").arg_if(dry_run, "-n").arg_if(dry_run, "-P");
        if let Some(from) = from {
            command = command.arg("-I").arg(snapshot_entity(path, from));
        }
        command.arg(snapshot_entity(path, to))
    }
}

fn missing_dataset(stderr: &str) -> bool {
    stderr.contains("does not exist")
}

/// Parse `zfs get -H -p -o name,property,value` output
pub fn parse_properties(output: &str) -> Result<PropertyMap> {
    let mut properties = PropertyMap::new();
    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        let mut fields = line.splitn(3, '\t');
        match (fields.next(), fields.next(), fields.next()) {
            (Some(entity), Some(property), Some(value)) => {
                properties
                    .entry(entity.to_string())
                    .or_default()
                    .insert(property.to_string(), value.to_string());
            }
            _ => {
                return Err(Error::parse(
                    "zfs get output",
                    format!("expected three tab-separated fields in '{}'", line),
                ))
            }
        }
    }
    Ok(properties)
}

/// Parse `zfs get -H -p -o value,source` output for one property
pub fn parse_property_setting(output: &str) -> Result<PropertySetting> {
    let line = output
        .lines()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| Error::parse("zfs get output", "no property reported"))?;
    match line.split_once('\t') {
        Some((value, source)) => Ok(PropertySetting::new(value, PropertySource::from_zfs(source))),
        None => Err(Error::parse(
            "zfs get output",
            format!("expected value and source in '{}'", line),
        )),
    }
}

/// Parse the `size` line of `zfs send -nP` output
pub fn parse_send_estimate(output: &str) -> Result<u64> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("size"), Some(size)) => Some(size),
                _ => None,
            }
        })
        .last()
        .ok_or_else(|| Error::parse("zfs send -nP output", "no size line"))?
        .parse::<u64>()
        .map_err(|e| Error::parse("zfs send -nP output", format!("invalid size: {}", e)))
}

#[async_trait]
impl SnapshotEngine for ZfsEngine {
    fn host(&self) -> &Host {
        &self.host
    }

    async fn filesystem_exists(&self, path: &str) -> Result<bool> {
        let command = self.zfs().args(["list", "-H", "-o", "name", path]);
        let rendered = command.to_shell();
        let output = self.output(command).await?;

        if output.success() {
            Ok(true)
        } else if missing_dataset(&output.stderr) {
            Ok(false)
        } else {
            output.into_result(&rendered).map(|_| false)
        }
    }

    async fn snapshot_properties(&self, path: &str, names: &[&str]) -> Result<PropertyMap> {
        let command = self
            .zfs()
            .args(["get", "-H", "-p", "-o", "name,property,value", "-t", "snapshot", "-d", "1"])
            .arg(names.join(","))
            .arg(path);
        let rendered = command.to_shell();
        let output = self.output(command).await?;

        if !output.success() && missing_dataset(&output.stderr) {
            return Err(Error::CatalogUnavailable {
                host: self.host.to_string(),
                path: path.to_string(),
            });
        }

        parse_properties(&output.into_result(&rendered)?)
    }

    async fn get_properties(&self, entities: &[String], names: &[&str]) -> Result<PropertyMap> {
        if entities.is_empty() || names.is_empty() {
            return Ok(PropertyMap::new());
        }

        let command = self
            .zfs()
            .args(["get", "-H", "-p", "-o", "name,property,value"])
            .arg(names.join(","))
            .args(entities.iter().cloned());
        parse_properties(&self.execute(command).await?)
    }

    async fn create_snapshot(&self, path: &str, name: &str) -> Result<()> {
        debug!(host = %self.host, "Creating snapshot {}@{}", path, name);
        self.execute(self.zfs().arg("snapshot").arg(snapshot_entity(path, name)))
            .await
            .map(|_| ())
    }

    async fn destroy_snapshot(&self, path: &str, name: &str, recursive: bool) -> Result<()> {
        debug!(host = %self.host, recursive, "Destroying snapshot {}@{}", path, name);
        self.execute(
            self.zfs()
                .arg("destroy")
                .arg_if(recursive, "-r")
                .arg(snapshot_entity(path, name)),
        )
        .await
        .map(|_| ())
    }

    async fn create_filesystem(&self, path: &str) -> Result<()> {
        debug!(host = %self.host, "Creating filesystem {}", path);
        self.execute(self.zfs().args(["create", "-p", path]))
            .await
            .map(|_| ())
    }

    async fn destroy_filesystem(&self, path: &str) -> Result<()> {
        debug!(host = %self.host, "Destroying filesystem {}", path);
        self.execute(self.zfs().args(["destroy", "-r", path]))
            .await
            .map(|_| ())
    }

    async fn diff(&self, path: &str, from: &str, to: &str) -> Result<ChangeSet> {
        let command = self
            .zfs()
            .args(["diff", "-H"])
            .arg(snapshot_entity(path, from))
            .arg(snapshot_entity(path, to));
        Ok(ChangeSet::from_output(&self.execute(command).await?))
    }

    async fn estimate_export(&self, path: &str, from: Option<&str>, to: &str) -> Result<u64> {
        let command = self.send_command(path, from, to, true);
        let rendered = command.to_shell();
        let output = self.output(command).await?;
        let stderr = output.stderr.clone();
        let stdout = output.into_result(&rendered)?;

        // Older releases print the dry-run summary on stderr.
        parse_send_estimate(&stdout).or_else(|_| parse_send_estimate(&stderr))
    }

    async fn export_stream(
        &self,
        path: &str,
        from: Option<&str>,
        to: &str,
        compression: Option<CompressionLevel>,
    ) -> Result<ByteSource> {
        let mut pipeline = Pipeline::new(self.send_command(path, from, to, false));
        if let Some(level) = compression {
            pipeline = pipeline.pipe(
                CommandLine::new(&self.tools.zstd)
                    .arg("-c")
                    .arg("-q")
                    .arg(format!("-{}", level.get())),
            );
        }
        debug!(host = %self.host, pipeline = %pipeline.to_shell(), "Starting export");
        self.channel
            .spawn_reader(&self.host, &Script::from(pipeline))
            .await
    }

    async fn import_stream(&self, path: &str) -> Result<ByteSink> {
        let command = self.zfs().args(["receive", "-u", path]);
        debug!(host = %self.host, command = %command, "Starting import");
        self.channel
            .spawn_writer(&self.host, &Script::from(command))
            .await
    }

    async fn rollback(&self, path: &str, snapshot: &str) -> Result<()> {
        self.execute(
            self.zfs()
                .args(["rollback", "-r"])
                .arg(snapshot_entity(path, snapshot)),
        )
        .await
        .map(|_| ())
    }

    async fn get_property(&self, entity: &str, name: &str) -> Result<PropertySetting> {
        let command = self
            .zfs()
            .args(["get", "-H", "-p", "-o", "value,source", name, entity]);
        parse_property_setting(&self.execute(command).await?)
    }

    async fn inherit_property(&self, entity: &str, name: &str, received: bool) -> Result<()> {
        self.execute(
            self.zfs()
                .arg("inherit")
                .arg_if(received, "-S")
                .arg(name)
                .arg(entity),
        )
        .await
        .map(|_| ())
    }

    async fn set_property(&self, entity: &str, name: &str, value: &str) -> Result<()> {
        self.execute(
            self.zfs()
                .arg("set")
                .arg(format!("{}={}", name, value))
                .arg(entity),
        )
        .await
        .map(|_| ())
    }

    async fn guard_for_receive(&self, path: &str, ancestor: Option<&str>) -> Result<()> {
        let mut commands = vec![self.zfs().args(["set", "readonly=on", path])];
        if let Some(ancestor) = ancestor {
            commands.push(
                self.zfs()
                    .args(["rollback", "-r"])
                    .arg(snapshot_entity(path, ancestor)),
            );
        }
        let script = Script::new(commands);
        let rendered = script.to_shell();
        self.channel
            .run(&self.host, &script)
            .await?
            .into_result(&rendered)
            .map(|_| ())
    }
}
