//! zreplica - incremental ZFS snapshot replication
//!
//! Pulls a filesystem from a remote host into a local pool, resuming from
//! the newest snapshot both sides already share.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use zreplica_config::{Config, ConfigBuilder, ConfigLoader, LoggingConfig};
use zreplica_exec::{node_name, CommandChannel, ProcessChannel, SshOptions};
use zreplica_sync::{
    log_summary, ProgressEvent, ReplicationOptions, ReplicationPhase, ReplicationRequest,
    Replicator, ZfsEngine, ZfsTools,
};
use zreplica_types::{BufferSize, Endpoint, FreeFraction, Host};

/// zreplica - incremental ZFS snapshot replication
#[derive(Parser, Debug)]
#[command(
    name = "zreplica",
    version = env!("CARGO_PKG_VERSION"),
    about = "Incremental ZFS snapshot replication over ssh",
    long_about = "zreplica pulls a ZFS filesystem from a remote host into a local pool.\n\
                  It sends only the changes since the newest snapshot both sides share,\n\
                  prunes old target snapshots when space runs low and keeps one\n\
                  tool-created snapshot per side as the next common ancestor."
)]
struct Cli {
    /// Source filesystem, `[user@]host:path`
    #[arg(required_unless_present = "write_config")]
    source: Option<Endpoint>,

    /// Local target filesystem
    #[arg(value_parser = parse_target, required_unless_present = "write_config")]
    target: Option<String>,

    /// Fraction of the target that must stay free, in [0, 1)
    #[arg(value_parser = parse_fraction)]
    min_free_fraction: Option<FreeFraction>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Verbose mode - detailed output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode - only the summary line
    #[arg(short, long)]
    quiet: bool,

    /// Send the stream uncompressed
    #[arg(long)]
    no_compress: bool,

    /// Decoupling buffer capacity in bytes, 0 disables it
    #[arg(long, value_parser = parse_buffer_size)]
    buffer_size: Option<BufferSize>,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Host identity embedded in snapshot tags
    #[arg(long)]
    host_id: Option<String>,

    /// Write the effective configuration to this file and exit
    #[arg(long, value_name = "PATH")]
    write_config: Option<PathBuf>,
}

fn parse_fraction(value: &str) -> std::result::Result<FreeFraction, String> {
    let fraction: f64 = value
        .parse()
        .map_err(|e| format!("'{}' is not a number: {}", value, e))?;
    FreeFraction::new(fraction)
}

fn parse_buffer_size(value: &str) -> std::result::Result<BufferSize, String> {
    let size: usize = value
        .parse()
        .map_err(|e| format!("'{}' is not a byte count: {}", value, e))?;
    BufferSize::new(size)
}

fn parse_target(value: &str) -> std::result::Result<String, String> {
    let endpoint: Endpoint = value.parse().map_err(|e: zreplica_types::Error| e.to_string())?;
    if endpoint.host.is_remote() {
        return Err("the target must be a local filesystem".to_string());
    }
    Ok(endpoint.path)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let mut config =
        ConfigLoader::load(cli.config.as_deref()).context("Failed to load configuration")?;
    apply_overrides(&mut config, &cli);
    ConfigBuilder::validate(&config).context("Invalid configuration")?;

    if let Some(path) = &cli.write_config {
        write_config(&config, path)?;
        println!("Configuration written to {}", style(path.display()).cyan());
        return Ok(0);
    }
    let (Some(source), Some(target)) = (cli.source.clone(), cli.target.clone()) else {
        return Err(anyhow!("a source and a target filesystem are required"));
    };

    let _log_guard = init_logging(&cli, &config.logging)?;
    info!("zreplica v{} starting", env!("CARGO_PKG_VERSION"));

    let channel: Arc<dyn CommandChannel> = Arc::new(ProcessChannel::new(ssh_options(&config)));
    let host_id = match &config.replication.host_id {
        Some(host_id) => host_id.clone(),
        None => node_name(channel.as_ref(), &Host::Local)
            .await
            .context("Failed to determine the local host name")?,
    };
    debug!("Tagging snapshots as host {}", host_id);

    let options = ReplicationOptions::from_config(&config, &host_id)?;
    let tools = ZfsTools::from(&config.tools);
    let source_engine = ZfsEngine::new(source.host.clone(), Arc::clone(&channel), tools.clone());
    let target_engine = ZfsEngine::new(Host::Local, channel, tools);

    let mut replicator =
        Replicator::new(Arc::new(source_engine), Arc::new(target_engine), options);
    let request = ReplicationRequest::new(
        source,
        target,
        cli.min_free_fraction
            .unwrap_or(config.replication.min_free_fraction),
    );

    let progress_task = replicator
        .take_event_receiver()
        .map(|events| tokio::spawn(drive_progress_bar(events, cli.quiet)));

    let report = replicator.run(&request).await;
    drop(replicator);
    if let Some(task) = progress_task {
        if let Err(e) = task.await {
            debug!("Progress display ended abnormally: {}", e);
        }
    }

    let line = log_summary(&report);
    if report.is_success() {
        println!("{}", style(line).green());
    } else {
        println!("{}", style(line).red());
    }

    Ok(report.exit_code())
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if cli.no_compress {
        config.transfer.compress = false;
    }
    if let Some(buffer_size) = cli.buffer_size {
        config.transfer.buffer_size = buffer_size;
    }
    if let Some(log_file) = &cli.log_file {
        config.logging.log_file = Some(log_file.clone());
    }
    if let Some(host_id) = &cli.host_id {
        config.replication.host_id = Some(host_id.clone());
    }
}

fn write_config(config: &Config, path: &Path) -> Result<()> {
    ConfigLoader::save_to_file(config, path)
        .with_context(|| format!("Failed to write configuration to {}", path.display()))
}

fn ssh_options(config: &Config) -> SshOptions {
    SshOptions {
        program: config.tools.ssh.clone(),
        port: config.ssh.port,
        identity_file: config.ssh.identity_file.clone(),
        options: config.ssh.options.clone(),
    }
}

fn init_logging(cli: &Cli, logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else if cli.quiet {
        "error"
    } else {
        logging.level.as_str()
    };

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let (file_layer, guard) = match &logging.log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow!("log file {} has no file name", path.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(directory, file_name));
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

fn phase_label(phase: ReplicationPhase) -> &'static str {
    match phase {
        ReplicationPhase::Tagging => "Tagging source...",
        ReplicationPhase::ReadingCatalogs => "Reading snapshot catalogs...",
        ReplicationPhase::Matching => "Looking for a common ancestor...",
        ReplicationPhase::Pruning => "Reclaiming target space...",
        ReplicationPhase::Estimating => "Estimating stream size...",
        ReplicationPhase::Transferring => "Transferring",
        ReplicationPhase::Verifying => "Verifying target...",
        ReplicationPhase::Sweeping => "Removing superseded tags...",
        ReplicationPhase::Completed => "Done",
        ReplicationPhase::Failed => "Failed",
    }
}

async fn drive_progress_bar(mut events: UnboundedReceiver<ProgressEvent>, quiet: bool) {
    let bar = if quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        bar
    };

    while let Some(event) = events.recv().await {
        match event {
            ProgressEvent::PhaseChanged(phase) => bar.set_message(phase_label(phase)),
            ProgressEvent::TransferStarted(estimated) => {
                bar.set_style(
                    ProgressStyle::with_template(
                        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] \
                         {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
                );
                bar.set_length(estimated);
                bar.set_position(0);
            }
            ProgressEvent::Update(progress) => bar.set_position(progress.bytes_transferred),
            ProgressEvent::Completed(_) => bar.finish_and_clear(),
            ProgressEvent::Failed(_) => bar.abandon(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rstest::rstest;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_positional_arguments() {
        let cli = Cli::try_parse_from(["zreplica", "backup@nas:tank/data", "pool/data", "0.25"])
            .unwrap();
        let source = cli.source.unwrap();
        assert_eq!(source.path, "tank/data");
        assert!(source.host.is_remote());
        assert_eq!(cli.target.as_deref(), Some("pool/data"));
        assert_eq!(cli.min_free_fraction.unwrap().get(), 0.25);
    }

    #[rstest]
    #[case(&["zreplica", "nas:tank/data", "pool/data", "1.5"])]
    #[case(&["zreplica", "nas:tank/data", "other:pool/data"])]
    #[case(&["zreplica", "nas:tank/data", "pool/data", "--buffer-size", "10"])]
    #[case(&["zreplica", "nas:tank/data"])]
    #[case(&["zreplica"])]
    fn test_rejected_arguments(#[case] args: &[&str]) {
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let cli = Cli::try_parse_from([
            "zreplica",
            "nas:tank/data",
            "pool/data",
            "--no-compress",
            "--buffer-size",
            "0",
            "--host-id",
            "backup-1",
        ])
        .unwrap();

        let mut config = Config::default();
        apply_overrides(&mut config, &cli);
        assert!(!config.transfer.compress);
        assert!(!config.transfer.buffer_size.is_enabled());
        assert_eq!(config.replication.host_id.as_deref(), Some("backup-1"));
        assert!(ConfigBuilder::validate(&config).is_ok());
    }

    #[rstest]
    #[case("zreplica.toml")]
    #[case("zreplica.yaml")]
    fn test_write_config_keeps_overrides(#[case] file_name: &str) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(file_name);
        let cli = Cli::try_parse_from([
            "zreplica",
            "--write-config",
            path.to_str().unwrap(),
            "--no-compress",
            "--host-id",
            "archive",
        ])
        .unwrap();
        assert!(cli.source.is_none());

        let mut config = Config::default();
        apply_overrides(&mut config, &cli);
        write_config(&config, cli.write_config.as_deref().unwrap()).unwrap();

        let written = ConfigLoader::load(Some(path.as_path())).unwrap();
        assert!(!written.transfer.compress);
        assert_eq!(written.replication.host_id.as_deref(), Some("archive"));
    }
}
