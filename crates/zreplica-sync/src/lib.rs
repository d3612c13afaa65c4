//! Incremental snapshot replication for zreplica
//!
//! This crate holds the replication decision engine:
//!
//! - **Catalogs**: snapshot sets of one filesystem, read in two round-trips
//! - **Matching**: the newest snapshot both sides share, by creation time
//! - **Pruning**: oldest-first reclamation of non-tagged target snapshots
//! - **Transfer**: export to import pump with verification on the target
//! - **Retention**: only the newest tool-created snapshot survives a sync
//!
//! [`ZfsEngine`] adapts the `zfs` command line to the
//! [`SnapshotEngine`](zreplica_types::SnapshotEngine) contract.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zreplica_exec::{ProcessChannel, SshOptions};
//! use zreplica_sync::{ReplicationOptions, ReplicationRequest, Replicator, ZfsEngine, ZfsTools};
//! use zreplica_types::{Endpoint, FreeFraction, Host};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let channel = Arc::new(ProcessChannel::new(SshOptions::default()));
//! let source: Endpoint = "backup@nas:tank/data".parse()?;
//! let source_engine = ZfsEngine::new(source.host.clone(), channel.clone(), ZfsTools::default());
//! let target_engine = ZfsEngine::new(Host::Local, channel, ZfsTools::default());
//!
//! let options = ReplicationOptions::from_config(&Default::default(), "backup-host")?;
//! let replicator = Replicator::new(Arc::new(source_engine), Arc::new(target_engine), options);
//! let request = ReplicationRequest::new(source, "pool/data", FreeFraction::default());
//! let report = replicator.run(&request).await;
//! println!("exit code {}", report.exit_code());
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod catalog;
pub mod engine;
pub mod matcher;
pub mod pipeline;
pub mod progress;
pub mod pruner;
pub mod report;
pub mod retention;
pub mod tag;
pub mod transfer;
pub mod zfs;

pub use catalog::{own_snapshots, read_catalog};
pub use engine::{ReplicationOptions, ReplicationRequest, Replicator};
pub use matcher::{match_catalogs, MatchResult};
pub use pipeline::{run_pipeline, PipelineOptions, PipelineStats};
pub use progress::{ProgressEvent, ProgressReporter, ReplicationPhase, TransferProgress};
pub use pruner::{ensure_free_space, reclaim, reclaimable, PruneOutcome};
pub use report::{format_bytes, format_duration, log_summary, summary_line};
pub use retention::{sweep_tagged, SweepReport};
pub use tag::{RunTag, TagScheme};
pub use transfer::{TransferOptions, TransferOrchestrator};
pub use zfs::{parse_properties, parse_property_setting, parse_send_estimate, ZfsEngine, ZfsTools};
