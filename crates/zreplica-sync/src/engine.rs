//! Replication run driver
//!
//! One [`Replicator`] performs one run: tag the source, read both catalogs,
//! find the common ancestor, reclaim space on the target, transfer, verify,
//! then sweep superseded tags on both sides. Any failure after tagging
//! destroys the fresh tag so a dead run leaves nothing behind on the source.

use crate::catalog::read_catalog;
use crate::matcher::{match_catalogs, MatchResult};
use crate::progress::{ProgressEvent, ProgressReporter, ReplicationPhase};
use crate::pruner::reclaim;
use crate::retention::sweep_tagged;
use crate::tag::{RunTag, TagScheme};
use crate::transfer::{TransferOptions, TransferOrchestrator};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use zreplica_config::Config;
use zreplica_types::{
    parent_filesystem, Catalog, Endpoint, Error, FreeFraction, Result, RunId, RunOutcome,
    RunReport, SnapshotEngine, TransferOutcome,
};

/// What to replicate
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationRequest {
    /// Source filesystem
    pub source: Endpoint,
    /// Target filesystem on the local host
    pub target_path: String,
    /// Fraction of the target that must be free before a transfer
    pub min_free_fraction: FreeFraction,
}

impl ReplicationRequest {
    /// Create a request
    pub fn new<S: Into<String>>(
        source: Endpoint,
        target_path: S,
        min_free_fraction: FreeFraction,
    ) -> Self {
        Self {
            source,
            target_path: target_path.into(),
            min_free_fraction,
        }
    }
}

/// How runs are carried out
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationOptions {
    /// Naming of tool-created snapshots
    pub scheme: TagScheme,
    /// Stream pipeline settings
    pub transfer: TransferOptions,
}

impl ReplicationOptions {
    /// Derive options from configuration; `host_id` is used when the
    /// configuration does not name one
    pub fn from_config(config: &Config, host_id: &str) -> Result<Self> {
        let host_id = config.replication.host_id.as_deref().unwrap_or(host_id);
        Ok(Self {
            scheme: TagScheme::new(config.replication.tag_prefix.clone(), host_id)?,
            transfer: TransferOptions::from(&config.transfer),
        })
    }
}

/// Drives one replication run between a source and a target engine
pub struct Replicator {
    run_id: RunId,
    source: Arc<dyn SnapshotEngine>,
    target: Arc<dyn SnapshotEngine>,
    options: ReplicationOptions,
    progress: ProgressReporter,
}

impl Replicator {
    /// Create a replicator with a fresh run id
    pub fn new(
        source: Arc<dyn SnapshotEngine>,
        target: Arc<dyn SnapshotEngine>,
        options: ReplicationOptions,
    ) -> Self {
        let run_id = Uuid::new_v4();
        let progress = ProgressReporter::new(run_id, options.transfer.progress_interval);
        Self {
            run_id,
            source,
            target,
            options,
            progress,
        }
    }

    /// Run identifier attached to logs and the report
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Options in effect
    pub fn options(&self) -> &ReplicationOptions {
        &self.options
    }

    /// Progress reporter of this run
    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    /// Take the progress event stream (once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ProgressEvent>> {
        self.progress.take_event_receiver()
    }

    /// Run once and describe how it ended
    pub async fn run(&self, request: &ReplicationRequest) -> RunReport {
        let started = Instant::now();
        let span = info_span!(
            "replicate",
            run_id = %self.run_id,
            source = %request.source,
            target = %request.target_path
        );
        let outcome = self.replicate(request).instrument(span).await;

        RunReport {
            run_id: self.run_id,
            source: request.source.clone(),
            target_path: request.target_path.clone(),
            elapsed: started.elapsed(),
            outcome,
        }
    }

    /// Run once with a tag stamped now
    pub async fn replicate(&self, request: &ReplicationRequest) -> Result<RunOutcome> {
        let tag = RunTag::now(&self.options.scheme);
        self.replicate_with_tag(request, &tag).await
    }

    /// Run once with the given tag
    pub async fn replicate_with_tag(
        &self,
        request: &ReplicationRequest,
        tag: &RunTag,
    ) -> Result<RunOutcome> {
        self.progress.set_phase(ReplicationPhase::Tagging).await;
        self.source
            .create_snapshot(&request.source.path, tag.name())
            .await?;
        info!("Created {}@{} on {}", request.source.path, tag, self.source.host());

        match self.replicate_tagged(request, tag).await {
            Ok(outcome) => {
                if let RunOutcome::AlreadyInSync { ancestor } = &outcome {
                    info!("No changes since {}, discarding {}", ancestor, tag);
                    self.discard_tag(request, tag).await;
                }
                self.progress.completed().await;
                Ok(outcome)
            }
            Err(e) => {
                self.discard_tag(request, tag).await;
                self.progress.failed(e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn replicate_tagged(
        &self,
        request: &ReplicationRequest,
        tag: &RunTag,
    ) -> Result<RunOutcome> {
        let source_path = request.source.path.as_str();
        let target_path = request.target_path.as_str();

        self.progress.set_phase(ReplicationPhase::ReadingCatalogs).await;
        let source_catalog = read_catalog(self.source.as_ref(), source_path).await?;
        let (mut target_exists, target_catalog) = self.read_target_catalog(target_path).await?;

        self.progress.set_phase(ReplicationPhase::Matching).await;
        let ancestor = match match_catalogs(&source_catalog, &target_catalog) {
            MatchResult::NoTargetHistory => None,
            MatchResult::NoMatch => {
                return Err(Error::NoCommonAncestor {
                    source_path: request.source.to_string(),
                    target_path: target_path.to_string(),
                })
            }
            MatchResult::Matched(ancestor) => {
                let changes = self
                    .source
                    .diff(source_path, &ancestor.name, tag.name())
                    .await?;
                if changes.is_empty() {
                    return Ok(RunOutcome::AlreadyInSync {
                        ancestor: ancestor.name,
                    });
                }
                info!(
                    changes = changes.len(),
                    "Common ancestor is {}", ancestor.name
                );
                Some(ancestor)
            }
        };

        if ancestor.is_none() && target_exists {
            info!("{} holds no snapshots, recreating it", target_path);
            self.target.destroy_filesystem(target_path).await?;
            target_exists = false;
        }

        self.progress.set_phase(ReplicationPhase::Pruning).await;
        let ancestor_name = ancestor.as_ref().map(|a| a.name.clone());
        if target_exists {
            let protect: Vec<&str> = ancestor_name.as_deref().into_iter().collect();
            let pruned = reclaim(
                self.target.as_ref(),
                target_path,
                request.min_free_fraction,
                &self.options.scheme,
                &protect,
            )
            .await?;
            if !pruned.satisfied {
                return Err(Error::SpaceReclaimExhausted {
                    target: target_path.to_string(),
                    available: pruned.usage.available,
                    required: pruned.required,
                });
            }

            if let Some(ancestor) = &ancestor {
                let rebuilt = read_catalog(self.target.as_ref(), target_path).await?;
                let still_there = rebuilt
                    .get(&ancestor.name)
                    .is_some_and(|s| s.created == ancestor.created);
                if !still_there {
                    return Err(Error::NoCommonAncestor {
                        source_path: request.source.to_string(),
                        target_path: target_path.to_string(),
                    });
                }
            }
        } else {
            self.check_parent_space(target_path, request.min_free_fraction)
                .await?;
        }

        let orchestrator = TransferOrchestrator::new(
            self.source.as_ref(),
            self.target.as_ref(),
            self.options.transfer,
            &self.progress,
        );
        let plan = orchestrator
            .plan(
                &request.source,
                target_path,
                target_exists,
                request.min_free_fraction,
                ancestor_name,
                tag.name(),
            )
            .await?;

        let bytes = match orchestrator.transfer(&plan).await? {
            TransferOutcome::Success { bytes } => bytes,
            TransferOutcome::PartialFailure { reached, .. } => {
                return Err(Error::TransferPartialFailure {
                    target: target_path.to_string(),
                    snapshot: tag.name().to_string(),
                    reached,
                })
            }
            TransferOutcome::TotalFailure { .. } => {
                return Err(Error::TransferTotalFailure {
                    target: target_path.to_string(),
                    snapshot: tag.name().to_string(),
                })
            }
        };

        self.progress.set_phase(ReplicationPhase::Sweeping).await;
        self.sweep(self.source.as_ref(), source_path).await;
        self.sweep(self.target.as_ref(), target_path).await;

        Ok(RunOutcome::Replicated {
            snapshot: tag.name().to_string(),
            incremental: plan.is_incremental(),
            bytes,
        })
    }

    async fn read_target_catalog(&self, target_path: &str) -> Result<(bool, Catalog)> {
        match read_catalog(self.target.as_ref(), target_path).await {
            Ok(catalog) => Ok((true, catalog)),
            Err(Error::CatalogUnavailable { .. }) => {
                info!("{} does not exist yet, first sync", target_path);
                Ok((false, Catalog::new(target_path)))
            }
            Err(e) => Err(e),
        }
    }

    /// Threshold check for a target that does not exist yet; nothing can be pruned
    async fn check_parent_space(&self, target_path: &str, fraction: FreeFraction) -> Result<()> {
        let Some(parent) = parent_filesystem(target_path) else {
            return Ok(());
        };
        if !self.target.filesystem_exists(parent).await? {
            return Ok(());
        }

        let usage = self.target.space_usage(parent).await?;
        if usage.satisfies(fraction) {
            return Ok(());
        }
        Err(Error::FreeSpaceBelowThreshold {
            filesystem: parent.to_string(),
            available: usage.available,
            required: usage.required_free(fraction),
        })
    }

    async fn sweep(&self, engine: &dyn SnapshotEngine, path: &str) {
        match sweep_tagged(engine, path, &self.options.scheme).await {
            Ok(report) => debug!(
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                "Swept {} on {}",
                path,
                engine.host()
            ),
            Err(e) => warn!("Sweeping {} on {} failed: {}", path, engine.host(), e),
        }
    }

    async fn discard_tag(&self, request: &ReplicationRequest, tag: &RunTag) {
        if let Err(e) = self
            .source
            .destroy_snapshot(&request.source.path, tag.name(), false)
            .await
        {
            warn!("Could not remove {}@{}: {}", request.source.path, tag, e);
        }
    }
}
