//! Transfer orchestration
//!
//! Runs one planned transfer end to end: space check against the estimate,
//! target guard, stream pump, verification and restoration of the target's
//! `readonly` property. Deleting the run tag after a failure is left to the
//! caller, which owns the tag.

use crate::pipeline::{run_pipeline, PipelineOptions};
use crate::progress::{ProgressReporter, ReplicationPhase};
use std::time::Duration;
use tracing::{debug, info, warn};
use zreplica_types::{
    parent_filesystem, props, BufferSize, CompressionLevel, Endpoint, Error, FreeFraction,
    PropertySetting, ReplicationPlan, Result, SnapshotEngine, TransferOutcome,
};

/// Stream shaping and reporting settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Producer-side compression level, `None` to send raw
    pub compression: Option<CompressionLevel>,
    /// Decoupling buffer capacity
    pub buffer: BufferSize,
    /// Interval between progress log lines
    pub progress_interval: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            compression: Some(CompressionLevel::default()),
            buffer: BufferSize::default(),
            progress_interval: Duration::from_secs(5),
        }
    }
}

impl From<&zreplica_config::TransferConfig> for TransferOptions {
    fn from(config: &zreplica_config::TransferConfig) -> Self {
        Self {
            compression: config.compression(),
            buffer: config.buffer_size,
            progress_interval: config.progress_interval(),
        }
    }
}

/// Runs planned transfers from one source engine to one target engine
pub struct TransferOrchestrator<'a> {
    source: &'a dyn SnapshotEngine,
    target: &'a dyn SnapshotEngine,
    options: TransferOptions,
    progress: &'a ProgressReporter,
}

impl<'a> TransferOrchestrator<'a> {
    /// Create an orchestrator
    pub fn new(
        source: &'a dyn SnapshotEngine,
        target: &'a dyn SnapshotEngine,
        options: TransferOptions,
        progress: &'a ProgressReporter,
    ) -> Self {
        Self {
            source,
            target,
            options,
            progress,
        }
    }

    /// Dry-run the export and build the plan
    #[allow(clippy::too_many_arguments)]
    pub async fn plan(
        &self,
        source: &Endpoint,
        target_path: &str,
        target_exists: bool,
        min_free_fraction: FreeFraction,
        common_ancestor: Option<String>,
        new_snapshot: &str,
    ) -> Result<ReplicationPlan> {
        self.progress.set_phase(ReplicationPhase::Estimating).await;
        let estimated_bytes = self
            .source
            .estimate_export(&source.path, common_ancestor.as_deref(), new_snapshot)
            .await?;
        debug!(estimated_bytes, "Estimated stream size");

        Ok(ReplicationPlan {
            source: source.clone(),
            target_path: target_path.to_string(),
            target_exists,
            min_free_fraction,
            common_ancestor,
            new_snapshot: new_snapshot.to_string(),
            estimated_bytes,
        })
    }

    /// Run the planned transfer and report what landed
    pub async fn transfer(&self, plan: &ReplicationPlan) -> Result<TransferOutcome> {
        if plan.target_exists && plan.common_ancestor.is_none() {
            return Err(Error::other(format!(
                "refusing a full transfer into existing {}",
                plan.target_path
            )));
        }

        self.check_space(plan).await?;

        let saved_readonly = if plan.target_exists {
            let saved = self
                .target
                .get_property(&plan.target_path, props::READONLY)
                .await?;
            debug!("Saved readonly={} on {}", saved, plan.target_path);
            let guarded = self
                .target
                .guard_for_receive(&plan.target_path, plan.common_ancestor.as_deref())
                .await;
            if let Err(e) = guarded {
                self.restore_readonly(&plan.target_path, &saved).await;
                return Err(e);
            }
            Some(saved)
        } else {
            self.prepare_parent(&plan.target_path).await?;
            None
        };

        let outcome = self.stream_and_verify(plan).await;

        if let Some(saved) = &saved_readonly {
            self.restore_readonly(&plan.target_path, saved).await;
        }

        outcome
    }

    /// Filesystem whose free space the stream will consume: the target, or
    /// its nearest existing ancestor on a first sync
    async fn space_anchor<'p>(&self, plan: &'p ReplicationPlan) -> Result<&'p str> {
        if plan.target_exists {
            return Ok(&plan.target_path);
        }

        let mut candidate = parent_filesystem(&plan.target_path);
        while let Some(path) = candidate {
            if self.target.filesystem_exists(path).await? {
                return Ok(path);
            }
            candidate = parent_filesystem(path);
        }
        Err(Error::CatalogUnavailable {
            host: self.target.host().to_string(),
            path: plan.target_path.clone(),
        })
    }

    async fn check_space(&self, plan: &ReplicationPlan) -> Result<()> {
        let anchor = self.space_anchor(plan).await?;
        let usage = self.target.space_usage(anchor).await?;

        if usage.available < plan.estimated_bytes {
            return Err(Error::InsufficientSpaceForEstimate {
                target: anchor.to_string(),
                estimated: plan.estimated_bytes,
                available: usage.available,
            });
        }
        Ok(())
    }

    async fn prepare_parent(&self, target_path: &str) -> Result<()> {
        if let Some(parent) = parent_filesystem(target_path) {
            if !self.target.filesystem_exists(parent).await? {
                info!("Creating parent filesystem {}", parent);
                self.target.create_filesystem(parent).await?;
            }
        }
        Ok(())
    }

    /// Put `readonly` back with its original source, so an inherited value
    /// is inherited again rather than pinned locally
    async fn restore_readonly(&self, target_path: &str, saved: &PropertySetting) {
        if let Err(e) = self
            .target
            .restore_property(target_path, props::READONLY, saved)
            .await
        {
            let failure = Error::PropertyRestoreFailure {
                entity: target_path.to_string(),
                property: props::READONLY.to_string(),
                message: e.to_string(),
            };
            warn!("{}", failure);
        } else {
            debug!("Restored readonly={} on {}", saved, target_path);
        }
    }

    async fn stream_and_verify(&self, plan: &ReplicationPlan) -> Result<TransferOutcome> {
        info!(
            incremental = plan.is_incremental(),
            estimated_bytes = plan.estimated_bytes,
            "Sending {}@{} to {}",
            plan.source.path,
            plan.new_snapshot,
            plan.target_path
        );

        let source_stream = self
            .source
            .export_stream(
                &plan.source.path,
                plan.common_ancestor.as_deref(),
                &plan.new_snapshot,
                self.options.compression,
            )
            .await?;
        let sink = match self.target.import_stream(&plan.target_path).await {
            Ok(sink) => sink,
            Err(e) => {
                drop(source_stream.reader);
                if let Err(producer) = source_stream.handle.finish().await {
                    debug!("Export ended after import failed to start: {}", producer);
                }
                return Err(e);
            }
        };

        self.progress.transfer_started(plan.estimated_bytes).await;
        let stats = run_pipeline(
            source_stream,
            sink,
            PipelineOptions {
                compressed: self.options.compression.is_some(),
                buffer: self.options.buffer,
            },
            self.progress,
        )
        .await;
        for error in &stats.errors {
            warn!("Transfer stream error: {}", error);
        }

        self.progress.set_phase(ReplicationPhase::Verifying).await;
        self.verify(plan, stats.bytes).await
    }

    /// Look at the target to decide what the transfer achieved
    pub async fn verify(&self, plan: &ReplicationPlan, bytes: u64) -> Result<TransferOutcome> {
        if !self.target.filesystem_exists(&plan.target_path).await? {
            return Ok(TransferOutcome::TotalFailure { bytes });
        }

        let catalog = crate::catalog::read_catalog(self.target, &plan.target_path).await?;
        if catalog.contains(&plan.new_snapshot) {
            info!(bytes, "{}@{} landed", plan.target_path, plan.new_snapshot);
            return Ok(TransferOutcome::Success { bytes });
        }

        let advanced = match (catalog.newest(), plan.common_ancestor.as_deref()) {
            (Some(newest), Some(ancestor)) if newest.name != ancestor => Some(newest.name.clone()),
            (Some(newest), None) => Some(newest.name.clone()),
            _ => None,
        };

        Ok(match advanced {
            Some(reached) => TransferOutcome::PartialFailure { bytes, reached },
            None => TransferOutcome::TotalFailure { bytes },
        })
    }
}
