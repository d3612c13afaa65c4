//! Retention of tool-created snapshots

use crate::catalog::read_catalog;
use crate::tag::TagScheme;
use tracing::{info, warn};
use zreplica_types::{Result, SnapshotEngine};

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tags that were destroyed
    pub deleted: Vec<String>,
    /// Tags whose deletion failed
    pub failed: Vec<String>,
}

/// Delete every tagged snapshot of `path` except the newest
///
/// Non-tagged snapshots are never touched. Individual deletion failures are
/// logged and skipped; only failing to read the catalog is an error.
pub async fn sweep_tagged(
    engine: &dyn SnapshotEngine,
    path: &str,
    scheme: &TagScheme,
) -> Result<SweepReport> {
    let catalog = read_catalog(engine, path).await?;
    let mut report = SweepReport::default();

    let superseded: Vec<String> = catalog
        .newest_first()
        .into_iter()
        .filter(|snapshot| scheme.is_tagged(&snapshot.name))
        .skip(1)
        .map(|snapshot| snapshot.name.clone())
        .collect();

    for name in superseded {
        match engine.destroy_snapshot(path, &name, false).await {
            Ok(()) => {
                info!(host = %engine.host(), "Removed superseded tag {}@{}", path, name);
                report.deleted.push(name);
            }
            Err(e) => {
                warn!(host = %engine.host(), "Could not remove {}@{}: {}", path, name, e);
                report.failed.push(name);
            }
        }
    }

    Ok(report)
}
