//! Target space reclamation
//!
//! Deletes non-tagged target snapshots, oldest first, until the free-space
//! threshold is met. The newest non-tagged snapshot, every tagged snapshot
//! and any explicitly protected snapshot survive, so at most `count - 1`
//! deletions happen.

use crate::catalog::read_catalog;
use crate::tag::TagScheme;
use tracing::{debug, info};
use zreplica_types::{FreeFraction, Result, Snapshot, SnapshotEngine, SpaceUsage};

/// What a reclamation pass did and where it ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneOutcome {
    /// Whether the threshold is met
    pub satisfied: bool,
    /// Last measurement
    pub usage: SpaceUsage,
    /// Bytes the threshold requires to be free
    pub required: u64,
    /// Snapshots destroyed, oldest first
    pub deleted: Vec<String>,
}

/// Non-tagged snapshots of the catalog that may ever be deleted, newest first
///
/// The newest non-tagged snapshot is excluded.
pub fn reclaimable<'a>(
    snapshots: impl IntoIterator<Item = &'a Snapshot>,
    scheme: &TagScheme,
    protect: &[&str],
) -> Vec<&'a Snapshot> {
    snapshots
        .into_iter()
        .filter(|snapshot| !scheme.is_tagged(&snapshot.name))
        .skip(1)
        .filter(|snapshot| !protect.contains(&snapshot.name.as_str()))
        .collect()
}

/// Free space on `path` by deleting reclaimable snapshots
pub async fn reclaim(
    engine: &dyn SnapshotEngine,
    path: &str,
    min_free_fraction: FreeFraction,
    scheme: &TagScheme,
    protect: &[&str],
) -> Result<PruneOutcome> {
    let mut usage = engine.space_usage(path).await?;
    let required = usage.required_free(min_free_fraction);
    let mut deleted = Vec::new();

    if usage.satisfies(min_free_fraction) {
        debug!(
            available = usage.available,
            required, "{} already meets the free-space threshold", path
        );
        return Ok(PruneOutcome {
            satisfied: true,
            usage,
            required,
            deleted,
        });
    }

    let catalog = read_catalog(engine, path).await?;
    let ordered = catalog.newest_first();
    let candidates = reclaimable(ordered.iter().copied(), scheme, protect);

    for victim in candidates.iter().rev() {
        if usage.satisfies(min_free_fraction) {
            break;
        }
        info!(
            available = usage.available,
            required,
            referenced = victim.referenced,
            "Pruning {}@{}",
            path,
            victim.name
        );
        engine.destroy_snapshot(path, &victim.name, true).await?;
        deleted.push(victim.name.clone());
        usage = engine.space_usage(path).await?;
    }

    let satisfied = usage.satisfies(min_free_fraction);
    info!(
        deleted = deleted.len(),
        available = usage.available,
        required,
        satisfied,
        "Space reclamation on {} finished",
        path
    );

    Ok(PruneOutcome {
        satisfied,
        usage,
        required: usage.required_free(min_free_fraction),
        deleted,
    })
}

/// Whether `path` meets the threshold after reclaiming what may be reclaimed
pub async fn ensure_free_space(
    engine: &dyn SnapshotEngine,
    path: &str,
    min_free_fraction: FreeFraction,
    scheme: &TagScheme,
) -> Result<bool> {
    Ok(reclaim(engine, path, min_free_fraction, scheme, &[])
        .await?
        .satisfied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scheme() -> TagScheme {
        TagScheme::new("zreplica", "h").unwrap()
    }

    fn names(snapshots: &[&Snapshot]) -> Vec<String> {
        snapshots.iter().map(|s| s.name.clone()).collect()
    }

    #[test]
    fn test_newest_untagged_and_tags_survive() {
        let snapshots = vec![
            Snapshot::new("zreplica-h-20240104000000", 4, 0),
            Snapshot::new("daily-3", 3, 0),
            Snapshot::new("daily-2", 2, 0),
            Snapshot::new("zreplica-h-20240101000000", 1, 0),
            Snapshot::new("daily-0", 0, 0),
        ];
        let candidates = reclaimable(&snapshots, &scheme(), &[]);
        assert_eq!(names(&candidates), vec!["daily-2", "daily-0"]);

        let candidates = reclaimable(&snapshots, &scheme(), &["daily-2"]);
        assert_eq!(names(&candidates), vec!["daily-0"]);
    }

    #[test]
    fn test_single_untagged_is_never_reclaimable() {
        let snapshots = vec![Snapshot::new("only", 1, 0)];
        assert!(reclaimable(&snapshots, &scheme(), &[]).is_empty());
    }

    proptest! {
        #[test]
        fn test_bounded_by_count_minus_one(tags in proptest::collection::vec(any::<bool>(), 0..12)) {
            let snapshots: Vec<Snapshot> = tags
                .iter()
                .enumerate()
                .map(|(i, tagged)| {
                    let created = 100 - i as i64;
                    if *tagged {
                        Snapshot::new(format!("zreplica-h-202401010000{:02}", i), created, 0)
                    } else {
                        Snapshot::new(format!("manual-{}", i), created, 0)
                    }
                })
                .collect();
            let untagged = tags.iter().filter(|t| !**t).count();

            let candidates = reclaimable(&snapshots, &scheme(), &[]);
            prop_assert_eq!(candidates.len(), untagged.saturating_sub(1));
            prop_assert!(candidates.iter().all(|s| !scheme().is_tagged(&s.name)));
        }
    }
}
