//! Snapshot catalog reader

use tracing::debug;
use zreplica_types::{
    parse_bytes, props, Catalog, Error, PropertyMap, Result, Snapshot, SnapshotEngine,
};

/// Entries of `listed` that are snapshots of `path` itself, not of a descendant
pub fn own_snapshots(path: &str, mut listed: PropertyMap) -> PropertyMap {
    let prefix = format!("{}@", path);
    listed.retain(|name, _| name.starts_with(&prefix));
    listed
}

/// Read the snapshot catalog of `path`
///
/// One property query addressed by filesystem. Fails with
/// [`Error::CatalogUnavailable`] when the filesystem does not exist.
pub async fn read_catalog(engine: &dyn SnapshotEngine, path: &str) -> Result<Catalog> {
    let listed = engine
        .snapshot_properties(path, &[props::CREATION, props::REFERENCED])
        .await?;
    let properties = own_snapshots(path, listed);

    let prefix_len = path.len() + 1;
    let mut catalog = Catalog::new(path);
    for (entity, values) in &properties {
        let created = values
            .get(props::CREATION)
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .ok_or_else(|| Error::parse("snapshot properties", format!("no creation time for {}", entity)))?;
        let referenced = parse_bytes(values, props::REFERENCED)?;

        catalog.insert(Snapshot::new(&entity[prefix_len..], created, referenced));
    }

    debug!(
        host = %engine.host(),
        snapshots = catalog.len(),
        "Read catalog of {}",
        path
    );
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn listing<I: IntoIterator<Item = String>>(names: I) -> PropertyMap {
        names
            .into_iter()
            .map(|name| (name, Default::default()))
            .collect()
    }

    #[test]
    fn test_descendants_are_excluded() {
        let listed = listing([
            "tank/home@a".to_string(),
            "tank/home/alice@a".to_string(),
            "tank/homework@a".to_string(),
            "tank/home@b".to_string(),
        ]);
        let kept: Vec<String> = own_snapshots("tank/home", listed).into_keys().collect();
        assert_eq!(kept, vec!["tank/home@a".to_string(), "tank/home@b".to_string()]);
    }

    proptest! {
        #[test]
        fn test_never_keeps_a_strict_descendant(
            children in proptest::collection::btree_set("[a-z]{1,6}", 0..6),
            snaps in proptest::collection::btree_set("[a-z0-9]{1,6}", 0..6),
        ) {
            let mut listed = Vec::new();
            for snap in &snaps {
                listed.push(format!("tank/data@{}", snap));
                for child in &children {
                    listed.push(format!("tank/data/{}@{}", child, snap));
                    listed.push(format!("tank/data{}@{}", child, snap));
                }
            }

            let kept = own_snapshots("tank/data", listing(listed));
            prop_assert_eq!(kept.len(), snaps.len());
            for name in kept.into_keys() {
                let (filesystem, _) = name.split_once('@').unwrap();
                prop_assert_eq!(filesystem, "tank/data");
            }
        }
    }
}
