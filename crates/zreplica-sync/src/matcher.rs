//! Common-ancestor matching
//!
//! Snapshot identity is the creation time: a target snapshot matches only
//! when the source holds a snapshot of the same name created at the same
//! instant. A same-named snapshot recreated later is a different snapshot.

use zreplica_types::{Catalog, Snapshot};

/// Outcome of comparing a source catalog with a target catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    /// The target holds no snapshots at all
    NoTargetHistory,
    /// The target holds snapshots but shares none with the source
    NoMatch,
    /// Newest snapshot present on both sides
    Matched(Snapshot),
}

/// Find the newest snapshot both catalogs share
pub fn match_catalogs(source: &Catalog, target: &Catalog) -> MatchResult {
    if target.is_empty() {
        return MatchResult::NoTargetHistory;
    }

    target
        .newest_first()
        .into_iter()
        .find(|candidate| {
            source
                .get(&candidate.name)
                .is_some_and(|theirs| theirs.created == candidate.created)
        })
        .map_or(MatchResult::NoMatch, |ancestor| {
            MatchResult::Matched(ancestor.clone())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn catalog(snapshots: &[(&str, i64)]) -> Catalog {
        Catalog::from_snapshots(
            "tank/data",
            snapshots
                .iter()
                .map(|(name, created)| Snapshot::new(*name, *created, 0)),
        )
    }

    #[test]
    fn test_empty_target_has_no_history() {
        let source = catalog(&[("a", 1)]);
        assert_eq!(
            match_catalogs(&source, &Catalog::new("pool/data")),
            MatchResult::NoTargetHistory
        );
    }

    #[test]
    fn test_newest_shared_snapshot_wins() {
        let source = catalog(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)]);
        let target = catalog(&[("a", 1), ("b", 2), ("c", 3)]);
        match match_catalogs(&source, &target) {
            MatchResult::Matched(ancestor) => assert_eq!(ancestor.name, "c"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_same_name_different_creation_is_not_a_match() {
        let source = catalog(&[("a", 1), ("b", 20)]);
        let target = catalog(&[("a", 1), ("b", 2)]);
        match match_catalogs(&source, &target) {
            MatchResult::Matched(ancestor) => assert_eq!(ancestor.name, "a"),
            other => panic!("unexpected {:?}", other),
        }

        let target = catalog(&[("b", 2)]);
        assert_eq!(match_catalogs(&source, &target), MatchResult::NoMatch);
    }

    #[test]
    fn test_ties_resolve_by_name() {
        let source = catalog(&[("x", 5), ("y", 5)]);
        let target = catalog(&[("y", 5), ("x", 5)]);
        match match_catalogs(&source, &target) {
            MatchResult::Matched(ancestor) => assert_eq!(ancestor.name, "x"),
            other => panic!("unexpected {:?}", other),
        }
    }

    proptest! {
        #[test]
        fn test_match_is_shared_and_newest(
            source_set in proptest::collection::btree_map("[a-e]", 0i64..8, 0..6),
            target_set in proptest::collection::btree_map("[a-e]", 0i64..8, 1..6),
        ) {
            let source = Catalog::from_snapshots(
                "s",
                source_set.iter().map(|(n, c)| Snapshot::new(n.clone(), *c, 0)),
            );
            let target = Catalog::from_snapshots(
                "t",
                target_set.iter().map(|(n, c)| Snapshot::new(n.clone(), *c, 0)),
            );

            let shared: Vec<&Snapshot> = target
                .iter()
                .filter(|s| source.get(&s.name).is_some_and(|o| o.created == s.created))
                .collect();

            match match_catalogs(&source, &target) {
                MatchResult::Matched(ancestor) => {
                    prop_assert!(shared.iter().any(|s| s.name == ancestor.name));
                    prop_assert!(shared.iter().all(|s| s.created <= ancestor.created));
                    prop_assert_eq!(match_catalogs(&source, &target), MatchResult::Matched(ancestor));
                }
                MatchResult::NoMatch => prop_assert!(shared.is_empty()),
                MatchResult::NoTargetHistory => prop_assert!(false, "target is never empty here"),
            }
        }
    }
}
