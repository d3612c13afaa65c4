//! Core data types for zreplica
//!
//! This module provides the fundamental data types shared by the replication
//! engine and its collaborators: hosts and endpoints, snapshots and catalogs,
//! free-space measurements, plans and outcomes.

use crate::{Error, FreeFraction, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Unique identifier for one replication run
pub type RunId = uuid::Uuid;

/// Property values keyed by entity name, then property name
pub type PropertyMap = BTreeMap<String, BTreeMap<String, String>>;

/// Well-known snapshot engine property names
pub mod props {
    /// Creation time in seconds since the epoch
    pub const CREATION: &str = "creation";
    /// Bytes referenced by a snapshot or filesystem
    pub const REFERENCED: &str = "referenced";
    /// Bytes consumed by a filesystem and its descendants
    pub const USED: &str = "used";
    /// Bytes still available to a filesystem
    pub const AVAILABLE: &str = "available";
    /// Read-only flag of a filesystem
    pub const READONLY: &str = "readonly";
}

/// Where a property's effective value comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PropertySource {
    /// Set on the entity itself
    Local,
    /// Set by a received stream
    Received,
    /// Inherited from a parent or the built-in default
    #[default]
    Inherited,
}

impl PropertySource {
    /// Interpret the `source` column of `zfs get`
    pub fn from_zfs(source: &str) -> Self {
        match source.trim() {
            "local" => Self::Local,
            "received" => Self::Received,
            _ => Self::Inherited,
        }
    }
}

/// A property value together with its source
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PropertySetting {
    /// Effective value
    pub value: String,
    /// Where the value comes from
    pub source: PropertySource,
}

impl PropertySetting {
    /// Create a setting
    pub fn new<S: Into<String>>(value: S, source: PropertySource) -> Self {
        Self {
            value: value.into(),
            source,
        }
    }
}

impl fmt::Display for PropertySetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            PropertySource::Local => write!(f, "{} (local)", self.value),
            PropertySource::Received => write!(f, "{} (received)", self.value),
            PropertySource::Inherited => write!(f, "{} (inherited)", self.value),
        }
    }
}

/// Machine a snapshot engine runs on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Host {
    /// The machine running zreplica
    Local,
    /// A machine reached through the remote command channel
    Remote {
        /// Login user, when not the channel's default
        user: Option<String>,
        /// Host name or address
        host: String,
    },
}

impl Host {
    /// Create a remote host
    pub fn remote<S: Into<String>>(user: Option<String>, host: S) -> Self {
        Self::Remote {
            user,
            host: host.into(),
        }
    }

    /// Whether commands for this host run through the remote channel
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    /// The `[user@]host` destination understood by ssh
    pub fn destination(&self) -> Option<String> {
        match self {
            Self::Local => None,
            Self::Remote { user: Some(user), host } => Some(format!("{}@{}", user, host)),
            Self::Remote { user: None, host } => Some(host.clone()),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.destination() {
            Some(destination) => f.write_str(&destination),
            None => f.write_str("localhost"),
        }
    }
}

/// A filesystem on a host, written `[user@]host:path` or just `path`
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Endpoint {
    /// Host holding the filesystem
    pub host: Host,
    /// Filesystem path (e.g. `tank/data`)
    pub path: String,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new<S: Into<String>>(host: Host, path: S) -> Self {
        Self {
            host,
            path: path.into(),
        }
    }

    /// Create an endpoint on the local machine
    pub fn local<S: Into<String>>(path: S) -> Self {
        Self::new(Host::Local, path)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let invalid = |message: &str| Error::parse(format!("endpoint '{}'", input), message);

        let (host, path) = match input.split_once(':') {
            Some((destination, path)) => {
                let host = match destination.split_once('@') {
                    Some((user, host)) => {
                        if user.is_empty() {
                            return Err(invalid("empty user name"));
                        }
                        Host::remote(Some(user.to_string()), host)
                    }
                    None => Host::remote(None, destination),
                };
                if matches!(&host, Host::Remote { host, .. } if host.is_empty()) {
                    return Err(invalid("empty host name"));
                }
                (host, path)
            }
            None => (Host::Local, input),
        };

        let path = path.trim_end_matches('/');
        if path.is_empty() {
            return Err(invalid("empty filesystem path"));
        }
        if path.starts_with('/') || path.contains('@') || path.contains("//") {
            return Err(invalid("filesystem path must look like pool/dataset"));
        }

        Ok(Self::new(host, path))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host.destination() {
            Some(destination) => write!(f, "{}:{}", destination, self.path),
            None => f.write_str(&self.path),
        }
    }
}

/// Path of the parent filesystem, if `path` is not a pool root
pub fn parent_filesystem(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

/// Full `filesystem@snapshot` entity name
pub fn snapshot_entity(filesystem: &str, snapshot: &str) -> String {
    format!("{}@{}", filesystem, snapshot)
}

/// A point-in-time version of a filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Snapshot {
    /// Snapshot name, without the filesystem part
    pub name: String,
    /// Creation time in seconds since the epoch, the identity used for matching
    pub created: i64,
    /// Bytes referenced by the snapshot
    pub referenced: u64,
}

impl Snapshot {
    /// Create a new snapshot record
    pub fn new<S: Into<String>>(name: S, created: i64, referenced: u64) -> Self {
        Self {
            name: name.into(),
            created,
            referenced,
        }
    }
}

/// All snapshots of one filesystem on one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    filesystem: String,
    snapshots: BTreeMap<String, Snapshot>,
}

impl Catalog {
    /// Create an empty catalog
    pub fn new<S: Into<String>>(filesystem: S) -> Self {
        Self {
            filesystem: filesystem.into(),
            snapshots: BTreeMap::new(),
        }
    }

    /// Build a catalog from snapshot records
    pub fn from_snapshots<S, I>(filesystem: S, snapshots: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = Snapshot>,
    {
        let mut catalog = Self::new(filesystem);
        for snapshot in snapshots {
            catalog.insert(snapshot);
        }
        catalog
    }

    /// Filesystem this catalog describes
    pub fn filesystem(&self) -> &str {
        &self.filesystem
    }

    /// Add or replace a snapshot record
    pub fn insert(&mut self, snapshot: Snapshot) {
        self.snapshots.insert(snapshot.name.clone(), snapshot);
    }

    /// Look up a snapshot by name
    pub fn get(&self, name: &str) -> Option<&Snapshot> {
        self.snapshots.get(name)
    }

    /// Whether a snapshot with this name exists
    pub fn contains(&self, name: &str) -> bool {
        self.snapshots.contains_key(name)
    }

    /// Number of snapshots
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether the catalog holds no snapshots
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Iterate over snapshots in name order
    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.values()
    }

    /// Snapshots ordered newest first; equal creation times fall back to name order
    pub fn newest_first(&self) -> Vec<&Snapshot> {
        let mut ordered: Vec<&Snapshot> = self.snapshots.values().collect();
        ordered.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.name.cmp(&b.name)));
        ordered
    }

    /// The most recently created snapshot
    pub fn newest(&self) -> Option<&Snapshot> {
        self.newest_first().into_iter().next()
    }
}

/// Space accounting of one filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpaceUsage {
    /// Bytes already consumed
    pub used: u64,
    /// Bytes still available
    pub available: u64,
}

impl SpaceUsage {
    /// Create a new measurement
    pub fn new(used: u64, available: u64) -> Self {
        Self { used, available }
    }

    /// Total filesystem size: consumed plus available
    pub fn filesystem_size(&self) -> u64 {
        self.used.saturating_add(self.available)
    }

    /// Bytes that must stay free under the given threshold
    pub fn required_free(&self, fraction: FreeFraction) -> u64 {
        (self.filesystem_size() as f64 * fraction.get()).ceil() as u64
    }

    /// Whether the available space meets the threshold
    pub fn satisfies(&self, fraction: FreeFraction) -> bool {
        self.available >= self.required_free(fraction)
    }
}

/// Changes between two snapshots of a filesystem
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// One entry per changed path, as reported by the snapshot engine
    pub entries: Vec<String>,
}

impl ChangeSet {
    /// Build a change set from raw diff output lines
    pub fn from_output(output: &str) -> Self {
        Self {
            entries: output
                .lines()
                .map(str::trim_end)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of changed entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Everything the transfer orchestrator needs for one run
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationPlan {
    /// Source filesystem
    pub source: Endpoint,
    /// Local target filesystem path
    pub target_path: String,
    /// Whether the target filesystem existed when the plan was made
    pub target_exists: bool,
    /// Free-space threshold on the target
    pub min_free_fraction: FreeFraction,
    /// Snapshot shared by both sides; `None` means a full transfer
    pub common_ancestor: Option<String>,
    /// Snapshot created on the source for this run
    pub new_snapshot: String,
    /// Advisory size of the stream in bytes
    pub estimated_bytes: u64,
}

impl ReplicationPlan {
    /// Whether only the delta from the common ancestor is sent
    pub fn is_incremental(&self) -> bool {
        self.common_ancestor.is_some()
    }
}

/// What the transfer orchestrator observed after the pipeline closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The new snapshot is present on the target
    Success {
        /// Bytes moved through the pipeline
        bytes: u64,
    },
    /// The target advanced but does not hold the new snapshot
    PartialFailure {
        /// Bytes moved through the pipeline
        bytes: u64,
        /// Newest snapshot now on the target
        reached: String,
    },
    /// The target did not advance at all
    TotalFailure {
        /// Bytes moved through the pipeline
        bytes: u64,
    },
}

impl TransferOutcome {
    /// Whether the new snapshot landed
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Bytes moved through the pipeline
    pub fn bytes(&self) -> u64 {
        match self {
            Self::Success { bytes }
            | Self::PartialFailure { bytes, .. }
            | Self::TotalFailure { bytes } => *bytes,
        }
    }
}

/// Terminal result of a successful run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The source held no changes since the common ancestor
    AlreadyInSync {
        /// Snapshot both sides already share
        ancestor: String,
    },
    /// A new snapshot was transferred and verified
    Replicated {
        /// Snapshot now present on both sides
        snapshot: String,
        /// Whether only a delta was sent
        incremental: bool,
        /// Bytes moved through the pipeline
        bytes: u64,
    },
}

impl RunOutcome {
    /// Bytes moved by the run
    pub fn bytes_transferred(&self) -> u64 {
        match self {
            Self::AlreadyInSync { .. } => 0,
            Self::Replicated { bytes, .. } => *bytes,
        }
    }
}

/// Summary of one run, successful or not
#[derive(Debug)]
pub struct RunReport {
    /// Run identifier
    pub run_id: RunId,
    /// Source filesystem
    pub source: Endpoint,
    /// Target filesystem path
    pub target_path: String,
    /// Wall time from start to terminal outcome
    pub elapsed: Duration,
    /// Terminal outcome
    pub outcome: std::result::Result<RunOutcome, Error>,
}

impl RunReport {
    /// Whether the run ended in success or an in-sync no-op
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Process exit code for this report
    pub fn exit_code(&self) -> u8 {
        match &self.outcome {
            Ok(_) => 0,
            Err(error) => error.exit_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("local", PropertySource::Local)]
    #[case("received", PropertySource::Received)]
    #[case("default", PropertySource::Inherited)]
    #[case("inherited from pool", PropertySource::Inherited)]
    #[case("-", PropertySource::Inherited)]
    fn test_property_source_from_zfs(#[case] column: &str, #[case] expected: PropertySource) {
        assert_eq!(PropertySource::from_zfs(column), expected);
    }

    #[rstest]
    #[case("backup@nas:tank/data", Some("backup"), Some("nas"), "tank/data")]
    #[case("nas:tank/data/", None, Some("nas"), "tank/data")]
    #[case("tank/data", None, None, "tank/data")]
    fn test_endpoint_parsing(
        #[case] input: &str,
        #[case] user: Option<&str>,
        #[case] host: Option<&str>,
        #[case] path: &str,
    ) {
        let endpoint: Endpoint = input.parse().unwrap();
        assert_eq!(endpoint.path, path);
        match (&endpoint.host, host) {
            (Host::Local, None) => {}
            (Host::Remote { user: u, host: h }, Some(expected)) => {
                assert_eq!(h, expected);
                assert_eq!(u.as_deref(), user);
            }
            other => panic!("unexpected host {:?}", other),
        }
    }

    #[rstest]
    #[case("nas:")]
    #[case(":tank/data")]
    #[case("@nas:tank")]
    #[case("nas:/mnt/tank")]
    #[case("nas:tank@snap")]
    fn test_endpoint_rejects_malformed(#[case] input: &str) {
        assert!(input.parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_endpoint_display_round_trips() {
        let endpoint: Endpoint = "root@10.0.0.2:tank/home".parse().unwrap();
        assert_eq!(endpoint.to_string(), "root@10.0.0.2:tank/home");
        assert_eq!(Endpoint::local("pool/home").to_string(), "pool/home");
    }

    #[test]
    fn test_parent_filesystem() {
        assert_eq!(parent_filesystem("pool/backup/home"), Some("pool/backup"));
        assert_eq!(parent_filesystem("pool"), None);
    }

    #[test]
    fn test_catalog_ordering_is_deterministic() {
        let catalog = Catalog::from_snapshots(
            "tank/data",
            vec![
                Snapshot::new("b", 200, 1),
                Snapshot::new("a", 200, 1),
                Snapshot::new("old", 100, 1),
                Snapshot::new("new", 300, 1),
            ],
        );

        let names: Vec<&str> = catalog
            .newest_first()
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["new", "a", "b", "old"]);
        assert_eq!(catalog.newest().map(|s| s.name.as_str()), Some("new"));
        assert!(Catalog::new("tank/empty").newest().is_none());
    }

    #[test]
    fn test_space_usage_threshold() {
        let usage = SpaceUsage::new(900, 100);
        assert_eq!(usage.filesystem_size(), 1000);

        let ten_percent = FreeFraction::new(0.10).unwrap();
        assert_eq!(usage.required_free(ten_percent), 100);
        assert!(usage.satisfies(ten_percent));

        let twenty_percent = FreeFraction::new(0.20).unwrap();
        assert!(!usage.satisfies(twenty_percent));
    }

    #[test]
    fn test_change_set_ignores_blank_lines() {
        let changes = ChangeSet::from_output("M\t/tank/data/a\n\n+\t/tank/data/b\n");
        assert_eq!(changes.len(), 2);
        assert!(ChangeSet::from_output("\n").is_empty());
    }

    #[test]
    fn test_run_report_exit_code() {
        let report = RunReport {
            run_id: RunId::new_v4(),
            source: Endpoint::local("tank/a"),
            target_path: "pool/a".into(),
            elapsed: Duration::from_secs(1),
            outcome: Err(Error::SpaceReclaimExhausted {
                target: "pool/a".into(),
                available: 1,
                required: 2,
            }),
        };
        assert_eq!(report.exit_code(), 5);
        assert!(!report.is_success());
    }
}
