//! Core traits for zreplica operations
//!
//! The replication engine talks to each host exclusively through
//! [`SnapshotEngine`]. Streams handed out by an engine are paired with a
//! [`StreamHandle`] that reports how the producing or consuming process ended.

use crate::{
    props, ChangeSet, CompressionLevel, Error, Host, PropertyMap, PropertySetting, PropertySource,
    Result, SpaceUsage,
};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Completion handle of a spawned stream endpoint
#[async_trait]
pub trait StreamHandle: Send {
    /// Wait for the endpoint to finish and report its exit status
    async fn finish(self: Box<Self>) -> Result<()>;
}

/// Readable side of an export stream
pub struct ByteSource {
    /// Stream bytes
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Completion handle of the producer
    pub handle: Box<dyn StreamHandle>,
}

/// Writable side of an import stream
pub struct ByteSink {
    /// Stream bytes
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Completion handle of the consumer
    pub handle: Box<dyn StreamHandle>,
}

impl std::fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteSource").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ByteSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteSink").finish_non_exhaustive()
    }
}

/// Snapshot engine of one host
///
/// Snapshot arguments are bare snapshot names; entity arguments are full
/// `filesystem@snapshot` or filesystem names as the engine reports them.
#[async_trait]
pub trait SnapshotEngine: Send + Sync {
    /// Host this engine operates on
    fn host(&self) -> &Host;

    /// Whether the filesystem exists
    async fn filesystem_exists(&self, path: &str) -> Result<bool>;

    /// Read `names` for every snapshot of `path` in one round-trip, keyed by
    /// full snapshot name
    ///
    /// The query is addressed by filesystem, so its size does not grow with
    /// the number of snapshots. Entries for snapshots of descendants may be
    /// included. Fails with [`Error::CatalogUnavailable`] when `path` does
    /// not exist.
    async fn snapshot_properties(&self, path: &str, names: &[&str]) -> Result<PropertyMap>;

    /// Read `names` for each of a few named entities in one round-trip
    async fn get_properties(&self, entities: &[String], names: &[&str]) -> Result<PropertyMap>;

    /// Create `path@name`
    async fn create_snapshot(&self, path: &str, name: &str) -> Result<()>;

    /// Destroy `path@name`, including same-named descendant snapshots when recursive
    async fn destroy_snapshot(&self, path: &str, name: &str, recursive: bool) -> Result<()>;

    /// Create a filesystem
    async fn create_filesystem(&self, path: &str) -> Result<()>;

    /// Destroy a filesystem with all its snapshots and descendants
    async fn destroy_filesystem(&self, path: &str) -> Result<()>;

    /// Changes between two snapshots
    async fn diff(&self, path: &str, from: &str, to: &str) -> Result<ChangeSet>;

    /// Dry-run size of the stream for `from` (exclusive) up to `to`
    async fn estimate_export(&self, path: &str, from: Option<&str>, to: &str) -> Result<u64>;

    /// Start exporting `from` up to `to`, compressed on this host when a level is given
    async fn export_stream(
        &self,
        path: &str,
        from: Option<&str>,
        to: &str,
        compression: Option<CompressionLevel>,
    ) -> Result<ByteSource>;

    /// Start importing a stream into `path`
    async fn import_stream(&self, path: &str) -> Result<ByteSink>;

    /// Roll `path` back to `snapshot`, destroying anything newer
    async fn rollback(&self, path: &str, snapshot: &str) -> Result<()>;

    /// Read one property with its source
    async fn get_property(&self, entity: &str, name: &str) -> Result<PropertySetting>;

    /// Set one property
    async fn set_property(&self, entity: &str, name: &str, value: &str) -> Result<()>;

    /// Drop the local value of a property; with `received`, fall back to the
    /// received value when there is one
    async fn inherit_property(&self, entity: &str, name: &str, received: bool) -> Result<()>;

    /// Put a property back the way [`SnapshotEngine::get_property`] reported it
    async fn restore_property(&self, entity: &str, name: &str, saved: &PropertySetting) -> Result<()> {
        match saved.source {
            PropertySource::Local => self.set_property(entity, name, &saved.value).await,
            PropertySource::Received => self.inherit_property(entity, name, true).await,
            PropertySource::Inherited => self.inherit_property(entity, name, false).await,
        }
    }

    /// Force `path` read-only and roll it back to `ancestor`
    async fn guard_for_receive(&self, path: &str, ancestor: Option<&str>) -> Result<()> {
        self.set_property(path, props::READONLY, "on").await?;
        if let Some(ancestor) = ancestor {
            self.rollback(path, ancestor).await?;
        }
        Ok(())
    }

    /// Used and available bytes of `path`
    async fn space_usage(&self, path: &str) -> Result<SpaceUsage> {
        let entity = path.to_string();
        let properties = self
            .get_properties(std::slice::from_ref(&entity), &[props::USED, props::AVAILABLE])
            .await?;
        let values = properties
            .get(path)
            .ok_or_else(|| Error::parse("space usage", format!("no properties for {}", path)))?;

        Ok(SpaceUsage::new(
            parse_bytes(values, props::USED)?,
            parse_bytes(values, props::AVAILABLE)?,
        ))
    }
}

/// Parse a numeric byte property from a property row
pub fn parse_bytes(
    values: &std::collections::BTreeMap<String, String>,
    name: &str,
) -> Result<u64> {
    let raw = values
        .get(name)
        .ok_or_else(|| Error::parse(format!("property {}", name), "missing"))?;
    raw.trim()
        .parse()
        .map_err(|_| Error::parse(format!("property {}", name), format!("'{}' is not a byte count", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_parse_bytes() {
        let mut values = BTreeMap::new();
        values.insert("used".to_string(), "4096".to_string());
        values.insert("available".to_string(), "12G".to_string());

        assert_eq!(parse_bytes(&values, "used").unwrap(), 4096);
        assert!(parse_bytes(&values, "available").is_err());
        assert!(parse_bytes(&values, "referenced").is_err());
    }
}
