//! In-memory snapshot pool for zreplica tests
//!
//! [`FakePool`] implements [`SnapshotEngine`] over a shared model of one
//! host's pool: filesystems holding ordered snapshots with creation times
//! and sizes, a `readonly` flag and its source per filesystem and a journal of every
//! mutating operation. Export streams use a small line-based format so an
//! import can be made to fail part-way through.

#![warn(missing_docs)]
#![warn(clippy::all)]

use async_compression::tokio::write::ZstdEncoder;
use async_compression::Level;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use zreplica_types::{
    parent_filesystem, props, snapshot_entity, ByteSink, ByteSource, ChangeSet, CompressionLevel,
    Error, Host, PropertyMap, PropertySetting, PropertySource, Result, Snapshot, SnapshotEngine,
    StreamHandle,
};

/// Creation time handed to the first snapshot a pool creates itself
pub const EPOCH: i64 = 1_700_000_000;

const STREAM_HEADER: &str = "zstream";

#[derive(Debug, Clone, PartialEq, Eq)]
struct FakeSnapshot {
    name: String,
    created: i64,
    size: u64,
}

#[derive(Debug, Clone, Default)]
struct FakeFilesystem {
    snapshots: Vec<FakeSnapshot>,
    pending: u64,
    readonly: bool,
    readonly_source: PropertySource,
}

impl FakeFilesystem {
    fn position(&self, name: &str) -> Option<usize> {
        self.snapshots.iter().position(|s| s.name == name)
    }

    fn used(&self) -> u64 {
        self.pending + self.snapshots.iter().map(|s| s.size).sum::<u64>()
    }

    /// Most recent snapshot by creation time; later entries win ties
    fn newest(&self) -> Option<&FakeSnapshot> {
        self.snapshots.iter().max_by_key(|s| s.created)
    }
}

#[derive(Debug, Default)]
struct PoolState {
    filesystems: BTreeMap<String, FakeFilesystem>,
    capacity: u64,
    clock: i64,
    journal: Vec<String>,
    fail_import_after: Option<usize>,
    fail_destroy: BTreeSet<String>,
    fail_property_value: Option<String>,
}

impl PoolState {
    fn used(&self) -> u64 {
        self.filesystems.values().map(FakeFilesystem::used).sum()
    }

    fn used_below(&self, path: &str) -> u64 {
        self.filesystems
            .iter()
            .filter(|(name, _)| name.as_str() == path || is_descendant(name, path))
            .map(|(_, fs)| fs.used())
            .sum()
    }

    fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used())
    }

    fn filesystem(&self, path: &str) -> Result<&FakeFilesystem> {
        self.filesystems.get(path).ok_or_else(|| missing(path))
    }

    fn filesystem_mut(&mut self, path: &str) -> Result<&mut FakeFilesystem> {
        self.filesystems.get_mut(path).ok_or_else(|| missing(path))
    }

    /// Value `path` inherits for `readonly`: the parent's, or off at the top
    fn inherited_readonly(&self, path: &str) -> bool {
        parent_filesystem(path)
            .and_then(|parent| self.filesystems.get(parent))
            .is_some_and(|fs| fs.readonly)
    }

    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }
}

fn missing(entity: &str) -> Error {
    Error::command(
        "zfs",
        Some(1),
        format!("cannot open '{}': dataset does not exist", entity),
    )
}

fn is_descendant(path: &str, ancestor: &str) -> bool {
    path.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// An in-memory pool on one host
///
/// Clones share state, so a test keeps one handle for assertions while the
/// replicator owns another.
#[derive(Debug, Clone)]
pub struct FakePool {
    host: Host,
    state: Arc<Mutex<PoolState>>,
}

impl FakePool {
    /// Create an empty pool of `capacity` bytes
    pub fn new(host: Host, capacity: u64) -> Self {
        let state = PoolState {
            capacity,
            clock: EPOCH - 1,
            ..PoolState::default()
        };
        Self {
            host,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Builder form of [`FakePool::add_filesystem`]
    pub fn with_filesystem(self, path: &str) -> Self {
        self.add_filesystem(path);
        self
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an empty filesystem
    pub fn add_filesystem(&self, path: &str) {
        self.state()
            .filesystems
            .entry(path.to_string())
            .or_default();
    }

    /// Simulate `bytes` of new data written to `path`
    pub fn write(&self, path: &str, bytes: u64) {
        let mut state = self.state();
        if let Some(fs) = state.filesystems.get_mut(path) {
            fs.pending += bytes;
        }
    }

    /// Append a snapshot with an explicit creation time and size
    pub fn add_snapshot(&self, path: &str, name: &str, created: i64, size: u64) {
        let mut state = self.state();
        state.clock = state.clock.max(created);
        state
            .filesystems
            .entry(path.to_string())
            .or_default()
            .snapshots
            .push(FakeSnapshot {
                name: name.to_string(),
                created,
                size,
            });
    }

    /// Snapshot the pending data of `path` the way the engine does
    pub fn take_snapshot(&self, path: &str, name: &str) -> Result<i64> {
        let mut state = self.state();
        let created = state.tick();
        let fs = state.filesystem_mut(path)?;
        if fs.position(name).is_some() {
            return Err(Error::command(
                "zfs snapshot",
                Some(1),
                format!("cannot create snapshot '{}@{}': dataset already exists", path, name),
            ));
        }
        let size = std::mem::take(&mut fs.pending);
        fs.snapshots.push(FakeSnapshot {
            name: name.to_string(),
            created,
            size,
        });
        state.journal.push(format!("snapshot {}@{}", path, name));
        Ok(created)
    }

    /// Snapshot names of `path`, oldest first
    pub fn snapshot_names(&self, path: &str) -> Vec<String> {
        self.state()
            .filesystems
            .get(path)
            .map(|fs| fs.snapshots.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    /// One snapshot of `path`
    pub fn snapshot(&self, path: &str, name: &str) -> Option<Snapshot> {
        let state = self.state();
        let fs = state.filesystems.get(path)?;
        fs.snapshots
            .iter()
            .find(|s| s.name == name)
            .map(|s| Snapshot::new(&s.name, s.created, s.size))
    }

    /// Whether `path` exists
    pub fn has_filesystem(&self, path: &str) -> bool {
        self.state().filesystems.contains_key(path)
    }

    /// The `readonly` flag of `path`
    pub fn readonly(&self, path: &str) -> Option<bool> {
        self.state().filesystems.get(path).map(|fs| fs.readonly)
    }

    /// Where the `readonly` flag of `path` comes from
    pub fn readonly_source(&self, path: &str) -> Option<PropertySource> {
        self.state().filesystems.get(path).map(|fs| fs.readonly_source)
    }

    /// Set the `readonly` flag of `path` locally without journaling
    pub fn set_readonly(&self, path: &str, readonly: bool) {
        if let Some(fs) = self.state().filesystems.get_mut(path) {
            fs.readonly = readonly;
            fs.readonly_source = PropertySource::Local;
        }
    }

    /// Mutating operations so far, in order
    pub fn journal(&self) -> Vec<String> {
        self.state().journal.clone()
    }

    /// Forget the journal
    pub fn clear_journal(&self) {
        self.state().journal.clear();
    }

    /// Bytes consumed in the pool
    pub fn used(&self) -> u64 {
        self.state().used()
    }

    /// Bytes still free in the pool
    pub fn available(&self) -> u64 {
        self.state().available()
    }

    /// Make the next import fail after applying `records` snapshots
    pub fn fail_import_after(&self, records: usize) {
        self.state().fail_import_after = Some(records);
    }

    /// Make every deletion of a snapshot called `name` fail
    pub fn fail_destroy_of(&self, name: &str) {
        self.state().fail_destroy.insert(name.to_string());
    }

    /// Make setting any property to `value` fail
    pub fn fail_property_value(&self, value: &str) {
        self.state().fail_property_value = Some(value.to_string());
    }

    fn apply_stream(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let (from, records) = decode_stream(bytes)?;
        let mut state = self.state();
        state.journal.push(format!("receive {}", path));
        let fail_after = state.fail_import_after.take();

        match &from {
            None => {
                if state.filesystems.contains_key(path) {
                    return Err(Error::command(
                        "zfs receive",
                        Some(1),
                        format!("destination '{}' exists", path),
                    ));
                }
                if let Some(parent) = parent_filesystem(path) {
                    state.filesystem(parent)?;
                }
            }
            Some(from) => {
                let fs = state.filesystem(path)?;
                if fs.newest().map(|s| s.name.as_str()) != Some(from.as_str()) {
                    return Err(Error::command(
                        "zfs receive",
                        Some(1),
                        format!("destination {} has been modified since most recent snapshot", path),
                    ));
                }
            }
        }

        for (applied, record) in records.into_iter().enumerate() {
            if fail_after == Some(applied) {
                return Err(Error::command(
                    "zfs receive",
                    Some(1),
                    "invalid stream (checksum mismatch)",
                ));
            }
            if state.available() < record.size {
                return Err(Error::command(
                    "zfs receive",
                    Some(1),
                    "out of space",
                ));
            }
            state
                .filesystems
                .entry(path.to_string())
                .or_default()
                .snapshots
                .push(record);
        }
        Ok(())
    }
}

fn encode_stream(fs: &FakeFilesystem, path: &str, from: Option<&str>, to: &str) -> Result<Vec<u8>> {
    let to_pos = fs
        .position(to)
        .ok_or_else(|| missing(&snapshot_entity(path, to)))?;

    let records = match from {
        Some(from) => {
            let from_pos = fs
                .position(from)
                .ok_or_else(|| missing(&snapshot_entity(path, from)))?;
            if from_pos >= to_pos {
                return Err(Error::command(
                    "zfs send",
                    Some(1),
                    "incremental source must be earlier than the target snapshot",
                ));
            }
            fs.snapshots[from_pos + 1..=to_pos].to_vec()
        }
        None => {
            let total = fs.snapshots[..=to_pos].iter().map(|s| s.size).sum();
            vec![FakeSnapshot {
                size: total,
                ..fs.snapshots[to_pos].clone()
            }]
        }
    };

    let mut stream = format!("{} {}\n", STREAM_HEADER, from.unwrap_or("-"));
    for record in records {
        stream.push_str(&format!(
            "snapshot {} {} {}\n",
            record.name, record.created, record.size
        ));
        stream.push_str(&".".repeat(record.size as usize));
        stream.push('\n');
    }
    Ok(stream.into_bytes())
}

fn invalid_stream(message: &str) -> Error {
    Error::command("zfs receive", Some(1), format!("invalid stream: {}", message))
}

fn decode_stream(bytes: &[u8]) -> Result<(Option<String>, Vec<FakeSnapshot>)> {
    let text = std::str::from_utf8(bytes).map_err(|_| invalid_stream("not a stream"))?;
    let mut lines = text.lines();

    let from = match lines.next().and_then(|header| header.split_once(' ')) {
        Some((STREAM_HEADER, "-")) => None,
        Some((STREAM_HEADER, from)) => Some(from.to_string()),
        _ => return Err(invalid_stream("bad header")),
    };

    let mut records = Vec::new();
    while let Some(line) = lines.next() {
        let fields: Vec<&str> = line.split(' ').collect();
        let ["snapshot", name, created, size] = fields.as_slice() else {
            return Err(invalid_stream("bad record"));
        };
        let created: i64 = created.parse().map_err(|_| invalid_stream("bad creation time"))?;
        let size: u64 = size.parse().map_err(|_| invalid_stream("bad size"))?;
        let payload = lines.next().ok_or_else(|| invalid_stream("truncated"))?;
        if payload.len() as u64 != size {
            return Err(invalid_stream("truncated"));
        }
        records.push(FakeSnapshot {
            name: (*name).to_string(),
            created,
            size,
        });
    }
    Ok((from, records))
}

async fn compress(data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
    let mut encoder = ZstdEncoder::with_quality(Vec::new(), Level::Precise(i32::from(level.get())));
    encoder.write_all(data).await?;
    encoder.shutdown().await?;
    Ok(encoder.into_inner())
}

struct Sent;

#[async_trait]
impl StreamHandle for Sent {
    async fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct PendingImport {
    pool: FakePool,
    path: String,
    reader: JoinHandle<std::io::Result<Vec<u8>>>,
}

#[async_trait]
impl StreamHandle for PendingImport {
    async fn finish(self: Box<Self>) -> Result<()> {
        let Self { pool, path, reader } = *self;
        let bytes = reader
            .await
            .map_err(|e| Error::other(format!("import reader failed: {}", e)))??;
        pool.apply_stream(&path, &bytes)
    }
}

#[async_trait]
impl SnapshotEngine for FakePool {
    fn host(&self) -> &Host {
        &self.host
    }

    async fn filesystem_exists(&self, path: &str) -> Result<bool> {
        Ok(self.has_filesystem(path))
    }

    /// Reports snapshots of descendants too, which callers must filter out
    async fn snapshot_properties(&self, path: &str, names: &[&str]) -> Result<PropertyMap> {
        let state = self.state();
        if !state.filesystems.contains_key(path) {
            return Err(Error::CatalogUnavailable {
                host: self.host.to_string(),
                path: path.to_string(),
            });
        }

        let mut properties = PropertyMap::new();
        let listed = state
            .filesystems
            .iter()
            .filter(|(name, _)| name.as_str() == path || is_descendant(name, path));
        for (name, fs) in listed {
            for snapshot in &fs.snapshots {
                let values = [
                    (props::CREATION, snapshot.created.to_string()),
                    (props::REFERENCED, snapshot.size.to_string()),
                ]
                .into_iter()
                .filter(|(property, _)| names.contains(property))
                .map(|(property, value)| (property.to_string(), value))
                .collect();
                properties.insert(snapshot_entity(name, &snapshot.name), values);
            }
        }
        Ok(properties)
    }

    async fn get_properties(&self, entities: &[String], names: &[&str]) -> Result<PropertyMap> {
        let state = self.state();
        let mut properties = PropertyMap::new();

        for entity in entities {
            let values: Vec<(&str, String)> = match entity.split_once('@') {
                Some((path, name)) => {
                    let fs = state.filesystem(path)?;
                    let position = fs.position(name).ok_or_else(|| missing(entity))?;
                    let snapshot = &fs.snapshots[position];
                    vec![
                        (props::CREATION, snapshot.created.to_string()),
                        (props::REFERENCED, snapshot.size.to_string()),
                    ]
                }
                None => {
                    let fs = state.filesystem(entity)?;
                    vec![
                        (props::USED, state.used_below(entity).to_string()),
                        (props::AVAILABLE, state.available().to_string()),
                        (
                            props::READONLY,
                            if fs.readonly { "on" } else { "off" }.to_string(),
                        ),
                    ]
                }
            };

            let selected = values
                .into_iter()
                .filter(|(name, _)| names.contains(name))
                .map(|(name, value)| (name.to_string(), value))
                .collect();
            properties.insert(entity.clone(), selected);
        }
        Ok(properties)
    }

    async fn create_snapshot(&self, path: &str, name: &str) -> Result<()> {
        self.take_snapshot(path, name).map(|_| ())
    }

    async fn destroy_snapshot(&self, path: &str, name: &str, recursive: bool) -> Result<()> {
        let mut state = self.state();
        if state.fail_destroy.contains(name) {
            return Err(Error::command(
                "zfs destroy",
                Some(1),
                format!("cannot destroy snapshot {}@{}: dataset is busy", path, name),
            ));
        }

        let fs = state.filesystem_mut(path)?;
        let position = fs
            .position(name)
            .ok_or_else(|| missing(&snapshot_entity(path, name)))?;
        fs.snapshots.remove(position);

        if recursive {
            for (_, child) in state
                .filesystems
                .iter_mut()
                .filter(|(child, _)| is_descendant(child, path))
            {
                child.snapshots.retain(|s| s.name != name);
            }
        }

        let flag = if recursive { "-r " } else { "" };
        state.journal.push(format!("destroy {}{}@{}", flag, path, name));
        Ok(())
    }

    async fn create_filesystem(&self, path: &str) -> Result<()> {
        let mut state = self.state();
        let mut current = Some(path);
        while let Some(fs) = current {
            state.filesystems.entry(fs.to_string()).or_default();
            current = parent_filesystem(fs);
        }
        state.journal.push(format!("create {}", path));
        Ok(())
    }

    async fn destroy_filesystem(&self, path: &str) -> Result<()> {
        let mut state = self.state();
        state.filesystem(path)?;
        state
            .filesystems
            .retain(|name, _| name != path && !is_descendant(name, path));
        state.journal.push(format!("destroy -r {}", path));
        Ok(())
    }

    async fn diff(&self, path: &str, from: &str, to: &str) -> Result<ChangeSet> {
        let state = self.state();
        let fs = state.filesystem(path)?;
        let from_pos = fs
            .position(from)
            .ok_or_else(|| missing(&snapshot_entity(path, from)))?;
        let to_pos = fs
            .position(to)
            .ok_or_else(|| missing(&snapshot_entity(path, to)))?;
        if from_pos > to_pos {
            return Err(Error::command(
                "zfs diff",
                Some(1),
                "the first snapshot must be earlier than the second",
            ));
        }

        let changed: u64 = fs.snapshots[from_pos + 1..=to_pos]
            .iter()
            .map(|s| s.size)
            .sum();
        Ok(if changed == 0 {
            ChangeSet::default()
        } else {
            ChangeSet::from_output(&format!("M\t/{}/data\n", path))
        })
    }

    async fn estimate_export(&self, path: &str, from: Option<&str>, to: &str) -> Result<u64> {
        let state = self.state();
        let stream = encode_stream(state.filesystem(path)?, path, from, to)?;
        Ok(stream.len() as u64)
    }

    async fn export_stream(
        &self,
        path: &str,
        from: Option<&str>,
        to: &str,
        compression: Option<CompressionLevel>,
    ) -> Result<ByteSource> {
        let stream = {
            let mut state = self.state();
            let stream = encode_stream(state.filesystem(path)?, path, from, to)?;
            state.journal.push(format!("send {}@{}", path, to));
            stream
        };

        let wire = match compression {
            Some(level) => compress(&stream, level).await?,
            None => stream,
        };
        Ok(ByteSource {
            reader: Box::new(Cursor::new(wire)),
            handle: Box::new(Sent),
        })
    }

    async fn import_stream(&self, path: &str) -> Result<ByteSink> {
        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes).await.map(|_| bytes)
        });

        Ok(ByteSink {
            writer: Box::new(writer),
            handle: Box::new(PendingImport {
                pool: self.clone(),
                path: path.to_string(),
                reader: task,
            }),
        })
    }

    async fn rollback(&self, path: &str, snapshot: &str) -> Result<()> {
        let mut state = self.state();
        let fs = state.filesystem_mut(path)?;
        let position = fs
            .position(snapshot)
            .ok_or_else(|| missing(&snapshot_entity(path, snapshot)))?;
        let created = fs.snapshots[position].created;
        fs.snapshots.retain(|s| s.created <= created);
        fs.pending = 0;
        state.journal.push(format!("rollback {}@{}", path, snapshot));
        Ok(())
    }

    async fn get_property(&self, entity: &str, name: &str) -> Result<PropertySetting> {
        if name != props::READONLY {
            return Err(Error::command(
                "zfs get",
                Some(1),
                format!("unsupported property '{}'", name),
            ));
        }
        let state = self.state();
        let fs = state.filesystem(entity)?;
        let value = if fs.readonly { "on" } else { "off" };
        Ok(PropertySetting::new(value, fs.readonly_source))
    }

    /// The pool holds no received values, so `received` falls back to plain
    /// inheritance the way `zfs inherit -S` does
    async fn inherit_property(&self, entity: &str, name: &str, received: bool) -> Result<()> {
        if name != props::READONLY {
            return Err(Error::command(
                "zfs inherit",
                Some(1),
                format!("unsupported property '{}'", name),
            ));
        }
        let mut state = self.state();
        let readonly = state.inherited_readonly(entity);
        let fs = state.filesystem_mut(entity)?;
        fs.readonly = readonly;
        fs.readonly_source = PropertySource::Inherited;
        let flag = if received { "-S " } else { "" };
        state.journal.push(format!("inherit {}{} {}", flag, name, entity));
        Ok(())
    }

    async fn set_property(&self, entity: &str, name: &str, value: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_property_value.as_deref() == Some(value) {
            return Err(Error::command(
                "zfs set",
                Some(1),
                format!("cannot set property for '{}': permission denied", entity),
            ));
        }
        if name != props::READONLY {
            return Err(Error::command(
                "zfs set",
                Some(1),
                format!("unsupported property '{}'", name),
            ));
        }

        let readonly = match value {
            "on" => true,
            "off" => false,
            other => {
                return Err(Error::command(
                    "zfs set",
                    Some(1),
                    format!("bad readonly value '{}'", other),
                ))
            }
        };
        let fs = state.filesystem_mut(entity)?;
        fs.readonly = readonly;
        fs.readonly_source = PropertySource::Local;
        state.journal.push(format!("set {}={} {}", name, value, entity));
        Ok(())
    }
}
