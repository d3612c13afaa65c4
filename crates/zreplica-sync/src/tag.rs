//! Tool-created snapshot names
//!
//! Every run creates one snapshot named `<prefix>-<hostId>-<timestamp>`.
//! Whether a name follows this pattern decides which component may delete
//! it: tagged snapshots belong to the retention sweeper, everything else to
//! the space reclaimer.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::fmt;
use zreplica_types::{Error, Result};

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Naming scheme of tool-created snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagScheme {
    prefix: String,
    host_id: String,
}

impl TagScheme {
    /// Create a scheme; characters a snapshot name cannot hold are rejected in the prefix
    /// and replaced by `_` in the host id
    pub fn new<P: Into<String>, H: AsRef<str>>(prefix: P, host_id: H) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() || !prefix.chars().all(is_name_char) {
            return Err(Error::config(format!("invalid tag prefix '{}'", prefix)));
        }

        let host_id: String = host_id
            .as_ref()
            .trim()
            .chars()
            .map(|c| if is_name_char(c) { c } else { '_' })
            .collect();
        if host_id.is_empty() {
            return Err(Error::config("host id must not be empty"));
        }

        Ok(Self { prefix, host_id })
    }

    /// Tag prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Host identity embedded in tags
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    fn marker(&self) -> String {
        format!("{}-{}-", self.prefix, self.host_id)
    }

    /// Whether `name` was created by this scheme
    pub fn is_tagged(&self, name: &str) -> bool {
        name.strip_prefix(&self.marker())
            .is_some_and(|stamp| NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).is_ok())
    }

    /// Tag for a run started at `at`
    pub fn tag_at(&self, at: DateTime<Utc>) -> RunTag {
        RunTag {
            name: format!("{}{}", self.marker(), at.format(TIMESTAMP_FORMAT)),
            created_at: at,
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

/// The tag of one run, computed once at run start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTag {
    name: String,
    created_at: DateTime<Utc>,
}

impl RunTag {
    /// Tag for a run starting now
    pub fn now(scheme: &TagScheme) -> Self {
        scheme.tag_at(Utc::now())
    }

    /// Snapshot name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run start time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl fmt::Display for RunTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
