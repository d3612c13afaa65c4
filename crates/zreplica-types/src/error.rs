//! Error types and handling for zreplica
//!
//! Every failure the replication engine can report is one variant of [`Error`].
//! Variants are grouped by [`ErrorKind`] and carry an [`ErrorSeverity`] that
//! decides whether the run must stop and which process exit code the CLI
//! reports.

/// Error severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorSeverity {
    /// Low severity - logged, the run continues
    Low,
    /// Medium severity - the current step failed, the run may take another path
    Medium,
    /// High severity - the run must stop and clean up its source tag
    High,
    /// Critical severity - the environment is unusable (configuration, tooling)
    Critical,
}

/// Main error type for zreplica operations
#[derive(thiserror::Error, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Error {
    /// The filesystem does not exist on the queried host
    #[error("Filesystem {path} does not exist on {host}")]
    CatalogUnavailable {
        /// Host that was queried
        host: String,
        /// Filesystem path that was not found
        path: String,
    },

    /// Target has snapshots but none share a creation time with the source
    #[error("No common ancestor between {source_path} and {target_path}")]
    NoCommonAncestor {
        /// Source filesystem, as `host:path`
        source_path: String,
        /// Target filesystem
        target_path: String,
    },

    /// The estimated stream does not fit into the target's free space
    #[error(
        "Insufficient space on {target}: transfer needs {estimated} bytes, {available} available"
    )]
    InsufficientSpaceForEstimate {
        /// Filesystem whose space was measured
        target: String,
        /// Estimated stream size in bytes
        estimated: u64,
        /// Bytes available on the target
        available: u64,
    },

    /// A filesystem that cannot be pruned is already below the free-space threshold
    #[error(
        "Free space on {filesystem} is below the threshold before any transfer: {available} bytes available, {required} required"
    )]
    FreeSpaceBelowThreshold {
        /// Filesystem whose space was measured
        filesystem: String,
        /// Bytes available
        available: u64,
        /// Bytes required by the free-space threshold
        required: u64,
    },

    /// Pruning ran out of candidates before the free-space threshold was met
    #[error(
        "Space reclamation exhausted on {target}: {available} bytes available, {required} required"
    )]
    SpaceReclaimExhausted {
        /// Target filesystem
        target: String,
        /// Bytes available after pruning
        available: u64,
        /// Bytes required by the free-space threshold
        required: u64,
    },

    /// Some, but not all, snapshots of the stream landed on the target
    #[error("Transfer to {target} partially failed: {snapshot} missing, target reached {reached}")]
    TransferPartialFailure {
        /// Target filesystem
        target: String,
        /// Snapshot that was expected on the target
        snapshot: String,
        /// Newest snapshot the target actually holds
        reached: String,
    },

    /// Nothing of the stream landed on the target
    #[error("Transfer to {target} failed: {snapshot} missing, no data received")]
    TransferTotalFailure {
        /// Target filesystem
        target: String,
        /// Snapshot that was expected on the target
        snapshot: String,
    },

    /// The target's saved property value could not be put back
    #[error("Failed to restore {property} on {entity}: {message}")]
    PropertyRestoreFailure {
        /// Filesystem whose property was changed
        entity: String,
        /// Property name
        property: String,
        /// Underlying failure
        message: String,
    },

    /// An external command exited unsuccessfully or could not be started
    #[error("Command `{command}` failed ({}): {stderr}", describe_status(.status))]
    Command {
        /// Rendered command line
        command: String,
        /// Exit code, if the process exited normally
        status: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// Output of an external command could not be interpreted
    #[error("Failed to parse {what}: {message}")]
    Parse {
        /// What was being parsed
        what: String,
        /// Error message describing the problem
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// I/O operation failed
    #[error("I/O error: {message}")]
    Io {
        /// Error message from the I/O operation
        message: String,
    },

    /// Generic error with custom message
    #[error("{message}")]
    Other {
        /// Custom error message
        message: String,
    },
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Error kind for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Filesystem missing on a host
    CatalogUnavailable,
    /// Histories diverged
    NoCommonAncestor,
    /// Not enough room before the transfer starts
    InsufficientSpace,
    /// Pruning could not meet the threshold
    SpaceReclaimExhausted,
    /// Transfer did not land the new snapshot
    Transfer,
    /// Property restore failed
    PropertyRestore,
    /// External command failure
    Command,
    /// Unparseable command output
    Parse,
    /// Configuration errors
    Config,
    /// I/O related errors
    Io,
    /// Other errors
    Other,
}

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CatalogUnavailable { .. } => ErrorKind::CatalogUnavailable,
            Self::NoCommonAncestor { .. } => ErrorKind::NoCommonAncestor,
            Self::InsufficientSpaceForEstimate { .. } | Self::FreeSpaceBelowThreshold { .. } => {
                ErrorKind::InsufficientSpace
            }
            Self::SpaceReclaimExhausted { .. } => ErrorKind::SpaceReclaimExhausted,
            Self::TransferPartialFailure { .. } | Self::TransferTotalFailure { .. } => {
                ErrorKind::Transfer
            }
            Self::PropertyRestoreFailure { .. } => ErrorKind::PropertyRestore,
            Self::Command { .. } => ErrorKind::Command,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Config { .. } => ErrorKind::Config,
            Self::Io { .. } => ErrorKind::Io,
            Self::Other { .. } => ErrorKind::Other,
        }
    }

    /// Get the error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::PropertyRestoreFailure { .. } => ErrorSeverity::Low,
            Self::CatalogUnavailable { .. } => ErrorSeverity::Medium,
            Self::NoCommonAncestor { .. }
            | Self::InsufficientSpaceForEstimate { .. }
            | Self::FreeSpaceBelowThreshold { .. }
            | Self::SpaceReclaimExhausted { .. }
            | Self::TransferPartialFailure { .. }
            | Self::TransferTotalFailure { .. }
            | Self::Command { .. }
            | Self::Parse { .. }
            | Self::Io { .. }
            | Self::Other { .. } => ErrorSeverity::High,
            Self::Config { .. } => ErrorSeverity::Critical,
        }
    }

    /// Whether this error ends the run
    pub fn is_fatal(&self) -> bool {
        self.severity() >= ErrorSeverity::High
    }

    /// Process exit code reported for this error
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::NoCommonAncestor | ErrorKind::Transfer => 3,
            ErrorKind::InsufficientSpace => 4,
            ErrorKind::SpaceReclaimExhausted => 5,
            _ => 1,
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new parse error
    pub fn parse<W: Into<String>, S: Into<String>>(what: W, message: S) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.into(),
        }
    }

    /// Create a new command error
    pub fn command<C: Into<String>, S: Into<String>>(
        command: C,
        status: Option<i32>,
        stderr: S,
    ) -> Self {
        Self::Command {
            command: command.into(),
            status,
            stderr: stderr.into(),
        }
    }

    /// Create a new generic error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn sample(kind: ErrorKind) -> Error {
        match kind {
            ErrorKind::CatalogUnavailable => Error::CatalogUnavailable {
                host: "backup01".into(),
                path: "tank/data".into(),
            },
            ErrorKind::NoCommonAncestor => Error::NoCommonAncestor {
                source_path: "src:tank/data".into(),
                target_path: "pool/data".into(),
            },
            ErrorKind::InsufficientSpace => Error::InsufficientSpaceForEstimate {
                target: "pool/data".into(),
                estimated: 10,
                available: 5,
            },
            ErrorKind::SpaceReclaimExhausted => Error::SpaceReclaimExhausted {
                target: "pool/data".into(),
                available: 5,
                required: 10,
            },
            ErrorKind::Transfer => Error::TransferTotalFailure {
                target: "pool/data".into(),
                snapshot: "zreplica-a-1".into(),
            },
            ErrorKind::PropertyRestore => Error::PropertyRestoreFailure {
                entity: "pool/data".into(),
                property: "readonly".into(),
                message: "denied".into(),
            },
            ErrorKind::Command => Error::command("zfs list", Some(1), "boom"),
            ErrorKind::Parse => Error::parse("zfs get output", "short line"),
            ErrorKind::Config => Error::config("bad"),
            ErrorKind::Io => Error::from(std::io::Error::other("pipe")),
            ErrorKind::Other => Error::other("other"),
        }
    }

    #[rstest]
    #[case(ErrorKind::NoCommonAncestor, 3)]
    #[case(ErrorKind::Transfer, 3)]
    #[case(ErrorKind::InsufficientSpace, 4)]
    #[case(ErrorKind::SpaceReclaimExhausted, 5)]
    #[case(ErrorKind::Command, 1)]
    #[case(ErrorKind::Config, 1)]
    fn test_exit_codes(#[case] kind: ErrorKind, #[case] code: u8) {
        let error = sample(kind);
        assert_eq!(error.kind(), kind);
        assert_eq!(error.exit_code(), code);
    }

    #[test]
    fn test_non_fatal_kinds() {
        assert!(!sample(ErrorKind::PropertyRestore).is_fatal());
        assert!(!sample(ErrorKind::CatalogUnavailable).is_fatal());
        assert!(sample(ErrorKind::NoCommonAncestor).is_fatal());
        assert!(sample(ErrorKind::Config).is_fatal());
    }

    #[test]
    fn test_partial_failure_is_transfer_kind() {
        let error = Error::TransferPartialFailure {
            target: "pool/data".into(),
            snapshot: "new".into(),
            reached: "mid".into(),
        };
        assert_eq!(error.kind(), ErrorKind::Transfer);
        assert_eq!(error.exit_code(), 3);
        assert!(error.to_string().contains("reached mid"));
    }

    #[test]
    fn test_threshold_precheck_is_not_a_reclaim_failure() {
        let error = Error::FreeSpaceBelowThreshold {
            filesystem: "pool".into(),
            available: 5,
            required: 10,
        };
        assert_eq!(error.kind(), ErrorKind::InsufficientSpace);
        assert_eq!(error.exit_code(), 4);
        assert!(!error.to_string().contains("reclamation"));
    }

    #[test]
    fn test_command_error_display() {
        let error = Error::command("zfs destroy tank@a", Some(2), "dataset is busy");
        assert_eq!(
            error.to_string(),
            "Command `zfs destroy tank@a` failed (exit status 2): dataset is busy"
        );

        let killed = Error::command("ssh host zfs send", None, "");
        assert!(killed.to_string().contains("terminated by signal"));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Low < ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium < ErrorSeverity::High);
        assert!(ErrorSeverity::High < ErrorSeverity::Critical);
    }

    proptest! {
        #[test]
        fn test_io_conversion_keeps_message(message in "[a-z ]{1,40}") {
            let error = Error::from(std::io::Error::other(message.clone()));
            prop_assert_eq!(error.kind(), ErrorKind::Io);
            prop_assert!(error.to_string().contains(message.trim()));
        }
    }
}
