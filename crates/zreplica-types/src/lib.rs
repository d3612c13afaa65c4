//! Core type system and error handling for zreplica
//!
//! This crate provides the foundational types shared by every zreplica crate:
//!
//! - **Error handling**: one error enum with kinds, severities and exit codes
//! - **Core types**: hosts, endpoints, snapshots, catalogs, plans and outcomes
//! - **Traits**: the snapshot engine contract and stream endpoints
//! - **Configuration**: validated value types
//!
//! # Features
//!
//! - `serde`: Enable serialization support
//!
//! # Examples
//!
//! ```rust
//! use zreplica_types::{Catalog, Endpoint, Snapshot};
//!
//! let source: Endpoint = "backup@nas:tank/home".parse().unwrap();
//! assert!(source.host.is_remote());
//!
//! let catalog = Catalog::from_snapshots("tank/home", vec![Snapshot::new("daily", 1_700_000_000, 4096)]);
//! assert_eq!(catalog.newest().unwrap().name, "daily");
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod result;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use config::{BufferSize, CompressionLevel, FreeFraction};
pub use error::{Error, ErrorKind, ErrorSeverity};
pub use result::Result;
pub use traits::*;
pub use types::*;
