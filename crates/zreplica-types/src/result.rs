//! Result type alias for zreplica operations

use crate::Error;

/// Result type alias for zreplica operations
pub type Result<T> = std::result::Result<T, Error>;
