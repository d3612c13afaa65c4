//! Command construction and process execution for zreplica
//!
//! This crate turns typed command lines into processes on the local machine
//! or, through ssh, on a remote host:
//!
//! - **Command lines**: argument vectors, pipelines and batched scripts with
//!   POSIX shell quoting
//! - **Command channel**: the [`CommandChannel`] contract used by snapshot
//!   engine adapters
//! - **Process channel**: [`ProcessChannel`], backed by `tokio::process`
//!
//! # Examples
//!
//! ```rust
//! use zreplica_exec::{CommandLine, Pipeline};
//!
//! let send = Pipeline::new(CommandLine::new("zfs").args(["send", "tank/a@snap"]))
//!     .pipe(CommandLine::new("zstd").arg("-c"));
//! assert_eq!(send.to_shell(), "zfs send tank/a@snap | zstd -c");
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod command;
pub mod process;

pub use channel::{node_name, CommandChannel, CommandOutput};
pub use command::{shell_quote, CommandLine, Pipeline, Script};
pub use process::{ProcessChannel, SshOptions};
