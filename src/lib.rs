//! Expose a remote source tree over an outbound, multiplexed,
//! content-addressed tunnel.
//!
//! The agent runs next to the sources. It dials a relay, announces itself
//! and answers operations: list units, fetch a unit's dependency closure,
//! and watch that closure for changes. The consumer accepts the agent,
//! keeps a fingerprint-keyed cache of every byte it has received, and
//! presents fetched closures as a read-only filesystem or a directory on
//! disk.

pub mod cache;
pub mod collector;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod resolver;
pub mod sync;
pub mod tunnel;
pub mod unit;
pub mod vfs;
pub mod watcher;
pub mod workspace;

pub use error::{Result, TunnelError};
pub use fingerprint::Fingerprint;
pub use unit::{BuildParams, UnitId, UnitResolver};
pub use workspace::RemoteWorkspace;
