//! Clustered file-state cache for a multi-node SMB/NFS file server.
//!
//! This library keeps the per-file coordination data SMB semantics demand -
//! open counts, sharing modes, opportunistic locks, byte-range locks,
//! size/timestamp hints, data-update markers - globally consistent across a
//! fleet of file server nodes, while staying fast enough to sit on the hot
//! open/read/write/close path.
//!
//! ## Main Components
//!
//! - `state`: the per-path file-state record and the SMB state machines
//!   that mutate it - access arbitration, oplocks, byte-range locks,
//!   coalesced low-priority updates.
//!
//! - `cluster`: the distributed primitives the cache is built on - a
//!   partitioned map with per-key locks, a remote-task runtime that ships
//!   typed operations to a key's partition owner, a pub/sub topic, and
//!   membership handling with departed-member cleanup.
//!
//! - `cache`: one node's cache proper - the public operations, the
//!   near-cache replica layer, per-node state (live oplock handles and
//!   deferred requests), the rename engine and the expiry reaper.
//!
//! - `host`: the traits a hosting file server implements - oplock
//!   management, change notifications, the worker pool for deferred
//!   requests, lifecycle listeners.
//!
//! ## Usage
//!
//! Create one [`ClusterFabric`] per cluster, then one
//! [`ClusterFileStateCache`] per node, wire in the host collaborators and
//! call `start_cluster`. Protocol handlers then drive the cache through
//! operations like `grant_file_access`, `add_byte_lock` and
//! `rename_state`.

pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod host;
pub mod path;
pub mod state;

pub use cache::{AccessToken, CacheHosts, ClusterFileStateCache};
pub use cluster::{ClusterFabric, NodeId};
