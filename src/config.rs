//! Cluster cache configuration.
//!
//! The host's configuration loader is an external collaborator; it hands the
//! cache a flat set of recognized key/value pairs. This module validates
//! them, applies defaults and exposes the result as [`ClusterConfig`].
//!
//! Recognized keys:
//! - `clusterName` (required, non-empty) - distributed map name and topic
//!   prefix
//! - `clusterTopic` (required, non-empty) - pub/sub topic name
//! - `nearCache.disable` (bool, default `false`)
//! - `nearCache.timeout` (seconds, 3-120, default 5)
//! - `cacheDebug.flags` (comma list of debug area names)

use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Default near-cache entry lifetime.
pub const DEFAULT_NEAR_CACHE_TIMEOUT: Duration = Duration::from_secs(5);

/// Valid range for `nearCache.timeout`, in seconds.
pub const NEAR_CACHE_TIMEOUT_RANGE: (u64, u64) = (3, 120);

/// Default wake interval of the expiry reaper.
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(15);

/// Default idle lifetime of a file state before the reaper may drop it.
pub const DEFAULT_STATE_EXPIRY: Duration = Duration::from_secs(300);

/// Default wait for an oplock break acknowledgment before deferred requests
/// are failed.
pub const DEFAULT_OPLOCK_BREAK_TIMEOUT: Duration = Duration::from_secs(5);

bitflags! {
    /// Debug areas that can be switched on via `cacheDebug.flags`.
    ///
    /// Each flag gates the detail logging of one subsystem; the flag names
    /// accepted in the configuration value match the variant names below.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DebugFlags: u32 {
        /// Core state-cache operations (find/create/remove).
        const STATE_CACHE      = 0x0000_0001;
        /// Expiry reaper passes.
        const EXPIRE           = 0x0000_0002;
        /// Near-cache admits, hits, evictions and invalidations.
        const NEAR_CACHE       = 0x0000_0004;
        /// Oplock grant/break/type-change traffic.
        const OPLOCK           = 0x0000_0008;
        /// Byte-range lock operations.
        const BYTE_LOCK        = 0x0000_0010;
        /// File access grant and release decisions.
        const FILE_ACCESS      = 0x0000_0020;
        /// Cluster membership changes.
        const MEMBERSHIP       = 0x0000_0040;
        /// Departed-member cleanup sweeps.
        const CLEANUP          = 0x0000_0080;
        /// Per-node state table changes.
        const PER_NODE         = 0x0000_0100;
        /// Partitioned-map entry events.
        const CLUSTER_ENTRY    = 0x0000_0200;
        /// Topic messages sent and received.
        const CLUSTER_MESSAGE  = 0x0000_0400;
        /// Remote task dispatch and execution.
        const REMOTE_TASK      = 0x0000_0800;
        /// Remote task timing reports.
        const REMOTE_TIMING    = 0x0000_1000;
        /// Rename processing.
        const RENAME           = 0x0000_2000;
        /// File-data-update marker traffic.
        const FILE_DATA_UPDATE = 0x0000_4000;
        /// File status transitions.
        const FILE_STATUS      = 0x0000_8000;
    }
}

impl DebugFlags {
    /// Parses a comma-separated flag list (`"Oplock,ByteLock,NearCache"`).
    ///
    /// Names are matched case-insensitively; whitespace around entries and
    /// empty entries are ignored. An unrecognized name fails with
    /// [`StateError::ConfigInvalid`].
    pub fn parse(value: &str) -> StateResult<DebugFlags> {
        let mut flags = DebugFlags::empty();
        for name in value.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            flags |= match name.to_ascii_lowercase().as_str() {
                "statecache" => DebugFlags::STATE_CACHE,
                "expire" => DebugFlags::EXPIRE,
                "nearcache" => DebugFlags::NEAR_CACHE,
                "oplock" => DebugFlags::OPLOCK,
                "bytelock" => DebugFlags::BYTE_LOCK,
                "fileaccess" => DebugFlags::FILE_ACCESS,
                "membership" => DebugFlags::MEMBERSHIP,
                "cleanup" => DebugFlags::CLEANUP,
                "pernode" => DebugFlags::PER_NODE,
                "clusterentry" => DebugFlags::CLUSTER_ENTRY,
                "clustermessage" => DebugFlags::CLUSTER_MESSAGE,
                "remotetask" => DebugFlags::REMOTE_TASK,
                "remotetiming" => DebugFlags::REMOTE_TIMING,
                "rename" => DebugFlags::RENAME,
                "filedataupdate" => DebugFlags::FILE_DATA_UPDATE,
                "filestatus" => DebugFlags::FILE_STATUS,
                _ => {
                    return Err(StateError::ConfigInvalid(format!(
                        "unknown cacheDebug flag '{name}'"
                    )))
                }
            };
        }
        Ok(flags)
    }
}

/// Validated configuration of one cache node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Cluster name; used as the distributed map name and topic prefix.
    pub cluster_name: String,
    /// Pub/sub topic name.
    pub cluster_topic: String,
    /// Disables the near-cache entirely when set.
    pub near_cache_disabled: bool,
    /// Near-cache entry lifetime.
    pub near_cache_timeout: Duration,
    /// Debug areas with detail logging enabled.
    pub debug_flags: DebugFlags,
    /// Whether the file-name component of paths preserves its case.
    pub case_sensitive: bool,
    /// Wake interval of the expiry reaper.
    pub reaper_interval: Duration,
    /// Idle lifetime before a closed state becomes eligible for expiry.
    pub state_expiry: Duration,
    /// How long an oplock break may stay unacknowledged before its deferred
    /// requests are failed.
    pub oplock_break_timeout: Duration,
}

impl ClusterConfig {
    /// Creates a configuration with the given cluster/topic names and
    /// defaults for everything else.
    pub fn new(cluster_name: &str, cluster_topic: &str) -> StateResult<ClusterConfig> {
        if cluster_name.is_empty() {
            return Err(StateError::ConfigInvalid("clusterName must not be empty".to_string()));
        }
        if cluster_topic.is_empty() {
            return Err(StateError::ConfigInvalid("clusterTopic must not be empty".to_string()));
        }
        Ok(ClusterConfig {
            cluster_name: cluster_name.to_string(),
            cluster_topic: cluster_topic.to_string(),
            near_cache_disabled: false,
            near_cache_timeout: DEFAULT_NEAR_CACHE_TIMEOUT,
            debug_flags: DebugFlags::empty(),
            case_sensitive: true,
            reaper_interval: DEFAULT_REAPER_INTERVAL,
            state_expiry: DEFAULT_STATE_EXPIRY,
            oplock_break_timeout: DEFAULT_OPLOCK_BREAK_TIMEOUT,
        })
    }

    /// Builds a configuration from the recognized key/value pairs handed
    /// over by the host's configuration loader.
    ///
    /// # Arguments
    ///
    /// * `values` - `(key, value)` pairs; keys outside the recognized set
    ///   fail with [`StateError::ConfigInvalid`]
    pub fn from_values<'a, I>(values: I) -> StateResult<ClusterConfig>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut name = None;
        let mut topic = None;
        let mut disable = false;
        let mut timeout = DEFAULT_NEAR_CACHE_TIMEOUT;
        let mut flags = DebugFlags::empty();

        for (key, value) in values {
            match key {
                "clusterName" => name = Some(value.to_string()),
                "clusterTopic" => topic = Some(value.to_string()),
                "nearCache.disable" => {
                    disable = value.parse::<bool>().map_err(|_| {
                        StateError::ConfigInvalid(format!(
                            "nearCache.disable must be a boolean, got '{value}'"
                        ))
                    })?;
                }
                "nearCache.timeout" => {
                    let secs = value.parse::<u64>().map_err(|_| {
                        StateError::ConfigInvalid(format!(
                            "nearCache.timeout must be an integer, got '{value}'"
                        ))
                    })?;
                    let (lo, hi) = NEAR_CACHE_TIMEOUT_RANGE;
                    if secs < lo || secs > hi {
                        return Err(StateError::ConfigInvalid(format!(
                            "nearCache.timeout must be in {lo}..={hi} seconds, got {secs}"
                        )));
                    }
                    timeout = Duration::from_secs(secs);
                }
                "cacheDebug.flags" => flags = DebugFlags::parse(value)?,
                _ => {
                    return Err(StateError::ConfigInvalid(format!(
                        "unrecognized configuration key '{key}'"
                    )))
                }
            }
        }

        let name = name
            .ok_or_else(|| StateError::ConfigInvalid("clusterName is required".to_string()))?;
        let topic = topic
            .ok_or_else(|| StateError::ConfigInvalid("clusterTopic is required".to_string()))?;

        let mut config = ClusterConfig::new(&name, &topic)?;
        config.near_cache_disabled = disable;
        config.near_cache_timeout = timeout;
        config.debug_flags = flags;
        Ok(config)
    }

    /// True when detail logging for `flag` is switched on.
    pub fn has_debug(&self, flag: DebugFlags) -> bool {
        self.debug_flags.contains(flag)
    }
}
