//! Bus and range configuration.

use alloc::{string::String, sync::Arc};

use crate::addr::IoAddress;
use crate::device::IoDevice;
use crate::range::IoRange;
use crate::registry::RangeError;

/// Behaviour switches of an I/O bus.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct IoBusConfig {
    /// Log accesses that no range claims.
    ///
    /// Legacy guests probe large numbers of unclaimed ports during boot, so
    /// this is usually off for port I/O and on for MMIO.
    pub trace_unknown: bool,
    /// Accept writes that would defer in the constrained tier and commit
    /// them later in the capable tier (one per executor).
    pub commit_deferred_writes: bool,
    /// Use the per-executor range cache.
    pub dispatch_cache: bool,
}

impl Default for IoBusConfig {
    fn default() -> Self {
        Self {
            trace_unknown: false,
            commit_deferred_writes: false,
            dispatch_cache: true,
        }
    }
}

impl IoBusConfig {
    /// Default configuration for an MMIO bus.
    pub fn mmio() -> Self {
        Self {
            trace_unknown: true,
            ..Default::default()
        }
    }

    /// Builder: log unclaimed accesses.
    pub fn with_trace_unknown(mut self, active: bool) -> Self {
        self.trace_unknown = active;
        self
    }

    /// Builder: accept deferred writes for later commit.
    pub fn with_commit_deferred_writes(mut self, active: bool) -> Self {
        self.commit_deferred_writes = active;
        self
    }

    /// Builder: enable/disable the dispatch cache.
    pub fn with_dispatch_cache(mut self, active: bool) -> Self {
        self.dispatch_cache = active;
        self
    }
}

/// Represents one I/O range a device asks for.
///
/// This is the serializable description a device-lifecycle manager keeps
/// around; [`IoRangeConfig::to_range`] turns it into an attachable range.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IoRangeConfig {
    /// The name of the device serving the range.
    pub device: String,
    /// The first address of the range.
    pub base: u64,
    /// The number of addresses covered.
    pub length: u64,
    /// The opaque value passed to the callbacks.
    #[serde(default)]
    pub user_data: usize,
    /// Whether the callbacks may run in the constrained tier.
    #[serde(default)]
    pub constrained_tier: bool,
}

impl IoRangeConfig {
    /// Builds a range served by `device`.
    ///
    /// Fails if the base does not fit the address space; overlap and length
    /// are checked when the range is attached.
    pub fn to_range<A: IoAddress>(&self, device: Arc<IoDevice<A>>) -> Result<IoRange<A>, RangeError> {
        if self.base >= A::LIMIT {
            return Err(RangeError::InvalidRange);
        }
        Ok(IoRange::new(A::from_raw(self.base), self.length, device)
            .with_user_data(self.user_data)
            .with_constrained_tier(self.constrained_tier))
    }
}
