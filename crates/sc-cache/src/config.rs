//! Cache configuration.

use sc_error::{Result, ScError};
use sc_types::PageSize;
use serde::{Deserialize, Serialize};

/// Default size the directory starts at before on-demand expansion.
pub const DEFAULT_INIT_CACHE_SIZE: usize = 128 * 1024 * 1024;

/// Eviction policy selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicyKind {
    Lru,
    Lfu,
    Fifo,
    #[default]
    Clock,
    GClock,
}

/// Runtime configuration for one cache instance.
///
/// One cache (with its own flush engine and transport) is expected per NUMA
/// partition; `num_nodes` only feeds the per-cache share of the global page
/// reserve, and `node_id` is stamped on outgoing requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory size at startup, in bytes. Clamped to `max_size`; ignored
    /// (forced to `max_size`) when the cache is not expandable.
    pub init_size: usize,
    /// Upper bound on cached bytes.
    pub max_size: usize,
    /// Number of NUMA partitions sharing the page reserve.
    pub num_nodes: usize,
    /// Which eviction policy every bucket runs.
    pub policy: EvictionPolicyKind,
    /// Page size in bytes (power of two).
    pub page_size: u32,
    /// Pages per bucket (power of two).
    pub cell_size: usize,
    /// Pages per RAID stripe; write-back merging never crosses a stripe.
    pub raid_block_pages: usize,
    /// Minimum count of flushable dirty pages before a bucket is queued to
    /// the flush engine.
    pub dirty_pages_threshold: usize,
    /// Capacity of the flush engine's bucket queue.
    pub flush_queue_len: usize,
    /// Maximum frames coalesced into one underlying request.
    pub max_frames_per_request: usize,
    /// Whether the directory may grow via linear hashing.
    pub expandable: bool,
    /// NUMA node stamped on requests issued by this cache.
    pub node_id: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            init_size: DEFAULT_INIT_CACHE_SIZE,
            max_size: DEFAULT_INIT_CACHE_SIZE,
            num_nodes: 1,
            policy: EvictionPolicyKind::default(),
            page_size: sc_types::DEFAULT_PAGE_SIZE,
            cell_size: 16,
            raid_block_pages: 16,
            dirty_pages_threshold: 1,
            flush_queue_len: 256,
            max_frames_per_request: 16,
            expandable: true,
            node_id: 0,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        let page_size = PageSize::new(self.page_size).map_err(ScError::from)?;
        if !self.cell_size.is_power_of_two() {
            return Err(ScError::Config(format!(
                "cell_size must be a power of two, got {}",
                self.cell_size
            )));
        }
        if !self.raid_block_pages.is_power_of_two() {
            return Err(ScError::Config(format!(
                "raid_block_pages must be a power of two, got {}",
                self.raid_block_pages
            )));
        }
        let bucket_bytes = self.cell_size as u64 * page_size.bytes();
        if (self.max_size as u64) < bucket_bytes {
            return Err(ScError::Config(format!(
                "max_size {} smaller than one bucket ({bucket_bytes} bytes)",
                self.max_size
            )));
        }
        if self.num_nodes == 0 {
            return Err(ScError::Config("num_nodes must be > 0".to_owned()));
        }
        if self.flush_queue_len == 0 {
            return Err(ScError::Config("flush_queue_len must be > 0".to_owned()));
        }
        if self.max_frames_per_request == 0 {
            return Err(ScError::Config(
                "max_frames_per_request must be > 0".to_owned(),
            ));
        }
        Ok(())
    }

    /// Validated page size.
    ///
    /// Callers run [`CacheConfig::validate`] first; an invalid page size here
    /// falls back to the default rather than panicking.
    #[must_use]
    pub fn page(&self) -> PageSize {
        PageSize::new(self.page_size).unwrap_or_default()
    }

    /// Directory size the cache starts with, in bytes.
    #[must_use]
    pub fn effective_init_size(&self) -> usize {
        if self.expandable {
            self.init_size.min(self.max_size)
        } else {
            self.max_size
        }
    }

    /// RAID stripe width in bytes.
    #[must_use]
    pub fn raid_block_bytes(&self) -> u64 {
        self.raid_block_pages as u64 * u64::from(self.page_size)
    }
}
