#![forbid(unsafe_code)]
//! StripeCache: a block-addressed page cache fronting a RAID-style file
//! store accessed by many concurrent workers.
//!
//! This crate re-exports the workspace surface; see [`sc_cache`] for the
//! cache core and [`sc_io`] for the transport engines.

pub use sc_cache::{
    AccessHandle, AccessMethod, AccessOutcome, AccessRequest, AccessResult, AssociativeCache,
    Bucket, CacheConfig, CacheIoContext, CacheIoStats, CacheTransport, CachedIo, CompletionSink,
    DirectoryStats, EvictionPolicyKind, LookupResult, MemoryManager, Page, PageRef,
};
pub use sc_error::{Result, ScError};
pub use sc_io::{
    DiskRequest, DispatchMode, FileTransport, Frame, IoRecord, IoTransport, MemTransport,
    TransportStats,
};
pub use sc_types::PageSize;
