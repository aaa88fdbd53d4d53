#![forbid(unsafe_code)]
//! Shared newtypes and offset arithmetic for StripeCache.
//!
//! Everything here is about not mixing up the three unit systems the cache
//! juggles: raw byte offsets, page indices, and page-aligned byte offsets.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Sentinel stored in a page frame that has never been assigned an offset.
pub const INVALID_OFFSET: i64 = -1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnitError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

/// Validated page size (must be a power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageSize(u32);

impl PageSize {
    /// Create a `PageSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, UnitError> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(UnitError::InvalidField {
                field: "page_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn bytes(self) -> u64 {
        u64::from(self.0)
    }

    /// Number of bits to shift to convert between bytes and pages.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Convert a byte offset to a page index (truncating).
    #[must_use]
    pub fn page_index(self, byte_offset: u64) -> u64 {
        byte_offset >> u64::from(self.shift())
    }

    /// Round a byte offset down to its containing page boundary.
    #[must_use]
    pub fn round_down(self, byte_offset: u64) -> u64 {
        byte_offset & !(self.bytes() - 1)
    }

    /// Round a byte offset up to the next page boundary.
    ///
    /// Returns `None` on overflow.
    #[must_use]
    pub fn round_up(self, byte_offset: u64) -> Option<u64> {
        let mask = self.bytes() - 1;
        byte_offset.checked_add(mask).map(|v| v & !mask)
    }

    /// Whether `byte_offset` sits on a page boundary.
    #[must_use]
    pub fn is_aligned(self, byte_offset: u64) -> bool {
        byte_offset & (self.bytes() - 1) == 0
    }
}

impl Default for PageSize {
    fn default() -> Self {
        Self(DEFAULT_PAGE_SIZE)
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Round `value` down to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` otherwise.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, UnitError> {
    usize::try_from(value).map_err(|_| UnitError::IntegerConversion { field })
}
