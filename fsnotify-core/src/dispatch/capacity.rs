//! Queue capacity validation

use std::fmt;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{Result, WatchError};

/// Capacity used when none is given: effectively unbounded
pub const DEFAULT_CAPACITY: usize = i32::MAX as usize;

/// Bound of a dispatch core's event queue, always at least one
///
/// Values above what a tokio channel can hold are clamped to its maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueCapacity(usize);

impl QueueCapacity {
    pub const DEFAULT: QueueCapacity = QueueCapacity(clamp(DEFAULT_CAPACITY));

    pub fn new(capacity: usize) -> Result<Self> {
        Self::try_from(capacity)
    }

    pub fn get(self) -> usize {
        self.0
    }
}

const fn clamp(capacity: usize) -> usize {
    if capacity > Semaphore::MAX_PERMITS { Semaphore::MAX_PERMITS } else { capacity }
}

impl Default for QueueCapacity {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for QueueCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for QueueCapacity {
    type Error = WatchError;

    fn try_from(capacity: i64) -> Result<Self> {
        if capacity < 1 {
            return Err(WatchError::InvalidCapacity { capacity });
        }
        let capacity = usize::try_from(capacity).unwrap_or(usize::MAX);
        let clamped = clamp(capacity);
        if clamped != capacity {
            debug!("Queue capacity {} clamped to {}", capacity, clamped);
        }
        Ok(QueueCapacity(clamped))
    }
}

impl TryFrom<i32> for QueueCapacity {
    type Error = WatchError;

    fn try_from(capacity: i32) -> Result<Self> {
        Self::try_from(i64::from(capacity))
    }
}

impl TryFrom<usize> for QueueCapacity {
    type Error = WatchError;

    fn try_from(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(WatchError::InvalidCapacity { capacity: 0 });
        }
        Ok(QueueCapacity(clamp(capacity)))
    }
}

impl TryFrom<u32> for QueueCapacity {
    type Error = WatchError;

    fn try_from(capacity: u32) -> Result<Self> {
        Self::try_from(i64::from(capacity))
    }
}
