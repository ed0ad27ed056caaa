use std::num::NonZeroU64;

use crate::error::{RaftError, Result};

/// Identifies a server in the cluster. Zero is reserved and never valid.
pub type ServerId = NonZeroU64;

/// Logical clock identifying a leader era.
pub type Term = u64;

/// Monotonic position within the replicated log. The first real entry is at index 1.
pub type LogIndex = u64;

/// Milliseconds since an arbitrary epoch, as reported by the clock capability.
pub type Millis = u64;

pub(crate) fn server_id(raw: u64) -> Result<ServerId> {
    NonZeroU64::new(raw).ok_or_else(|| RaftError::BadId("server id must be non-zero".into()))
}
