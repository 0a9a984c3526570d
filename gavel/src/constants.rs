//! Jurisdiction-wide defaults.

use std::time::Duration;

/// How long a batch submission may stay in flight before it is classified as
/// rejected (retry-eligible).
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Blocks between dispute start and the earliest allowed finalize, unless the
/// jurisdiction overrides it.
pub const DEFAULT_DISPUTE_TIMEOUT_BLOCKS: u64 = 10;

/// Hard cap on operations per batch. Larger batches must be split by the
/// caller.
pub const MAX_BATCH_OPS: usize = 100;
