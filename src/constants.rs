// -
// Dedup key layout: <prefix>/<sha256(template id)>/<suffix>

/// Lease-bound election record
pub(crate) const DEDUP_LOCK_SUFFIX: &str = "lock";
/// Shared render data published by the leader
pub(crate) const DEDUP_DATA_SUFFIX: &str = "data";
/// Monotonic leadership term counter
pub(crate) const DEDUP_TERM_SUFFIX: &str = "term";

