use tracing::debug;

/// Consumer of financial-summary invalidations.
///
/// The allocation engine calls this after every committed write; the
/// reconciliation engine calls it after a corrected aggregate.
pub trait SummaryCache: Send + Sync {
    fn invalidate_representative(&self, representative_id: i64, cascade_global: bool, reason: &str);
}

/// Used when no summary cache is wired in; only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSummaryCache;

impl SummaryCache for NoopSummaryCache {
    fn invalidate_representative(&self, representative_id: i64, cascade_global: bool, reason: &str) {
        debug!(representative_id, cascade_global, reason, "summary cache invalidation (no cache wired)");
    }
}
