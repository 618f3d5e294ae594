use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const LATENCY_BUCKET_COUNT: usize = 12;
const LATENCY_BUCKETS_MS: [u64; LATENCY_BUCKET_COUNT] =
    [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

#[derive(Clone, Debug, Serialize)]
pub struct LatencySnapshot {
    pub buckets_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub overflow: u64,
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
}

#[derive(Default)]
struct LatencyMetrics {
    buckets: [AtomicU64; LATENCY_BUCKET_COUNT],
    overflow: AtomicU64,
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyMetrics {
    fn record(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);

        match LATENCY_BUCKETS_MS.iter().position(|bucket| ms <= *bucket) {
            Some(idx) => self.buckets[idx].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ms = self.total_ms.load(Ordering::Relaxed);
        let avg_ms = if count > 0 {
            total_ms as f64 / count as f64
        } else {
            0.0
        };
        LatencySnapshot {
            buckets_ms: LATENCY_BUCKETS_MS.to_vec(),
            counts: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            overflow: self.overflow.load(Ordering::Relaxed),
            count,
            avg_ms,
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

/// Which surface a request hit, by path prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Referrer,
    Admin,
    Internal,
    Other,
}

impl Route {
    pub fn of(path: &str) -> Self {
        if path.starts_with("/referral/") {
            Route::Referrer
        } else if path.starts_with("/admin/") {
            Route::Admin
        } else if path.starts_with("/internal/") {
            Route::Internal
        } else {
            Route::Other
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HttpMetricsSnapshot {
    pub referrer: LatencySnapshot,
    pub admin: LatencySnapshot,
    pub internal: LatencySnapshot,
    pub reject_unauthorized: u64,
    pub reject_rate_limit: u64,
    pub reject_body_limit: u64,
    pub server_errors: u64,
}

#[derive(Default)]
pub struct HttpMetrics {
    referrer: LatencyMetrics,
    admin: LatencyMetrics,
    internal: LatencyMetrics,
    reject_unauthorized: AtomicU64,
    reject_rate_limit: AtomicU64,
    reject_body_limit: AtomicU64,
    server_errors: AtomicU64,
}

impl HttpMetrics {
    pub fn record(&self, route: Route, duration: Duration) {
        match route {
            Route::Referrer => self.referrer.record(duration),
            Route::Admin => self.admin.record(duration),
            Route::Internal => self.internal.record(duration),
            Route::Other => {}
        }
    }

    pub fn inc_reject_unauthorized(&self) {
        self.reject_unauthorized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reject_rate_limit(&self) {
        self.reject_rate_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reject_body_limit(&self) {
        self.reject_body_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_server_error(&self) {
        self.server_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HttpMetricsSnapshot {
        HttpMetricsSnapshot {
            referrer: self.referrer.snapshot(),
            admin: self.admin.snapshot(),
            internal: self.internal.snapshot(),
            reject_unauthorized: self.reject_unauthorized.load(Ordering::Relaxed),
            reject_rate_limit: self.reject_rate_limit.load(Ordering::Relaxed),
            reject_body_limit: self.reject_body_limit.load(Ordering::Relaxed),
            server_errors: self.server_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct LedgerMetricsSnapshot {
    pub signups: u64,
    pub payments: u64,
    pub reversals: u64,
    pub holds_released: u64,
    pub payouts_requested: u64,
    pub payouts_refused: u64,
    pub inconsistencies: u64,
}

/// Outcomes of ledger operations, counted at the service boundary.
#[derive(Default)]
pub struct LedgerMetrics {
    signups: AtomicU64,
    payments: AtomicU64,
    reversals: AtomicU64,
    holds_released: AtomicU64,
    payouts_requested: AtomicU64,
    payouts_refused: AtomicU64,
    inconsistencies: AtomicU64,
}

impl LedgerMetrics {
    pub fn inc_signup(&self) {
        self.signups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_payment(&self) {
        self.payments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reversal(&self) {
        self.reversals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_holds_released(&self, count: usize) {
        self.holds_released
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn inc_payout_requested(&self) {
        self.payouts_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_payout_refused(&self) {
        self.payouts_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_inconsistency(&self) {
        self.inconsistencies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LedgerMetricsSnapshot {
        LedgerMetricsSnapshot {
            signups: self.signups.load(Ordering::Relaxed),
            payments: self.payments.load(Ordering::Relaxed),
            reversals: self.reversals.load(Ordering::Relaxed),
            holds_released: self.holds_released.load(Ordering::Relaxed),
            payouts_requested: self.payouts_requested.load(Ordering::Relaxed),
            payouts_refused: self.payouts_refused.load(Ordering::Relaxed),
            inconsistencies: self.inconsistencies.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct JournalMetricsSnapshot {
    pub queue_depth: u64,
    pub queue_high_water: u64,
    pub rows_written: u64,
    pub write_errors: u64,
}

#[derive(Default)]
pub struct JournalMetrics {
    queue_depth: AtomicU64,
    queue_high_water: AtomicU64,
    rows_written: AtomicU64,
    write_errors: AtomicU64,
}

impl JournalMetrics {
    pub fn inc_queue_depth(&self) {
        let depth = self.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.queue_high_water.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn dec_queue_depth(&self) {
        let _ = self
            .queue_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |depth| {
                depth.checked_sub(1)
            });
    }

    pub fn add_rows_written(&self, rows: usize) {
        self.rows_written.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn inc_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> JournalMetricsSnapshot {
        JournalMetricsSnapshot {
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            queue_high_water: self.queue_high_water.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}
