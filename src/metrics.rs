use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    // Queue
    pub queue_puts_total: AtomicU64,
    pub queue_coalesced_total: AtomicU64,
    pub queue_pending_gauge: AtomicU64,
    pub storage_reopens_total: AtomicU64,

    // Drains
    pub drain_runs_total: AtomicU64,
    pub drain_rejected_total: AtomicU64,
    pub mutations_applied_total: AtomicU64,
    pub mutations_failed_total: AtomicU64,
    pub mutations_skipped_total: AtomicU64,
    pub mutations_dropped_total: AtomicU64,

    // Writes and reads
    pub direct_writes_total: AtomicU64,
    pub conflicts_stale_total: AtomicU64,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

pub(crate) fn record_queue_put(coalesced: bool) {
    let m = metrics();
    m.queue_puts_total.fetch_add(1, Ordering::Relaxed);
    if coalesced {
        m.queue_coalesced_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) fn set_pending(pending: u64) {
    metrics()
        .queue_pending_gauge
        .store(pending, Ordering::Relaxed);
}

pub(crate) fn record_storage_reopen() {
    metrics()
        .storage_reopens_total
        .fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_drain(applied: u64, failed: u64, skipped: u64, dropped: u64) {
    let m = metrics();
    m.drain_runs_total.fetch_add(1, Ordering::Relaxed);
    m.mutations_applied_total
        .fetch_add(applied, Ordering::Relaxed);
    m.mutations_failed_total.fetch_add(failed, Ordering::Relaxed);
    m.mutations_skipped_total
        .fetch_add(skipped, Ordering::Relaxed);
    m.mutations_dropped_total
        .fetch_add(dropped, Ordering::Relaxed);
}

pub(crate) fn record_drain_rejected() {
    metrics()
        .drain_rejected_total
        .fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_direct_write() {
    metrics()
        .direct_writes_total
        .fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_conflict_stale(n: u64) {
    if n > 0 {
        metrics()
            .conflicts_stale_total
            .fetch_add(n, Ordering::Relaxed);
    }
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let mut s = String::new();
    let counters: [(&str, &str, &AtomicU64); 12] = [
        ("fieldsync_queue_puts_total", "counter", &m.queue_puts_total),
        ("fieldsync_queue_coalesced_total", "counter", &m.queue_coalesced_total),
        ("fieldsync_queue_pending", "gauge", &m.queue_pending_gauge),
        ("fieldsync_storage_reopens_total", "counter", &m.storage_reopens_total),
        ("fieldsync_drain_runs_total", "counter", &m.drain_runs_total),
        ("fieldsync_drain_rejected_total", "counter", &m.drain_rejected_total),
        ("fieldsync_mutations_applied_total", "counter", &m.mutations_applied_total),
        ("fieldsync_mutations_failed_total", "counter", &m.mutations_failed_total),
        ("fieldsync_mutations_skipped_total", "counter", &m.mutations_skipped_total),
        ("fieldsync_mutations_dropped_total", "counter", &m.mutations_dropped_total),
        ("fieldsync_direct_writes_total", "counter", &m.direct_writes_total),
        ("fieldsync_conflicts_stale_total", "counter", &m.conflicts_stale_total),
    ];
    for (name, kind, value) in counters {
        let _ = writeln!(
            s,
            "# TYPE {name} {kind}\n{name} {}",
            value.load(Ordering::Relaxed)
        );
    }
    s
}
