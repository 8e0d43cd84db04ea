use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    // Documents
    pub doc_reads_total: AtomicU64,
    pub doc_writes_total: AtomicU64,
    pub doc_conflicts_total: AtomicU64,

    // Unit of work
    pub flushes_total: AtomicU64,
    pub orphans_removed_total: AtomicU64,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

pub fn record_doc_read(count: u64) {
    metrics().doc_reads_total.fetch_add(count, Ordering::Relaxed);
}

pub fn record_doc_write(count: u64) {
    metrics().doc_writes_total.fetch_add(count, Ordering::Relaxed);
}

pub fn record_doc_conflict() {
    metrics().doc_conflicts_total.fetch_add(1, Ordering::Relaxed);
}

pub fn record_flush() {
    metrics().flushes_total.fetch_add(1, Ordering::Relaxed);
}

pub fn record_orphans_removed(count: u64) {
    metrics()
        .orphans_removed_total
        .fetch_add(count, Ordering::Relaxed);
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let mut s = String::new();
    // docs
    let _ = writeln!(
        s,
        "# TYPE doc_reads_total counter\ndoc_reads_total {}",
        m.doc_reads_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE doc_writes_total counter\ndoc_writes_total {}",
        m.doc_writes_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE doc_conflicts_total counter\ndoc_conflicts_total {}",
        m.doc_conflicts_total.load(Ordering::Relaxed)
    );
    // unit of work
    let _ = writeln!(
        s,
        "# TYPE flushes_total counter\nflushes_total {}",
        m.flushes_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE orphans_removed_total counter\norphans_removed_total {}",
        m.orphans_removed_total.load(Ordering::Relaxed)
    );
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_every_counter() {
        record_flush();
        let text = render_prometheus();
        for name in [
            "doc_reads_total",
            "doc_writes_total",
            "doc_conflicts_total",
            "flushes_total",
            "orphans_removed_total",
        ] {
            assert!(text.contains(&format!("# TYPE {name} counter")));
        }
        assert!(metrics().flushes_total.load(Ordering::Relaxed) >= 1);
    }
}
