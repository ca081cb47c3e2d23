use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct Metrics {
    // Documents
    pub doc_reads_total: AtomicU64,
    pub doc_writes_total: AtomicU64,
    pub doc_conflicts_total: AtomicU64,

    // Queries
    pub query_pages_total: AtomicU64,
    pub query_items_total: AtomicU64,
    pub query_page_millis_total: AtomicU64,

    // Lookups
    pub lookup_fallbacks_total: AtomicU64,

    // Connections
    pub connections_created_total: AtomicU64,
    pub session_pins_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            doc_reads_total: AtomicU64::new(0),
            doc_writes_total: AtomicU64::new(0),
            doc_conflicts_total: AtomicU64::new(0),
            query_pages_total: AtomicU64::new(0),
            query_items_total: AtomicU64::new(0),
            query_page_millis_total: AtomicU64::new(0),
            lookup_fallbacks_total: AtomicU64::new(0),
            connections_created_total: AtomicU64::new(0),
            session_pins_total: AtomicU64::new(0),
        }
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

pub(crate) fn record_doc_read() {
    metrics().doc_reads_total.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_doc_write(count: u64) {
    metrics()
        .doc_writes_total
        .fetch_add(count, Ordering::Relaxed);
}

pub(crate) fn record_doc_conflict() {
    metrics().doc_conflicts_total.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_query_page(items: u64, elapsed: Duration) {
    let m = metrics();
    m.query_pages_total.fetch_add(1, Ordering::Relaxed);
    m.query_items_total.fetch_add(items, Ordering::Relaxed);
    m.query_page_millis_total
        .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
}

pub(crate) fn record_lookup_fallback() {
    metrics()
        .lookup_fallbacks_total
        .fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_connection_created() {
    metrics()
        .connections_created_total
        .fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_session_pin() {
    metrics().session_pins_total.fetch_add(1, Ordering::Relaxed);
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
    // queries
    let _ = writeln!(
        s,
        "# TYPE query_pages_total counter\nquery_pages_total {}",
        m.query_pages_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE query_items_total counter\nquery_items_total {}",
        m.query_items_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE query_page_millis_total counter\nquery_page_millis_total {}",
        m.query_page_millis_total.load(Ordering::Relaxed)
    );
    // lookups
    let _ = writeln!(
        s,
        "# TYPE lookup_fallbacks_total counter\nlookup_fallbacks_total {}",
        m.lookup_fallbacks_total.load(Ordering::Relaxed)
    );
    // connections
    let _ = writeln!(
        s,
        "# TYPE connections_created_total counter\nconnections_created_total {}",
        m.connections_created_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE session_pins_total counter\nsession_pins_total {}",
        m.session_pins_total.load(Ordering::Relaxed)
    );
    s
}
