use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        Opts::new("cache_lookup_total", "Cache lookups by result"),
        &["result"],
    )
    .expect("create cache_lookup_total");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static CACHE_STORE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_total", "Entries written to the cache")
        .expect("create cache_store_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_total");
    counter
});

static CACHE_STORE_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_errors_total", "Failed cache inserts")
        .expect("create cache_store_errors_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_errors_total");
    counter
});

static CACHE_REJECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        Opts::new("cache_rejections_total", "Entries refused at prepare by reason"),
        &["reason"],
    )
    .expect("create cache_rejections_total");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_rejections_total");
    vec
});

static CACHE_EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_evictions_total", "Entries evicted to meet the size goal")
        .expect("create cache_evictions_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_evictions_total");
    counter
});

static CACHE_EVICTED_BYTES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_evicted_bytes_total", "Bytes reclaimed by eviction")
        .expect("create cache_evicted_bytes_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_evicted_bytes_total");
    counter
});

static CACHE_CORRUPT_REMOVED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_corrupt_removed_total",
        "Stale or corrupt entry files deleted on read",
    )
    .expect("create cache_corrupt_removed_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_corrupt_removed_total");
    counter
});

pub fn record_cache_lookup(hit: bool) {
    let label = if hit { "hit" } else { "miss" };
    CACHE_LOOKUP_TOTAL.with_label_values(&[label]).inc();
}

pub fn record_cache_store() {
    CACHE_STORE_TOTAL.inc();
}

pub fn record_cache_store_error() {
    CACHE_STORE_ERRORS_TOTAL.inc();
}

pub fn record_cache_rejection(reason: &str) {
    CACHE_REJECTIONS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_cache_evictions(entries: u64, bytes: u64) {
    if entries > 0 {
        CACHE_EVICTIONS_TOTAL.inc_by(entries);
    }
    if bytes > 0 {
        CACHE_EVICTED_BYTES_TOTAL.inc_by(bytes);
    }
}

pub fn record_cache_corrupt_removed() {
    CACHE_CORRUPT_REMOVED_TOTAL.inc();
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("encode metrics");
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_cache_metrics() {
        record_cache_lookup(true);
        record_cache_lookup(false);
        record_cache_rejection("too_large");
        record_cache_evictions(2, 512);
        let text = String::from_utf8(gather()).expect("utf8");
        assert!(
            text.contains("cache_lookup_total"),
            "expected cache_lookup_total in metrics output"
        );
        assert!(
            text.contains("cache_rejections_total{reason=\"too_large\"}"),
            "expected labelled rejection in metrics output"
        );
        assert!(
            text.contains("cache_evicted_bytes_total"),
            "expected cache_evicted_bytes_total in metrics output"
        );
    }
}
