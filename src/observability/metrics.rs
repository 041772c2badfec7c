//! Metrics collection and export.
//!
//! Provides built-in atomic metrics for local tracking, with optional
//! OpenTelemetry export when the `otel` feature is enabled.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::types::{DenyReason, QuotaDecision};

#[cfg(feature = "otel")]
use super::otel::{OtelConfig, OtelMetricsBridge};
#[cfg(feature = "otel")]
use opentelemetry::global;

/// Metrics configuration.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// When off, the registry ignores every `record_*` call.
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl MetricsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }
}

/// Thread-safe atomic counter.
#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Simple histogram using fixed buckets.
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            bucket_bounds,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Buckets sized for a single-row-lock transaction, in milliseconds.
    pub fn default_latency() -> Self {
        Self::new(vec![
            1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0,
        ])
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .bucket_bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bucket_bounds.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Observations that fell into bucket `idx`; the last bucket is overflow.
    pub fn bucket_count(&self, idx: usize) -> u64 {
        self.buckets
            .get(idx)
            .map(|b| b.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Returns the sum as a floating-point value in the original unit (ms).
    ///
    /// The internal sum is stored scaled by 1000x to preserve sub-integer
    /// precision.
    pub fn sum_ms(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

/// Ledger metrics registry.
///
/// Tracks metrics locally with atomic counters, and optionally exports
/// to OpenTelemetry when the `otel` feature is enabled.
pub struct MetricsRegistry {
    pub consumes_total: Counter,
    pub consumes_admitted: Counter,
    pub denied_over_limit: Counter,
    pub denied_insufficient_credit: Counter,
    pub consume_errors: Counter,
    pub consistency_violations: Counter,
    pub units_debited: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_errors: Counter,
    pub in_flight: Gauge,
    pub decision_latency_ms: Histogram,
    enabled: bool,
    #[cfg(feature = "otel")]
    otel_bridge: Option<OtelMetricsBridge>,
}

impl MetricsRegistry {
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            consumes_total: Counter::new(),
            consumes_admitted: Counter::new(),
            denied_over_limit: Counter::new(),
            denied_insufficient_credit: Counter::new(),
            consume_errors: Counter::new(),
            consistency_violations: Counter::new(),
            units_debited: Counter::new(),
            cache_hits: Counter::new(),
            cache_misses: Counter::new(),
            cache_errors: Counter::new(),
            in_flight: Gauge::new(),
            decision_latency_ms: Histogram::default_latency(),
            enabled: config.enabled,
            #[cfg(feature = "otel")]
            otel_bridge: None,
        }
    }

    #[cfg(feature = "otel")]
    pub fn otel(config: &MetricsConfig, otel_config: &OtelConfig) -> Self {
        let meter = global::meter_with_scope(
            opentelemetry::InstrumentationScope::builder(otel_config.service_name.clone())
                .build(),
        );
        Self {
            otel_bridge: Some(OtelMetricsBridge::new(meter)),
            ..Self::new(config)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_consume_start(&self) {
        if !self.enabled {
            return;
        }
        self.consumes_total.inc();
        self.in_flight.inc();

        #[cfg(feature = "otel")]
        if let Some(ref bridge) = self.otel_bridge {
            bridge.record_consume_start();
        }
    }

    pub fn record_decision(&self, decision: &QuotaDecision, amount: u64, latency_ms: f64) {
        if !self.enabled {
            return;
        }
        self.in_flight.dec();
        self.decision_latency_ms.observe(latency_ms);
        match decision.reason {
            None => {
                self.consumes_admitted.inc();
                self.units_debited.add(amount);
            }
            Some(DenyReason::OverPeriodLimit) => self.denied_over_limit.inc(),
            Some(DenyReason::InsufficientCredit) => self.denied_insufficient_credit.inc(),
        }

        #[cfg(feature = "otel")]
        if let Some(ref bridge) = self.otel_bridge {
            bridge.record_decision(decision, amount, latency_ms);
        }
    }

    pub fn record_consume_error(&self, latency_ms: f64) {
        if !self.enabled {
            return;
        }
        self.in_flight.dec();
        self.decision_latency_ms.observe(latency_ms);
        self.consume_errors.inc();

        #[cfg(feature = "otel")]
        if let Some(ref bridge) = self.otel_bridge {
            bridge.record_consume_error(latency_ms);
        }
    }

    pub fn record_consistency_violation(&self) {
        if !self.enabled {
            return;
        }
        self.consistency_violations.inc();

        #[cfg(feature = "otel")]
        if let Some(ref bridge) = self.otel_bridge {
            bridge.record_consistency_violation();
        }
    }

    pub fn record_cache_hit(&self) {
        if !self.enabled {
            return;
        }
        self.cache_hits.inc();

        #[cfg(feature = "otel")]
        if let Some(ref bridge) = self.otel_bridge {
            bridge.record_cache("hit");
        }
    }

    pub fn record_cache_miss(&self) {
        if !self.enabled {
            return;
        }
        self.cache_misses.inc();

        #[cfg(feature = "otel")]
        if let Some(ref bridge) = self.otel_bridge {
            bridge.record_cache("miss");
        }
    }

    pub fn record_cache_error(&self) {
        if !self.enabled {
            return;
        }
        self.cache_errors.inc();

        #[cfg(feature = "otel")]
        if let Some(ref bridge) = self.otel_bridge {
            bridge.record_cache("error");
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(&MetricsConfig::default())
    }
}

/// Point-in-time snapshot of a [`MetricsRegistry`].
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub total_consumes: u64,
    pub admitted: u64,
    pub denied_over_limit: u64,
    pub denied_insufficient_credit: u64,
    pub errors: u64,
    pub consistency_violations: u64,
    pub units_debited: u64,
    pub cache_hit_ratio: f64,
    pub avg_latency_ms: f64,
}

impl MetricsSummary {
    pub fn from_registry(registry: &MetricsRegistry) -> Self {
        let count = registry.decision_latency_ms.count();
        let avg_latency = if count > 0 {
            registry.decision_latency_ms.sum_ms() / count as f64
        } else {
            0.0
        };

        let hits = registry.cache_hits.get();
        let lookups = hits + registry.cache_misses.get();
        let cache_hit_ratio = if lookups > 0 {
            hits as f64 / lookups as f64
        } else {
            0.0
        };

        Self {
            total_consumes: registry.consumes_total.get(),
            admitted: registry.consumes_admitted.get(),
            denied_over_limit: registry.denied_over_limit.get(),
            denied_insufficient_credit: registry.denied_insufficient_credit.get(),
            errors: registry.consume_errors.get(),
            consistency_violations: registry.consistency_violations.get(),
            units_debited: registry.units_debited.get(),
            cache_hit_ratio,
            avg_latency_ms: avg_latency,
        }
    }
}
