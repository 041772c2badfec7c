//! Observability for the ledger.
//!
//! Provides structured tracing spans, metrics collection, and telemetry integration.
//!
//! ## Features
//!
//! - **Built-in metrics**: Counter, Gauge, Histogram for local tracking
//! - **Structured spans**: one `ledger.try_consume` span per admission attempt
//! - **OpenTelemetry** (optional): Export to OTLP-compatible backends
//!
//! ## OpenTelemetry Integration
//!
//! ```rust,ignore
//! use credit_ledger::observability::{ObservabilityConfig, OtelConfig, OtelRuntime};
//!
//! let otel = OtelConfig::new("billing-worker").with_endpoint("http://collector:4318");
//! let runtime = OtelRuntime::init(&otel)?;
//! let metrics = ObservabilityConfig::new().otel(otel).build_registry();
//! // ... build the enforcer with `metrics` ...
//! runtime.shutdown();
//! ```

mod metrics;
#[cfg(feature = "otel")]
mod otel;
mod spans;

pub use metrics::{Counter, Gauge, Histogram, MetricsConfig, MetricsRegistry, MetricsSummary};
#[cfg(feature = "otel")]
pub use otel::{
    OtelConfig, OtelError, OtelRuntime, SERVICE_NAME_DEFAULT, init_tracing_subscriber, semantic,
};
pub use spans::{ConsumeSpan, tenant_span};

use std::sync::Arc;

/// Observability configuration: local metrics and optional OTLP export.
#[derive(Clone, Default)]
pub struct ObservabilityConfig {
    pub metrics: MetricsConfig,
    #[cfg(feature = "otel")]
    pub otel: Option<OtelConfig>,
}

impl ObservabilityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(mut self, config: MetricsConfig) -> Self {
        self.metrics = config;
        self
    }

    #[cfg(feature = "otel")]
    pub fn otel(mut self, config: OtelConfig) -> Self {
        self.otel = Some(config);
        self
    }

    pub fn build_registry(&self) -> Arc<MetricsRegistry> {
        #[cfg(feature = "otel")]
        if let Some(ref otel_config) = self.otel {
            return Arc::new(MetricsRegistry::otel(&self.metrics, otel_config));
        }

        Arc::new(MetricsRegistry::new(&self.metrics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observability_config() {
        let registry = ObservabilityConfig::new().build_registry();
        assert!(registry.is_enabled());
        registry.record_consume_start();
        assert_eq!(registry.consumes_total.get(), 1);

        let registry = ObservabilityConfig::new()
            .metrics(MetricsConfig::disabled())
            .build_registry();
        registry.record_consume_start();
        assert_eq!(registry.consumes_total.get(), 0);
    }

    #[cfg(feature = "otel")]
    #[test]
    fn test_observability_with_otel() {
        let config = ObservabilityConfig::new().otel(OtelConfig::new("billing-worker"));

        assert!(config.otel.is_some());
    }
}
