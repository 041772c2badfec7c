//! OpenTelemetry integration for tracing and metrics export.
//!
//! Feature `otel`. Ships spans and ledger metrics to an OTLP/HTTP collector.

use std::time::Duration;

use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::{MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::types::QuotaDecision;

/// Default service name for OpenTelemetry instrumentation.
pub const SERVICE_NAME_DEFAULT: &str = "credit-ledger";

/// OpenTelemetry configuration for the ledger.
#[derive(Debug, Clone)]
pub struct OtelConfig {
    pub service_name: String,
    pub service_version: Option<String>,
    pub otlp_endpoint: String,
    pub traces_enabled: bool,
    pub metrics_enabled: bool,
    pub metrics_export_interval: Duration,
    pub sample_ratio: f64,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME_DEFAULT.to_string(),
            service_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            otlp_endpoint: "http://localhost:4318".to_string(),
            traces_enabled: true,
            metrics_enabled: true,
            metrics_export_interval: Duration::from_secs(60),
            sample_ratio: 1.0,
        }
    }
}

impl OtelConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = endpoint.into();
        self
    }

    pub fn with_service_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    pub fn with_traces(mut self, enabled: bool) -> Self {
        self.traces_enabled = enabled;
        self
    }

    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_export_interval = interval;
        self
    }

    pub fn with_sample_ratio(mut self, ratio: f64) -> Self {
        self.sample_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.otlp_endpoint = endpoint;
        }

        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }

        if let Ok(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG")
            && let Ok(r) = ratio.parse::<f64>()
        {
            config.sample_ratio = r.clamp(0.0, 1.0);
        }

        config
    }

    fn build_resource(&self) -> Resource {
        let mut attributes = vec![KeyValue::new(SERVICE_NAME, self.service_name.clone())];

        if let Some(ref version) = self.service_version {
            attributes.push(KeyValue::new(SERVICE_VERSION, version.clone()));
        }

        Resource::builder().with_attributes(attributes).build()
    }
}

impl OtelConfig {
    fn sampler(&self) -> Sampler {
        if self.sample_ratio >= 1.0 {
            Sampler::AlwaysOn
        } else if self.sample_ratio <= 0.0 {
            Sampler::AlwaysOff
        } else {
            Sampler::TraceIdRatioBased(self.sample_ratio)
        }
    }

    fn tracer_provider(&self) -> Result<SdkTracerProvider, OtelError> {
        let exporter = SpanExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(format!("{}/v1/traces", self.otlp_endpoint))
            .build()
            .map_err(|e| OtelError::Init(format!("Failed to create span exporter: {}", e)))?;

        Ok(SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_sampler(self.sampler())
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(self.build_resource())
            .build())
    }

    fn meter_provider(&self) -> Result<SdkMeterProvider, OtelError> {
        let exporter = MetricExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(format!("{}/v1/metrics", self.otlp_endpoint))
            .build()
            .map_err(|e| OtelError::Init(format!("Failed to create metric exporter: {}", e)))?;

        let reader = PeriodicReader::builder(exporter)
            .with_interval(self.metrics_export_interval)
            .build();

        Ok(SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(self.build_resource())
            .build())
    }
}

/// OpenTelemetry runtime handle.
///
/// Call `shutdown()` before process exit to flush pending spans and metrics.
pub struct OtelRuntime {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl OtelRuntime {
    /// Install global tracer and meter providers.
    pub fn init(config: &OtelConfig) -> Result<Self, OtelError> {
        global::set_text_map_propagator(TraceContextPropagator::new());

        let tracer_provider = if config.traces_enabled {
            let provider = config.tracer_provider()?;
            global::set_tracer_provider(provider.clone());
            Some(provider)
        } else {
            None
        };

        let meter_provider = if config.metrics_enabled {
            let provider = config.meter_provider()?;
            global::set_meter_provider(provider.clone());
            Some(provider)
        } else {
            None
        };

        Ok(Self {
            tracer_provider,
            meter_provider,
        })
    }

    pub fn shutdown(self) {
        if let Some(provider) = self.tracer_provider
            && let Err(e) = provider.shutdown()
        {
            tracing::warn!("Failed to shutdown tracer provider: {:?}", e);
        }

        if let Some(provider) = self.meter_provider
            && let Err(e) = provider.shutdown()
        {
            tracing::warn!("Failed to shutdown meter provider: {:?}", e);
        }
    }
}

/// Install a global subscriber exporting spans over OTLP, optionally with
/// console output. Filtering follows `RUST_LOG`, defaulting to `info`.
pub fn init_tracing_subscriber(config: &OtelConfig, with_console: bool) -> Result<(), OtelError> {
    let provider = config.tracer_provider()?;
    global::set_tracer_provider(provider);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let otel_layer = OpenTelemetryLayer::new(global::tracer(SERVICE_NAME_DEFAULT));
    let fmt_layer = with_console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| OtelError::Init(format!("Failed to init subscriber: {}", e)))
}

/// Errors that can occur during OpenTelemetry initialization.
#[derive(Debug, thiserror::Error)]
pub enum OtelError {
    #[error("OpenTelemetry initialization failed: {0}")]
    Init(String),

    #[error("OpenTelemetry export failed: {0}")]
    Export(String),
}

/// Attribute keys used on ledger spans and metrics.
pub mod semantic {
    pub const LEDGER_TENANT_ID: &str = "ledger.tenant.id";
    pub const LEDGER_USAGE_TYPE: &str = "ledger.usage.type";
    pub const LEDGER_AMOUNT: &str = "ledger.amount";
    pub const LEDGER_DECISION: &str = "ledger.decision";
    pub const LEDGER_DENY_REASON: &str = "ledger.deny_reason";
    pub const LEDGER_CACHE_OUTCOME: &str = "ledger.cache.outcome";
}

/// OpenTelemetry metrics bridge for the built-in MetricsRegistry.
pub struct OtelMetricsBridge {
    consumes_total: opentelemetry::metrics::Counter<u64>,
    decisions: opentelemetry::metrics::Counter<u64>,
    consume_errors: opentelemetry::metrics::Counter<u64>,
    consistency_violations: opentelemetry::metrics::Counter<u64>,
    units_debited: opentelemetry::metrics::Counter<u64>,
    cache_lookups: opentelemetry::metrics::Counter<u64>,
    in_flight: opentelemetry::metrics::UpDownCounter<i64>,
    decision_latency: opentelemetry::metrics::Histogram<f64>,
}

impl OtelMetricsBridge {
    pub fn new(meter: opentelemetry::metrics::Meter) -> Self {
        Self {
            consumes_total: meter
                .u64_counter("ledger.consumes.total")
                .with_description("Total number of consume attempts")
                .build(),
            decisions: meter
                .u64_counter("ledger.decisions")
                .with_description("Quota decisions by outcome")
                .build(),
            consume_errors: meter
                .u64_counter("ledger.consumes.error")
                .with_description("Consume attempts that failed with an error")
                .build(),
            consistency_violations: meter
                .u64_counter("ledger.consistency_violations")
                .with_description("Debits that found less credit than the admission check")
                .build(),
            units_debited: meter
                .u64_counter("ledger.units.debited")
                .with_description("Credit units debited by admitted consumes")
                .build(),
            cache_lookups: meter
                .u64_counter("ledger.cache.lookups")
                .with_description("Usage summary cache lookups by outcome")
                .build(),
            in_flight: meter
                .i64_up_down_counter("ledger.consumes.in_flight")
                .with_description("Consume calls currently holding or awaiting a tenant lock")
                .build(),
            decision_latency: meter
                .f64_histogram("ledger.decision.latency")
                .with_description("Consume latency in milliseconds")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn record_consume_start(&self) {
        self.consumes_total.add(1, &[]);
        self.in_flight.add(1, &[]);
    }

    pub fn record_decision(&self, decision: &QuotaDecision, amount: u64, latency_ms: f64) {
        self.in_flight.add(-1, &[]);
        self.decision_latency.record(latency_ms, &[]);
        let outcome = match decision.reason {
            None => {
                self.units_debited.add(amount, &[]);
                "admitted"
            }
            Some(reason) => reason.as_str(),
        };
        self.decisions
            .add(1, &[KeyValue::new(semantic::LEDGER_DECISION, outcome)]);
    }

    pub fn record_consume_error(&self, latency_ms: f64) {
        self.in_flight.add(-1, &[]);
        self.decision_latency.record(latency_ms, &[]);
        self.consume_errors.add(1, &[]);
    }

    pub fn record_consistency_violation(&self) {
        self.consistency_violations.add(1, &[]);
    }

    pub fn record_cache(&self, outcome: &'static str) {
        self.cache_lookups
            .add(1, &[KeyValue::new(semantic::LEDGER_CACHE_OUTCOME, outcome)]);
    }
}
