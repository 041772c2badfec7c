//! Structured span definitions for tracing.

use std::time::Instant;

use tracing::{Level, Span, field, span};

use crate::types::{QuotaDecision, TenantId, UsageType};

/// Span around one `try_consume` call, with its outcome recorded on close.
pub struct ConsumeSpan {
    span: Span,
    start: Instant,
}

impl ConsumeSpan {
    pub fn new(tenant_id: &TenantId, usage_type: UsageType, amount: u64) -> Self {
        let span = span!(
            Level::INFO,
            "ledger.try_consume",
            otel.name = "ledger.try_consume",
            tenant_id = %tenant_id,
            usage_type = %usage_type,
            amount = amount,
            decision = field::Empty,
            event_id = field::Empty,
            is_error = field::Empty,
            latency_ms = field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
        }
    }

    pub fn record_decision(&self, decision: &QuotaDecision) {
        match (decision.reason, decision.event_id) {
            (Some(reason), _) => {
                self.span.record("decision", reason.as_str());
            }
            (None, Some(event_id)) => {
                self.span.record("decision", "ADMITTED");
                self.span.record("event_id", field::display(event_id));
            }
            (None, None) => {
                self.span.record("decision", "ADMITTED");
            }
        }
    }

    pub fn record_error(&self) {
        self.span.record("is_error", true);
    }

    /// Close the span and return elapsed milliseconds.
    pub fn finish(self) -> f64 {
        let latency_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.span.record("latency_ms", latency_ms);
        latency_ms
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

/// Span for provisioning and maintenance operations on one tenant.
pub fn tenant_span(operation: &'static str, tenant_id: &TenantId) -> Span {
    span!(
        Level::INFO,
        "ledger.tenant",
        otel.name = operation,
        operation = operation,
        tenant_id = %tenant_id,
    )
}
