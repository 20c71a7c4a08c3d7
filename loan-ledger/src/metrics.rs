//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `loan_requests_total` - Committed loan requests
//! - `loans_funded_total` - Committed fundings
//! - `loans_repaid_total` - Committed repayments
//! - `collateral_claims_total` - Committed collateral claims
//! - `loan_operations_rejected_total{kind}` - Rejected calls by error kind
//! - `loan_operation_duration_seconds` - Histogram of operation latencies
//! - `loan_escrow_balance` - Value currently held in escrow

use crate::types::{Amount, Operation};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Committed requests
    pub requests_total: IntCounter,

    /// Committed fundings
    pub funded_total: IntCounter,

    /// Committed repayments
    pub repaid_total: IntCounter,

    /// Committed claims
    pub claims_total: IntCounter,

    /// Rejections by error kind
    pub rejected_total: IntCounterVec,

    /// Operation duration histogram
    pub operation_duration: Histogram,

    /// Escrow balance (saturates at i64::MAX)
    pub escrow_balance: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("requests_total", &self.requests_total.get())
            .field("escrow_balance", &self.escrow_balance.get())
            .finish()
    }
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let requests_total = IntCounter::new("loan_requests_total", "Committed loan requests")?;
        registry.register(Box::new(requests_total.clone()))?;

        let funded_total = IntCounter::new("loans_funded_total", "Committed loan fundings")?;
        registry.register(Box::new(funded_total.clone()))?;

        let repaid_total = IntCounter::new("loans_repaid_total", "Committed loan repayments")?;
        registry.register(Box::new(repaid_total.clone()))?;

        let claims_total =
            IntCounter::new("collateral_claims_total", "Committed collateral claims")?;
        registry.register(Box::new(claims_total.clone()))?;

        let rejected_total = IntCounterVec::new(
            Opts::new(
                "loan_operations_rejected_total",
                "Rejected loan operations by error kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(rejected_total.clone()))?;

        let operation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "loan_operation_duration_seconds",
                "Histogram of loan operation latencies",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.500]),
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        let escrow_balance = IntGauge::new("loan_escrow_balance", "Value held in escrow")?;
        registry.register(Box::new(escrow_balance.clone()))?;

        Ok(Self {
            requests_total,
            funded_total,
            repaid_total,
            claims_total,
            rejected_total,
            operation_duration,
            escrow_balance,
            registry,
        })
    }

    /// Record a committed operation
    pub fn record_committed(&self, operation: Operation) {
        match operation {
            Operation::Request => self.requests_total.inc(),
            Operation::Fund => self.funded_total.inc(),
            Operation::Repay => self.repaid_total.inc(),
            Operation::Claim => self.claims_total.inc(),
        }
    }

    /// Record a rejected operation
    pub fn record_rejected(&self, kind: &str) {
        self.rejected_total.with_label_values(&[kind]).inc();
    }

    /// Record operation duration
    pub fn record_duration(&self, duration_seconds: f64) {
        self.operation_duration.observe(duration_seconds);
    }

    /// Update escrow gauge
    pub fn set_escrow(&self, escrow: Amount) {
        self.escrow_balance
            .set(i64::try_from(escrow).unwrap_or(i64::MAX));
    }

    /// Render in Prometheus text exposition format
    pub fn encode_text(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.requests_total.get(), 0);
        assert_eq!(metrics.claims_total.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.record_committed(Operation::Request);
        assert_eq!(first.requests_total.get(), 1);
        assert_eq!(second.requests_total.get(), 0);
    }

    #[test]
    fn test_record_committed() {
        let metrics = Metrics::new().unwrap();
        metrics.record_committed(Operation::Fund);
        metrics.record_committed(Operation::Fund);
        metrics.record_committed(Operation::Repay);

        assert_eq!(metrics.funded_total.get(), 2);
        assert_eq!(metrics.repaid_total.get(), 1);
    }

    #[test]
    fn test_record_rejected() {
        let metrics = Metrics::new().unwrap();
        metrics.record_rejected("wrong_amount");
        metrics.record_rejected("wrong_amount");
        metrics.record_rejected("expired");

        assert_eq!(
            metrics.rejected_total.with_label_values(&["wrong_amount"]).get(),
            2
        );
        assert_eq!(metrics.rejected_total.with_label_values(&["expired"]).get(), 1);
    }

    #[test]
    fn test_escrow_gauge_saturates() {
        let metrics = Metrics::new().unwrap();
        metrics.set_escrow(42);
        assert_eq!(metrics.escrow_balance.get(), 42);

        metrics.set_escrow(Amount::MAX);
        assert_eq!(metrics.escrow_balance.get(), i64::MAX);
    }

    #[test]
    fn test_encode_text() {
        let metrics = Metrics::new().unwrap();
        metrics.record_committed(Operation::Claim);
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("collateral_claims_total 1"));
    }
}
