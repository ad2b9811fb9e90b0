//! Metrics collection for observability
//!
//! `TurnMetrics` owns its registry; hosts inject it into the turn manager and
//! export it however they like. Nothing here gates turn behavior.

use prometheus::{
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_vec_with_registry, register_histogram_with_registry, Counter, CounterVec,
    Encoder, Histogram, HistogramOpts, HistogramTimer, HistogramVec, Opts, Registry, TextEncoder,
};

/// Turn cycle metrics
pub struct TurnMetrics {
    registry: Registry,

    pub turns_total: CounterVec,
    pub phase_duration: HistogramVec,

    // Pass 2
    pub divergence_detected: Counter,
    pub incremental_tokens: Histogram,

    // Pass 1
    pub degraded_queries: CounterVec,
    pub budget_utilization: Histogram,
    pub trimmed_records: Counter,
}

impl TurnMetrics {
    /// Create a metrics collector with a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Register into a host-provided registry
    pub fn with_registry(registry: Registry) -> prometheus::Result<Self> {
        let turns_total = register_counter_vec_with_registry!(
            Opts::new("turns_total", "Completed turn cycles by outcome"),
            &["outcome"],
            registry
        )?;

        let phase_duration = register_histogram_vec_with_registry!(
            "turn_phase_duration_seconds",
            "Turn phase duration in seconds",
            &["phase"],
            registry
        )?;

        let divergence_detected = register_counter_with_registry!(
            Opts::new("divergence_detected_total", "Pass-2 inputs that diverged from the baseline"),
            registry
        )?;

        let incremental_tokens = register_histogram_with_registry!(
            HistogramOpts::new("incremental_tokens", "Tokens consumed by pass-2 retrieval")
                .buckets(vec![0.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0]),
            registry
        )?;

        let degraded_queries = register_counter_vec_with_registry!(
            Opts::new("degraded_queries_total", "Structured lookups that degraded to empty"),
            &["entity_type"],
            registry
        )?;

        let budget_utilization = register_histogram_with_registry!(
            HistogramOpts::new("budget_utilization", "Share of the available budget allocated")
                .buckets(vec![0.1, 0.25, 0.5, 0.6, 0.7, 0.8, 0.9, 0.95, 1.0]),
            registry
        )?;

        let trimmed_records = register_counter_with_registry!(
            Opts::new("trimmed_records_total", "Structured records dropped to fit the budget"),
            registry
        )?;

        Ok(Self {
            registry,
            turns_total,
            phase_duration,
            divergence_detected,
            incremental_tokens,
            degraded_queries,
            budget_utilization,
            trimmed_records,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a finished turn
    pub fn record_turn(&self, outcome: &str) {
        self.turns_total.with_label_values(&[outcome]).inc();
    }

    /// Timer observing into the phase histogram when dropped or stopped
    pub fn phase_timer(&self, phase: &str) -> HistogramTimer {
        self.phase_duration.with_label_values(&[phase]).start_timer()
    }

    /// Record a pass-2 cycle
    pub fn record_pass2(&self, detected: bool, tokens: usize) {
        if detected {
            self.divergence_detected.inc();
        }
        self.incremental_tokens.observe(tokens as f64);
    }

    pub fn record_degraded_query(&self, entity_type: &str) {
        self.degraded_queries.with_label_values(&[entity_type]).inc();
    }

    pub fn record_utilization(&self, utilization: f64) {
        self.budget_utilization.observe(utilization);
    }

    pub fn record_trimmed(&self, records: usize) {
        if records > 0 {
            self.trimmed_records.inc_by(records as f64);
        }
    }

    /// Export metrics in Prometheus text format
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
