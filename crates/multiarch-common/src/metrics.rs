//! Metrics registry for placement observability
//!
//! Provides OpenTelemetry metrics for:
//! - Admission decisions (pods seen, pods gated)
//! - Image inspection (failures, resolution latency)
//! - Time pods spend behind the scheduling gate

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for placement metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("multiarch"));

// ============================================================================
// Admission Metrics
// ============================================================================

/// Counter of pods seen by the admission webhook
///
/// Labels:
/// - `decision`: gated, ignored
pub static PODS_ADMITTED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("multiarch_pods_admitted_total")
        .with_description("Total number of pods processed by the admission webhook")
        .with_unit("{pods}")
        .build()
});

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Counter of pods ungated by the controller
///
/// Labels:
/// - `outcome`: resolved, ignored, exhausted
pub static PODS_UNGATED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("multiarch_pods_ungated_total")
        .with_description("Total number of pods whose scheduling gate was removed")
        .with_unit("{pods}")
        .build()
});

/// Counter of failed image inspections
pub static IMAGE_INSPECTION_FAILURES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("multiarch_image_inspection_failures_total")
        .with_description("Total number of failed image architecture inspections")
        .with_unit("{failures}")
        .build()
});

/// Histogram of architecture resolution duration
///
/// Labels:
/// - `result`: success, error
pub static RESOLVE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("multiarch_resolve_duration_seconds")
        .with_description("Duration of image architecture resolution for a pod in seconds")
        .with_unit("s")
        .build()
});

/// Histogram of time between pod creation and gate removal
pub static GATED_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("multiarch_gated_duration_seconds")
        .with_description("Time pods spent behind the scheduling gate in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// Admission outcome label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Gate added
    Gated,
    /// Pod left untouched
    Ignored,
}

impl AdmissionDecision {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gated => "gated",
            Self::Ignored => "ignored",
        }
    }
}

/// Why a pod was ungated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UngateOutcome {
    /// Architectures resolved and affinity applied
    Resolved,
    /// Pod no longer needs placement (edited while gated)
    Ignored,
    /// Inspection retries exhausted
    Exhausted,
}

impl UngateOutcome {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Ignored => "ignored",
            Self::Exhausted => "exhausted",
        }
    }
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Times one architecture resolution
pub struct ResolveTimer {
    start: std::time::Instant,
}

impl ResolveTimer {
    /// Start timing
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Record a successful resolution
    pub fn success(self) {
        RESOLVE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", "success")],
        );
    }

    /// Record a failed resolution
    pub fn error(self) {
        RESOLVE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", "error")],
        );
        IMAGE_INSPECTION_FAILURES.add(1, &[]);
    }
}

/// Record an admission decision
pub fn record_admission(decision: AdmissionDecision) {
    PODS_ADMITTED.add(1, &[KeyValue::new("decision", decision.as_str())]);
}

/// Record a gate removal and how long the pod waited
pub fn record_ungated(outcome: UngateOutcome, gated_secs: Option<f64>) {
    PODS_UNGATED.add(1, &[KeyValue::new("outcome", outcome.as_str())]);
    if let Some(secs) = gated_secs {
        GATED_DURATION.record(secs, &[KeyValue::new("outcome", outcome.as_str())]);
    }
}
