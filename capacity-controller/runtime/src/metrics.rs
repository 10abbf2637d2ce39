use crate::decision::Decision;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        histogram::{exponential_buckets, Histogram},
    },
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct AdmissionMetrics {
    decisions: Family<DecisionLabels, Counter>,
    failures: Family<FailureLabels, Counter>,
    latency: Histogram,
}

/// Why an admission request was not answered with a decision.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    /// The request could not be read or was not an admission review.
    Invalid,
    /// The pod could not be decoded.
    Decode,
    /// The response could not be encoded.
    Encode,
    /// The caches had not synced before the deadline.
    NotReady,
    /// No decision was reached before the deadline.
    Deadline,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct DecisionLabels {
    decision: &'static str,
    pool: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct FailureLabels {
    reason: &'static str,
}

// === impl AdmissionMetrics ===

impl AdmissionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let decisions = Family::<DecisionLabels, Counter>::default();
        reg.register(
            "decisions",
            "Total number of pod admission decisions",
            decisions.clone(),
        );

        let failures = Family::<FailureLabels, Counter>::default();
        reg.register(
            "failures",
            "Total number of admission requests that failed without a decision",
            failures.clone(),
        );

        // 1ms to ~4s.
        let latency = Histogram::new(exponential_buckets(0.001, 2.0, 13));
        reg.register_with_unit(
            "latency",
            "Histogram of admission request latency (seconds)",
            Unit::Seconds,
            latency.clone(),
        );

        Self {
            decisions,
            failures,
            latency,
        }
    }

    pub(crate) fn decision(&self, decision: &Decision, start: time::Instant) {
        let labels = DecisionLabels {
            decision: decision.as_str(),
            pool: decision.pool().map_or("", |p| p.as_str()),
        };
        self.decisions.get_or_create(&labels).inc();
        self.observe(start);
    }

    pub(crate) fn failure(&self, failure: Failure, start: time::Instant) {
        let labels = FailureLabels {
            reason: failure.as_str(),
        };
        self.failures.get_or_create(&labels).inc();
        self.observe(start);
    }

    fn observe(&self, start: time::Instant) {
        self.latency
            .observe(time::Instant::now().saturating_duration_since(start).as_secs_f64());
    }
}

impl Default for AdmissionMetrics {
    /// Metrics that are not exported.
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

// === impl Failure ===

impl Failure {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Decode => "decode",
            Self::Encode => "encode",
            Self::NotReady => "not_ready",
            Self::Deadline => "deadline",
        }
    }
}
