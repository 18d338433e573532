use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub assignments_total: IntCounterVec,
    pub offers_total: IntCounterVec,
    pub active_assignments: IntGauge,
    pub exceptions_total: IntCounterVec,
    pub assignment_latency_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let assignments_total = IntCounterVec::new(
            Opts::new("assignments_total", "Assignments by terminal outcome"),
            &["outcome"],
        )
        .expect("valid assignments_total metric");

        let offers_total = IntCounterVec::new(
            Opts::new("offers_total", "Driver offers by outcome"),
            &["outcome"],
        )
        .expect("valid offers_total metric");

        let active_assignments = IntGauge::new(
            "active_assignments",
            "Assignments currently in a non-terminal state",
        )
        .expect("valid active_assignments metric");

        let exceptions_total = IntCounterVec::new(
            Opts::new("delivery_exceptions_total", "Delivery exceptions by kind"),
            &["kind"],
        )
        .expect("valid delivery_exceptions_total metric");

        let assignment_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "assignment_latency_seconds",
                "Latency of assign-order processing in seconds",
            ),
            &["outcome"],
        )
        .expect("valid assignment_latency_seconds metric");

        registry
            .register(Box::new(assignments_total.clone()))
            .expect("register assignments_total");
        registry
            .register(Box::new(offers_total.clone()))
            .expect("register offers_total");
        registry
            .register(Box::new(active_assignments.clone()))
            .expect("register active_assignments");
        registry
            .register(Box::new(exceptions_total.clone()))
            .expect("register delivery_exceptions_total");
        registry
            .register(Box::new(assignment_latency_seconds.clone()))
            .expect("register assignment_latency_seconds");

        Self {
            registry,
            assignments_total,
            offers_total,
            active_assignments,
            exceptions_total,
            assignment_latency_seconds,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
