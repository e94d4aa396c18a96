use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    request_counter: Counter<u64>,
    round_counter: Counter<u64>,
    round_duration: Histogram<u64>,
    detected_objects: Gauge<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("object_detection");
        global::set_meter_provider(provider);

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let round_counter = meter
            .u64_counter("rounds_total")
            .with_description("Inference rounds by phase and outcome")
            .build();

        // Round latency is bounded by the response timeout, 10s by default.
        let boundaries = generate_boundaries((100, 500, 2000, 10000, 15000));

        let round_duration = meter
            .u64_histogram("round_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of inference rounds in milliseconds")
            .build();

        let detected_objects = meter
            .u64_gauge("detected_objects")
            .with_description("Distinct objects in the last detection result")
            .build();

        Ok(Metrics {
            request_counter,
            round_counter,
            round_duration,
            detected_objects,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = [KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_round(&self, phase: &'static str, outcome: &'static str, duration_ms: u64) {
        let attributes = [KeyValue::new("phase", phase), KeyValue::new("outcome", outcome)];
        self.round_counter.add(1, &attributes);
        self.round_duration
            .record(duration_ms, &[KeyValue::new("phase", phase)]);
    }

    pub fn record_detected_objects(&self, count: u64) {
        self.detected_objects.record(count, &[]);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 100;
    let middle_step: usize = 250;
    let end_step: usize = 1000;
    let tail_step: usize = 5000;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
