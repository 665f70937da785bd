use opentelemetry::{
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::collections::BTreeSet;

pub struct Metrics {
    request_counter: Counter<u64>,
    inference_duration: Histogram<u64>,
    inference_failures: Counter<u64>,
    uploaded_bytes: Counter<u64>,
    pub registry: Registry,
    _provider: SdkMeterProvider,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("caption_qa");

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let boundaries = generate_boundaries(&[(50, 500, 50), (500, 2000, 250), (2000, 10000, 1000)]);

        let inference_duration = meter
            .u64_histogram("inference_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of model inference in milliseconds")
            .build();

        let inference_failures = meter
            .u64_counter("inference_failures_total")
            .with_description("Inference requests that ended with an error")
            .build();

        let uploaded_bytes = meter
            .u64_counter("uploaded_bytes_total")
            .with_description("Bytes of image data accepted by the upload route")
            .build();

        Ok(Metrics {
            request_counter,
            inference_duration,
            inference_failures,
            uploaded_bytes,
            registry,
            _provider: provider,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_inference_duration(&self, duration_ms: u64, model: &str) {
        let attributes = vec![KeyValue::new("model", model.to_string())];
        self.inference_duration.record(duration_ms, &attributes);
    }

    pub fn record_inference_failure(&self, model: &str, kind: &str) {
        let attributes = vec![
            KeyValue::new("model", model.to_string()),
            KeyValue::new("kind", kind.to_string()),
        ];
        self.inference_failures.add(1, &attributes);
    }

    pub fn record_upload(&self, bytes: u64) {
        self.uploaded_bytes.add(bytes, &[]);
    }
}

/// Histogram buckets from `(start, end, step)` segments, deduplicated and sorted.
fn generate_boundaries(segments: &[(u64, u64, usize)]) -> Vec<f64> {
    segments
        .iter()
        .flat_map(|&(start, end, step)| (start..=end).step_by(step))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|x| x as f64)
        .collect()
}
