//! Serving metrics, grouped per concern and rendered in Prometheus text format.

use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};

pub struct RequestMetrics {
    /// outcome = ok | validation | inference | not_ready
    pub requests_total: IntCounterVec,
    pub inference_latency_seconds: Histogram,
}

pub struct ArtifactMetrics {
    /// outcome = ok | transient | timeout | not_found | access_denied | integrity | io
    pub fetch_attempts_total: IntCounterVec,
    /// result = hit | miss
    pub cache_lookups_total: IntCounterVec,
    /// outcome = ok | failed
    pub model_loads_total: IntCounterVec,
}

pub struct ServingMetrics {
    registry: Registry,
    pub requests: RequestMetrics,
    pub artifacts: ArtifactMetrics,
}

pub static SERVING_METRICS: Lazy<ServingMetrics> = Lazy::new(|| {
    ServingMetrics::new().expect("static metric definitions are valid and unique")
});

impl ServingMetrics {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("serving".into()), None)?;
        let requests = RequestMetrics {
            requests_total: IntCounterVec::new(Opts::new("predict_requests_total", "Prediction requests by outcome"), &["outcome"])?,
            inference_latency_seconds: Histogram::with_opts(
                HistogramOpts::new("inference_latency_seconds", "Predictor invocation latency")
                    .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0]),
            )?,
        };
        let artifacts = ArtifactMetrics {
            fetch_attempts_total: IntCounterVec::new(Opts::new("artifact_fetch_attempts_total", "Remote artifact fetch attempts by outcome"), &["outcome"])?,
            cache_lookups_total: IntCounterVec::new(Opts::new("artifact_cache_lookups_total", "Local artifact cache lookups"), &["result"])?,
            model_loads_total: IntCounterVec::new(Opts::new("model_loads_total", "Model load attempts by outcome"), &["outcome"])?,
        };
        registry.register(Box::new(requests.requests_total.clone()))?;
        registry.register(Box::new(requests.inference_latency_seconds.clone()))?;
        registry.register(Box::new(artifacts.fetch_attempts_total.clone()))?;
        registry.register(Box::new(artifacts.cache_lookups_total.clone()))?;
        registry.register(Box::new(artifacts.model_loads_total.clone()))?;
        Ok(Self { registry, requests, artifacts })
    }

    pub fn render(&self) -> prometheus::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

pub fn serving_metrics() -> &'static ServingMetrics { &SERVING_METRICS }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_registered_families() {
        let m = serving_metrics();
        m.requests.requests_total.with_label_values(&["ok"]).inc();
        m.artifacts.cache_lookups_total.with_label_values(&["hit"]).inc();
        let text = m.render().unwrap();
        assert!(text.contains("serving_predict_requests_total"));
        assert!(text.contains("serving_artifact_cache_lookups_total"));
    }
}
