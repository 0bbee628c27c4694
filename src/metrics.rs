//! Prometheus metrics.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Counters exported at `/metrics`.
pub struct Metrics {
    registry: Registry,
    pub http_requests: IntCounterVec,
    pub jobs: IntCounterVec,
    pub stream_chunks: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let http_requests = IntCounterVec::new(
            Opts::new("gen_serve_http_requests_total", "API requests by endpoint"),
            &["endpoint"],
        )?;
        let jobs = IntCounterVec::new(
            Opts::new("gen_serve_jobs_total", "Audio jobs by outcome"),
            &["outcome"],
        )?;
        let stream_chunks = IntCounter::new(
            "gen_serve_stream_chunks_total",
            "Content chunks sent on SSE streams",
        )?;

        registry.register(Box::new(http_requests.clone()))?;
        registry.register(Box::new(jobs.clone()))?;
        registry.register(Box::new(stream_chunks.clone()))?;

        Ok(Self {
            registry,
            http_requests,
            jobs,
            stream_chunks,
        })
    }

    pub fn request(&self, endpoint: &str) {
        self.http_requests.with_label_values(&[endpoint]).inc();
    }

    /// Render all metrics in the text exposition format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.request("chat");
        metrics.jobs.with_label_values(&["success"]).inc();
        metrics.stream_chunks.inc_by(3);

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"gen_serve_http_requests_total{endpoint="chat"} 1"#));
        assert!(text.contains(r#"gen_serve_jobs_total{outcome="success"} 1"#));
        assert!(text.contains("gen_serve_stream_chunks_total 3"));
    }
}
