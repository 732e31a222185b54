//! 指标观察者
//!
//! 各组件持有 `Arc<dyn MetricsSink>` 上报事件，记录不会失败，也不会阻塞调用方。

use std::sync::Arc;
use std::time::Duration;

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

pub trait MetricsSink: Send + Sync + 'static {
    fn record_request(&self, _method: &str, _path: &str, _status: u16, _latency: Duration) {}

    fn record_message_ingested(&self, _tenant_id: &str, _role: &str, _async_mode: bool, _status: &str) {}

    fn record_memory_search(&self, _tenant_id: &str, _result_count: usize, _cached: bool, _latency: Duration) {}

    fn record_embedding_job(&self, _status: &str, _duration: Option<Duration>) {}

    fn record_rate_limited(&self, _scope: &str) {}

    /// Prometheus 文本格式，不导出指标的实现返回 `None`
    fn render(&self) -> Option<String> {
        None
    }
}

pub type SharedMetrics = Arc<dyn MetricsSink>;

/// 丢弃所有事件
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// 基于 Prometheus 的实现，使用独立的 registry
pub struct PrometheusMetrics {
    registry: Registry,
    requests_total: CounterVec,
    request_latency: HistogramVec,
    messages_ingested_total: CounterVec,
    memory_search_total: CounterVec,
    memory_search_latency: HistogramVec,
    memory_search_results: HistogramVec,
    embedding_jobs_total: CounterVec,
    embedding_job_duration: HistogramVec,
    rate_limited_total: CounterVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("aiml_requests_total", "Total HTTP requests"),
            &["method", "path", "status"],
        )?;
        let request_latency = HistogramVec::new(
            HistogramOpts::new("aiml_request_latency_seconds", "Request latency in seconds"),
            &["method", "path"],
        )?;
        let messages_ingested_total = CounterVec::new(
            Opts::new(
                "aiml_messages_ingested_total",
                "Messages ingested by tenant/role/mode",
            ),
            &["tenant", "role", "mode", "status"],
        )?;
        let memory_search_total = CounterVec::new(
            Opts::new(
                "aiml_memory_search_total",
                "Search requests by tenant and cache status",
            ),
            &["tenant", "cached"],
        )?;
        let memory_search_latency = HistogramVec::new(
            HistogramOpts::new(
                "aiml_memory_search_latency_seconds",
                "Latency of memory search requests",
            ),
            &["cached"],
        )?;
        let memory_search_results = HistogramVec::new(
            HistogramOpts::new(
                "aiml_memory_search_results",
                "Distribution of result counts per search",
            )
            .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0]),
            &["tenant"],
        )?;
        let embedding_jobs_total = CounterVec::new(
            Opts::new("aiml_embedding_jobs_total", "Embedding jobs processed by status"),
            &["status"],
        )?;
        let embedding_job_duration = HistogramVec::new(
            HistogramOpts::new(
                "aiml_embedding_job_duration_seconds",
                "Duration of embedding generation jobs",
            ),
            &["status"],
        )?;
        let rate_limited_total = CounterVec::new(
            Opts::new("aiml_rate_limited_total", "Requests rejected by the rate limiter"),
            &["scope"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_latency.clone()))?;
        registry.register(Box::new(messages_ingested_total.clone()))?;
        registry.register(Box::new(memory_search_total.clone()))?;
        registry.register(Box::new(memory_search_latency.clone()))?;
        registry.register(Box::new(memory_search_results.clone()))?;
        registry.register(Box::new(embedding_jobs_total.clone()))?;
        registry.register(Box::new(embedding_job_duration.clone()))?;
        registry.register(Box::new(rate_limited_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_latency,
            messages_ingested_total,
            memory_search_total,
            memory_search_latency,
            memory_search_results,
            embedding_jobs_total,
            embedding_job_duration,
            rate_limited_total,
        })
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_request(&self, method: &str, path: &str, status: u16, latency: Duration) {
        self.requests_total
            .with_label_values(&[method, path, &status.to_string()])
            .inc();
        self.request_latency
            .with_label_values(&[method, path])
            .observe(latency.as_secs_f64());
    }

    fn record_message_ingested(&self, tenant_id: &str, role: &str, async_mode: bool, status: &str) {
        let mode = if async_mode { "async" } else { "inline" };
        self.messages_ingested_total
            .with_label_values(&[tenant_id, role, mode, status])
            .inc();
    }

    fn record_memory_search(&self, tenant_id: &str, result_count: usize, cached: bool, latency: Duration) {
        let cached = if cached { "true" } else { "false" };
        self.memory_search_total
            .with_label_values(&[tenant_id, cached])
            .inc();
        self.memory_search_latency
            .with_label_values(&[cached])
            .observe(latency.as_secs_f64());
        self.memory_search_results
            .with_label_values(&[tenant_id])
            .observe(result_count as f64);
    }

    fn record_embedding_job(&self, status: &str, duration: Option<Duration>) {
        self.embedding_jobs_total.with_label_values(&[status]).inc();
        if let Some(duration) = duration {
            self.embedding_job_duration
                .with_label_values(&[status])
                .observe(duration.as_secs_f64());
        }
    }

    fn record_rate_limited(&self, scope: &str) {
        self.rate_limited_total.with_label_values(&[scope]).inc();
    }

    fn render(&self) -> Option<String> {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "metrics_encode_failed");
            return None;
        }
        String::from_utf8(buffer).ok()
    }
}
