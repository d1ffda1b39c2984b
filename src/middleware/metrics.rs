//! Request metrics.
//!
//! Records, per request, a counter and a latency histogram labelled with
//! path, method and status, plus an in-flight gauge.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::http::StatusCode;

use crate::http::error::HandlerResult;
use crate::http::handler::{BoxHandler, Handler, Middleware};
use crate::http::request::Request;
use crate::http::writer::ResponseWriter;
use crate::observability::metrics::{
    RecorderSink, HTTP_CONCURRENT_REQUESTS, HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS,
};

/// Destination for metric updates.
pub trait MetricsSink: Send + Sync + 'static {
    fn increment_counter(&self, name: &'static str, labels: &[(&'static str, String)]);

    fn record_histogram(&self, name: &'static str, value: f64, labels: &[(&'static str, String)]);

    /// Move a gauge by `delta`, which may be negative.
    fn adjust_gauge(&self, name: &'static str, delta: f64, labels: &[(&'static str, String)]);
}

#[derive(Clone)]
pub struct Metrics {
    sink: Arc<dyn MetricsSink>,
}

impl Metrics {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(Arc::new(RecorderSink))
    }
}

impl Middleware for Metrics {
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(MetricsHandler {
            sink: Arc::clone(&self.sink),
            next,
        })
    }
}

struct MetricsHandler {
    sink: Arc<dyn MetricsSink>,
    next: BoxHandler,
}

/// Keeps the in-flight gauge balanced even if the handler unwinds.
struct InFlight<'a>(&'a dyn MetricsSink);

impl<'a> InFlight<'a> {
    fn enter(sink: &'a dyn MetricsSink) -> Self {
        sink.adjust_gauge(HTTP_CONCURRENT_REQUESTS, 1.0, &[]);
        Self(sink)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.adjust_gauge(HTTP_CONCURRENT_REQUESTS, -1.0, &[]);
    }
}

#[async_trait]
impl Handler for MetricsHandler {
    async fn call(&self, w: &mut dyn ResponseWriter, req: Request) -> HandlerResult {
        let path = req.uri().path().to_string();
        let method = req.method().to_string();
        let start = Instant::now();

        let result = {
            let _in_flight = InFlight::enter(self.sink.as_ref());
            self.next.call(w, req).await
        };

        let status = match &result {
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Ok(()) if w.is_hijacked() => StatusCode::SWITCHING_PROTOCOLS,
            Ok(()) => w.status(),
        };
        let labels = [
            ("path", path),
            ("method", method),
            ("status", status.as_u16().to_string()),
        ];
        self.sink.increment_counter(HTTP_REQUESTS_TOTAL, &labels);
        self.sink
            .record_histogram(HTTP_REQUEST_DURATION_SECONDS, start.elapsed().as_secs_f64(), &labels);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::error::HandlerError;
    use crate::http::handler::handler_fn;
    use crate::http::recorder::MemoryWriter;
    use axum::body::Bytes;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<String>>,
    }

    fn render(labels: &[(&'static str, String)]) -> String {
        labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    impl MetricsSink for RecordingSink {
        fn increment_counter(&self, name: &'static str, labels: &[(&'static str, String)]) {
            self.events.lock().unwrap().push(format!("counter {name} {}", render(labels)));
        }

        fn record_histogram(&self, name: &'static str, _value: f64, labels: &[(&'static str, String)]) {
            self.events.lock().unwrap().push(format!("histogram {name} {}", render(labels)));
        }

        fn adjust_gauge(&self, name: &'static str, delta: f64, _labels: &[(&'static str, String)]) {
            self.events.lock().unwrap().push(format!("gauge {name} {delta}"));
        }
    }

    #[tokio::test]
    async fn records_count_duration_and_in_flight() {
        let sink = Arc::new(RecordingSink::default());
        let created = handler_fn(|w, _req| {
            Box::pin(async move {
                w.write_header(StatusCode::CREATED).await?;
                Ok::<(), HandlerError>(())
            })
        });
        let handler = Metrics::new(sink.clone()).wrap(created);
        let req = axum::http::Request::post("/items").body(Bytes::new()).unwrap();
        handler.call(&mut MemoryWriter::new(), req).await.unwrap();

        let events = sink.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "gauge http_concurrent_requests 1".to_string(),
                "gauge http_concurrent_requests -1".to_string(),
                "counter http_requests_total path=/items,method=POST,status=201".to_string(),
                "histogram http_request_duration_seconds path=/items,method=POST,status=201".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn failed_request_counts_as_500() {
        let sink = Arc::new(RecordingSink::default());
        let failing = handler_fn(|_w, _req| Box::pin(async { Err::<(), _>(HandlerError::msg("nope")) }));
        let handler = Metrics::new(sink.clone()).wrap(failing);
        let req = axum::http::Request::get("/").body(Bytes::new()).unwrap();
        assert!(handler.call(&mut MemoryWriter::new(), req).await.is_err());

        let events = sink.events.lock().unwrap();
        assert!(events.iter().any(|e| e.ends_with("status=500") && e.starts_with("counter")));
    }
}
