//! Prometheus metrics for the HTTP surface, the broker and signaling.

use std::rc::Rc;
use std::time::{Duration, Instant};

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpResponse,
};
use futures::future::{ready, LocalBoxFuture, Ready};
use job_queue::register_collector;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder,
};

const HTTP_LABELS: &[&str] = &["method", "path", "status"];

fn counter(name: &str, help: &str) -> IntCounter {
    register_collector(IntCounter::new(name, help).expect("static counter opts are valid"))
}

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_collector(
        IntCounterVec::new(
            Opts::new(
                "delivery_service_http_requests_total",
                "Total HTTP requests handled by delivery-service",
            ),
            HTTP_LABELS,
        )
        .expect("static counter opts are valid"),
    )
});

static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_collector(
        HistogramVec::new(
            HistogramOpts::new(
                "delivery_service_http_request_duration_seconds",
                "HTTP request latency for delivery-service",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
            HTTP_LABELS,
        )
        .expect("static histogram opts are valid"),
    )
});

static EVENTS_PUBLISHED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "delivery_service_events_published_total",
        "Events published to the broker",
    )
});

static FRAMES_DELIVERED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "delivery_service_frames_delivered_total",
        "Frames buffered for live subscribers",
    )
});

static SUBSCRIBERS_EVICTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "delivery_service_subscribers_evicted_total",
        "Subscribers disconnected after overflowing their buffer",
    )
});

static SUBSCRIBERS_REAPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "delivery_service_subscribers_reaped_total",
        "Already-closed subscriptions removed during publish",
    )
});

static ACTIVE_SUBSCRIBERS: Lazy<IntGauge> = Lazy::new(|| {
    register_collector(
        IntGauge::new(
            "delivery_service_active_subscribers",
            "Live event stream subscriptions",
        )
        .expect("static gauge opts are valid"),
    )
});

static SIGNALING_MESSAGES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_collector(
        IntCounterVec::new(
            Opts::new(
                "delivery_service_signaling_messages_total",
                "Signaling messages by outcome",
            ),
            &["outcome"],
        )
        .expect("static counter opts are valid"),
    )
});

pub fn observe_http_request(method: &str, path: &str, status: u16, elapsed: Duration) {
    let status = status.to_string();
    let labels = [method, path, status.as_str()];
    HTTP_REQUESTS_TOTAL.with_label_values(&labels).inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&labels)
        .observe(elapsed.as_secs_f64());
}

pub fn record_publish(delivered: usize) {
    EVENTS_PUBLISHED_TOTAL.inc();
    FRAMES_DELIVERED_TOTAL.inc_by(delivered as u64);
}

pub fn record_evicted(count: usize) {
    SUBSCRIBERS_EVICTED_TOTAL.inc_by(count as u64);
}

pub fn record_reaped(count: usize) {
    SUBSCRIBERS_REAPED_TOTAL.inc_by(count as u64);
}

pub fn subscriber_opened() {
    ACTIVE_SUBSCRIBERS.inc();
}

pub fn subscriber_closed() {
    ACTIVE_SUBSCRIBERS.dec();
}

/// `outcome` is one of `delivered`, `buffered`, `expired`, `rejected`.
pub fn record_signaling(outcome: &str) {
    SIGNALING_MESSAGES_TOTAL.with_label_values(&[outcome]).inc();
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&prometheus::gather(), &mut buffer) {
        Ok(()) => HttpResponse::Ok()
            .content_type(encoder.format_type())
            .body(buffer),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

/// Records count and latency per route pattern, so `/keys/{principal_id}`
/// is one series rather than one per principal.
pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService {
            service: Rc::new(service),
        }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let route = req
            .match_pattern()
            .unwrap_or_else(|| "unmatched".to_string());
        let method = req.method().to_string();
        let started = Instant::now();
        let response = self.service.call(req);

        Box::pin(async move {
            let result = response.await;
            let status = result
                .as_ref()
                .map(|res| res.status().as_u16())
                .unwrap_or(500);
            observe_http_request(&method, &route, status, started.elapsed());
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App};

    #[actix_web::test]
    async fn test_requests_labeled_by_route_pattern() {
        let app = test::init_service(
            App::new()
                .wrap(MetricsMiddleware)
                .route(
                    "/items/{id}",
                    web::get().to(|| async { HttpResponse::Ok().finish() }),
                )
                .route("/metrics", web::get().to(serve_metrics)),
        )
        .await;

        for id in ["a", "b"] {
            let req = test::TestRequest::get().uri(&format!("/items/{id}")).to_request();
            assert!(test::call_service(&app, req).await.status().is_success());
        }

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("path=\"/items/{id}\""));
        assert!(!text.contains("path=\"/items/a\""));
    }
}
