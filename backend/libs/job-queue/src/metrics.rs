use prometheus::core::Collector;
use prometheus::{IntCounterVec, IntGaugeVec, Opts};
use tracing::warn;

/// Register `metric` with the default registry and hand it back.
///
/// A second registration under the same name (several queues or test
/// harnesses in one process) is logged and otherwise ignored; the returned
/// handle still works, it just is not exported twice.
pub fn register_collector<C>(metric: C) -> C
where
    C: Collector + Clone + 'static,
{
    if let Err(e) = prometheus::default_registry().register(Box::new(metric.clone())) {
        warn!(error = %e, "Metric not registered");
    }
    metric
}

fn queue_counter(name: &str, help: &str, service: &str) -> IntCounterVec {
    let opts = Opts::new(name, help).const_label("service", service.to_string());
    register_collector(
        IntCounterVec::new(opts, &["queue"]).expect("static job queue counter opts are valid"),
    )
}

#[derive(Clone)]
pub struct QueueMetrics {
    pub enqueued: IntCounterVec,
    pub completed: IntCounterVec,
    pub retried: IntCounterVec,
    pub dead_lettered: IntCounterVec,
    pub leased: IntGaugeVec,
}

impl QueueMetrics {
    pub fn new(service: &str) -> Self {
        let leased = IntGaugeVec::new(
            Opts::new(
                "job_queue_leased",
                "Number of jobs currently leased by this process",
            )
            .const_label("service", service.to_string()),
            &["queue"],
        )
        .expect("static job queue gauge opts are valid");

        Self {
            enqueued: queue_counter(
                "job_queue_enqueued_total",
                "Total number of jobs enqueued",
                service,
            ),
            completed: queue_counter(
                "job_queue_completed_total",
                "Total number of jobs that completed successfully",
                service,
            ),
            retried: queue_counter(
                "job_queue_retried_total",
                "Total number of failed attempts rescheduled with backoff",
                service,
            ),
            dead_lettered: queue_counter(
                "job_queue_dead_lettered_total",
                "Total number of jobs moved to the dead-letter set",
                service,
            ),
            leased: register_collector(leased),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::IntCounter;

    #[test]
    fn test_duplicate_registration_keeps_working_handle() {
        let first = register_collector(
            IntCounter::new("job_queue_test_duplicate_total", "test").unwrap(),
        );
        let second = register_collector(
            IntCounter::new("job_queue_test_duplicate_total", "test").unwrap(),
        );
        first.inc();
        second.inc_by(2);
        assert_eq!(first.get(), 1);
        assert_eq!(second.get(), 2);
    }

    #[test]
    fn test_queue_metrics_can_be_built_twice() {
        let a = QueueMetrics::new("metrics-test");
        let b = QueueMetrics::new("metrics-test");
        a.enqueued.with_label_values(&["q"]).inc();
        b.leased.with_label_values(&["q"]).set(3);
        assert_eq!(b.leased.with_label_values(&["q"]).get(), 3);
    }
}
