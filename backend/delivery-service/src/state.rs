use std::sync::Arc;

use crypto_core::{Cipher, KeyStore, Keyring};
use job_queue::{JobQueue, JobStore, QueueMetrics};

use crate::{
    broker::EventBroker, config::Config, jobs::DeliveryJob, services::DeliveryService,
    signaling::SignalingRelay,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub broker: EventBroker,
    pub keys: Arc<dyn KeyStore>,
    pub queue: JobQueue<DeliveryJob>,
    pub relay: SignalingRelay,
    pub delivery: DeliveryService,
}

impl AppState {
    /// Wire the components from configuration. Nothing is process-global:
    /// every collaborator is owned here and cloned into handlers.
    pub fn new(
        config: Config,
        store: Arc<dyn JobStore>,
        keys: Arc<dyn KeyStore>,
        system: Keyring,
    ) -> Self {
        let config = Arc::new(config);
        let broker = EventBroker::new(config.subscriber_buffer_size);
        let queue = JobQueue::new(store, config.queue_config())
            .with_metrics(QueueMetrics::new("delivery-service"));
        let relay = SignalingRelay::new(config.signaling_ttl);
        let delivery = DeliveryService::new(
            broker.clone(),
            Arc::clone(&keys),
            queue.clone(),
            Cipher::new(config.kdf_context.clone()),
            Arc::new(system),
        );

        Self {
            config,
            broker,
            keys,
            queue,
            relay,
            delivery,
        }
    }
}
