pub mod delivery;

pub use delivery::{
    inbox_topic, validate_event_type, validate_topic, DeliveryError, DeliveryRoute,
    DeliveryService, DIRECT_MESSAGE_EVENT, JOB_DEAD_LETTERED_EVENT, NOTIFICATIONS_QUEUE,
    SYSTEM_JOBS_TOPIC,
};
