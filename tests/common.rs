use pgjobq::QueueConfig;

/// Short ack deadlines and a tight retention window keep the integration
/// suite fast without needing to mock the clock.
#[allow(dead_code)]
pub fn fast_queue_config() -> QueueConfig {
    QueueConfig {
        ack_deadline: chrono::Duration::milliseconds(200),
        retention_period: chrono::Duration::minutes(5),
        max_delivery_attempts: 3,
    }
}
