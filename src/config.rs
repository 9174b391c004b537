use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use sqlx::{pool::PoolOptions, PgPool};

/// A pool config object, designed to be passable across API boundaries.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    pub db_url: String,
    pub max_connections: Option<u32>,         // Default to 10
    pub min_connections: Option<u32>,         // Default to 1
    pub acquire_timeout_seconds: Option<u64>, // Default to 30
    pub max_lifetime_seconds: Option<u64>,    // Default to 300
    pub idle_timeout_seconds: Option<u64>,    // Default to 60
}

impl PoolConfig {
    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        let builder = PoolOptions::new()
            .max_connections(self.max_connections.unwrap_or(10))
            .min_connections(self.min_connections.unwrap_or(1))
            .max_lifetime(Duration::from_secs(
                self.max_lifetime_seconds.unwrap_or(300),
            ))
            .idle_timeout(Duration::from_secs(self.idle_timeout_seconds.unwrap_or(60)))
            .acquire_timeout(Duration::from_secs(
                self.acquire_timeout_seconds.unwrap_or(30),
            ));

        builder.connect(&self.db_url).await
    }
}

pub const DEFAULT_ACK_DEADLINE_SECONDS: i64 = 10;
pub const DEFAULT_RETENTION_PERIOD_SECONDS: i64 = 7 * 24 * 60 * 60;
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: i32 = 10;
pub const DEFAULT_POLL_INTERVAL_MILLIS: u64 = 1_000;
pub const DEFAULT_BATCH_SIZE: usize = 1;
// Renewer wakes up at ack_deadline * this fraction.
pub const DEFAULT_RENEWAL_MARGIN_NUM: i64 = 1;
pub const DEFAULT_RENEWAL_MARGIN_DEN: i64 = 2;

/// Tunables for a queue, set once at `create_queue` time.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub ack_deadline: ChronoDuration,
    pub retention_period: ChronoDuration,
    pub max_delivery_attempts: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ack_deadline: ChronoDuration::seconds(DEFAULT_ACK_DEADLINE_SECONDS),
            retention_period: ChronoDuration::seconds(DEFAULT_RETENTION_PERIOD_SECONDS),
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
        }
    }
}
