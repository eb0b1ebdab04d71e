//! Environment-driven runtime configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Process-level configuration, read from `FLOWSTONE_*` environment
/// variables with workable defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// PostgreSQL connection string (`DATABASE_URL`).
    pub database_url: String,

    /// Number of job-queue workers driving the engine.
    pub job_workers: usize,

    /// Number of outbox workers dispatching side effects.
    pub outbox_workers: usize,

    /// Idle delay between job polls.
    #[serde(with = "duration_millis")]
    pub job_poll_interval: Duration,

    /// How long a claimed job stays invisible before it is released back to
    /// the queue. Must exceed the maximum execution duration.
    #[serde(with = "duration_millis")]
    pub job_visibility_timeout: Duration,

    /// Idle delay between outbox polls.
    #[serde(with = "duration_millis")]
    pub outbox_poll_interval: Duration,

    /// Messages fetched per outbox poll.
    pub outbox_batch_size: usize,

    /// Sleep-timer poll interval.
    #[serde(with = "duration_millis")]
    pub sleep_poll_interval: Duration,

    /// How often the cron registry reconciles against the database.
    #[serde(with = "duration_millis")]
    pub cron_sync_interval: Duration,

    /// How often expired job claims are released.
    #[serde(with = "duration_millis")]
    pub job_reclaim_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            job_workers: 2,
            outbox_workers: 4,
            job_poll_interval: Duration::from_secs(1),
            job_visibility_timeout: Duration::from_secs(35 * 60),
            outbox_poll_interval: Duration::from_secs(1),
            outbox_batch_size: 4,
            sleep_poll_interval: Duration::from_secs(5),
            cron_sync_interval: Duration::from_secs(5 * 60),
            job_reclaim_interval: Duration::from_secs(60),
        }
    }
}

impl RuntimeConfig {
    /// Read configuration from the environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or_default(),
            job_workers: env_usize("FLOWSTONE_JOB_WORKERS", defaults.job_workers),
            outbox_workers: env_usize("FLOWSTONE_OUTBOX_WORKERS", defaults.outbox_workers),
            job_poll_interval: env_millis(
                "FLOWSTONE_JOB_POLL_MS",
                defaults.job_poll_interval,
            ),
            job_visibility_timeout: env_millis(
                "FLOWSTONE_JOB_VISIBILITY_MS",
                defaults.job_visibility_timeout,
            ),
            outbox_poll_interval: env_millis(
                "FLOWSTONE_OUTBOX_POLL_MS",
                defaults.outbox_poll_interval,
            ),
            outbox_batch_size: env_usize(
                "FLOWSTONE_OUTBOX_BATCH",
                defaults.outbox_batch_size,
            ),
            sleep_poll_interval: env_millis(
                "FLOWSTONE_SLEEP_POLL_MS",
                defaults.sleep_poll_interval,
            ),
            cron_sync_interval: env_millis(
                "FLOWSTONE_CRON_SYNC_MS",
                defaults.cron_sync_interval,
            ),
            job_reclaim_interval: env_millis(
                "FLOWSTONE_JOB_RECLAIM_MS",
                defaults.job_reclaim_interval,
            ),
        }
    }

    pub fn with_job_workers(mut self, n: usize) -> Self {
        self.job_workers = n.max(1);
        self
    }

    pub fn with_outbox_workers(mut self, n: usize) -> Self {
        self.outbox_workers = n.max(1);
        self
    }

    pub fn with_job_poll_interval(mut self, interval: Duration) -> Self {
        self.job_poll_interval = interval;
        self
    }

    pub fn with_outbox_poll_interval(mut self, interval: Duration) -> Self {
        self.outbox_poll_interval = interval;
        self
    }

    pub fn with_sleep_poll_interval(mut self, interval: Duration) -> Self {
        self.sleep_poll_interval = interval;
        self
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
