//! Daemon configuration.

use std::time::Duration;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Client name identifying this daemon instance on the server.
    /// At most one daemon per (database, client name) may run at a time.
    pub client_name: String,

    /// Number of chain workers to spawn
    pub cron_workers: usize,

    /// Default chain timeout in milliseconds (0 = no timeout)
    pub chain_timeout_ms: i32,

    /// Default task timeout in milliseconds (0 = no timeout)
    pub task_timeout_ms: i32,

    /// Refuse to execute PROGRAM tasks
    pub no_program_tasks: bool,

    /// Initial wait between advisory lock attempts
    pub lock_wait_time: Duration,

    /// Upper bound for the advisory lock backoff
    pub lock_max_wait_time: Duration,

    /// Spread window in seconds for large scheduled batches
    pub refetch_timeout: u64,

    /// Interval between scheduled chain polls
    pub poll_interval: Duration,

    /// HTTP status endpoint port (0 = disabled)
    pub http_port: u16,

    /// Bootstrap the database schema before starting
    pub start_init: bool,

    /// Re-apply the schema objects before starting
    pub start_upgrade: bool,

    /// Connection pool size
    pub max_pool_connections: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let client_name =
            std::env::var("CHAINWHEEL_CLIENT_NAME").unwrap_or_else(|_| "chainwheel".to_string());

        let cron_workers: usize = std::env::var("CHAINWHEEL_CRON_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(num_cpus::get);

        let chain_timeout_ms: i32 = std::env::var("CHAINWHEEL_CHAIN_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let task_timeout_ms: i32 = std::env::var("CHAINWHEEL_TASK_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let no_program_tasks = env_flag("CHAINWHEEL_NO_PROGRAM_TASKS");

        let lock_wait_secs: u64 = std::env::var("CHAINWHEEL_LOCK_WAIT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let lock_max_wait_secs: u64 = std::env::var("CHAINWHEEL_LOCK_MAX_WAIT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let refetch_timeout: u64 = std::env::var("CHAINWHEEL_REFETCH_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);

        let poll_interval_secs: u64 = std::env::var("CHAINWHEEL_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let http_port: u16 = std::env::var("CHAINWHEEL_HTTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let start_init = env_flag("CHAINWHEEL_INIT");
        let start_upgrade = env_flag("CHAINWHEEL_UPGRADE");

        let max_pool_connections: u32 = std::env::var("CHAINWHEEL_MAX_POOL_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let config = Config {
            database_url,
            client_name,
            cron_workers,
            chain_timeout_ms,
            task_timeout_ms,
            no_program_tasks,
            lock_wait_time: Duration::from_secs(lock_wait_secs),
            lock_max_wait_time: Duration::from_secs(lock_max_wait_secs),
            refetch_timeout,
            poll_interval: Duration::from_secs(poll_interval_secs),
            http_port,
            start_init,
            start_upgrade,
            max_pool_connections,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.client_name.is_empty() || self.client_name.contains(char::is_whitespace) {
            anyhow::bail!(
                "client name must be non-empty and without whitespace: {:?}",
                self.client_name
            );
        }
        if self.cron_workers == 0 {
            anyhow::bail!("at least one chain worker is required");
        }
        Ok(())
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
