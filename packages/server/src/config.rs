use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Jobs claimed per tenant per worker tick.
    pub job_batch_size: i64,
    /// Visibility timeout for claimed jobs.
    pub job_lease: Duration,
    /// Sleep between worker ticks when no jobs are due.
    pub job_poll_interval: Duration,
    /// Outbound platform HTTP timeout.
    pub gateway_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let config = Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            job_batch_size: env::var("JOB_BATCH_SIZE")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("JOB_BATCH_SIZE must be a valid number")?,
            job_lease: Duration::from_secs(
                env::var("JOB_LEASE_SECS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .context("JOB_LEASE_SECS must be a valid number")?,
            ),
            job_poll_interval: Duration::from_secs(
                env::var("JOB_POLL_INTERVAL_SECS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .context("JOB_POLL_INTERVAL_SECS must be a valid number")?,
            ),
            gateway_timeout: Duration::from_secs(
                env::var("GATEWAY_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .context("GATEWAY_TIMEOUT_SECS must be a valid number")?,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    /// Per-job handler timeout: the lease minus a 30s completion margin.
    pub fn job_timeout(&self) -> Duration {
        self.job_lease - Duration::from_secs(30)
    }

    fn validate(&self) -> Result<()> {
        if self.job_batch_size < 1 {
            bail!("JOB_BATCH_SIZE must be at least 1");
        }
        if self.job_lease <= Duration::from_secs(30) {
            bail!("JOB_LEASE_SECS must exceed 30 (handler timeout is lease - 30s)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            database_url: "postgres://localhost/test".to_string(),
            port: 8080,
            job_batch_size: 5,
            job_lease: Duration::from_secs(300),
            job_poll_interval: Duration::from_secs(5),
            gateway_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn default_job_timeout_is_lease_minus_margin() {
        let config = base_config();
        assert_eq!(config.job_timeout(), Duration::from_secs(270));
    }

    #[test]
    fn rejects_lease_shorter_than_margin() {
        let mut config = base_config();
        config.job_lease = Duration::from_secs(30);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut config = base_config();
        config.job_batch_size = 0;
        assert!(config.validate().is_err());
    }
}
