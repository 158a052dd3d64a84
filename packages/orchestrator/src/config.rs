use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Dispatcher concurrency (claim loops per instance).
    pub workers: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub job_timeout_default: Duration,
    pub assign_ack_timeout: Duration,
    pub cancel_ack_timeout: Duration,
    pub schedule_sweep_interval: Duration,
    pub timeout_sweep_interval: Duration,
    pub shutdown_grace: Duration,
    pub heartbeat_retention: Duration,
    pub robot_auth_enabled: bool,
    pub jwt_secret_key: String,
    pub jwt_access_expire_minutes: i64,
    pub jwt_refresh_expire_days: i64,
    pub cors_origins: Vec<String>,
    pub max_workflow_bytes: usize,
    pub max_workflow_nodes: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            workers: parse_or("WORKERS", num_cpus::get())?,
            heartbeat_interval: Duration::from_secs(parse_or("HEARTBEAT_INTERVAL_SECONDS", 30)?),
            heartbeat_timeout: Duration::from_secs(parse_or("HEARTBEAT_TIMEOUT_SECONDS", 90)?),
            job_timeout_default: Duration::from_secs(parse_or(
                "JOB_TIMEOUT_DEFAULT_SECONDS",
                3600,
            )?),
            assign_ack_timeout: Duration::from_secs(parse_or("ASSIGN_ACK_TIMEOUT_SECONDS", 5)?),
            cancel_ack_timeout: Duration::from_secs(parse_or("CANCEL_ACK_TIMEOUT_SECONDS", 30)?),
            schedule_sweep_interval: Duration::from_secs(parse_or("SCHEDULE_SWEEP_SECONDS", 1)?),
            timeout_sweep_interval: Duration::from_secs(parse_or("TIMEOUT_SWEEP_SECONDS", 10)?),
            shutdown_grace: Duration::from_secs(parse_or("SHUTDOWN_GRACE_SECONDS", 30)?),
            heartbeat_retention: Duration::from_secs(parse_or(
                "HEARTBEAT_RETENTION_SECONDS",
                24 * 3600,
            )?),
            robot_auth_enabled: env::var("ROBOT_AUTH_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            jwt_secret_key: env::var("JWT_SECRET_KEY").context("JWT_SECRET_KEY must be set")?,
            jwt_access_expire_minutes: parse_or("JWT_ACCESS_EXPIRE_MINUTES", 60)?,
            jwt_refresh_expire_days: parse_or("JWT_REFRESH_EXPIRE_DAYS", 30)?,
            cors_origins: env::var("CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            max_workflow_bytes: parse_or("MAX_WORKFLOW_BYTES", 10 * 1024 * 1024)?,
            max_workflow_nodes: parse_or("MAX_WORKFLOW_NODES", 1000)?,
        })
    }

    /// Liveness sweep cadence: half the heartbeat interval.
    pub fn liveness_sweep_interval(&self) -> Duration {
        self.heartbeat_interval / 2
    }
}

fn parse_or<T>(var: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{var} must be a valid number")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_or_uses_default_when_unset() {
        assert_eq!(parse_or("DEFINITELY_NOT_SET_XYZ", 42u64).unwrap(), 42);
    }

    #[test]
    fn liveness_sweep_is_half_the_heartbeat_interval() {
        let config = Config {
            database_url: String::new(),
            port: 8080,
            workers: 1,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            job_timeout_default: Duration::from_secs(3600),
            assign_ack_timeout: Duration::from_secs(5),
            cancel_ack_timeout: Duration::from_secs(30),
            schedule_sweep_interval: Duration::from_secs(1),
            timeout_sweep_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
            heartbeat_retention: Duration::from_secs(86400),
            robot_auth_enabled: true,
            jwt_secret_key: "secret".into(),
            jwt_access_expire_minutes: 60,
            jwt_refresh_expire_days: 30,
            cors_origins: vec![],
            max_workflow_bytes: 10 * 1024 * 1024,
            max_workflow_nodes: 1000,
        };
        assert_eq!(config.liveness_sweep_interval(), Duration::from_secs(15));
    }
}
