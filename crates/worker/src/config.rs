//! Worker configuration

use std::env;
use std::str::FromStr;

use linesync_shared::{CustomerId, Namespace};
use uuid::Uuid;

/// Worker configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    // Database
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,

    // Sync
    pub lookback_hours: i64,
    pub batch_size: usize,
    pub namespaces: Vec<Namespace>,
    pub customers: Vec<CustomerId>,

    // Schedules (cron with seconds)
    pub sync_schedule: String,
    pub advance_schedule: String,
    pub collect_schedule: String,
}

impl WorkerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let lookback_hours: i64 = parse_or("SYNC_LOOKBACK_HOURS", 24 * 30)?;
        if lookback_hours <= 0 {
            return Err(ConfigError::Invalid {
                name: "SYNC_LOOKBACK_HOURS",
                reason: "must be positive".to_string(),
            });
        }

        let batch_size: usize = parse_or("SYNC_BATCH_SIZE", 20)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                name: "SYNC_BATCH_SIZE",
                reason: "must be positive".to_string(),
            });
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 20)?,
            run_migrations: env::var("RUN_MIGRATIONS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),

            lookback_hours,
            batch_size,
            namespaces: list("SYNC_NAMESPACES")
                .into_iter()
                .map(|ns| {
                    Namespace::new(ns).map_err(|e| ConfigError::Invalid {
                        name: "SYNC_NAMESPACES",
                        reason: e.to_string(),
                    })
                })
                .collect::<Result<_, _>>()?,
            customers: list("SYNC_CUSTOMERS")
                .into_iter()
                .map(|id| {
                    Uuid::parse_str(&id)
                        .map(CustomerId::from)
                        .map_err(|e| ConfigError::Invalid {
                            name: "SYNC_CUSTOMERS",
                            reason: format!("{id}: {e}"),
                        })
                })
                .collect::<Result<_, _>>()?,

            sync_schedule: env::var("SYNC_SCHEDULE").unwrap_or_else(|_| "0 0 * * * *".to_string()),
            advance_schedule: env::var("ADVANCE_SCHEDULE")
                .unwrap_or_else(|_| "0 * * * * *".to_string()),
            collect_schedule: env::var("COLLECT_SCHEDULE")
                .unwrap_or_else(|_| "30 * * * * *".to_string()),
        })
    }

    pub fn lookback(&self) -> time::Duration {
        time::Duration::hours(self.lookback_hours)
    }
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        _ => Ok(default),
    }
}

/// Comma separated list, empty entries skipped
fn list(name: &str) -> Vec<String> {
    env::var(name)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Config tests modify shared env vars
    static CONFIG_TEST_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "SYNC_LOOKBACK_HOURS",
        "SYNC_BATCH_SIZE",
        "SYNC_NAMESPACES",
        "SYNC_CUSTOMERS",
        "RUN_MIGRATIONS",
    ];

    fn cleanup_config() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();
        cleanup_config();
        env::set_var("DATABASE_URL", "postgres://test");

        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.lookback_hours, 720);
        assert_eq!(config.batch_size, 20);
        assert!(config.namespaces.is_empty());
        assert!(config.customers.is_empty());
        assert!(!config.run_migrations);
        assert_eq!(config.sync_schedule, "0 0 * * * *");

        cleanup_config();
    }

    #[test]
    fn test_missing_database_url() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();
        cleanup_config();

        match WorkerConfig::from_env() {
            Err(ConfigError::Missing("DATABASE_URL")) => {}
            other => panic!("Expected Missing DATABASE_URL, got: {:?}", other),
        }
    }

    #[test]
    fn test_lookback_must_be_positive() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();
        cleanup_config();
        env::set_var("DATABASE_URL", "postgres://test");

        for bad in ["0", "-5", "soon"] {
            env::set_var("SYNC_LOOKBACK_HOURS", bad);
            assert!(
                matches!(
                    WorkerConfig::from_env(),
                    Err(ConfigError::Invalid { name: "SYNC_LOOKBACK_HOURS", .. })
                ),
                "lookback {bad} should be rejected"
            );
        }

        cleanup_config();
    }

    #[test]
    fn test_filters_parsed() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();
        cleanup_config();
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var("SYNC_NAMESPACES", "acme, globex,,");
        env::set_var("SYNC_CUSTOMERS", "67e55044-10b1-426f-9247-bb680e5fe0c8");

        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(
            config.namespaces.iter().map(Namespace::as_str).collect::<Vec<_>>(),
            vec!["acme", "globex"]
        );
        assert_eq!(config.customers.len(), 1);

        env::set_var("SYNC_CUSTOMERS", "not-a-uuid");
        assert!(matches!(
            WorkerConfig::from_env(),
            Err(ConfigError::Invalid { name: "SYNC_CUSTOMERS", .. })
        ));

        cleanup_config();
    }
}
