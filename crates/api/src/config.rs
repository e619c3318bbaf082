//! Process configuration loaded from environment variables.
//!
//! Every value has a default suitable for local development. Invalid values
//! are reported as [`ConfigError`] instead of being silently replaced.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use axum::http::HeaderValue;
use charforge_comfyui::client::DEFAULT_PROBE_TIMEOUT;
use charforge_comfyui::driver::DriverConfig;
use charforge_core::backoff::BackoffConfig;
use charforge_core::worker::WorkerSpec;
use charforge_pipeline::{OrchestratorConfig, RegistryConfig};
use charforge_storage::{parse_backend_list, StorageConfig, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed.
    #[error("{name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    /// The storage backend list is invalid.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Bound on waiting for job tasks at shutdown (default: `30`).
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            cors_origins: vec!["http://localhost:5173".to_string()],
            request_timeout_secs: 30,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Everything the binary needs to assemble the service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// Postgres URL for the durable ledger; unset runs on the in-memory one.
    pub database_url: Option<String>,
    pub orchestrator: OrchestratorConfig,
    pub driver: DriverConfig,
    pub registry: RegistryConfig,
    pub probe_timeout: Duration,
    pub health_check_interval: Duration,
    /// Statically declared workers.
    pub workers: Vec<WorkerSpec>,
    /// Enables RunPod discovery when set.
    pub runpod_api_key: Option<String>,
    pub discovery_interval: Duration,
    pub storage: StorageConfig,
    /// Emit JSON log lines instead of the human-readable format.
    pub log_json: bool,
}

impl AppConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                                  | Default                 |
    /// |------------------------------------------|-------------------------|
    /// | `HOST` / `PORT`                          | `0.0.0.0` / `3000`      |
    /// | `CORS_ORIGINS`                           | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS`                   | `30`                    |
    /// | `SHUTDOWN_TIMEOUT_SECS`                  | `30`                    |
    /// | `DATABASE_URL`                           | unset                   |
    /// | `MAX_ATTEMPTS`                           | `3`                     |
    /// | `MAX_CONCURRENT_JOBS`                    | `16`                    |
    /// | `SCHEDULE_INTERVAL_MS`                   | `1000`                  |
    /// | `RETRY_BASE_SECS` / `RETRY_MAX_SECS`     | `5` / `300`             |
    /// | `UPLOAD_RETRY_BASE_SECS` / `..._MAX_SECS`| `10` / `600`            |
    /// | `MAX_UPLOAD_ATTEMPTS`                    | unset                   |
    /// | `UPLOAD_TIMEOUT_SECS`                    | `300`                   |
    /// | `POLL_INITIAL_SECS` / `POLL_MAX_SECS`    | `2` / `30`              |
    /// | `TRAIN/IMAGE/VIDEO_TIMEOUT_SECS`         | `7200` / `600` / `1800` |
    /// | `WORKER_REQUEST_TIMEOUT_SECS`            | `30`                    |
    /// | `FETCH_TIMEOUT_SECS`                     | `60`                    |
    /// | `HEALTH_CHECK_INTERVAL_SECS`             | `30`                    |
    /// | `PROBE_TIMEOUT_SECS`                     | `10`                    |
    /// | `UNREACHABLE_AFTER`                      | `2`                     |
    /// | `WORKERS`                                | `[]`                    |
    /// | `RUNPOD_API_KEY`                         | unset                   |
    /// | `DISCOVERY_INTERVAL_SECS`                | `60`                    |
    /// | `STORAGE_BACKENDS`                       | `local`                 |
    /// | `LOCAL_STORAGE_DIR`                      | `./storage`             |
    /// | `S3_BUCKET` / `AWS_REGION`               | unset / `us-east-1`     |
    /// | `SUPABASE_URL` / `_KEY` / `_BUCKET`      | unset                   |
    /// | `LOG_FORMAT`                             | `text`                  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup` instead of the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let server_defaults = ServerConfig::default();
        let cors_origins = match env.get("CORS_ORIGINS") {
            Some(value) => parse_origins(&value)?,
            None => server_defaults.cors_origins,
        };
        let server = ServerConfig {
            host: env.get("HOST").unwrap_or(server_defaults.host),
            port: env.parse("PORT", server_defaults.port)?,
            cors_origins,
            request_timeout_secs: env
                .parse("REQUEST_TIMEOUT_SECS", server_defaults.request_timeout_secs)?,
            shutdown_timeout_secs: env
                .parse("SHUTDOWN_TIMEOUT_SECS", server_defaults.shutdown_timeout_secs)?,
        };

        let defaults = OrchestratorConfig::default();
        let orchestrator = OrchestratorConfig {
            max_attempts: env.parse("MAX_ATTEMPTS", defaults.max_attempts)?,
            max_concurrent_jobs: env.parse("MAX_CONCURRENT_JOBS", defaults.max_concurrent_jobs)?,
            schedule_interval: Duration::from_millis(env.parse(
                "SCHEDULE_INTERVAL_MS",
                defaults.schedule_interval.as_millis() as u64,
            )?),
            retry_backoff: env.backoff("RETRY_BASE_SECS", "RETRY_MAX_SECS", defaults.retry_backoff)?,
            upload_backoff: env.backoff(
                "UPLOAD_RETRY_BASE_SECS",
                "UPLOAD_RETRY_MAX_SECS",
                defaults.upload_backoff,
            )?,
            max_upload_attempts: env.parse_opt("MAX_UPLOAD_ATTEMPTS")?,
            upload_timeout: env.secs("UPLOAD_TIMEOUT_SECS", defaults.upload_timeout)?,
        };
        if orchestrator.max_attempts == 0 {
            return Err(env.invalid("MAX_ATTEMPTS", "must be at least 1"));
        }
        if orchestrator.max_concurrent_jobs == 0 {
            return Err(env.invalid("MAX_CONCURRENT_JOBS", "must be at least 1"));
        }

        let driver_defaults = DriverConfig::default();
        let driver = DriverConfig {
            poll: env.backoff("POLL_INITIAL_SECS", "POLL_MAX_SECS", driver_defaults.poll)?,
            train_timeout: env.secs("TRAIN_TIMEOUT_SECS", driver_defaults.train_timeout)?,
            image_timeout: env.secs("IMAGE_TIMEOUT_SECS", driver_defaults.image_timeout)?,
            video_timeout: env.secs("VIDEO_TIMEOUT_SECS", driver_defaults.video_timeout)?,
            request_timeout: env.secs(
                "WORKER_REQUEST_TIMEOUT_SECS",
                driver_defaults.request_timeout,
            )?,
            fetch_timeout: env.secs("FETCH_TIMEOUT_SECS", driver_defaults.fetch_timeout)?,
        };

        let registry = RegistryConfig {
            unreachable_after: env
                .parse("UNREACHABLE_AFTER", RegistryConfig::default().unreachable_after)?
                .max(1),
        };

        let workers = match env.get("WORKERS") {
            Some(json) => serde_json::from_str(&json).map_err(|e| ConfigError::Invalid {
                name: "WORKERS",
                value: json.clone(),
                reason: e.to_string(),
            })?,
            None => Vec::new(),
        };

        let storage_defaults = StorageConfig::default();
        let storage = StorageConfig {
            backends: match env.get("STORAGE_BACKENDS") {
                Some(value) => parse_backend_list(&value)?,
                None => storage_defaults.backends,
            },
            local_dir: env
                .get("LOCAL_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(storage_defaults.local_dir),
            s3_bucket: env.get("S3_BUCKET"),
            aws_region: env.get("AWS_REGION").unwrap_or(storage_defaults.aws_region),
            supabase_url: env.get("SUPABASE_URL"),
            supabase_key: env.get("SUPABASE_KEY"),
            supabase_bucket: env.get("SUPABASE_BUCKET"),
        };

        let log_json = match env.get("LOG_FORMAT").as_deref() {
            None | Some("text") => false,
            Some("json") => true,
            Some(_) => return Err(env.invalid("LOG_FORMAT", "must be 'text' or 'json'")),
        };

        Ok(Self {
            server,
            database_url: env.get("DATABASE_URL"),
            orchestrator,
            driver,
            registry,
            probe_timeout: env.secs("PROBE_TIMEOUT_SECS", DEFAULT_PROBE_TIMEOUT)?,
            health_check_interval: env
                .secs("HEALTH_CHECK_INTERVAL_SECS", Duration::from_secs(30))?,
            workers,
            runpod_api_key: env.get("RUNPOD_API_KEY"),
            discovery_interval: env.secs("DISCOVERY_INTERVAL_SECS", Duration::from_secs(60))?,
            storage,
            log_json,
        })
    }
}

fn parse_origins(value: &str) -> Result<Vec<String>, ConfigError> {
    let origins: Vec<String> = value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    for origin in &origins {
        HeaderValue::from_str(origin).map_err(|e| ConfigError::Invalid {
            name: "CORS_ORIGINS",
            value: origin.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(origins)
}

/// Typed access to a variable lookup. Empty values count as unset.
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.parse_opt(name)?.unwrap_or(default))
    }

    fn parse_opt<T>(&self, name: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(name)
            .map(|value| {
                value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                    name,
                    value: value.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn secs(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let secs = self.parse(name, default.as_secs())?;
        if secs == 0 {
            return Err(self.invalid(name, "must be greater than zero"));
        }
        Ok(Duration::from_secs(secs))
    }

    fn backoff(
        &self,
        base: &'static str,
        max: &'static str,
        default: BackoffConfig,
    ) -> Result<BackoffConfig, ConfigError> {
        let initial = self.secs(base, default.initial_delay)?;
        let ceiling = self.secs(max, default.max_delay)?;
        if ceiling < initial {
            return Err(self.invalid(max, &format!("must not be below {base}")));
        }
        Ok(BackoffConfig::new(initial, ceiling))
    }

    fn invalid(&self, name: &'static str, reason: &str) -> ConfigError {
        ConfigError::Invalid {
            name,
            value: self.get(name).unwrap_or_default(),
            reason: reason.to_string(),
        }
    }
}
