//! Service configuration.
//!
//! Built once at startup from the environment (after `dotenvy` has loaded any
//! `.env` file) and shared read-only by every component via `Arc<Config>`.
//! Nothing reads the environment after this point.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::worker::WorkerConfig;

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub worker: WorkerConfig,
    pub storage: StorageConfig,
    pub download: DownloadConfig,
}

/// Ingress and bridge listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the public ingress binds to.
    pub host: IpAddr,
    /// Public ingress port.
    pub port: u16,
    /// Address the internal file bridge binds to.
    pub bridge_bind: IpAddr,
    /// Internal file bridge port.
    pub bridge_port: u16,
    /// Host name or IP containers use to reach the bridge.
    pub bridge_host: String,
    /// Root under which per-job staging directories are created.
    pub staging_dir: PathBuf,
    /// Maximum request body for `/convert`.
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 7758,
            bridge_bind: default_bridge_bind(),
            bridge_port: 7759,
            bridge_host: default_bridge_host().to_string(),
            staging_dir: PathBuf::from("tmp"),
            max_upload_bytes: 200 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Base URL a worker container uses to reach the bridge.
    pub fn bridge_base_url(&self) -> String {
        format!("http://{}:{}", self.bridge_host, self.bridge_port)
    }
}

/// On Linux, containers reach the host through the docker bridge gateway,
/// which is not loopback, so the bridge has to listen on all interfaces and
/// rely on per-job tokens. Docker Desktop routes `host.docker.internal` to
/// the host loopback.
fn default_bridge_bind() -> IpAddr {
    if cfg!(target_os = "linux") {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }
}

fn default_bridge_host() -> &'static str {
    if cfg!(target_os = "linux") {
        "172.17.0.1"
    } else {
        "host.docker.internal"
    }
}

/// S3-compatible object storage settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: SecretString,
    pub region: String,
    /// e.g. `http://minio:9000`. No trailing slash.
    pub endpoint_url: String,
    /// Replaces `endpoint_url` in returned download URLs when set.
    pub download_url_prefix: Option<String>,
    /// Expiry recorded in object metadata. Zero disables it.
    pub pdf_expire_time: Duration,
    /// Timeout for a single storage request.
    pub request_timeout: Duration,
}

impl StorageConfig {
    /// Prefix used when building public artifact URLs.
    pub fn public_base(&self) -> &str {
        self.download_url_prefix
            .as_deref()
            .unwrap_or(&self.endpoint_url)
    }
}

/// Settings for fetching `file_url` sources.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Verify TLS certificates of the source host.
    pub ssl_verify: bool,
    pub timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            ssl_verify: false,
            timeout: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Build configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let server_defaults = ServerConfig::default();
        let server = ServerConfig {
            host: env.parse("CONVERT_HOST", server_defaults.host)?,
            port: env.parse("CONVERT_PORT", server_defaults.port)?,
            bridge_bind: env.parse("CONVERT_BRIDGE_BIND", server_defaults.bridge_bind)?,
            bridge_port: env.parse("CONVERT_BRIDGE_PORT", server_defaults.bridge_port)?,
            bridge_host: env
                .get("CONVERT_BRIDGE_HOST")
                .unwrap_or(server_defaults.bridge_host),
            staging_dir: env
                .get("STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or(server_defaults.staging_dir),
            max_upload_bytes: env.mebibytes("MAX_UPLOAD_MB", 200)?,
        };

        let worker_defaults = WorkerConfig::default();
        let worker = WorkerConfig {
            backend: env.parse("WORKER_BACKEND", worker_defaults.backend)?,
            image: env.get("WORKER_IMAGE").unwrap_or(worker_defaults.image),
            container_port: env.parse("WORKER_PORT", worker_defaults.container_port)?,
            ready_timeout: env.secs("WORKER_READY_TIMEOUT_SECS", worker_defaults.ready_timeout)?,
            poll_interval: env.millis("WORKER_POLL_INTERVAL_MS", worker_defaults.poll_interval)?,
            stop_grace: env.secs("WORKER_STOP_GRACE_SECS", worker_defaults.stop_grace)?,
            convert_timeout: env.secs(
                "WORKER_CONVERT_TIMEOUT_SECS",
                worker_defaults.convert_timeout,
            )?,
            engine_path: env
                .get("ENGINE_PATH")
                .map(PathBuf::from)
                .unwrap_or(worker_defaults.engine_path),
            engine_timeout: env.secs("ENGINE_TIMEOUT_SECS", worker_defaults.engine_timeout)?,
            auto_pull_image: env.bool("WORKER_AUTO_PULL", worker_defaults.auto_pull_image)?,
        };

        let storage = StorageConfig {
            bucket: env.require("S3_BUCKET_NAME")?,
            access_key_id: env.require("S3_ACCESS_KEY_ID")?,
            secret_access_key: SecretString::from(env.require("S3_SECRET_ACCESS_KEY")?),
            region: env.get("S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            endpoint_url: env
                .require("S3_ENDPOINT_URL")?
                .trim_end_matches('/')
                .to_string(),
            download_url_prefix: env
                .get("DOWNLOAD_URL_PREFIX")
                .map(|p| p.trim_end_matches('/').to_string())
                .filter(|p| !p.is_empty()),
            pdf_expire_time: env.secs("PDF_EXPIRE_TIME", Duration::ZERO)?,
            request_timeout: env.secs("S3_TIMEOUT_SECS", Duration::from_secs(120))?,
        };

        let download_defaults = DownloadConfig::default();
        let download = DownloadConfig {
            ssl_verify: env.bool("DOWNLOAD_SSL_VERIFY", download_defaults.ssl_verify)?,
            timeout: env.secs("DOWNLOAD_TIMEOUT_SECS", download_defaults.timeout)?,
        };

        Ok(Self {
            server,
            worker,
            storage,
            download,
        })
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::Missing {
            key: key.to_string(),
        })
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                message: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }

    /// Size given in MiB, returned in bytes.
    fn mebibytes(&self, key: &str, default: usize) -> Result<usize, ConfigError> {
        let mb = self.parse(key, default)?;
        mb.checked_mul(1024 * 1024).ok_or_else(|| ConfigError::Invalid {
            key: key.to_string(),
            message: format!("{} MiB does not fit in memory limits", mb),
        })
    }

    /// Only `true`, `1` and `yes` enable a flag; `false`, `0`, `no` disable it.
    fn bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key).map(|v| v.to_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "true" | "1" | "yes") => Ok(true),
            Some(v) if matches!(v.as_str(), "false" | "0" | "no") => Ok(false),
            Some(v) => Err(ConfigError::Invalid {
                key: key.to_string(),
                message: format!("expected true/false, got '{}'", v),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;
    use crate::worker::WorkerBackend;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    const STORAGE: &[(&str, &str)] = &[
        ("S3_BUCKET_NAME", "pdfs"),
        ("S3_ACCESS_KEY_ID", "minio"),
        ("S3_SECRET_ACCESS_KEY", "minio123"),
        ("S3_ENDPOINT_URL", "http://minio:9000/"),
    ];

    #[test]
    fn test_defaults_with_required_storage() {
        let config = Config::from_lookup(lookup(STORAGE)).unwrap();

        assert_eq!(config.server.port, 7758);
        assert_eq!(config.server.bridge_port, 7759);
        assert_eq!(config.worker.backend, WorkerBackend::Subprocess);
        assert_eq!(config.storage.endpoint_url, "http://minio:9000");
        assert_eq!(config.storage.region, "us-east-1");
        assert_eq!(config.storage.secret_access_key.expose_secret(), "minio123");
        assert_eq!(config.storage.pdf_expire_time, Duration::ZERO);
        assert!(!config.download.ssl_verify);
    }

    #[test]
    fn test_missing_bucket_is_reported() {
        let err = Config::from_lookup(lookup(&STORAGE[1..])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { ref key } if key == "S3_BUCKET_NAME"));
    }

    #[test]
    fn test_overrides() {
        let mut pairs = STORAGE.to_vec();
        pairs.extend([
            ("WORKER_BACKEND", "container"),
            ("WORKER_READY_TIMEOUT_SECS", "5"),
            ("WORKER_POLL_INTERVAL_MS", "250"),
            ("DOWNLOAD_SSL_VERIFY", "YES"),
            ("DOWNLOAD_URL_PREFIX", "https://cdn.example.com/"),
            ("PDF_EXPIRE_TIME", "3600"),
            ("MAX_UPLOAD_MB", "10"),
        ]);
        let config = Config::from_lookup(lookup(&pairs)).unwrap();

        assert_eq!(config.worker.backend, WorkerBackend::Container);
        assert_eq!(config.worker.ready_timeout, Duration::from_secs(5));
        assert_eq!(config.worker.poll_interval, Duration::from_millis(250));
        assert!(config.download.ssl_verify);
        assert_eq!(config.storage.public_base(), "https://cdn.example.com");
        assert_eq!(config.storage.pdf_expire_time, Duration::from_secs(3600));
        assert_eq!(config.server.max_upload_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut pairs = STORAGE.to_vec();
        pairs.push(("CONVERT_PORT", "not-a-port"));
        assert!(matches!(
            Config::from_lookup(lookup(&pairs)),
            Err(ConfigError::Invalid { .. })
        ));

        let mut pairs = STORAGE.to_vec();
        pairs.push(("DOWNLOAD_SSL_VERIFY", "maybe"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());

        // usize::MAX MiB overflows the byte count.
        let mut pairs = STORAGE.to_vec();
        pairs.push(("MAX_UPLOAD_MB", "18446744073709551615"));
        match Config::from_lookup(lookup(&pairs)) {
            Err(ConfigError::Invalid { key, .. }) => assert_eq!(key, "MAX_UPLOAD_MB"),
            other => panic!("expected overflow to be rejected, got {:?}", other.map(|_| ())),
        }
    }
}
