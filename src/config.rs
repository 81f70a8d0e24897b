use serde::Deserialize;
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Global configuration for the preview host
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Instance capacity, port range and lifecycle settings
    #[serde(default)]
    pub preview: PreviewConfig,

    /// App definition storage
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Base URL used to build preview links (default: http://localhost:{port})
    pub public_url: Option<String>,

    /// Bearer token for admin endpoints (delete, instance listing)
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum idle upstream connections per instance (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Upper bound for a routed request, rehydration included (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Largest request body buffered for forwarding (default: 10 MiB)
    #[serde(default = "default_max_request_body")]
    pub max_request_body_bytes: usize,

    /// Largest accepted creation payload (default: 1 MiB)
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Base URL for preview links, without a trailing slash
    pub fn public_base_url(&self) -> String {
        match self.public_url {
            Some(ref url) => url.trim_end_matches('/').to_string(),
            None => format!("http://localhost:{}", self.port),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            public_url: None,
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            max_request_body_bytes: default_max_request_body(),
            max_payload_bytes: default_max_payload(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PreviewConfig {
    /// Maximum number of instances alive at once (must be >= 1)
    #[serde(default = "default_max_instances")]
    pub max_concurrent_instances: usize,

    /// First port handed out to instances (inclusive)
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Last port handed out to instances (inclusive)
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Host instances bind to and the proxy connects to
    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    /// Time-to-live of a preview in seconds
    #[serde(default = "default_ttl")]
    pub default_ttl_secs: u64,

    /// How long a launch may take before it is declared failed
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Readiness polling interval for process instances in milliseconds
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,

    /// Readiness path polled on process instances
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Bounded wait when stopping an instance before it is killed
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Interval of the session/storage sweep and overdue-instance check
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// How long an expired session stays queryable before it is dropped
    #[serde(default = "default_session_retention")]
    pub session_retention_secs: u64,

    /// Command used to run apps that ship server-side code
    pub backend: Option<BackendCommand>,
}

/// Command that runs an app's server-side code
///
/// # Security Warning
///
/// The command runs user-supplied code with the permissions of the preview
/// host. Instances are not sandboxed.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendCommand {
    /// Executable, e.g. "node"
    pub command: String,

    /// Arguments placed before the entrypoint path
    #[serde(default)]
    pub args: Vec<String>,

    /// File name the backend code is written to (default: server.js)
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
}

impl BackendCommand {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            entrypoint: default_entrypoint(),
        }
    }
}

impl PreviewConfig {
    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.port_range_start..=self.port_range_end
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }

    /// Validate the preview configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_concurrent_instances == 0 {
            errors.push("preview: 'max_concurrent_instances' must be at least 1".to_string());
        }
        if self.port_range_start == 0 {
            errors.push("preview: 'port_range_start' must be greater than 0".to_string());
        }
        if self.port_range_start > self.port_range_end {
            errors.push(format!(
                "preview: port range {}-{} is empty",
                self.port_range_start, self.port_range_end
            ));
        }
        if self.default_ttl_secs == 0 {
            errors.push("preview: 'default_ttl_secs' must be greater than 0".to_string());
        }
        if self.startup_timeout_secs == 0 {
            errors.push("preview: 'startup_timeout_secs' must be greater than 0".to_string());
        }
        if self.health_check_interval_ms == 0 {
            errors.push("preview: 'health_check_interval_ms' must be greater than 0".to_string());
        }
        if self.sweep_interval_secs == 0 {
            errors.push("preview: 'sweep_interval_secs' must be greater than 0".to_string());
        }
        if let Some(ref backend) = self.backend {
            if backend.command.trim().is_empty() {
                errors.push("preview.backend: 'command' must not be empty".to_string());
            }
            if backend.entrypoint.contains('/') || backend.entrypoint.contains("..") {
                errors.push(format!(
                    "preview.backend: entrypoint '{}' must be a plain file name",
                    backend.entrypoint
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            max_concurrent_instances: default_max_instances(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            listen_host: default_listen_host(),
            default_ttl_secs: default_ttl(),
            startup_timeout_secs: default_startup_timeout(),
            health_check_interval_ms: default_health_interval(),
            health_path: default_health_path(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            sweep_interval_secs: default_sweep_interval(),
            session_retention_secs: default_session_retention(),
            backend: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// SQLite database path; definitions are kept in memory when unset
    pub path: Option<String>,
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per instance
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_request_body() -> usize {
    10 * 1024 * 1024
}

fn default_max_payload() -> usize {
    1024 * 1024
}

fn default_max_instances() -> usize {
    50
}

fn default_port_range_start() -> u16 {
    20000
}

fn default_port_range_end() -> u16 {
    20999
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_ttl() -> u64 {
    3600 // 1 hour
}

fn default_startup_timeout() -> u64 {
    15
}

fn default_health_interval() -> u64 {
    100 // 100ms
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_session_retention() -> u64 {
    3600
}

fn default_entrypoint() -> String {
    "server.js".to_string()
}

/// Environment variable overriding `preview.max_concurrent_instances`
pub const ENV_MAX_INSTANCES: &str = "PREVIEW_MAX_INSTANCES";
/// Environment variable overriding the port range, formatted `start-end`
pub const ENV_PORT_RANGE: &str = "PREVIEW_PORT_RANGE";
/// Environment variable overriding `preview.default_ttl_secs`
pub const ENV_TTL_SECS: &str = "PREVIEW_TTL_SECS";

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides for the core capacity knobs
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MAX_INSTANCES) {
            self.preview.max_concurrent_instances = value
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("{}: invalid value '{}': {}", ENV_MAX_INSTANCES, value, e))?;
        }

        if let Some(value) = lookup(ENV_PORT_RANGE) {
            let (start, end) = value
                .split_once('-')
                .ok_or_else(|| anyhow::anyhow!("{}: expected 'start-end', got '{}'", ENV_PORT_RANGE, value))?;
            self.preview.port_range_start = start
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("{}: invalid start '{}': {}", ENV_PORT_RANGE, start, e))?;
            self.preview.port_range_end = end
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("{}: invalid end '{}': {}", ENV_PORT_RANGE, end, e))?;
        }

        if let Some(value) = lookup(ENV_TTL_SECS) {
            self.preview.default_ttl_secs = value
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("{}: invalid value '{}': {}", ENV_TTL_SECS, value, e))?;
        }

        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(preview_errors) = self.preview.validate() {
            errors.extend(preview_errors);
        }

        if self.server.max_payload_bytes == 0 {
            errors.push("server: 'max_payload_bytes' must be greater than 0".to_string());
        }
        if self.server.request_timeout_secs == 0 {
            errors.push("server: 'request_timeout_secs' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        // Rehydrating requests give up first; their launches still finish
        if self.server.request_timeout_secs <= self.preview.startup_timeout_secs {
            warn!(
                request_timeout_secs = self.server.request_timeout_secs,
                startup_timeout_secs = self.preview.startup_timeout_secs,
                "Request timeout does not exceed startup timeout, slow rehydrations will answer 504"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 9090
bind = "127.0.0.1"
public_url = "https://preview.example.com/"
request_timeout_secs = 10

[preview]
max_concurrent_instances = 4
port_range_start = 30000
port_range_end = 30010
default_ttl_secs = 600

[preview.backend]
command = "node"
args = ["--enable-source-maps"]

[storage]
path = "/var/lib/previewgate/apps.db"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.public_base_url(), "https://preview.example.com");
        assert_eq!(config.server.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.preview.max_concurrent_instances, 4);
        assert_eq!(config.preview.port_range(), 30000..=30010);
        assert_eq!(config.preview.default_ttl(), Duration::from_secs(600));

        let backend = config.preview.backend.as_ref().unwrap();
        assert_eq!(backend.command, "node");
        assert_eq!(backend.entrypoint, "server.js");
        assert_eq!(
            config.storage.path.as_deref(),
            Some("/var/lib/previewgate/apps.db")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.public_base_url(), "http://localhost:8080");
        assert_eq!(config.preview.max_concurrent_instances, 50);
        assert_eq!(config.preview.port_range(), 20000..=20999);
        assert_eq!(config.preview.listen_host, "127.0.0.1");
        assert_eq!(config.preview.default_ttl_secs, 3600);
        assert!(config.preview.backend.is_none());
        assert!(config.storage.path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let toml = r#"
[preview]
max_concurrent_instances = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_concurrent_instances"));
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let toml = r#"
[server]
request_timeout_secs = 0

[preview]
startup_timeout_secs = 0
health_check_interval_ms = 0
sweep_interval_secs = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("request_timeout_secs"));
        assert!(err.contains("startup_timeout_secs"));
        assert!(err.contains("health_check_interval_ms"));
        assert!(err.contains("sweep_interval_secs"));
    }

    #[test]
    fn test_short_request_timeout_is_allowed() {
        let mut config = Config::default();
        config.server.request_timeout_secs = 5;
        config.preview.startup_timeout_secs = 15;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[preview]
port_range_start = 5000
port_range_end = 4000
default_ttl_secs = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("port range 5000-4000 is empty"));
        assert!(err.contains("default_ttl_secs"));
    }

    #[test]
    fn test_validate_backend_entrypoint() {
        let mut config = Config::default();
        let mut backend = BackendCommand::new("node");
        backend.entrypoint = "../escape.js".to_string();
        config.preview.backend = Some(backend);

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("plain file name"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_MAX_INSTANCES, "3"),
            (ENV_PORT_RANGE, "41000-41009"),
            (ENV_TTL_SECS, "120"),
        ]);

        let mut config = Config::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.preview.max_concurrent_instances, 3);
        assert_eq!(config.preview.port_range(), 41000..=41009);
        assert_eq!(config.preview.default_ttl_secs, 120);
    }

    #[test]
    fn test_env_override_rejects_malformed_range() {
        let mut config = Config::default();
        let result = config.apply_env_overrides(|key| {
            (key == ENV_PORT_RANGE).then(|| "41000".to_string())
        });
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("start-end"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[preview]\nmax_concurrent_instances = 2\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert!(config.preview.max_concurrent_instances >= 1);
    }
}
