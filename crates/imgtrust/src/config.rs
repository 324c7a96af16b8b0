//! Verifier and registry configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default transparency log.
pub const DEFAULT_REKOR_URL: &str = "https://rekor.sigstore.dev";

/// Top-level configuration for [`ImageVerifier`](crate::ImageVerifier).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Deadline for one `verify_image` call, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Transparency log URL passed to the upstream verifier.
    #[serde(default = "default_rekor_url")]
    pub rekor_url: String,

    /// Path or name of the `cosign` executable.
    #[serde(default = "default_cosign_bin")]
    pub cosign_bin: String,

    /// Concurrent images in batch mode.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Registry access.
    #[serde(default)]
    pub registry: RegistryConfig,
}

fn default_timeout() -> u64 {
    45
}

fn default_rekor_url() -> String {
    DEFAULT_REKOR_URL.to_string()
}

fn default_cosign_bin() -> String {
    "cosign".to_string()
}

fn default_max_workers() -> usize {
    4
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            rekor_url: default_rekor_url(),
            cosign_bin: default_cosign_bin(),
            max_workers: default_max_workers(),
            registry: RegistryConfig::default(),
        }
    }
}

impl TrustConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `IMGTRUST_TIMEOUT` | Per-image deadline in seconds (default: 45) |
    /// | `IMGTRUST_REKOR_URL` | Transparency log URL |
    /// | `IMGTRUST_COSIGN_BIN` | cosign executable (default: `cosign`) |
    /// | `IMGTRUST_MAX_WORKERS` | Batch concurrency (default: 4) |
    ///
    /// Registry variables are described on [`RegistryConfig::from_env`].
    pub fn from_env() -> Self {
        Self {
            timeout_secs: env_parse("IMGTRUST_TIMEOUT").unwrap_or_else(default_timeout),
            rekor_url: env_non_empty("IMGTRUST_REKOR_URL").unwrap_or_else(default_rekor_url),
            cosign_bin: env_non_empty("IMGTRUST_COSIGN_BIN").unwrap_or_else(default_cosign_bin),
            max_workers: env_parse("IMGTRUST_MAX_WORKERS")
                .filter(|n| *n > 0)
                .unwrap_or_else(default_max_workers),
            registry: RegistryConfig::from_env(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Set the per-image deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Set the transparency log URL.
    pub fn with_rekor_url(mut self, url: impl Into<String>) -> Self {
        self.rekor_url = url.into();
        self
    }

    /// Set the cosign executable.
    pub fn with_cosign_bin(mut self, bin: impl Into<String>) -> Self {
        self.cosign_bin = bin.into();
        self
    }

    /// Set batch concurrency.
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    /// Set registry access.
    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }
}

/// Registry access configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Request timeout in seconds.
    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Registries reached over plain HTTP.
    #[serde(default)]
    pub insecure_registries: Vec<String>,

    /// Basic-auth username for token exchange.
    #[serde(default)]
    pub username: Option<String>,

    /// Basic-auth password for token exchange.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Pre-issued bearer token, used instead of token exchange.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

fn default_registry_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_registry_timeout(),
            max_retries: default_max_retries(),
            insecure_registries: Vec::new(),
            username: None,
            password: None,
            token: None,
        }
    }
}

impl RegistryConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `IMGTRUST_REGISTRY_TIMEOUT` | Request timeout in seconds (default: 30) |
    /// | `IMGTRUST_REGISTRY_MAX_RETRIES` | Max retries for transient failures (default: 3) |
    /// | `IMGTRUST_INSECURE_REGISTRIES` | Comma-separated hosts reached over HTTP |
    /// | `IMGTRUST_REGISTRY_USERNAME` | Username for token exchange |
    /// | `IMGTRUST_REGISTRY_PASSWORD` | Password for token exchange |
    /// | `IMGTRUST_REGISTRY_TOKEN` | Static bearer token |
    pub fn from_env() -> Self {
        Self {
            timeout_secs: env_parse("IMGTRUST_REGISTRY_TIMEOUT")
                .unwrap_or_else(default_registry_timeout),
            max_retries: env_parse("IMGTRUST_REGISTRY_MAX_RETRIES")
                .unwrap_or_else(default_max_retries),
            insecure_registries: std::env::var("IMGTRUST_INSECURE_REGISTRIES")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            username: env_non_empty("IMGTRUST_REGISTRY_USERNAME"),
            password: env_non_empty("IMGTRUST_REGISTRY_PASSWORD"),
            token: env_non_empty("IMGTRUST_REGISTRY_TOKEN"),
        }
    }

    /// Whether `host` is reached over plain HTTP.
    pub fn is_insecure(&self, host: &str) -> bool {
        self.insecure_registries.iter().any(|h| h == host)
    }

    /// Set basic-auth credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set a static bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Reach `host` over plain HTTP.
    pub fn with_insecure_registry(mut self, host: impl Into<String>) -> Self {
        self.insecure_registries.push(host.into());
        self
    }

    /// Set maximum retries.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
