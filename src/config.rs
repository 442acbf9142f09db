use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{
    function_host::DEFAULT_REMOVAL_TIMEOUT,
    ports::DEFAULT_BASE_PORT,
    routes::DEFAULT_SHUTDOWN_TIMEOUT,
};

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "LLR_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Docker daemon address. Supports:
    /// - Unix socket: `unix:///var/run/docker.sock` or `/var/run/docker.sock`
    /// - HTTP: `http://localhost:2375` or `tcp://localhost:2375`
    ///
    /// If not specified, uses Docker's default socket location.
    pub address: Option<String>,
    /// Where downloaded runtime interface emulator binaries are kept.
    pub rie_cache_dir: PathBuf,
    /// Log level of the emulator inside each sandbox.
    pub log_level: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            address: None,
            rie_cache_dir: std::env::temp_dir().join("lambda-local-runner"),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub env: String,
    /// Function template declaring the endpoints.
    pub template_path: PathBuf,
    /// Directory holding one built code directory per function.
    pub build_root: PathBuf,
    pub listen_addr: String,
    /// Host the sandboxes' published ports are reached on.
    pub sandbox_host: String,
    /// Sandbox ports are allocated from `base_port + 1` upwards.
    pub base_port: u16,
    pub startup_timeout_secs: u64,
    pub removal_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    /// Restart every sandbox when the build root changes.
    pub watch: bool,
    pub reload_debounce_ms: u64,
    pub docker: DockerConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            env: LOCAL_ENV.to_string(),
            template_path: PathBuf::from("template.yaml"),
            build_root: PathBuf::from(".aws-sam/build"),
            listen_addr: "127.0.0.1:8080".to_string(),
            sandbox_host: "127.0.0.1".to_string(),
            base_port: DEFAULT_BASE_PORT,
            startup_timeout_secs: 60,
            removal_timeout_secs: DEFAULT_REMOVAL_TIMEOUT.as_secs(),
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT.as_secs(),
            watch: true,
            reload_debounce_ms: 500,
            docker: DockerConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Defaults, then the YAML file if given, then `LLR_*` environment
    /// variables (`LLR_DOCKER__LOG_LEVEL` for nested keys).
    pub fn load(path: Option<&Path>) -> Result<RunnerConfig> {
        let yaml = path
            .map(|path| {
                std::fs::read_to_string(path)
                    .map_err(|e| anyhow!("reading config {}: {}", path.display(), e))
            })
            .transpose()?;
        RunnerConfig::from_yaml(yaml.as_deref())
    }

    pub fn from_yaml(yaml: Option<&str>) -> Result<RunnerConfig> {
        let mut figment = Figment::from(Serialized::defaults(RunnerConfig::default()));
        if let Some(yaml) = yaml {
            figment = figment.merge(Yaml::string(yaml));
        }
        let config: RunnerConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        if self.base_port == 0 || self.base_port == u16::MAX {
            return Err(anyhow!("invalid base port: {}", self.base_port));
        }
        if self.sandbox_host.is_empty() {
            return Err(anyhow!("sandbox_host must not be empty"));
        }
        if self.startup_timeout_secs == 0 ||
            self.removal_timeout_secs == 0 ||
            self.shutdown_timeout_secs == 0
        {
            return Err(anyhow!("timeouts must be greater than zero"));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .map_err(|_| anyhow!("invalid listen address: {}", self.listen_addr))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn removal_timeout(&self) -> Duration {
        Duration::from_secs(self.removal_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn reload_debounce(&self) -> Duration {
        Duration::from_millis(self.reload_debounce_ms)
    }
}
