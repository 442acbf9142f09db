use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    path::PathBuf,
    str::FromStr,
};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

/// An (HTTP method, URL path) pair exposed to clients.
///
/// The method is stored lower case so `GET` and `get` name the same route.
/// The path is kept verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    pub method: String,
    pub url_path: String,
}

impl Endpoint {
    pub fn new(method: &str, url_path: &str) -> Self {
        Self {
            method: method.to_lowercase(),
            url_path: url_path.to_string(),
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method.to_uppercase(), self.url_path)
    }
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
    AsRefStr, EnumString,
)]
pub enum Architecture {
    #[default]
    #[serde(rename = "x86_64")]
    #[strum(serialize = "x86_64")]
    X86_64,
    #[serde(rename = "arm64")]
    #[strum(serialize = "arm64")]
    Arm64,
}

impl Architecture {
    /// Parses the architecture names used by function templates.
    pub fn parse(arch: &str) -> Result<Self> {
        Architecture::from_str(arch)
            .map_err(|_| anyhow!("could not determine platform from architecture {}", arch))
    }

    /// Container engine platform string for images of this architecture.
    pub fn platform(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "linux/amd64",
            Architecture::Arm64 => "linux/arm64",
        }
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// Metadata identifying the function implementation behind an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandlerDefinition {
    pub logical_id: String,
    pub architecture: Architecture,
    pub runtime: String,
    pub handler: String,
    /// Directory of the function code relative to the template, if declared.
    pub code_uri: Option<String>,
    pub memory_size_mb: u32,
    pub timeout_secs: u32,
    pub environment: BTreeMap<String, String>,
}

impl HandlerDefinition {
    pub const DEFAULT_MEMORY_SIZE_MB: u32 = 128;
    pub const DEFAULT_TIMEOUT_SECS: u32 = 3;

    pub fn new(logical_id: &str, runtime: &str, handler: &str) -> Self {
        Self {
            logical_id: logical_id.to_string(),
            architecture: Architecture::default(),
            runtime: runtime.to_string(),
            handler: handler.to_string(),
            code_uri: None,
            memory_size_mb: Self::DEFAULT_MEMORY_SIZE_MB,
            timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
            environment: BTreeMap::new(),
        }
    }

    /// Key used to share one sandbox image between functions.
    pub fn image_key(&self) -> (String, Architecture) {
        (self.runtime.clone(), self.architecture)
    }
}

/// Everything needed to start one sandbox. Built once per function host and
/// reused verbatim on every restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSpec {
    pub container_name: String,
    pub image_name: String,
    pub function_name: String,
    pub handler: String,
    pub source_path: PathBuf,
    pub port: u16,
    pub memory_size_mb: u32,
    pub timeout_secs: u32,
    pub environment: BTreeMap<String, String>,
}

impl RunSpec {
    pub fn new(
        container_name: String,
        image_name: String,
        definition: &HandlerDefinition,
        source_path: PathBuf,
        port: u16,
    ) -> Self {
        Self {
            container_name,
            image_name,
            function_name: definition.logical_id.clone(),
            handler: definition.handler.clone(),
            source_path,
            port,
            memory_size_mb: definition.memory_size_mb,
            timeout_secs: definition.timeout_secs,
            environment: definition.environment.clone(),
        }
    }
}

/// Identifier the container engine assigned to a running sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct SandboxId(String);

impl SandboxId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SandboxId {
    fn from(value: &str) -> Self {
        Self::new(value.to_string())
    }
}

impl Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
