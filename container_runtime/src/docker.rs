use std::{
    collections::HashMap,
    path::PathBuf,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::{
    body_full,
    models::{ContainerCreateBody, ContainerStateStatusEnum, HostConfig, PortBinding},
    query_parameters::{
        BuildImageOptionsBuilder,
        CreateContainerOptions,
        InspectContainerOptions,
        LogsOptions,
        RemoveContainerOptions,
        StartContainerOptions,
    },
    Docker,
};
use bytes::Bytes;
use data_model::{Architecture, RunSpec, SandboxId};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::{
    emulator::{self, RIE_CONTAINER_PATH},
    ContainerRuntime,
    MANAGED_LABEL,
    SANDBOX_PORT,
};

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);
const FAILED_SANDBOX_LOG_LINES: u32 = 50;

#[derive(Debug, Clone)]
pub struct DockerRuntimeConfig {
    /// Docker daemon address. `None` uses the local defaults (`DOCKER_HOST` or
    /// the default socket).
    pub address: Option<String>,
    /// Directory the runtime interface emulator downloads are cached in.
    pub rie_cache_dir: PathBuf,
    /// Log level passed to the emulator inside each sandbox.
    pub log_level: String,
    /// How long a sandbox may take to reach the running state.
    pub startup_timeout: Duration,
}

pub struct DockerRuntime {
    docker: Docker,
    http: reqwest::Client,
    config: DockerRuntimeConfig,
}

impl DockerRuntime {
    pub fn new(config: DockerRuntimeConfig) -> Result<Self> {
        let docker = match &config.address {
            Some(address) => connect_with_address(address)?,
            None => Docker::connect_with_local_defaults()
                .context("Failed to connect to Docker daemon")?,
        };
        Ok(Self {
            docker,
            http: reqwest::Client::new(),
            config,
        })
    }

    async fn logs_tail(&self, id: &str) -> String {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            tail: FAILED_SANDBOX_LOG_LINES.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(line) => output.push_str(&line.to_string()),
                Err(e) => {
                    debug!(container_id = %id, error = %e, "could not read sandbox logs");
                    break;
                }
            }
        }
        output
    }

    /// Poll the engine until the container is running or has stopped for
    /// good.
    async fn wait_until_running(&self, id: &str) -> Result<()> {
        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            let inspect = self
                .docker
                .inspect_container(id, None::<InspectContainerOptions>)
                .await
                .context("Failed to inspect sandbox")?;
            let status = inspect.state.and_then(|s| s.status);

            match status {
                Some(ContainerStateStatusEnum::RUNNING) => return Ok(()),
                Some(ContainerStateStatusEnum::EXITED) |
                Some(ContainerStateStatusEnum::DEAD) |
                Some(ContainerStateStatusEnum::REMOVING) => {
                    let logs = self.logs_tail(id).await;
                    bail!(
                        "sandbox stopped before becoming ready (status {:?}): {}",
                        status,
                        logs.trim()
                    );
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                bail!(
                    "sandbox not running after {:?} (status {:?})",
                    self.config.startup_timeout,
                    status
                );
            }
            tokio::time::sleep(READINESS_POLL_INTERVAL).await;
        }
    }
}

fn connect_with_address(address: &str) -> Result<Docker> {
    let docker = if address.starts_with("http://") || address.starts_with("tcp://") {
        let addr = address
            .trim_start_matches("http://")
            .trim_start_matches("tcp://");
        Docker::connect_with_http(
            &format!("http://{}", addr),
            120,
            bollard::API_DEFAULT_VERSION,
        )
        .context("Failed to connect to Docker daemon via HTTP")?
    } else {
        let socket_path = address.trim_start_matches("unix://");
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .context("Failed to connect to Docker daemon via Unix socket")?
    };
    Ok(docker)
}

/// Environment of a sandbox: the function's own variables, then the
/// variables the emulator reads. The latter win on conflict.
pub(crate) fn sandbox_environment(spec: &RunSpec) -> Vec<String> {
    let mut env: Vec<String> = spec
        .environment
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    env.extend([
        "AWS_LAMBDA_FUNCTION_VERSION=$LATEST".to_string(),
        format!("AWS_LAMBDA_FUNCTION_HANDLER={}", spec.handler),
        format!("AWS_LAMBDA_FUNCTION_NAME={}", spec.function_name),
        format!("AWS_LAMBDA_FUNCTION_MEMORY_SIZE={}", spec.memory_size_mb),
        format!("AWS_LAMBDA_FUNCTION_TIMEOUT={}", spec.timeout_secs),
    ]);
    env
}

fn container_body(spec: &RunSpec, log_level: &str) -> ContainerCreateBody {
    let container_port = format!("{}/tcp", SANDBOX_PORT);
    let labels = HashMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        ("llr.function".to_string(), spec.function_name.clone()),
    ]);

    let host_config = HostConfig {
        port_bindings: Some(HashMap::from([(
            container_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(spec.port.to_string()),
            }]),
        )])),
        binds: Some(vec![format!(
            "{}:/var/task:ro",
            spec.source_path.display()
        )]),
        ..Default::default()
    };

    ContainerCreateBody {
        image: Some(spec.image_name.clone()),
        entrypoint: Some(vec![
            RIE_CONTAINER_PATH.to_string(),
            "--log-level".to_string(),
            log_level.to_string(),
        ]),
        env: Some(sandbox_environment(spec)),
        labels: Some(labels),
        exposed_ports: Some(HashMap::from([(container_port, HashMap::new())])),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(&self, runtime: &str, architecture: Architecture) -> Result<String> {
        let image_name = emulator::image_name(runtime, architecture);
        let emulator_path =
            emulator::fetch(&self.http, &self.config.rie_cache_dir, architecture).await?;
        let emulator_bytes = tokio::fs::read(&emulator_path)
            .await
            .with_context(|| format!("reading emulator {}", emulator_path.display()))?;
        let context = emulator::build_context(runtime, &emulator_bytes)?;

        info!(image = %image_name, platform = architecture.platform(), "building sandbox image");
        let start = Instant::now();

        let options = BuildImageOptionsBuilder::default()
            .dockerfile("Dockerfile")
            .t(&image_name)
            .platform(architecture.platform())
            .rm(true)
            .build();
        let mut stream =
            self.docker
                .build_image(options, None, Some(body_full(Bytes::from(context))));

        while let Some(result) = stream.next().await {
            let build_info = result.with_context(|| format!("building image {}", image_name))?;
            if let Some(detail) = build_info.error_detail {
                bail!(
                    "building image {}: {}",
                    image_name,
                    detail.message.unwrap_or_default()
                );
            }
            if let Some(line) = build_info.stream {
                let line = line.trim();
                if !line.is_empty() {
                    debug!(image = %image_name, "{}", line);
                }
            }
        }

        info!(
            image = %image_name,
            duration_ms = %start.elapsed().as_millis(),
            "sandbox image ready"
        );
        Ok(image_name)
    }

    async fn run_sandbox(&self, spec: &RunSpec) -> Result<SandboxId> {
        let create_options = CreateContainerOptions {
            name: Some(spec.container_name.clone()),
            platform: String::new(),
        };

        debug!(container_name = %spec.container_name, "creating sandbox");
        let created = self
            .docker
            .create_container(
                Some(create_options),
                container_body(spec, &self.config.log_level),
            )
            .await
            .with_context(|| format!("creating sandbox {}", spec.container_name))?;
        let id = SandboxId::new(created.id);

        let ready = async {
            self.docker
                .start_container(id.get(), None::<StartContainerOptions>)
                .await
                .context("starting sandbox")?;
            self.wait_until_running(id.get()).await
        }
        .await;

        if let Err(e) = ready {
            if let Err(remove_err) = self.remove_sandbox(&id).await {
                warn!(
                    container_name = %spec.container_name,
                    error = %remove_err,
                    "could not remove sandbox that failed to start"
                );
            }
            return Err(e.context(format!("running sandbox {}", spec.container_name)));
        }

        info!(
            container_name = %spec.container_name,
            container_id = %id,
            port = spec.port,
            "sandbox running"
        );
        Ok(id)
    }

    async fn remove_sandbox(&self, id: &SandboxId) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id.get(), Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id = %id, "sandbox already gone");
                Ok(())
            }
            Err(e) => Err(e).context("Failed to remove sandbox"),
        }
    }
}
