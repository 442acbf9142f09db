use std::{
    collections::{BTreeSet, HashMap},
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use container_runtime::ContainerRuntime;
use data_model::{Architecture, HandlerDefinition, RunSpec};
use futures::future::join_all;
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    config::RunnerConfig,
    function_host::{FunctionHost, HostHandle, HostState, Instruction},
    names::NameGenerator,
    ports::PortAllocator,
    routes::RequestRouter,
    template::EndpointMapping,
    watcher::{FileEvent, FileEventKind},
};

type HostTasks = JoinSet<(String, Result<()>)>;

/// Turns endpoint mappings into running function hosts behind one router.
pub struct Service {
    config: RunnerConfig,
    runtime: Arc<dyn ContainerRuntime>,
    ports: PortAllocator,
    names: NameGenerator,
}

impl Service {
    pub fn new(config: RunnerConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let ports = PortAllocator::new(config.base_port);
        Self {
            config,
            runtime,
            ports,
            names: NameGenerator::from_os_rng(),
        }
    }

    pub fn with_names(mut self, names: NameGenerator) -> Self {
        self.names = names;
        self
    }

    /// Bootstrap, then serve until a shutdown signal arrives or a host
    /// fails. Signals received during bootstrap are honoured once it ends.
    pub async fn run(
        &self,
        mappings: Vec<EndpointMapping>,
        file_events: Option<mpsc::Receiver<FileEvent>>,
    ) -> Result<()> {
        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                match wait_for_shutdown_signal().await {
                    Ok(signal_name) => info!(signal = signal_name, "Shutdown signal received"),
                    Err(e) => error!(error = ?e, "could not listen for shutdown signals"),
                }
                cancel.cancel();
            }
        });

        let deployment = self.bootstrap(mappings).await?;
        info!(addr = %deployment.addr(), functions = deployment.handles.len(), "serving");
        deployment.serve(file_events, cancel).await
    }

    /// Build images, start every sandbox and begin serving. Either every
    /// host is running when this returns, or none is.
    pub async fn bootstrap(&self, mappings: Vec<EndpointMapping>) -> Result<Deployment> {
        let images = self.build_images(&mappings).await?;
        let router = RequestRouter::new(
            self.config.listen_socket_addr()?,
            &self.config.sandbox_host,
            self.config.shutdown_timeout(),
        );

        let mut hosts = Vec::with_capacity(mappings.len());
        let mut handles = Vec::with_capacity(mappings.len());
        for mapping in &mappings {
            let image_name = images
                .get(&mapping.definition.image_key())
                .ok_or_else(|| anyhow!("no image built for {}", mapping.definition.logical_id))?;
            let port = self.ports.allocate()?;
            let run_spec = RunSpec::new(
                self.names.generate(&mapping.endpoint, &mapping.definition),
                image_name.clone(),
                &mapping.definition,
                self.source_path(&mapping.definition)?,
                port,
            );
            router.add_route(&mapping.endpoint.method, &mapping.endpoint.url_path, port)?;

            let (host, handle) = FunctionHost::new(
                self.runtime.clone(),
                run_spec,
                self.config.removal_timeout(),
            );
            hosts.push((mapping.endpoint.to_string(), host));
            handles.push(handle);
        }

        info!(functions = hosts.len(), "starting sandboxes");
        let results = join_all(hosts.iter_mut().map(|(_, host)| host.start())).await;
        if let Some(err) = results.into_iter().find_map(Result::err) {
            error!(error = ?err, "could not start every sandbox, cleaning up");
            shut_down_started(hosts, handles).await;
            return Err(err);
        }

        let mut tasks = JoinSet::new();
        for (endpoint, host) in hosts {
            let container_name = host.run_spec().container_name.clone();
            let span = info_span!(
                "function_host",
                container_name = %container_name,
                endpoint = %endpoint
            );
            tasks.spawn(
                async move {
                    let result = host.process_instructions().await;
                    (container_name, result)
                }
                .instrument(span),
            );
        }

        let addr = match router.run().await {
            Ok(addr) => addr,
            Err(e) => {
                broadcast(&handles, Instruction::Shutdown).await;
                let _ = wait_for_hosts(&mut tasks).await;
                return Err(e);
            }
        };

        for mapping in &mappings {
            info!("mounted {} at http://{}{}", mapping.endpoint, addr, mapping.endpoint.url_path);
        }
        Ok(Deployment {
            addr,
            router,
            handles,
            tasks,
        })
    }

    /// One image per distinct runtime and architecture.
    async fn build_images(
        &self,
        mappings: &[EndpointMapping],
    ) -> Result<HashMap<(String, Architecture), String>> {
        let keys: BTreeSet<(String, Architecture)> = mappings
            .iter()
            .map(|m| m.definition.image_key())
            .collect();

        let builds = keys.iter().map(|(runtime, architecture)| async move {
            let image = self
                .runtime
                .build_image(runtime, *architecture)
                .await
                .with_context(|| format!("building image for {} {}", runtime, architecture))?;
            Ok::<_, anyhow::Error>(((runtime.clone(), *architecture), image))
        });
        join_all(builds).await.into_iter().collect()
    }

    /// The function's build output, falling back to its code directory next
    /// to the template.
    fn source_path(&self, definition: &HandlerDefinition) -> Result<PathBuf> {
        let built = self.config.build_root.join(&definition.logical_id);
        if built.is_dir() {
            return built
                .canonicalize()
                .with_context(|| format!("resolving {}", built.display()));
        }
        if let Some(code_uri) = &definition.code_uri {
            let template_dir = self
                .config
                .template_path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_default();
            let code_dir = template_dir.join(code_uri);
            if code_dir.is_dir() {
                debug!(
                    function = %definition.logical_id,
                    path = %code_dir.display(),
                    "no build output, using code directory"
                );
                return code_dir
                    .canonicalize()
                    .with_context(|| format!("resolving {}", code_dir.display()));
            }
        }
        bail!(
            "no code for function {}: expected build output in {}",
            definition.logical_id,
            built.display()
        )
    }
}

/// Hosts that reached a running sandbox are shut down and awaited. The rest
/// are already stopped.
async fn shut_down_started(hosts: Vec<(String, FunctionHost)>, handles: Vec<HostHandle>) {
    let started = hosts
        .into_iter()
        .zip(handles)
        .filter(|((_, host), _)| matches!(host.state(), HostState::Running { .. }));
    join_all(started.map(|((endpoint, host), handle)| async move {
        if let Err(e) = handle.shutdown().await {
            warn!(endpoint = %endpoint, error = ?e, "could not stop host");
            return;
        }
        if let Err(e) = host.process_instructions().await {
            warn!(endpoint = %endpoint, error = ?e, "error shutting down host");
        }
    }))
    .await;
}

async fn broadcast(handles: &[HostHandle], instruction: Instruction) {
    join_all(handles.iter().map(|handle| async move {
        let sent = match instruction {
            Instruction::Restart => handle.restart(),
            Instruction::Shutdown => handle.shutdown().await,
        };
        if let Err(e) = sent {
            debug!(container_name = handle.container_name(), error = %e, "instruction not delivered");
        }
    }))
    .await;
}

/// Wait for every host task, logging the ones that failed. Returns the first
/// failure.
async fn wait_for_hosts(tasks: &mut HostTasks) -> Result<()> {
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let err = match joined {
            Ok((_, Ok(()))) => continue,
            Ok((container_name, Err(e))) => {
                error!(container_name = %container_name, error = ?e, "host failed");
                e
            }
            Err(e) => {
                error!(error = %e, "host task panicked");
                anyhow!(e)
            }
        };
        first_error.get_or_insert(err);
    }
    first_error.map_or(Ok(()), Err)
}

async fn wait_for_shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigquit = signal(SignalKind::quit()).context("Failed to install SIGQUIT handler")?;

        let signal_name = tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = sigquit.recv() => "SIGQUIT",
        };
        Ok(signal_name)
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for ctrl_c")?;
        Ok("SIGINT")
    }
}

async fn next_file_event(events: &mut Option<mpsc::Receiver<FileEvent>>) -> Option<FileEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

/// Running hosts behind a serving router.
pub struct Deployment {
    addr: SocketAddr,
    router: RequestRouter,
    handles: Vec<HostHandle>,
    tasks: HostTasks,
}

impl Deployment {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until `cancel` fires or a host fails. Writes under the watched
    /// tree restart every host. Every sandbox is removed before this returns.
    pub async fn serve(
        mut self,
        file_events: Option<mpsc::Receiver<FileEvent>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut file_events = file_events;
        let mut result = Ok(());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                event = next_file_event(&mut file_events) => match event {
                    Some(FileEvent { path, kind: FileEventKind::Write }) => {
                        info!(path = %path.display(), "change detected, restarting functions");
                        broadcast(&self.handles, Instruction::Restart).await;
                    }
                    Some(event) => {
                        debug!(path = %event.path.display(), "ignoring file event");
                    }
                    None => {
                        debug!("file events closed");
                        file_events = None;
                    }
                },
                Some(joined) = self.tasks.join_next() => match joined {
                    Ok((container_name, Ok(()))) => {
                        warn!(container_name = %container_name, "host stopped unexpectedly");
                    }
                    Ok((container_name, Err(e))) => {
                        error!(container_name = %container_name, error = ?e, "host failed, shutting down");
                        result = Err(e);
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "host task panicked, shutting down");
                        result = Err(anyhow!(e));
                        break;
                    }
                },
            }
        }

        broadcast(&self.handles, Instruction::Shutdown).await;
        let hosts_result = wait_for_hosts(&mut self.tasks).await;
        let not_stopped = self
            .handles
            .iter()
            .filter(|h| h.state() != HostState::Stopped)
            .count();
        if not_stopped > 0 {
            warn!(hosts = not_stopped, "hosts exited without reaching the stopped state");
        } else {
            info!("all sandboxes stopped");
        }

        if let Err(e) = self.router.shutdown().await {
            error!(error = ?e, "error shutting down router");
        }
        result.and(hosts_result)
    }
}
