use std::{
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
    sync::Arc,
};

use ::tracing::{info, info_span, warn, Instrument};
use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use config::RunnerConfig;
use container_runtime::{DockerRuntime, DockerRuntimeConfig};
use service::Service;
use template::load_template;
use watcher::FileWatcher;

mod config;
mod function_host;
mod http_objects;
mod names;
mod ports;
mod routes;
mod service;
mod template;
mod tracing;
mod watcher;
use crate::tracing::setup_tracing;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(name = "llr")]
#[command(version, about = "Run serverless HTTP functions locally", long_about = None)]
struct Cli {
    /// Function template, same as --template.
    #[arg(value_name = "TEMPLATE", conflicts_with = "template")]
    template_path: Option<PathBuf>,

    #[arg(short, long, value_name = "FILE", help = "Path to the function template")]
    template: Option<PathBuf>,

    #[arg(
        short = 'r',
        long,
        value_name = "DIR",
        help = "Directory holding the built function code"
    )]
    build_root: Option<PathBuf>,

    #[arg(long, help = "Host the router listens on")]
    host: Option<String>,

    #[arg(short, long, help = "Port the router listens on")]
    port: Option<u16>,

    #[arg(short, long, value_name = "FILE", help = "Path to config file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Do not restart functions when the build output changes")]
    no_watch: bool,

    #[arg(short, long, action = clap::ArgAction::Count, help = "Increase log verbosity")]
    verbose: u8,
}

impl Cli {
    fn apply(&self, config: &mut RunnerConfig) -> Result<()> {
        if let Some(template) = self.template.as_ref().or(self.template_path.as_ref()) {
            config.template_path = template.clone();
        }
        if let Some(build_root) = &self.build_root {
            config.build_root = build_root.clone();
        }
        if self.no_watch {
            config.watch = false;
        }
        if self.host.is_some() || self.port.is_some() {
            let current = config.listen_socket_addr()?;
            let port = self.port.unwrap_or(current.port());
            config.listen_addr = match &self.host {
                Some(host) => resolve(host, port)?.to_string(),
                None => SocketAddr::new(current.ip(), port).to_string(),
            };
        }
        Ok(())
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving {}", host))?
        .next()
        .ok_or_else(|| anyhow!("{} did not resolve to an address", host))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = RunnerConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config)?;
    config.validate().context("Invalid configuration")?;

    setup_tracing(&config, cli.verbose)?;

    let span = info_span!("lambda-local-runner", env = %config.env);
    start_runner(config).instrument(span).await
}

async fn start_runner(config: RunnerConfig) -> Result<()> {
    info!(
        template = %config.template_path.display(),
        build_root = %config.build_root.display(),
        listen_addr = %config.listen_addr,
        watch = config.watch,
        "Starting lambda local runner"
    );

    let mappings = load_template(&config.template_path)?;
    if mappings.is_empty() {
        bail!(
            "no API endpoints found in {}",
            config.template_path.display()
        );
    }

    let runtime = Arc::new(
        DockerRuntime::new(DockerRuntimeConfig {
            address: config.docker.address.clone(),
            rie_cache_dir: config.docker.rie_cache_dir.clone(),
            log_level: config.docker.log_level.clone(),
            startup_timeout: config.startup_timeout(),
        })
        .context("Failed to create container runtime")?,
    );

    // The watcher must outlive serving.
    let (_watcher, file_events) = if config.watch {
        let (watcher, events) = FileWatcher::start(&watch_root(&config), config.reload_debounce())?;
        (Some(watcher), Some(events))
    } else {
        (None, None)
    };

    Service::new(config, runtime).run(mappings, file_events).await
}

/// The build root, or the template's directory when nothing is built yet.
fn watch_root(config: &RunnerConfig) -> PathBuf {
    if config.build_root.is_dir() {
        return config.build_root.clone();
    }
    let template_dir = match config.template_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    warn!(
        build_root = %config.build_root.display(),
        watching = %template_dir.display(),
        "build root missing, watching the template directory instead"
    );
    template_dir
}
