use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::Router;
use container_runtime::ContainerRuntime;
use data_model::{Architecture, RunSpec, SandboxId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Build(String, Architecture),
    Run(String),
    Remove(SandboxId),
}

/// Records every call and hands out `sandbox-<n>` ids.
#[derive(Default)]
pub struct MockRuntime {
    calls: Mutex<Vec<RuntimeCall>>,
    run_specs: Mutex<Vec<RunSpec>>,
    runs: AtomicUsize,
    failing_runs: Mutex<HashSet<usize>>,
    failing_containers: Mutex<HashSet<String>>,
    fail_builds: AtomicBool,
    fail_removals: AtomicBool,
    hang_removals: AtomicBool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn run_specs(&self) -> Vec<RunSpec> {
        self.run_specs.lock().unwrap().clone()
    }

    pub fn builds(&self) -> Vec<(String, Architecture)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RuntimeCall::Build(runtime, arch) => Some((runtime, arch)),
                _ => None,
            })
            .collect()
    }

    pub fn removed(&self) -> Vec<SandboxId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RuntimeCall::Remove(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn started(&self) -> Vec<SandboxId> {
        (0..self.runs.load(Ordering::SeqCst))
            .filter(|n| !self.failing_runs.lock().unwrap().contains(n))
            .map(|n| SandboxId::new(format!("sandbox-{}", n)))
            .collect()
    }

    /// Fail the `n`th call to `run_sandbox`, counting from zero.
    pub fn fail_run_on_call(&self, n: usize) {
        self.failing_runs.lock().unwrap().insert(n);
    }

    /// Fail every start of sandboxes whose container name contains `pattern`.
    pub fn fail_runs_matching(&self, pattern: &str) {
        self.failing_containers
            .lock()
            .unwrap()
            .insert(pattern.to_string());
    }

    pub fn fail_builds(&self, fail: bool) {
        self.fail_builds.store(fail, Ordering::SeqCst);
    }

    pub fn fail_removals(&self, fail: bool) {
        self.fail_removals.store(fail, Ordering::SeqCst);
    }

    pub fn hang_removals(&self, hang: bool) {
        self.hang_removals.store(hang, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn build_image(&self, runtime: &str, architecture: Architecture) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push(RuntimeCall::Build(runtime.to_string(), architecture));
        if self.fail_builds.load(Ordering::SeqCst) {
            return Err(anyhow!("build failed for {}", runtime));
        }
        Ok(container_runtime::image_name(runtime, architecture))
    }

    async fn run_sandbox(&self, spec: &RunSpec) -> Result<SandboxId> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(RuntimeCall::Run(spec.container_name.clone()));
            self.run_specs.lock().unwrap().push(spec.clone());
            self.runs.fetch_add(1, Ordering::SeqCst)
        };

        let name_fails = self
            .failing_containers
            .lock()
            .unwrap()
            .iter()
            .any(|p| spec.container_name.contains(p.as_str()));
        if name_fails {
            self.failing_runs.lock().unwrap().insert(n);
        }
        if self.failing_runs.lock().unwrap().contains(&n) {
            return Err(anyhow!("sandbox {} exited", spec.container_name));
        }
        Ok(SandboxId::new(format!("sandbox-{}", n)))
    }

    async fn remove_sandbox(&self, id: &SandboxId) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(RuntimeCall::Remove(id.clone()));
        if self.hang_removals.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_removals.load(Ordering::SeqCst) {
            return Err(anyhow!("no such container {}", id));
        }
        Ok(())
    }
}

/// Serves `router` on an ephemeral local port and returns its address.
pub async fn spawn_upstream(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}
