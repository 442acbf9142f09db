//! Container engine access for function sandboxes.
//!
//! The rest of the runner only sees [`ContainerRuntime`]: build an image, run a
//! sandbox until it is ready (or has failed), remove it. How readiness is
//! detected stays inside the implementation.

mod docker;
mod emulator;

use anyhow::Result;
use async_trait::async_trait;
use data_model::{Architecture, RunSpec, SandboxId};
pub use docker::{DockerRuntime, DockerRuntimeConfig};
pub use emulator::image_name;

/// Port the runtime interface emulator listens on inside every sandbox.
pub const SANDBOX_PORT: u16 = 8080;

/// Fixed invocation path exposed by the runtime interface emulator.
pub const INVOCATION_PATH: &str = "/2015-03-31/functions/function/invocations";

/// Label attached to every sandbox started by the runner.
pub const MANAGED_LABEL: &str = "llr.managed";

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build (or reuse) the sandbox image for a language runtime and returns
    /// its name.
    async fn build_image(&self, runtime: &str, architecture: Architecture) -> Result<String>;

    /// Start a sandbox and wait until it accepts traffic. A sandbox that
    /// reaches a terminal state, or does not become ready in time, is removed
    /// again before the error is returned.
    async fn run_sandbox(&self, spec: &RunSpec) -> Result<SandboxId>;

    /// Remove a sandbox. Removing a sandbox that no longer exists succeeds.
    async fn remove_sandbox(&self, id: &SandboxId) -> Result<()>;
}
