//! Supervisor for the sandbox behind one endpoint.
//!
//! A [`FunctionHost`] is driven by a single task: it starts the sandbox, then
//! services [`Instruction`]s from its queue in order until it is told to shut
//! down. Everyone else talks to it through a cloneable [`HostHandle`].

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Result};
use container_runtime::ContainerRuntime;
use data_model::{RunSpec, SandboxId};
use strum::{AsRefStr, Display};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch,
};
use tracing::{debug, info, warn};

/// Instructions queued per host. Shutdowns wait once this many are pending,
/// restarts are coalesced.
pub const INSTRUCTION_QUEUE_CAPACITY: usize = 10;

pub const DEFAULT_REMOVAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Instruction {
    Restart,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, AsRefStr)]
pub enum HostState {
    /// No sandbox has been started yet.
    Created,
    /// The sandbox is up and owned by this host.
    Running { sandbox_id: SandboxId },
    /// The old sandbox is being replaced.
    Restarting,
    /// The sandbox is being removed for good.
    ShuttingDown,
    Stopped,
}

impl HostState {
    // Valid transitions:
    //   Created      → Running | Stopped
    //   Running      → Restarting | ShuttingDown
    //   Restarting   → Running | Stopped
    //   ShuttingDown → Stopped
    pub fn can_transition_to(&self, next: &HostState) -> bool {
        matches!(
            (self, next),
            (HostState::Created, HostState::Running { .. }) |
                (HostState::Created, HostState::Stopped) |
                (HostState::Running { .. }, HostState::Restarting) |
                (HostState::Running { .. }, HostState::ShuttingDown) |
                (HostState::Restarting, HostState::Running { .. }) |
                (HostState::Restarting, HostState::Stopped) |
                (HostState::ShuttingDown, HostState::Stopped)
        )
    }

    pub fn sandbox_id(&self) -> Option<&SandboxId> {
        match self {
            HostState::Running { sandbox_id } => Some(sandbox_id),
            _ => None,
        }
    }

    /// Whether `instruction` may be serviced from this state.
    fn accepts(&self, instruction: Instruction) -> bool {
        match instruction {
            Instruction::Restart => self.can_transition_to(&HostState::Restarting),
            Instruction::Shutdown => self.can_transition_to(&HostState::ShuttingDown),
        }
    }
}

/// Cheap handle used to instruct and observe a [`FunctionHost`].
#[derive(Clone)]
pub struct HostHandle {
    container_name: Arc<str>,
    instructions: mpsc::Sender<Instruction>,
    state: watch::Receiver<HostState>,
}

impl HostHandle {
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Queue a restart without waiting. A full queue already holds a restart
    /// that will pick up the latest code, so this one is dropped.
    pub fn restart(&self) -> Result<()> {
        debug!(container_name = %self.container_name, "sending restart to host");
        match self.instructions.try_send(Instruction::Restart) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!(container_name = %self.container_name, "restart already pending");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(anyhow!(
                "host {} is stopped, {} rejected",
                self.container_name,
                Instruction::Restart
            )),
        }
    }

    /// Queue a shutdown. Returns once the instruction is queued.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Instruction::Shutdown).await
    }

    async fn send(&self, instruction: Instruction) -> Result<()> {
        debug!(container_name = %self.container_name, %instruction, "sending instruction to host");
        self.instructions.send(instruction).await.map_err(|_| {
            anyhow!(
                "host {} is stopped, {} rejected",
                self.container_name,
                instruction
            )
        })
    }

    pub fn state(&self) -> HostState {
        self.state.borrow().clone()
    }

}

pub struct FunctionHost {
    run_spec: RunSpec,
    runtime: Arc<dyn ContainerRuntime>,
    instructions: mpsc::Receiver<Instruction>,
    state: watch::Sender<HostState>,
    removal_timeout: Duration,
}

impl FunctionHost {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        run_spec: RunSpec,
        removal_timeout: Duration,
    ) -> (FunctionHost, HostHandle) {
        let (instructions_tx, instructions_rx) = mpsc::channel(INSTRUCTION_QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(HostState::Created);
        let handle = HostHandle {
            container_name: Arc::from(run_spec.container_name.as_str()),
            instructions: instructions_tx,
            state: state_rx,
        };
        let host = FunctionHost {
            run_spec,
            runtime,
            instructions: instructions_rx,
            state: state_tx,
            removal_timeout,
        };
        (host, handle)
    }

    pub fn run_spec(&self) -> &RunSpec {
        &self.run_spec
    }

    pub fn state(&self) -> HostState {
        self.state.borrow().clone()
    }

    /// Moves to `next` and returns the state that was left.
    fn transition(&self, next: HostState) -> Result<HostState> {
        let current = self.state();
        if !current.can_transition_to(&next) {
            bail!(
                "invalid host state transition {} -> {}",
                current.as_ref(),
                next.as_ref()
            );
        }
        debug!(
            container_name = %self.run_spec.container_name,
            from = current.as_ref(),
            to = next.as_ref(),
            "host state transition"
        );
        Ok(self.state.send_replace(next))
    }

    /// Start the sandbox and wait for it to be ready. A failure leaves the
    /// host stopped; callers treat it as fatal.
    pub async fn start(&mut self) -> Result<()> {
        let current = self.state();
        if !current.can_transition_to(&HostState::Stopped) {
            bail!("cannot start host in state {}", current.as_ref());
        }

        match self.runtime.run_sandbox(&self.run_spec).await {
            Ok(sandbox_id) => {
                info!(
                    container_name = %self.run_spec.container_name,
                    sandbox_id = %sandbox_id,
                    port = self.run_spec.port,
                    "sandbox ready"
                );
                self.transition(HostState::Running { sandbox_id })?;
                Ok(())
            }
            Err(e) => {
                self.transition(HostState::Stopped)?;
                Err(e.context(format!(
                    "starting sandbox {}",
                    self.run_spec.container_name
                )))
            }
        }
    }

    /// Best-effort, time-bounded removal of `sandbox_id`.
    async fn remove_sandbox(&self, sandbox_id: &SandboxId) {
        let removal = tokio::time::timeout(
            self.removal_timeout,
            self.runtime.remove_sandbox(sandbox_id),
        )
        .await;
        match removal {
            Ok(Ok(())) => debug!(
                container_name = %self.run_spec.container_name,
                sandbox_id = %sandbox_id,
                "sandbox removed"
            ),
            Ok(Err(e)) => warn!(
                container_name = %self.run_spec.container_name,
                sandbox_id = %sandbox_id,
                error = ?e,
                "could not remove the sandbox"
            ),
            Err(_) => warn!(
                container_name = %self.run_spec.container_name,
                sandbox_id = %sandbox_id,
                timeout = ?self.removal_timeout,
                "timed out removing the sandbox"
            ),
        }
    }

    async fn restart_sandbox(&mut self) -> Result<()> {
        info!(container_name = %self.run_spec.container_name, "restarting sandbox");
        let previous = self.transition(HostState::Restarting)?;
        if let Some(sandbox_id) = previous.sandbox_id() {
            self.remove_sandbox(sandbox_id).await;
        }
        self.start().await
    }

    async fn shut_down(&mut self) -> Result<()> {
        info!(container_name = %self.run_spec.container_name, "shutting down sandbox");
        let previous = self.transition(HostState::ShuttingDown)?;
        if let Some(sandbox_id) = previous.sandbox_id() {
            self.remove_sandbox(sandbox_id).await;
        }
        self.transition(HostState::Stopped)?;
        Ok(())
    }

    /// Anything still queued once the host has stopped is dropped.
    fn reject_pending(&mut self) {
        self.instructions.close();
        while let Ok(instruction) = self.instructions.try_recv() {
            warn!(
                container_name = %self.run_spec.container_name,
                %instruction,
                "host stopped, instruction rejected"
            );
        }
    }

    /// Service instructions until a shutdown. If every handle is dropped the
    /// host shuts down as if told to, so its sandbox is never left behind.
    pub async fn process_instructions(mut self) -> Result<()> {
        while let Some(instruction) = self.instructions.recv().await {
            debug!(container_name = %self.run_spec.container_name, %instruction, "got instruction");
            let state = self.state();
            if !state.accepts(instruction) {
                warn!(
                    container_name = %self.run_spec.container_name,
                    %instruction,
                    state = state.as_ref(),
                    "instruction not valid in current state, rejected"
                );
                continue;
            }

            match instruction {
                Instruction::Shutdown => {
                    self.shut_down().await?;
                    self.reject_pending();
                    return Ok(());
                }
                Instruction::Restart => {
                    if let Err(e) = self.restart_sandbox().await {
                        self.reject_pending();
                        return Err(e);
                    }
                }
            }
        }

        debug!(container_name = %self.run_spec.container_name, "all handles dropped");
        if self.state().accepts(Instruction::Shutdown) {
            self.shut_down().await?;
        }
        Ok(())
    }
}
