//! Session manager for the runner transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use runner_core::{
    CreateSessionRequest, Error, OutputSettings, ProgramId, ProgramOptions, Result,
};
use runner_server::{RunnerTransport, TransportState};

use crate::environment::EnvironmentHandle;
use crate::program::{ProgramInfo, ProgramSession};

/// Configuration for session manager.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Coalescing window for non-interactive output
    pub coalesce: Duration,

    /// Coalesce stderr as well as stdout
    pub coalesce_stderr: bool,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            coalesce: Duration::from_millis(25),
            coalesce_stderr: false,
        }
    }
}

impl From<&OutputSettings> for SessionManagerConfig {
    fn from(settings: &OutputSettings) -> Self {
        Self {
            coalesce: Duration::from_millis(settings.coalesce_ms),
            coalesce_stderr: settings.coalesce_stderr,
        }
    }
}

#[derive(Default)]
struct Live {
    environments: Vec<Arc<EnvironmentHandle>>,
    programs: Vec<Arc<ProgramSession>>,
    disposed: bool,
}

/// Facade over the runner transport.
///
/// Every operation requires the transport to be ready; environments and
/// program sessions created here are torn down by [`SessionManager::dispose`].
pub struct SessionManager {
    transport: watch::Receiver<TransportState>,
    config: SessionManagerConfig,
    live: Mutex<Live>,
    next_program_id: AtomicU64,
}

impl SessionManager {
    /// Create a new session manager with default configuration.
    pub fn new(transport: watch::Receiver<TransportState>) -> Self {
        Self::with_config(transport, SessionManagerConfig::default())
    }

    /// Create a new session manager with custom configuration.
    pub fn with_config(
        transport: watch::Receiver<TransportState>,
        config: SessionManagerConfig,
    ) -> Self {
        Self {
            transport,
            config,
            live: Mutex::new(Live::default()),
            next_program_id: AtomicU64::new(1),
        }
    }

    /// Manager configuration.
    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    /// Whether RPCs can currently be issued.
    pub fn is_active(&self) -> bool {
        self.transport.borrow().is_ready()
    }

    fn ready_transport(&self) -> Result<Arc<dyn RunnerTransport>> {
        self.transport
            .borrow()
            .transport()
            .ok_or(Error::TransportNotActive)
    }

    async fn ensure_live(&self) -> Result<()> {
        if self.live.lock().await.disposed {
            return Err(Error::TransportNotActive);
        }
        Ok(())
    }

    /// Create a remote environment seeded with `envs` ("K=V" pairs).
    pub async fn create_environment(&self, envs: Vec<String>) -> Result<Arc<EnvironmentHandle>> {
        self.ensure_live().await?;
        let transport = self.ready_transport()?;

        let response = transport
            .create_session(CreateSessionRequest { envs: envs.clone() })
            .await?;
        let handle = Arc::new(EnvironmentHandle::new(response.session, &envs, transport));
        info!(
            "Created environment {} with {} variable(s)",
            handle.session_id(),
            handle.initial_env_names().len()
        );

        let mut live = self.live.lock().await;
        if live.disposed {
            drop(live);
            if let Err(e) = handle.dispose().await {
                warn!("Failed to delete environment {}: {}", handle.session_id(), e);
            }
            return Err(Error::TransportNotActive);
        }
        live.environments.push(Arc::clone(&handle));
        Ok(handle)
    }

    /// Delete an environment before the manager is disposed.
    pub async fn delete_environment(&self, handle: &EnvironmentHandle) -> Result<()> {
        self.ready_transport()?;
        let removed = {
            let mut live = self.live.lock().await;
            if live.disposed {
                return Err(Error::TransportNotActive);
            }
            let index = live
                .environments
                .iter()
                .position(|env| env.session_id() == handle.session_id())
                .ok_or_else(|| Error::InvalidEnvironment(handle.session_id().to_string()))?;
            live.environments.remove(index)
        };
        removed.dispose().await
    }

    /// Start a program, optionally inside `environment`.
    pub async fn create_program_session(
        &self,
        options: ProgramOptions,
        environment: Option<&EnvironmentHandle>,
    ) -> Result<Arc<ProgramSession>> {
        let session_id = {
            let live = self.live.lock().await;
            if live.disposed {
                return Err(Error::TransportNotActive);
            }
            match environment {
                Some(env) => {
                    let known = live
                        .environments
                        .iter()
                        .any(|live_env| live_env.session_id() == env.session_id());
                    if !known || env.is_disposed() {
                        return Err(Error::InvalidEnvironment(env.session_id().to_string()));
                    }
                    Some(env.session_id().to_string())
                }
                None => None,
            }
        };
        let transport = self.ready_transport()?;

        let id = ProgramId::new(self.next_program_id.fetch_add(1, Ordering::SeqCst));
        let program =
            ProgramSession::start(id, options, session_id, transport.as_ref(), &self.config)
                .await?;

        let mut live = self.live.lock().await;
        if live.disposed {
            drop(live);
            program.dispose().await;
            return Err(Error::TransportNotActive);
        }
        live.programs.retain(|existing| !existing.is_closed());
        live.programs.push(Arc::clone(&program));
        Ok(program)
    }

    /// Live program sessions; closed ones are pruned.
    pub async fn program_sessions(&self) -> Vec<Arc<ProgramSession>> {
        let mut live = self.live.lock().await;
        live.programs.retain(|program| !program.is_closed());
        live.programs.clone()
    }

    /// Snapshot of the live program sessions.
    pub async fn list_programs(&self) -> Vec<ProgramInfo> {
        self.program_sessions()
            .await
            .iter()
            .map(|program| program.info())
            .collect()
    }

    /// Live environments.
    pub async fn environments(&self) -> Vec<Arc<EnvironmentHandle>> {
        self.live.lock().await.environments.clone()
    }

    /// Dispose every program session, then every environment, then close
    /// the transport. Safe to call repeatedly; a concurrent caller returns
    /// once the first disposal completed.
    pub async fn dispose(&self) {
        let mut live = self.live.lock().await;
        if live.disposed {
            debug!("Session manager already disposed");
            return;
        }
        live.disposed = true;

        let programs = std::mem::take(&mut live.programs);
        let environments = std::mem::take(&mut live.environments);
        info!(
            "Disposing session manager ({} program(s), {} environment(s))",
            programs.len(),
            environments.len()
        );

        for program in programs {
            program.dispose().await;
        }
        for environment in environments {
            if let Err(e) = environment.dispose().await {
                warn!(
                    "Failed to delete environment {}: {}",
                    environment.session_id(),
                    e
                );
            }
        }

        let transport = self.transport.borrow().transport();
        if let Some(transport) = transport {
            transport.close().await;
        }
        info!("Session manager disposed");
    }
}
