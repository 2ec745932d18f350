//! Runner server supervision.
//!
//! The supervisor locates or spawns the runner server, retrying on the next
//! port with exponential backoff, polls until the server accepts
//! connections, and publishes the resulting transport state.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use runner_core::{AcceptancePoll, Error, Result, ServerConfig};

use crate::connection::Connection;
use crate::credentials::TransportCredentials;
use crate::disposable::{Disposable, DisposableSet, DisposeFn};
use crate::launcher::{BinaryLauncher, ServerLauncher, SpawnedServer};
use crate::transport::{transport_channel, TransportState};

/// Supervises one runner server for the lifetime of an activation.
pub struct ServerSupervisor {
    config: Mutex<ServerConfig>,
    launcher: Arc<dyn ServerLauncher>,
    state: Arc<watch::Sender<TransportState>>,
    disposables: Arc<DisposableSet>,
    credentials: Mutex<Option<TransportCredentials>>,
}

impl ServerSupervisor {
    /// Create a supervisor that launches the configured binary.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_launcher(config, Arc::new(BinaryLauncher::new()))
    }

    /// Create a supervisor with a custom launcher.
    pub fn with_launcher(config: ServerConfig, launcher: Arc<dyn ServerLauncher>) -> Self {
        let (state, _) = transport_channel();
        Self {
            config: Mutex::new(config),
            launcher,
            state: Arc::new(state),
            disposables: Arc::new(DisposableSet::new()),
            credentials: Mutex::new(None),
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> ServerConfig {
        self.config.lock().clone()
    }

    /// Current candidate port.
    pub fn port(&self) -> u16 {
        self.config.lock().port
    }

    /// Observe transport state transitions.
    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    /// Current transport state.
    pub fn state(&self) -> TransportState {
        self.state.borrow().clone()
    }

    /// Track a resource to release on dispose.
    pub fn register_disposable(&self, item: Box<dyn Disposable>) {
        self.disposables.register(item);
    }

    /// Launch (or locate) the server and connect to it.
    pub async fn start(&self) -> Result<Arc<Connection>> {
        let address = self.launch().await?;
        self.connect(&address).await
    }

    /// Launch (or locate) the server, returning its address.
    ///
    /// Each failed attempt advances the candidate port by one; the advanced
    /// port is kept for later calls.
    pub async fn launch(&self) -> Result<String> {
        self.ensure_live()?;
        let credentials = self.credentials()?;
        let policy = self.config.lock().retry;
        let total = policy.total_attempts();

        let mut attempt = 1;
        loop {
            let config = self.config();
            info!(
                "Launching runner server at {} (attempt {}/{})",
                config.address(),
                attempt,
                total
            );

            let error = match self.try_launch(&config, &credentials).await {
                Ok(address) => {
                    info!("Runner server accepting connections at {}", address);
                    return Ok(address);
                }
                Err(e) => e,
            };
            warn!(
                "Launch attempt {} at {} failed: {}",
                attempt,
                config.address(),
                error
            );

            if attempt >= total {
                if total == 1 {
                    return Err(error);
                }
                error!("Runner server launch failed after {} attempts", total);
                return Err(Error::ServerLaunchFailed {
                    attempts: total,
                    reason: error.to_string(),
                });
            }

            let next_port = self.advance_port().ok_or_else(|| Error::ServerLaunchFailed {
                attempts: attempt,
                reason: "port range exhausted".to_string(),
            })?;
            let delay = policy.backoff_for(attempt);
            debug!("Retrying on port {} in {:?}", next_port, delay);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Connect to the server at `address` and publish the ready transport.
    pub async fn connect(&self, address: &str) -> Result<Arc<Connection>> {
        self.ensure_live()?;
        let credentials = self.credentials()?;
        let connection = Arc::new(Connection::connect(address, &credentials).await?);

        let closer = Arc::clone(&connection);
        self.disposables
            .register(Box::new(DisposeFn::new(move || closer.shutdown())));
        self.state
            .send_replace(TransportState::Ready(connection.clone()));
        info!("Transport ready at {}", address);
        Ok(connection)
    }

    /// Release every tracked resource and publish `Closed`. Idempotent.
    pub fn dispose(&self) {
        if let Some(count) = self.disposables.dispose_all() {
            info!("Server supervisor disposed ({} resource(s))", count);
            self.state.send_replace(TransportState::Closed(None));
        }
    }

    /// Whether `dispose` has run.
    pub fn is_disposed(&self) -> bool {
        self.disposables.is_disposed()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(Error::TransportNotActive)
        } else {
            Ok(())
        }
    }

    fn credentials(&self) -> Result<TransportCredentials> {
        let mut cached = self.credentials.lock();
        if let Some(credentials) = cached.as_ref() {
            return Ok(credentials.clone());
        }
        let credentials = TransportCredentials::resolve(&self.config.lock())?;
        *cached = Some(credentials.clone());
        Ok(credentials)
    }

    fn advance_port(&self) -> Option<u16> {
        let mut config = self.config.lock();
        config.port = config.port.checked_add(1)?;
        Some(config.port)
    }

    async fn try_launch(
        &self,
        config: &ServerConfig,
        credentials: &TransportCredentials,
    ) -> Result<String> {
        let address = config.address();
        if !config.managed {
            debug!("Locating external runner server at {}", address);
            self.await_acceptance(&address, credentials, config.retry.acceptance)
                .await?;
            return Ok(address);
        }

        if !self.launcher.port_available(&config.host, config.port) {
            return Err(Error::PortUnavailable(config.port));
        }

        let SpawnedServer { resources, exited } =
            self.launcher.spawn(config, credentials).await?;

        match self
            .await_acceptance(&address, credentials, config.retry.acceptance)
            .await
        {
            Ok(()) => {
                for resource in resources {
                    self.disposables.register(resource);
                }
                if let Some(exited) = exited {
                    self.watch_exit(exited);
                }
                Ok(address)
            }
            Err(e) => {
                for mut resource in resources.into_iter().rev() {
                    resource.dispose();
                }
                Err(e)
            }
        }
    }

    async fn await_acceptance(
        &self,
        address: &str,
        credentials: &TransportCredentials,
        poll: AcceptancePoll,
    ) -> Result<()> {
        let started = Instant::now();
        for check in 1..=poll.attempts {
            if self.launcher.is_running(address, credentials).await {
                debug!("Server at {} accepted on check {}", address, check);
                return Ok(());
            }
            if check < poll.attempts {
                tokio::time::sleep(poll.interval).await;
            }
        }

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        error!(
            "Server at {} did not accept connections after {}ms",
            address, elapsed_ms
        );
        Err(Error::ServerNotAccepting { elapsed_ms })
    }

    fn watch_exit(&self, exited: oneshot::Receiver<Option<i32>>) {
        let state = Arc::clone(&self.state);
        let watcher = tokio::spawn(async move {
            if let Ok(code) = exited.await {
                warn!("Runner server exited with code {:?}", code);
                state.send_replace(TransportState::Closed(code));
            }
        });
        self.disposables.register(Box::new(watcher));
    }
}

impl std::fmt::Debug for ServerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSupervisor")
            .field("config", &*self.config.lock())
            .field("state", &self.state.borrow().name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeLauncher {
        accepts: bool,
        busy_ports: HashSet<u16>,
        spawned_ports: Mutex<Vec<u16>>,
        checks: AtomicUsize,
        released: Arc<AtomicUsize>,
        exit_senders: Mutex<Vec<oneshot::Sender<Option<i32>>>>,
    }

    impl FakeLauncher {
        fn accepting() -> Self {
            Self {
                accepts: true,
                ..Self::default()
            }
        }

        fn spawned_ports(&self) -> Vec<u16> {
            self.spawned_ports.lock().clone()
        }
    }

    #[async_trait]
    impl ServerLauncher for FakeLauncher {
        fn port_available(&self, _host: &str, port: u16) -> bool {
            !self.busy_ports.contains(&port)
        }

        async fn spawn(
            &self,
            config: &ServerConfig,
            _credentials: &TransportCredentials,
        ) -> Result<SpawnedServer> {
            self.spawned_ports.lock().push(config.port);
            let released = Arc::clone(&self.released);
            let (exit_tx, exit_rx) = oneshot::channel();
            self.exit_senders.lock().push(exit_tx);
            Ok(SpawnedServer {
                resources: vec![Box::new(DisposeFn::new(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                }))],
                exited: Some(exit_rx),
            })
        }

        async fn is_running(&self, _address: &str, _credentials: &TransportCredentials) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.accepts
        }
    }

    fn test_config(max_attempts: u32, poll_attempts: u32) -> ServerConfig {
        let mut config = ServerConfig {
            port: 7000,
            tls_enabled: false,
            ..ServerConfig::default()
        };
        config.retry.max_attempts = max_attempts;
        config.retry.acceptance = AcceptancePoll {
            attempts: poll_attempts,
            interval: Duration::from_millis(100),
        };
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_accepting_attempts_max_plus_one() {
        let launcher = Arc::new(FakeLauncher::default());
        let supervisor = ServerSupervisor::with_launcher(test_config(2, 3), launcher.clone());

        let result = supervisor.launch().await;
        match result {
            Err(Error::ServerLaunchFailed { attempts, reason }) => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("did not accept connections"));
            }
            other => panic!("expected launch failure, got {other:?}"),
        }

        let ports = launcher.spawned_ports();
        assert_eq!(ports, vec![7000, 7001, 7002]);
        assert!(ports.windows(2).all(|pair| pair[1] > pair[0]));
        assert_eq!(launcher.checks.load(Ordering::SeqCst), 9);
        assert_eq!(launcher.released.load(Ordering::SeqCst), 3);
        assert_eq!(supervisor.port(), 7002);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_reports_elapsed_time() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut config = test_config(5, 3);
        config.retry.retry_on_failure = false;
        let supervisor = ServerSupervisor::with_launcher(config, launcher.clone());

        match supervisor.launch().await {
            Err(Error::ServerNotAccepting { elapsed_ms }) => assert_eq!(elapsed_ms, 200),
            other => panic!("expected acceptance failure, got {other:?}"),
        }
        assert_eq!(launcher.spawned_ports(), vec![7000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_port_is_skipped_and_persisted() {
        let mut launcher = FakeLauncher::accepting();
        launcher.busy_ports.insert(7000);
        let launcher = Arc::new(launcher);
        let supervisor = ServerSupervisor::with_launcher(test_config(2, 3), launcher.clone());

        let address = supervisor.launch().await.unwrap();
        assert_eq!(address, "127.0.0.1:7001");
        assert_eq!(launcher.spawned_ports(), vec![7001]);
        assert_eq!(supervisor.port(), 7001);
        assert_eq!(supervisor.config().port, 7001);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_server_is_only_polled() {
        let launcher = Arc::new(FakeLauncher::accepting());
        let mut config = test_config(0, 3);
        config.managed = false;
        let supervisor = ServerSupervisor::with_launcher(config, launcher.clone());

        assert_eq!(supervisor.launch().await.unwrap(), "127.0.0.1:7000");
        assert!(launcher.spawned_ports().is_empty());
        assert_eq!(launcher.checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::accepting());
        let mut config = test_config(2, 3);
        config.tls_enabled = true;
        config.tls_dir = dir.path().to_path_buf();
        let supervisor = ServerSupervisor::with_launcher(config, launcher.clone());

        assert!(matches!(
            supervisor.launch().await,
            Err(Error::Credentials(_))
        ));
        assert!(launcher.spawned_ports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_exit_publishes_closed() {
        let launcher = Arc::new(FakeLauncher::accepting());
        let supervisor = ServerSupervisor::with_launcher(test_config(0, 1), launcher.clone());
        let mut state = supervisor.subscribe();

        supervisor.launch().await.unwrap();
        let exit = launcher.exit_senders.lock().pop().unwrap();
        exit.send(Some(3)).unwrap();

        state.changed().await.unwrap();
        assert!(matches!(*state.borrow(), TransportState::Closed(Some(3))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_is_idempotent() {
        let launcher = Arc::new(FakeLauncher::accepting());
        let supervisor = ServerSupervisor::with_launcher(test_config(0, 1), launcher.clone());
        supervisor.launch().await.unwrap();

        supervisor.dispose();
        supervisor.dispose();
        assert_eq!(launcher.released.load(Ordering::SeqCst), 1);
        assert!(matches!(supervisor.state(), TransportState::Closed(None)));
        assert!(matches!(
            supervisor.launch().await,
            Err(Error::TransportNotActive)
        ));
    }

    #[test]
    fn test_registered_disposables_released_on_dispose() {
        let supervisor = ServerSupervisor::new(test_config(0, 1));
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        supervisor.register_disposable(Box::new(DisposeFn::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        supervisor.dispose();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(supervisor.is_disposed());
    }
}
