//! Runner server process launching.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use runner_core::{Error, Result, ServerConfig};

use crate::connection::Connection;
use crate::credentials::TransportCredentials;
use crate::disposable::Disposable;
use crate::transport::RunnerTransport;

/// Target under which server output is logged.
pub const PROCESS_LOG_TARGET: &str = "runner_server::process";

/// Resources of a freshly spawned server.
pub struct SpawnedServer {
    /// Process guard, log forwarders and other per-process resources
    pub resources: Vec<Box<dyn Disposable>>,
    /// Resolves with the exit code once the process exits
    pub exited: Option<oneshot::Receiver<Option<i32>>>,
}

impl std::fmt::Debug for SpawnedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedServer")
            .field("resources", &self.resources.len())
            .field("watches_exit", &self.exited.is_some())
            .finish()
    }
}

/// Starts and probes runner servers on behalf of the supervisor.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    /// Whether `host:port` can be bound.
    fn port_available(&self, host: &str, port: u16) -> bool {
        std::net::TcpListener::bind((host, port)).is_ok()
    }

    /// Spawn a server listening on the configured address.
    async fn spawn(
        &self,
        config: &ServerConfig,
        credentials: &TransportCredentials,
    ) -> Result<SpawnedServer>;

    /// Whether a server at `address` accepts connections and reports serving.
    async fn is_running(&self, address: &str, credentials: &TransportCredentials) -> bool;
}

/// Arguments for the server binary.
pub fn server_args(config: &ServerConfig) -> Vec<String> {
    let mut args = vec![
        "server".to_string(),
        "--address".to_string(),
        config.address(),
    ];
    if config.tls_enabled {
        args.push("--tls".to_string());
        args.push(config.tls_dir.display().to_string());
    } else {
        args.push("--insecure".to_string());
    }
    args.extend(config.extra_args.iter().cloned());
    args
}

/// Kills the server process when disposed.
struct ProcessGuard {
    kill: Option<oneshot::Sender<()>>,
}

impl Disposable for ProcessGuard {
    fn dispose(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Launches the server binary as a child process.
#[derive(Debug, Clone)]
pub struct BinaryLauncher {
    health_timeout: Duration,
}

impl BinaryLauncher {
    /// Create a launcher with a 2 second health-check timeout.
    pub fn new() -> Self {
        Self {
            health_timeout: Duration::from_secs(2),
        }
    }

    /// Override the health-check timeout.
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }
}

impl Default for BinaryLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerLauncher for BinaryLauncher {
    async fn spawn(
        &self,
        config: &ServerConfig,
        _credentials: &TransportCredentials,
    ) -> Result<SpawnedServer> {
        let args = server_args(config);
        info!(
            "Spawning runner server: binary='{}' args={:?}",
            config.binary_path.display(),
            args
        );

        let mut child = Command::new(&config.binary_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!(
                    "Failed to spawn runner server '{}': {}",
                    config.binary_path.display(),
                    e
                );
                Error::Io(e)
            })?;
        debug!("Runner server started with pid {:?}", child.id());

        let mut resources: Vec<Box<dyn Disposable>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            resources.push(Box::new(tokio::spawn(forward_lines(stdout, "stdout"))));
        }
        if let Some(stderr) = child.stderr.take() {
            resources.push(Box::new(tokio::spawn(forward_lines(stderr, "stderr"))));
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let code = match exited {
                Some(Ok(status)) => status.code(),
                Some(Err(e)) => {
                    warn!("Failed to wait for runner server: {}", e);
                    None
                }
                None => {
                    debug!("Killing runner server");
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill runner server: {}", e);
                    }
                    None
                }
            };
            info!("Runner server exited with code {:?}", code);
            let _ = exit_tx.send(code);
        });
        resources.push(Box::new(ProcessGuard {
            kill: Some(kill_tx),
        }));

        Ok(SpawnedServer {
            resources,
            exited: Some(exit_rx),
        })
    }

    async fn is_running(&self, address: &str, credentials: &TransportCredentials) -> bool {
        let probe = async {
            let connection = Connection::connect(address, credentials).await?;
            let serving = connection.health().await;
            connection.close().await;
            serving
        };

        match tokio::time::timeout(self.health_timeout, probe).await {
            Ok(Ok(serving)) => serving,
            Ok(Err(e)) => {
                debug!("Health check against {} failed: {}", address, e);
                false
            }
            Err(_) => {
                debug!("Health check against {} timed out", address);
                false
            }
        }
    }
}

async fn forward_lines<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: PROCESS_LOG_TARGET, stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(target: PROCESS_LOG_TARGET, stream, "Stopped forwarding: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_server_args_tls() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 7900,
            tls_enabled: true,
            tls_dir: PathBuf::from("/tmp/tls"),
            extra_args: vec!["--verbose".to_string()],
            ..ServerConfig::default()
        };
        assert_eq!(
            server_args(&config),
            vec![
                "server",
                "--address",
                "127.0.0.1:7900",
                "--tls",
                "/tmp/tls",
                "--verbose"
            ]
        );
    }

    #[test]
    fn test_server_args_insecure() {
        let config = ServerConfig {
            port: 7001,
            tls_enabled: false,
            ..ServerConfig::default()
        };
        let args = server_args(&config);
        assert_eq!(args.last().map(String::as_str), Some("--insecure"));
        assert!(args.contains(&"127.0.0.1:7001".to_string()));
    }

    #[test]
    fn test_port_available_detects_bound_port() {
        let launcher = BinaryLauncher::new();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!launcher.port_available("127.0.0.1", port));
        drop(listener);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let config = ServerConfig {
            binary_path: PathBuf::from("/nonexistent/runner-server-binary"),
            tls_enabled: false,
            ..ServerConfig::default()
        };
        let result = BinaryLauncher::new()
            .spawn(&config, &TransportCredentials::Insecure)
            .await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_is_running_false_without_server() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let launcher = BinaryLauncher::new().with_health_timeout(Duration::from_millis(500));
        assert!(
            !launcher
                .is_running(&address, &TransportCredentials::Insecure)
                .await
        );
    }
}
