//! Remote execution environments.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use runner_core::{env_name, DeleteSessionRequest, RemoteSession, Result};
use runner_server::RunnerTransport;

/// Handle on a remote session created by the session manager.
pub struct EnvironmentHandle {
    session_id: String,
    initial_env_names: BTreeSet<String>,
    envs: Vec<String>,
    transport: Arc<dyn RunnerTransport>,
    disposed: AtomicBool,
}

impl EnvironmentHandle {
    pub(crate) fn new(
        session: RemoteSession,
        requested_envs: &[String],
        transport: Arc<dyn RunnerTransport>,
    ) -> Self {
        let initial_env_names = session
            .envs
            .iter()
            .chain(requested_envs)
            .filter_map(|pair| env_name(pair))
            .map(str::to_string)
            .collect();

        Self {
            session_id: session.id,
            initial_env_names,
            envs: session.envs,
            transport,
            disposed: AtomicBool::new(false),
        }
    }

    /// Server-assigned session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Names of the variables visible when the session was created.
    pub fn initial_env_names(&self) -> &BTreeSet<String> {
        &self.initial_env_names
    }

    /// Environment reported by the server, as "K=V" pairs.
    pub fn envs(&self) -> &[String] {
        &self.envs
    }

    /// Whether the remote session has been deleted.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Delete the remote session. Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            debug!("Environment {} already disposed", self.session_id);
            return Ok(());
        }
        self.transport
            .delete_session(DeleteSessionRequest {
                id: self.session_id.clone(),
            })
            .await?;
        info!("Deleted environment {}", self.session_id);
        Ok(())
    }
}

impl std::fmt::Debug for EnvironmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentHandle")
            .field("session_id", &self.session_id)
            .field("initial_env_names", &self.initial_env_names)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_server::testing::MockRunner;

    fn remote(id: &str, envs: &[&str]) -> RemoteSession {
        RemoteSession {
            id: id.to_string(),
            envs: envs.iter().map(|pair| pair.to_string()).collect(),
        }
    }

    #[test]
    fn test_env_names_are_merged() {
        let handle = EnvironmentHandle::new(
            remote("1", &["foo=bar", "PATH=/bin"]),
            &["bar=baz".to_string(), "foo=other".to_string()],
            Arc::new(MockRunner::new()),
        );
        let names: Vec<&str> = handle.initial_env_names().iter().map(String::as_str).collect();
        assert_eq!(names, vec!["PATH", "bar", "foo"]);
        assert_eq!(handle.session_id(), "1");
        assert_eq!(handle.envs().len(), 2);
    }

    #[test]
    fn test_malformed_pairs_are_skipped() {
        let handle = EnvironmentHandle::new(
            remote("2", &["=nameless"]),
            &["novalue".to_string()],
            Arc::new(MockRunner::new()),
        );
        let names: Vec<&str> = handle.initial_env_names().iter().map(String::as_str).collect();
        assert_eq!(names, vec!["novalue"]);
    }

    #[tokio::test]
    async fn test_dispose_deletes_once() {
        let runner = Arc::new(MockRunner::new());
        let response = runner
            .create_session(runner_core::CreateSessionRequest::default())
            .await
            .unwrap();
        let handle = EnvironmentHandle::new(response.session, &[], runner.clone());

        handle.dispose().await.unwrap();
        assert!(handle.is_disposed());
        assert!(runner.session_ids().is_empty());
        handle.dispose().await.unwrap();
    }
}
