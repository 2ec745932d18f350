//! In-memory runner server for tests.
//!
//! `MockRunner` implements [`RunnerTransport`] without any I/O. Sessions get
//! ids from a process-wide counter; execute streams are exposed as
//! [`MockExecution`] handles through which a test inspects the frames a
//! client sent and pushes response frames back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use runner_core::{
    env_name, CreateSessionRequest, CreateSessionResponse, DeleteSessionRequest, Error,
    ExecuteRequest, ExecuteResponse, RemoteSession, Result, Winsize,
};

use crate::transport::{ExecuteCall, RequestSink, RunnerTransport, SinkCommand};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Observable call made against a [`MockRunner`], in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// A session was created
    SessionCreated(String),
    /// A session was deleted
    SessionDeleted(String),
    /// A client half-closed an execute stream
    ExecuteCompleted,
    /// The transport was closed
    Closed,
}

type EventLog = Arc<Mutex<Vec<MockEvent>>>;

/// Handle on one execute stream opened against a [`MockRunner`].
#[derive(Clone)]
pub struct MockExecution {
    requests: Arc<Mutex<Vec<ExecuteRequest>>>,
    completed: Arc<AtomicBool>,
    responses: Arc<Mutex<Option<mpsc::UnboundedSender<Result<ExecuteResponse>>>>>,
}

impl MockExecution {
    /// Every frame received so far, in order.
    pub fn requests(&self) -> Vec<ExecuteRequest> {
        self.requests.lock().clone()
    }

    /// The first frame, if sent.
    pub fn initial_request(&self) -> Option<ExecuteRequest> {
        self.requests.lock().first().cloned()
    }

    /// Winsizes carried by frames after the first.
    pub fn resizes(&self) -> Vec<Winsize> {
        self.requests
            .lock()
            .iter()
            .skip(1)
            .filter_map(|request| request.winsize)
            .collect()
    }

    /// Input bytes carried by all frames, in order.
    pub fn inputs(&self) -> Vec<Vec<u8>> {
        self.requests
            .lock()
            .iter()
            .filter_map(|request| request.input_data.clone())
            .collect()
    }

    /// Push a response frame to the client.
    pub fn respond(&self, response: ExecuteResponse) {
        self.push(Ok(response));
    }

    /// Deliver a stream error to the client.
    pub fn fail(&self, message: &str) {
        self.push(Err(Error::Rpc(message.to_string())));
    }

    /// End the response stream without an exit code.
    pub fn finish(&self) {
        self.responses.lock().take();
    }

    fn push(&self, frame: Result<ExecuteResponse>) {
        if let Some(tx) = self.responses.lock().as_ref() {
            let _ = tx.send(frame);
        }
    }

    /// Whether the client half-closed the stream.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct MockState {
    sessions: HashMap<String, Vec<String>>,
    executions: Vec<MockExecution>,
}

/// In-memory stand-in for a runner server.
#[derive(Default)]
pub struct MockRunner {
    injected_envs: Vec<String>,
    events: EventLog,
    state: Mutex<MockState>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    healthy: AtomicBool,
}

impl MockRunner {
    /// A healthy runner.
    pub fn new() -> Self {
        Self::with_injected_envs(Vec::new())
    }

    /// A runner that adds `envs` to every created session.
    pub fn with_injected_envs(envs: Vec<String>) -> Self {
        Self {
            injected_envs: envs,
            healthy: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Change the health probe answer.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Ids of the live sessions.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Execute streams in open order.
    pub fn executions(&self) -> Vec<MockExecution> {
        self.state.lock().executions.clone()
    }

    /// Most recently opened execute stream.
    pub fn last_execution(&self) -> Option<MockExecution> {
        self.state.lock().executions.last().cloned()
    }

    /// End every open response stream without an exit code.
    pub fn drop_streams(&self) {
        for execution in self.executions() {
            execution.finish();
        }
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Every recorded call, in arrival order.
    pub fn events(&self) -> Vec<MockEvent> {
        self.events.lock().clone()
    }

    fn record(&self, event: MockEvent) {
        self.events.lock().push(event);
    }

    /// Number of `close` calls.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::TransportNotActive)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RunnerTransport for MockRunner {
    async fn health(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.healthy.load(Ordering::SeqCst))
    }

    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreateSessionResponse> {
        self.ensure_open()?;
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst).to_string();

        let mut envs = self.injected_envs.clone();
        for pair in request.envs {
            let name = env_name(&pair).map(str::to_string);
            let replaced = envs
                .iter()
                .position(|existing| name.is_some() && env_name(existing) == name.as_deref());
            match replaced {
                Some(index) => envs[index] = pair,
                None => envs.push(pair),
            }
        }

        debug!("Mock runner created session {}", id);
        self.state.lock().sessions.insert(id.clone(), envs.clone());
        self.record(MockEvent::SessionCreated(id.clone()));
        Ok(CreateSessionResponse {
            session: RemoteSession { id, envs },
        })
    }

    async fn delete_session(&self, request: DeleteSessionRequest) -> Result<()> {
        self.ensure_open()?;
        let removed = self.state.lock().sessions.remove(&request.id);
        match removed {
            Some(_) => {
                self.record(MockEvent::SessionDeleted(request.id));
                Ok(())
            }
            None => Err(Error::Rpc(format!("session {} not found", request.id))),
        }
    }

    async fn execute(&self) -> Result<ExecuteCall> {
        self.ensure_open()?;
        let (response_tx, responses) = mpsc::unbounded_channel();
        let (requests, mut commands) = RequestSink::channel();
        let execution = MockExecution {
            requests: Arc::new(Mutex::new(Vec::new())),
            completed: Arc::new(AtomicBool::new(false)),
            responses: Arc::new(Mutex::new(Some(response_tx))),
        };

        let recorded = execution.clone();
        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                match command {
                    SinkCommand::Frame(request) => recorded.requests.lock().push(request),
                    SinkCommand::Complete(ack) => {
                        recorded.completed.store(true, Ordering::SeqCst);
                        events.lock().push(MockEvent::ExecuteCompleted);
                        let _ = ack.send(());
                        break;
                    }
                }
            }
        });

        self.state.lock().executions.push(execution);
        Ok(ExecuteCall {
            requests,
            responses,
        })
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.record(MockEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_envs_are_merged() {
        let runner = MockRunner::with_injected_envs(vec!["foo=bar".to_string()]);
        let response = runner
            .create_session(CreateSessionRequest {
                envs: vec!["bar=baz".to_string(), "foo=override".to_string()],
            })
            .await
            .unwrap();
        assert_eq!(
            response.session.envs,
            vec!["foo=override".to_string(), "bar=baz".to_string()]
        );
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let runner = MockRunner::new();
        let first = runner
            .create_session(CreateSessionRequest::default())
            .await
            .unwrap();
        let second = runner
            .create_session(CreateSessionRequest::default())
            .await
            .unwrap();
        assert_ne!(first.session.id, second.session.id);
        assert_eq!(runner.session_ids().len(), 2);
        assert_eq!(
            runner.events(),
            vec![
                MockEvent::SessionCreated(first.session.id),
                MockEvent::SessionCreated(second.session.id)
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_unknown_session_fails() {
        let runner = MockRunner::new();
        let result = runner
            .delete_session(DeleteSessionRequest {
                id: "missing".to_string(),
            })
            .await;
        assert!(matches!(result, Err(Error::Rpc(_))));
    }

    #[tokio::test]
    async fn test_execute_records_frames_and_acks_completion() {
        let runner = MockRunner::new();
        let mut call = runner.execute().await.unwrap();
        call.requests
            .send(ExecuteRequest::input(b"ls\n".to_vec()))
            .unwrap();
        call.requests
            .send(ExecuteRequest::resize(Winsize {
                rows: 24,
                cols: 80,
                x: 0,
                y: 0,
            }))
            .unwrap();
        call.requests.complete().await.unwrap();

        let execution = runner.last_execution().unwrap();
        assert!(execution.is_completed());
        assert_eq!(execution.requests().len(), 2);
        assert_eq!(execution.inputs(), vec![b"ls\n".to_vec()]);
        assert_eq!(execution.resizes().len(), 1);

        execution.respond(ExecuteResponse::exit(0));
        let frame = call.responses.recv().await.unwrap().unwrap();
        assert_eq!(frame.exit_code, Some(0));

        execution.finish();
        assert!(call.responses.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_runner_rejects_calls() {
        let runner = MockRunner::new();
        runner.close().await;
        runner.close().await;
        assert_eq!(runner.close_calls(), 2);
        assert!(matches!(runner.health().await, Err(Error::TransportNotActive)));
        assert!(matches!(
            runner.execute().await,
            Err(Error::TransportNotActive)
        ));
    }
}
