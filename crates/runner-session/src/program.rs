//! Program sessions.
//!
//! A program session is the duplex-streamed execution of one remote program.
//! Input, resize and stop frames go out through the request sink in call
//! order; a single reader task consumes response frames sequentially and
//! fans them out to the registered listeners.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use runner_core::{
    Dimensions, Error, ExecuteRequest, ExecuteResponse, ExecuteStop, ProgramId, ProgramOptions,
    Result, Winsize,
};
use runner_server::{ExecuteCall, RequestSink, ResponseStream, RunnerTransport};

use crate::events::{Emitter, ListenerId};
use crate::manager::SessionManagerConfig;
use crate::output::{OutputBuffer, OutputPolicy};
use crate::registry::{TerminalWindow, TerminalWindowRegistry};

/// Lifecycle of a program session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramStatus {
    /// Stream opened, no response yet
    Open,
    /// At least one response frame received
    Running,
    /// Exit code received, stream ended or session disposed
    Closed,
}

/// State shared between the session handle and its reader task.
struct Shared {
    label: String,
    status: watch::Sender<ProgramStatus>,
    closing: AtomicBool,
    pid: watch::Sender<Option<u32>>,
    exit_code: Mutex<Option<i32>>,
    mime_type: Mutex<Option<String>>,
    stdout: Emitter<Vec<u8>>,
    stderr: Emitter<Vec<u8>>,
    write: Arc<Emitter<String>>,
    error: Arc<Emitter<String>>,
    close: Emitter<Option<i32>>,
    stdout_buffer: OutputBuffer,
    stderr_buffer: OutputBuffer,
}

impl Shared {
    fn is_closed(&self) -> bool {
        *self.status.borrow() == ProgramStatus::Closed
    }

    /// Returns true once the session is closed.
    fn handle(&self, response: ExecuteResponse) -> bool {
        if self.closing.load(Ordering::SeqCst) {
            debug!("Ignoring frame for closed program {}", self.label);
            return true;
        }

        let started = self.status.send_if_modified(|status| {
            if *status == ProgramStatus::Open {
                *status = ProgramStatus::Running;
                true
            } else {
                false
            }
        });
        if started {
            info!("Program {} is running", self.label);
        }

        if let Some(mime_type) = response.mime_type {
            *self.mime_type.lock() = Some(mime_type);
        }
        if let Some(pid) = response.pid {
            debug!("Program {} has pid {}", self.label, pid);
            self.pid.send_replace(Some(pid));
        }
        if let Some(data) = response.stdout_data {
            self.stdout.emit(&data);
            self.stdout_buffer.push(&data);
        }
        if let Some(data) = response.stderr_data {
            self.stderr.emit(&data);
            self.stderr_buffer.push(&data);
        }
        if let Some(code) = response.exit_code {
            self.close(Some(code));
            return true;
        }
        false
    }

    /// Transition to `Closed` and notify close listeners, at most once.
    ///
    /// Buffered output is flushed before the status changes, so anyone
    /// waiting on the status sees every write.
    fn close(&self, code: Option<i32>) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        *self.exit_code.lock() = code;
        self.stdout_buffer.seal();
        self.stderr_buffer.seal();
        self.status.send_replace(ProgramStatus::Closed);
        info!("Program {} closed with exit code {:?}", self.label, code);
        self.close.emit(&code);
    }
}

/// Snapshot of a program session for listings.
#[derive(Debug, Clone)]
pub struct ProgramInfo {
    /// Program id
    pub id: ProgramId,
    /// Program name
    pub program_name: String,
    /// Remote session the program runs in
    pub session_id: Option<String>,
    /// Current status
    pub status: ProgramStatus,
    /// Creation time
    pub created_at: SystemTime,
}

/// Execution of one remote program.
pub struct ProgramSession {
    id: ProgramId,
    options: ProgramOptions,
    session_id: Option<String>,
    created_at: SystemTime,
    requests: RequestSink,
    registry: Mutex<TerminalWindowRegistry>,
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
    disposed: tokio::sync::Mutex<bool>,
}

impl ProgramSession {
    /// Open the execute stream and send the initial frame.
    ///
    /// The initial frame never waits for a terminal window: it carries
    /// `options.winsize` when set, and later sizes go out as resize frames.
    pub(crate) async fn start(
        id: ProgramId,
        options: ProgramOptions,
        session_id: Option<String>,
        transport: &dyn RunnerTransport,
        config: &SessionManagerConfig,
    ) -> Result<Arc<Self>> {
        let ExecuteCall {
            requests,
            responses,
        } = transport.execute().await?;

        let label = format!("{} ({})", id, options.display_name());
        let stdout_policy = OutputPolicy {
            tty: options.tty,
            convert_eol: options.convert_eol,
            coalesce: Some(config.coalesce),
        };
        let stderr_policy = OutputPolicy {
            coalesce: config.coalesce_stderr.then_some(config.coalesce),
            ..stdout_policy
        };

        let write = Arc::new(Emitter::new());
        let error = Arc::new(Emitter::new());
        let (status, _) = watch::channel(ProgramStatus::Open);
        let (pid, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            label,
            status,
            closing: AtomicBool::new(false),
            pid,
            exit_code: Mutex::new(None),
            mime_type: Mutex::new(None),
            stdout: Emitter::new(),
            stderr: Emitter::new(),
            stdout_buffer: OutputBuffer::new(stdout_policy, Arc::clone(&write)),
            stderr_buffer: OutputBuffer::new(stderr_policy, Arc::clone(&error)),
            write,
            error,
            close: Emitter::new(),
        });

        requests.send(ExecuteRequest::initial(&options, session_id.clone()))?;
        info!(
            "Started program {} tty={} session={:?}",
            shared.label, options.tty, session_id
        );

        let reader = tokio::spawn(read_responses(Arc::clone(&shared), responses));

        Ok(Arc::new(Self {
            id,
            options,
            session_id,
            created_at: SystemTime::now(),
            requests,
            registry: Mutex::new(TerminalWindowRegistry::new()),
            shared,
            reader: Mutex::new(Some(reader)),
            disposed: tokio::sync::Mutex::new(false),
        }))
    }

    /// Program id.
    pub fn id(&self) -> ProgramId {
        self.id
    }

    /// Options the program was started with.
    pub fn options(&self) -> &ProgramOptions {
        &self.options
    }

    /// Remote session the program runs in.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Current status.
    pub fn status(&self) -> ProgramStatus {
        *self.shared.status.borrow()
    }

    /// Whether the session is closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Exit code, once the program exited with one.
    pub fn exit_code(&self) -> Option<i32> {
        *self.shared.exit_code.lock()
    }

    /// MIME type of the most recent output, as reported by the server.
    pub fn mime_type(&self) -> Option<String> {
        self.shared.mime_type.lock().clone()
    }

    /// Creation time.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Snapshot for listings.
    pub fn info(&self) -> ProgramInfo {
        ProgramInfo {
            id: self.id,
            program_name: self.options.program_name.clone(),
            session_id: self.session_id.clone(),
            status: self.status(),
            created_at: self.created_at,
        }
    }

    /// Listen for raw stdout bytes.
    pub fn on_stdout(&self, listener: impl Fn(&[u8]) + Send + Sync + 'static) -> ListenerId {
        self.shared
            .stdout
            .subscribe(move |data: &Vec<u8>| listener(data))
    }

    /// Listen for raw stderr bytes.
    pub fn on_stderr(&self, listener: impl Fn(&[u8]) + Send + Sync + 'static) -> ListenerId {
        self.shared
            .stderr
            .subscribe(move |data: &Vec<u8>| listener(data))
    }

    /// Listen for stdout display text.
    pub fn on_write(&self, listener: impl Fn(&str) + Send + Sync + 'static) -> ListenerId {
        self.shared
            .write
            .subscribe(move |text: &String| listener(text))
    }

    /// Listen for stderr display text.
    pub fn on_error(&self, listener: impl Fn(&str) + Send + Sync + 'static) -> ListenerId {
        self.shared
            .error
            .subscribe(move |text: &String| listener(text))
    }

    /// Listen for the close event; `None` when the exit code is unknown.
    pub fn on_close(&self, listener: impl Fn(Option<i32>) + Send + Sync + 'static) -> ListenerId {
        self.shared
            .close
            .subscribe(move |code: &Option<i32>| listener(*code))
    }

    /// Remove a listener registered on this session.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.stdout.unsubscribe(id)
            || self.shared.stderr.unsubscribe(id)
            || self.shared.write.unsubscribe(id)
            || self.shared.error.unsubscribe(id)
            || self.shared.close.unsubscribe(id)
    }

    /// Remote pid; resolves once a pid frame arrives, or with `None` when
    /// the session closes without one.
    pub async fn pid(&self) -> Option<u32> {
        let mut pid = self.shared.pid.subscribe();
        let mut status = self.shared.status.subscribe();
        tokio::select! {
            known = pid.wait_for(Option::is_some) => known.ok().and_then(|pid| *pid),
            _ = status.wait_for(|status| *status == ProgramStatus::Closed) => {
                *self.shared.pid.borrow()
            }
        }
    }

    /// Wait until the session is closed.
    pub async fn wait_closed(&self) {
        let mut status = self.shared.status.subscribe();
        let _ = status
            .wait_for(|status| *status == ProgramStatus::Closed)
            .await;
    }

    /// Send text input.
    pub fn write(&self, input: &str) -> Result<()> {
        self.write_bytes(input.as_bytes())
    }

    /// Send raw input bytes.
    pub fn write_bytes(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        debug!("Writing {} byte(s) to {}", data.len(), self.shared.label);
        self.requests.send(ExecuteRequest::input(data.to_vec()))
    }

    /// Interrupt or kill the program.
    pub fn stop(&self, stop: ExecuteStop) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        info!("Sending {:?} to {}", stop, self.shared.label);
        self.requests.send(ExecuteRequest::stop(stop))
    }

    /// Attach a front-end. The first window becomes active.
    pub fn register_terminal_window(&self, name: &str, dimensions: Option<Dimensions>) {
        self.registry.lock().register(name, dimensions);
    }

    /// Detach a front-end.
    pub fn unregister_terminal_window(&self, name: &str) {
        let mut registry = self.registry.lock();
        if let Some(winsize) = registry.unregister(name) {
            self.send_resize(winsize);
        }
    }

    /// Mark a window opened; `window` defaults to the active window.
    pub fn open(&self, dimensions: Option<Dimensions>, window: Option<&str>) {
        let mut registry = self.registry.lock();
        if let Some(winsize) = registry.open(dimensions, window) {
            self.send_resize(winsize);
        }
    }

    /// Record new dimensions; `window` defaults to the active window.
    pub fn set_dimensions(&self, dimensions: Dimensions, window: Option<&str>) -> Result<()> {
        let mut registry = self.registry.lock();
        if let Some(winsize) = registry.set_dimensions(dimensions, window)? {
            self.send_resize(winsize);
        }
        Ok(())
    }

    /// Switch the active window.
    pub fn set_active_terminal_window(&self, name: &str) {
        let mut registry = self.registry.lock();
        if let Some(winsize) = registry.set_active(name) {
            self.send_resize(winsize);
        }
    }

    /// Name of the active window.
    pub fn active_terminal_window(&self) -> Option<String> {
        self.registry.lock().active().map(str::to_string)
    }

    /// Registered windows in registration order.
    pub fn terminal_windows(&self) -> Vec<TerminalWindow> {
        self.registry.lock().windows().to_vec()
    }

    /// Complete the request stream and close the session. Idempotent;
    /// concurrent callers return once the first disposal finished.
    pub async fn dispose(&self) {
        let mut disposed = self.disposed.lock().await;
        if *disposed {
            return;
        }
        *disposed = true;

        debug!("Disposing program {}", self.shared.label);
        if let Err(e) = self.requests.complete().await {
            debug!(
                "Request stream of {} already ended: {}",
                self.shared.label, e
            );
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.shared.close(None);
    }

    /// Called with the registry lock held so frames leave in decision order.
    fn send_resize(&self, winsize: Winsize) {
        if self.is_closed() {
            debug!("Skipping resize for closed program {}", self.shared.label);
            return;
        }
        debug!(
            "Resizing {} to {}x{}",
            self.shared.label, winsize.cols, winsize.rows
        );
        if let Err(e) = self.requests.send(ExecuteRequest::resize(winsize)) {
            warn!("Failed to send resize for {}: {}", self.shared.label, e);
        }
    }
}

impl Drop for ProgramSession {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for ProgramSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramSession")
            .field("id", &self.id)
            .field("program", &self.options.program_name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

async fn read_responses(shared: Arc<Shared>, mut responses: ResponseStream) {
    while let Some(frame) = responses.recv().await {
        match frame {
            Ok(response) => {
                if shared.handle(response) {
                    return;
                }
            }
            Err(e) => {
                warn!("Execute stream of {} failed: {}", shared.label, e);
                shared.close(None);
                return;
            }
        }
    }

    if !shared.is_closed() {
        warn!("{}: {}", shared.label, Error::StreamClosedPrematurely);
        shared.close(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_server::testing::{MockExecution, MockRunner};
    use std::time::Duration;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn start(options: ProgramOptions) -> (Arc<ProgramSession>, MockExecution) {
        let runner = MockRunner::new();
        let session = ProgramSession::start(
            ProgramId::new(1),
            options,
            Some("s-1".to_string()),
            &runner,
            &SessionManagerConfig::default(),
        )
        .await
        .unwrap();
        let execution = runner.last_execution().unwrap();
        (session, execution)
    }

    #[tokio::test]
    async fn test_initial_frame_is_sent() {
        let mut options = ProgramOptions::new("bash");
        options.tty = true;
        options.winsize = Some(Dimensions::new(80, 24));
        let (session, execution) = start(options).await;
        settle().await;

        let initial = execution.initial_request().unwrap();
        assert_eq!(initial.program_name, "bash");
        assert_eq!(initial.session_id.as_deref(), Some("s-1"));
        assert_eq!(initial.winsize.map(|w| (w.cols, w.rows)), Some((80, 24)));
        assert_eq!(session.status(), ProgramStatus::Open);
    }

    #[tokio::test]
    async fn test_tty_without_size_starts_then_resizes_at_barrier() {
        let mut options = ProgramOptions::new("bash");
        options.tty = true;
        let (session, execution) = start(options).await;
        settle().await;
        assert_eq!(execution.initial_request().unwrap().winsize, None);

        session.register_terminal_window("main", None);
        session.open(Some(Dimensions::new(132, 43)), None);
        settle().await;

        let requests = execution.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[1].winsize.map(|w| (w.cols, w.rows)),
            Some((132, 43))
        );
    }

    #[tokio::test]
    async fn test_first_frame_moves_to_running() {
        let (session, execution) = start(ProgramOptions::new("ls")).await;
        execution.respond(ExecuteResponse::pid(77));
        assert_eq!(session.pid().await, Some(77));
        assert_eq!(session.status(), ProgramStatus::Running);
    }

    #[tokio::test]
    async fn test_pid_resolves_none_when_closed_without_pid() {
        let (session, execution) = start(ProgramOptions::new("ls")).await;
        execution.respond(ExecuteResponse::exit(0));
        assert_eq!(session.pid().await, None);
    }

    #[tokio::test]
    async fn test_stream_error_closes_without_code() {
        let (session, execution) = start(ProgramOptions::new("ls")).await;
        let codes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&codes);
        session.on_close(move |code| sink.lock().push(code));

        execution.fail("boom");
        session.wait_closed().await;
        assert_eq!(*codes.lock(), vec![None]);
    }

    #[tokio::test]
    async fn test_write_and_stop_frames() {
        let (session, execution) = start(ProgramOptions::new("cat")).await;
        session.write("hi\n").unwrap();
        session.stop(ExecuteStop::Interrupt).unwrap();
        settle().await;

        let requests = execution.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].input_data.as_deref(), Some(&b"hi\n"[..]));
        assert_eq!(requests[2].stop, Some(ExecuteStop::Interrupt));
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (session, execution) = start(ProgramOptions::new("cat")).await;
        execution.respond(ExecuteResponse::exit(5));
        session.wait_closed().await;
        assert_eq!(session.exit_code(), Some(5));
        assert!(matches!(session.write("x"), Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let (session, execution) = start(ProgramOptions::new("cat")).await;
        let seen = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&seen);
        let id = session.on_stdout(move |_| *counter.lock() += 1);
        assert!(session.remove_listener(id));
        assert!(!session.remove_listener(id));

        execution.respond(ExecuteResponse::stdout(b"x".to_vec()));
        execution.respond(ExecuteResponse::exit(0));
        session.wait_closed().await;
        assert_eq!(*seen.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_output_flushed_before_close() {
        let mut options = ProgramOptions::new("ls");
        options.convert_eol = true;
        let (session, execution) = start(options).await;

        let events = Arc::new(Mutex::new(Vec::new()));
        let writes = Arc::clone(&events);
        session.on_write(move |text| writes.lock().push(format!("write:{text}")));
        let closes = Arc::clone(&events);
        session.on_close(move |code| closes.lock().push(format!("close:{code:?}")));

        execution.respond(ExecuteResponse::stdout(b"a\nb".to_vec()));
        execution.respond(ExecuteResponse::exit(0));
        session.wait_closed().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            *events.lock(),
            vec![
                "write:\ra\r\r\nb".to_string(),
                "close:Some(0)".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_dispose_completes_stream_once() {
        let (session, execution) = start(ProgramOptions::new("cat")).await;
        let closes = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&closes);
        session.on_close(move |_| *counter.lock() += 1);

        session.dispose().await;
        session.dispose().await;
        assert!(execution.is_completed());
        assert!(session.is_closed());
        assert_eq!(*closes.lock(), 1);
    }
}
