//! Output buffering and display conversion for program output.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::events::Emitter;

/// Rewrite lone line feeds as CRLF; existing CRLF pairs are kept.
pub fn normalize_line_endings(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len() + text.len() / 8);
    let mut previous = None;
    for ch in text.chars() {
        if ch == '\n' && previous != Some('\r') {
            normalized.push('\r');
        }
        normalized.push(ch);
        previous = Some(ch);
    }
    normalized
}

/// Terminal-style end-of-line conversion of one display chunk: the chunk
/// starts with a carriage return and every line feed becomes CRLF.
pub fn convert_eol(text: &str) -> String {
    let mut converted = String::with_capacity(text.len() + 1);
    converted.push('\r');
    converted.push_str(&text.replace('\n', "\r\n"));
    converted
}

/// How one output stream is turned into display text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputPolicy {
    /// Interactive pseudo-terminal; bytes pass through unmodified
    pub tty: bool,
    /// Rewrite line endings for display
    pub convert_eol: bool,
    /// Coalescing window; `None` emits every chunk immediately
    pub coalesce: Option<Duration>,
}

impl OutputPolicy {
    /// Display text for already decoded `text`.
    pub fn render(&self, text: &str) -> String {
        if self.tty || !self.convert_eol {
            return text.to_string();
        }
        convert_eol(&normalize_line_endings(text))
    }

    fn coalesce_window(&self) -> Option<Duration> {
        if self.tty {
            None
        } else {
            self.coalesce
        }
    }
}

/// Decode `bytes` after any incomplete sequence left in `partial`.
///
/// A trailing incomplete sequence is kept in `partial` for the next call;
/// invalid sequences become U+FFFD.
fn decode_utf8(partial: &mut Vec<u8>, bytes: &[u8]) -> String {
    let mut input = std::mem::take(partial);
    input.extend_from_slice(bytes);

    let mut text = String::with_capacity(input.len());
    let mut rest = input.as_slice();
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                text.push_str(valid);
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                text.push_str(&String::from_utf8_lossy(valid));
                match e.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[len..];
                    }
                    None => {
                        partial.extend_from_slice(after);
                        break;
                    }
                }
            }
        }
    }
    text
}

#[derive(Debug, Default)]
struct BufferState {
    pending: Vec<u8>,
    /// Incomplete UTF-8 sequence carried into the next emission
    partial: Vec<u8>,
    generation: u64,
    timer_armed: bool,
    sealed: bool,
}

/// Coalescing buffer in front of a display emitter.
///
/// The first chunk into an empty buffer starts the coalescing window; chunks
/// arriving before it elapses join the same emission, so no chunk waits
/// longer than one window. Emission happens while the buffer lock is held,
/// so display listeners must not push into the same buffer.
#[derive(Clone)]
pub struct OutputBuffer {
    policy: OutputPolicy,
    state: Arc<Mutex<BufferState>>,
    display: Arc<Emitter<String>>,
}

impl OutputBuffer {
    /// Create a buffer emitting into `display`.
    pub fn new(policy: OutputPolicy, display: Arc<Emitter<String>>) -> Self {
        Self {
            policy,
            state: Arc::new(Mutex::new(BufferState::default())),
            display,
        }
    }

    /// Buffer policy.
    pub fn policy(&self) -> OutputPolicy {
        self.policy
    }

    /// Accept a chunk of output.
    ///
    /// Must be called within a tokio runtime when coalescing is enabled.
    pub fn push(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        if state.sealed {
            trace!("Dropping {} byte(s) pushed after seal", bytes.len());
            return;
        }

        let Some(window) = self.policy.coalesce_window() else {
            let text = decode_utf8(&mut state.partial, bytes);
            self.emit(&text);
            return;
        };

        state.pending.extend_from_slice(bytes);
        if state.timer_armed {
            return;
        }
        state.timer_armed = true;
        state.generation += 1;
        let generation = state.generation;
        drop(state);

        let buffer = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            buffer.flush_generation(generation);
        });
    }

    /// Emit pending output now.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        self.flush_locked(&mut state);
    }

    /// Flush and reject any further output.
    ///
    /// An incomplete trailing UTF-8 sequence is emitted as U+FFFD.
    pub fn seal(&self) {
        let mut state = self.state.lock();
        self.flush_locked(&mut state);
        if !state.partial.is_empty() {
            let partial = std::mem::take(&mut state.partial);
            self.emit(&String::from_utf8_lossy(&partial));
        }
        state.sealed = true;
    }

    /// Bytes waiting for the coalescing window.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether the buffer was sealed.
    pub fn is_sealed(&self) -> bool {
        self.state.lock().sealed
    }

    fn flush_generation(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation || state.sealed {
            return;
        }
        self.flush_locked(&mut state);
    }

    fn flush_locked(&self, state: &mut BufferState) {
        state.generation += 1;
        state.timer_armed = false;
        if state.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut state.pending);
        let text = decode_utf8(&mut state.partial, &pending);
        self.emit(&text);
    }

    fn emit(&self, text: &str) {
        if !text.is_empty() {
            self.display.emit(&self.policy.render(text));
        }
    }
}

impl std::fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputBuffer")
            .field("policy", &self.policy)
            .field("pending", &self.pending_len())
            .finish()
    }
}
