//! Program options handed to the runtime by document collaborators.

use serde::{Deserialize, Serialize};

use crate::Dimensions;

/// Identifier of a program session, unique within one session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgramId(u64);

impl ProgramId {
    /// Wrap a raw counter value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw counter value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ProgramId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "program-{}", self.0)
    }
}

/// Options describing one remote program execution.
///
/// Immutable once the session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramOptions {
    /// Program to execute (e.g. "bash")
    pub program_name: String,
    /// Program arguments
    pub args: Vec<String>,
    /// Working directory on the server side
    pub cwd: Option<String>,
    /// Allocate a pseudo-terminal for the program
    pub tty: bool,
    /// Run detached from the foreground
    pub background: bool,
    /// Rewrite line endings for display when not running under a tty
    pub convert_eol: bool,
    /// Environment as "K=V" pairs
    pub env: Vec<String>,
    /// Initial terminal size, sent on the first frame of tty sessions
    pub winsize: Option<Dimensions>,
    /// Caller-side identity of the program, only used in logs
    pub known_name: Option<String>,
}

impl Default for ProgramOptions {
    fn default() -> Self {
        Self {
            program_name: if cfg!(windows) {
                "powershell.exe".to_string()
            } else {
                "bash".to_string()
            },
            args: Vec::new(),
            cwd: None,
            tty: false,
            background: false,
            convert_eol: false,
            env: Vec::new(),
            winsize: None,
            known_name: None,
        }
    }
}

impl ProgramOptions {
    /// Create options for `program_name` with defaults for everything else.
    pub fn new(program_name: impl Into<String>) -> Self {
        Self {
            program_name: program_name.into(),
            ..Self::default()
        }
    }

    /// Label used in log lines.
    pub fn display_name(&self) -> &str {
        self.known_name.as_deref().unwrap_or(&self.program_name)
    }
}

/// Name part of a "K=V" environment pair.
///
/// Returns `None` for entries without a name.
pub fn env_name(pair: &str) -> Option<&str> {
    let name = pair.split_once('=').map_or(pair, |(name, _)| name);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}
