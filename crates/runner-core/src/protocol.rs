//! Wire protocol for the runner RPC surface.
//!
//! Messages travel as newline-delimited JSON envelopes over a single
//! connection. Every envelope carries a `type` tag and a client-chosen `id`;
//! execute streams are multiplexed by that id. Byte payloads are base64.

use serde::{Deserialize, Serialize};

use crate::{Dimensions, ProgramOptions};

/// Terminal size as transmitted to the remote pseudo-terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Winsize {
    /// Number of rows
    pub rows: u16,
    /// Number of columns
    pub cols: u16,
    /// Width in pixels (unused, always 0)
    #[serde(default)]
    pub x: u16,
    /// Height in pixels (unused, always 0)
    #[serde(default)]
    pub y: u16,
}

impl From<Dimensions> for Winsize {
    fn from(dims: Dimensions) -> Self {
        Self {
            rows: dims.rows,
            cols: dims.cols,
            x: 0,
            y: 0,
        }
    }
}

impl From<Winsize> for Dimensions {
    fn from(winsize: Winsize) -> Self {
        Dimensions::new(winsize.cols, winsize.rows)
    }
}

/// `CreateSession` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Caller-supplied "K=V" pairs
    #[serde(default)]
    pub envs: Vec<String>,
}

/// Remote execution context as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSession {
    /// Opaque server-assigned identifier
    pub id: String,
    /// Environment visible in the session, as "K=V" pairs
    #[serde(default)]
    pub envs: Vec<String>,
}

/// `CreateSession` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    /// The created session
    pub session: RemoteSession,
}

/// `DeleteSession` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSessionRequest {
    /// Session to delete
    pub id: String,
}

/// Stop signal carried on an execute frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteStop {
    /// Deliver an interrupt (Ctrl+C)
    Interrupt,
    /// Kill the program
    Kill,
}

/// Client → server frame of an `Execute` stream.
///
/// The first frame carries the program description; subsequent frames carry
/// only input, resize or stop data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteRequest {
    /// Program to execute (first frame only)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub program_name: String,
    /// Program arguments (first frame only)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
    /// Working directory (first frame only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    /// Environment as "K=V" pairs (first frame only)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub envs: Vec<String>,
    /// Allocate a pseudo-terminal
    pub tty: bool,
    /// Run in the background
    pub background: bool,
    /// Remote session to execute in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Input bytes for the program
    #[serde(with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub input_data: Option<Vec<u8>>,
    /// Terminal size update
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winsize: Option<Winsize>,
    /// Stop signal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<ExecuteStop>,
}

impl ExecuteRequest {
    /// First frame for a program execution.
    pub fn initial(options: &ProgramOptions, session_id: Option<String>) -> Self {
        let winsize = if options.tty {
            options.winsize.map(Winsize::from)
        } else {
            None
        };

        Self {
            program_name: options.program_name.clone(),
            arguments: options.args.clone(),
            directory: options.cwd.clone(),
            envs: options.env.clone(),
            tty: options.tty,
            background: options.background,
            session_id,
            input_data: None,
            winsize,
            stop: None,
        }
    }

    /// Frame carrying program input.
    pub fn input(data: impl Into<Vec<u8>>) -> Self {
        Self {
            input_data: Some(data.into()),
            ..Self::default()
        }
    }

    /// Frame carrying a terminal size update.
    pub fn resize(winsize: Winsize) -> Self {
        Self {
            winsize: Some(winsize),
            ..Self::default()
        }
    }

    /// Frame carrying a stop signal.
    pub fn stop(stop: ExecuteStop) -> Self {
        Self {
            stop: Some(stop),
            ..Self::default()
        }
    }
}

/// Server → client frame of an `Execute` stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteResponse {
    /// Bytes written by the program to stdout
    #[serde(with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub stdout_data: Option<Vec<u8>>,
    /// Bytes written by the program to stderr
    #[serde(with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub stderr_data: Option<Vec<u8>>,
    /// Detected MIME type of the output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Exit code; the last frame of the stream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Process id of the remote program
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl ExecuteResponse {
    /// Frame carrying stdout bytes.
    pub fn stdout(data: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout_data: Some(data.into()),
            ..Self::default()
        }
    }

    /// Frame carrying stderr bytes.
    pub fn stderr(data: impl Into<Vec<u8>>) -> Self {
        Self {
            stderr_data: Some(data.into()),
            ..Self::default()
        }
    }

    /// Frame carrying the exit code.
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    /// Frame carrying the remote pid.
    pub fn pid(pid: u32) -> Self {
        Self {
            pid: Some(pid),
            ..Self::default()
        }
    }
}

/// Envelope sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Health probe
    Health {
        /// Call id
        id: u64,
    },
    /// Unary `CreateSession`
    CreateSession {
        /// Call id
        id: u64,
        /// Request body
        request: CreateSessionRequest,
    },
    /// Unary `DeleteSession`
    DeleteSession {
        /// Call id
        id: u64,
        /// Request body
        request: DeleteSessionRequest,
    },
    /// One frame of an execute stream
    Execute {
        /// Stream id
        id: u64,
        /// Frame body
        request: ExecuteRequest,
    },
    /// Client half-close of an execute stream
    ExecuteEnd {
        /// Stream id
        id: u64,
    },
}

impl ClientMessage {
    /// Call or stream id of the envelope.
    pub fn id(&self) -> u64 {
        match self {
            Self::Health { id }
            | Self::CreateSession { id, .. }
            | Self::DeleteSession { id, .. }
            | Self::Execute { id, .. }
            | Self::ExecuteEnd { id } => *id,
        }
    }
}

/// Envelope sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Health probe answer
    Health {
        /// Call id
        id: u64,
        /// Whether the server accepts work
        serving: bool,
    },
    /// `CreateSession` answer
    CreateSession {
        /// Call id
        id: u64,
        /// Response body
        response: CreateSessionResponse,
    },
    /// `DeleteSession` answer
    DeleteSession {
        /// Call id
        id: u64,
    },
    /// One frame of an execute stream
    Execute {
        /// Stream id
        id: u64,
        /// Frame body
        response: ExecuteResponse,
    },
    /// Server end of an execute stream
    ExecuteEnd {
        /// Stream id
        id: u64,
    },
    /// Failure of a call or stream
    Error {
        /// Call or stream id
        id: u64,
        /// Error description
        message: String,
    },
}

impl ServerMessage {
    /// Call or stream id of the envelope.
    pub fn id(&self) -> u64 {
        match self {
            Self::Health { id, .. }
            | Self::CreateSession { id, .. }
            | Self::DeleteSession { id }
            | Self::Execute { id, .. }
            | Self::ExecuteEnd { id }
            | Self::Error { id, .. } => *id,
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|text| STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_frame_carries_program() {
        let mut options = ProgramOptions::new("bash");
        options.args = vec!["-c".to_string(), "echo hi".to_string()];
        options.cwd = Some("/tmp".to_string());
        options.env = vec!["FOO=bar".to_string()];
        options.tty = true;
        options.winsize = Some(Dimensions::new(100, 30));

        let frame = ExecuteRequest::initial(&options, Some("session-1".to_string()));
        assert_eq!(frame.program_name, "bash");
        assert_eq!(frame.arguments.len(), 2);
        assert_eq!(frame.directory.as_deref(), Some("/tmp"));
        assert_eq!(frame.envs, vec!["FOO=bar".to_string()]);
        assert!(frame.tty);
        assert_eq!(frame.session_id.as_deref(), Some("session-1"));
        assert_eq!(
            frame.winsize,
            Some(Winsize {
                rows: 30,
                cols: 100,
                x: 0,
                y: 0
            })
        );
    }

    #[test]
    fn test_initial_frame_omits_winsize_without_tty() {
        let mut options = ProgramOptions::new("ls");
        options.winsize = Some(Dimensions::new(100, 30));
        let frame = ExecuteRequest::initial(&options, None);
        assert_eq!(frame.winsize, None);
    }

    #[test]
    fn test_input_frame_is_base64_on_the_wire() {
        let message = ClientMessage::Execute {
            id: 4,
            request: ExecuteRequest::input(b"ls\n".to_vec()),
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains(r#""type":"execute""#));
        assert!(json.contains(r#""input_data":"bHMK""#));
        assert!(!json.contains("program_name"));
    }

    #[test]
    fn test_server_message_decoding() {
        let line = r#"{"type":"execute","id":9,"response":{"stdout_data":"aGk=","mime_type":"text/plain"}}"#;
        let message: ServerMessage = serde_json::from_str(line).unwrap();
        assert_eq!(message.id(), 9);
        match message {
            ServerMessage::Execute { response, .. } => {
                assert_eq!(response.stdout_data.as_deref(), Some(&b"hi"[..]));
                assert_eq!(response.mime_type.as_deref(), Some("text/plain"));
                assert_eq!(response.exit_code, None);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let line = r#"{"type":"execute","id":1,"response":{"stdout_data":"***"}}"#;
        assert!(serde_json::from_str::<ServerMessage>(line).is_err());
    }

    #[test]
    fn test_error_envelope() {
        let line = r#"{"type":"error","id":2,"message":"session not found"}"#;
        let message: ServerMessage = serde_json::from_str(line).unwrap();
        assert_eq!(
            message,
            ServerMessage::Error {
                id: 2,
                message: "session not found".to_string()
            }
        );
    }

    #[test]
    fn test_winsize_dimensions_conversion() {
        let winsize = Winsize::from(Dimensions::new(120, 40));
        assert_eq!(winsize.cols, 120);
        assert_eq!(winsize.rows, 40);
        assert_eq!(Dimensions::from(winsize), Dimensions::new(120, 40));
    }
}
