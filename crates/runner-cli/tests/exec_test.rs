//! End-to-end runs of `runner-exec` against a scripted external runner.

use std::io::Write as _;
use std::sync::{Arc, Mutex};

use clap::Parser;
use runner_cli::{run_with_input, Args, EXIT_INDETERMINATE};
use runner_core::{
    ClientMessage, CreateSessionResponse, ExecuteResponse, RemoteSession, ServerMessage,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

type Log = Arc<Mutex<Vec<ClientMessage>>>;

async fn reply(write: &mut tokio::net::tcp::OwnedWriteHalf, message: ServerMessage) {
    let mut line = serde_json::to_string(&message).unwrap();
    line.push('\n');
    write.write_all(line.as_bytes()).await.unwrap();
}

/// Scripted runner:
/// - `exit N` exits with N right away
/// - `echo` writes its first input back to stdout, then exits with 0
/// - `hang` ends the stream without an exit code
async fn serve(stream: TcpStream, log: Log) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let message: ClientMessage = serde_json::from_str(&line).unwrap();
        log.lock().unwrap().push(message.clone());
        match message {
            ClientMessage::Health { id } => {
                reply(&mut write, ServerMessage::Health { id, serving: true }).await
            }
            ClientMessage::CreateSession { id, request } => {
                let response = CreateSessionResponse {
                    session: RemoteSession {
                        id: "env-1".to_string(),
                        envs: request.envs,
                    },
                };
                reply(&mut write, ServerMessage::CreateSession { id, response }).await
            }
            ClientMessage::DeleteSession { id, .. } => {
                reply(&mut write, ServerMessage::DeleteSession { id }).await
            }
            ClientMessage::Execute { id, request } => match request.program_name.as_str() {
                "exit" => {
                    let code = request
                        .arguments
                        .first()
                        .and_then(|arg| arg.parse().ok())
                        .unwrap_or(0);
                    let response = ExecuteResponse::pid(100);
                    reply(&mut write, ServerMessage::Execute { id, response }).await;
                    let response = ExecuteResponse::exit(code);
                    reply(&mut write, ServerMessage::Execute { id, response }).await;
                }
                "hang" => reply(&mut write, ServerMessage::ExecuteEnd { id }).await,
                "" => {
                    if let Some(data) = request.input_data {
                        let response = ExecuteResponse::stdout(data);
                        reply(&mut write, ServerMessage::Execute { id, response }).await;
                        let response = ExecuteResponse::exit(0);
                        reply(&mut write, ServerMessage::Execute { id, response }).await;
                    }
                }
                _ => {}
            },
            ClientMessage::ExecuteEnd { id } => {
                reply(&mut write, ServerMessage::ExecuteEnd { id }).await
            }
        }
    }
}

async fn start_runner() -> (u16, Log) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let log: Log = Arc::default();
    let server_log = Arc::clone(&log);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream, Arc::clone(&server_log)));
        }
    });
    (port, log)
}

fn external_args(port: u16, program: &[&str]) -> Args {
    let port = port.to_string();
    let mut argv = vec![
        "runner-exec",
        "--external",
        "--insecure",
        "--no-retry",
        "--host",
        "127.0.0.1",
        "--port",
        port.as_str(),
        "--session-env",
        "MODE=test",
    ];
    argv.extend_from_slice(program);
    Args::try_parse_from(argv).unwrap()
}

#[tokio::test]
async fn test_exit_code_is_returned() {
    let (port, log) = start_runner().await;
    let args = external_args(port, &["exit", "7"]);
    let config = args.load_config().unwrap();

    let code = run_with_input(&args, &config, tokio::io::empty())
        .await
        .unwrap();
    assert_eq!(code, 7);

    let log = log.lock().unwrap();
    let created = log.iter().find_map(|message| match message {
        ClientMessage::CreateSession { request, .. } => Some(request.envs.clone()),
        _ => None,
    });
    assert_eq!(created, Some(vec!["MODE=test".to_string()]));

    let initial = log.iter().find_map(|message| match message {
        ClientMessage::Execute { request, .. } if !request.program_name.is_empty() => {
            Some(request.clone())
        }
        _ => None,
    });
    assert_eq!(
        initial.and_then(|request| request.session_id),
        Some("env-1".to_string())
    );
    assert!(log.iter().any(|message| matches!(
        message,
        ClientMessage::DeleteSession { request, .. } if request.id == "env-1"
    )));
}

#[tokio::test]
async fn test_input_is_forwarded() {
    let (port, log) = start_runner().await;
    let args = external_args(port, &["echo"]);
    let config = args.load_config().unwrap();

    let code = run_with_input(&args, &config, &b"hello\n"[..])
        .await
        .unwrap();
    assert_eq!(code, 0);

    let inputs: Vec<Vec<u8>> = log
        .lock()
        .unwrap()
        .iter()
        .filter_map(|message| match message {
            ClientMessage::Execute { request, .. } => request.input_data.clone(),
            _ => None,
        })
        .collect();
    assert_eq!(inputs, vec![b"hello\n".to_vec()]);
}

#[tokio::test]
async fn test_stream_end_without_exit_code() {
    let (port, _log) = start_runner().await;
    let args = external_args(port, &["hang"]);
    let config = args.load_config().unwrap();

    let code = run_with_input(&args, &config, tokio::io::empty())
        .await
        .unwrap();
    assert_eq!(code, EXIT_INDETERMINATE);
}

#[tokio::test]
async fn test_missing_server_fails() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "retry:\n  poll_attempts: 2\n  poll_interval_ms: 10").unwrap();
    let config_path = file.path().to_string_lossy().to_string();
    let port = port.to_string();
    let args = Args::try_parse_from([
        "runner-exec",
        "--config",
        config_path.as_str(),
        "--external",
        "--insecure",
        "--no-retry",
        "--port",
        port.as_str(),
        "true",
    ])
    .unwrap();
    let config = args.load_config().unwrap();
    assert_eq!(config.retry.poll_attempts, 2);

    let error = run_with_input(&args, &config, tokio::io::empty())
        .await
        .unwrap_err();
    assert!(format!("{error:#}").contains("failed to start runner server"));
}
