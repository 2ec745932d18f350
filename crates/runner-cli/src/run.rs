//! Running one program end to end.

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use runner_core::{ExecuteStop, RunnerConfig};
use runner_server::ServerSupervisor;
use runner_session::{ProgramSession, SessionManager, SessionManagerConfig};

use crate::cli::Args;

/// Exit status reported when the program closed without an exit code.
pub const EXIT_INDETERMINATE: i32 = 1;

const INPUT_CHUNK: usize = 4096;

/// Start the server, run the program with stdin forwarded, tear down.
///
/// Returns the program's exit code.
pub async fn run(args: &Args, config: &RunnerConfig) -> anyhow::Result<i32> {
    run_with_input(args, config, tokio::io::stdin()).await
}

/// Like [`run`], reading program input from `input`.
pub async fn run_with_input<R>(
    args: &Args,
    config: &RunnerConfig,
    input: R,
) -> anyhow::Result<i32>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let supervisor = ServerSupervisor::new(config.server_config());
    let outcome = serve(args, config, &supervisor, input).await;
    supervisor.dispose();
    outcome
}

async fn serve<R>(
    args: &Args,
    config: &RunnerConfig,
    supervisor: &ServerSupervisor,
    input: R,
) -> anyhow::Result<i32>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    supervisor
        .start()
        .await
        .context("failed to start runner server")?;
    info!("Runner server ready on port {}", supervisor.port());

    let manager = SessionManager::with_config(
        supervisor.subscribe(),
        SessionManagerConfig::from(&config.output),
    );
    let outcome = execute(args, &manager, input).await;
    manager.dispose().await;
    outcome
}

async fn execute<R>(args: &Args, manager: &SessionManager, input: R) -> anyhow::Result<i32>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let environment = manager
        .create_environment(args.session_env.clone())
        .await
        .context("failed to create remote environment")?;
    let program = manager
        .create_program_session(args.program_options(), Some(&environment))
        .await
        .with_context(|| format!("failed to start {}", args.program))?;

    program.on_write(|text| print_to(&mut std::io::stdout().lock(), text));
    program.on_error(|text| print_to(&mut std::io::stderr().lock(), text));

    let forwarder = tokio::spawn(forward_input(input, Arc::clone(&program)));

    let mut interrupts = 0u32;
    loop {
        tokio::select! {
            _ = program.wait_closed() => break,
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for interrupts")?;
                interrupts += 1;
                match interrupts {
                    1 => stop(&program, ExecuteStop::Interrupt),
                    2 => stop(&program, ExecuteStop::Kill),
                    _ => {
                        warn!("Abandoning {}", args.program);
                        program.dispose().await;
                    }
                }
            }
        }
    }
    forwarder.abort();

    Ok(program.exit_code().unwrap_or(EXIT_INDETERMINATE))
}

fn stop(program: &ProgramSession, signal: ExecuteStop) {
    info!("Sending {:?} to program {}", signal, program.id());
    if let Err(e) = program.stop(signal) {
        warn!("Failed to stop program {}: {}", program.id(), e);
    }
}

fn print_to(out: &mut impl Write, text: &str) {
    if let Err(e) = out.write_all(text.as_bytes()).and_then(|_| out.flush()) {
        debug!("Dropping program output: {}", e);
    }
}

/// Copy `input` into the program until either side ends.
async fn forward_input<R>(mut input: R, program: Arc<ProgramSession>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; INPUT_CHUNK];
    loop {
        let read = match input.read(&mut buf).await {
            Ok(0) => {
                debug!("Input ended for program {}", program.id());
                return;
            }
            Ok(read) => read,
            Err(e) => {
                warn!("Failed to read input: {}", e);
                return;
            }
        };
        if let Err(e) = program.write_bytes(&buf[..read]) {
            debug!("Program {} no longer accepts input: {}", program.id(), e);
            return;
        }
    }
}
