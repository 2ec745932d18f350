//! Command line arguments and their mapping onto configuration.

use std::path::PathBuf;

use clap::Parser;

use runner_core::{env_name, Dimensions, ProgramOptions, RunnerConfig};

/// Run a program through a runner server.
#[derive(Debug, Clone, Parser)]
#[command(name = "runner-exec", version, about, long_about = None)]
pub struct Args {
    /// YAML configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Runner server executable
    #[arg(long, value_name = "PATH")]
    pub binary: Option<PathBuf>,

    /// Host the server listens on
    #[arg(long)]
    pub host: Option<String>,

    /// First port to try
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Talk to the server without TLS
    #[arg(long)]
    pub insecure: bool,

    /// Directory holding cert.pem and key.pem
    #[arg(long, value_name = "DIR")]
    pub tls_dir: Option<PathBuf>,

    /// Use an already running server instead of spawning one
    #[arg(long)]
    pub external: bool,

    /// Launch retries after the first attempt
    #[arg(long, value_name = "N")]
    pub max_attempts: Option<u32>,

    /// Give up after the first failed launch
    #[arg(long, conflicts_with = "max_attempts")]
    pub no_retry: bool,

    /// Log filter when RUST_LOG is unset
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Variable seeded into the remote environment
    #[arg(long = "session-env", value_name = "K=V", value_parser = parse_env_pair)]
    pub session_env: Vec<String>,

    /// Variable set for the program only
    #[arg(short, long = "env", value_name = "K=V", value_parser = parse_env_pair)]
    pub env: Vec<String>,

    /// Working directory of the program
    #[arg(long)]
    pub cwd: Option<String>,

    /// Allocate a pseudo terminal
    #[arg(short, long)]
    pub tty: bool,

    /// Convert bare line feeds for display
    #[arg(long)]
    pub convert_eol: bool,

    /// Initial terminal size
    #[arg(long, value_name = "COLSxROWS", requires = "tty")]
    pub winsize: Option<Dimensions>,

    /// Detach the program from the session
    #[arg(long)]
    pub background: bool,

    /// Program to run
    pub program: String,

    /// Program arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl Args {
    /// Load the configuration file (or defaults) with flag overrides applied.
    pub fn load_config(&self) -> runner_core::Result<RunnerConfig> {
        let mut config = match &self.config {
            Some(path) => RunnerConfig::from_file(path)?,
            None => RunnerConfig::default(),
        };
        self.apply_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Overwrite configuration values with the flags that were given.
    pub fn apply_overrides(&self, config: &mut RunnerConfig) {
        let server = &mut config.server;
        if let Some(binary) = &self.binary {
            server.binary_path = Some(binary.clone());
        }
        if let Some(host) = &self.host {
            server.host = host.clone();
        }
        if let Some(port) = self.port {
            server.port = port;
        }
        if self.insecure {
            server.tls_enabled = false;
        }
        if let Some(dir) = &self.tls_dir {
            server.tls_dir = Some(dir.clone());
        }
        if self.external {
            server.managed = false;
        }

        if let Some(attempts) = self.max_attempts {
            config.retry.retry_on_failure = true;
            config.retry.max_attempts = attempts;
        }
        if self.no_retry {
            config.retry.retry_on_failure = false;
        }

        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }

    /// Options for the program session.
    pub fn program_options(&self) -> ProgramOptions {
        ProgramOptions {
            program_name: self.program.clone(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
            tty: self.tty,
            background: self.background,
            convert_eol: self.convert_eol,
            env: self.env.clone(),
            winsize: self.winsize,
            known_name: None,
        }
    }
}

fn parse_env_pair(pair: &str) -> Result<String, String> {
    match pair.split_once('=') {
        Some(_) if env_name(pair).is_some() => Ok(pair.to_string()),
        _ => Err(format!("expected K=V, got '{pair}'")),
    }
}
