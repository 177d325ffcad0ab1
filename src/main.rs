//! CodeRefine - code review and interactive execution backend.
//!
//! Usage:
//!   coderefine serve [--port 8000]                   # Start HTTP + WebSocket server
//!   coderefine run --language python script.py       # Run one file and print its output

#[cfg(not(unix))]
compile_error!("coderefine only works on Unix-like systems.");

mod artifact;
mod config;
mod error;
mod gateway;
mod http_server;
mod job;
mod language;
mod protocol;
mod relay;
mod remote;
mod review;
mod runner;
mod session;
mod state;
#[cfg(test)]
mod test_support;

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::{
    Config, DEFAULT_GROQ_BASE_URL, DEFAULT_GROQ_MODEL, DEFAULT_OUTPUT_BUFFER, DEFAULT_PISTON_URL,
    DEFAULT_PORT, DEFAULT_TIMEOUT_MS,
};
use crate::language::Target;
use crate::remote::{PistonClient, RemoteExecutor};
use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "coderefine")]
#[command(about = "Code review and execution backend with a WebSocket process channel")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        host: IpAddr,

        /// Port to listen on
        #[arg(long, env = "CODEREFINE_PORT", default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Output frames buffered per session before the process is held back
        #[arg(long, default_value_t = DEFAULT_OUTPUT_BUFFER)]
        output_buffer: usize,

        #[arg(long, env = "GROQ_API_KEY", hide_env_values = true)]
        groq_api_key: Option<String>,

        #[arg(long, env = "GROQ_BASE_URL", default_value = DEFAULT_GROQ_BASE_URL)]
        groq_base_url: String,

        #[arg(long, env = "GROQ_MODEL", default_value = DEFAULT_GROQ_MODEL)]
        groq_model: String,

        #[command(flatten)]
        exec: ExecArgs,
    },

    /// Run a source file once and print its output
    Run {
        /// Language tag (python, javascript, c, cpp, java, go, typescript, r)
        #[arg(long)]
        language: String,

        /// Text passed on standard input
        #[arg(long, default_value = "")]
        stdin: String,

        /// Source file to execute
        file: PathBuf,

        #[command(flatten)]
        exec: ExecArgs,
    },
}

/// Settings shared by both subcommands.
#[derive(clap::Args, Debug)]
struct ExecArgs {
    /// Wall-clock time limit in milliseconds
    #[arg(long, env = "CODEREFINE_TIMEOUT_MS", default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Directory for temporary source files
    #[arg(long, env = "CODEREFINE_TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Python interpreter
    #[arg(long, env = "CODEREFINE_PYTHON", default_value = "python3")]
    python: String,

    /// Node.js interpreter
    #[arg(long, env = "CODEREFINE_NODE", default_value = "node")]
    node: String,

    /// Remote execution endpoint for compiled languages
    #[arg(long, env = "PISTON_URL", default_value = DEFAULT_PISTON_URL)]
    piston_url: String,
}

impl ExecArgs {
    fn into_config(self) -> Config {
        let mut config = Config {
            exec_timeout: Duration::from_millis(self.timeout_ms),
            python_bin: self.python,
            node_bin: self.node,
            ..Config::default()
        };
        if let Some(dir) = self.temp_dir {
            config.temp_dir = dir;
        }
        config.remote.url = self.piston_url;
        config
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve {
            host,
            port,
            output_buffer,
            groq_api_key,
            groq_base_url,
            groq_model,
            exec,
        } => {
            let mut config = exec.into_config();
            config.listen = SocketAddr::new(host, port);
            config.output_buffer = output_buffer.max(1);
            config.review.api_key = groq_api_key.filter(|key| !key.is_empty());
            config.review.base_url = groq_base_url;
            config.review.model = groq_model;
            if config.review.api_key.is_none() {
                tracing::warn!("GROQ_API_KEY is not set, /api/analyze will return fallback results");
            }

            let listen = config.listen;
            let state = match AppState::new(config) {
                Ok(state) => state,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            };
            if let Err(e) = http_server::run_server(listen, state).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        Commands::Run {
            language,
            stdin,
            file,
            exec,
        } => {
            let config = exec.into_config();
            match run_file(&config, &language, &file, &stdin).await {
                Ok(code) => exit(code),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            }
        }
    }
}

/// CLI mode: execute one file and mirror its output. Returns the exit code.
async fn run_file(
    config: &Config,
    language: &str,
    file: &Path,
    stdin: &str,
) -> Result<i32, Box<dyn std::error::Error>> {
    let code = tokio::fs::read_to_string(file).await?;
    match Target::resolve(language)? {
        Target::Local(language) => {
            let result = runner::run_to_completion(config, language, &code, stdin).await?;
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            Ok(result.exit_code.unwrap_or(1))
        }
        Target::Remote(language) => {
            let client = PistonClient::new(config)?;
            let output = client.execute(language, &code, stdin).await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            Ok(0)
        }
    }
}
