//! Runtime configuration shared read-only by every handler.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_OUTPUT_BUFFER: usize = 256;
pub const DEFAULT_PISTON_URL: &str = "https://emkc.org/api/v2/piston/execute";
pub const DEFAULT_GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_GROQ_MODEL: &str = "llama-3.3-70b-versatile";

/// Everything a session or collaborator needs to know about its environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    /// Wall-clock budget for one execution, measured from spawn.
    pub exec_timeout: Duration,
    /// Directory that holds the per-session source files.
    pub temp_dir: PathBuf,
    pub python_bin: String,
    pub node_bin: String,
    /// Outbound frames queued per session before the relays block.
    pub output_buffer: usize,
    pub input_buffer: usize,
    /// How long output relays keep waiting on open pipes after the process is gone.
    pub drain_grace: Duration,
    /// Upper bound on waiting for a slow client to take the remaining output.
    pub flush_limit: Duration,
    /// How long a new connection may take to send its handshake.
    pub handshake_timeout: Duration,
    pub remote: RemoteConfig,
    pub review: ReviewConfig,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub url: String,
    pub budget: Duration,
    pub compile_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ReviewConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            exec_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            temp_dir: std::env::temp_dir(),
            python_bin: "python3".to_string(),
            node_bin: "node".to_string(),
            output_buffer: DEFAULT_OUTPUT_BUFFER,
            input_buffer: 32,
            drain_grace: Duration::from_millis(1000),
            flush_limit: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(30),
            remote: RemoteConfig::default(),
            review: ReviewConfig::default(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_PISTON_URL.to_string(),
            budget: Duration::from_secs(15),
            compile_timeout_ms: 10_000,
        }
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_GROQ_BASE_URL.to_string(),
            model: DEFAULT_GROQ_MODEL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Run timeout handed to the remote executor, in milliseconds.
    pub fn run_timeout_ms(&self) -> u64 {
        u64::try_from(self.exec_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}
