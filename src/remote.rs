//! Remote execution collaborator for languages not run locally.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::language::RemoteLanguage;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Piston API Error: {0}")]
    Status(u16),
    #[error("Unexpected response from Piston API")]
    Unexpected,
    #[error("Piston API request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// What the remote service printed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs a submission somewhere else and returns its output in one piece.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(
        &self,
        language: RemoteLanguage,
        code: &str,
        stdin: &str,
    ) -> Result<RemoteOutput, RemoteError>;
}

#[derive(Serialize)]
struct PistonRequest<'a> {
    language: &'a str,
    version: &'a str,
    files: [PistonFile<'a>; 1],
    stdin: &'a str,
    compile_timeout: u64,
    run_timeout: u64,
}

#[derive(Serialize)]
struct PistonFile<'a> {
    name: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct PistonResponse {
    run: Option<PistonStage>,
    compile: Option<PistonStage>,
}

#[derive(Deserialize)]
struct PistonStage {
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
}

/// Client for a Piston-compatible `/execute` endpoint.
#[derive(Debug, Clone)]
pub struct PistonClient {
    http: reqwest::Client,
    url: String,
    compile_timeout_ms: u64,
    run_timeout_ms: u64,
}

impl PistonClient {
    pub fn new(config: &Config) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(config.remote.budget)
            .build()?;
        Ok(Self {
            http,
            url: config.remote.url.clone(),
            compile_timeout_ms: config.remote.compile_timeout_ms,
            run_timeout_ms: config.run_timeout_ms(),
        })
    }
}

#[async_trait]
impl RemoteExecutor for PistonClient {
    async fn execute(
        &self,
        language: RemoteLanguage,
        code: &str,
        stdin: &str,
    ) -> Result<RemoteOutput, RemoteError> {
        let request = PistonRequest {
            language: language.runtime_name(),
            version: "*",
            files: [PistonFile {
                name: language.file_name(),
                content: code,
            }],
            stdin,
            compile_timeout: self.compile_timeout_ms,
            run_timeout: self.run_timeout_ms,
        };
        debug!(%language, url = %self.url, "Remote execution request");

        let response = self.http.post(&self.url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(%language, status = status.as_u16(), "Remote execution rejected");
            return Err(RemoteError::Status(status.as_u16()));
        }

        let body: PistonResponse = response.json().await.map_err(|e| {
            warn!(error = %e, "Remote execution response not understood");
            RemoteError::Unexpected
        })?;
        into_output(body)
    }
}

fn into_output(body: PistonResponse) -> Result<RemoteOutput, RemoteError> {
    let run = body.run.ok_or(RemoteError::Unexpected)?;
    let mut stderr = run.stderr.unwrap_or_default();
    let compile_stderr = body
        .compile
        .and_then(|stage| stage.stderr)
        .filter(|text| !text.is_empty());
    if let Some(compile_stderr) = compile_stderr {
        stderr = format!("Compilation Error:\n{compile_stderr}\n{stderr}");
    }
    Ok(RemoteOutput {
        stdout: run.stdout.unwrap_or_default(),
        stderr,
    })
}
