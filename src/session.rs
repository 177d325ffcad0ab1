//! One execution session: from a validated job to a torn-down process.
//!
//! The session talks to its client only through two queues, so the same
//! code path serves the WebSocket gateway and the tests:
//!
//! * `events`: bounded, session → client. Both output relays share it. When
//!   the client is slow the relays block, the pipes fill and the child blocks.
//! * `input`: client → session, one stdin line per message. Closing it means
//!   the client is gone.
//!
//! Teardown runs on every exit path: the process group is torn down exactly
//! once, the relays are drained or aborted, the source file is removed, and
//! at most one error event is sent.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::artifact::SourceArtifact;
use crate::config::Config;
use crate::error::ExecError;
use crate::job::ExecutionJob;
use crate::language::{Language, RemoteLanguage, Target};
use crate::relay::{self, Channel, SessionEvent, StreamChunk};
use crate::remote::RemoteExecutor;
use crate::runner;

/// How long the final error notice may wait for room in the client queue.
const NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

/// What happened to a session, for logging and tests.
#[derive(Debug)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub pid: Option<u32>,
    /// Path of the source file while it existed.
    pub artifact: Option<PathBuf>,
    pub kill_signals: usize,
    pub outcome: Result<Option<i32>, ExecError>,
}

impl SessionReport {
    fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            pid: None,
            artifact: None,
            kill_signals: 0,
            outcome: Ok(None),
        }
    }

    /// Record the outcome and tell the client about failures.
    async fn finish(
        mut self,
        outcome: Result<Option<i32>, ExecError>,
        events: &mpsc::Sender<SessionEvent>,
    ) -> Self {
        match &outcome {
            Ok(code) => info!(exit_code = ?code, "Session finished"),
            Err(e) if e.is_silent() => info!("Session ended by client"),
            Err(e) => {
                warn!(error = %e, "Session failed");
                let notice = SessionEvent::Error(e.to_string());
                if events.send_timeout(notice, NOTICE_TIMEOUT).await.is_err() {
                    debug!("Client queue stuck, error notice dropped");
                }
            }
        }
        self.outcome = outcome;
        self
    }
}

/// Run `job` to the end, wherever its language executes.
pub async fn run(
    job: &ExecutionJob,
    config: &Config,
    remote: &dyn RemoteExecutor,
    events: mpsc::Sender<SessionEvent>,
    input: mpsc::Receiver<String>,
) -> SessionReport {
    let span = tracing::info_span!("session", id = %job.id, target = %job.target);
    async move {
        match job.target {
            Target::Local(language) => run_local(job, language, config, events, input).await,
            Target::Remote(language) => run_remote(job, language, remote, events).await,
        }
    }
    .instrument(span)
    .await
}

/// Execute a local job with interactive stdin and streamed output.
pub async fn run_local(
    job: &ExecutionJob,
    language: Language,
    config: &Config,
    events: mpsc::Sender<SessionEvent>,
    input: mpsc::Receiver<String>,
) -> SessionReport {
    let mut report = SessionReport::new(job.id);

    let mut artifact =
        match SourceArtifact::materialize(&config.temp_dir, language.suffix(), &job.source_code) {
            Ok(artifact) => artifact,
            Err(e) => return report.finish(Err(e), &events).await,
        };
    report.artifact = Some(artifact.path().to_path_buf());

    let command = language.command(config, artifact.path());
    let mut process = match runner::spawn(&command, &config.temp_dir) {
        Ok(process) => process,
        Err(e) => {
            artifact.release();
            return report.finish(Err(e), &events).await;
        }
    };
    report.pid = Some(process.pid());

    let pipes = match process.take_pipes() {
        Ok(pipes) => pipes,
        Err(e) => {
            process.terminate().await;
            report.kill_signals = process.kill_signals();
            artifact.release();
            return report.finish(Err(e), &events).await;
        }
    };

    let disconnect = CancellationToken::new();
    let stop_reads = CancellationToken::new();
    let stdout_task = tokio::spawn(
        relay::pump(pipes.stdout, Channel::Stdout, events.clone(), stop_reads.clone())
            .in_current_span(),
    );
    let stderr_task = tokio::spawn(
        relay::pump(pipes.stderr, Channel::Stderr, events.clone(), stop_reads.clone())
            .in_current_span(),
    );
    let stdin_task =
        tokio::spawn(relay::feed(pipes.stdin, input, disconnect.clone()).in_current_span());

    let limit = config.exec_timeout;
    let mut outcome = tokio::select! {
        status = process.wait() => exit_code(status),
        () = tokio::time::sleep(limit) => Err(ExecError::Timeout { limit }),
        () = disconnect.cancelled() => Err(ExecError::Disconnected),
        () = events.closed() => Err(ExecError::Disconnected),
    };
    debug!(?outcome, "Session resolved, tearing down");

    process.terminate().await;
    report.kill_signals = process.kill_signals();
    stdin_task.abort();
    let flushed = relay::drain(
        [stdout_task, stderr_task],
        config.drain_grace,
        &stop_reads,
        config.flush_limit,
    )
    .await;
    artifact.release();
    if !flushed && outcome.is_ok() {
        outcome = Err(ExecError::runtime("output truncated, client did not keep up"));
    }

    report.finish(outcome, &events).await
}

fn exit_code(status: std::io::Result<ExitStatus>) -> Result<Option<i32>, ExecError> {
    status
        .map(|status| status.code())
        .map_err(|e| ExecError::runtime(format!("wait for process: {e}")))
}

/// Execute a job on the remote collaborator and replay its output.
pub async fn run_remote(
    job: &ExecutionJob,
    language: RemoteLanguage,
    remote: &dyn RemoteExecutor,
    events: mpsc::Sender<SessionEvent>,
) -> SessionReport {
    let report = SessionReport::new(job.id);
    let output = match remote.execute(language, &job.source_code, "").await {
        Ok(output) => output,
        Err(e) => return report.finish(Err(ExecError::runtime(e.to_string())), &events).await,
    };

    for (channel, payload) in [(Channel::Stdout, output.stdout), (Channel::Stderr, output.stderr)] {
        if payload.is_empty() {
            continue;
        }
        let chunk = StreamChunk {
            channel,
            payload,
            sequence: 0,
        };
        if events.send(SessionEvent::Output(chunk)).await.is_err() {
            return report.finish(Err(ExecError::Disconnected), &events).await;
        }
    }
    report.finish(Ok(None), &events).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RemoteError, RemoteOutput};
    use crate::test_support::process_alive;
    use async_trait::async_trait;
    use std::path::Path;
    use tokio::task::JoinHandle;

    struct NoRemote;

    #[async_trait]
    impl RemoteExecutor for NoRemote {
        async fn execute(
            &self,
            _language: RemoteLanguage,
            _code: &str,
            _stdin: &str,
        ) -> Result<RemoteOutput, RemoteError> {
            Err(RemoteError::Unexpected)
        }
    }

    struct EchoRemote;

    #[async_trait]
    impl RemoteExecutor for EchoRemote {
        async fn execute(
            &self,
            language: RemoteLanguage,
            code: &str,
            _stdin: &str,
        ) -> Result<RemoteOutput, RemoteError> {
            Ok(RemoteOutput {
                stdout: format!("{language}:{code}"),
                stderr: "warning".into(),
            })
        }
    }

    fn config_in(dir: &Path) -> Config {
        Config {
            temp_dir: dir.to_path_buf(),
            exec_timeout: Duration::from_secs(10),
            ..Config::default()
        }
    }

    fn python(code: &str) -> ExecutionJob {
        ExecutionJob::new(code, Target::Local(Language::Python))
    }

    /// Collects every event until the session drops its sender.
    fn collector(mut rx: mpsc::Receiver<SessionEvent>) -> JoinHandle<Vec<SessionEvent>> {
        tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        })
    }

    fn text(events: &[SessionEvent], channel: Channel) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Output(chunk) if chunk.channel == channel => {
                    Some(chunk.payload.as_str())
                }
                _ => None,
            })
            .collect()
    }

    fn errors(events: &[SessionEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Error(message) => Some(message.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Like `collector`, but takes `delay` to handle each event.
    fn slow_collector(
        mut rx: mpsc::Receiver<SessionEvent>,
        delay: Duration,
    ) -> JoinHandle<Vec<SessionEvent>> {
        tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                tokio::time::sleep(delay).await;
                events.push(event);
            }
            events
        })
    }

    fn assert_torn_down(report: &SessionReport) {
        assert!(report.kill_signals <= 1);
        let artifact = report.artifact.as_ref().expect("artifact path recorded");
        assert!(!artifact.exists(), "source file left behind");
        let pid = report.pid.expect("pid recorded");
        assert!(!process_alive(pid), "process {pid} still alive");
    }

    #[tokio::test]
    async fn stdout_order_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let (tx, rx) = mpsc::channel(16);
        let (_input_tx, input_rx) = mpsc::channel(4);
        let events = collector(rx);

        let job = python("print('A')\nprint('B')\n");
        let report = run(&job, &config, &NoRemote, tx, input_rx).await;
        let events = events.await.unwrap();

        assert_eq!(report.outcome.as_ref().unwrap(), &Some(0));
        assert_eq!(text(&events, Channel::Stdout), "A\nB\n");
        assert!(errors(&events).is_empty());
        assert_torn_down(&report);
    }

    #[tokio::test]
    async fn stdin_lines_reach_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let (tx, rx) = mpsc::channel(16);
        let (input_tx, input_rx) = mpsc::channel(4);
        let events = collector(rx);

        input_tx.send("hello".to_string()).await.unwrap();
        let job = python("line = input()\nprint('echo:' + line)\n");
        let report = run(&job, &config, &NoRemote, tx, input_rx).await;
        let events = events.await.unwrap();

        assert_eq!(report.outcome.as_ref().unwrap(), &Some(0));
        assert_eq!(text(&events, Channel::Stdout), "echo:hello\n");
        assert_torn_down(&report);
    }

    #[tokio::test]
    async fn stderr_is_its_own_channel() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let (tx, rx) = mpsc::channel(16);
        let (_input_tx, input_rx) = mpsc::channel(4);
        let events = collector(rx);

        let job = python("import sys\nprint('out')\nprint('err', file=sys.stderr)\nsys.exit(2)\n");
        let report = run(&job, &config, &NoRemote, tx, input_rx).await;
        let events = events.await.unwrap();

        assert_eq!(report.outcome.as_ref().unwrap(), &Some(2));
        assert_eq!(text(&events, Channel::Stdout), "out\n");
        assert_eq!(text(&events, Channel::Stderr), "err\n");
    }

    #[tokio::test]
    async fn infinite_loop_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            exec_timeout: Duration::from_millis(500),
            ..config_in(dir.path())
        };
        let (tx, rx) = mpsc::channel(16);
        let (_input_tx, input_rx) = mpsc::channel(4);
        let events = collector(rx);

        let job = python("print('started')\nwhile True:\n    pass\n");
        let start = std::time::Instant::now();
        let report = run(&job, &config, &NoRemote, tx, input_rx).await;
        let events = events.await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(report.outcome, Err(ExecError::Timeout { .. })));
        assert_eq!(text(&events, Channel::Stdout), "started\n");
        assert_eq!(errors(&events), ["Execution timed out (500ms limit)"]);
        // the notice comes after the output already streamed
        assert!(matches!(events.last(), Some(SessionEvent::Error(_))));
        assert_torn_down(&report);
        assert_eq!(report.kill_signals, 1);
    }

    #[tokio::test]
    async fn client_disconnect_tears_down_silently() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let (tx, rx) = mpsc::channel(16);
        let (input_tx, input_rx) = mpsc::channel(4);
        let events = collector(rx);

        let job = python("import time\ntime.sleep(30)\n");
        let session = tokio::spawn(async move { run(&job, &config, &NoRemote, tx, input_rx).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(input_tx);

        let report = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("session should end promptly")
            .unwrap();
        let events = events.await.unwrap();

        assert!(matches!(report.outcome, Err(ExecError::Disconnected)));
        assert!(errors(&events).is_empty());
        assert_torn_down(&report);
        assert_eq!(report.kill_signals, 1);
    }

    #[tokio::test]
    async fn closed_event_queue_counts_as_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let (tx, rx) = mpsc::channel(16);
        let (_input_tx, input_rx) = mpsc::channel(4);
        drop(rx);

        let job = python("import time\ntime.sleep(30)\n");
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            run(&job, &config, &NoRemote, tx, input_rx),
        )
        .await
        .expect("session should end promptly");

        assert!(matches!(report.outcome, Err(ExecError::Disconnected)));
        assert_torn_down(&report);
        assert_eq!(report.kill_signals, 1);
    }

    #[tokio::test]
    async fn exit_racing_disconnect_still_kills_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let (tx, rx) = mpsc::channel(16);
        let (input_tx, input_rx) = mpsc::channel(4);
        let events = collector(rx);
        drop(input_tx);

        let job = python("pass\n");
        let report = run(&job, &config, &NoRemote, tx, input_rx).await;
        events.await.unwrap();

        assert!(report.outcome.is_ok() || matches!(report.outcome, Err(ExecError::Disconnected)));
        assert_torn_down(&report);
    }

    #[tokio::test]
    async fn slow_client_receives_all_output_after_exit() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            exec_timeout: Duration::from_secs(30),
            drain_grace: Duration::from_millis(100),
            ..config_in(dir.path())
        };
        let (tx, rx) = mpsc::channel(4);
        let (_input_tx, input_rx) = mpsc::channel(4);
        let events = slow_collector(rx, Duration::from_millis(50));

        let job = python("import sys\nfor _ in range(400):\n    sys.stdout.write('x' * 255 + '\\n')\n");
        let report = run(&job, &config, &NoRemote, tx, input_rx).await;
        let events = events.await.unwrap();

        assert_eq!(report.outcome.as_ref().unwrap(), &Some(0));
        let stdout = text(&events, Channel::Stdout);
        assert_eq!(stdout.len(), 400 * 256);
        assert_eq!(stdout.lines().count(), 400);
        assert!(errors(&events).is_empty());
        assert_torn_down(&report);
    }

    #[tokio::test]
    async fn stalled_client_gets_a_truncation_notice() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            drain_grace: Duration::from_millis(50),
            flush_limit: Duration::from_millis(300),
            ..config_in(dir.path())
        };
        let (tx, mut rx) = mpsc::channel(2);
        let (_input_tx, input_rx) = mpsc::channel(4);
        let events = tokio::spawn(async move {
            // stalls long enough for the flush limit to pass
            tokio::time::sleep(Duration::from_millis(1500)).await;
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        });

        let job = python("import sys\nfor _ in range(40):\n    sys.stdout.write('y' * 1023 + '\\n')\n");
        let report = run(&job, &config, &NoRemote, tx, input_rx).await;
        let events = events.await.unwrap();

        assert!(matches!(report.outcome, Err(ExecError::Runtime(_))));
        assert!(text(&events, Channel::Stdout).len() < 40 * 1024);
        assert_eq!(errors(&events), ["output truncated, client did not keep up"]);
        assert_torn_down(&report);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_without_a_process() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            python_bin: "coderefine-missing-python".into(),
            ..config_in(dir.path())
        };
        let (tx, rx) = mpsc::channel(16);
        let (_input_tx, input_rx) = mpsc::channel(4);
        let events = collector(rx);

        let report = run(&python("print(1)"), &config, &NoRemote, tx, input_rx).await;
        let events = events.await.unwrap();

        assert!(matches!(report.outcome, Err(ExecError::Spawn { .. })));
        assert!(report.pid.is_none());
        assert_eq!(report.kill_signals, 0);
        assert!(!report.artifact.unwrap().exists());
        let errors = errors(&events);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("coderefine-missing-python"));
    }

    #[tokio::test]
    async fn remote_output_is_replayed() {
        let config = Config::default();
        let (tx, rx) = mpsc::channel(16);
        let (_input_tx, input_rx) = mpsc::channel(4);
        let events = collector(rx);

        let job = ExecutionJob::new("int main(){}", Target::Remote(RemoteLanguage::C));
        let report = run(&job, &config, &EchoRemote, tx, input_rx).await;
        let events = events.await.unwrap();

        assert!(report.outcome.is_ok());
        assert!(report.pid.is_none());
        assert_eq!(text(&events, Channel::Stdout), "c:int main(){}");
        assert_eq!(text(&events, Channel::Stderr), "warning");
    }

    #[tokio::test]
    async fn remote_failure_becomes_error_event() {
        let config = Config::default();
        let (tx, rx) = mpsc::channel(16);
        let (_input_tx, input_rx) = mpsc::channel(4);
        let events = collector(rx);

        let job = ExecutionJob::new("x", Target::Remote(RemoteLanguage::Go));
        let report = run(&job, &config, &NoRemote, tx, input_rx).await;
        let events = events.await.unwrap();

        assert!(matches!(report.outcome, Err(ExecError::Runtime(_))));
        assert_eq!(errors(&events), ["Unexpected response from Piston API"]);
    }
}
