//! WebSocket entry point for interactive execution sessions.
//!
//! Protocol: the first text frame is the handshake `{"code", "language"}`.
//! After that every text frame is one line for the process's stdin, and the
//! server streams `{"type", "data"}` frames until the session ends, then
//! closes the socket.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::error::ExecError;
use crate::job::ExecutionJob;
use crate::protocol::ServerFrame;
use crate::relay::SessionEvent;
use crate::session;
use crate::state::AppState;

/// How long queued frames may take to flush after the session ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// `GET /ws/execute`
pub async fn execute_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let config = &state.config;
    let (mut sink, mut stream) = socket.split();

    let handshake = read_handshake(&mut stream);
    let job = match tokio::time::timeout(config.handshake_timeout, handshake).await {
        Ok(Some(Ok(job))) => job,
        Ok(Some(Err(e))) => {
            warn!(error = %e, "Handshake rejected");
            let _ = send_frame(&mut sink, &ServerFrame::error(&e)).await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
        Ok(None) => {
            debug!("Client left before handshake");
            return;
        }
        Err(_) => {
            let e = ExecError::handshake("Handshake not received in time");
            warn!(error = %e, "Handshake rejected");
            let _ = send_frame(&mut sink, &ServerFrame::error(&e)).await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    info!(
        session = %job.id,
        target = %job.target,
        bytes = job.source_code.len(),
        created_at = %job.created_at,
        "Handshake accepted"
    );

    let (event_tx, event_rx) = mpsc::channel(config.output_buffer);
    let (input_tx, input_rx) = mpsc::channel(config.input_buffer);

    let mut writer = tokio::spawn(write_frames(sink, event_rx));
    let reader = tokio::spawn(read_lines(stream, input_tx));

    let report = session::run(&job, config, state.remote.as_ref(), event_tx, input_rx).await;

    if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        warn!(session = %report.session_id, "Client did not drain final frames");
        writer.abort();
    }
    reader.abort();
    info!(
        session = %report.session_id,
        pid = ?report.pid,
        kill_signals = report.kill_signals,
        artifact = ?report.artifact,
        ok = report.outcome.is_ok(),
        "Connection closed"
    );
}

/// Wait for the first text frame. `None` means the client went away first.
async fn read_handshake(
    stream: &mut SplitStream<WebSocket>,
) -> Option<Result<ExecutionJob, ExecError>> {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(ExecutionJob::from_handshake(&text)),
            Ok(Message::Binary(_)) => {
                return Some(Err(ExecError::handshake(
                    "Malformed handshake: expected a text frame",
                )))
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return None,
        }
    }
    None
}

/// Session events → socket. Closes the socket once the session drops its senders.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut events: mpsc::Receiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        if let SessionEvent::Output(chunk) = &event {
            trace!(channel = ?chunk.channel, sequence = chunk.sequence, "Frame out");
        }
        if let Err(e) = send_frame(&mut sink, &ServerFrame::from(event)).await {
            debug!(error = %e, "Socket write failed");
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

/// Socket → stdin lines. Returning drops `lines`, which the session reads as a disconnect.
async fn read_lines(mut stream: SplitStream<WebSocket>, lines: mpsc::Sender<String>) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if lines.send(text).await.is_err() {
                    return;
                }
            }
            Ok(Message::Close(_)) => {
                debug!("Client closed the socket");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Socket read failed");
                return;
            }
        }
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(text) => sink.send(Message::Text(text)).await,
        Err(e) => {
            warn!(error = %e, "Frame serialization failed");
            Ok(())
        }
    }
}
