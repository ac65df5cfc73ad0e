// src/server.rs

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::config::Configuration;
use crate::error::AgentError;
use crate::sys::engine::{Engine, OperationReport};
use crate::sys::ops;

/// One request frame: a line of JSON on the Unix socket.
#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<String>,
    op: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    status: &'static str,
    code: u8,
    detail: String,
    steps_completed: Vec<String>,
    rollback_failures: Vec<String>,
}

impl Response {
    fn from_report(id: Option<String>, report: OperationReport) -> Self {
        Self {
            id,
            status: report.outcome.as_str(),
            code: report.code,
            detail: report.detail,
            steps_completed: report.steps_completed,
            rollback_failures: report.rollback_failures,
        }
    }

    fn rejected(id: Option<String>, error: AgentError) -> Self {
        Self {
            id,
            status: "failed",
            code: error.result_code(),
            detail: error.to_string(),
            steps_completed: Vec::new(),
            rollback_failures: Vec::new(),
        }
    }
}

/// Serves panel requests over the permission-restricted Unix socket.
///
/// Connections are handled concurrently; conflicting work is serialized
/// further down by the per-resource locks and the session pool, not here.
pub struct AgentServer {
    config: Arc<Configuration>,
    engine: Arc<Engine>,
    shutdown: CancellationToken,
}

impl AgentServer {
    pub fn new(config: Arc<Configuration>, engine: Arc<Engine>, shutdown: CancellationToken) -> Self {
        Self { config, engine, shutdown }
    }

    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> std::io::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("shutdown requested, stopping listener");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, _addr) = accepted?;
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            tracing::warn!(error = %e, "connection ended with error");
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, stream: UnixStream) -> std::io::Result<()> {
        // Socket permissions already restrict connects to the owning group;
        // the peer UID check pins it down to the panel process itself.
        let cred = stream.peer_cred()?;
        if cred.uid() != self.config.panel_uid {
            tracing::warn!(peer_uid = cred.uid(), expected = self.config.panel_uid,
                "rejecting connection from unexpected uid");
            return Ok(());
        }

        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<Request>(&line) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => {
                    // A malformed frame poisons the stream; answer once
                    // and drop the connection.
                    let response = Response::rejected(
                        None,
                        AgentError::Protocol(format!("malformed request frame: {}", e)),
                    );
                    write_response(&mut write_half, &response).await?;
                    return Ok(());
                }
            };
            write_response(&mut write_half, &response).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> Response {
        tracing::info!(op = %request.op, "request received");
        match ops::build(&self.config, self.engine.rules(), &request.op, request.params) {
            Ok(operation) => {
                let report = self.engine.run(operation, &self.shutdown).await;
                Response::from_report(request.id, report)
            }
            Err(e) => Response::rejected(request.id, e),
        }
    }
}

async fn write_response(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    response: &Response,
) -> std::io::Result<()> {
    let mut frame = serde_json::to_vec(response).map_err(std::io::Error::other)?;
    frame.push(b'\n');
    write_half.write_all(&frame).await
}
