//! bridge-echo-worker - reference worker for worker-bridge
//!
//! Binds a local TCP port (ephemeral by default), announces it on stdout as
//! `BRIDGE_PORT:<port>` and serves newline-delimited JSON-RPC. Requests run
//! concurrently, so slow methods complete after fast ones. Logs go to stderr.
//!
//! Usage: `bridge-echo-worker [--port N] [--no-announce] [--exit-before-announce]`

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use worker_bridge::framing::{write_frame, LineFramer};
use worker_bridge::protocol::{
    encode_response, RequestId, RpcResponse, PING_METHOD, PROTOCOL_VERSION, SHUTDOWN_METHOD,
};

const PORT_MARKER: &str = "BRIDGE_PORT";

const METHODS: &[&str] = &[
    PING_METHOD,
    SHUTDOWN_METHOD,
    "echo",
    "sleep",
    "fail",
    "hang",
    "disconnect",
    "pid",
];

// JSON-RPC 2.0 error codes
const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INTERNAL_ERROR: i32 = -32603;

/// Reference worker speaking newline-delimited JSON-RPC over TCP
#[derive(Parser, Debug)]
#[command(name = "bridge-echo-worker")]
struct Options {
    /// Port to bind on 127.0.0.1 (0 picks an ephemeral port)
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Do not print the port announcement
    #[arg(long)]
    no_announce: bool,

    /// Exit with status 3 before binding
    #[arg(long)]
    exit_before_announce: bool,
}

/// What the connection writer does after sending a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum After {
    Continue,
    Close,
    Shutdown,
}

struct Reply {
    frame: Vec<u8>,
    after: After,
}

impl Reply {
    fn new(response: RpcResponse, after: After) -> Option<Self> {
        match encode_response(&response) {
            Ok(frame) => Some(Self { frame, after }),
            Err(e) => {
                warn!("Could not encode response: {}", e);
                None
            }
        }
    }

    fn error(id: Option<RequestId>, code: i32, message: impl Into<String>) -> Option<Self> {
        Self::new(RpcResponse::failure(id, code, message), After::Continue)
    }
}

/// Handle one request frame. `None` means no reply is ever sent.
async fn respond(frame: String) -> Option<Reply> {
    let request: Value = match serde_json::from_str(&frame) {
        Ok(request) => request,
        Err(e) => return Reply::error(None, PARSE_ERROR, format!("Parse error: {e}")),
    };

    let id = request.get("id").and_then(Value::as_str).map(RequestId::from);
    if request.get("jsonrpc").and_then(Value::as_str) != Some(PROTOCOL_VERSION) {
        return Reply::error(
            id,
            INVALID_REQUEST,
            "Invalid Request: jsonrpc must be '2.0'",
        );
    }
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        return Reply::error(id, INVALID_REQUEST, "Invalid Request: method required");
    };
    let Some(id) = id else {
        return Reply::error(None, INVALID_REQUEST, "Invalid Request: id required");
    };
    let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

    debug!(id = %id, method, "Handling request");
    let (result, after) = match method {
        PING_METHOD => (json!({"pong": true, "methods": METHODS}), After::Continue),
        SHUTDOWN_METHOD => (json!({"shutting_down": true}), After::Shutdown),
        "echo" => (params, After::Continue),
        "sleep" => {
            let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            (json!({"slept_ms": ms}), After::Continue)
        }
        "fail" => {
            let code = params
                .get("code")
                .and_then(Value::as_i64)
                .and_then(|code| i32::try_from(code).ok())
                .unwrap_or(INTERNAL_ERROR);
            let message = params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Requested failure");
            let mut response = RpcResponse::failure(Some(id), code, message);
            if let Some(error) = response.error.as_mut() {
                error.data = params.get("data").cloned();
            }
            return Reply::new(response, After::Continue);
        }
        "hang" => {
            debug!(id = %id, "Never answering");
            return None;
        }
        "disconnect" => (json!({"disconnecting": true}), After::Close),
        "pid" => (json!({"pid": std::process::id()}), After::Continue),
        other => {
            return Reply::error(
                Some(id),
                METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )
        }
    };

    Reply::new(RpcResponse::success(id, result), after)
}

async fn serve_connection(stream: TcpStream, shutdown: Arc<Notify>) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    info!(peer = %peer, "Client connected");

    let (mut reader, mut writer) = stream.into_split();
    let (replies_tx, mut replies_rx) = mpsc::unbounded_channel::<Reply>();

    let mut write_task = tokio::spawn(async move {
        while let Some(reply) = replies_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &reply.frame).await {
                warn!("Write failed: {}", e);
                break;
            }
            match reply.after {
                After::Continue => {}
                After::Close => break,
                After::Shutdown => {
                    shutdown.notify_one();
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = &mut write_task => break,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("Read failed: {}", e);
                break;
            }
        };
        for frame in framer.push(&buf[..n]) {
            let replies = replies_tx.clone();
            match frame {
                Ok(frame) => {
                    tokio::spawn(async move {
                        if let Some(reply) = respond(frame).await {
                            let _ = replies.send(reply);
                        }
                    });
                }
                Err(e) => {
                    if let Some(reply) = Reply::error(None, PARSE_ERROR, e.to_string()) {
                        let _ = replies.send(reply);
                    }
                }
            }
        }
    }

    info!(peer = %peer, "Client disconnected");
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(e) => {
            warn!("Could not install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::parse();

    // stdout carries the port announcement only
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "bridge_echo_worker=info".into()),
        ))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    if options.exit_before_announce {
        warn!("Exiting before announcing a port");
        std::process::exit(3);
    }

    // Accepted sockets inherit keep-alive from the listener.
    let socket = TcpSocket::new_v4().context("Failed to create socket")?;
    socket.set_reuseaddr(true)?;
    socket.set_keepalive(true)?;
    socket
        .bind(SocketAddr::from((Ipv4Addr::LOCALHOST, options.port)))
        .with_context(|| format!("Failed to bind port {}", options.port))?;
    let listener = socket.listen(1024).context("Failed to listen")?;
    let port = listener.local_addr()?.port();

    if !options.no_announce {
        let mut stdout = std::io::stdout();
        writeln!(stdout, "{PORT_MARKER}:{port}")?;
        stdout.flush()?;
    }
    info!(port, pid = std::process::id(), "Server started on 127.0.0.1:{}", port);

    let shutdown = Arc::new(Notify::new());
    let interrupted = tokio::signal::ctrl_c();
    let terminated = terminate_signal();
    tokio::pin!(interrupted, terminated);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(serve_connection(stream, Arc::clone(&shutdown)));
                }
                Err(e) => warn!("Accept failed: {}", e),
            },
            _ = shutdown.notified() => {
                info!("Shutdown requested");
                break;
            }
            _ = &mut interrupted => {
                info!("Interrupted");
                break;
            }
            _ = &mut terminated => {
                info!("Received SIGTERM");
                break;
            }
        }
    }

    info!("Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_announce_on_ephemeral_port() {
        let options = Options::try_parse_from(["bridge-echo-worker"]).expect("parse");
        assert_eq!(options.port, 0);
        assert!(!options.no_announce);
        assert!(!options.exit_before_announce);
    }

    #[test]
    fn test_flags_in_any_order() {
        let options = Options::try_parse_from([
            "bridge-echo-worker",
            "--exit-before-announce",
            "--port",
            "0",
            "--no-announce",
        ])
        .expect("parse");
        assert!(options.no_announce);
        assert!(options.exit_before_announce);
    }

    #[test]
    fn test_bad_port_is_rejected() {
        assert!(Options::try_parse_from(["bridge-echo-worker", "--port", "http"]).is_err());
    }
}
