//! Socket ownership, connection state machine and recovery.
//!
//! # State Machine
//!
//! ```text
//!                 connect()
//!  Disconnected ────────────► Connecting ──────► Connected
//!       ▲                                          │  socket closed/error,
//!       │ restart failed                           │  worker exited
//!       │                                          ▼
//!   Restarting ◄──── reconnect failed ──── Reconnecting (worker alive)
//!       │            or worker dead                │
//!       └──────────────► Connected ◄───────────────┘
//! ```
//!
//! Every failure signal (socket closed, write failed, worker exited) goes
//! through one supervisor task, so decisions are made in a single execution
//! context. Signals carry the connection generation or worker epoch they
//! belong to; signals from a previous socket or worker are ignored, which
//! makes "exited" and "closed" arriving in either order, or twice, safe.
//! The two in-flight flags guarantee at most one recovery path runs.
//!
//! A socket stops counting as usable the moment its reader sees EOF or a
//! write on it fails, before the supervisor has reacted. Requests already
//! written on a lost socket are written again when the next one is
//! installed.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::correlator::Correlator;
use crate::error::BridgeError;
use crate::events::{BridgeEvent, EventBus};
use crate::framing::{write_frame, LineFramer};
use crate::process::WorkerControl;
use crate::protocol::RequestId;

/// Socket read buffer size.
const READ_CHUNK: usize = 8 * 1024;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Restarting,
}

impl ConnectionState {
    pub fn is_recovering(self) -> bool {
        matches!(self, ConnectionState::Reconnecting | ConnectionState::Restarting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Restarting => "restarting",
        };
        f.write_str(name)
    }
}

/// Failure signals consumed by the supervisor.
#[derive(Debug)]
pub(crate) enum Signal {
    /// The socket of `generation` closed, errored, or failed a write.
    SocketClosed { generation: u64, reason: String },
    /// The worker launched as `epoch` exited on its own.
    ProcessExited { epoch: u64, status: String },
    /// `ensure_connected()` found the bridge disconnected with a live worker.
    Kick,
}

/// What started a recovery cycle.
#[derive(Debug)]
enum Cause {
    SocketClosed(String),
    ProcessExited(String),
    Requested,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::SocketClosed(reason) => write!(f, "socket {reason}"),
            Cause::ProcessExited(status) => write!(f, "worker exited ({status})"),
            Cause::Requested => f.write_str("reconnect requested"),
        }
    }
}

/// How many recovery cycles have begun.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    pub reconnects: u64,
    pub restarts: u64,
    pub failures: u64,
}

/// Single-in-flight guard for one recovery path.
#[derive(Debug, Default)]
struct InFlight(AtomicBool);

impl InFlight {
    fn try_begin(&self) -> Option<InFlightToken<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InFlightToken(&self.0))
    }

    fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct InFlightToken<'a>(&'a AtomicBool);

impl Drop for InFlightToken<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn open_socket(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    // Detect a silently dead peer.
    socket.set_keepalive(true)?;
    let stream = socket.connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Read frames until the socket closes, then report it.
async fn read_loop(
    mut reader: OwnedReadHalf,
    generation: u64,
    open: Arc<AtomicU64>,
    correlator: Arc<Correlator>,
    signals: mpsc::UnboundedSender<Signal>,
    events: EventBus,
) {
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; READ_CHUNK];

    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break "closed by worker".to_string(),
            Ok(n) => {
                for frame in framer.push(&buf[..n]) {
                    match frame {
                        Ok(frame) => correlator.handle_frame(&frame),
                        Err(e) => {
                            warn!(generation, "{}", e);
                            events.emit(BridgeEvent::Error {
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }
            Err(e) => break format!("read failed: {e}"),
        }
    };

    debug!(generation, "Socket reader finished: {}", reason);
    // No new writes on this socket from here on.
    let _ = open.compare_exchange(generation, 0, Ordering::SeqCst, Ordering::SeqCst);
    let _ = signals.send(Signal::SocketClosed { generation, reason });
}

/// Owns the socket to the worker and keeps it alive.
pub struct ConnectionManager {
    config: Arc<BridgeConfig>,
    worker: Arc<dyn WorkerControl>,
    correlator: Arc<Correlator>,
    events: EventBus,
    signals: mpsc::UnboundedSender<Signal>,
    state: watch::Sender<ConnectionState>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Bumped whenever a socket is installed or torn down.
    generation: AtomicU64,
    /// Generation of the usable socket, 0 when there is none.
    open: Arc<AtomicU64>,
    shutting_down: AtomicBool,
    reconnecting: InFlight,
    restarting: InFlight,
    last_failure: Mutex<Option<String>>,
    reconnects: AtomicU64,
    restarts: AtomicU64,
    failures: AtomicU64,
}

impl ConnectionManager {
    pub(crate) fn new(
        config: Arc<BridgeConfig>,
        worker: Arc<dyn WorkerControl>,
        correlator: Arc<Correlator>,
        events: EventBus,
        signals: mpsc::UnboundedSender<Signal>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            worker,
            correlator,
            events,
            signals,
            state,
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            generation: AtomicU64::new(0),
            open: Arc::new(AtomicU64::new(0)),
            shutting_down: AtomicBool::new(false),
            reconnecting: InFlight::default(),
            restarting: InFlight::default(),
            last_failure: Mutex::new(None),
            reconnects: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Connected with a usable socket.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.open.load(Ordering::SeqCst) != 0
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            reconnects: self.reconnects.load(Ordering::SeqCst),
            restarts: self.restarts.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
        }
    }

    /// Terminal error recorded by the last failed recovery, if any.
    pub fn last_failure(&self) -> Option<String> {
        lock(&self.last_failure).clone()
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Connection state changed");
        }
    }

    /// Suppress all recovery from now on.
    pub(crate) fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.config.host, port)
    }

    /// Connect to the worker, retrying up to `connect_attempts` times.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::ConnectionFailed` with the last socket error
    /// once every attempt failed, or `BridgeError::Stopped` if shutdown
    /// begins while retrying.
    pub async fn connect(&self, port: u16) -> Result<(), BridgeError> {
        let addr = self.addr(port);
        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if self.is_shutting_down() {
                return Err(BridgeError::Stopped);
            }
            match open_socket(addr).await {
                Ok(stream) => {
                    self.install(stream, port).await;
                    return Ok(());
                }
                Err(e) => {
                    debug!(%addr, attempt, "Connect attempt failed: {}", e);
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.connect_retry_delay()).await;
                    }
                }
            }
        }

        Err(BridgeError::ConnectionFailed {
            addr,
            attempts,
            source: last_error.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "no connection attempt made")
            }),
        })
    }

    /// Single connect attempt, used by reconnect.
    async fn connect_once(&self, port: u16) -> Result<(), BridgeError> {
        let addr = self.addr(port);
        let stream = open_socket(addr)
            .await
            .map_err(|source| BridgeError::ConnectionFailed {
                addr,
                attempts: 1,
                source,
            })?;
        self.install(stream, port).await;
        Ok(())
    }

    async fn install(&self, stream: TcpStream, port: u16) {
        let (read_half, mut write_half) = stream.into_split();
        // Held until the socket is live, so no send() interleaves with replays.
        let mut writer = self.writer.lock().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        // Set before the reader starts so an immediate EOF can clear it.
        self.open.store(generation, Ordering::SeqCst);

        let reader = tokio::spawn(read_loop(
            read_half,
            generation,
            Arc::clone(&self.open),
            Arc::clone(&self.correlator),
            self.signals.clone(),
            self.events.clone(),
        ));
        let previous = lock(&self.reader).replace(reader);
        if let Some(previous) = previous {
            previous.abort();
        }

        let replays = self.correlator.take_replays(generation);
        if !replays.is_empty() {
            info!(
                generation,
                count = replays.len(),
                "Re-sending requests written on a lost socket"
            );
        }
        for (id, frame) in &replays {
            if let Err(e) = self.write_bounded(&mut write_half, frame).await {
                warn!(id = %id, generation, "Re-send failed: {}", e);
                let _ = self.signals.send(Signal::SocketClosed {
                    generation,
                    reason: format!("write failed: {e}"),
                });
                break;
            }
        }

        *writer = Some(write_half);
        drop(writer);

        lock(&self.last_failure).take();
        self.set_state(ConnectionState::Connected);
        info!(port, generation, "Connected to worker");
        self.events.emit(BridgeEvent::Connected { port });
    }

    /// Drop the socket. Signals from it become stale.
    ///
    /// Returns `true` if a socket was open.
    pub(crate) async fn teardown(&self) -> bool {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.open.store(0, Ordering::SeqCst);
        let reader = lock(&self.reader).take();
        if let Some(reader) = reader {
            reader.abort();
        }
        // A send holds this lock for at most one write timeout.
        let writer = self.writer.lock().await.take();
        match writer {
            Some(mut writer) => {
                let _ = tokio::time::timeout(self.config.write_timeout(), writer.shutdown()).await;
                true
            }
            None => false,
        }
    }

    async fn write_bounded(
        &self,
        writer: &mut OwnedWriteHalf,
        frame: &[u8],
    ) -> Result<(), BridgeError> {
        let limit = self.config.write_timeout();
        match tokio::time::timeout(limit, write_frame(writer, frame)).await {
            Ok(written) => written,
            Err(_) => Err(BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("write stalled for {}ms", limit.as_millis()),
            ))),
        }
    }

    /// Write the encoded frame of request `id`.
    ///
    /// The frame is recorded against the current socket before it is
    /// written, so it is re-sent if that socket turns out to be lost. A
    /// failed write drops the socket and triggers recovery.
    ///
    /// # Errors
    ///
    /// - `BridgeError::ConnectionClosed` if there is no socket; nothing was
    ///   written or recorded
    /// - the write error otherwise; the frame stays recorded
    pub async fn send(&self, id: &RequestId, frame: &[u8]) -> Result<(), BridgeError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(BridgeError::ConnectionClosed);
        };
        let generation = self.generation.load(Ordering::SeqCst);
        self.correlator.mark_written(id, generation, frame);

        match self.write_bounded(writer, frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                guard.take();
                drop(guard);
                let _ = self
                    .open
                    .compare_exchange(generation, 0, Ordering::SeqCst, Ordering::SeqCst);
                warn!(generation, "Write to worker failed: {}", e);
                let _ = self.signals.send(Signal::SocketClosed {
                    generation,
                    reason: format!("write failed: {e}"),
                });
                Err(e)
            }
        }
    }

    /// Wait until the connection is usable.
    ///
    /// Polls while recovery is in flight. If called while disconnected with
    /// a live worker, recovery is re-triggered.
    ///
    /// # Errors
    ///
    /// - `BridgeError::Stopped` once shutdown began
    /// - `BridgeError::Unavailable` when recovery is exhausted or the wait
    ///   bound elapses
    pub async fn ensure_connected(&self) -> Result<(), BridgeError> {
        if self.is_shutting_down() {
            return Err(BridgeError::Stopped);
        }
        if self.is_connected() {
            return Ok(());
        }

        if self.state() == ConnectionState::Disconnected {
            if self.worker.is_alive() {
                debug!("Disconnected with a live worker, re-triggering recovery");
                let _ = self.signals.send(Signal::Kick);
            } else if let Some(failure) = self.last_failure() {
                return Err(BridgeError::Unavailable(failure));
            }
        }

        let poll = self.config.ensure_connected_poll();
        let bound = self.config.ensure_connected_timeout();
        let started = Instant::now();

        loop {
            tokio::time::sleep(poll).await;

            if self.is_shutting_down() {
                return Err(BridgeError::Stopped);
            }
            let state = self.state();
            if self.is_connected() {
                debug!(
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Connection available"
                );
                return Ok(());
            }
            if state == ConnectionState::Disconnected && !self.worker.is_alive() {
                if let Some(failure) = self.last_failure() {
                    return Err(BridgeError::Unavailable(failure));
                }
            }
            if started.elapsed() >= bound {
                return Err(BridgeError::Unavailable(format!(
                    "not connected after {}ms (state: {})",
                    bound.as_millis(),
                    state
                )));
            }
        }
    }

    /// Supervisor loop: the only place recovery decisions are made.
    pub(crate) async fn supervise(self: Arc<Self>, mut signals: mpsc::UnboundedReceiver<Signal>) {
        while let Some(signal) = signals.recv().await {
            if self.is_shutting_down() {
                debug!(?signal, "Ignoring signal during shutdown");
                continue;
            }
            self.handle_signal(signal).await;
        }
        debug!("Supervisor channel closed");
    }

    async fn handle_signal(&self, signal: Signal) {
        let cause = match signal {
            Signal::SocketClosed { generation, reason } => {
                if generation != self.generation.load(Ordering::SeqCst) {
                    debug!(generation, "Ignoring signal from a previous socket");
                    return;
                }
                info!("Connection to worker lost: {}", reason);
                Cause::SocketClosed(reason)
            }
            Signal::ProcessExited { epoch, status } => {
                if epoch != self.worker.epoch() {
                    debug!(epoch, "Ignoring exit of a previous worker");
                    return;
                }
                Cause::ProcessExited(status)
            }
            Signal::Kick => {
                if self.state() != ConnectionState::Disconnected {
                    return;
                }
                Cause::Requested
            }
        };
        self.recover(cause).await;
    }

    async fn recover(&self, cause: Cause) {
        if self.state().is_recovering()
            || self.reconnecting.is_active()
            || self.restarting.is_active()
        {
            debug!(%cause, "Recovery already in flight");
            return;
        }

        self.teardown().await;
        self.events.emit(BridgeEvent::Disconnected {
            reason: cause.to_string(),
        });

        let worker_alive = !matches!(cause, Cause::ProcessExited(_)) && self.worker.is_alive();
        if worker_alive {
            let Some(_reconnecting) = self.reconnecting.try_begin() else {
                return;
            };
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            self.set_state(ConnectionState::Reconnecting);
            self.events.emit(BridgeEvent::Reconnecting);
            info!(%cause, "Worker alive, reconnecting");

            tokio::time::sleep(self.config.reconnect_delay()).await;
            if self.is_shutting_down() {
                return;
            }

            match self.worker.port() {
                Some(port) => match self.connect_once(port).await {
                    Ok(()) => return,
                    Err(e) => warn!("Reconnect failed, escalating to restart: {}", e),
                },
                None => warn!("Worker has no port, escalating to restart"),
            }
        }

        let Some(_restarting) = self.restarting.try_begin() else {
            return;
        };
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Restarting);
        self.events.emit(BridgeEvent::Restarting);
        info!(%cause, "Restarting worker");

        tokio::time::sleep(self.config.restart_delay()).await;
        if self.is_shutting_down() {
            return;
        }

        let restarted = match self.worker.restart().await {
            Ok(port) => self.connect(port).await,
            Err(e) => Err(e),
        };
        if let Err(e) = restarted {
            if self.is_shutting_down() {
                return;
            }
            error!("Worker recovery failed: {}", e);
            self.failures.fetch_add(1, Ordering::SeqCst);
            *lock(&self.last_failure) = Some(e.to_string());
            self.set_state(ConnectionState::Disconnected);
            self.events.emit(BridgeEvent::Error {
                message: format!("Recovery failed: {e}"),
            });
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
