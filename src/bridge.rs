//! Public entry point composing the process, connection and correlation layers.
//!
//! ```ignore
//! let bridge = Bridge::new(BridgeConfig::resolve()?);
//! bridge.start().await?;
//! let result = bridge.call("calculate", json!({"size": 3})).await?;
//! bridge.stop().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::connection::{ConnectionManager, ConnectionState, RecoveryStats, Signal};
use crate::correlator::Correlator;
use crate::error::BridgeError;
use crate::events::{BridgeEvent, EventBus, Notification};
use crate::process::{ProcessManager, WorkerControl};
use crate::protocol::{encode_request, RpcRequest, PING_METHOD, SHUTDOWN_METHOD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// A supervised request/response channel to one worker subprocess.
///
/// Single-use: once [`Bridge::stop`] has run, [`Bridge::start`] fails with
/// [`BridgeError::Stopped`].
pub struct Bridge {
    config: Arc<BridgeConfig>,
    events: EventBus,
    correlator: Arc<Correlator>,
    process: Arc<ProcessManager>,
    connection: Arc<ConnectionManager>,
    signals: Mutex<Option<mpsc::UnboundedReceiver<Signal>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    /// Serializes `start()` and `stop()`.
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let config = Arc::new(config);
        let events = EventBus::new(config.event_capacity);
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        let correlator = Arc::new(Correlator::new(config.request_timeout()));
        let process = Arc::new(ProcessManager::new(
            Arc::clone(&config),
            signals_tx.clone(),
            events.clone(),
        ));
        let connection = Arc::new(ConnectionManager::new(
            Arc::clone(&config),
            Arc::clone(&process) as Arc<dyn WorkerControl>,
            Arc::clone(&correlator),
            events.clone(),
            signals_tx,
        ));

        Self {
            config,
            events,
            correlator,
            process,
            connection,
            signals: Mutex::new(Some(signals_rx)),
            supervisor: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::Idle),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Launch the worker and connect to it.
    ///
    /// A second call while running is a no-op.
    ///
    /// # Errors
    ///
    /// - `BridgeError::Config` if the configuration is invalid
    /// - `BridgeError::Spawn`, `BridgeError::StartupTimeout` or
    ///   `BridgeError::ProcessLaunch` if the worker fails to come up
    /// - `BridgeError::ConnectionFailed` if the socket cannot be opened
    ///   (the worker is terminated)
    /// - `BridgeError::Stopped` after `stop()`
    pub async fn start(&self) -> Result<(), BridgeError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Running => {
                debug!("Bridge already started");
                return Ok(());
            }
            Lifecycle::Stopped => return Err(BridgeError::Stopped),
            Lifecycle::Idle => {}
        }
        self.config.validate()?;

        self.connection.set_state(ConnectionState::Connecting);
        let port = match self.process.launch().await {
            Ok(port) => port,
            Err(e) => {
                error!("Worker failed to start: {}", e);
                self.connection.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        if let Err(e) = self.connection.connect(port).await {
            error!(port, "Could not connect to worker: {}", e);
            self.process.terminate().await;
            self.connection.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        let signals = lock(&self.signals).take();
        if let Some(signals) = signals {
            let supervisor = tokio::spawn(Arc::clone(&self.connection).supervise(signals));
            *lock(&self.supervisor) = Some(supervisor);
        }

        *lifecycle = Lifecycle::Running;
        self.started.store(true, Ordering::SeqCst);
        info!(port, pid = self.process.pid(), "Bridge started");
        Ok(())
    }

    /// Shut the worker down and release every resource. Idempotent.
    ///
    /// Recovery is suppressed first; then the worker is asked to exit via
    /// the `shutdown` method, the socket is closed and the process killed
    /// if still running. Pending calls fail with
    /// [`BridgeError::ConnectionClosed`].
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if *lifecycle == Lifecycle::Stopped {
            debug!("Bridge already stopped");
            return;
        }
        let was_running = *lifecycle == Lifecycle::Running;
        *lifecycle = Lifecycle::Stopped;
        self.stopped.store(true, Ordering::SeqCst);
        self.connection.begin_shutdown();

        let supervisor = lock(&self.supervisor).take();
        if let Some(supervisor) = supervisor {
            supervisor.abort();
            let _ = supervisor.await;
        }

        if was_running && self.connection.is_connected() {
            self.request_shutdown().await;
        }

        self.connection.teardown().await;
        self.connection.set_state(ConnectionState::Disconnected);
        self.process.terminate().await;

        let rejected = self.correlator.reject_all(|| BridgeError::ConnectionClosed);
        if rejected > 0 {
            warn!(rejected, "Rejected pending requests on shutdown");
        }
        info!("Bridge stopped");
        self.events.emit(BridgeEvent::Stopped);
    }

    /// Best-effort in-band shutdown; failures are only logged.
    async fn request_shutdown(&self) {
        self.process.expect_exit();
        let budget = self.config.shutdown_call_timeout();
        let attempt = tokio::time::timeout(
            budget,
            self.roundtrip(SHUTDOWN_METHOD, json!({}), budget),
        )
        .await;
        match attempt {
            Ok(Ok(_)) => debug!("Worker acknowledged shutdown"),
            Ok(Err(e)) => debug!("Shutdown request failed: {}", e),
            Err(_) => debug!(
                budget_ms = budget.as_millis() as u64,
                "Shutdown request timed out"
            ),
        }
    }

    /// Issue a request with the default timeout.
    ///
    /// Waits for an in-flight recovery before sending.
    ///
    /// # Errors
    ///
    /// - `BridgeError::NotStarted` / `BridgeError::Stopped` on lifecycle misuse
    /// - `BridgeError::Unavailable` if no connection can be established
    /// - `BridgeError::Timeout` if no response arrives in time
    /// - `BridgeError::Remote` if the worker answers with an error
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        self.call_with_timeout(method, params, self.correlator.default_timeout())
            .await
    }

    /// Issue a request with an explicit timeout.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        self.check_running()?;
        self.connection.ensure_connected().await?;
        self.roundtrip(method, params, timeout).await
    }

    /// Round-trip latency of the worker's `ping` method.
    pub async fn ping(&self) -> Result<Duration, BridgeError> {
        let started = Instant::now();
        self.call(PING_METHOD, json!({})).await?;
        Ok(started.elapsed())
    }

    async fn roundtrip(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let call = self.correlator.register(method);
        let request = RpcRequest::new(call.id().clone(), method, params);
        let frame = encode_request(&request)?;

        debug!(id = %call.id(), method, "Sending request");
        if let Err(e) = self.connection.send(call.id(), &frame).await {
            if self.correlator.is_written(call.id()) {
                // Recorded on the lost socket; recovery re-sends it.
                debug!(id = %call.id(), "Write failed, waiting for re-send: {}", e);
                self.connection.ensure_connected().await?;
            } else {
                debug!(id = %call.id(), "No socket, retrying after recovery: {}", e);
                self.connection.ensure_connected().await?;
                self.connection.send(call.id(), &frame).await?;
            }
        }

        call.wait(timeout).await
    }

    fn check_running(&self) -> Result<(), BridgeError> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(BridgeError::Stopped)
        } else if !self.started.load(Ordering::SeqCst) {
            Err(BridgeError::NotStarted)
        } else {
            Ok(())
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Watch connection state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    /// Subscribe to lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    pub fn worker_port(&self) -> Option<u16> {
        self.process.port()
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }

    pub fn recovery_stats(&self) -> RecoveryStats {
        self.connection.stats()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        // Without an explicit stop(): suppress recovery; the worker handle
        // kills the child when the process manager goes away.
        self.connection.begin_shutdown();
        if let Some(supervisor) = lock(&self.supervisor).take() {
            supervisor.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
