//! Worker subprocess lifecycle.
//!
//! The worker is launched with a request for an OS-assigned port and must
//! print a single `MARKER:<port>` line on stdout before it starts serving.
//! After the announcement a monitor task owns the child: it reports any exit
//! that was not requested by [`ProcessManager::terminate`] as a
//! restart-needed signal.
//!
//! # Process Cleanup Safety
//! Children are spawned with `kill_on_drop`, so a worker can never outlive
//! the task (or runtime) that owns it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, ChildStdout};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::connection::Signal;
use crate::error::BridgeError;
use crate::events::{BridgeEvent, EventBus};

/// Tracing target for re-emitted worker output.
pub const WORKER_LOG_TARGET: &str = "worker_bridge::worker";

/// How long to wait for an exit status after the worker closed stdout.
const EXIT_STATUS_WAIT: Duration = Duration::from_secs(1);

// =============================================================================
// Service Trait for Dependency Injection
// =============================================================================

/// What the connection layer needs to know about the worker.
///
/// This trait abstracts the process manager so recovery logic can be
/// exercised against an in-process fake worker.
#[async_trait]
pub trait WorkerControl: Send + Sync {
    /// Whether the current worker is running.
    fn is_alive(&self) -> bool;

    /// Port announced by the current worker.
    fn port(&self) -> Option<u16>;

    /// Launch counter of the current worker; 0 when none is running.
    fn epoch(&self) -> u64;

    /// Terminate the current worker (if any) and launch a fresh one,
    /// returning its newly announced port.
    async fn restart(&self) -> Result<u16, BridgeError>;
}

// =============================================================================
// Announcement Parsing
// =============================================================================

/// Parse a `MARKER:<port>` announcement line.
///
/// Returns `None` for any other line, including port 0.
pub fn parse_announcement(marker: &str, line: &str) -> Option<u16> {
    let port = line
        .trim()
        .strip_prefix(marker)?
        .strip_prefix(':')?
        .trim()
        .parse::<u16>()
        .ok()?;
    (port != 0).then_some(port)
}

/// Read stdout lines until the announcement appears.
///
/// Lines before the announcement are logged; EOF means the worker exited
/// (or closed stdout) before it started serving.
async fn scan_for_port<R>(lines: &mut Lines<BufReader<R>>, marker: &str) -> Result<u16, String>
where
    R: AsyncRead + Unpin,
{
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(port) = parse_announcement(marker, &line) {
                    return Ok(port);
                }
                debug!(target: WORKER_LOG_TARGET, "stdout: {}", line);
            }
            Ok(None) => return Err("worker closed stdout before announcing a port".to_string()),
            Err(e) => return Err(format!("failed to read worker stdout: {e}")),
        }
    }
}

/// Forward a worker output stream to tracing until it closes.
fn forward_output<R>(lines: Lines<BufReader<R>>, pid: Option<u32>, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = lines;
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: WORKER_LOG_TARGET, pid, stream, "{}", line);
        }
    });
}

// =============================================================================
// WorkerProcess
// =============================================================================

/// A running worker and its negotiated port.
pub struct WorkerProcess {
    pid: Option<u32>,
    port: u16,
    epoch: u64,
    /// Set before a deliberate stop so the monitor does not report the exit.
    expected_exit: Arc<AtomicBool>,
    exited: watch::Receiver<bool>,
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl WorkerProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Mark the exit as expected, give the worker `grace` to exit on its
    /// own, then kill and reap it.
    async fn shutdown(mut self, grace: Duration) {
        self.expected_exit.store(true, Ordering::SeqCst);

        let mut exited = self.exited.clone();
        let voluntary = tokio::time::timeout(grace, exited.wait_for(|done| *done))
            .await
            .is_ok();
        if !voluntary {
            warn!(pid = self.pid, "Worker didn't exit gracefully, killing");
        }

        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        if let Some(monitor) = self.monitor.take() {
            if let Err(e) = monitor.await {
                warn!("Worker monitor task failed: {}", e);
            }
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        // Never leave an orphan behind if the handle is dropped without shutdown.
        if let Some(kill_tx) = self.kill_tx.take() {
            self.expected_exit.store(true, Ordering::SeqCst);
            let _ = kill_tx.send(());
        }
    }
}

/// Own the child until it exits or is told to die.
async fn monitor_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exited_tx: watch::Sender<bool>,
    expected_exit: Arc<AtomicBool>,
    epoch: u64,
    signals: mpsc::UnboundedSender<Signal>,
    events: EventBus,
) {
    let pid = child.id();
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                debug!(pid, "Kill failed (already exited?): {}", e);
            }
            child.wait().await
        }
    };
    let _ = exited_tx.send(true);

    let status = match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("unknown ({e})"),
    };
    let expected = expected_exit.load(Ordering::SeqCst);
    events.emit(BridgeEvent::WorkerExited {
        status: status.clone(),
        expected,
    });

    if expected {
        debug!(pid, %status, "Worker exited");
    } else {
        warn!(pid, %status, "Worker exited unexpectedly");
        let _ = signals.send(Signal::ProcessExited { epoch, status });
    }
}

async fn describe_exit(child: &mut Child) -> String {
    match tokio::time::timeout(EXIT_STATUS_WAIT, child.wait()).await {
        Ok(Ok(status)) => status.to_string(),
        Ok(Err(e)) => format!("status unavailable: {e}"),
        Err(_) => "still running".to_string(),
    }
}

// =============================================================================
// ProcessManager
// =============================================================================

/// Launches, observes and terminates the worker.
pub struct ProcessManager {
    config: Arc<BridgeConfig>,
    current: Mutex<Option<WorkerProcess>>,
    launches: AtomicU64,
    signals: mpsc::UnboundedSender<Signal>,
    events: EventBus,
}

impl ProcessManager {
    pub(crate) fn new(
        config: Arc<BridgeConfig>,
        signals: mpsc::UnboundedSender<Signal>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            current: Mutex::new(None),
            launches: AtomicU64::new(0),
            signals,
            events,
        }
    }

    /// Launch the worker and wait for its port announcement.
    ///
    /// # Errors
    ///
    /// - `BridgeError::Spawn` if the program cannot be executed
    /// - `BridgeError::StartupTimeout` if no announcement arrives in time
    ///   (the worker is killed)
    /// - `BridgeError::ProcessLaunch` if the worker exits first
    pub async fn launch(&self) -> Result<u16, BridgeError> {
        let worker = &self.config.worker;
        info!("Starting worker: {} {}", worker.program, worker.args.join(" "));

        let mut child = worker.to_command().spawn().map_err(BridgeError::Spawn)?;
        let pid = child.id();

        let stdout: ChildStdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::ProcessLaunch("stdout not captured".into()))?;
        if let Some(stderr) = child.stderr.take() {
            forward_output(BufReader::new(stderr).lines(), pid, "stderr");
        }

        let mut lines = BufReader::new(stdout).lines();
        let startup_timeout = self.config.startup_timeout();
        let scanned = tokio::time::timeout(
            startup_timeout,
            scan_for_port(&mut lines, &self.config.port_marker),
        )
        .await;

        let port = match scanned {
            Ok(Ok(port)) => port,
            Ok(Err(reason)) => {
                let status = describe_exit(&mut child).await;
                let _ = child.start_kill();
                return Err(BridgeError::ProcessLaunch(format!(
                    "{reason} (exit status: {status})"
                )));
            }
            Err(_) => {
                warn!(pid, "Worker did not announce a port, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(BridgeError::StartupTimeout(startup_timeout));
            }
        };

        forward_output(lines, pid, "stdout");

        let epoch = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let expected_exit = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited) = watch::channel(false);
        let monitor = tokio::spawn(monitor_exit(
            child,
            kill_rx,
            exited_tx,
            Arc::clone(&expected_exit),
            epoch,
            self.signals.clone(),
            self.events.clone(),
        ));

        let previous = self.slot().replace(WorkerProcess {
            pid,
            port,
            epoch,
            expected_exit,
            exited,
            kill_tx: Some(kill_tx),
            monitor: Some(monitor),
        });
        if previous.is_some() {
            // Dropping the old handle kills it.
            warn!("Replaced a worker that was still registered");
        }

        info!(pid, port, epoch, "Worker announced port");
        self.events.emit(BridgeEvent::WorkerStarted { pid, port });
        Ok(port)
    }

    /// Stop the current worker. Idempotent.
    ///
    /// Returns `true` if a worker was registered.
    pub async fn terminate(&self) -> bool {
        let Some(worker) = self.slot().take() else {
            return false;
        };
        debug!(pid = worker.pid, "Terminating worker");
        worker.shutdown(self.config.shutdown_grace()).await;
        true
    }

    pub fn pid(&self) -> Option<u32> {
        self.slot().as_ref().and_then(WorkerProcess::pid)
    }

    /// Classify the next exit of the current worker as deliberate.
    pub(crate) fn expect_exit(&self) {
        if let Some(worker) = self.slot().as_ref() {
            worker.expected_exit.store(true, Ordering::SeqCst);
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<WorkerProcess>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl WorkerControl for ProcessManager {
    fn is_alive(&self) -> bool {
        self.slot().as_ref().is_some_and(|w| !w.has_exited())
    }

    fn port(&self) -> Option<u16> {
        self.slot().as_ref().map(WorkerProcess::port)
    }

    fn epoch(&self) -> u64 {
        self.slot().as_ref().map_or(0, |w| w.epoch)
    }

    async fn restart(&self) -> Result<u16, BridgeError> {
        info!("Restarting worker");
        self.terminate().await;
        self.launch().await
    }
}
