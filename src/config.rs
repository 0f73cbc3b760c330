//! Bridge configuration.
//!
//! All durations are stored as integer milliseconds so the configuration
//! file stays plain JSON; use the accessor methods to get [`Duration`]s.
//!
//! ```json
//! {
//!   "worker": { "program": "python3", "args": ["bridge/krx_bridge.py"] },
//!   "request_timeout_ms": 60000
//! }
//! ```

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::BridgeError;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "WORKER_BRIDGE_CONFIG";

/// Environment variable overriding the worker program.
pub const PROGRAM_ENV: &str = "WORKER_BRIDGE_PROGRAM";

/// How to launch the worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Flag used to request an ephemeral port; `None` passes nothing.
    pub port_arg: Option<String>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            port_arg: Some("--port".to_string()),
        }
    }
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Build the tokio command with piped output and kill-on-drop.
    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(flag) = &self.port_arg {
            cmd.arg(flag).arg("0");
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Tunables for the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub worker: WorkerCommand,
    /// Prefix of the stdout line announcing the port (`<marker>:<port>`).
    pub port_marker: String,
    pub host: IpAddr,
    pub startup_timeout_ms: u64,
    pub connect_attempts: u32,
    pub connect_retry_delay_ms: u64,
    pub reconnect_delay_ms: u64,
    pub restart_delay_ms: u64,
    pub request_timeout_ms: u64,
    /// Bound on one socket write; a worker that stops reading fails it.
    pub write_timeout_ms: u64,
    pub ensure_connected_poll_ms: u64,
    pub ensure_connected_timeout_ms: u64,
    /// Budget for the in-band `shutdown` call made by `stop()`.
    pub shutdown_call_timeout_ms: u64,
    /// How long to wait for a voluntary exit before killing the worker.
    pub shutdown_grace_ms: u64,
    pub event_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker: WorkerCommand::default(),
            port_marker: "BRIDGE_PORT".to_string(),
            host: IpAddr::from([127, 0, 0, 1]),
            startup_timeout_ms: 10_000,
            connect_attempts: 10,
            connect_retry_delay_ms: 500,
            reconnect_delay_ms: 500,
            restart_delay_ms: 2_000,
            // Generous: the worker may do slow external I/O.
            request_timeout_ms: 180_000,
            write_timeout_ms: 10_000,
            ensure_connected_poll_ms: 100,
            ensure_connected_timeout_ms: 15_000,
            shutdown_call_timeout_ms: 2_000,
            shutdown_grace_ms: 500,
            event_capacity: 64,
        }
    }
}

impl BridgeConfig {
    /// Default configuration launching `worker`.
    pub fn new(worker: WorkerCommand) -> Self {
        Self {
            worker,
            ..Self::default()
        }
    }

    /// Load a JSON config file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Config` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            BridgeError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the configuration from the environment.
    ///
    /// Resolution order:
    /// 1. `$WORKER_BRIDGE_CONFIG` (must exist if set)
    /// 2. `<config dir>/worker-bridge/config.json` (XDG on Linux, Library on macOS)
    /// 3. Built-in defaults
    ///
    /// `$WORKER_BRIDGE_PROGRAM` then overrides the worker program.
    pub fn resolve() -> Result<Self, BridgeError> {
        let mut config = if let Ok(path) = std::env::var(CONFIG_ENV) {
            tracing::info!("Using config from {}: {}", CONFIG_ENV, path);
            Self::load(Path::new(&path))?
        } else if let Some(path) = default_config_path().filter(|p| p.exists()) {
            tracing::info!("Using config: {}", path.display());
            Self::load(&path)?
        } else {
            tracing::debug!("No config file found, using defaults");
            Self::default()
        };

        if let Ok(program) = std::env::var(PROGRAM_ENV) {
            config.worker.program = program;
        }
        Ok(config)
    }

    /// Reject configurations the bridge cannot run with.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.worker.program.trim().is_empty() {
            return Err(BridgeError::Config("worker.program must not be empty".into()));
        }
        if self.port_marker.is_empty() || self.port_marker.contains(':') {
            return Err(BridgeError::Config(
                "port_marker must be non-empty and contain no ':'".into(),
            ));
        }
        if self.connect_attempts == 0 {
            return Err(BridgeError::Config("connect_attempts must be > 0".into()));
        }
        if self.write_timeout_ms == 0 {
            return Err(BridgeError::Config("write_timeout_ms must be > 0".into()));
        }
        if self.event_capacity == 0 {
            return Err(BridgeError::Config("event_capacity must be > 0".into()));
        }
        Ok(())
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worker.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_port_marker(mut self, marker: impl Into<String>) -> Self {
        self.port_marker = marker.into();
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout_ms = millis(timeout);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = millis(timeout);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout_ms = millis(timeout);
        self
    }

    pub fn with_connect_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.connect_attempts = attempts;
        self.connect_retry_delay_ms = millis(delay);
        self
    }

    pub fn with_recovery_delays(mut self, reconnect: Duration, restart: Duration) -> Self {
        self.reconnect_delay_ms = millis(reconnect);
        self.restart_delay_ms = millis(restart);
        self
    }

    pub fn with_ensure_connected(mut self, poll: Duration, timeout: Duration) -> Self {
        self.ensure_connected_poll_ms = millis(poll);
        self.ensure_connected_timeout_ms = millis(timeout);
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn ensure_connected_poll(&self) -> Duration {
        Duration::from_millis(self.ensure_connected_poll_ms)
    }

    pub fn ensure_connected_timeout(&self) -> Duration {
        Duration::from_millis(self.ensure_connected_timeout_ms)
    }

    pub fn shutdown_call_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_call_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// `<config dir>/worker-bridge/config.json`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("worker-bridge").join("config.json"))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
