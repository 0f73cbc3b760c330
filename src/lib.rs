//! Worker Bridge Library
//!
//! Launches a worker subprocess, connects to the TCP port it announces and
//! exchanges newline-delimited JSON-RPC with it, keeping the channel alive
//! across socket drops and worker crashes:
//!
//! - `bridge` - the public facade (`start`/`call`/`stop`)
//! - `process` - worker launch, port negotiation, exit monitoring
//! - `connection` - socket ownership and the reconnect/restart state machine
//! - `correlator` - request IDs, pending-request table, timeouts
//! - `framing` / `protocol` - wire framing and JSON-RPC envelopes
//! - `config`, `events`, `error` - configuration, notifications, errors
//!
//! # Example
//!
//! ```ignore
//! use worker_bridge::{Bridge, BridgeConfig, WorkerCommand};
//!
//! let worker = WorkerCommand::new("python3");
//! let bridge = Bridge::new(BridgeConfig::new(worker).with_args(["bridge/krx_bridge.py"]));
//! bridge.start().await?;
//! let result = bridge.call("echo", serde_json::json!({"hello": "world"})).await?;
//! bridge.stop().await;
//! ```

pub mod bridge;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod events;
pub mod framing;
pub mod process;
pub mod protocol;

pub use bridge::Bridge;
pub use config::{BridgeConfig, WorkerCommand};
pub use connection::{ConnectionState, RecoveryStats};
pub use error::{BridgeError, Result};
pub use events::{BridgeEvent, Notification};
