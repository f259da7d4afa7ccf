/*!
 * Modlink Comm
 *
 * This crate provides the device-facing half of the Modlink driver
 * runtime: message framing, the command queue, the transport abstraction
 * (TCP, TCP+TLS, WebSocket) with automatic reconnection, and the module
 * assembly that wires a driver instance together.
 */

#![warn(missing_docs)]

pub mod error;
pub mod module;
pub mod queue;
pub mod task;
pub mod tokenizer;
pub mod transport;

pub use error::{Error, Result};
pub use module::{Endpoint, Module, ModuleBuilder};
pub use queue::{CompletedTask, Queue, QueueHandle, QueueState};
pub use task::{Command, CommandFuture, ParseResult, ResponseParser, Task, TaskBuilder, TaskOutcome};
pub use tokenizer::{Endian, Framing, Tokenizer};
pub use transport::{
    Dispatcher, ReceivedCallback, TcpTransport, TlsSettings, TlsVerify, Transport,
    WebSocketTransport,
};

/// Modlink comm crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
