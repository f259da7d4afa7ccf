/*!
 * Driver module assembly.
 *
 * A module is one running driver instance: its command queue, its
 * transport, its status hash, and the process-wide subscription
 * registry. The driver authoring surface sits on top of this seam; the
 * core only fixes how the pieces are wired together.
 *
 * The module owns the queue and the transport. The transport holds
 * non-owning handles back to the queue (the online gate and the
 * in-flight slot), so no reference cycle forms.
 */
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use modlink_core::config::CommConfig;
use modlink_core::logging::module_span;
use modlink_core::types::Id;
use modlink_store::{Storage, Store, Subscriptions};

use crate::error::Result;
use crate::queue::Queue;
use crate::task::{Command, CommandFuture};
use crate::tokenizer::{Framing, Tokenizer};
use crate::transport::{
    Dispatcher, ReceivedCallback, TcpTransport, Transport, WebSocketTransport,
};

/// Where a module's device lives
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Stream socket (TCP, upgradable to TLS)
    Tcp {
        /// Device host
        host: String,
        /// Device port
        port: u16,
    },
    /// WebSocket URL (`ws://`, `wss://`; HTTP schemes are converted)
    WebSocket {
        /// Device URL
        url: String,
    },
}

/// Builder for [`Module`]
pub struct ModuleBuilder {
    id: Id,
    endpoint: Endpoint,
    store: Arc<dyn Store>,
    prefix: String,
    comm: CommConfig,
    framing: Option<Framing>,
    received: Option<ReceivedCallback>,
    subscriptions: Option<Subscriptions>,
}

impl ModuleBuilder {
    /// Set the status-store key prefix (platform constant)
    pub fn prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.prefix = prefix.as_ref().to_string();
        self
    }

    /// Set the transport/queue configuration
    pub fn comm_config(mut self, comm: CommConfig) -> Self {
        self.comm = comm;
        self
    }

    /// Set the framing rule for the inbound byte stream
    pub fn framing(mut self, framing: Framing) -> Self {
        self.framing = Some(framing);
        self
    }

    /// Set the driver's general `received` callback
    pub fn received(mut self, received: ReceivedCallback) -> Self {
        self.received = Some(received);
        self
    }

    /// Attach the process-wide subscription registry
    pub fn subscriptions(mut self, subscriptions: Subscriptions) -> Self {
        self.subscriptions = Some(subscriptions);
        self
    }

    /// Wire the module together and start its queue worker
    pub fn build(self) -> Module {
        let queue = Queue::new();

        let received = self.received.unwrap_or_else(|| {
            Arc::new(|data: &[u8], _task| {
                debug!("Unhandled inbound message of {} bytes", data.len());
            })
        });
        let tokenizer = self
            .framing
            .map(|framing| Tokenizer::with_max_size(framing, self.comm.max_frame_size));
        let dispatcher = Dispatcher::new(queue.handle(), received, tokenizer);

        let transport: Arc<dyn Transport> = match &self.endpoint {
            Endpoint::Tcp { host, port } => TcpTransport::new(
                host,
                *port,
                dispatcher,
                queue.handle(),
                self.comm.clone(),
            ),
            Endpoint::WebSocket { url } => {
                WebSocketTransport::new(url, dispatcher, queue.handle(), self.comm.clone())
            }
        };
        queue.start(transport.clone());

        let storage = Storage::new(&self.prefix, self.id.clone(), self.store);

        {
            let span = module_span(self.id.as_str());
            let _guard = span.enter();
            info!("Module assembled");
        }

        Module {
            id: self.id,
            queue,
            transport,
            storage,
            subscriptions: self.subscriptions,
        }
    }
}

/// One running driver instance
pub struct Module {
    id: Id,
    queue: Queue,
    transport: Arc<dyn Transport>,
    storage: Storage,
    subscriptions: Option<Subscriptions>,
}

impl Module {
    /// Start building a module
    pub fn builder(id: Id, endpoint: Endpoint, store: Arc<dyn Store>) -> ModuleBuilder {
        ModuleBuilder {
            id,
            endpoint,
            store,
            prefix: modlink_core::config::StoreConfig::default().prefix,
            comm: CommConfig::default(),
            framing: None,
            received: None,
            subscriptions: None,
        }
    }

    /// The module's id
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// The command queue
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// The transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The module's status hash
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// The process-wide subscription registry, if attached
    pub fn subscriptions(&self) -> Option<&Subscriptions> {
        self.subscriptions.as_ref()
    }

    /// Connect the transport; dispatch begins once it is online
    pub async fn connect(&self, timeout: Duration) -> Result<()> {
        self.transport.connect(timeout).await
    }

    /// Enqueue a command against the device
    pub fn send(&self, command: Command) -> CommandFuture {
        self.queue.send(command)
    }

    /// Stop the module: the transport stops reconnecting and every
    /// queued task completes as aborted
    pub async fn terminate(&self) {
        self.transport.terminate().await;
        self.queue.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ParseResult, Task, TaskOutcome};
    use modlink_core::types::Value;
    use modlink_store::MemoryStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_module_end_to_end_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Device: answers "PWR?\r" with "PWR=ON\r"
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"PWR?\r");
            socket.write_all(b"PWR=ON\r").await.unwrap();
            socket
        });

        let store = MemoryStore::new();
        let module = Module::builder(
            "display-1".into(),
            Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
            },
            Arc::new(store.clone()),
        )
        .prefix("drv")
        .framing(Framing::Delimiter(b"\r".to_vec()))
        .build();

        module.connect(Duration::from_secs(2)).await.unwrap();

        let outcome = module
            .send(
                Task::builder("power_query")
                    .payload(b"PWR?\r".to_vec())
                    .timeout(Duration::from_secs(2))
                    .parser(|data, _task| {
                        if data.starts_with(b"PWR=") {
                            ParseResult::Success(Value::Bool(data.starts_with(b"PWR=ON")))
                        } else {
                            ParseResult::Continue
                        }
                    })
                    .build(),
            )
            .await;

        assert_eq!(outcome, TaskOutcome::Success(Value::Bool(true)));

        // Driver publishes the decoded state
        module.storage().set("power", "true").await.unwrap();
        assert_eq!(
            module.storage().get("power").await.unwrap(),
            Some("true".to_string())
        );

        let _socket = server.await.unwrap();
        module.terminate().await;
    }

    #[tokio::test]
    async fn test_module_terminate_aborts_queued_work() {
        let store = MemoryStore::new();
        let module = Module::builder(
            "display-2".into(),
            Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: 1, // never connects
            },
            Arc::new(store),
        )
        .build();

        let future = module.send(
            Task::builder("parked")
                .payload(b"X".to_vec())
                .timeout(Duration::from_secs(10))
                .build(),
        );

        module.terminate().await;
        assert_eq!(future.await, TaskOutcome::Abort("terminated".into()));
    }
}
