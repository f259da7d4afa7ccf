/*!
 * WebSocket transport.
 *
 * Same supervisor/actor shape as the stream-socket transport, over
 * tokio-tungstenite. Binary frames deliver their bytes and text frames
 * their UTF-8 bytes, both through the shared read path; pings are
 * answered automatically. TLS is chosen by the `wss`/`https` scheme; a
 * `start_tls` call swaps in a new TLS context and forces a reconnect.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use modlink_core::config::CommConfig;

use crate::error::{Error, Result};
use crate::queue::QueueHandle;
use crate::transport::tls::{build_client_config, TlsSettings};
use crate::transport::{Backoff, Dispatcher, Transport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum WsCmd {
    Write(Vec<u8>, oneshot::Sender<usize>),
    Disconnect,
}

struct WsInner {
    url: String,
    dispatcher: Arc<Dispatcher>,
    queue: QueueHandle,
    config: CommConfig,
    terminated: AtomicBool,
    tls: Mutex<Option<TlsSettings>>,
    tls_started: AtomicBool,
    cmd_tx: Mutex<Option<mpsc::Sender<WsCmd>>>,
    connected_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: Notify,
}

impl WsInner {
    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn command_sender(&self) -> Option<mpsc::Sender<WsCmd>> {
        self.cmd_tx.lock().expect("ws cmd lock poisoned").clone()
    }

    fn effective_url(&self) -> String {
        let mut url = http_to_ws_scheme(&self.url);
        if self.tls_started.load(Ordering::SeqCst) && url.starts_with("ws://") {
            url = url.replacen("ws://", "wss://", 1);
        }
        url
    }

    async fn establish(&self) -> Result<WsStream> {
        let url = self.effective_url();

        let connector = {
            let settings = self.tls.lock().expect("ws tls lock poisoned").clone();
            match settings {
                Some(settings) => Some(Connector::Rustls(build_client_config(&settings)?)),
                None => None,
            }
        };

        let (stream, _response) = tokio_tungstenite::connect_async_tls_with_config(
            url.as_str(),
            None,
            true, // disable Nagle, same as the stream-socket transport
            connector,
        )
        .await
        .map_err(|e| Error::fatal(format!("WebSocket connect to {} failed: {}", url, e)))?;

        Ok(stream)
    }
}

/// WebSocket transport with automatic reconnection
pub struct WebSocketTransport {
    inner: Arc<WsInner>,
}

impl WebSocketTransport {
    /// Create the transport; the connection is made by [`Transport::connect`]
    pub fn new(
        url: &str,
        dispatcher: Arc<Dispatcher>,
        queue: QueueHandle,
        config: CommConfig,
    ) -> Arc<Self> {
        let (connected_tx, _) = watch::channel(false);
        Arc::new(Self {
            inner: Arc::new(WsInner {
                url: url.to_string(),
                dispatcher,
                queue,
                config,
                terminated: AtomicBool::new(false),
                tls: Mutex::new(None),
                tls_started: AtomicBool::new(false),
                cmd_tx: Mutex::new(None),
                connected_tx,
                supervisor: Mutex::new(None),
                shutdown: Notify::new(),
            }),
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, connect_timeout: Duration) -> Result<()> {
        if self.inner.is_terminated() {
            return Err(Error::Terminated);
        }

        {
            let mut supervisor = self
                .inner
                .supervisor
                .lock()
                .expect("ws supervisor lock poisoned");
            if supervisor.is_none() {
                *supervisor = Some(tokio::spawn(run_supervisor(self.inner.clone())));
            }
        }

        let mut connected_rx = self.inner.connected_tx.subscribe();
        let result = tokio::time::timeout(connect_timeout, connected_rx.wait_for(|c| *c)).await;
        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::Terminated),
            Err(_) => Err(Error::timeout(format!(
                "connect to {} timed out",
                self.inner.url
            ))),
        }
    }

    async fn disconnect(&self) {
        if let Some(tx) = self.inner.command_sender() {
            let _ = tx.send(WsCmd::Disconnect).await;
        }
    }

    async fn terminate(&self) {
        self.inner.terminated.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a supervisor that has not yet
        // reached its backoff sleep still observes the shutdown
        self.inner.shutdown.notify_one();
        self.disconnect().await;
        self.inner.queue.set_online(false);
    }

    async fn send(&self, bytes: &[u8]) -> Result<usize> {
        if self.inner.is_terminated() {
            return Err(Error::Terminated);
        }
        let Some(tx) = self.inner.command_sender() else {
            debug!("Send of {} bytes with no connection", bytes.len());
            return Ok(0);
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(WsCmd::Write(bytes.to_vec(), ack_tx)).await.is_err() {
            debug!("Send of {} bytes raced a disconnect", bytes.len());
            return Ok(0);
        }
        Ok(ack_rx.await.unwrap_or(0))
    }

    fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    async fn start_tls(&self, settings: TlsSettings) -> Result<()> {
        if self.inner.is_terminated() {
            return Err(Error::Terminated);
        }

        // Validate the context before committing to it
        build_client_config(&settings)?;
        *self.inner.tls.lock().expect("ws tls lock poisoned") = Some(settings);
        self.inner.tls_started.store(true, Ordering::SeqCst);

        // WebSocket cannot upgrade in place; reconnect with the new
        // context
        self.disconnect().await;
        Ok(())
    }
}

async fn run_supervisor(inner: Arc<WsInner>) {
    let mut backoff = Backoff::new(
        inner.config.reconnect_base(),
        inner.config.reconnect_max(),
        inner.config.reconnect_jitter_ms,
    );

    loop {
        if inner.is_terminated() {
            break;
        }

        match inner.establish().await {
            Ok(stream) => {
                backoff.reset();
                inner.dispatcher.clear_buffer();

                let (cmd_tx, cmd_rx) = mpsc::channel(32);
                *inner.cmd_tx.lock().expect("ws cmd lock poisoned") = Some(cmd_tx);
                inner.connected_tx.send_replace(true);
                inner.queue.set_online(true);
                info!("Connected to {}", inner.url);

                run_connection(stream, cmd_rx, &inner).await;

                inner.queue.set_online(false);
                inner.connected_tx.send_replace(false);
                *inner.cmd_tx.lock().expect("ws cmd lock poisoned") = None;
                debug!("Connection to {} closed", inner.url);
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", inner.url, e);
            }
        }

        if inner.is_terminated() {
            break;
        }

        let delay = backoff.next_delay();
        debug!("Reconnecting to {} in {:?}", inner.url, delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.shutdown.notified() => {}
        }
    }

    inner.queue.set_online(false);
    inner.connected_tx.send_replace(false);
    *inner.cmd_tx.lock().expect("ws cmd lock poisoned") = None;
}

async fn run_connection(mut stream: WsStream, mut cmd_rx: mpsc::Receiver<WsCmd>, inner: &Arc<WsInner>) {
    loop {
        let mut pending = None;
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Binary(bytes))) => inner.dispatcher.process(&bytes),
                Some(Ok(Message::Text(text))) => inner.dispatcher.process(text.as_bytes()),
                Some(Ok(Message::Ping(payload))) => {
                    if stream.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!("Peer sent close: {:?}", frame);
                    break;
                }
                Some(Err(e)) => {
                    debug!("WebSocket read error: {}", e);
                    break;
                }
                None => break,
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => pending = Some(cmd),
                None => break,
            },
        }

        let Some(cmd) = pending else { continue };
        match cmd {
            WsCmd::Write(bytes, ack) => {
                let len = bytes.len();
                match stream.send(Message::Binary(bytes)).await {
                    Ok(()) => {
                        let _ = ack.send(len);
                    }
                    Err(e) => {
                        debug!("WebSocket write error: {}", e);
                        let _ = ack.send(0);
                        break;
                    }
                }
            }
            WsCmd::Disconnect => {
                let _ = stream.close(None).await;
                break;
            }
        }
    }
}

/// Convert an HTTP(S) URL to WS(S) scheme; `ws://` and `wss://` pass
/// through unchanged
fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replace("https://", "wss://").replace("http://", "ws://")
    }
}
