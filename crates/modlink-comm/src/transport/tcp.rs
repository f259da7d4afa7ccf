/*!
 * Stream-socket transport (TCP, upgradable to TLS).
 *
 * A supervisor task owns the connection lifecycle: connect, hand the
 * socket to a single-owner connection actor, and reconnect with backoff
 * when the actor exits. The actor is the only task touching the socket;
 * writes and the STARTTLS upgrade arrive over a command channel, so the
 * plain stream can be swapped for a TLS stream in place without
 * splitting ownership.
 *
 * The socket runs with `TCP_NODELAY` and every send ends with an
 * explicit flush, so drivers that issue several small writes per logical
 * message still emit one packet each.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use modlink_core::config::CommConfig;

use crate::error::{Error, Result};
use crate::queue::QueueHandle;
use crate::transport::tls::{build_client_config, resolve_server_name, TlsSettings};
use crate::transport::{Backoff, Dispatcher, Transport};

/// The connection actor's view of the socket
enum Stream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    /// Placeholder while the socket is moved out for the TLS handshake
    Detached,
}

impl Stream {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(stream) => stream.read(buf).await,
            Stream::Tls(stream) => stream.read(buf).await,
            Stream::Detached => Ok(0),
        }
    }

    async fn write_all_flush(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Plain(stream) => {
                stream.write_all(bytes).await?;
                stream.flush().await
            }
            Stream::Tls(stream) => {
                stream.write_all(bytes).await?;
                stream.flush().await
            }
            Stream::Detached => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "stream detached",
            )),
        }
    }

    async fn shutdown(&mut self) {
        let result = match self {
            Stream::Plain(stream) => stream.shutdown().await,
            Stream::Tls(stream) => stream.shutdown().await,
            Stream::Detached => Ok(()),
        };
        if let Err(e) = result {
            debug!("Socket shutdown error: {}", e);
        }
    }
}

enum ConnCmd {
    Write(Vec<u8>, oneshot::Sender<usize>),
    StartTls(
        Arc<ClientConfig>,
        ServerName<'static>,
        oneshot::Sender<Result<()>>,
    ),
    Disconnect,
}

struct TcpInner {
    host: String,
    port: u16,
    dispatcher: Arc<Dispatcher>,
    queue: QueueHandle,
    config: CommConfig,
    terminated: AtomicBool,
    tls: Mutex<Option<TlsSettings>>,
    tls_started: AtomicBool,
    cmd_tx: Mutex<Option<mpsc::Sender<ConnCmd>>>,
    connected_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: Notify,
}

impl TcpInner {
    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn command_sender(&self) -> Option<mpsc::Sender<ConnCmd>> {
        self.cmd_tx.lock().expect("tcp cmd lock poisoned").clone()
    }

    /// Open the socket, optionally completing the TLS handshake when the
    /// session was already upgraded before this (re)connect
    async fn establish(&self) -> Result<Stream> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;

        if !self.tls_started.load(Ordering::SeqCst) {
            return Ok(Stream::Plain(stream));
        }

        let settings = self
            .tls
            .lock()
            .expect("tcp tls lock poisoned")
            .clone()
            .ok_or_else(|| Error::fatal("TLS started without settings"))?;
        let config = build_client_config(&settings)?;
        let name = resolve_server_name(&settings, &self.host)?;
        let connector = TlsConnector::from(config);
        let tls = connector
            .connect(name, stream)
            .await
            .map_err(|e| Error::fatal(format!("TLS handshake failed: {}", e)))?;
        Ok(Stream::Tls(Box::new(tls)))
    }
}

/// TCP transport with automatic reconnection and mid-session TLS upgrade
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

impl TcpTransport {
    /// Create the transport; the connection is made by [`Transport::connect`]
    pub fn new(
        host: &str,
        port: u16,
        dispatcher: Arc<Dispatcher>,
        queue: QueueHandle,
        config: CommConfig,
    ) -> Arc<Self> {
        let (connected_tx, _) = watch::channel(false);
        Arc::new(Self {
            inner: Arc::new(TcpInner {
                host: host.to_string(),
                port,
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

    /// Whether the session has been upgraded to TLS
    pub fn tls_started(&self) -> bool {
        self.inner.tls_started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, connect_timeout: Duration) -> Result<()> {
        if self.inner.is_terminated() {
            return Err(Error::Terminated);
        }

        {
            let mut supervisor = self
                .inner
                .supervisor
                .lock()
                .expect("tcp supervisor lock poisoned");
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
                "connect to {}:{} timed out",
                self.inner.host, self.inner.port
            ))),
        }
    }

    async fn disconnect(&self) {
        if let Some(tx) = self.inner.command_sender() {
            let _ = tx.send(ConnCmd::Disconnect).await;
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
        if tx.send(ConnCmd::Write(bytes.to_vec(), ack_tx)).await.is_err() {
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
        if self
            .inner
            .supervisor
            .lock()
            .expect("tcp supervisor lock poisoned")
            .is_none()
        {
            return Err(Error::fatal("start_tls before connect"));
        }

        let config = build_client_config(&settings)?;
        let name = resolve_server_name(&settings, &self.inner.host)?;
        *self.inner.tls.lock().expect("tcp tls lock poisoned") = Some(settings);
        self.inner.tls_started.store(true, Ordering::SeqCst);

        // Upgrade the live connection in place; if none, the next
        // (re)connect performs the handshake
        let Some(tx) = self.inner.command_sender() else {
            return Ok(());
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx
            .send(ConnCmd::StartTls(config, name, ack_tx))
            .await
            .is_err()
        {
            return Ok(());
        }
        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                // The session is gone; the in-flight task will not get an
                // answer from the old socket
                self.inner.queue.abort_in_flight("disconnect");
                Err(e)
            }
            Err(_) => Ok(()),
        }
    }
}

async fn run_supervisor(inner: Arc<TcpInner>) {
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
                *inner.cmd_tx.lock().expect("tcp cmd lock poisoned") = Some(cmd_tx);
                inner.connected_tx.send_replace(true);
                inner.queue.set_online(true);
                info!("Connected to {}:{}", inner.host, inner.port);

                run_connection(stream, cmd_rx, &inner).await;

                inner.queue.set_online(false);
                inner.connected_tx.send_replace(false);
                *inner.cmd_tx.lock().expect("tcp cmd lock poisoned") = None;
                debug!("Connection to {}:{} closed", inner.host, inner.port);
            }
            Err(e) => {
                warn!("Connect to {}:{} failed: {}", inner.host, inner.port, e);
            }
        }

        if inner.is_terminated() {
            break;
        }

        let delay = backoff.next_delay();
        debug!(
            "Reconnecting to {}:{} in {:?}",
            inner.host, inner.port, delay
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.shutdown.notified() => {}
        }
    }

    inner.queue.set_online(false);
    inner.connected_tx.send_replace(false);
    *inner.cmd_tx.lock().expect("tcp cmd lock poisoned") = None;
}

/// Single-owner connection actor: reads feed the dispatcher, commands
/// arrive over the channel. Returns when the peer closes, an I/O error
/// occurs, or a disconnect is requested.
async fn run_connection(
    mut stream: Stream,
    mut cmd_rx: mpsc::Receiver<ConnCmd>,
    inner: &Arc<TcpInner>,
) {
    let mut buf = vec![0u8; inner.config.read_buffer_size.max(2048)];

    loop {
        let mut pending = None;
        tokio::select! {
            result = stream.read(&mut buf) => match result {
                Ok(0) => {
                    debug!("Peer closed the connection");
                    break;
                }
                Ok(n) => inner.dispatcher.process(&buf[..n]),
                Err(e) => {
                    debug!("Read error: {}", e);
                    break;
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => pending = Some(cmd),
                None => break,
            },
        }

        // Handled outside the select so the command can take the stream
        let Some(cmd) = pending else { continue };
        match cmd {
            ConnCmd::Write(bytes, ack) => match stream.write_all_flush(&bytes).await {
                Ok(()) => {
                    let _ = ack.send(bytes.len());
                }
                Err(e) => {
                    debug!("Write error: {}", e);
                    let _ = ack.send(0);
                    break;
                }
            },
            ConnCmd::StartTls(config, name, ack) => {
                match std::mem::replace(&mut stream, Stream::Detached) {
                    Stream::Plain(tcp) => {
                        let connector = TlsConnector::from(config);
                        match connector.connect(name, tcp).await {
                            Ok(tls) => {
                                debug!("Session upgraded to TLS");
                                stream = Stream::Tls(Box::new(tls));
                                let _ = ack.send(Ok(()));
                            }
                            Err(e) => {
                                let _ = ack.send(Err(Error::fatal(format!(
                                    "TLS handshake failed: {}",
                                    e
                                ))));
                                break;
                            }
                        }
                    }
                    tls @ Stream::Tls(_) => {
                        // Already upgraded
                        stream = tls;
                        let _ = ack.send(Ok(()));
                    }
                    Stream::Detached => break,
                }
            }
            ConnCmd::Disconnect => {
                stream.shutdown().await;
                break;
            }
        }
    }
}
