//! OPC TCP server
//!
//! One accept loop plus one task per connection. Each connection runs a
//! small state machine:
//!
//! ```text
//! AwaitingHeader -> AwaitingPayload -> Dispatch -> AwaitingHeader
//! ```
//!
//! and closes when the peer disconnects, a read times out, the stream is
//! truncated mid-message, or the server stops. Unknown commands do not
//! close the connection.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::color::ColorCorrector;
use crate::dispatch::{CommandDispatcher, PixelSink, StandbyGuard};
use crate::protocol::{self, Header, DEFAULT_PORT, HEADER_LEN};
use crate::{error::OpcError, Result};

/// OPC server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpcServerConfig {
    pub host: String,
    pub port: u16,
    pub reuse_address: bool,
    /// Bound on reading one header or one payload; an idle connection is
    /// closed after this long
    pub read_timeout_ms: u64,
    /// How long `standby` waits for an in-flight command to finish
    pub standby_timeout_ms: u64,
}

impl Default for OpcServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            reuse_address: true,
            read_timeout_ms: 3000,
            standby_timeout_ms: 1000,
        }
    }
}

impl OpcServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = duration_to_ms(timeout);
        self
    }

    pub fn with_standby_timeout(mut self, timeout: Duration) -> Self {
        self.standby_timeout_ms = duration_to_ms(timeout);
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn standby_timeout(&self) -> Duration {
        Duration::from_millis(self.standby_timeout_ms)
    }

    /// `host:port`, with IPv6 literals bracketed
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_timeout_ms == 0 {
            return Err(OpcError::InvalidParameter(
                "read timeout must be greater than zero".to_string(),
            ));
        }
        if self.standby_timeout_ms == 0 {
            return Err(OpcError::InvalidParameter(
                "standby timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A running OPC server.
///
/// Dropping the server stops it.
pub struct OpcServer {
    config: OpcServerConfig,
    local_addr: SocketAddr,
    dispatcher: Arc<CommandDispatcher>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl OpcServer {
    /// Bind the listening socket and start accepting connections.
    ///
    /// The server starts with gamma 1.0 and whitepoint (1, 1, 1).
    pub async fn start(config: OpcServerConfig, sink: Option<Arc<dyn PixelSink>>) -> Result<Self> {
        let dispatcher = CommandDispatcher::new(Arc::new(ColorCorrector::new()), sink);
        Self::start_with_dispatcher(config, Arc::new(dispatcher)).await
    }

    /// Start with an existing dispatcher, e.g. to share a color corrector
    pub async fn start_with_dispatcher(
        config: OpcServerConfig,
        dispatcher: Arc<CommandDispatcher>,
    ) -> Result<Self> {
        config.validate()?;

        let listener = bind_listener(&config).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            dispatcher.clone(),
            config.read_timeout(),
            shutdown_rx,
        ));

        info!("OPC server listening on {}", local_addr);

        Ok(Self {
            config,
            local_addr,
            dispatcher,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn config(&self) -> &OpcServerConfig {
        &self.config
    }

    /// Address the listener is bound to (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn color_corrector(&self) -> &Arc<ColorCorrector> {
        self.dispatcher.color_corrector()
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown.borrow()
    }

    /// Suspend command dispatch until the guard is dropped.
    ///
    /// Waits at most `standby_timeout_ms` for an in-flight command.
    pub async fn standby(&self) -> Result<StandbyGuard> {
        self.dispatcher
            .engage_standby(self.config.standby_timeout())
            .await
    }

    /// Stop accepting connections and close every open connection.
    ///
    /// Safe to call more than once and from any thread.
    pub fn stop(&self) {
        if !self.shutdown.send_replace(true) {
            info!("Stopping OPC server on {}", self.local_addr);
        }
    }

    /// Wait until the accept loop and all connections have finished and
    /// the listening socket is released. Call [`stop`](Self::stop) first.
    pub async fn stopped(&self) {
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("OPC accept loop ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for OpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn bind_listener(config: &OpcServerConfig) -> Result<TcpListener> {
    let addr_str = config.bind_addr();
    let bind_error = |source: std::io::Error| OpcError::BindError {
        addr: addr_str.clone(),
        source,
    };

    let addr = tokio::net::lookup_host(&addr_str)
        .await
        .map_err(bind_error)?
        .next()
        .ok_or_else(|| {
            bind_error(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "host did not resolve to any address",
            ))
        })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_error)?;

    socket
        .set_reuseaddr(config.reuse_address)
        .map_err(bind_error)?;
    socket.bind(addr).map_err(bind_error)?;
    socket.listen(1024).map_err(bind_error)
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<CommandDispatcher>,
    read_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let connection_shutdown = shutdown.clone();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stopped| *stopped) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("OPC client connected: {}", peer);
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        dispatcher.clone(),
                        read_timeout,
                        connection_shutdown.clone(),
                    ));
                }
                Err(e) => warn!("Failed to accept OPC connection: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
    info!("OPC server stopped");
}

/// Why a connection ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    TimedOut,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed"),
            Self::TimedOut => write!(f, "read timed out"),
            Self::Shutdown => write!(f, "server shutdown"),
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<CommandDispatcher>,
    read_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let result = tokio::select! {
        result = serve_connection(&mut stream, &dispatcher, read_timeout) => result,
        _ = shutdown.wait_for(|stopped| *stopped) => Ok(CloseReason::Shutdown),
    };

    match result {
        Ok(reason) => info!("OPC client {} disconnected: {}", peer, reason),
        Err(e) => warn!("OPC connection {} closed: {}", peer, e),
    }

    if let Err(e) = stream.shutdown().await {
        debug!("Socket shutdown for {} failed: {}", peer, e);
    }
}

/// Run the read/decode/dispatch loop until the stream ends
pub async fn serve_connection<S>(
    stream: &mut S,
    dispatcher: &CommandDispatcher,
    read_timeout: Duration,
) -> Result<CloseReason>
where
    S: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];
    let mut payload = Vec::new();

    loop {
        match read_full(stream, &mut header_buf, read_timeout).await? {
            ReadStatus::Complete => {}
            ReadStatus::Eof { read: 0 } => return Ok(CloseReason::PeerClosed),
            ReadStatus::Eof { read } => {
                return Err(OpcError::FramingError(format!(
                    "stream ended after {} of {} header bytes",
                    read, HEADER_LEN
                )))
            }
            ReadStatus::TimedOut => return Ok(CloseReason::TimedOut),
        }

        let header = Header::parse(header_buf);
        payload.resize(header.payload_len(), 0);

        match read_full(stream, &mut payload, read_timeout).await? {
            ReadStatus::Complete => {}
            ReadStatus::Eof { read } => {
                return Err(OpcError::FramingError(format!(
                    "stream ended after {} of {} payload bytes",
                    read, header.length
                )))
            }
            ReadStatus::TimedOut => return Ok(CloseReason::TimedOut),
        }

        let command = protocol::decode(header, &payload)?;
        trace!("Received {} command", command.name());

        if let Err(e) = dispatcher.dispatch(command).await {
            warn!("Dropped OPC command: {}", e);
        }
    }
}

enum ReadStatus {
    Complete,
    Eof { read: usize },
    TimedOut,
}

/// Fill `buf` completely within `timeout`.
///
/// The bound covers the whole buffer, so a peer trickling single bytes
/// cannot keep a header or payload pending indefinitely.
async fn read_full<S>(stream: &mut S, buf: &mut [u8], timeout: Duration) -> Result<ReadStatus>
where
    S: AsyncRead + Unpin,
{
    // None: deadline beyond what Instant can represent
    let deadline = Instant::now().checked_add(timeout);
    let mut filled = 0;
    while filled < buf.len() {
        let read = stream.read(&mut buf[filled..]);
        let n = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, read).await {
                Ok(read) => read?,
                Err(_) => return Ok(ReadStatus::TimedOut),
            },
            None => read.await?,
        };
        if n == 0 {
            return Ok(ReadStatus::Eof { read: filled });
        }
        filled += n;
    }
    Ok(ReadStatus::Complete)
}
