//! TCP transport with newline-delimited JSON framing

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::debug;

use super::Transport;
use crate::error::{OrchestratorError, Result};
use crate::protocol::Message;
use crate::utils::Stopwatch;

/// Default window for connecting to a test host that may not be listening yet
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(50);

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

pub struct TcpTransport {
    connect_timeout: Duration,
    retry_interval: Duration,
    reader: Mutex<Option<BufReader<OwnedReadHalf>>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, retry_interval: Duration) -> Self {
        Self {
            connect_timeout,
            retry_interval,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    /// Wrap an already accepted stream
    pub fn from_stream(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            reader: Mutex::new(Some(BufReader::new(read))),
            writer: Mutex::new(Some(write)),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_RETRY_INTERVAL)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, endpoint: &str) -> Result<String> {
        let addr: SocketAddr = endpoint
            .parse()
            .map_err(|_| OrchestratorError::InvalidEndpoint(endpoint.to_string()))?;

        let stopwatch = Stopwatch::new();
        let mut attempts = 0u32;
        let stream = loop {
            attempts += 1;
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) => {
                    if stopwatch.has_exceeded(self.connect_timeout) {
                        return Err(OrchestratorError::ConnectionFailed {
                            endpoint: endpoint.to_string(),
                            reason: format!("{e} (after {attempts} attempts)"),
                        });
                    }
                    let wait = self
                        .retry_interval
                        .min(stopwatch.remaining(self.connect_timeout));
                    tokio::time::sleep(wait).await;
                }
            }
        };

        stream.set_nodelay(true)?;
        let resolved = stream.peer_addr()?.to_string();
        debug!("Connected to {} after {} attempt(s)", resolved, attempts);

        let (read, write) = stream.into_split();
        *self.reader.lock().await = Some(BufReader::new(read));
        *self.writer.lock().await = Some(write);

        Ok(resolved)
    }

    async fn send(&self, message: &Message) -> Result<()> {
        let line = message.encode()?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(OrchestratorError::ConnectionClosed)?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        Ok(())
    }

    async fn receive(&self) -> Result<Message> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(OrchestratorError::ConnectionClosed)?;

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Err(OrchestratorError::ConnectionClosed);
            }
            if !line.trim().is_empty() {
                return Message::decode(&line);
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        // A pending receive owns the reader; it ends on its own once the peer closes.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        Ok(())
    }
}

/// Listening side used by channels that wait for a peer to connect
pub struct TcpServer {
    listener: TcpListener,
    local: SocketAddr,
}

impl TcpServer {
    pub async fn bind(endpoint: &str) -> Result<Self> {
        let listener = TcpListener::bind(endpoint).await?;
        let local = listener.local_addr()?;
        debug!("Listening on {}", local);
        Ok(Self { listener, local })
    }

    pub fn port(&self) -> u16 {
        self.local.port()
    }

    pub fn local_endpoint(&self) -> String {
        self.local.to_string()
    }

    /// Accept one connection within `timeout`
    pub async fn accept(&self, timeout: Duration) -> Result<TcpTransport> {
        match tokio::time::timeout(timeout, self.listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                debug!("Accepted connection from {} on {}", peer, self.local);
                Ok(TcpTransport::from_stream(stream))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(OrchestratorError::ConnectionFailed {
                endpoint: self.local_endpoint(),
                reason: format!("no connection within {}ms", timeout.as_millis()),
            }),
        }
    }
}

/// Pick a free loopback endpoint for a test host to listen on
pub fn reserve_local_endpoint() -> Result<String> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.to_string())
}
