//! Peer transport: newline-delimited JSON over TCP.
//!
//! Every connection, inbound or outbound, is driven by one task that
//! sends our snapshot first, then forwards outbound sync messages and feeds
//! inbound lines to the [`ChainSynchronizer`] until either side hangs up.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ChainError, Result};
use crate::shutdown::Shutdown;
use crate::sync::{ChainSynchronizer, SyncMessage};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest line accepted from a peer, newline excluded.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

pub struct NetworkNode {
    sync: Arc<ChainSynchronizer>,
    shutdown: Shutdown,
    connect_timeout: Duration,
    max_line_bytes: usize,
}

impl NetworkNode {
    pub fn new(sync: Arc<ChainSynchronizer>, shutdown: Shutdown) -> Self {
        Self {
            sync,
            shutdown,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    pub async fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| ChainError::NetworkError(format!("Failed to bind {}: {}", addr, e)))
    }

    /// Accept peers until shutdown.
    pub async fn start_server(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!(addr = %local, "p2p listener started");

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!(peer = %addr, "inbound peer connected");
                        let node = self.clone();
                        tokio::spawn(async move { node.handle_connection(stream, addr.to_string()).await });
                    }
                    Err(e) => warn!(error = %e, "failed to accept peer"),
                },
            }
        }
        info!(addr = %local, "p2p listener stopped");
        Ok(())
    }

    /// Dial a peer and start exchanging snapshots with it.
    pub async fn connect_peer(self: Arc<Self>, addr: &str) -> Result<JoinHandle<()>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ChainError::NetworkError(format!("Timed out connecting to {}", addr)))?
            .map_err(|e| ChainError::NetworkError(format!("Failed to connect to {}: {}", addr, e)))?;
        info!(peer = addr, "connected to peer");

        let peer = addr.to_string();
        Ok(tokio::spawn(async move { self.handle_connection(stream, peer).await }))
    }

    /// Keep dialing until connected, out of attempts, or shut down.
    pub async fn connect_with_retry(self: Arc<Self>, addr: &str, attempts: u32, delay: Duration) -> Result<JoinHandle<()>> {
        let mut last_err = ChainError::NetworkError(format!("No attempt made to connect to {}", addr));
        for attempt in 1..=attempts {
            if self.shutdown.is_triggered() {
                return Err(ChainError::Cancelled);
            }
            match self.clone().connect_peer(addr).await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    debug!(peer = addr, attempt, error = %e, "peer dial failed");
                    last_err = e;
                }
            }
            tokio::select! {
                _ = self.shutdown.wait() => return Err(ChainError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Err(last_err)
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: String) {
        if let Err(e) = self.sync.register_peer(&peer).await {
            debug!(peer = %peer, error = %e, "peer already tracked");
        }

        let (reader, mut writer) = stream.into_split();
        let mut outbound = self.sync.subscribe();
        let mut reader = BufReader::new(reader);
        let mut pending = Vec::new();

        // a new peer gets our chain right away
        if let Err(e) = write_message(&mut writer, &self.sync.current_snapshot()).await {
            warn!(peer = %peer, error = %e, "failed to send initial snapshot");
            let _ = self.sync.remove_peer(&peer).await;
            return;
        }

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                message = outbound.recv() => match message {
                    Ok(message) => {
                        if let Err(e) = write_message(&mut writer, &message).await {
                            warn!(peer = %peer, error = %e, "failed to write to peer");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(peer = %peer, skipped, "peer writer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                line = read_line_capped(&mut reader, &mut pending, self.max_line_bytes) => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        // invalid input is logged and counted inside the synchronizer
                        let _ = self.sync.handle_line(&peer, &line).await;
                        if self.sync.is_unreliable(&peer).await {
                            warn!(peer = %peer, "dropping unreliable peer");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "failed to read from peer");
                        break;
                    }
                },
            }
        }

        let _ = self.sync.remove_peer(&peer).await;
        let _ = writer.shutdown().await;
        info!(peer = %peer, "peer disconnected");
    }
}

/// Read one newline-terminated line, refusing lines longer than `max` bytes.
/// Partial input stays in `buf` between calls, so a cancelled read loses nothing.
async fn read_line_capped<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        if buf.last() == Some(&b'\n') {
            buf.pop();
            return Ok(Some(take_line(buf)));
        }
        if buf.len() > max {
            return Err(ChainError::NetworkError(format!("peer line exceeds {} bytes", max)));
        }
        let limit = (max + 1 - buf.len()) as u64;
        if (&mut *reader).take(limit).read_until(b'\n', buf).await? == 0 {
            // EOF; a trailing unterminated line still counts
            return Ok(if buf.is_empty() { None } else { Some(take_line(buf)) });
        }
    }
}

fn take_line(buf: &mut Vec<u8>) -> String {
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    line
}

async fn write_message(writer: &mut OwnedWriteHalf, message: &SyncMessage) -> Result<()> {
    let mut line = message.encode()?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
