//! Chain reconciliation between nodes.
//!
//! This module provides:
//! - Change detection: the serialized chain is compared byte-for-byte with the
//!   last snapshot sent, and only a changed snapshot is disseminated
//! - Fork choice on received snapshots (full-chain replacement only)
//! - Per-peer bookkeeping of received snapshots and failures
//! - The periodic publishing task and the announcement fan-out task

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::blockchain::Block;
use crate::consensus::ForkDecision;
use crate::error::{ChainError, Result};
use crate::ledger::Ledger;
use crate::shutdown::Shutdown;
use crate::staking::Announcement;

/// Default period between snapshot comparisons.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive failures after which a peer is considered unreliable.
pub const MAX_PEER_FAILURES: u32 = 3;

const OUTBOUND_CAPACITY: usize = 64;

/// One line on the peer wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    Chain { blocks: Vec<Block> },
    Announcement { announcement: Announcement },
}

impl SyncMessage {
    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| ChainError::DeserializationFailure(e.to_string()))
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ChainError::DeserializationFailure(e.to_string()))
    }
}

/// Peer sync information
#[derive(Debug, Clone)]
pub struct PeerSyncInfo {
    pub addr: String,
    pub last_seen: Instant,
    pub snapshots_received: u64,
    pub chains_adopted: u64,
    pub consecutive_failures: u32,
    pub total_failures: u64,
}

impl PeerSyncInfo {
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            last_seen: Instant::now(),
            snapshots_received: 0,
            chains_adopted: 0,
            consecutive_failures: 0,
            total_failures: 0,
        }
    }

    /// Check if peer should be considered unreliable
    pub fn is_unreliable(&self) -> bool {
        self.consecutive_failures >= MAX_PEER_FAILURES
    }
}

/// Sync statistics
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub snapshots_published: u64,
    pub snapshots_received: u64,
    pub chains_adopted: u64,
    pub snapshots_rejected: u64,
    pub last_adoption: Option<Instant>,
}

pub struct ChainSynchronizer {
    ledger: Ledger,
    peers: Arc<RwLock<HashMap<String, PeerSyncInfo>>>,
    stats: Arc<RwLock<SyncStats>>,
    /// Serialized chain most recently handed to peers.
    last_sent: Mutex<Option<String>>,
    trigger: Notify,
    outbound: broadcast::Sender<SyncMessage>,
}

impl ChainSynchronizer {
    pub fn new(ledger: Ledger) -> Self {
        let (outbound, _) = broadcast::channel(OUTBOUND_CAPACITY);
        Self {
            ledger,
            peers: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(SyncStats::default())),
            last_sent: Mutex::new(None),
            trigger: Notify::new(),
            outbound,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Receive every message disseminated to peers from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
        self.outbound.subscribe()
    }

    /// Ask the publishing task to compare snapshots now rather than at the next tick.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Full current chain, sent to a peer right after it connects.
    pub fn current_snapshot(&self) -> SyncMessage {
        SyncMessage::Chain {
            blocks: self.ledger.current_chain(),
        }
    }

    /// Serialize the chain and compare with the last snapshot sent.
    /// Returns the blocks when they differ, recording them as sent.
    pub async fn poll_snapshot(&self) -> Result<Option<Vec<Block>>> {
        let blocks = self.ledger.current_chain();
        let serialized =
            serde_json::to_string(&blocks).map_err(|e| ChainError::DeserializationFailure(e.to_string()))?;

        let mut last_sent = self.last_sent.lock().await;
        if last_sent.as_deref() == Some(serialized.as_str()) {
            return Ok(None);
        }
        *last_sent = Some(serialized);
        Ok(Some(blocks))
    }

    /// Disseminate the chain if it changed since the last call.
    pub async fn publish_if_changed(&self) -> Result<bool> {
        match self.poll_snapshot().await? {
            Some(blocks) => {
                let len = blocks.len();
                // no connected peers is not an error
                let receivers = self.outbound.send(SyncMessage::Chain { blocks }).unwrap_or(0);
                self.stats.write().await.snapshots_published += 1;
                debug!(len, receivers, "published chain snapshot");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn publish_announcement(&self, announcement: Announcement) {
        let _ = self.outbound.send(SyncMessage::Announcement { announcement });
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Decode and apply one line from a peer. Anything malformed or invalid
    /// is discarded and counted against the peer; the ledger is untouched.
    pub async fn handle_line(&self, peer_addr: &str, line: &str) -> Result<Option<ForkDecision>> {
        let message = match SyncMessage::decode(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = peer_addr, error = %e, "discarding undecodable snapshot");
                self.record_failure(peer_addr).await;
                return Err(e);
            }
        };
        self.handle_message(peer_addr, message).await
    }

    pub async fn handle_message(&self, peer_addr: &str, message: SyncMessage) -> Result<Option<ForkDecision>> {
        match message {
            SyncMessage::Chain { blocks } => self.handle_remote_blocks(peer_addr, blocks).await.map(Some),
            SyncMessage::Announcement { announcement } => {
                info!(
                    peer = peer_addr,
                    round = announcement.round,
                    winner = %announcement.winner,
                    "winning validator announced"
                );
                self.touch_peer(peer_addr).await;
                Ok(None)
            }
        }
    }

    /// Apply fork choice to a peer's chain.
    pub async fn handle_remote_blocks(&self, peer_addr: &str, blocks: Vec<Block>) -> Result<ForkDecision> {
        self.stats.write().await.snapshots_received += 1;
        match self.ledger.receive_remote_blocks(blocks) {
            Ok(decision) => {
                self.record_success(peer_addr, decision.is_adopted()).await;
                if decision.is_adopted() {
                    let mut stats = self.stats.write().await;
                    stats.chains_adopted += 1;
                    stats.last_adoption = Some(Instant::now());
                    drop(stats);
                    self.trigger();
                }
                Ok(decision)
            }
            Err(e) => {
                warn!(peer = peer_addr, error = %e, "discarding invalid remote chain");
                self.stats.write().await.snapshots_rejected += 1;
                self.record_failure(peer_addr).await;
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Peer bookkeeping
    // ------------------------------------------------------------------

    /// Register a peer for synchronization
    pub async fn register_peer(&self, addr: &str) -> Result<()> {
        let mut peers = self.peers.write().await;
        if let std::collections::hash_map::Entry::Vacant(e) = peers.entry(addr.to_string()) {
            e.insert(PeerSyncInfo::new(addr.to_string()));
            Ok(())
        } else {
            Err(ChainError::NetworkError(format!("Peer {} already registered", addr)))
        }
    }

    pub async fn remove_peer(&self, addr: &str) -> Result<()> {
        self.peers
            .write()
            .await
            .remove(addr)
            .map(|_| ())
            .ok_or_else(|| ChainError::NetworkError(format!("Peer {} not found", addr)))
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peer_addrs(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.peers.read().await.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    pub async fn get_peer_info(&self, addr: &str) -> Option<PeerSyncInfo> {
        self.peers.read().await.get(addr).cloned()
    }

    pub async fn is_unreliable(&self, addr: &str) -> bool {
        self.peers
            .read()
            .await
            .get(addr)
            .is_some_and(PeerSyncInfo::is_unreliable)
    }

    pub async fn get_stats(&self) -> SyncStats {
        self.stats.read().await.clone()
    }

    /// Record a failed snapshot; returns true once the peer is unreliable.
    pub async fn record_failure(&self, addr: &str) -> bool {
        let mut peers = self.peers.write().await;
        let peer = peers
            .entry(addr.to_string())
            .or_insert_with(|| PeerSyncInfo::new(addr.to_string()));
        peer.consecutive_failures += 1;
        peer.total_failures += 1;
        peer.last_seen = Instant::now();
        if peer.is_unreliable() {
            warn!(peer = addr, failures = peer.consecutive_failures, "peer marked as unreliable");
        }
        peer.is_unreliable()
    }

    async fn record_success(&self, addr: &str, adopted: bool) {
        let mut peers = self.peers.write().await;
        let peer = peers
            .entry(addr.to_string())
            .or_insert_with(|| PeerSyncInfo::new(addr.to_string()));
        peer.snapshots_received += 1;
        peer.consecutive_failures = 0;
        peer.last_seen = Instant::now();
        if adopted {
            peer.chains_adopted += 1;
        }
    }

    async fn touch_peer(&self, addr: &str) {
        if let Some(peer) = self.peers.write().await.get_mut(addr) {
            peer.last_seen = Instant::now();
        }
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    /// Compare and publish on every tick, or sooner when triggered.
    pub fn spawn_publisher(self: Arc<Self>, interval: Duration, shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "reconciliation started");
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(interval) => {}
                    _ = self.trigger.notified() => {}
                }
                if let Err(e) = self.publish_if_changed().await {
                    warn!(error = %e, "failed to publish chain snapshot");
                }
            }
            info!("reconciliation stopped");
        })
    }

    /// Relay round announcements from the ledger to every peer.
    pub fn spawn_announcement_relay(self: Arc<Self>, shutdown: Shutdown) -> JoinHandle<()> {
        let mut announcements = self.ledger.subscribe_announcements();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    received = announcements.recv() => match received {
                        Ok(announcement) => {
                            self.publish_announcement(announcement);
                            // the winner changed the chain
                            self.trigger();
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "announcement relay lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}
