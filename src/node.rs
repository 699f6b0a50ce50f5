use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::blockchain::AdmissionPolicy;
use crate::config::Config;
use crate::error::Result;
use crate::ledger::Ledger;
use crate::network::NetworkNode;
use crate::shutdown::Shutdown;
use crate::staking::RoundOutcome;
use crate::sync::ChainSynchronizer;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(10);
const BOOTSTRAP_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Booting,
    Syncing,
    Ready,
    Degraded,
}

pub struct Node {
    pub config: Config,
    pub ledger: Ledger,
    pub sync: Arc<ChainSynchronizer>,
    pub network: Arc<NetworkNode>,
    pub state: Arc<RwLock<NodeState>>,
    pub shutdown: Shutdown,
}

impl Node {
    /// Build the ledger and its collaborators from a validated config.
    pub fn init(config: Config) -> Result<Self> {
        config.validate()?;
        let policy = config.policy();
        info!(consensus = policy.name(), "initializing duochain node");

        let ledger = Ledger::new(policy).with_stake_penalty(config.consensus.stake_penalty);
        match policy {
            AdmissionPolicy::ProofOfStake => {
                for v in &config.validators {
                    ledger.register_validator(&v.id, v.balance)?;
                }
            }
            AdmissionPolicy::ProofOfWork { difficulty } => {
                if !config.validators.is_empty() {
                    warn!(count = config.validators.len(), "ignoring validators on a work chain");
                }
                info!(difficulty, "proof-of-work admission");
            }
        }

        let shutdown = Shutdown::new();
        let sync = Arc::new(ChainSynchronizer::new(ledger.clone()));
        let network = Arc::new(NetworkNode::new(sync.clone(), shutdown.clone()));

        Ok(Self {
            config,
            ledger,
            sync,
            network,
            state: Arc::new(RwLock::new(NodeState::Booting)),
            shutdown,
        })
    }

    pub async fn node_state(&self) -> NodeState {
        self.state.read().await.clone()
    }

    async fn set_state(&self, state: NodeState) {
        *self.state.write().await = state;
    }

    /// Run every service until ctrl-c or [`Shutdown::trigger`].
    pub async fn start(self: Arc<Self>) -> std::result::Result<(), Box<dyn std::error::Error>> {
        // 1) P2P listener; fail fast if the port is taken
        let p2p_bind = format!("0.0.0.0:{}", self.config.network.p2p_port);
        let listener = NetworkNode::bind(&p2p_bind).await?;
        let net = self.network.clone();
        tokio::spawn(async move {
            if let Err(e) = net.start_server(listener).await {
                error!(error = %e, "P2P server failed");
            }
        });

        // 2) Reconciliation and announcement fan-out
        self.sync
            .clone()
            .spawn_publisher(self.config.reconcile_interval(), self.shutdown.clone());
        self.sync.clone().spawn_announcement_relay(self.shutdown.clone());

        // 3) Bootstrap peers; the first snapshot exchange happens on connect
        if !self.config.network.bootstrap_peers.is_empty() {
            self.set_state(NodeState::Syncing).await;
        }
        for peer in self.config.network.bootstrap_peers.clone() {
            let net = self.network.clone();
            let delay = self.config.reconcile_interval();
            tokio::spawn(async move {
                if let Err(e) = net.connect_with_retry(&peer, BOOTSTRAP_ATTEMPTS, delay).await {
                    warn!(peer = %peer, error = %e, "giving up on bootstrap peer");
                }
            });
        }

        // 4) Election rounds on stake chains
        if self.ledger.policy() == AdmissionPolicy::ProofOfStake {
            self.spawn_round_timer(self.config.round_interval());
        }

        // 5) API
        let node = self.clone();
        let api_port = self.config.network.api_port;
        tokio::spawn(async move {
            let failed = match Node::start_api(node.clone(), api_port).await {
                Ok(()) => false,
                Err(e) => {
                    error!(error = %e, "API server failed");
                    true
                }
            };
            if failed {
                node.set_state(NodeState::Degraded).await;
            }
        });

        self.set_state(NodeState::Ready).await;

        // Node main loop - health logging
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!(error = %e, "failed to listen for ctrl-c");
                    }
                    info!("shutdown requested");
                    self.shutdown.trigger();
                    break;
                }
                _ = tokio::time::sleep(HEALTH_LOG_INTERVAL) => {
                    let peers = self.sync.peer_count().await;
                    let state = self.node_state().await;
                    info!(
                        height = self.ledger.len(),
                        peers,
                        round = self.ledger.round(),
                        state = ?state,
                        "node running"
                    );
                }
            }
        }

        info!(height = self.ledger.len(), "node stopped");
        Ok(())
    }

    /// Close a round every `interval` until shutdown.
    pub fn spawn_round_timer(&self, interval: Duration) -> JoinHandle<()> {
        let ledger = self.ledger.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "election rounds started");
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match ledger.resolve_round() {
                    RoundOutcome::Idle { round } => debug!(round, "round closed with no candidates"),
                    RoundOutcome::NoEligibleValidator { round, discarded } => {
                        info!(round, discarded, "round closed with no eligible validator")
                    }
                    RoundOutcome::Stale { round, winner, discarded } => {
                        info!(round, winner = %winner, discarded, "round winner no longer extends the tip")
                    }
                    RoundOutcome::Appended { announcement, discarded } => {
                        info!(round = announcement.round, winner = %announcement.winner, discarded, "winning validator")
                    }
                }
            }
        })
    }

    #[cfg(feature = "api")]
    async fn start_api(node: Arc<Self>, port: u16) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let api_node = crate::api::ApiNode::new_shared(
            node.ledger.clone(),
            Some(node.sync.clone()),
            Some(node.state.clone()),
            node.shutdown.clone(),
        );
        crate::api::run_api_server(Arc::new(api_node), port).await
    }

    #[cfg(not(feature = "api"))]
    async fn start_api(_node: Arc<Self>, _port: u16) -> std::result::Result<(), Box<dyn std::error::Error>> {
        info!("API feature not enabled in this build");
        Ok(())
    }
}
