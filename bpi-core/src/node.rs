//! Node-level dependency injection: constructs one owning handle per
//! subsystem at startup and hands clonable `Arc`s to callers. No subsystem
//! publishes itself through a global (spec.md §9 Design Notes); the
//! supervisor is the single place that wires them together.
//!
//! Subsystems whose state lives entirely behind the KV-store façade expose
//! `&self` methods (the façade's own locking is sufficient) and are held
//! as a bare `Arc<T>`. Subsystems that keep additional in-process state
//! (HashMaps of caches, trackers, in-flight proposals) need `&mut self`
//! and are wrapped `Arc<Mutex<T>>`, one mutex per subsystem per spec.md §5
//! ("never nested across subsystem boundaries").

use std::path::Path;
use std::sync::{Arc, Mutex};

use access_control::AccessControlAuditor;
use behavior_metrics::BehaviorMetricsStore;
use collusion_reorg::{CollusionDetector, ReorgMonitor};
use cross_chain_bridge::CrossChainBridge;
use cvm_kvstore::KvStore;
use eclipse_sybil::EligibilityStore;
use bpi_leader_selection::LeaderElection;
use enhanced_storage::EnhancedStorage;
use fee_calculator::FeeCalculator;
use mempool::EncryptedMempool;
use reputation_system::{HatConsensus, ReputationStore, RewardDistributor};
use sequencer_consensus::SequencerConsensus;
use sequencer_discovery::SequencerDiscovery;
use trust_graph::TrustGraph;

use crate::config::NodeConfig;
use crate::metrics::NodeMetrics;

/// Owns every subsystem handle for one running node. Cheap to clone: every
/// field is itself an `Arc`, so cloning a `NodeSupervisor` is the usual
/// "hand every task its own handle" pattern, not a deep copy.
#[derive(Clone)]
pub struct NodeSupervisor {
    pub config: NodeConfig,
    pub metrics: Arc<NodeMetrics>,

    pub trust_graph: Arc<TrustGraph>,
    pub reputation: Arc<ReputationStore>,
    pub hat: Arc<HatConsensus>,
    pub reward_distributor: Arc<RewardDistributor>,
    pub behavior: Arc<BehaviorMetricsStore>,
    pub eligibility: Arc<EligibilityStore>,
    pub access_control: Arc<AccessControlAuditor>,

    pub enhanced_storage: Arc<Mutex<EnhancedStorage>>,
    pub fee_calculator: Arc<Mutex<FeeCalculator>>,
    pub cross_chain_bridge: Arc<Mutex<CrossChainBridge>>,

    pub sequencer_discovery: Arc<Mutex<SequencerDiscovery>>,
    pub leader_election: Arc<Mutex<LeaderElection>>,
    pub sequencer_consensus: Arc<Mutex<SequencerConsensus>>,
    pub mempool: Arc<Mutex<EncryptedMempool>>,
    pub collusion_detector: Arc<Mutex<CollusionDetector>>,
    pub reorg_monitor: Arc<Mutex<ReorgMonitor>>,
}

impl NodeSupervisor {
    /// Opens (or creates) the on-disk store at `config.data_dir` and wires
    /// every subsystem to its own tree within it, per `KvStore::open`'s
    /// one-tree-per-subsystem convention.
    pub fn open(config: NodeConfig) -> anyhow::Result<Self> {
        let data_dir = Path::new(&config.data_dir);
        let kv = |tree: &str| -> anyhow::Result<KvStore> { Ok(KvStore::open(data_dir, tree)?) };

        let dao_members = std::collections::HashSet::new();

        let trust_graph = Arc::new(TrustGraph::new(kv("trust")?, config.wot, dao_members));
        let reputation = Arc::new(ReputationStore::new(kv("reputation")?));
        let hat = Arc::new(HatConsensus::new(kv("hat")?));
        let reward_distributor = Arc::new(RewardDistributor::new(Default::default()));
        let behavior = Arc::new(BehaviorMetricsStore::new(kv("behavior")?));
        let eligibility = Arc::new(EligibilityStore::new(kv("eligibility")?, config.eligibility));
        let access_control = Arc::new(AccessControlAuditor::new(kv("access_control")?));
        access_control.set_rule("default", config.default_rate_limit);

        let enhanced_storage = Arc::new(Mutex::new(EnhancedStorage::new(kv("cvm_storage")?)));
        let fee_calculator = Arc::new(Mutex::new(FeeCalculator::new(
            config.daily_free_gas_allowance,
            config.gas_subsidy_fraction,
        )));
        let cross_chain_bridge = Arc::new(Mutex::new(CrossChainBridge::new()));

        let sequencer_discovery = Arc::new(Mutex::new(SequencerDiscovery::new(config.l2_chain_id)));
        let leader_election = Arc::new(Mutex::new(LeaderElection::new(config.l2_chain_id, config.cas_satoshis)));
        let sequencer_consensus = Arc::new(Mutex::new(SequencerConsensus::new(
            config.l2_chain_id,
            config.cas_satoshis,
            config.vote_timeout_ms,
        )));
        let mempool = Arc::new(Mutex::new(EncryptedMempool::new(config.l2_chain_id, config.mempool.clone())));
        let collusion_detector = Arc::new(Mutex::new(CollusionDetector::new(config.l2_chain_id)));
        let reorg_monitor = Arc::new(Mutex::new(ReorgMonitor::new(config.l2_chain_id, config.finality_depth)));

        let metrics = Arc::new(NodeMetrics::new().map_err(|e| anyhow::anyhow!("failed to register metrics: {e}"))?);

        Ok(Self {
            config,
            metrics,
            trust_graph,
            reputation,
            hat,
            reward_distributor,
            behavior,
            eligibility,
            access_control,
            enhanced_storage,
            fee_calculator,
            cross_chain_bridge,
            sequencer_discovery,
            leader_election,
            sequencer_consensus,
            mempool,
            collusion_detector,
            reorg_monitor,
        })
    }

    /// In-memory node for tests and local experimentation; never persisted.
    pub fn ephemeral(config: NodeConfig) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let mut config = config;
        config.data_dir = dir.path().to_string_lossy().into_owned();
        // Leak the tempdir so its files outlive this call; ephemeral nodes
        // are short-lived test/demo processes, not long-running ones.
        std::mem::forget(dir);
        Self::open(config)
    }

    /// Snapshots the gauges that reflect current pool/registry sizes so
    /// they stay fresh even when nothing else touched them this tick.
    pub fn refresh_gauges(&self) {
        if let Ok(pool) = self.mempool.lock() {
            self.metrics.mempool_size.set(pool.len() as i64);
        }
    }
}
