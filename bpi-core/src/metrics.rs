//! Prometheus counters/gauges for the testable properties in spec.md §8,
//! registered through one `prometheus::Registry` handle constructed here
//! and injected into the node supervisor — no `lazy_static`/global registry
//! (spec.md §9 Design Notes: no process-wide singletons).

use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Node-wide metrics. Each field mirrors one of the state machines in
/// spec.md §2; counters only ever increase, gauges track current size.
pub struct NodeMetrics {
    registry: Registry,

    pub trust_edges_total: IntCounter,
    pub bonded_votes_slashed_total: IntCounter,
    pub hat_sessions_opened_total: IntCounter,
    pub hat_sessions_decided_total: IntCounterVec,
    pub dao_disputes_resolved_total: IntCounter,
    pub access_denials_total: IntCounterVec,
    pub blacklist_size: IntGauge,

    pub cvm_executions_total: IntCounter,
    pub cvm_out_of_gas_total: IntCounter,
    pub storage_quota_denials_total: IntCounter,

    pub sequencers_eligible: IntGauge,
    pub leader_failovers_total: IntCounter,
    pub l2_blocks_finalized_total: IntCounter,
    pub l2_blocks_failed_total: IntCounter,
    pub mempool_size: IntGauge,
    pub mempool_shares_collected_total: IntCounter,
    pub collusion_flags_total: IntCounter,
    pub reorgs_detected_total: IntCounter,
    pub reorg_replay_depth: Gauge,
}

impl NodeMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let trust_edges_total = IntCounter::new("bpi_trust_edges_total", "Trust edges registered")?;
        let bonded_votes_slashed_total =
            IntCounter::new("bpi_bonded_votes_slashed_total", "Bonded reputation votes slashed")?;
        let hat_sessions_opened_total =
            IntCounter::new("bpi_hat_sessions_opened_total", "HAT consensus sessions opened")?;
        let hat_sessions_decided_total = IntCounterVec::new(
            Opts::new("bpi_hat_sessions_decided_total", "HAT consensus sessions decided, by outcome"),
            &["outcome"],
        )?;
        let dao_disputes_resolved_total =
            IntCounter::new("bpi_dao_disputes_resolved_total", "DAO disputes resolved")?;
        let access_denials_total = IntCounterVec::new(
            Opts::new("bpi_access_denials_total", "Access-control denials, by reason"),
            &["reason"],
        )?;
        let blacklist_size = IntGauge::new("bpi_blacklist_size", "Addresses currently blacklisted")?;

        let cvm_executions_total = IntCounter::new("bpi_cvm_executions_total", "CVM contract executions")?;
        let cvm_out_of_gas_total = IntCounter::new("bpi_cvm_out_of_gas_total", "CVM executions that ran out of gas")?;
        let storage_quota_denials_total =
            IntCounter::new("bpi_storage_quota_denials_total", "Contract storage writes denied by quota")?;

        let sequencers_eligible = IntGauge::new("bpi_sequencers_eligible", "Sequencers currently eligible")?;
        let leader_failovers_total = IntCounter::new("bpi_leader_failovers_total", "Leader failover promotions")?;
        let l2_blocks_finalized_total = IntCounter::new("bpi_l2_blocks_finalized_total", "L2 blocks finalized")?;
        let l2_blocks_failed_total =
            IntCounter::new("bpi_l2_blocks_failed_total", "L2 block proposals that failed to finalize")?;
        let mempool_size = IntGauge::new("bpi_mempool_size", "Encrypted transactions currently pooled")?;
        let mempool_shares_collected_total =
            IntCounter::new("bpi_mempool_shares_collected_total", "Decryption shares collected")?;
        let collusion_flags_total =
            IntCounter::new("bpi_collusion_flags_total", "Sequencer pairs flagged for collusion")?;
        let reorgs_detected_total = IntCounter::new("bpi_reorgs_detected_total", "L1 reorgs detected")?;
        let reorg_replay_depth = Gauge::new("bpi_reorg_replay_depth", "L2 blocks replayed by the last reorg recovery")?;

        registry.register(Box::new(trust_edges_total.clone()))?;
        registry.register(Box::new(bonded_votes_slashed_total.clone()))?;
        registry.register(Box::new(hat_sessions_opened_total.clone()))?;
        registry.register(Box::new(hat_sessions_decided_total.clone()))?;
        registry.register(Box::new(dao_disputes_resolved_total.clone()))?;
        registry.register(Box::new(access_denials_total.clone()))?;
        registry.register(Box::new(blacklist_size.clone()))?;
        registry.register(Box::new(cvm_executions_total.clone()))?;
        registry.register(Box::new(cvm_out_of_gas_total.clone()))?;
        registry.register(Box::new(storage_quota_denials_total.clone()))?;
        registry.register(Box::new(sequencers_eligible.clone()))?;
        registry.register(Box::new(leader_failovers_total.clone()))?;
        registry.register(Box::new(l2_blocks_finalized_total.clone()))?;
        registry.register(Box::new(l2_blocks_failed_total.clone()))?;
        registry.register(Box::new(mempool_size.clone()))?;
        registry.register(Box::new(mempool_shares_collected_total.clone()))?;
        registry.register(Box::new(collusion_flags_total.clone()))?;
        registry.register(Box::new(reorgs_detected_total.clone()))?;
        registry.register(Box::new(reorg_replay_depth.clone()))?;

        Ok(Self {
            registry,
            trust_edges_total,
            bonded_votes_slashed_total,
            hat_sessions_opened_total,
            hat_sessions_decided_total,
            dao_disputes_resolved_total,
            access_denials_total,
            blacklist_size,
            cvm_executions_total,
            cvm_out_of_gas_total,
            storage_quota_denials_total,
            sequencers_eligible,
            leader_failovers_total,
            l2_blocks_finalized_total,
            l2_blocks_failed_total,
            mempool_size,
            mempool_shares_collected_total,
            collusion_flags_total,
            reorgs_detected_total,
            reorg_replay_depth,
        })
    }

    /// Renders every registered metric in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf).expect("prometheus text encoding is infallible for valid families");
        String::from_utf8(buf).expect("prometheus text encoder only emits valid utf8")
    }
}
