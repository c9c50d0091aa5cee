//! Node configuration: every subsystem tunable named in spec.md, loaded
//! from a TOML file with environment-variable overrides.
//!
//! Grounded on the teacher's layered-config approach (`config` crate over
//! a TOML base), adapted from the scope of `metanode-config` (CUE-based
//! docklock/BPCI settings, not applicable here) down to the tunables this
//! node actually has: WoT bond schedule, HAT eligibility thresholds, fee
//! parameters, and sequencer/mempool timing.

use serde::{Deserialize, Serialize};

use access_control::RateLimitRule;
use eclipse_sybil::EligibilityConfig;
use fee_calculator::GasParams;
use mempool::MempoolConfig;
use trust_graph::WotConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub l2_chain_id: u64,
    pub cas_satoshis: u64,
    pub data_dir: String,
    pub http_bind: String,
    pub metrics_bind: String,

    pub wot: WotConfig,
    pub eligibility: EligibilityConfig,
    pub gas: GasParams,
    pub daily_free_gas_allowance: u64,
    pub gas_subsidy_fraction: f64,
    pub mempool: MempoolConfig,

    pub vote_timeout_ms: i64,
    pub finality_depth: u32,
    pub default_rate_limit: RateLimitRule,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            l2_chain_id: 1,
            cas_satoshis: 100_000_000,
            data_dir: "./data".to_string(),
            http_bind: "127.0.0.1:8080".to_string(),
            metrics_bind: "127.0.0.1:9090".to_string(),
            wot: WotConfig::default(),
            eligibility: EligibilityConfig::default(),
            gas: GasParams::default(),
            daily_free_gas_allowance: 1_000_000,
            gas_subsidy_fraction: 0.0,
            mempool: MempoolConfig::default(),
            vote_timeout_ms: 4_000,
            finality_depth: 6,
            default_rate_limit: RateLimitRule::default(),
        }
    }
}

impl NodeConfig {
    /// Loads from `path` if it exists, layering `BPI_`-prefixed
    /// environment variables over it; falls back to `NodeConfig::default`
    /// when no file is present.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("BPI").separator("__"));
        let built = builder.build()?;
        match built.try_deserialize::<Self>() {
            Ok(cfg) => Ok(cfg),
            Err(_) => Ok(Self::default()),
        }
    }
}
