//! Validator eligibility gating, validator-set diversity checks, and
//! coordinated-timing-attack detection (spec.md §4.5).

use std::collections::{HashMap, HashSet};

use crypto_primitives::{Addr, Amount, Height};
use cvm_kvstore::KvStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EclipseSybilError {
    #[error("storage error: {0}")]
    Storage(#[from] cvm_kvstore::KvError),
}

pub type Result<T> = std::result::Result<T, EclipseSybilError>;

/// Eligibility thresholds, grounded on `eclipse_sybil_protection.cpp`'s
/// `MIN_*` constants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EligibilityConfig {
    pub min_history_blocks: u32,
    pub min_validations: u32,
    pub min_validation_accuracy: f64,
    pub min_stake_age_blocks: u32,
    pub min_stake_sources: usize,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            min_history_blocks: 10_000,
            min_validations: 50,
            min_validation_accuracy: 0.85,
            min_stake_age_blocks: 1000,
            min_stake_sources: 3,
        }
    }
}

/// Per-validator history tracked to evaluate eligibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorHistory {
    pub addr: Addr,
    pub first_seen_height: Height,
    pub validations_total: u32,
    pub validations_correct: u32,
    pub stake_age_blocks: u32,
    pub stake_sources: HashSet<Addr>,
}

impl ValidatorHistory {
    pub fn new(addr: Addr, first_seen_height: Height) -> Self {
        Self {
            addr,
            first_seen_height,
            validations_total: 0,
            validations_correct: 0,
            stake_age_blocks: 0,
            stake_sources: HashSet::new(),
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.validations_total == 0 {
            0.0
        } else {
            self.validations_correct as f64 / self.validations_total as f64
        }
    }

    pub fn is_eligible(&self, cfg: &EligibilityConfig, current_height: Height) -> bool {
        let history_blocks = (current_height - self.first_seen_height).max(0) as u32;
        history_blocks >= cfg.min_history_blocks
            && self.validations_total >= cfg.min_validations
            && self.accuracy() >= cfg.min_validation_accuracy
            && self.stake_age_blocks >= cfg.min_stake_age_blocks
            && self.stake_sources.len() >= cfg.min_stake_sources
    }
}

fn history_key(addr: &Addr) -> Vec<u8> {
    format!("validator_history_{}", addr.to_hex()).into_bytes()
}

pub struct EligibilityStore {
    kv: KvStore,
    config: EligibilityConfig,
}

impl EligibilityStore {
    pub fn new(kv: KvStore, config: EligibilityConfig) -> Self {
        Self { kv, config }
    }

    pub fn get_or_new(&self, addr: Addr, first_seen_height: Height) -> Result<ValidatorHistory> {
        Ok(self.kv.get_json(history_key(&addr))?.unwrap_or_else(|| ValidatorHistory::new(addr, first_seen_height)))
    }

    pub fn save(&self, history: &ValidatorHistory) -> Result<()> {
        self.kv.put_json(history_key(&history.addr), history)?;
        Ok(())
    }

    pub fn is_eligible(&self, addr: &Addr, current_height: Height) -> Result<bool> {
        Ok(self
            .kv
            .get_json::<ValidatorHistory>(history_key(addr))?
            .map(|h| h.is_eligible(&self.config, current_height))
            .unwrap_or(false))
    }
}

/// Inputs describing one member of a candidate validator set, used by
/// `check_diversity`.
#[derive(Debug, Clone)]
pub struct MemberTopology {
    pub addr: Addr,
    /// First 16 bits of the member's advertised IP, used as the /16 subnet id.
    pub subnet16: u16,
    pub peers: HashSet<Addr>,
    pub stake: Amount,
    pub wallet_cluster: Option<Addr>,
    pub has_wot_edge: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiversityReport {
    pub diverse: bool,
    pub subnet_violation: bool,
    pub peer_overlap_violation: bool,
    pub wallet_cluster_violation: bool,
    pub wot_isolation_violation: bool,
    pub reasons: Vec<String>,
}

/// A validator set is diverse iff no /16 subnet holds > 50% of members, no
/// pair has peer-overlap > 50%, no wallet cluster holds > 20% of stake, and
/// ≥ 40% of members lack any WoT edge.
pub fn check_diversity(members: &[MemberTopology]) -> DiversityReport {
    let mut report = DiversityReport { diverse: true, ..Default::default() };
    if members.is_empty() {
        return report;
    }
    let n = members.len();

    let mut by_subnet: HashMap<u16, usize> = HashMap::new();
    for m in members {
        *by_subnet.entry(m.subnet16).or_default() += 1;
    }
    if by_subnet.values().any(|&count| count as f64 / n as f64 > 0.5) {
        report.subnet_violation = true;
        report.diverse = false;
        report.reasons.push("a /16 subnet holds more than 50% of the validator set".into());
    }

    'pairs: for i in 0..n {
        for j in (i + 1)..n {
            let a = &members[i].peers;
            let b = &members[j].peers;
            if a.is_empty() || b.is_empty() {
                continue;
            }
            let overlap = a.intersection(b).count();
            let smaller = a.len().min(b.len());
            if smaller > 0 && overlap as f64 / smaller as f64 > 0.5 {
                report.peer_overlap_violation = true;
                report.diverse = false;
                report.reasons.push("peer overlap between two members exceeds 50%".into());
                break 'pairs;
            }
        }
    }

    let total_stake: Amount = members.iter().map(|m| m.stake).sum();
    if total_stake > 0 {
        let mut by_cluster: HashMap<Addr, Amount> = HashMap::new();
        for m in members {
            if let Some(cluster) = m.wallet_cluster {
                *by_cluster.entry(cluster).or_default() += m.stake;
            }
        }
        if by_cluster.values().any(|&stake| stake as f64 / total_stake as f64 > 0.2) {
            report.wallet_cluster_violation = true;
            report.diverse = false;
            report.reasons.push("a wallet cluster controls more than 20% of stake".into());
        }
    }

    let without_wot = members.iter().filter(|m| !m.has_wot_edge).count();
    if (without_wot as f64 / n as f64) < 0.4 {
        report.wot_isolation_violation = true;
        report.diverse = false;
        report.reasons.push("fewer than 40% of members lack a WoT edge".into());
    }

    report
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatedAttack {
    pub cluster_size: usize,
    pub span_ms: i64,
    pub confidence: f64,
    pub suspects: Vec<Addr>,
}

/// Sorts response timestamps and finds the largest cluster inside a 1000 ms
/// sliding window; flags an attack when that cluster has ≥ 5 validators.
pub fn detect_coordinated_attack(mut responses: Vec<(Addr, i64)>) -> Option<CoordinatedAttack> {
    const WINDOW_MS: i64 = 1000;
    const MIN_CLUSTER: usize = 5;

    responses.sort_by_key(|(_, ts)| *ts);
    let mut best: Option<(usize, i64, Vec<Addr>)> = None;

    for i in 0..responses.len() {
        let start = responses[i].1;
        let mut j = i;
        while j + 1 < responses.len() && responses[j + 1].1 - start <= WINDOW_MS {
            j += 1;
        }
        let size = j - i + 1;
        let span = responses[j].1 - start;
        if best.as_ref().map(|(best_size, _, _)| size > *best_size).unwrap_or(true) {
            let suspects = responses[i..=j].iter().map(|(a, _)| *a).collect();
            best = Some((size, span, suspects));
        }
    }

    let (cluster_size, span_ms, suspects) = best?;
    if cluster_size < MIN_CLUSTER {
        return None;
    }
    let density_factor = cluster_size as f64 / 5.0;
    let time_factor = 1.0 - (span_ms as f64 / WINDOW_MS as f64);
    let confidence = (0.6 * density_factor + 0.4 * time_factor).min(1.0);
    Some(CoordinatedAttack { cluster_size, span_ms, confidence, suspects })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Addr {
        let mut b = [0u8; 20];
        b[0] = n;
        Addr(b)
    }

    #[test]
    fn eligibility_requires_every_condition() {
        let cfg = EligibilityConfig::default();
        let mut h = ValidatorHistory::new(addr(1), 0);
        assert!(!h.is_eligible(&cfg, 10_000));
        h.validations_total = 60;
        h.validations_correct = 55;
        h.stake_age_blocks = 2000;
        h.stake_sources = (10..13).map(addr).collect();
        assert!(h.is_eligible(&cfg, 10_000));
    }

    #[test]
    fn subnet_concentration_breaks_diversity() {
        let members: Vec<_> = (0..4)
            .map(|i| MemberTopology {
                addr: addr(i),
                subnet16: 1,
                peers: HashSet::new(),
                stake: 100,
                wallet_cluster: None,
                has_wot_edge: false,
            })
            .collect();
        let report = check_diversity(&members);
        assert!(!report.diverse);
        assert!(report.subnet_violation);
    }

    #[test]
    fn diverse_set_passes() {
        let members: Vec<_> = (0..10)
            .map(|i| MemberTopology {
                addr: addr(i),
                subnet16: i as u16,
                peers: HashSet::new(),
                stake: 100,
                wallet_cluster: Some(addr(100 + i)),
                has_wot_edge: i % 2 == 0,
            })
            .collect();
        let report = check_diversity(&members);
        assert!(report.diverse, "{:?}", report.reasons);
    }

    #[test]
    fn coordinated_cluster_of_five_is_flagged() {
        let responses: Vec<_> = (0..5).map(|i| (addr(i), i as i64 * 100)).collect();
        let attack = detect_coordinated_attack(responses).unwrap();
        assert_eq!(attack.cluster_size, 5);
        assert!(attack.confidence > 0.0 && attack.confidence <= 1.0);
    }

    #[test]
    fn sparse_responses_are_not_flagged() {
        let responses: Vec<_> = (0..4).map(|i| (addr(i), i as i64 * 10_000)).collect();
        assert!(detect_coordinated_attack(responses).is_none());
    }
}
