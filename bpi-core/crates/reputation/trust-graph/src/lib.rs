//! Bonded directed trust edges, bonded reputation votes, trust-path search,
//! and DAO dispute resolution over slashed votes (spec.md §4.2).

use std::collections::{BTreeMap, HashSet};

use crypto_primitives::{Addr, Amount, Hash256, Timestamp};
use cvm_kvstore::{Batch, KvStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrustGraphError {
    #[error("trust weight {0} out of range [-100, 100]")]
    WeightOutOfRange(i16),
    #[error("insufficient bond: have {have}, need {need}")]
    InsufficientBond { have: Amount, need: Amount },
    #[error("edge not found for {0} -> {1}")]
    EdgeNotFound(Addr, Addr),
    #[error("vote not found: {0}")]
    VoteNotFound(Hash256),
    #[error("dispute not found: {0}")]
    DisputeNotFound(u64),
    #[error("dispute {0} already resolved")]
    DisputeAlreadyResolved(u64),
    #[error("voter {0} is not a DAO member")]
    NotDaoMember(Addr),
    #[error("storage error: {0}")]
    Storage(#[from] cvm_kvstore::KvError),
}

pub type Result<T> = std::result::Result<T, TrustGraphError>;

/// Policy for the bond a trust edge or vote must post, scaled by |weight|.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WotConfig {
    pub min_bond: Amount,
    pub per_point: Amount,
    /// DAO votes required before a dispute can resolve.
    pub min_dao_votes: usize,
}

impl Default for WotConfig {
    fn default() -> Self {
        // 0.05 CAS minimum, 0.01 CAS per weight point, matching the Cascoin
        // reference bond schedule (examples/original_source/src/cvm/trustgraph.cpp).
        Self { min_bond: 5_000_000, per_point: 1_000_000, min_dao_votes: 5 }
    }
}

pub fn required_bond(cfg: &WotConfig, weight: i16) -> Amount {
    cfg.min_bond + cfg.per_point * (weight.unsigned_abs() as Amount)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustEdge {
    pub from: Addr,
    pub to: Addr,
    pub weight: i16,
    pub bond: Amount,
    pub bond_tx: Hash256,
    pub ts: Timestamp,
    pub slashed: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BondedVote {
    pub voter: Addr,
    pub target: Addr,
    pub value: i16,
    pub bond: Amount,
    pub bond_tx: Hash256,
    pub slashed: bool,
    pub slash_tx: Option<Hash256>,
}

/// One hop accumulated while walking the trust graph.
#[derive(Debug, Clone, Default)]
pub struct TrustPath {
    pub addresses: Vec<Addr>,
    pub weights: Vec<i16>,
    pub total_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaoDispute {
    pub id: u64,
    pub original_vote_tx: Hash256,
    pub challenger: Addr,
    pub challenge_bond: Amount,
    pub dao_votes: BTreeMap<Addr, bool>,
    pub dao_stakes: BTreeMap<Addr, Amount>,
    pub resolved: bool,
    pub slash_decision: Option<bool>,
    pub resolved_time: Option<Timestamp>,
}

fn edge_key(from: &Addr, to: &Addr) -> Vec<u8> {
    format!("trust_{}_{}", from.to_hex(), to.to_hex()).into_bytes()
}

fn inverse_edge_key(to: &Addr, from: &Addr) -> Vec<u8> {
    format!("trust_in_{}_{}", to.to_hex(), from.to_hex()).into_bytes()
}

fn outgoing_prefix(from: &Addr) -> Vec<u8> {
    format!("trust_{}_", from.to_hex()).into_bytes()
}

fn incoming_prefix(to: &Addr) -> Vec<u8> {
    format!("trust_in_{}_", to.to_hex()).into_bytes()
}

fn vote_key(bond_tx: &Hash256) -> Vec<u8> {
    format!("vote_{}", bond_tx.to_hex()).into_bytes()
}

fn votes_for_target_prefix(target: &Addr) -> Vec<u8> {
    format!("votes_{}_", target.to_hex()).into_bytes()
}

fn votes_for_target_key(target: &Addr, bond_tx: &Hash256) -> Vec<u8> {
    format!("votes_{}_{}", target.to_hex(), bond_tx.to_hex()).into_bytes()
}

fn dispute_key(id: u64) -> Vec<u8> {
    format!("dispute_{:020}", id).into_bytes()
}

pub struct TrustGraph {
    kv: KvStore,
    config: WotConfig,
    dao_members: HashSet<Addr>,
}

impl TrustGraph {
    pub fn new(kv: KvStore, config: WotConfig, dao_members: HashSet<Addr>) -> Self {
        Self { kv, config, dao_members }
    }

    /// Idempotent for (from, to): a second call overwrites bond/reason and
    /// writes both the forward and inverse index atomically.
    pub fn add_edge(
        &self,
        from: Addr,
        to: Addr,
        weight: i16,
        bond: Amount,
        bond_tx: Hash256,
        ts: Timestamp,
        reason: String,
    ) -> Result<()> {
        if !(-100..=100).contains(&weight) {
            return Err(TrustGraphError::WeightOutOfRange(weight));
        }
        let need = required_bond(&self.config, weight);
        if bond < need {
            return Err(TrustGraphError::InsufficientBond { have: bond, need });
        }
        let edge = TrustEdge { from, to, weight, bond, bond_tx, ts, slashed: false, reason };
        let mut batch = Batch::new();
        batch.put_json(edge_key(&from, &to), &edge)?;
        batch.put_json(inverse_edge_key(&to, &from), &edge)?;
        self.kv.commit(batch)?;
        tracing::info!(%from, %to, weight, bond, "trust-graph: edge recorded");
        Ok(())
    }

    pub fn get_edge(&self, from: &Addr, to: &Addr) -> Result<Option<TrustEdge>> {
        Ok(self.kv.get_json(edge_key(from, to))?)
    }

    pub fn get_outgoing(&self, from: &Addr) -> Vec<TrustEdge> {
        self.kv
            .scan_prefix_json::<TrustEdge>(outgoing_prefix(from))
            .map(|(_, e)| e)
            .filter(|e| !e.slashed)
            .collect()
    }

    pub fn get_incoming(&self, to: &Addr) -> Vec<TrustEdge> {
        self.kv
            .scan_prefix_json::<TrustEdge>(incoming_prefix(to))
            .map(|(_, e)| e)
            .filter(|e| !e.slashed)
            .collect()
    }

    fn unweighted_mean_incoming(&self, target: &Addr) -> f64 {
        let incoming = self.get_incoming(target);
        if incoming.is_empty() {
            return 0.0;
        }
        let sum: i64 = incoming.iter().map(|e| e.weight as i64).sum();
        sum as f64 / incoming.len() as f64
    }

    /// DFS from `from`, pruning at max depth, slashed edges, and edges
    /// weighted under 10; each accepted hop multiplies the running path
    /// weight by `weight/100`. Results sorted descending by product weight.
    pub fn find_trust_paths(&self, from: Addr, to: Addr, max_depth: u32) -> Vec<TrustPath> {
        let mut results = Vec::new();
        let mut visited = HashSet::new();
        let mut current = TrustPath { addresses: vec![from], weights: Vec::new(), total_weight: 1.0 };
        self.find_paths_recursive(from, to, max_depth, &mut current, &mut visited, &mut results);
        results.sort_by(|a, b| b.total_weight.partial_cmp(&a.total_weight).unwrap());
        results
    }

    fn find_paths_recursive(
        &self,
        current_node: Addr,
        target: Addr,
        remaining_depth: u32,
        current_path: &mut TrustPath,
        visited: &mut HashSet<Addr>,
        results: &mut Vec<TrustPath>,
    ) {
        if current_node == target && !current_path.weights.is_empty() {
            results.push(current_path.clone());
            return;
        }
        if remaining_depth == 0 {
            return;
        }
        visited.insert(current_node);
        for edge in self.get_outgoing(&current_node) {
            if visited.contains(&edge.to) || edge.slashed || edge.weight < 10 {
                continue;
            }
            current_path.addresses.push(edge.to);
            current_path.weights.push(edge.weight);
            current_path.total_weight *= edge.weight as f64 / 100.0;

            self.find_paths_recursive(edge.to, target, remaining_depth - 1, current_path, visited, results);

            current_path.addresses.pop();
            current_path.weights.pop();
            current_path.total_weight = current_path.weights.iter().map(|w| *w as f64 / 100.0).product();
        }
        visited.remove(&current_node);
    }

    /// Self-view returns the mean of non-slashed incoming edges; otherwise
    /// bonded votes on `target` are weighted by the product weight of every
    /// trust path from `viewer`, falling back to the unweighted mean when no
    /// path exists.
    pub fn weighted_reputation(&self, viewer: Addr, target: Addr, max_depth: u32) -> f64 {
        if viewer == target {
            return self.unweighted_mean_incoming(&target);
        }
        let paths = self.find_trust_paths(viewer, target, max_depth);
        if paths.is_empty() {
            return self.unweighted_mean_incoming(&target);
        }
        let votes = self.get_votes_for_address(&target);
        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;
        for path in &paths {
            for vote in votes.iter().filter(|v| !v.slashed) {
                weighted_sum += vote.value as f64 * path.total_weight;
                total_weight += path.total_weight;
            }
        }
        if total_weight > 0.0 {
            weighted_sum / total_weight
        } else {
            self.unweighted_mean_incoming(&target)
        }
    }

    pub fn record_bonded_vote(
        &self,
        voter: Addr,
        target: Addr,
        value: i16,
        bond: Amount,
        bond_tx: Hash256,
    ) -> Result<()> {
        if !(-100..=100).contains(&value) {
            return Err(TrustGraphError::WeightOutOfRange(value));
        }
        let need = required_bond(&self.config, value);
        if bond < need {
            return Err(TrustGraphError::InsufficientBond { have: bond, need });
        }
        let vote = BondedVote { voter, target, value, bond, bond_tx, slashed: false, slash_tx: None };
        let mut batch = Batch::new();
        batch.put_json(vote_key(&bond_tx), &vote)?;
        batch.put_json(votes_for_target_key(&target, &bond_tx), &vote)?;
        self.kv.commit(batch)?;
        Ok(())
    }

    pub fn get_vote(&self, bond_tx: &Hash256) -> Result<Option<BondedVote>> {
        Ok(self.kv.get_json(vote_key(bond_tx))?)
    }

    pub fn get_votes_for_address(&self, target: &Addr) -> Vec<BondedVote> {
        self.kv.scan_prefix_json::<BondedVote>(votes_for_target_prefix(target)).map(|(_, v)| v).collect()
    }

    /// Idempotent: slashing an already-slashed vote is a no-op success.
    pub fn slash_vote(&self, vote_tx: &Hash256, slash_tx: Hash256) -> Result<()> {
        let mut vote = self.get_vote(vote_tx)?.ok_or_else(|| TrustGraphError::VoteNotFound(*vote_tx))?;
        if vote.slashed {
            return Ok(());
        }
        vote.slashed = true;
        vote.slash_tx = Some(slash_tx);
        let mut batch = Batch::new();
        batch.put_json(vote_key(vote_tx), &vote)?;
        batch.put_json(votes_for_target_key(&vote.target, vote_tx), &vote)?;
        self.kv.commit(batch)?;
        Ok(())
    }

    pub fn create_dispute(&self, id: u64, original_vote_tx: Hash256, challenger: Addr, challenge_bond: Amount) -> Result<()> {
        let dispute = DaoDispute {
            id,
            original_vote_tx,
            challenger,
            challenge_bond,
            dao_votes: BTreeMap::new(),
            dao_stakes: BTreeMap::new(),
            resolved: false,
            slash_decision: None,
            resolved_time: None,
        };
        self.kv.put_json(dispute_key(id), &dispute)?;
        Ok(())
    }

    pub fn get_dispute(&self, id: u64) -> Result<DaoDispute> {
        self.kv.get_json(dispute_key(id))?.ok_or(TrustGraphError::DisputeNotFound(id))
    }

    pub fn vote_on_dispute(&self, id: u64, voter: Addr, stake: Amount, slash: bool) -> Result<()> {
        if !self.dao_members.contains(&voter) {
            return Err(TrustGraphError::NotDaoMember(voter));
        }
        let mut dispute = self.get_dispute(id)?;
        if dispute.resolved {
            return Err(TrustGraphError::DisputeAlreadyResolved(id));
        }
        dispute.dao_votes.insert(voter, slash);
        dispute.dao_stakes.insert(voter, stake);
        self.kv.put_json(dispute_key(id), &dispute)?;
        Ok(())
    }

    /// Resolves once `min_dao_votes` are cast; outcome is the sign of
    /// `Σ stake·side` (slash side contributes +stake, keep side -stake). On
    /// a slash outcome, the original bonded vote is slashed using the
    /// dispute id as the slash transaction.
    pub fn resolve_dispute(&self, id: u64, now: Timestamp) -> Result<bool> {
        let mut dispute = self.get_dispute(id)?;
        if dispute.resolved {
            return Err(TrustGraphError::DisputeAlreadyResolved(id));
        }
        if dispute.dao_votes.len() < self.config.min_dao_votes {
            return Err(TrustGraphError::InsufficientBond { have: dispute.dao_votes.len() as Amount, need: self.config.min_dao_votes as Amount });
        }
        let mut signed_sum: i128 = 0;
        for (voter, slash) in &dispute.dao_votes {
            let stake = *dispute.dao_stakes.get(voter).unwrap_or(&0) as i128;
            signed_sum += if *slash { stake } else { -stake };
        }
        let slash_decision = signed_sum > 0;
        dispute.resolved = true;
        dispute.slash_decision = Some(slash_decision);
        dispute.resolved_time = Some(now);
        self.kv.put_json(dispute_key(id), &dispute)?;
        if slash_decision {
            let slash_tx = Hash256::of(format!("dispute-{id}").as_bytes());
            self.slash_vote(&dispute.original_vote_tx, slash_tx)?;
        }
        Ok(slash_decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Addr {
        let mut b = [0u8; 20];
        b[0] = n;
        Addr(b)
    }

    fn graph() -> TrustGraph {
        TrustGraph::new(KvStore::temporary("trust").unwrap(), WotConfig::default(), HashSet::new())
    }

    #[test]
    fn required_bond_matches_scenario_1() {
        let cfg = WotConfig::default();
        // A posts +50 with bond 0.55 CAS == minBond 0.05 + 0.01*50
        assert_eq!(required_bond(&cfg, 50), 55_000_000);
    }

    #[test]
    fn add_edge_writes_forward_and_inverse_bytewise_equal() {
        let g = graph();
        let (a, b) = (addr(1), addr(2));
        g.add_edge(a, b, 80, required_bond(&WotConfig::default(), 80), Hash256::of(b"tx1"), 1000, "ok".into()).unwrap();
        let fwd = g.get_edge(&a, &b).unwrap().unwrap();
        let inv = g.kv.get_json::<TrustEdge>(inverse_edge_key(&b, &a)).unwrap().unwrap();
        assert_eq!(fwd, inv);
    }

    #[test]
    fn rejects_out_of_range_weight() {
        let g = graph();
        let err = g.add_edge(addr(1), addr(2), 200, 1_000_000_000, Hash256::of(b"x"), 1, "".into());
        assert!(matches!(err, Err(TrustGraphError::WeightOutOfRange(200))));
    }

    #[test]
    fn scenario_2_reputation_weighted_trust() {
        let g = graph();
        let cfg = WotConfig::default();
        let (a, b, c, d) = (addr(1), addr(2), addr(3), addr(4));
        g.add_edge(a, b, 80, required_bond(&cfg, 80), Hash256::of(b"ab"), 1, "".into()).unwrap();
        g.add_edge(a, c, 80, required_bond(&cfg, 80), Hash256::of(b"ac"), 1, "".into()).unwrap();
        g.add_edge(b, d, 50, required_bond(&cfg, 50), Hash256::of(b"bd"), 1, "".into()).unwrap();
        g.add_edge(c, d, 50, required_bond(&cfg, 50), Hash256::of(b"cd"), 1, "".into()).unwrap();
        g.record_bonded_vote(addr(9), d, 70, required_bond(&cfg, 70), Hash256::of(b"voteX")).unwrap();
        g.record_bonded_vote(addr(10), d, -30, required_bond(&cfg, 30), Hash256::of(b"voteY")).unwrap();

        let paths = g.find_trust_paths(a, d, 3);
        assert_eq!(paths.len(), 2);
        for p in &paths {
            assert!((p.total_weight - 0.40).abs() < 1e-9);
        }

        let rep = g.weighted_reputation(a, d, 3);
        assert!((rep - 20.0).abs() < 1e-6, "expected 20.0 got {rep}");
    }

    #[test]
    fn scenario_1_bonded_vote_and_slash() {
        let g = graph();
        let cfg = WotConfig::default();
        let mut members = HashSet::new();
        for i in 20..25 {
            members.insert(addr(i));
        }
        let g = TrustGraph::new(g.kv, cfg, members);
        let target = addr(2);
        let vote_tx = Hash256::of(b"vote-ab");
        g.record_bonded_vote(addr(1), target, 50, required_bond(&cfg, 50), vote_tx).unwrap();

        g.create_dispute(1, vote_tx, addr(99), 10_000_000).unwrap();
        for i in 20..23 {
            g.vote_on_dispute(1, addr(i), 100_000_000, true).unwrap();
        }
        for i in 23..25 {
            g.vote_on_dispute(1, addr(i), 100_000_000, false).unwrap();
        }
        let slashed = g.resolve_dispute(1, 2000).unwrap();
        assert!(slashed);
        let vote = g.get_vote(&vote_tx).unwrap().unwrap();
        assert!(vote.slashed);
        assert!(g.get_votes_for_address(&target).iter().all(|v| v.slashed));
    }

    #[test]
    fn slash_vote_is_idempotent() {
        let g = graph();
        let vote_tx = Hash256::of(b"v");
        g.record_bonded_vote(addr(1), addr(2), 10, required_bond(&WotConfig::default(), 10), vote_tx).unwrap();
        g.slash_vote(&vote_tx, Hash256::of(b"s1")).unwrap();
        g.slash_vote(&vote_tx, Hash256::of(b"s2")).unwrap();
        let v = g.get_vote(&vote_tx).unwrap().unwrap();
        assert!(v.slashed);
    }
}
