//! Component-decomposed reputation scores, the HAT (Holistic Address Trust)
//! validator-consensus loop over self-reported scores, and the reward split
//! applied when a DAO dispute resolves in slash (spec.md §4.4).

use std::collections::{BTreeMap, HashMap, HashSet};

use crypto_primitives::{Addr, Amount, Hash256, Timestamp};
use cvm_kvstore::{Batch, KvStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trust_graph::DaoDispute;

#[derive(Error, Debug)]
pub enum ReputationError {
    #[error("HAT session {0} not found")]
    SessionNotFound(u64),
    #[error("HAT session {0} already decided")]
    AlreadyDecided(u64),
    #[error("validator {0} is not part of session {1}")]
    NotAValidator(Addr, u64),
    #[error("validator {0} already responded in session {1}")]
    DuplicateResponse(Addr, u64),
    #[error("dispute {0} is not resolved yet")]
    DisputeUnresolved(u64),
    #[error("storage error: {0}")]
    Storage(#[from] cvm_kvstore::KvError),
}

pub type Result<T> = std::result::Result<T, ReputationError>;

/// Component decomposition of an address's reputation, plus the aggregate
/// that is actually consulted by fee/access-control checks.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub behavior: i16,
    pub wot: i16,
    pub economic: i16,
    pub temporal: i16,
    pub aggregate: i16,
}

impl ScoreComponents {
    /// Unweighted mean of the four components, clamped to [0,100]. Callers
    /// that want a different weighting compute `aggregate` themselves before
    /// calling `ReputationStore::update`.
    pub fn recompute_aggregate(mut self) -> Self {
        let sum = self.behavior as i32 + self.wot as i32 + self.economic as i32 + self.temporal as i32;
        self.aggregate = (sum / 4).clamp(0, 100) as i16;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationAuditEvent {
    pub id: u64,
    pub addr: Addr,
    pub old: ScoreComponents,
    pub new: ScoreComponents,
    pub delta: i32,
    pub reason: String,
    pub trigger_tx: Option<Hash256>,
    pub ts: Timestamp,
}

fn score_key(addr: &Addr) -> Vec<u8> {
    format!("score_{}", addr.to_hex()).into_bytes()
}

fn audit_key(id: u64) -> Vec<u8> {
    format!("rep_audit_{id:020}").into_bytes()
}

/// Durable store of component-decomposed scores with an append-only audit
/// trail of every update (spec.md §4.4 "any update writes both...").
pub struct ReputationStore {
    kv: KvStore,
}

impl ReputationStore {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    pub fn get(&self, addr: &Addr) -> Result<ScoreComponents> {
        Ok(self.kv.get_json(score_key(addr))?.unwrap_or_default())
    }

    /// Writes the new component set and the aggregate together, and emits an
    /// audit event carrying `(old, new, delta, reason, triggerTxHash)`.
    pub fn update(
        &self,
        addr: Addr,
        new: ScoreComponents,
        reason: impl Into<String>,
        trigger_tx: Option<Hash256>,
        now: Timestamp,
    ) -> Result<ReputationAuditEvent> {
        let old = self.get(&addr)?;
        let delta = new.aggregate as i32 - old.aggregate as i32;
        let id = self.kv.next_id(b"__rep_audit_ctr")?;
        let event = ReputationAuditEvent { id, addr, old, new, delta, reason: reason.into(), trigger_tx, ts: now };
        let mut batch = Batch::new();
        batch.put_json(score_key(&addr), &new)?;
        batch.put_json(audit_key(id), &event)?;
        self.kv.commit(batch)?;
        Ok(event)
    }

    pub fn audit_trail(&self) -> Vec<ReputationAuditEvent> {
        self.kv.scan_prefix_json::<ReputationAuditEvent>(b"rep_audit_").map(|(_, e)| e).collect()
    }
}

/// One validator's verdict on a self-reported score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    Accept,
    Reject,
    Abstain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResponse {
    pub validator: Addr,
    pub vote: Vote,
    pub confidence: f64,
    pub has_wot: bool,
    pub calculated_score: i16,
    pub reported_score: i16,
    pub response_time: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HatDecision {
    Accept,
    Reject,
    TimeoutReject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HatStatus {
    Open,
    Decided(HatDecision),
    Disputed,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HatSession {
    pub id: u64,
    pub addr: Addr,
    pub reported_score: i16,
    pub trigger_tx: Hash256,
    /// validator -> weight (hatScore · √stake), fixed at Open time.
    pub validator_weights: BTreeMap<Addr, f64>,
    pub responses: BTreeMap<Addr, ValidationResponse>,
    pub missed_responses: HashSet<Addr>,
    pub deadline: Timestamp,
    pub status: HatStatus,
}

impl HatSession {
    fn total_weight(&self) -> f64 {
        self.validator_weights.values().sum()
    }

    fn weighted(&self, vote: Vote) -> f64 {
        self.responses
            .values()
            .filter(|r| r.vote == vote)
            .map(|r| self.validator_weights.get(&r.validator).copied().unwrap_or(0.0))
            .sum()
    }
}

fn session_key(id: u64) -> Vec<u8> {
    format!("hat_session_{id:020}").into_bytes()
}

/// Validator weight = hatScore · √stake (spec.md §4.4).
pub fn validator_weight(hat_score: i16, stake: Amount) -> f64 {
    hat_score as f64 * (stake.max(0) as f64).sqrt()
}

pub struct HatConsensus {
    kv: KvStore,
}

impl HatConsensus {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    /// Open a session: `validators` carries each selected validator's weight,
    /// already computed from the current HAT score and stake.
    pub fn open(
        &self,
        id: u64,
        addr: Addr,
        reported_score: i16,
        trigger_tx: Hash256,
        validators: HashMap<Addr, f64>,
        deadline: Timestamp,
    ) -> Result<HatSession> {
        let session = HatSession {
            id,
            addr,
            reported_score,
            trigger_tx,
            validator_weights: validators.into_iter().collect(),
            responses: BTreeMap::new(),
            missed_responses: HashSet::new(),
            deadline,
            status: HatStatus::Open,
        };
        self.kv.put_json(session_key(id), &session)?;
        Ok(session)
    }

    pub fn get(&self, id: u64) -> Result<HatSession> {
        self.kv.get_json(session_key(id))?.ok_or(ReputationError::SessionNotFound(id))
    }

    fn save(&self, session: &HatSession) -> Result<()> {
        self.kv.put_json(session_key(session.id), session)?;
        Ok(())
    }

    /// Records one validator's response and re-evaluates the decision
    /// threshold: first of ≥2/3 weighted ACCEPT, >1/3 weighted REJECT, or
    /// deadline reached.
    pub fn submit_response(&self, id: u64, response: ValidationResponse, now: Timestamp) -> Result<HatSession> {
        let mut session = self.get(id)?;
        if session.status != HatStatus::Open {
            return Err(ReputationError::AlreadyDecided(id));
        }
        if !session.validator_weights.contains_key(&response.validator) {
            return Err(ReputationError::NotAValidator(response.validator, id));
        }
        if session.responses.contains_key(&response.validator) {
            return Err(ReputationError::DuplicateResponse(response.validator, id));
        }
        session.responses.insert(response.validator, response);

        let total = session.total_weight();
        if total > 0.0 {
            let accept = session.weighted(Vote::Accept);
            let reject = session.weighted(Vote::Reject);
            if accept >= (2.0 / 3.0) * total {
                session.status = HatStatus::Decided(HatDecision::Accept);
            } else if reject > total / 3.0 {
                session.status = HatStatus::Decided(HatDecision::Reject);
            }
        }
        if session.status == HatStatus::Open && now >= session.deadline {
            self.apply_timeout(&mut session);
        }
        self.save(&session)?;
        Ok(session)
    }

    /// Drives an overdue Open session to `Decided(TimeoutReject)`, crediting
    /// every non-responding validator with a missed response.
    pub fn check_timeout(&self, id: u64, now: Timestamp) -> Result<HatSession> {
        let mut session = self.get(id)?;
        if session.status == HatStatus::Open && now >= session.deadline {
            self.apply_timeout(&mut session);
            self.save(&session)?;
        }
        Ok(session)
    }

    fn apply_timeout(&self, session: &mut HatSession) {
        for validator in session.validator_weights.keys() {
            if !session.responses.contains_key(validator) {
                session.missed_responses.insert(*validator);
            }
        }
        session.status = HatStatus::Decided(HatDecision::TimeoutReject);
    }

    pub fn open_dispute(&self, id: u64) -> Result<HatSession> {
        let mut session = self.get(id)?;
        session.status = HatStatus::Disputed;
        self.save(&session)?;
        Ok(session)
    }

    pub fn resolve(&self, id: u64) -> Result<HatSession> {
        let mut session = self.get(id)?;
        session.status = HatStatus::Resolved;
        self.save(&session)?;
        Ok(session)
    }
}

/// Fraud tolerance: a Decided(reject) whose `calculatedScore` and
/// `reportedScore` differ by more than this many points is fraud, not honest
/// disagreement.
pub const FRAUD_SCORE_TOLERANCE: i16 = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudRecord {
    pub addr: Addr,
    pub session_id: u64,
    pub reported_score: i16,
    pub calculated_score: i16,
    pub ts: Timestamp,
}

/// Inspects a Decided(reject) session and returns a `FraudRecord` when the
/// reporter's self-reported score diverges from the validator consensus
/// beyond tolerance. Callers feed the record into `behavior-metrics`'s
/// `add_fraud_record`.
pub fn detect_fraud(session: &HatSession, now: Timestamp) -> Option<FraudRecord> {
    if !matches!(session.status, HatStatus::Decided(HatDecision::Reject) | HatStatus::Decided(HatDecision::TimeoutReject)) {
        return None;
    }
    let calculated: Vec<i16> = session.responses.values().map(|r| r.calculated_score).collect();
    if calculated.is_empty() {
        return None;
    }
    let mean = calculated.iter().map(|v| *v as f64).sum::<f64>() / calculated.len() as f64;
    if (session.reported_score as f64 - mean).abs() > FRAUD_SCORE_TOLERANCE as f64 {
        Some(FraudRecord {
            addr: session.addr,
            session_id: session.id,
            reported_score: session.reported_score,
            calculated_score: mean.round() as i16,
            ts: now,
        })
    } else {
        None
    }
}

/// Percentage configuration for splitting a slashed bond (spec.md §4.4
/// "configured bounty %" / "configured pool"), grounded on
/// `reward_distributor.cpp`'s `WoTConfig` percent fields.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RewardConfig {
    pub challenger_reward_percent: i64,
    pub dao_voter_reward_percent: i64,
    pub burn_percent: i64,
    pub wrongly_accused_reward_percent: i64,
    pub failed_challenge_burn_percent: i64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            challenger_reward_percent: 20,
            dao_voter_reward_percent: 30,
            burn_percent: 50,
            wrongly_accused_reward_percent: 50,
            failed_challenge_burn_percent: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewardDistribution {
    pub dispute_id: u64,
    pub slash_decision: bool,
    pub total_slashed_bond: Amount,
    pub challenger_bond_return: Amount,
    pub challenger_bounty: Amount,
    pub total_dao_voter_rewards: Amount,
    pub burned_amount: Amount,
    pub voter_rewards: BTreeMap<Addr, Amount>,
}

/// Splits a slashed vote's bond among the challenger, the winning-side DAO
/// voters, and the burn sink, using 128-bit intermediates throughout
/// (spec.md §4.4, grounded on `reward_distributor.cpp::DistributeSlashRewards`).
pub struct RewardDistributor {
    config: RewardConfig,
}

impl RewardDistributor {
    pub fn new(config: RewardConfig) -> Self {
        Self { config }
    }

    fn stake_on_side(dispute: &DaoDispute, side: bool) -> Amount {
        dispute
            .dao_votes
            .iter()
            .filter(|(_, v)| **v == side)
            .filter_map(|(voter, _)| dispute.dao_stakes.get(voter))
            .sum()
    }

    fn voter_rewards(dispute: &DaoDispute, pool: Amount, winning_side: bool) -> (BTreeMap<Addr, Amount>, Amount) {
        if pool <= 0 {
            return (BTreeMap::new(), 0);
        }
        let total_winning_stake = Self::stake_on_side(dispute, winning_side);
        if total_winning_stake <= 0 {
            return (BTreeMap::new(), pool);
        }
        let mut rewards = BTreeMap::new();
        let mut distributed: i128 = 0;
        for (voter, vote) in &dispute.dao_votes {
            if *vote != winning_side {
                continue;
            }
            let stake = *dispute.dao_stakes.get(voter).unwrap_or(&0);
            if stake <= 0 {
                continue;
            }
            let numerator = stake as i128 * pool as i128;
            let reward = (numerator / total_winning_stake as i128) as Amount;
            if reward > 0 {
                rewards.insert(*voter, reward);
                distributed += reward as i128;
            }
        }
        let remainder = pool as i128 - distributed;
        (rewards, remainder as Amount)
    }

    /// Slash outcome: challenger gets their own bond back plus a bounty cut
    /// of the slashed bond; winning-side DAO voters split a pool pro rata to
    /// stake; everything left over (including every rounding remainder) is
    /// burned.
    pub fn distribute_slash_rewards(&self, dispute: &DaoDispute, slashed_bond: Amount) -> RewardDistribution {
        let challenger_bond_return = dispute.challenge_bond;
        let mut challenger_bounty = (slashed_bond * self.config.challenger_reward_percent) / 100;
        let voter_pool_base = (slashed_bond * self.config.dao_voter_reward_percent) / 100;
        let burn_base = (slashed_bond * self.config.burn_percent) / 100;
        let rounding_remainder = slashed_bond - (challenger_bounty + voter_pool_base + burn_base);
        let mut burn_amount = burn_base + rounding_remainder;

        let (voter_rewards, voter_remainder) = Self::voter_rewards(dispute, voter_pool_base, true);
        let total_dao_voter_rewards: Amount = voter_rewards.values().sum();
        if voter_rewards.is_empty() {
            challenger_bounty += voter_pool_base;
        } else {
            burn_amount += voter_remainder;
        }

        RewardDistribution {
            dispute_id: dispute.id,
            slash_decision: true,
            total_slashed_bond: slashed_bond,
            challenger_bond_return,
            challenger_bounty,
            total_dao_voter_rewards,
            burned_amount: burn_amount,
            voter_rewards,
        }
    }

    /// Failed-challenge outcome: the challenger's bond is forfeited, split
    /// between the wrongly-accused voter and the burn sink.
    pub fn distribute_failed_challenge_rewards(&self, dispute: &DaoDispute, wrongly_accused: Option<Addr>) -> RewardDistribution {
        let forfeited = dispute.challenge_bond;
        let (compensation, burn) = match wrongly_accused {
            None => (0, forfeited),
            Some(_) => {
                let compensation = (forfeited * self.config.wrongly_accused_reward_percent) / 100;
                let burn_base = (forfeited * self.config.failed_challenge_burn_percent) / 100;
                let remainder = forfeited - (compensation + burn_base);
                (compensation, burn_base + remainder)
            }
        };
        let mut voter_rewards = BTreeMap::new();
        if let Some(voter) = wrongly_accused {
            if compensation > 0 {
                voter_rewards.insert(voter, compensation);
            }
        }
        RewardDistribution {
            dispute_id: dispute.id,
            slash_decision: false,
            total_slashed_bond: forfeited,
            challenger_bond_return: 0,
            challenger_bounty: 0,
            total_dao_voter_rewards: compensation,
            burned_amount: burn,
            voter_rewards,
        }
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

    #[test]
    fn audit_trail_records_delta() {
        let store = ReputationStore::new(KvStore::temporary("rs1").unwrap());
        let a = addr(1);
        let new = ScoreComponents { behavior: 80, wot: 60, economic: 50, temporal: 40, aggregate: 0 }.recompute_aggregate();
        let event = store.update(a, new, "initial score", None, 1000).unwrap();
        assert_eq!(event.delta, new.aggregate as i32);
        assert_eq!(store.audit_trail().len(), 1);
    }

    #[test]
    fn hat_session_decides_on_two_thirds_accept() {
        let consensus = HatConsensus::new(KvStore::temporary("hat1").unwrap());
        let (v1, v2, v3) = (addr(1), addr(2), addr(3));
        let mut weights = HashMap::new();
        weights.insert(v1, 100.0);
        weights.insert(v2, 100.0);
        weights.insert(v3, 100.0);
        consensus.open(1, addr(9), 70, Hash256::of(b"tx"), weights, 10_000).unwrap();

        let resp = |validator, vote| ValidationResponse {
            validator,
            vote,
            confidence: 0.9,
            has_wot: true,
            calculated_score: 70,
            reported_score: 70,
            response_time: 1,
        };
        consensus.submit_response(1, resp(v1, Vote::Accept), 100).unwrap();
        let session = consensus.submit_response(1, resp(v2, Vote::Accept), 100).unwrap();
        // 200/300 == 2/3 exactly -> decided accept
        assert_eq!(session.status, HatStatus::Decided(HatDecision::Accept));
    }

    #[test]
    fn hat_session_decides_on_reject_over_one_third() {
        let consensus = HatConsensus::new(KvStore::temporary("hat2").unwrap());
        let (v1, v2, v3) = (addr(1), addr(2), addr(3));
        let mut weights = HashMap::new();
        weights.insert(v1, 40.0);
        weights.insert(v2, 30.0);
        weights.insert(v3, 30.0);
        consensus.open(1, addr(9), 70, Hash256::of(b"tx"), weights, 10_000).unwrap();
        let resp = |validator| ValidationResponse {
            validator,
            vote: Vote::Reject,
            confidence: 0.9,
            has_wot: false,
            calculated_score: 20,
            reported_score: 70,
            response_time: 1,
        };
        let session = consensus.submit_response(1, resp(v1), 100).unwrap();
        assert_eq!(session.status, HatStatus::Decided(HatDecision::Reject));

        let fraud = detect_fraud(&session, 200);
        assert!(fraud.is_some());
    }

    #[test]
    fn timeout_credits_missed_responses() {
        let consensus = HatConsensus::new(KvStore::temporary("hat3").unwrap());
        let v1 = addr(1);
        let mut weights = HashMap::new();
        weights.insert(v1, 100.0);
        consensus.open(1, addr(9), 70, Hash256::of(b"tx"), weights, 500).unwrap();
        let session = consensus.check_timeout(1, 1000).unwrap();
        assert_eq!(session.status, HatStatus::Decided(HatDecision::TimeoutReject));
        assert!(session.missed_responses.contains(&v1));
    }

    fn dispute(challenger_bond: Amount, votes: &[(Addr, Amount, bool)]) -> DaoDispute {
        let mut dao_votes = BTreeMap::new();
        let mut dao_stakes = BTreeMap::new();
        for (voter, stake, slash) in votes {
            dao_votes.insert(*voter, *slash);
            dao_stakes.insert(*voter, *stake);
        }
        DaoDispute {
            id: 1,
            original_vote_tx: Hash256::of(b"v"),
            challenger: addr(99),
            challenge_bond: challenger_bond,
            dao_votes,
            dao_stakes,
            resolved: true,
            slash_decision: Some(true),
            resolved_time: Some(2000),
        }
    }

    #[test]
    fn slash_rewards_sum_exactly_to_slashed_bond_plus_return() {
        let distributor = RewardDistributor::new(RewardConfig::default());
        let d = dispute(10_000_000, &[(addr(1), 100_000_000, true), (addr(2), 100_000_000, true), (addr(3), 100_000_000, false)]);
        let dist = distributor.distribute_slash_rewards(&d, 55_000_000);
        let total = dist.challenger_bounty + dist.total_dao_voter_rewards + dist.burned_amount;
        assert_eq!(total, 55_000_000);
        assert_eq!(dist.challenger_bond_return, 10_000_000);
    }

    #[test]
    fn slash_rewards_give_voter_pool_to_challenger_when_no_winning_voters() {
        let distributor = RewardDistributor::new(RewardConfig::default());
        let d = dispute(10_000_000, &[(addr(1), 100_000_000, false)]);
        let dist = distributor.distribute_slash_rewards(&d, 55_000_000);
        assert_eq!(dist.total_dao_voter_rewards, 0);
        assert_eq!(dist.challenger_bounty + dist.burned_amount, 55_000_000);
    }

    #[test]
    fn failed_challenge_forfeits_bond() {
        let distributor = RewardDistributor::new(RewardConfig::default());
        let d = dispute(10_000_000, &[]);
        let dist = distributor.distribute_failed_challenge_rewards(&d, Some(addr(5)));
        assert_eq!(dist.total_dao_voter_rewards + dist.burned_amount, 10_000_000);
    }
}
