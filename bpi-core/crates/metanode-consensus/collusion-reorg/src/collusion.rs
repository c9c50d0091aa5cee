//! Sequencer collusion detection (spec.md §4.15, "Detector").
//!
//! Grounded on `examples/original_source/src/l2/collusion_detector.h`:
//! bounded per-sequencer action timelines, bounded per-block voting
//! records, pairwise timing/voting correlation, wallet-cluster and
//! stake-concentration indicators, severity scaling with indicator
//! count, and a bonded whistleblower report flow.

use std::collections::{HashMap, VecDeque};

use crypto_primitives::{Addr, Amount, Hash256};
use sequencer_consensus::VoteType;
use thiserror::Error;

pub const MAX_ACTIONS_PER_SEQUENCER: usize = 1000;
pub const MAX_VOTING_RECORDS: usize = 10_000;
pub const MIN_SAMPLES_FOR_CORRELATION: usize = 10;
pub const DEFAULT_TIMING_THRESHOLD: f64 = 0.8;
pub const DEFAULT_VOTING_THRESHOLD: f64 = 0.9;
pub const DEFAULT_STAKE_CONCENTRATION_LIMIT: f64 = 0.2;
pub const WHISTLEBLOWER_BOND: Amount = 10 * 100_000_000;
pub const WHISTLEBLOWER_REWARD_PERCENT: f64 = 0.1;

/// Actions within this many milliseconds of each other count as a
/// correlated timing sample.
const TIMING_CORRELATION_WINDOW_MS: i64 = 2_000;

pub type Result<T> = std::result::Result<T, CollusionError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CollusionError {
    #[error("whistleblower bond below required minimum")]
    InsufficientBond,
    #[error("report already submitted")]
    DuplicateReport,
    #[error("report not found")]
    ReportNotFound,
    #[error("report already validated")]
    AlreadyValidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollusionType {
    TimingCorrelation,
    VotingPattern,
    WalletCluster,
    StakeConcentration,
    Combined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CollusionSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone)]
pub struct SequencerAction {
    pub sequencer: Addr,
    pub timestamp: i64,
    pub block_hash: Hash256,
    pub vote_type: VoteType,
    pub is_block_proposal: bool,
    pub slot_number: u64,
}

#[derive(Debug, Clone)]
pub struct TimingCorrelationStats {
    pub sequencer1: Addr,
    pub sequencer2: Addr,
    pub sample_count: u32,
    pub correlation_score: f64,
}

#[derive(Debug, Clone)]
pub struct VotingPatternStats {
    pub sequencer1: Addr,
    pub sequencer2: Addr,
    pub total_votes_counted: u32,
    pub matching_votes: u32,
    pub opposing_votes: u32,
    pub correlation_score: f64,
}

#[derive(Debug, Clone)]
pub struct CollusionDetectionResult {
    pub collusion_type: CollusionType,
    pub severity: CollusionSeverity,
    pub involved_sequencers: Vec<Addr>,
    pub confidence_score: f64,
    pub detection_timestamp: i64,
    pub timing_correlation: f64,
    pub voting_correlation: f64,
    pub same_wallet_cluster: bool,
    pub stake_concentration: f64,
}

#[derive(Debug, Clone)]
pub struct WhistleblowerReport {
    pub reporter: Addr,
    pub accused_sequencers: Vec<Addr>,
    pub accused_type: CollusionType,
    pub evidence_hash: Hash256,
    pub report_timestamp: i64,
    pub bond_amount: Amount,
    pub is_validated: bool,
    pub is_rewarded: bool,
}

fn ordered_pair(a: Addr, b: Addr) -> (Addr, Addr) {
    if a.0 <= b.0 {
        (a, b)
    } else {
        (b, a)
    }
}

pub struct CollusionDetector {
    chain_id: u64,
    actions: HashMap<Addr, VecDeque<SequencerAction>>,
    voting_records: HashMap<Hash256, HashMap<Addr, VoteType>>,
    voting_record_count: usize,
    wallet_clusters: HashMap<Addr, Addr>,
    stakes: HashMap<Addr, Amount>,
    reports: HashMap<Hash256, WhistleblowerReport>,
    timing_threshold: f64,
    voting_threshold: f64,
    stake_concentration_limit: f64,
}

impl CollusionDetector {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            actions: HashMap::new(),
            voting_records: HashMap::new(),
            voting_record_count: 0,
            wallet_clusters: HashMap::new(),
            stakes: HashMap::new(),
            reports: HashMap::new(),
            timing_threshold: DEFAULT_TIMING_THRESHOLD,
            voting_threshold: DEFAULT_VOTING_THRESHOLD,
            stake_concentration_limit: DEFAULT_STAKE_CONCENTRATION_LIMIT,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn set_timing_threshold(&mut self, threshold: f64) {
        self.timing_threshold = threshold;
    }

    pub fn set_voting_threshold(&mut self, threshold: f64) {
        self.voting_threshold = threshold;
    }

    pub fn set_stake_concentration_limit(&mut self, limit: f64) {
        self.stake_concentration_limit = limit;
    }

    pub fn record_action(&mut self, action: SequencerAction) {
        let timeline = self.actions.entry(action.sequencer).or_default();
        timeline.push_back(action);
        while timeline.len() > MAX_ACTIONS_PER_SEQUENCER {
            timeline.pop_front();
        }
    }

    pub fn record_vote(&mut self, block_hash: Hash256, voter: Addr, vote: VoteType) {
        let is_new_block = !self.voting_records.contains_key(&block_hash);
        let votes = self.voting_records.entry(block_hash).or_default();
        let is_new_vote = votes.insert(voter, vote).is_none();
        if is_new_block || is_new_vote {
            self.voting_record_count += 1;
        }
        if self.voting_record_count > MAX_VOTING_RECORDS {
            if let Some(&oldest) = self.voting_records.keys().next() {
                if let Some(removed) = self.voting_records.remove(&oldest) {
                    self.voting_record_count = self.voting_record_count.saturating_sub(removed.len());
                }
            }
        }
    }

    pub fn set_sequencer_stake(&mut self, addr: Addr, stake: Amount) {
        self.stakes.insert(addr, stake);
    }

    pub fn set_wallet_cluster(&mut self, addr: Addr, cluster_id: Addr) {
        self.wallet_clusters.insert(addr, cluster_id);
    }

    pub fn analyze_timing_correlation(&self, seq1: Addr, seq2: Addr) -> TimingCorrelationStats {
        let empty = VecDeque::new();
        let a1 = self.actions.get(&seq1).unwrap_or(&empty);
        let a2 = self.actions.get(&seq2).unwrap_or(&empty);

        let mut matches = 0u32;
        let total = a1.len().max(a2.len());
        for action in a1 {
            let close = a2
                .iter()
                .any(|other| (action.timestamp - other.timestamp).abs() <= TIMING_CORRELATION_WINDOW_MS);
            if close {
                matches += 1;
            }
        }
        let score = if total == 0 { 0.0 } else { matches as f64 / total as f64 };
        TimingCorrelationStats {
            sequencer1: seq1,
            sequencer2: seq2,
            sample_count: total as u32,
            correlation_score: score,
        }
    }

    pub fn analyze_voting_pattern(&self, seq1: Addr, seq2: Addr) -> VotingPatternStats {
        let mut matching = 0u32;
        let mut opposing = 0u32;
        for votes in self.voting_records.values() {
            if let (Some(v1), Some(v2)) = (votes.get(&seq1), votes.get(&seq2)) {
                if v1 == v2 {
                    matching += 1;
                } else {
                    opposing += 1;
                }
            }
        }
        let total = matching + opposing;
        let score = if total == 0 {
            0.0
        } else {
            (matching as i64 - opposing as i64) as f64 / total as f64
        };
        VotingPatternStats {
            sequencer1: seq1,
            sequencer2: seq2,
            total_votes_counted: total,
            matching_votes: matching,
            opposing_votes: opposing,
            correlation_score: score,
        }
    }

    pub fn are_in_same_wallet_cluster(&self, seq1: Addr, seq2: Addr) -> bool {
        match (self.wallet_clusters.get(&seq1), self.wallet_clusters.get(&seq2)) {
            (Some(c1), Some(c2)) => c1 == c2,
            _ => false,
        }
    }

    pub fn wallet_cluster_of(&self, sequencer: Addr) -> Option<Addr> {
        self.wallet_clusters.get(&sequencer).copied()
    }

    pub fn total_sequencer_stake(&self) -> Amount {
        self.stakes.values().sum()
    }

    /// Fraction of total stake held by every address sharing `sequencer`'s
    /// wallet cluster, including addresses with no recorded cluster (which
    /// count only their own stake).
    pub fn calculate_stake_concentration(&self, sequencer: Addr) -> f64 {
        let total = self.total_sequencer_stake();
        if total == 0 {
            return 0.0;
        }
        let cluster_stake: Amount = match self.wallet_clusters.get(&sequencer) {
            Some(cluster) => self
                .wallet_clusters
                .iter()
                .filter(|(_, c)| *c == cluster)
                .map(|(addr, _)| self.stakes.get(addr).copied().unwrap_or(0))
                .sum(),
            None => self.stakes.get(&sequencer).copied().unwrap_or(0),
        };
        cluster_stake as f64 / total as f64
    }

    pub fn exceeds_stake_concentration_limit(&self, sequencer: Addr) -> bool {
        self.calculate_stake_concentration(sequencer) > self.stake_concentration_limit
    }

    pub fn analyze_sequencer_pair(&self, seq1: Addr, seq2: Addr, now: i64) -> CollusionDetectionResult {
        let timing = self.analyze_timing_correlation(seq1, seq2);
        let voting = self.analyze_voting_pattern(seq1, seq2);
        let same_cluster = self.are_in_same_wallet_cluster(seq1, seq2);
        let stake_conc = self
            .calculate_stake_concentration(seq1)
            .max(self.calculate_stake_concentration(seq2));

        let timing_flag = timing.sample_count as usize >= MIN_SAMPLES_FOR_CORRELATION
            && timing.correlation_score >= self.timing_threshold;
        let voting_flag = voting.total_votes_counted as usize >= MIN_SAMPLES_FOR_CORRELATION
            && voting.correlation_score >= self.voting_threshold;
        let stake_flag = stake_conc > self.stake_concentration_limit;

        let indicator_count =
            timing_flag as u8 + voting_flag as u8 + same_cluster as u8 + stake_flag as u8;

        let collusion_type = if indicator_count >= 2 {
            CollusionType::Combined
        } else if timing_flag {
            CollusionType::TimingCorrelation
        } else if voting_flag {
            CollusionType::VotingPattern
        } else if same_cluster {
            CollusionType::WalletCluster
        } else if stake_flag {
            CollusionType::StakeConcentration
        } else {
            CollusionType::TimingCorrelation
        };

        let severity = severity_for_indicator_count(indicator_count);
        let confidence_score = (indicator_count as f64 / 4.0).min(1.0);

        CollusionDetectionResult {
            collusion_type,
            severity,
            involved_sequencers: vec![seq1, seq2],
            confidence_score,
            detection_timestamp: now,
            timing_correlation: timing.correlation_score,
            voting_correlation: voting.correlation_score,
            same_wallet_cluster: same_cluster,
            stake_concentration: stake_conc,
        }
    }

    /// Runs pairwise analysis over every sequencer with a recorded
    /// timeline and returns only pairs with at least one indicator above
    /// threshold.
    pub fn run_full_detection(&self, now: i64) -> Vec<CollusionDetectionResult> {
        let addrs: Vec<Addr> = self.actions.keys().copied().collect();
        let mut out = Vec::new();
        for i in 0..addrs.len() {
            for j in (i + 1)..addrs.len() {
                let result = self.analyze_sequencer_pair(addrs[i], addrs[j], now);
                if result.timing_correlation >= self.timing_threshold
                    || result.voting_correlation >= self.voting_threshold
                    || result.same_wallet_cluster
                    || result.stake_concentration > self.stake_concentration_limit
                {
                    out.push(result);
                }
            }
        }
        out
    }

    pub fn get_collusion_risk_score(&self, sequencer: Addr, now: i64) -> f64 {
        let addrs: Vec<Addr> = self.actions.keys().copied().filter(|a| *a != sequencer).collect();
        addrs
            .iter()
            .map(|other| self.analyze_sequencer_pair(sequencer, *other, now).confidence_score)
            .fold(0.0, f64::max)
    }

    pub fn submit_whistleblower_report(
        &mut self,
        reporter: Addr,
        accused_sequencers: Vec<Addr>,
        accused_type: CollusionType,
        evidence_hash: Hash256,
        bond_amount: Amount,
        now: i64,
    ) -> Result<Hash256> {
        if bond_amount < WHISTLEBLOWER_BOND {
            return Err(CollusionError::InsufficientBond);
        }
        let mut buf = Vec::new();
        buf.extend_from_slice(&reporter.0);
        for a in &accused_sequencers {
            buf.extend_from_slice(&a.0);
        }
        buf.extend_from_slice(&evidence_hash.0);
        let report_id = Hash256::of(&buf);
        if self.reports.contains_key(&report_id) {
            return Err(CollusionError::DuplicateReport);
        }
        self.reports.insert(
            report_id,
            WhistleblowerReport {
                reporter,
                accused_sequencers,
                accused_type,
                evidence_hash,
                report_timestamp: now,
                bond_amount,
                is_validated: false,
                is_rewarded: false,
            },
        );
        Ok(report_id)
    }

    pub fn validate_whistleblower_report(&mut self, report_id: Hash256) -> Result<()> {
        let report = self.reports.get_mut(&report_id).ok_or(CollusionError::ReportNotFound)?;
        if report.is_validated {
            return Err(CollusionError::AlreadyValidated);
        }
        report.is_validated = true;
        Ok(())
    }

    pub fn pending_reports(&self) -> Vec<&WhistleblowerReport> {
        self.reports.values().filter(|r| !r.is_validated).collect()
    }

    /// Pays out `WHISTLEBLOWER_REWARD_PERCENT` of `slashed_amount` to a
    /// validated, not-yet-rewarded report.
    pub fn process_whistleblower_reward(&mut self, report_id: Hash256, slashed_amount: Amount) -> Result<Amount> {
        let report = self.reports.get_mut(&report_id).ok_or(CollusionError::ReportNotFound)?;
        if !report.is_validated || report.is_rewarded {
            return Err(CollusionError::ReportNotFound);
        }
        report.is_rewarded = true;
        Ok((slashed_amount as f64 * WHISTLEBLOWER_REWARD_PERCENT) as Amount)
    }
}

fn severity_for_indicator_count(count: u8) -> CollusionSeverity {
    match count {
        0 | 1 => CollusionSeverity::Low,
        2 => CollusionSeverity::Medium,
        3 => CollusionSeverity::High,
        _ => CollusionSeverity::Critical,
    }
}

/// Base slashing amount (in the smallest unit) scaled by severity; the
/// type only affects which base tier applies.
pub fn slashing_amount(collusion_type: CollusionType, severity: CollusionSeverity) -> Amount {
    let base: Amount = match collusion_type {
        CollusionType::TimingCorrelation => 5_000_000,
        CollusionType::VotingPattern => 5_000_000,
        CollusionType::WalletCluster => 10_000_000,
        CollusionType::StakeConcentration => 10_000_000,
        CollusionType::Combined => 20_000_000,
    };
    let multiplier = match severity {
        CollusionSeverity::Low => 1,
        CollusionSeverity::Medium => 2,
        CollusionSeverity::High => 4,
        CollusionSeverity::Critical => 8,
    };
    base * multiplier
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
    fn timing_correlation_detects_synchronized_actions() {
        let mut det = CollusionDetector::new(1);
        for i in 0..20i64 {
            det.record_action(SequencerAction {
                sequencer: addr(1),
                timestamp: i * 10_000,
                block_hash: Hash256::zero(),
                vote_type: VoteType::Accept,
                is_block_proposal: false,
                slot_number: i as u64,
            });
            det.record_action(SequencerAction {
                sequencer: addr(2),
                timestamp: i * 10_000 + 500,
                block_hash: Hash256::zero(),
                vote_type: VoteType::Accept,
                is_block_proposal: false,
                slot_number: i as u64,
            });
        }
        let stats = det.analyze_timing_correlation(addr(1), addr(2));
        assert!(stats.correlation_score >= DEFAULT_TIMING_THRESHOLD);
    }

    #[test]
    fn voting_pattern_matches_formula() {
        let mut det = CollusionDetector::new(1);
        for i in 0..12u8 {
            let block = Hash256::of(&[i]);
            det.record_vote(block, addr(1), VoteType::Accept);
            det.record_vote(block, addr(2), VoteType::Accept);
        }
        let stats = det.analyze_voting_pattern(addr(1), addr(2));
        assert_eq!(stats.matching_votes, 12);
        assert_eq!(stats.opposing_votes, 0);
        assert!((stats.correlation_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn stake_concentration_counts_whole_cluster() {
        let mut det = CollusionDetector::new(1);
        det.set_sequencer_stake(addr(1), 30);
        det.set_sequencer_stake(addr(2), 30);
        det.set_sequencer_stake(addr(3), 40);
        det.set_wallet_cluster(addr(1), addr(1));
        det.set_wallet_cluster(addr(2), addr(1));
        assert!((det.calculate_stake_concentration(addr(1)) - 0.6).abs() < 1e-9);
        assert!(det.exceeds_stake_concentration_limit(addr(1)));
        assert!(!det.exceeds_stake_concentration_limit(addr(3)));
    }

    #[test]
    fn combined_indicators_escalate_severity() {
        assert_eq!(severity_for_indicator_count(1), CollusionSeverity::Low);
        assert_eq!(severity_for_indicator_count(2), CollusionSeverity::Medium);
        assert_eq!(severity_for_indicator_count(3), CollusionSeverity::High);
        assert_eq!(severity_for_indicator_count(4), CollusionSeverity::Critical);
    }

    #[test]
    fn whistleblower_report_requires_bond() {
        let mut det = CollusionDetector::new(1);
        let err = det
            .submit_whistleblower_report(
                addr(9),
                vec![addr(1), addr(2)],
                CollusionType::VotingPattern,
                Hash256::zero(),
                1,
                0,
            )
            .unwrap_err();
        assert_eq!(err, CollusionError::InsufficientBond);
    }

    #[test]
    fn whistleblower_reward_pays_ten_percent() {
        let mut det = CollusionDetector::new(1);
        let id = det
            .submit_whistleblower_report(
                addr(9),
                vec![addr(1), addr(2)],
                CollusionType::VotingPattern,
                Hash256::zero(),
                WHISTLEBLOWER_BOND,
                0,
            )
            .unwrap();
        det.validate_whistleblower_report(id).unwrap();
        let reward = det.process_whistleblower_reward(id, 1_000_000_000).unwrap();
        assert_eq!(reward, 100_000_000);
    }
}
