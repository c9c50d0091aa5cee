//! L2 sequencer block-proposal voting and finalization (spec.md §4.13).
//!
//! Grounded on `examples/original_source/src/l2/sequencer_consensus.cpp`:
//! a single in-flight proposal per slot, one vote per voter, weighted by
//! `SequencerInfo::weight()`, finalized once accept weight crosses a
//! configurable threshold of total eligible weight (defaulting to 2/3,
//! but always validated above 1/2 per spec.md §4.13). A vote-collection
//! timeout does not finalize or fail the round itself; it only reports
//! `ConsensusState::Failed` so the caller can drive
//! `bpi-leader-selection`'s failover without this crate reaching across
//! the lock boundary.

pub mod block;

use std::collections::{BTreeMap, HashMap};

use crypto_primitives::{Addr, Ed25519PublicKey, Hash256};
use ed25519_dalek::{Signature, Verifier};
use sequencer_discovery::SequencerInfo;
use thiserror::Error;

pub use block::{BlockValidationError, L2Block, L2BlockHeader, L2Transaction, L2TxType, SequencerSignature};

/// Default finalization threshold: 2/3 weighted acceptance (spec.md §3/§8).
/// `SequencerConsensus::new` accepts an override, which must stay above the
/// `> 0.5` floor spec.md §4.13 requires.
pub const DEFAULT_FINALIZATION_THRESHOLD_NUM: u64 = 2;
pub const DEFAULT_FINALIZATION_THRESHOLD_DEN: u64 = 3;

/// Bounds memory use for the finalized-block cache; callers persist
/// finalized blocks to the kv-store and prune this map independently.
pub const MAX_FINALIZED_BLOCKS: usize = 4096;

pub type Result<T> = std::result::Result<T, ConsensusError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("proposal is for a chain id this consensus instance does not track")]
    WrongChain,
    #[error("proposer is not the current slot leader")]
    NotLeader,
    #[error("a proposal is already in flight for this slot")]
    ProposalAlreadyInFlight,
    #[error("block header fails structural validation: {0}")]
    InvalidBlock(#[from] BlockValidationError),
    #[error("no proposal is currently awaiting votes")]
    NoActiveProposal,
    #[error("vote references a block hash that is not the active proposal")]
    StaleProposal,
    #[error("voter already cast a vote for this proposal")]
    DuplicateVote,
    #[error("voter is not in the eligible sequencer set")]
    UnknownVoter,
    #[error("vote signature does not verify")]
    BadSignature,
    #[error("finalization threshold {0}/{1} is not greater than 1/2")]
    ThresholdNotAboveHalf(u64, u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteType {
    Accept,
    Reject,
    Abstain,
}

#[derive(Debug, Clone)]
pub struct L2BlockProposal {
    pub block: L2Block,
    pub proposer: Addr,
    pub chain_id: u64,
    pub slot: u64,
    pub signature: [u8; 64],
}

impl L2BlockProposal {
    pub fn signed_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.block.hash().0);
        buf.extend_from_slice(&self.proposer.0);
        buf.extend_from_slice(&self.chain_id.to_be_bytes());
        buf.extend_from_slice(&self.slot.to_be_bytes());
        buf
    }
}

#[derive(Debug, Clone)]
pub struct SequencerVote {
    pub block_hash: Hash256,
    pub voter: Addr,
    pub vote: VoteType,
    pub reject_reason: Option<String>,
    pub slot: u64,
    pub signature: [u8; 64],
}

impl SequencerVote {
    pub fn signed_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.block_hash.0);
        buf.extend_from_slice(&self.voter.0);
        buf.push(vote_tag(self.vote));
        buf.extend_from_slice(&self.slot.to_be_bytes());
        buf
    }
}

fn vote_tag(v: VoteType) -> u8 {
    match v {
        VoteType::Accept => 1,
        VoteType::Reject => 2,
        VoteType::Abstain => 3,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusState {
    CollectingVotes,
    Finalized,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ConsensusResult {
    pub block_hash: Hash256,
    pub accept_weight: u64,
    pub total_weight: u64,
    pub accept_pct: f64,
    pub reject_pct: f64,
    pub state: ConsensusState,
}

struct ActiveRound {
    proposal: L2BlockProposal,
    votes: HashMap<Addr, SequencerVote>,
    deadline_ms: i64,
}

/// Tracks exactly one in-flight proposal at a time; a new `propose` call
/// replaces any round that has already finalized or failed, but refuses
/// to stomp a round still `CollectingVotes` (`ProposalAlreadyInFlight`).
pub struct SequencerConsensus {
    chain_id: u64,
    cas: u64,
    vote_timeout_ms: i64,
    threshold_num: u64,
    threshold_den: u64,
    active: Option<ActiveRound>,
    finalized: BTreeMap<u64, L2Block>,
}

impl SequencerConsensus {
    /// Uses the default 2/3 finalization threshold (spec.md §4.13).
    pub fn new(chain_id: u64, cas: u64, vote_timeout_ms: i64) -> Self {
        Self::with_threshold(
            chain_id,
            cas,
            vote_timeout_ms,
            DEFAULT_FINALIZATION_THRESHOLD_NUM,
            DEFAULT_FINALIZATION_THRESHOLD_DEN,
        )
        .expect("default threshold is always above 1/2")
    }

    /// Configures the finalization threshold as `threshold_num/threshold_den`;
    /// spec.md §4.13 requires this to stay "configurable but must be > 0.5".
    pub fn with_threshold(
        chain_id: u64,
        cas: u64,
        vote_timeout_ms: i64,
        threshold_num: u64,
        threshold_den: u64,
    ) -> Result<Self> {
        if threshold_den == 0 || threshold_num.saturating_mul(2) <= threshold_den {
            return Err(ConsensusError::ThresholdNotAboveHalf(threshold_num, threshold_den));
        }
        Ok(Self {
            chain_id,
            cas,
            vote_timeout_ms,
            threshold_num,
            threshold_den,
            active: None,
            finalized: BTreeMap::new(),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Registers a new block proposal from the expected slot leader.
    /// `parent` is the last finalized block (or a genesis stand-in at
    /// height 0) used to run the structural validation in `L2Block::validate`.
    pub fn propose(
        &mut self,
        proposal: L2BlockProposal,
        expected_leader: Addr,
        parent: &L2Block,
        now_ms: i64,
    ) -> Result<()> {
        if proposal.chain_id != self.chain_id {
            return Err(ConsensusError::WrongChain);
        }
        if proposal.proposer != expected_leader {
            return Err(ConsensusError::NotLeader);
        }
        if let Some(round) = &self.active {
            if round.deadline_ms > now_ms {
                return Err(ConsensusError::ProposalAlreadyInFlight);
            }
        }
        proposal.block.validate(parent, now_ms / 1000)?;
        self.active = Some(ActiveRound {
            proposal,
            votes: HashMap::new(),
            deadline_ms: now_ms + self.vote_timeout_ms,
        });
        Ok(())
    }

    pub fn current_proposal(&self) -> Option<&L2BlockProposal> {
        self.active.as_ref().map(|r| &r.proposal)
    }

    /// Validates and records a vote, returning the updated tally. Weight
    /// for each voter comes from `SequencerInfo::weight(cas)`, so voters
    /// absent from `eligible` contribute nothing and are rejected outright.
    pub fn process_vote(
        &mut self,
        vote: SequencerVote,
        eligible: &[SequencerInfo],
    ) -> Result<ConsensusResult> {
        let cas = self.cas;
        let round = self.active.as_mut().ok_or(ConsensusError::NoActiveProposal)?;
        if vote.block_hash != round.proposal.block.hash() {
            return Err(ConsensusError::StaleProposal);
        }
        if round.votes.contains_key(&vote.voter) {
            return Err(ConsensusError::DuplicateVote);
        }
        let voter_info = eligible
            .iter()
            .find(|s| s.address == vote.voter)
            .ok_or(ConsensusError::UnknownVoter)?;
        let pubkey = Ed25519PublicKey::from_bytes(&voter_info.pubkey).map_err(|_| ConsensusError::BadSignature)?;
        let verifying_key = pubkey.verifying_key().map_err(|_| ConsensusError::BadSignature)?;
        let sig = Signature::from_bytes(&vote.signature);
        verifying_key
            .verify(&vote.signed_payload(), &sig)
            .map_err(|_| ConsensusError::BadSignature)?;

        let block_hash = vote.block_hash;
        round.votes.insert(vote.voter, vote);

        let total_weight: u64 = eligible.iter().map(|s| s.weight(cas)).sum();
        let accept_weight: u64 = round
            .votes
            .values()
            .filter(|v| v.vote == VoteType::Accept)
            .filter_map(|v| eligible.iter().find(|s| s.address == v.voter))
            .map(|s| s.weight(cas))
            .sum();
        let reject_weight: u64 = round
            .votes
            .values()
            .filter(|v| v.vote == VoteType::Reject)
            .filter_map(|v| eligible.iter().find(|s| s.address == v.voter))
            .map(|s| s.weight(cas))
            .sum();

        let accept_pct = if total_weight == 0 {
            0.0
        } else {
            accept_weight as f64 / total_weight as f64
        };
        let reject_pct = if total_weight == 0 {
            0.0
        } else {
            reject_weight as f64 / total_weight as f64
        };

        let finalized = accept_weight.saturating_mul(self.threshold_den)
            >= total_weight.saturating_mul(self.threshold_num);

        let state = if finalized {
            let block = round.proposal.block.clone();
            let height = block.header.number;
            self.finalized.insert(height, block);
            while self.finalized.len() > MAX_FINALIZED_BLOCKS {
                if let Some(&lowest) = self.finalized.keys().next() {
                    self.finalized.remove(&lowest);
                } else {
                    break;
                }
            }
            self.active = None;
            ConsensusState::Finalized
        } else {
            ConsensusState::CollectingVotes
        };

        Ok(ConsensusResult {
            block_hash,
            accept_weight,
            total_weight,
            accept_pct,
            reject_pct,
            state,
        })
    }

    /// Reports whether the active round has exceeded its vote-collection
    /// deadline without finalizing. Does not itself trigger failover;
    /// the caller drives `bpi-leader-selection::LeaderElection::handle_timeout`.
    pub fn check_timeout(&mut self, now_ms: i64) -> ConsensusState {
        match &self.active {
            Some(round) if round.deadline_ms <= now_ms => {
                self.active = None;
                ConsensusState::Failed
            }
            Some(_) => ConsensusState::CollectingVotes,
            None => ConsensusState::Finalized,
        }
    }

    pub fn finalized_block(&self, height: u64) -> Option<&L2Block> {
        self.finalized.get(&height)
    }

    pub fn latest_finalized(&self) -> Option<&L2Block> {
        self.finalized.values().next_back()
    }

    pub fn finalized_count(&self) -> usize {
        self.finalized.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block::{L2BlockHeader, SequencerSignature};
    use ed25519_dalek::{Signer, SigningKey};

    fn addr(n: u8) -> Addr {
        let mut b = [0u8; 20];
        b[0] = n;
        Addr(b)
    }

    fn genesis() -> L2Block {
        L2Block {
            header: L2BlockHeader {
                number: 0,
                parent_hash: Hash256::zero(),
                state_root: Hash256::zero(),
                tx_root: Hash256::zero(),
                sequencer: addr(0),
                timestamp: 0,
                gas_limit: 1_000_000,
                gas_used: 0,
                extra_data: vec![],
                slot: 0,
            },
            transactions: vec![],
            signatures: vec![],
        }
    }

    fn sequencer(n: u8, stake: u64, hat: u32, key: &SigningKey) -> SequencerInfo {
        SequencerInfo {
            address: addr(n),
            pubkey: key.verifying_key().to_bytes(),
            verified_stake: stake,
            verified_hat_score: hat,
            peer_count: 10,
            public_endpoint: String::new(),
            last_announcement: 0,
            last_block_produced: 0,
            blocks_produced: 0,
            blocks_missed: 0,
            is_verified: true,
            is_eligible: true,
            attestation_count: 3,
            l2_chain_id: 1,
        }
    }

    fn proposal_for(parent: &L2Block, proposer: Addr) -> L2BlockProposal {
        let block = L2Block {
            header: L2BlockHeader {
                number: parent.header.number + 1,
                parent_hash: parent.hash(),
                state_root: Hash256::zero(),
                tx_root: Hash256::zero(),
                sequencer: proposer,
                timestamp: parent.header.timestamp + 2,
                gas_limit: parent.header.gas_limit,
                gas_used: 0,
                extra_data: vec![],
                slot: 1,
            },
            transactions: vec![],
            signatures: vec![SequencerSignature {
                signer: proposer,
                signature: [0u8; 64],
            }],
        };
        L2BlockProposal {
            block,
            proposer,
            chain_id: 1,
            slot: 1,
            signature: [0u8; 64],
        }
    }

    fn signed_vote(key: &SigningKey, voter: Addr, block_hash: Hash256, vote: VoteType, slot: u64) -> SequencerVote {
        let mut v = SequencerVote {
            block_hash,
            voter,
            vote,
            reject_reason: None,
            slot,
            signature: [0u8; 64],
        };
        let sig = key.sign(&v.signed_payload());
        v.signature = sig.to_bytes();
        v
    }

    #[test]
    fn proposal_from_wrong_leader_rejected() {
        let parent = genesis();
        let mut consensus = SequencerConsensus::new(1, 1_000_000, 5_000);
        let prop = proposal_for(&parent, addr(2));
        let err = consensus.propose(prop, addr(1), &parent, 10_000).unwrap_err();
        assert_eq!(err, ConsensusError::NotLeader);
    }

    #[test]
    fn finalizes_once_two_thirds_weight_accepts() {
        let parent = genesis();
        let mut consensus = SequencerConsensus::new(1, 1_000_000, 5_000);
        let prop = proposal_for(&parent, addr(1));
        consensus.propose(prop.clone(), addr(1), &parent, 10_000).unwrap();

        let k1 = SigningKey::from_bytes(&[1u8; 32]);
        let k2 = SigningKey::from_bytes(&[2u8; 32]);
        let k3 = SigningKey::from_bytes(&[3u8; 32]);
        let eligible = vec![
            sequencer(1, 1_000_000, 100, &k1),
            sequencer(2, 1_000_000, 100, &k2),
            sequencer(3, 1_000_000, 100, &k3),
        ];

        let block_hash = prop.block.hash();
        let v1 = signed_vote(&k1, addr(1), block_hash, VoteType::Accept, 1);
        let r1 = consensus.process_vote(v1, &eligible).unwrap();
        assert_eq!(r1.state, ConsensusState::CollectingVotes);

        let v2 = signed_vote(&k2, addr(2), block_hash, VoteType::Accept, 1);
        let r2 = consensus.process_vote(v2, &eligible).unwrap();
        assert_eq!(r2.state, ConsensusState::Finalized);
        assert_eq!(consensus.finalized_count(), 1);
        assert!(consensus.current_proposal().is_none());

        let v3 = signed_vote(&k3, addr(3), block_hash, VoteType::Reject, 1);
        assert_eq!(
            consensus.process_vote(v3, &eligible).unwrap_err(),
            ConsensusError::NoActiveProposal
        );
    }

    #[test]
    fn duplicate_vote_rejected() {
        let parent = genesis();
        let mut consensus = SequencerConsensus::new(1, 1_000_000, 5_000);
        let prop = proposal_for(&parent, addr(1));
        consensus.propose(prop.clone(), addr(1), &parent, 10_000).unwrap();

        let k1 = SigningKey::from_bytes(&[1u8; 32]);
        let eligible = vec![sequencer(1, 1_000_000, 100, &k1), sequencer(2, 1_000_000, 100, &SigningKey::from_bytes(&[2u8; 32]))];
        let block_hash = prop.block.hash();
        let v1 = signed_vote(&k1, addr(1), block_hash, VoteType::Accept, 1);
        consensus.process_vote(v1.clone(), &eligible).unwrap();
        assert_eq!(
            consensus.process_vote(v1, &eligible).unwrap_err(),
            ConsensusError::DuplicateVote
        );
    }

    #[test]
    fn tampered_signature_rejected() {
        let parent = genesis();
        let mut consensus = SequencerConsensus::new(1, 1_000_000, 5_000);
        let prop = proposal_for(&parent, addr(1));
        consensus.propose(prop.clone(), addr(1), &parent, 10_000).unwrap();

        let k1 = SigningKey::from_bytes(&[1u8; 32]);
        let eligible = vec![sequencer(1, 1_000_000, 100, &k1)];
        let block_hash = prop.block.hash();
        let mut v1 = signed_vote(&k1, addr(1), block_hash, VoteType::Accept, 1);
        v1.vote = VoteType::Reject;
        assert_eq!(
            consensus.process_vote(v1, &eligible).unwrap_err(),
            ConsensusError::BadSignature
        );
    }

    #[test]
    fn timeout_without_finalization_fails_round() {
        let parent = genesis();
        let mut consensus = SequencerConsensus::new(1, 1_000_000, 5_000);
        let prop = proposal_for(&parent, addr(1));
        consensus.propose(prop, addr(1), &parent, 10_000).unwrap();
        assert_eq!(consensus.check_timeout(14_999), ConsensusState::CollectingVotes);
        assert_eq!(consensus.check_timeout(15_000), ConsensusState::Failed);
        assert!(consensus.current_proposal().is_none());
    }

    #[test]
    fn threshold_at_or_below_half_rejected() {
        assert_eq!(
            SequencerConsensus::with_threshold(1, 1_000_000, 5_000, 1, 2).unwrap_err(),
            ConsensusError::ThresholdNotAboveHalf(1, 2)
        );
        assert_eq!(
            SequencerConsensus::with_threshold(1, 1_000_000, 5_000, 0, 1).unwrap_err(),
            ConsensusError::ThresholdNotAboveHalf(0, 1)
        );
    }

    #[test]
    fn configurable_threshold_finalizes_earlier_than_default() {
        let parent = genesis();
        let mut consensus = SequencerConsensus::with_threshold(1, 1_000_000, 5_000, 1, 1).unwrap();
        let prop = proposal_for(&parent, addr(1));
        consensus.propose(prop.clone(), addr(1), &parent, 10_000).unwrap();

        // Threshold 1/1 demands unanimous accept weight; a single voter
        // holding all the weight finalizes immediately, unlike the default
        // 2/3 threshold which would still wait on nothing further here.
        let k1 = SigningKey::from_bytes(&[1u8; 32]);
        let eligible = vec![sequencer(1, 1_000_000, 100, &k1)];
        let block_hash = prop.block.hash();
        let v1 = signed_vote(&k1, addr(1), block_hash, VoteType::Accept, 1);
        let result = consensus.process_vote(v1, &eligible).unwrap();
        assert_eq!(result.state, ConsensusState::Finalized);
    }

    #[test]
    fn second_proposal_blocked_while_round_active() {
        let parent = genesis();
        let mut consensus = SequencerConsensus::new(1, 1_000_000, 5_000);
        let prop = proposal_for(&parent, addr(1));
        consensus.propose(prop.clone(), addr(1), &parent, 10_000).unwrap();
        let err = consensus.propose(prop, addr(1), &parent, 10_500).unwrap_err();
        assert_eq!(err, ConsensusError::ProposalAlreadyInFlight);
    }
}
