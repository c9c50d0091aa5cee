//! Deterministic weighted leader election for L2 slots, with signed
//! failover claims (spec.md §4.12).
//!
//! Grounded on `examples/original_source/src/l2/leader_election.cpp`:
//! `GenerateElectionSeed`, `WeightedRandomSelect`, `HandleLeaderTimeout`'s
//! failover-position bookkeeping, and the claim/conflict-resolution
//! surface (`ClaimLeadership`, `ProcessLeadershipClaim`,
//! `ResolveConflictingClaims`'s four-rule tie-break).

use crypto_primitives::{Addr, Ed25519PublicKey, Hash256};
use ed25519_dalek::{Signature, Verifier};
use sequencer_discovery::SequencerInfo;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ElectionError {
    #[error("no eligible sequencers for this slot")]
    NoEligibleSequencers,
    #[error("claimant is beyond the current failover position")]
    ClaimBeyondFailoverPosition,
    #[error("claim signature is invalid")]
    InvalidClaimSignature,
    #[error("no active election for slot {0}")]
    NoActiveElection { slot: u64 },
}

pub type Result<T> = std::result::Result<T, ElectionError>;

pub const BLOCKS_PER_SLOT: u64 = 10;
pub const MAX_BACKUP_SEQUENCERS: usize = 16;
pub const SEED_DOMAIN: &[u8] = b"CASCOIN_L2_ELECTION_SEED_V1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionResult {
    pub slot_number: u64,
    pub election_seed: Hash256,
    pub leader_address: Addr,
    pub backup_sequencers: Vec<Addr>,
    pub valid_until_block: u64,
    pub is_valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadershipClaim {
    pub slot_number: u64,
    pub claimant: Addr,
    pub claimant_pubkey: [u8; 32],
    pub failover_position: u32,
    pub reputation: i64,
    pub timestamp: i64,
    pub signature: [u8; 64],
}

impl LeadershipClaim {
    fn signed_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.slot_number.to_be_bytes());
        buf.extend_from_slice(&self.claimant.0);
        buf.extend_from_slice(&self.failover_position.to_be_bytes());
        buf.extend_from_slice(&self.reputation.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf
    }
}

/// Deterministic seed: `H(slot || l1BlockHash(seedHeight) || chainId || domain)`.
pub fn generate_election_seed(slot_number: u64, l1_block_hash: Hash256, chain_id: u64) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(slot_number.to_be_bytes());
    hasher.update(l1_block_hash.0);
    hasher.update(chain_id.to_be_bytes());
    hasher.update(SEED_DOMAIN);
    let out: [u8; 32] = hasher.finalize().into();
    Hash256(out)
}

/// Block at which the seed-determining L1 block is read: `slot*N - 6`,
/// floored at 0.
pub fn seed_block_height(slot_number: u64) -> u64 {
    let h = slot_number.saturating_mul(BLOCKS_PER_SLOT);
    h.saturating_sub(6)
}

fn weight_of(info: &SequencerInfo, cas: u64) -> u64 {
    info.weight(cas)
}

fn total_weight(sequencers: &[SequencerInfo], cas: u64) -> u64 {
    sequencers.iter().map(|s| weight_of(s, cas)).sum()
}

/// `seed mod total` cumulative-weight walk; `seed mod len` fallback when
/// every sequencer has zero weight.
fn weighted_random_select(sequencers: &[SequencerInfo], seed: &Hash256, cas: u64) -> Addr {
    let seed_num = u64::from_be_bytes(seed.0[24..32].try_into().unwrap());
    let total = total_weight(sequencers, cas);
    if total == 0 {
        let idx = (seed_num as usize) % sequencers.len();
        return sequencers[idx].address;
    }
    let r = seed_num % total;
    let mut cumulative = 0u64;
    for s in sequencers {
        cumulative += weight_of(s, cas);
        if r < cumulative {
            return s.address;
        }
    }
    sequencers.last().unwrap().address
}

pub struct LeaderElection {
    chain_id: u64,
    cas: u64,
    current: Option<ElectionResult>,
    failover_position: u32,
}

impl LeaderElection {
    pub fn new(chain_id: u64, cas: u64) -> Self {
        Self { chain_id, cas, current: None, failover_position: 0 }
    }

    /// Runs the election for `slot_number` over the given eligible set
    /// and `l1_block_hash` (the block at `seed_block_height(slot_number)`).
    pub fn elect_leader(&mut self, slot_number: u64, eligible: &[SequencerInfo], l1_block_hash: Hash256) -> Result<ElectionResult> {
        if eligible.is_empty() {
            return Err(ElectionError::NoEligibleSequencers);
        }
        let seed = generate_election_seed(slot_number, l1_block_hash, self.chain_id);
        let valid_until_block = (slot_number + 1) * BLOCKS_PER_SLOT;

        if eligible.len() == 1 {
            let result = ElectionResult {
                slot_number,
                election_seed: seed,
                leader_address: eligible[0].address,
                backup_sequencers: Vec::new(),
                valid_until_block,
                is_valid: true,
            };
            self.current = Some(result.clone());
            self.failover_position = 0;
            return Ok(result);
        }

        let leader = weighted_random_select(eligible, &seed, self.cas);

        let mut sorted: Vec<&SequencerInfo> = eligible.iter().collect();
        sorted.sort_by(|a, b| weight_of(b, self.cas).cmp(&weight_of(a, self.cas)).then_with(|| a.address.0.cmp(&b.address.0)));

        let backups: Vec<Addr> = sorted.into_iter().filter(|s| s.address != leader).map(|s| s.address).take(MAX_BACKUP_SEQUENCERS).collect();

        let result = ElectionResult { slot_number, election_seed: seed, leader_address: leader, backup_sequencers: backups, valid_until_block, is_valid: true };
        self.current = Some(result.clone());
        self.failover_position = 0;
        Ok(result)
    }

    pub fn current_election(&self) -> Option<&ElectionResult> {
        self.current.as_ref()
    }

    pub fn is_leader(&self, addr: &Addr) -> bool {
        self.current.as_ref().map(|e| e.is_valid && e.leader_address == *addr).unwrap_or(false)
    }

    /// Promotes the next backup, in order, as leader; returns the
    /// previous leader so callers can penalize its metrics.
    pub fn handle_timeout(&mut self, slot_number: u64) -> Result<Addr> {
        let election = self.current.as_mut().ok_or(ElectionError::NoActiveElection { slot: slot_number })?;
        if election.slot_number != slot_number {
            return Err(ElectionError::NoActiveElection { slot: slot_number });
        }
        let previous_leader = election.leader_address;
        if (self.failover_position as usize) < election.backup_sequencers.len() {
            election.leader_address = election.backup_sequencers[self.failover_position as usize];
            self.failover_position += 1;
            Ok(previous_leader)
        } else {
            election.is_valid = false;
            Ok(previous_leader)
        }
    }

    pub fn failover_position(&self) -> u32 {
        self.failover_position
    }

    /// Resets failover state; callers re-run `elect_leader` with the new
    /// slot's seed after this.
    pub fn update_height(&mut self) {
        self.failover_position = 0;
        self.current = None;
    }

    /// Verifies the claim's signature and that its `failover_position`
    /// is at or before the election's current position.
    pub fn validate_claim(&self, claim: &LeadershipClaim) -> Result<()> {
        if claim.failover_position > self.failover_position {
            return Err(ElectionError::ClaimBeyondFailoverPosition);
        }
        let pubkey = Ed25519PublicKey::from_bytes(&claim.claimant_pubkey).map_err(|_| ElectionError::InvalidClaimSignature)?;
        let verifying_key = pubkey.verifying_key().map_err(|_| ElectionError::InvalidClaimSignature)?;
        let sig = Signature::from_bytes(&claim.signature);
        verifying_key.verify(&claim.signed_payload(), &sig).map_err(|_| ElectionError::InvalidClaimSignature)?;
        Ok(())
    }

    /// Applies the winning claim (after `resolve_conflicting_claims`) as
    /// the new leader.
    pub fn apply_claim(&mut self, claim: &LeadershipClaim) -> Result<()> {
        self.validate_claim(claim)?;
        let election = self.current.as_mut().ok_or(ElectionError::NoActiveElection { slot: claim.slot_number })?;
        election.leader_address = claim.claimant;
        self.failover_position = claim.failover_position;
        Ok(())
    }
}

/// Tie-break order: lower failover position wins, then higher
/// reputation, then earlier timestamp, then lower address.
pub fn resolve_conflicting_claims(claims: &[LeadershipClaim]) -> Option<&LeadershipClaim> {
    claims.iter().min_by(|a, b| {
        a.failover_position
            .cmp(&b.failover_position)
            .then_with(|| b.reputation.cmp(&a.reputation))
            .then_with(|| a.timestamp.cmp(&b.timestamp))
            .then_with(|| a.claimant.0.cmp(&b.claimant.0))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    fn addr(n: u8) -> Addr {
        let mut b = [0u8; 20];
        b[0] = n;
        Addr(b)
    }

    fn seq(n: u8, hat: u32, stake: u64) -> SequencerInfo {
        SequencerInfo {
            address: addr(n),
            pubkey: [0u8; 32],
            verified_stake: stake,
            verified_hat_score: hat,
            peer_count: 0,
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

    #[test]
    fn single_sequencer_is_trivially_elected() {
        let mut e = LeaderElection::new(1, 1);
        let s = vec![seq(1, 100, 100)];
        let result = e.elect_leader(0, &s, Hash256::zero()).unwrap();
        assert_eq!(result.leader_address, addr(1));
        assert!(result.backup_sequencers.is_empty());
    }

    #[test]
    fn election_is_deterministic_for_same_seed() {
        let mut e1 = LeaderElection::new(1, 1);
        let mut e2 = LeaderElection::new(1, 1);
        let s = vec![seq(1, 50, 1), seq(2, 200, 1), seq(3, 10, 1)];
        let r1 = e1.elect_leader(5, &s, Hash256::of(b"l1-block")).unwrap();
        let r2 = e2.elect_leader(5, &s, Hash256::of(b"l1-block")).unwrap();
        assert_eq!(r1.leader_address, r2.leader_address);
        assert_eq!(r1.backup_sequencers, r2.backup_sequencers);
    }

    #[test]
    fn backups_sorted_by_weight_desc_then_address() {
        let mut e = LeaderElection::new(1, 1);
        let s = vec![seq(1, 10, 1), seq(2, 999_999, 1), seq(3, 10, 1)];
        let result = e.elect_leader(1, &s, Hash256::zero()).unwrap();
        if result.leader_address != addr(2) {
            assert_eq!(result.backup_sequencers[0], addr(2));
        }
    }

    #[test]
    fn timeout_promotes_first_backup() {
        let mut e = LeaderElection::new(1, 1);
        let s = vec![seq(1, 10, 1), seq(2, 999_999, 1), seq(3, 10, 1)];
        let before = e.elect_leader(1, &s, Hash256::zero()).unwrap();
        let previous = e.handle_timeout(1).unwrap();
        assert_eq!(previous, before.leader_address);
        assert_eq!(e.failover_position(), 1);
        assert_ne!(e.current_election().unwrap().leader_address, before.leader_address);
    }

    #[test]
    fn timeout_exhausts_backups_and_invalidates() {
        let mut e = LeaderElection::new(1, 1);
        let s = vec![seq(1, 10, 1), seq(2, 20, 1)];
        e.elect_leader(1, &s, Hash256::zero()).unwrap();
        e.handle_timeout(1).unwrap();
        e.handle_timeout(1).unwrap();
        assert!(!e.current_election().unwrap().is_valid);
    }

    #[test]
    fn conflicting_claims_resolved_by_failover_position_then_reputation() {
        let key = SigningKey::generate(&mut OsRng);
        let mk_claim = |pos: u32, rep: i64, ts: i64, who: u8| {
            let mut c = LeadershipClaim {
                slot_number: 1,
                claimant: addr(who),
                claimant_pubkey: key.verifying_key().to_bytes(),
                failover_position: pos,
                reputation: rep,
                timestamp: ts,
                signature: [0u8; 64],
            };
            c.signature = key.sign(&c.signed_payload()).to_bytes();
            c
        };
        let claims = vec![mk_claim(1, 10, 100, 2), mk_claim(0, 5, 200, 1), mk_claim(0, 50, 50, 3)];
        let winner = resolve_conflicting_claims(&claims).unwrap();
        assert_eq!(winner.claimant, addr(3));
    }

    #[test]
    fn claim_beyond_failover_position_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let mut e = LeaderElection::new(1, 1);
        let s = vec![seq(1, 10, 1), seq(2, 20, 1)];
        e.elect_leader(1, &s, Hash256::zero()).unwrap();
        let mut claim = LeadershipClaim { slot_number: 1, claimant: addr(9), claimant_pubkey: key.verifying_key().to_bytes(), failover_position: 3, reputation: 0, timestamp: 0, signature: [0u8; 64] };
        claim.signature = key.sign(&claim.signed_payload()).to_bytes();
        assert!(matches!(e.validate_claim(&claim), Err(ElectionError::ClaimBeyondFailoverPosition)));
    }
}
