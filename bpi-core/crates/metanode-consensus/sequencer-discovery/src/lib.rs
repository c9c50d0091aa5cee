//! Sequencer candidacy announcements, distributed attestation, and
//! eligibility tracking for the L2 sequencer set (spec.md §4.11).
//!
//! Grounded on `examples/original_source/src/l2/sequencer_discovery.h`
//! (`SequencerInfo`, `SequencerAttestation`, `SeqAnnounceMsg`, the
//! `MAX_ATTESTATIONS_PER_SEQUENCER` / `MAX_SEQUENCERS` /
//! `MIN_ATTESTATIONS_FOR_VERIFICATION` constants and the
//! `SequencerDiscovery` class's announce/process/verify surface).

use std::collections::HashMap;

use crypto_primitives::{Addr, Ed25519PublicKey};
use ed25519_dalek::{Signature, Verifier};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("announcement expired")]
    Expired,
    #[error("announcement timestamp too far in the future")]
    TooFarFuture,
    #[error("wrong chain id: expected {expected}, got {got}")]
    WrongChain { expected: u64, got: u64 },
    #[error("signature verification failed")]
    BadSignature,
    #[error("sequencer registry is full")]
    RegistryFull,
    #[error("unknown sequencer {0}")]
    UnknownSequencer(Addr),
    #[error("duplicate attestation from {0}")]
    DuplicateAttestation(Addr),
    #[error("attestation cache full for sequencer")]
    AttestationCacheFull,
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

pub const MAX_ATTESTATIONS_PER_SEQUENCER: usize = 100;
pub const MAX_SEQUENCERS: usize = 1000;
pub const ANNOUNCEMENT_EXPIRY_SECONDS: i64 = 3600;
pub const ANNOUNCEMENT_FUTURE_SLACK_SECONDS: i64 = 60;
pub const MIN_ATTESTATIONS_FOR_VERIFICATION: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerInfo {
    pub address: Addr,
    pub pubkey: [u8; 32],
    pub verified_stake: u64,
    pub verified_hat_score: u32,
    pub peer_count: u32,
    pub public_endpoint: String,
    pub last_announcement: i64,
    pub last_block_produced: i64,
    pub blocks_produced: u64,
    pub blocks_missed: u64,
    pub is_verified: bool,
    pub is_eligible: bool,
    pub attestation_count: u32,
    pub l2_chain_id: u64,
}

impl SequencerInfo {
    fn new(address: Addr, pubkey: [u8; 32], stake: u64, hat_score: u32, endpoint: String, now: i64, chain_id: u64) -> Self {
        Self {
            address,
            pubkey,
            verified_stake: stake,
            verified_hat_score: hat_score,
            peer_count: 0,
            public_endpoint: endpoint,
            last_announcement: now,
            last_block_produced: 0,
            blocks_produced: 0,
            blocks_missed: 0,
            is_verified: false,
            is_eligible: false,
            attestation_count: 0,
            l2_chain_id: chain_id,
        }
    }

    pub fn uptime_percent(&self) -> f64 {
        let total = self.blocks_produced + self.blocks_missed;
        if total == 0 {
            100.0
        } else {
            self.blocks_produced as f64 / total as f64 * 100.0
        }
    }

    /// `weight = hatScore * ceil(sqrt(stake / 1 CAS))`, matching
    /// `SequencerInfo::GetWeight()`.
    pub fn weight(&self, cas: u64) -> u64 {
        if cas == 0 {
            return 0;
        }
        let stake_in_cas = self.verified_stake / cas;
        let sqrt_floor = (stake_in_cas as f64).sqrt() as u64;
        let sqrt_ceil = if sqrt_floor * sqrt_floor < stake_in_cas { sqrt_floor + 1 } else { sqrt_floor };
        self.verified_hat_score as u64 * sqrt_ceil
    }

    fn not_expired(&self, now: i64) -> bool {
        now - self.last_announcement <= ANNOUNCEMENT_EXPIRY_SECONDS
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeqAnnounceMsg {
    pub address: Addr,
    pub pubkey: [u8; 32],
    pub stake: u64,
    pub hat_score: u32,
    pub public_endpoint: String,
    pub chain_id: u64,
    pub timestamp: i64,
    pub signature: [u8; 64],
}

impl SeqAnnounceMsg {
    fn signed_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.address.0);
        buf.extend_from_slice(&self.pubkey);
        buf.extend_from_slice(&self.stake.to_be_bytes());
        buf.extend_from_slice(&self.hat_score.to_be_bytes());
        buf.extend_from_slice(self.public_endpoint.as_bytes());
        buf.extend_from_slice(&self.chain_id.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerAttestation {
    pub sequencer_address: Addr,
    pub attester_address: Addr,
    pub attested_hat_score: u32,
    pub attested_stake: u64,
    pub block_height: u64,
    pub timestamp: i64,
}

pub struct SequencerDiscovery {
    chain_id: u64,
    registry: HashMap<Addr, SequencerInfo>,
    attestations: HashMap<Addr, Vec<SequencerAttestation>>,
    local_sequencer: Option<Addr>,
}

impl SequencerDiscovery {
    pub fn new(chain_id: u64) -> Self {
        Self { chain_id, registry: HashMap::new(), attestations: HashMap::new(), local_sequencer: None }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Builds and signs a `SeqAnnounceMsg` for this node and registers it
    /// locally; the caller is responsible for broadcasting it on P2P.
    pub fn announce(
        &mut self,
        signing_key: &ed25519_dalek::SigningKey,
        address: Addr,
        stake: u64,
        hat_score: u32,
        endpoint: String,
        now: i64,
    ) -> Result<SeqAnnounceMsg> {
        use ed25519_dalek::Signer;
        let pubkey = signing_key.verifying_key().to_bytes();
        let mut msg = SeqAnnounceMsg {
            address,
            pubkey,
            stake,
            hat_score,
            public_endpoint: endpoint,
            chain_id: self.chain_id,
            timestamp: now,
            signature: [0u8; 64],
        };
        let sig = signing_key.sign(&msg.signed_payload());
        msg.signature = sig.to_bytes();
        self.process_announce(&msg, now)?;
        self.local_sequencer = Some(address);
        Ok(msg)
    }

    pub fn is_local_sequencer(&self) -> bool {
        self.local_sequencer.is_some()
    }

    pub fn local_sequencer_address(&self) -> Option<Addr> {
        self.local_sequencer
    }

    /// Validates and upserts an incoming announcement.
    pub fn process_announce(&mut self, msg: &SeqAnnounceMsg, now: i64) -> Result<()> {
        if msg.chain_id != self.chain_id {
            return Err(DiscoveryError::WrongChain { expected: self.chain_id, got: msg.chain_id });
        }
        if now - msg.timestamp > ANNOUNCEMENT_EXPIRY_SECONDS {
            return Err(DiscoveryError::Expired);
        }
        if msg.timestamp - now > ANNOUNCEMENT_FUTURE_SLACK_SECONDS {
            return Err(DiscoveryError::TooFarFuture);
        }

        let pubkey = Ed25519PublicKey::from_bytes(&msg.pubkey).map_err(|_| DiscoveryError::BadSignature)?;
        let verifying_key = pubkey.verifying_key().map_err(|_| DiscoveryError::BadSignature)?;
        let sig = Signature::from_bytes(&msg.signature);
        verifying_key.verify(&msg.signed_payload(), &sig).map_err(|_| DiscoveryError::BadSignature)?;

        if !self.registry.contains_key(&msg.address) && self.registry.len() >= MAX_SEQUENCERS {
            return Err(DiscoveryError::RegistryFull);
        }

        let entry = self.registry.entry(msg.address).or_insert_with(|| {
            SequencerInfo::new(msg.address, msg.pubkey, msg.stake, msg.hat_score, msg.public_endpoint.clone(), now, self.chain_id)
        });
        entry.pubkey = msg.pubkey;
        entry.verified_stake = msg.stake;
        entry.verified_hat_score = msg.hat_score;
        entry.public_endpoint = msg.public_endpoint.clone();
        entry.last_announcement = now;
        Ok(())
    }

    /// Records a peer attestation, bumping `attestationCount` and keeping
    /// at most `MAX_ATTESTATIONS_PER_SEQUENCER` per sequencer.
    pub fn process_attestation(&mut self, att: SequencerAttestation) -> Result<()> {
        let info = self.registry.get_mut(&att.sequencer_address).ok_or(DiscoveryError::UnknownSequencer(att.sequencer_address))?;

        let cache = self.attestations.entry(att.sequencer_address).or_default();
        if cache.iter().any(|a| a.attester_address == att.attester_address) {
            return Err(DiscoveryError::DuplicateAttestation(att.attester_address));
        }
        if cache.len() >= MAX_ATTESTATIONS_PER_SEQUENCER {
            return Err(DiscoveryError::AttestationCacheFull);
        }
        cache.push(att);
        info.attestation_count = cache.len() as u32;
        Ok(())
    }

    /// Sets `isEligible` when enough attestations corroborate the claimed
    /// stake/HAT score and `min_requirements` holds.
    pub fn verify_eligibility(&mut self, addr: &Addr, min_stake: u64, min_hat_score: u32, now: i64) -> Result<bool> {
        let attestation_count = self.attestations.get(addr).map(|v| v.len()).unwrap_or(0) as u32;
        let info = self.registry.get_mut(addr).ok_or(DiscoveryError::UnknownSequencer(*addr))?;

        let meets_minimums = info.verified_stake >= min_stake && info.verified_hat_score >= min_hat_score && info.not_expired(now);
        let enough_attestations = attestation_count >= MIN_ATTESTATIONS_FOR_VERIFICATION;

        info.is_verified = enough_attestations;
        info.is_eligible = meets_minimums && enough_attestations;
        Ok(info.is_eligible)
    }

    pub fn is_eligible_sequencer(&self, addr: &Addr) -> bool {
        self.registry.get(addr).map(|i| i.is_eligible).unwrap_or(false)
    }

    /// Eligible, non-expired snapshot, the leader-election input set.
    pub fn get_eligible(&self, now: i64) -> Vec<SequencerInfo> {
        self.registry.values().filter(|i| i.is_eligible && i.not_expired(now)).cloned().collect()
    }

    pub fn get_all(&self) -> Vec<SequencerInfo> {
        self.registry.values().cloned().collect()
    }

    pub fn get(&self, addr: &Addr) -> Option<SequencerInfo> {
        self.registry.get(addr).cloned()
    }

    pub fn count(&self) -> usize {
        self.registry.len()
    }

    pub fn eligible_count(&self, now: i64) -> usize {
        self.registry.values().filter(|i| i.is_eligible && i.not_expired(now)).count()
    }

    pub fn prune_expired(&mut self, now: i64, max_age_secs: i64) -> usize {
        let before = self.registry.len();
        self.registry.retain(|_, i| now - i.last_announcement <= max_age_secs);
        before - self.registry.len()
    }

    pub fn update_metrics(&mut self, addr: &Addr, produced_block: bool, now: i64) -> Result<()> {
        let info = self.registry.get_mut(addr).ok_or(DiscoveryError::UnknownSequencer(*addr))?;
        if produced_block {
            info.blocks_produced += 1;
            info.last_block_produced = now;
        } else {
            info.blocks_missed += 1;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.registry.clear();
        self.attestations.clear();
        self.local_sequencer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn addr(n: u8) -> Addr {
        let mut b = [0u8; 20];
        b[0] = n;
        Addr(b)
    }

    fn keypair() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    #[test]
    fn announce_then_verify_eligibility() {
        let mut disc = SequencerDiscovery::new(7);
        let key = keypair();
        let a = addr(1);
        disc.announce(&key, a, 10_000, 900, "node1:9000".into(), 1000).unwrap();
        assert!(!disc.is_eligible_sequencer(&a));

        for i in 0..3u8 {
            disc.process_attestation(SequencerAttestation {
                sequencer_address: a,
                attester_address: addr(100 + i),
                attested_hat_score: 900,
                attested_stake: 10_000,
                block_height: 1,
                timestamp: 1000,
            })
            .unwrap();
        }
        let eligible = disc.verify_eligibility(&a, 5_000, 500, 1000).unwrap();
        assert!(eligible);
        assert_eq!(disc.get_eligible(1000).len(), 1);
    }

    #[test]
    fn wrong_chain_id_rejected() {
        let mut disc = SequencerDiscovery::new(7);
        let key = keypair();
        let pubkey = key.verifying_key().to_bytes();
        let mut msg = SeqAnnounceMsg {
            address: addr(2),
            pubkey,
            stake: 1,
            hat_score: 1,
            public_endpoint: String::new(),
            chain_id: 99,
            timestamp: 0,
            signature: [0u8; 64],
        };
        use ed25519_dalek::Signer;
        msg.signature = key.sign(&msg.signed_payload()).to_bytes();
        assert!(matches!(disc.process_announce(&msg, 0), Err(DiscoveryError::WrongChain { .. })));
    }

    #[test]
    fn tampered_signature_rejected() {
        let mut disc = SequencerDiscovery::new(7);
        let key = keypair();
        let pubkey = key.verifying_key().to_bytes();
        let mut msg = SeqAnnounceMsg {
            address: addr(3),
            pubkey,
            stake: 1,
            hat_score: 1,
            public_endpoint: String::new(),
            chain_id: 7,
            timestamp: 0,
            signature: [0u8; 64],
        };
        use ed25519_dalek::Signer;
        msg.signature = key.sign(&msg.signed_payload()).to_bytes();
        msg.stake = 999_999;
        assert!(matches!(disc.process_announce(&msg, 0), Err(DiscoveryError::BadSignature)));
    }

    #[test]
    fn expired_announcement_rejected() {
        let mut disc = SequencerDiscovery::new(7);
        let key = keypair();
        let pubkey = key.verifying_key().to_bytes();
        let mut msg = SeqAnnounceMsg {
            address: addr(4),
            pubkey,
            stake: 1,
            hat_score: 1,
            public_endpoint: String::new(),
            chain_id: 7,
            timestamp: 0,
            signature: [0u8; 64],
        };
        use ed25519_dalek::Signer;
        msg.signature = key.sign(&msg.signed_payload()).to_bytes();
        assert!(matches!(disc.process_announce(&msg, ANNOUNCEMENT_EXPIRY_SECONDS + 1), Err(DiscoveryError::Expired)));
    }

    #[test]
    fn duplicate_attestation_rejected() {
        let mut disc = SequencerDiscovery::new(7);
        let key = keypair();
        let a = addr(5);
        disc.announce(&key, a, 1, 1, String::new(), 0).unwrap();
        let att = SequencerAttestation { sequencer_address: a, attester_address: addr(200), attested_hat_score: 1, attested_stake: 1, block_height: 0, timestamp: 0 };
        disc.process_attestation(att.clone()).unwrap();
        assert!(matches!(disc.process_attestation(att), Err(DiscoveryError::DuplicateAttestation(_))));
    }

    #[test]
    fn weight_matches_hat_times_ceil_sqrt_stake() {
        let info = SequencerInfo::new(addr(6), [0u8; 32], 5, 100, String::new(), 0, 7);
        // stake_in_cas = 5 / 1 = 5, ceil(sqrt(5)) = 3
        assert_eq!(info.weight(1), 100 * 3);
    }

    #[test]
    fn prune_removes_stale_entries() {
        let mut disc = SequencerDiscovery::new(7);
        let key = keypair();
        disc.announce(&key, addr(7), 1, 1, String::new(), 0).unwrap();
        let removed = disc.prune_expired(10_000, 3600);
        assert_eq!(removed, 1);
        assert_eq!(disc.count(), 0);
    }
}
