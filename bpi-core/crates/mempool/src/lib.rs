//! Encrypted mempool: commit-order-reveal with threshold decryption shares
//! for MEV resistance (spec.md §4.14).
//!
//! Grounded on `examples/original_source/src/l2/encrypted_mempool.h`: the
//! per-sender nonce/chain uniqueness check, the sliding-window rate limit
//! scaled by reputation, the fee-tier grouping with a >10% drop boundary,
//! and the deterministic within-tier shuffle seeded by the target block
//! number that eliminates ordering MEV inside a fee tier while preserving
//! the priority-fee auction across tiers.

use std::collections::{HashMap, VecDeque};

use crypto_primitives::{Addr, Amount, Hash256, Timestamp};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MempoolError {
    #[error("encrypted tx targets chain {got}, this mempool tracks chain {want}")]
    WrongChain { got: u64, want: u64 },
    #[error("encrypted tx already expired at submission")]
    AlreadyExpired,
    #[error("duplicate (sender, nonce) for this chain")]
    DuplicateNonce,
    #[error("pool is at capacity ({0})")]
    PoolFull(usize),
    #[error("sender exceeded its rate-limit window")]
    RateLimited,
    #[error("share already recorded for (sequencer, tx)")]
    DuplicateShare,
    #[error("tx already has the maximum {0} shares")]
    TooManyShares(usize),
    #[error("commitment mismatch: decrypted plaintext does not hash to the committed value")]
    CommitmentMismatch,
    #[error("not enough shares collected yet ({have}/{need})")]
    InsufficientShares { have: usize, need: usize },
}

pub type Result<T> = std::result::Result<T, MempoolError>;

pub const MAX_POOL_SIZE: usize = 10_000;
pub const MAX_SHARES_PER_TX: usize = 64;
/// A new fee tier begins whenever the next transaction's max fee drops by
/// more than this fraction of the current tier's top fee.
pub const TIER_DROP_FRACTION: f64 = 0.10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedTransaction {
    pub ciphertext: Vec<u8>,
    pub commitment_hash: Hash256,
    pub sender: Addr,
    pub nonce: u64,
    pub max_fee: Amount,
    pub submission_time: Timestamp,
    pub encryption_nonce: [u8; 24],
    pub scheme_version: u8,
    pub l2_chain_id: u64,
    pub sender_signature: [u8; 64],
    pub target_block: u64,
    pub expiry_time: Timestamp,
}

impl EncryptedTransaction {
    /// Deterministic id, independent of in-memory storage order.
    pub fn tx_hash(&self) -> Hash256 {
        let mut hasher = Sha256::new();
        hasher.update(&self.ciphertext);
        hasher.update(self.commitment_hash.0);
        hasher.update(self.sender.0);
        hasher.update(self.nonce.to_be_bytes());
        hasher.update(self.l2_chain_id.to_be_bytes());
        let out: [u8; 32] = hasher.finalize().into();
        Hash256(out)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptionShare {
    pub seq: Addr,
    pub share: Vec<u8>,
    pub share_index: u32,
    pub sig: [u8; 64],
    pub tx_hash: Hash256,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MempoolConfig {
    pub max_pool_size: usize,
    pub max_shares_per_tx: usize,
    pub rate_limit_window_secs: i64,
    /// Requests allowed per window at reputation 0; scales linearly up to
    /// 5x at reputation >= `rate_limit_rep_ceiling`.
    pub rate_limit_base: u32,
    pub rate_limit_rep_ceiling: i16,
    /// Gas charged per encrypted tx when building a block, since the real
    /// cost is unknown until the ciphertext is decrypted.
    pub default_tx_gas_estimate: u64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: MAX_POOL_SIZE,
            max_shares_per_tx: MAX_SHARES_PER_TX,
            rate_limit_window_secs: 60,
            rate_limit_base: 100,
            rate_limit_rep_ceiling: 70,
            default_tx_gas_estimate: 21_000,
        }
    }
}

/// Rate-limit multiplier: 1.0 at reputation 0, scaling linearly to 5.0 at
/// `ceiling` and beyond (spec.md §4.14).
fn rate_limit_multiplier(reputation: i16, ceiling: i16) -> f64 {
    if ceiling <= 0 {
        return 1.0;
    }
    let clamped = reputation.clamp(0, ceiling) as f64;
    1.0 + (clamped / ceiling as f64) * 4.0
}

struct SenderWindow {
    submissions: VecDeque<Timestamp>,
}

pub struct EncryptedMempool {
    config: MempoolConfig,
    l2_chain_id: u64,
    pool: HashMap<Hash256, EncryptedTransaction>,
    seen_nonces: std::collections::HashSet<(Addr, u64)>,
    shares: HashMap<Hash256, HashMap<Addr, DecryptionShare>>,
    windows: HashMap<Addr, SenderWindow>,
}

impl EncryptedMempool {
    pub fn new(l2_chain_id: u64, config: MempoolConfig) -> Self {
        Self {
            config,
            l2_chain_id,
            pool: HashMap::new(),
            seen_nonces: std::collections::HashSet::new(),
            shares: HashMap::new(),
            windows: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Structural validation, chain/expiry checks, per-sender rate limit
    /// (scaled by `sender_reputation`), pool-size cap, and duplicate-hash
    /// rejection, then appends the transaction (spec.md §4.14).
    pub fn submit(
        &mut self,
        tx: EncryptedTransaction,
        now: Timestamp,
        sender_reputation: i16,
    ) -> Result<Hash256> {
        if tx.l2_chain_id != self.l2_chain_id {
            return Err(MempoolError::WrongChain { got: tx.l2_chain_id, want: self.l2_chain_id });
        }
        if tx.expiry_time <= now {
            return Err(MempoolError::AlreadyExpired);
        }
        let nonce_key = (tx.sender, tx.nonce);
        if self.seen_nonces.contains(&nonce_key) {
            return Err(MempoolError::DuplicateNonce);
        }
        if self.pool.len() >= self.config.max_pool_size {
            return Err(MempoolError::PoolFull(self.config.max_pool_size));
        }

        let limit = (self.config.rate_limit_base as f64
            * rate_limit_multiplier(sender_reputation, self.config.rate_limit_rep_ceiling))
            as usize;
        let window = self.windows.entry(tx.sender).or_insert_with(|| SenderWindow { submissions: VecDeque::new() });
        let cutoff = now - self.config.rate_limit_window_secs;
        while window.submissions.front().is_some_and(|&t| t < cutoff) {
            window.submissions.pop_front();
        }
        if window.submissions.len() >= limit {
            return Err(MempoolError::RateLimited);
        }
        window.submissions.push_back(now);

        let hash = tx.tx_hash();
        self.seen_nonces.insert(nonce_key);
        self.pool.insert(hash, tx);
        Ok(hash)
    }

    /// One share per (sequencer, txHash); capped at `max_shares_per_tx`.
    pub fn contribute_share(&mut self, share: DecryptionShare) -> Result<()> {
        let entry = self.shares.entry(share.tx_hash).or_default();
        if entry.len() >= self.config.max_shares_per_tx {
            return Err(MempoolError::TooManyShares(self.config.max_shares_per_tx));
        }
        if entry.contains_key(&share.seq) {
            return Err(MempoolError::DuplicateShare);
        }
        entry.insert(share.seq, share);
        Ok(())
    }

    pub fn share_count(&self, tx_hash: &Hash256) -> usize {
        self.shares.get(tx_hash).map_or(0, |m| m.len())
    }

    /// Combines collected shares once `>= ceil(sequencer_count * 2/3)` have
    /// arrived. Combination is a placeholder XOR-fold over shares ordered
    /// by `share_index` (spec.md §9: real Shamir-like interpolation is an
    /// external capability); the combined plaintext is accepted only if it
    /// reproduces the transaction's committed hash.
    pub fn try_decrypt(&self, tx_hash: &Hash256, sequencer_count: usize) -> Result<Vec<u8>> {
        let threshold = (sequencer_count * 2).div_ceil(3).max(1);
        let shares = self.shares.get(tx_hash).map(|m| m.values().collect::<Vec<_>>()).unwrap_or_default();
        if shares.len() < threshold {
            return Err(MempoolError::InsufficientShares { have: shares.len(), need: threshold });
        }
        let mut ordered = shares;
        ordered.sort_by_key(|s| s.share_index);
        let max_len = ordered.iter().map(|s| s.share.len()).max().unwrap_or(0);
        let mut plaintext = vec![0u8; max_len];
        for share in &ordered {
            for (i, b) in share.share.iter().enumerate() {
                plaintext[i] ^= b;
            }
        }
        let tx = self.pool.get(tx_hash);
        if let Some(tx) = tx {
            if Hash256::sha256_of(&plaintext) != tx.commitment_hash {
                return Err(MempoolError::CommitmentMismatch);
            }
        }
        Ok(plaintext)
    }

    pub fn prune_expired(&mut self, now: Timestamp) -> Vec<Hash256> {
        let expired: Vec<Hash256> =
            self.pool.iter().filter(|(_, tx)| tx.expiry_time <= now).map(|(h, _)| *h).collect();
        for hash in &expired {
            if let Some(tx) = self.pool.remove(hash) {
                self.seen_nonces.remove(&(tx.sender, tx.nonce));
            }
            self.shares.remove(hash);
        }
        expired
    }

    /// Transaction ordering for block inclusion (spec.md §4.14):
    /// non-expired entries valid for `number`, sorted descending by max
    /// fee, grouped into fee tiers (new tier on a >10% fee drop), shuffled
    /// deterministically within each tier by `H(number)`, accumulated
    /// until the block's gas budget is exhausted.
    pub fn get_transactions_for_block(&self, number: u64, gas_limit: u64, now: Timestamp) -> Vec<Hash256> {
        let mut candidates: Vec<&EncryptedTransaction> = self
            .pool
            .values()
            .filter(|tx| tx.expiry_time > now && tx.target_block <= number)
            .collect();
        candidates.sort_by(|a, b| b.max_fee.cmp(&a.max_fee).then(a.tx_hash().0.cmp(&b.tx_hash().0)));

        let tiers = group_into_fee_tiers(&candidates);
        let seed = block_shuffle_seed(number);

        let mut ordered_hashes = Vec::new();
        for (tier_idx, tier) in tiers.into_iter().enumerate() {
            let mut shuffled = tier;
            deterministic_shuffle(&mut shuffled, seed, tier_idx as u64);
            ordered_hashes.extend(shuffled.into_iter().map(|tx| tx.tx_hash()));
        }

        let mut gas_used: u64 = 0;
        let mut included = Vec::new();
        for hash in ordered_hashes {
            if gas_used + self.config.default_tx_gas_estimate > gas_limit {
                break;
            }
            gas_used += self.config.default_tx_gas_estimate;
            included.push(hash);
        }
        included
    }
}

/// Splits fee-sorted transactions into tiers; a new tier starts whenever
/// the next transaction's fee is more than `TIER_DROP_FRACTION` below the
/// current tier's top fee.
fn group_into_fee_tiers<'a>(sorted_desc: &[&'a EncryptedTransaction]) -> Vec<Vec<&'a EncryptedTransaction>> {
    let mut tiers: Vec<Vec<&EncryptedTransaction>> = Vec::new();
    let mut tier_top: f64 = f64::MAX;
    for tx in sorted_desc {
        let fee = tx.max_fee as f64;
        if tiers.is_empty() || fee < tier_top * (1.0 - TIER_DROP_FRACTION) {
            tiers.push(Vec::new());
            tier_top = fee;
        }
        tiers.last_mut().unwrap().push(*tx);
    }
    tiers
}

fn block_shuffle_seed(number: u64) -> Hash256 {
    Hash256::of(&number.to_be_bytes())
}

/// Deterministic Fisher-Yates shuffle: each swap index is drawn from
/// `H(seed || tier_idx || i)`, matching the hash-derived-index style used
/// by `bpi-leader-selection`'s weighted selection rather than pulling in
/// a general-purpose seeded RNG.
fn deterministic_shuffle<T>(items: &mut [T], seed: Hash256, tier_idx: u64) {
    let n = items.len();
    for i in (1..n).rev() {
        let mut hasher = Sha256::new();
        hasher.update(seed.0);
        hasher.update(tier_idx.to_be_bytes());
        hasher.update((i as u64).to_be_bytes());
        let out: [u8; 32] = hasher.finalize().into();
        let r = u64::from_be_bytes(out[0..8].try_into().unwrap());
        let j = (r % (i as u64 + 1)) as usize;
        items.swap(i, j);
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

    fn tx(sender: u8, nonce: u64, max_fee: Amount, expiry: Timestamp) -> EncryptedTransaction {
        EncryptedTransaction {
            ciphertext: vec![1, 2, 3],
            commitment_hash: Hash256::sha256_of(b"plain"),
            sender: addr(sender),
            nonce,
            max_fee,
            submission_time: 0,
            encryption_nonce: [0u8; 24],
            scheme_version: 1,
            l2_chain_id: 7,
            sender_signature: [0u8; 64],
            target_block: 0,
            expiry_time: expiry,
        }
    }

    #[test]
    fn rejects_wrong_chain() {
        let mut mp = EncryptedMempool::new(7, MempoolConfig::default());
        let mut t = tx(1, 0, 100, 1000);
        t.l2_chain_id = 9;
        assert_eq!(mp.submit(t, 0, 50), Err(MempoolError::WrongChain { got: 9, want: 7 }));
    }

    #[test]
    fn rejects_duplicate_sender_nonce() {
        let mut mp = EncryptedMempool::new(7, MempoolConfig::default());
        mp.submit(tx(1, 0, 100, 1000), 0, 50).unwrap();
        assert_eq!(mp.submit(tx(1, 0, 50, 1000), 1, 50), Err(MempoolError::DuplicateNonce));
    }

    #[test]
    fn rate_limit_scales_with_reputation() {
        let mut cfg = MempoolConfig::default();
        cfg.rate_limit_base = 2;
        let mut mp = EncryptedMempool::new(7, cfg);
        // reputation 0 => limit stays at base (2)
        mp.submit(tx(1, 0, 10, 1000), 0, 0).unwrap();
        mp.submit(tx(1, 1, 10, 1000), 1, 0).unwrap();
        assert_eq!(mp.submit(tx(1, 2, 10, 1000), 2, 0), Err(MempoolError::RateLimited));
    }

    #[test]
    fn pool_full_is_rejected() {
        let mut cfg = MempoolConfig::default();
        cfg.max_pool_size = 1;
        cfg.rate_limit_base = 10;
        let mut mp = EncryptedMempool::new(7, cfg);
        mp.submit(tx(1, 0, 10, 1000), 0, 50).unwrap();
        assert_eq!(mp.submit(tx(2, 0, 10, 1000), 1, 50), Err(MempoolError::PoolFull(1)));
    }

    #[test]
    fn scenario_4_fee_tiers_partition_at_ten_percent_drop() {
        let mut cfg = MempoolConfig::default();
        cfg.rate_limit_base = 100;
        let mut mp = EncryptedMempool::new(7, cfg);
        mp.submit(tx(1, 0, 100, 1000), 0, 50).unwrap();
        mp.submit(tx(2, 0, 98, 1000), 0, 50).unwrap();
        mp.submit(tx(3, 0, 50, 1000), 0, 50).unwrap();
        mp.submit(tx(4, 0, 48, 1000), 0, 50).unwrap();

        let order_a = mp.get_transactions_for_block(7, 1_000_000, 0);
        let order_b = mp.get_transactions_for_block(7, 1_000_000, 0);
        assert_eq!(order_a, order_b, "same block number must reproduce the same order");
        assert_eq!(order_a.len(), 4);

        // Tier boundaries: {100,98} then {50,48}; verify by max_fee lookup.
        let fee_of = |h: &Hash256| -> Amount {
            mp.pool.values().find(|t| t.tx_hash() == *h).unwrap().max_fee
        };
        let fees: Vec<Amount> = order_a.iter().map(fee_of).collect();
        assert!(fees[0] >= 98 && fees[1] >= 98);
        assert!(fees[2] <= 50 && fees[3] <= 50);
    }

    #[test]
    fn contribute_share_rejects_duplicates() {
        let mut mp = EncryptedMempool::new(7, MempoolConfig::default());
        let t = tx(1, 0, 10, 1000);
        let h = t.tx_hash();
        mp.submit(t, 0, 50).unwrap();
        let share = DecryptionShare { seq: addr(9), share: vec![1], share_index: 0, sig: [0u8; 64], tx_hash: h };
        mp.contribute_share(share.clone()).unwrap();
        assert_eq!(mp.contribute_share(share), Err(MempoolError::DuplicateShare));
    }

    #[test]
    fn threshold_decrypt_reproduces_commitment() {
        let mut mp = EncryptedMempool::new(7, MempoolConfig::default());
        let plaintext = b"plain".to_vec();
        let mut t = tx(1, 0, 10, 1000);
        t.commitment_hash = Hash256::sha256_of(&plaintext);
        let h = t.tx_hash();
        mp.submit(t, 0, 50).unwrap();

        // Two shares XOR-fold back to the plaintext; sequencerCount=3 => threshold=2.
        let half_a: Vec<u8> = plaintext.iter().map(|b| b ^ 0xFF).collect();
        let half_b: Vec<u8> = vec![0xFF; plaintext.len()];
        mp.contribute_share(DecryptionShare { seq: addr(1), share: half_a, share_index: 0, sig: [0u8; 64], tx_hash: h })
            .unwrap();
        assert!(mp.try_decrypt(&h, 3).is_err());
        mp.contribute_share(DecryptionShare { seq: addr(2), share: half_b, share_index: 1, sig: [0u8; 64], tx_hash: h })
            .unwrap();
        let decrypted = mp.try_decrypt(&h, 3).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn prune_expired_removes_and_frees_nonce() {
        let mut mp = EncryptedMempool::new(7, MempoolConfig::default());
        mp.submit(tx(1, 0, 10, 100), 0, 50).unwrap();
        let pruned = mp.prune_expired(200);
        assert_eq!(pruned.len(), 1);
        assert!(mp.is_empty());
        // nonce freed: resubmitting the same (sender, nonce) now succeeds
        mp.submit(tx(1, 0, 10, 1000), 200, 50).unwrap();
    }
}
