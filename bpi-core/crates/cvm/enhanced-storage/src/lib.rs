//! Reputation-weighted contract storage (spec.md §4.8).
//!
//! Grounded on `examples/original_source/src/cvm/enhanced_storage.cpp`:
//! reputation-scaled read/write gas costs, reputation-derived quotas,
//! trust-tagged regions, an atomic staged-write transaction, storage rent
//! cleanup, and a placeholder storage-proof fingerprint (not a real
//! Merkle-Patricia proof — spec.md §9 open question).

use std::collections::{BTreeMap, HashMap};

use crypto_primitives::{Addr, Hash256, Timestamp};
use cvm_kvstore::{Batch, KvStore};
use cvm_vm::ContractStorage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage quota exceeded for {0}: {1}/{2} bytes")]
    QuotaExceeded(Addr, u64, u64),
    #[error("caller reputation {0} below minimum {1} for this region")]
    InsufficientReputation(i16, i16),
    #[error("trust-tagged region {0}/{1} already exists")]
    RegionExists(Addr, String),
    #[error("trust-tagged region {0}/{1} not found")]
    RegionNotFound(Addr, String),
    #[error("nested atomic operation is not allowed")]
    NestedAtomic,
    #[error("no atomic operation is in progress")]
    NoAtomicInProgress,
    #[error("storage error: {0}")]
    Kv(#[from] cvm_kvstore::KvError),
}

pub type Result<T> = std::result::Result<T, StorageError>;

pub const BASE_STORAGE_QUOTA: u64 = 1_000_000;
pub const REPUTATION_QUOTA_PER_POINT: u64 = 10_000;
pub const BASE_STORAGE_READ_COST: u64 = 200;
pub const BASE_STORAGE_WRITE_COST: u64 = 5_000;
pub const TRUST_CACHE_EXPIRY_SECS: i64 = 3_600;
pub const STORAGE_RENT_PERIOD_BLOCKS: i32 = 100_000;

/// The caller's reputation as seen by storage pricing/gating. Supplied by
/// the CVM execution layer for every call.
#[derive(Debug, Clone, Copy)]
pub struct TrustContext {
    pub caller_reputation: i16,
}

/// Reputation-scaled cost multiplier, matching the five bands in
/// `enhanced_storage.cpp`'s header comment.
pub fn cost_multiplier(reputation: i16) -> f64 {
    match reputation {
        r if r >= 80 => 0.1,
        r if r >= 60 => 0.5,
        r if r >= 40 => 1.0,
        r if r >= 20 => 1.5,
        _ => 2.0,
    }
}

pub fn read_cost(reputation: i16) -> u64 {
    (BASE_STORAGE_READ_COST as f64 * cost_multiplier(reputation)) as u64
}

pub fn write_cost(reputation: i16) -> u64 {
    (BASE_STORAGE_WRITE_COST as f64 * cost_multiplier(reputation)) as u64
}

/// `base + rep · 10000` bytes (spec.md §4.8 "Quota").
pub fn default_quota(reputation: i16) -> u64 {
    BASE_STORAGE_QUOTA + reputation.max(0) as u64 * REPUTATION_QUOTA_PER_POINT
}

#[derive(Debug, Clone)]
struct TrustTaggedRegion {
    min_reputation: i16,
    data: BTreeMap<Hash256, Hash256>,
}

#[derive(Debug, Clone, Copy)]
struct TrustCacheEntry {
    score: i16,
    cached_at: Timestamp,
}

#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub trust_cache_hits: u64,
    pub trust_cache_misses: u64,
    pub total_keys: u64,
}

/// Four-element fingerprint proof. Not a real Merkle-Patricia proof — see
/// spec.md §9 open question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageProof {
    pub contract_hash: Hash256,
    pub key_hash: Hash256,
    pub value_hash: Hash256,
    pub combined_hash: Hash256,
}

pub fn generate_storage_proof(contract: Addr, key: Hash256, value: Hash256) -> StorageProof {
    let contract_hash = Hash256::of(&contract.0);
    let key_hash = Hash256::of(&key.0);
    let value_hash = Hash256::of(&value.0);
    let mut combined = Vec::with_capacity(96);
    combined.extend_from_slice(&contract.0);
    combined.extend_from_slice(&key.0);
    combined.extend_from_slice(&value.0);
    let combined_hash = Hash256::of(&combined);
    StorageProof { contract_hash, key_hash, value_hash, combined_hash }
}

pub fn verify_storage_proof(contract: Addr, key: Hash256, value: Hash256, proof: &StorageProof) -> bool {
    generate_storage_proof(contract, key, value) == *proof
}

fn storage_key(contract: &Addr, key: &Hash256) -> Vec<u8> {
    let mut k = format!("cvmstore_{}_", contract.to_hex()).into_bytes();
    k.extend_from_slice(&key.0);
    k
}

fn region_key_prefix(contract: &Addr, region_id: &str) -> String {
    format!("{}:{}", contract.to_hex(), region_id)
}

#[derive(Clone, Copy)]
enum PendingOp {
    Store,
}

/// Per-(addr,key) staged write recorded while an atomic operation is open.
struct StagedWrite {
    contract: Addr,
    key: Hash256,
    value: Hash256,
    #[allow(dead_code)]
    kind: PendingOp,
}

/// Contract storage with reputation-weighted cost, quotas, trust-tagged
/// regions, one level of atomic staging, and storage-proof generation.
pub struct EnhancedStorage {
    kv: KvStore,
    usage_bytes: HashMap<Addr, u64>,
    quota_overrides: HashMap<Addr, u64>,
    regions: HashMap<String, TrustTaggedRegion>,
    trust_cache: HashMap<Addr, TrustCacheEntry>,
    rent_balances: HashMap<Addr, u64>,
    stats: StorageStats,
    atomic_staged: Option<Vec<StagedWrite>>,
}

impl EnhancedStorage {
    pub fn new(kv: KvStore) -> Self {
        Self {
            kv,
            usage_bytes: HashMap::new(),
            quota_overrides: HashMap::new(),
            regions: HashMap::new(),
            trust_cache: HashMap::new(),
            rent_balances: HashMap::new(),
            stats: StorageStats::default(),
            atomic_staged: None,
        }
    }

    pub fn stats(&self) -> &StorageStats {
        &self.stats
    }

    fn raw_load(&mut self, contract: Addr, key: Hash256) -> Hash256 {
        if let Some(staged) = &self.atomic_staged {
            if let Some(w) = staged.iter().rev().find(|w| w.contract == contract && w.key == key) {
                self.stats.cache_hits += 1;
                return w.value;
            }
        }
        match self.kv.get(storage_key(&contract, &key)) {
            Ok(Some(bytes)) if bytes.len() == 32 => {
                self.stats.cache_hits += 1;
                let mut b = [0u8; 32];
                b.copy_from_slice(&bytes);
                Hash256(b)
            }
            _ => {
                self.stats.cache_misses += 1;
                Hash256::zero()
            }
        }
    }

    fn raw_store(&mut self, contract: Addr, key: Hash256, value: Hash256) -> Result<()> {
        if let Some(staged) = &mut self.atomic_staged {
            staged.push(StagedWrite { contract, key, value, kind: PendingOp::Store });
            return Ok(());
        }
        self.kv.put(storage_key(&contract, &key), value.0)?;
        *self.usage_bytes.entry(contract).or_insert(0) += 32;
        self.stats.total_keys += 1;
        Ok(())
    }

    pub fn get_current_usage(&self, contract: &Addr) -> u64 {
        *self.usage_bytes.get(contract).unwrap_or(&0)
    }

    pub fn get_quota(&self, contract: &Addr, reputation: i16) -> u64 {
        self.quota_overrides.get(contract).copied().unwrap_or_else(|| default_quota(reputation))
    }

    pub fn set_quota_override(&mut self, contract: Addr, quota: u64) {
        self.quota_overrides.insert(contract, quota);
    }

    pub fn check_storage_limit(&self, contract: &Addr, requested_bytes: u64, reputation: i16) -> bool {
        self.get_current_usage(contract) + requested_bytes <= self.get_quota(contract, reputation)
    }

    /// Load with a reputation gate and cost computation (spec.md §4.8
    /// `LoadWithTrust`). The gas cost is reported for the VM layer to
    /// charge; this call itself never fails on cost, only on gate.
    pub fn load_with_trust(&mut self, contract: Addr, key: Hash256, trust: TrustContext) -> Result<(Hash256, u64)> {
        if trust.caller_reputation < 10 {
            return Err(StorageError::InsufficientReputation(trust.caller_reputation, 10));
        }
        let cost = read_cost(trust.caller_reputation);
        let value = self.raw_load(contract, key);
        Ok((value, cost))
    }

    /// Store with a reputation-derived quota check (spec.md §4.8
    /// `StoreWithTrust`).
    pub fn store_with_trust(
        &mut self,
        contract: Addr,
        key: Hash256,
        value: Hash256,
        trust: TrustContext,
    ) -> Result<u64> {
        let quota = self.get_quota(&contract, trust.caller_reputation);
        let usage = self.get_current_usage(&contract);
        if usage + 32 > quota {
            return Err(StorageError::QuotaExceeded(contract, usage + 32, quota));
        }
        let cost = write_cost(trust.caller_reputation);
        self.raw_store(contract, key, value)?;
        Ok(cost)
    }

    // --- Trust-tagged regions ---

    pub fn create_trust_tagged_region(&mut self, contract: Addr, region_id: &str, min_reputation: i16) -> Result<()> {
        let key = region_key_prefix(&contract, region_id);
        if self.regions.contains_key(&key) {
            return Err(StorageError::RegionExists(contract, region_id.to_string()));
        }
        self.regions.insert(key, TrustTaggedRegion { min_reputation, data: BTreeMap::new() });
        Ok(())
    }

    pub fn can_access_region(&self, contract: &Addr, region_id: &str, caller_reputation: i16) -> Result<bool> {
        let key = region_key_prefix(contract, region_id);
        let region = self.regions.get(&key).ok_or_else(|| StorageError::RegionNotFound(*contract, region_id.to_string()))?;
        Ok(caller_reputation >= region.min_reputation)
    }

    pub fn store_trust_tagged(
        &mut self,
        contract: Addr,
        region_id: &str,
        key: Hash256,
        value: Hash256,
        trust: TrustContext,
    ) -> Result<()> {
        if !self.can_access_region(&contract, region_id, trust.caller_reputation)? {
            return Err(StorageError::InsufficientReputation(
                trust.caller_reputation,
                self.regions[&region_key_prefix(&contract, region_id)].min_reputation,
            ));
        }
        let rk = region_key_prefix(&contract, region_id);
        self.regions.get_mut(&rk).unwrap().data.insert(key, value);
        Ok(())
    }

    pub fn load_trust_tagged(
        &self,
        contract: Addr,
        region_id: &str,
        key: Hash256,
        trust: TrustContext,
    ) -> Result<Option<Hash256>> {
        if !self.can_access_region(&contract, region_id, trust.caller_reputation)? {
            return Ok(None);
        }
        let rk = region_key_prefix(&contract, region_id);
        Ok(self.regions.get(&rk).and_then(|r| r.data.get(&key).copied()))
    }

    // --- Trust-score cache ---

    pub fn cache_trust_score(&mut self, addr: Addr, score: i16, now: Timestamp) {
        self.trust_cache.insert(addr, TrustCacheEntry { score, cached_at: now });
    }

    pub fn get_cached_trust_score(&mut self, addr: &Addr, now: Timestamp) -> Option<i16> {
        if let Some(entry) = self.trust_cache.get(addr) {
            if now - entry.cached_at < TRUST_CACHE_EXPIRY_SECS {
                self.stats.trust_cache_hits += 1;
                return Some(entry.score);
            }
        }
        self.trust_cache.remove(addr);
        self.stats.trust_cache_misses += 1;
        None
    }

    pub fn invalidate_trust_cache(&mut self, addr: &Addr) {
        self.trust_cache.remove(addr);
    }

    pub fn cleanup_trust_cache(&mut self, max_age_secs: i64, now: Timestamp) {
        self.trust_cache.retain(|_, e| now - e.cached_at <= max_age_secs);
    }

    // --- Storage rent ---

    pub fn pay_storage_rent(&mut self, contract: Addr, amount: u64) {
        *self.rent_balances.entry(contract).or_insert(0) += amount;
    }

    pub fn rent_balance(&self, contract: &Addr) -> u64 {
        *self.rent_balances.get(&contract).unwrap_or(&0)
    }

    /// Drops tracking for contracts whose rent balance is exhausted.
    pub fn cleanup_expired_storage(&mut self) -> usize {
        let expired: Vec<Addr> = self.rent_balances.iter().filter(|(_, &bal)| bal == 0).map(|(a, _)| *a).collect();
        for addr in &expired {
            self.usage_bytes.remove(addr);
            self.quota_overrides.remove(addr);
            self.rent_balances.remove(addr);
        }
        expired.len()
    }

    /// Drops tracking for contracts whose cached reputation is below
    /// `min_reputation`.
    pub fn cleanup_low_reputation_storage(&mut self, min_reputation: i16, now: Timestamp) -> usize {
        let mut cleaned = 0usize;
        let contracts: Vec<Addr> = self.usage_bytes.keys().copied().collect();
        for addr in contracts {
            if let Some(rep) = self.get_cached_trust_score(&addr, now) {
                if rep < min_reputation {
                    self.usage_bytes.remove(&addr);
                    self.quota_overrides.remove(&addr);
                    self.rent_balances.remove(&addr);
                    cleaned += 1;
                }
            }
        }
        cleaned
    }

    // --- Atomic snapshot ---

    pub fn begin_atomic(&mut self) -> Result<()> {
        if self.atomic_staged.is_some() {
            return Err(StorageError::NestedAtomic);
        }
        self.atomic_staged = Some(Vec::new());
        Ok(())
    }

    pub fn commit_atomic(&mut self) -> Result<()> {
        let staged = self.atomic_staged.take().ok_or(StorageError::NoAtomicInProgress)?;
        let mut batch = Batch::new();
        for w in &staged {
            batch.put(storage_key(&w.contract, &w.key), w.value.0);
            *self.usage_bytes.entry(w.contract).or_insert(0) += 32;
        }
        self.kv.commit(batch)?;
        self.stats.total_keys += staged.len() as u64;
        Ok(())
    }

    pub fn rollback_atomic(&mut self) -> Result<()> {
        self.atomic_staged.take().ok_or(StorageError::NoAtomicInProgress)?;
        Ok(())
    }

    pub fn in_atomic(&self) -> bool {
        self.atomic_staged.is_some()
    }
}

/// Plain `ContractStorage` for the VM's SLOAD/SSTORE, bypassing quota and
/// reputation gating (callers that need those call the `_with_trust`
/// methods directly before/after VM execution and price accordingly).
impl ContractStorage for EnhancedStorage {
    fn sload(&mut self, contract: Addr, key: Hash256) -> Hash256 {
        self.raw_load(contract, key)
    }

    fn sstore(&mut self, contract: Addr, key: Hash256, value: Hash256) -> std::result::Result<(), String> {
        self.raw_store(contract, key, value).map_err(|e| e.to_string())
    }
}
