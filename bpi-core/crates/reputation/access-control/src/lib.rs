//! Blacklist, sliding-window rate limiting, and reputation gating behind one
//! `check_access` call, with a monotonic append-only audit log
//! (spec.md §4.6).

use std::collections::VecDeque;
use std::sync::Mutex;

use crypto_primitives::{Addr, Hash256, Timestamp};
use cvm_kvstore::KvStore;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccessControlError {
    #[error("storage error: {0}")]
    Storage(#[from] cvm_kvstore::KvError),
}

pub type Result<T> = std::result::Result<T, AccessControlError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Grant,
    DenyBlacklisted,
    DenyRateLimited,
    DenyInsufficientReputation,
}

impl Decision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Decision::Grant)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessControlAuditEntry {
    pub id: u64,
    pub requester: Addr,
    pub op_type: String,
    pub decision: Decision,
    pub required_rep: i16,
    pub actual_rep: i16,
    pub resource: String,
    pub tx_hash: Hash256,
    pub ts: Timestamp,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub reason_code: u32,
    /// `<= 0` means permanent.
    pub expiry: Timestamp,
}

impl BlacklistEntry {
    pub fn is_active(&self, now: Timestamp) -> bool {
        self.expiry <= 0 || self.expiry > now
    }
}

/// Per-operation sliding-window rate limit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub window_secs: i64,
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self { max_requests: 100, window_secs: 60 }
    }
}

/// Audit log entries are keyed `'Q' + bigEndian(id)` so that ascending ids
/// produce ascending storage keys (spec.md §8 invariant), mirroring the
/// `DB_ACCESS_AUDIT = 'Q'` prefix in `access_control_audit.cpp`.
fn audit_key(id: u64) -> Vec<u8> {
    let mut key = vec![b'Q'];
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Blacklist entries are keyed `'K' + addr`, matching `DB_BLACKLIST = 'K'`.
fn blacklist_key(addr: &Addr) -> Vec<u8> {
    let mut key = vec![b'K'];
    key.extend_from_slice(&addr.0);
    key
}

const RECENT_ENTRIES_CAP: usize = 256;

pub struct AccessControlAuditor {
    kv: KvStore,
    rate_limits: DashMap<(Addr, String), VecDeque<Timestamp>>,
    rules: DashMap<String, RateLimitRule>,
    default_rule: RateLimitRule,
    recent: Mutex<VecDeque<AccessControlAuditEntry>>,
}

impl AccessControlAuditor {
    pub fn new(kv: KvStore) -> Self {
        Self {
            kv,
            rate_limits: DashMap::new(),
            rules: DashMap::new(),
            default_rule: RateLimitRule::default(),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_rule(&self, op_type: impl Into<String>, rule: RateLimitRule) {
        self.rules.insert(op_type.into(), rule);
    }

    fn rule_for(&self, op_type: &str) -> RateLimitRule {
        self.rules.get(op_type).map(|r| *r).unwrap_or(self.default_rule)
    }

    /// `expiry <= 0` is permanent. Overwrites any existing entry; durable.
    pub fn add_to_blacklist(&self, addr: Addr, reason_code: u32, expiry: Timestamp) -> Result<()> {
        self.kv.put_json(blacklist_key(&addr), &BlacklistEntry { reason_code, expiry })?;
        Ok(())
    }

    /// Idempotent: removing an address that isn't blacklisted is a no-op.
    pub fn remove_from_blacklist(&self, addr: &Addr) -> Result<()> {
        self.kv.del(blacklist_key(addr))?;
        Ok(())
    }

    /// Self-cleaning: an expired entry is treated as absent and physically
    /// deleted on the lookup that observes it.
    pub fn is_blacklisted(&self, addr: &Addr, now: Timestamp) -> Result<bool> {
        match self.kv.get_json::<BlacklistEntry>(blacklist_key(addr))? {
            Some(entry) if entry.is_active(now) => Ok(true),
            Some(_) => {
                self.kv.del(blacklist_key(addr))?;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn check_rate_limit(&self, requester: Addr, op_type: &str, now: Timestamp) -> bool {
        let rule = self.rule_for(op_type);
        let mut window = self.rate_limits.entry((requester, op_type.to_string())).or_default();
        while let Some(front) = window.front() {
            if now - *front > rule.window_secs {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() as u32 >= rule.max_requests {
            true
        } else {
            window.push_back(now);
            false
        }
    }

    fn record(&self, entry: AccessControlAuditEntry) -> Result<AccessControlAuditEntry> {
        self.kv.put_json(audit_key(entry.id), &entry)?;
        let mut recent = self.recent.lock().unwrap();
        recent.push_back(entry.clone());
        if recent.len() > RECENT_ENTRIES_CAP {
            recent.pop_front();
        }
        Ok(entry)
    }

    /// Evaluation order: blacklist, then rate limit, then reputation.
    pub fn check_access(
        &self,
        requester: Addr,
        op_type: &str,
        required_rep: i16,
        actual_rep: i16,
        resource: impl Into<String>,
        tx_hash: Hash256,
        now: Timestamp,
    ) -> Result<AccessControlAuditEntry> {
        let id = self.kv.next_id(b"__access_audit_ctr")?;
        let resource = resource.into();

        if self.is_blacklisted(&requester, now)? {
            return self.record(AccessControlAuditEntry {
                id,
                requester,
                op_type: op_type.to_string(),
                decision: Decision::DenyBlacklisted,
                required_rep,
                actual_rep,
                resource,
                tx_hash,
                ts: now,
            });
        }

        if self.check_rate_limit(requester, op_type, now) {
            return self.record(AccessControlAuditEntry {
                id,
                requester,
                op_type: op_type.to_string(),
                decision: Decision::DenyRateLimited,
                required_rep,
                actual_rep,
                resource,
                tx_hash,
                ts: now,
            });
        }

        let decision = if actual_rep < required_rep { Decision::DenyInsufficientReputation } else { Decision::Grant };
        self.record(AccessControlAuditEntry {
            id,
            requester,
            op_type: op_type.to_string(),
            decision,
            required_rep,
            actual_rep,
            resource,
            tx_hash,
            ts: now,
        })
    }

    pub fn recent_entries(&self) -> Vec<AccessControlAuditEntry> {
        self.recent.lock().unwrap().iter().cloned().collect()
    }

    pub fn audit_trail(&self) -> Vec<AccessControlAuditEntry> {
        self.kv.scan_prefix_json::<AccessControlAuditEntry>([b'Q']).map(|(_, e)| e).collect()
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
    fn blacklist_denies_before_anything_else() {
        let auditor = AccessControlAuditor::new(KvStore::temporary("ac1").unwrap());
        let a = addr(1);
        auditor.add_to_blacklist(a, 1, 0).unwrap();
        let entry = auditor.check_access(a, "transfer", 0, 100, "res", Hash256::of(b"tx"), 10).unwrap();
        assert_eq!(entry.decision, Decision::DenyBlacklisted);
    }

    #[test]
    fn blacklist_expiry_self_cleans() {
        let auditor = AccessControlAuditor::new(KvStore::temporary("ac2").unwrap());
        let a = addr(1);
        auditor.add_to_blacklist(a, 1, 100).unwrap();
        assert!(!auditor.is_blacklisted(&a, 200).unwrap());
        // second lookup confirms the entry was actually deleted, not just skipped
        assert!(auditor.kv.get_json::<BlacklistEntry>(blacklist_key(&a)).unwrap().is_none());
    }

    #[test]
    fn rate_limit_denies_after_threshold() {
        let auditor = AccessControlAuditor::new(KvStore::temporary("ac3").unwrap());
        auditor.set_rule("transfer", RateLimitRule { max_requests: 2, window_secs: 60 });
        let a = addr(1);
        for _ in 0..2 {
            let e = auditor.check_access(a, "transfer", 0, 100, "res", Hash256::of(b"tx"), 10).unwrap();
            assert_eq!(e.decision, Decision::Grant);
        }
        let e = auditor.check_access(a, "transfer", 0, 100, "res", Hash256::of(b"tx"), 10).unwrap();
        assert_eq!(e.decision, Decision::DenyRateLimited);
    }

    #[test]
    fn reputation_gates_after_rate_limit_and_blacklist_pass() {
        let auditor = AccessControlAuditor::new(KvStore::temporary("ac4").unwrap());
        let e = auditor.check_access(addr(1), "vote", 80, 50, "res", Hash256::of(b"tx"), 10).unwrap();
        assert_eq!(e.decision, Decision::DenyInsufficientReputation);
    }

    #[test]
    fn audit_ids_are_monotonic_and_byte_ordered() {
        let auditor = AccessControlAuditor::new(KvStore::temporary("ac5").unwrap());
        for _ in 0..5 {
            auditor.check_access(addr(1), "x", 0, 100, "res", Hash256::of(b"tx"), 10).unwrap();
        }
        let trail = auditor.audit_trail();
        assert_eq!(trail.len(), 5);
        for w in trail.windows(2) {
            assert!(w[0].id < w[1].id);
        }
    }
}
