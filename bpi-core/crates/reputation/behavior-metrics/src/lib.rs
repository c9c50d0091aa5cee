//! Per-address trade/activity statistics and the derived diversity, volume,
//! pattern, and fraud sub-scores that roll up into `final_reputation`
//! (spec.md §4.3).

use std::collections::HashSet;

use crypto_primitives::{Addr, Amount, Hash256, Timestamp};
use cvm_kvstore::KvStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BehaviorMetricsError {
    #[error("storage error: {0}")]
    Storage(#[from] cvm_kvstore::KvError),
}

pub type Result<T> = std::result::Result<T, BehaviorMetricsError>;

const COIN: f64 = 100_000_000.0;
const SECS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0;
const BLOCK_TIME_SECS: i64 = 150;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub partner: Addr,
    pub volume: Amount,
    pub success: bool,
    pub disputed: bool,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorMetrics {
    pub address: Addr,
    pub total_trades: u64,
    pub successful_trades: u64,
    pub disputed_trades: u64,
    pub total_volume: Amount,
    pub unique_partners: HashSet<Addr>,
    pub account_creation: Timestamp,
    pub last_activity: Timestamp,
    /// Bounded retention: only the most recent trades are kept for pattern
    /// detection; older ones still count toward the running totals above.
    pub trade_history: Vec<TradeRecord>,
    pub fraud_count: u32,
    pub last_fraud_timestamp: Timestamp,
    pub total_fraud_penalty: i32,
    pub fraud_txhashes: Vec<Hash256>,
}

/// How many recent trades `trade_history` retains (spec.md §3 "bounded by a
/// retention policy").
const TRADE_HISTORY_CAP: usize = 500;

impl BehaviorMetrics {
    pub fn new(address: Addr, now: Timestamp) -> Self {
        Self {
            address,
            total_trades: 0,
            successful_trades: 0,
            disputed_trades: 0,
            total_volume: 0,
            unique_partners: HashSet::new(),
            account_creation: now,
            last_activity: now,
            trade_history: Vec::new(),
            fraud_count: 0,
            last_fraud_timestamp: 0,
            total_fraud_penalty: 0,
            fraud_txhashes: Vec::new(),
        }
    }

    pub fn add_trade(&mut self, trade: TradeRecord) {
        self.total_trades += 1;
        if trade.success {
            self.successful_trades += 1;
        }
        if trade.disputed {
            self.disputed_trades += 1;
        }
        self.total_volume += trade.volume;
        self.unique_partners.insert(trade.partner);
        self.last_activity = trade.timestamp;
        self.trade_history.push(trade);
        if self.trade_history.len() > TRADE_HISTORY_CAP {
            self.trade_history.remove(0);
        }
    }

    pub fn add_fraud_record(&mut self, tx_hash: Hash256, penalty: i32, timestamp: Timestamp) {
        self.fraud_count += 1;
        self.last_fraud_timestamp = timestamp;
        self.total_fraud_penalty += penalty;
        self.fraud_txhashes.push(tx_hash);
    }

    pub fn diversity_score(&self) -> f64 {
        if self.total_trades == 0 {
            return 0.0;
        }
        let expected = (self.total_trades as f64).sqrt();
        (self.unique_partners.len() as f64 / expected).min(1.0)
    }

    pub fn volume_score(&self) -> f64 {
        let volume_cas = self.total_volume as f64 / COIN;
        ((volume_cas + 1.0).log10() / 6.0).min(1.0)
    }

    /// Coefficient of variation over inter-trade intervals; CV < 0.5 is
    /// treated as suspiciously regular trading and incurs a 50% penalty.
    pub fn pattern_score(&self) -> f64 {
        if self.trade_history.len() < 10 {
            return 1.0;
        }
        let intervals: Vec<f64> = self
            .trade_history
            .windows(2)
            .map(|w| (w[1].timestamp - w[0].timestamp) as f64)
            .filter(|&d| d > 0.0)
            .collect();
        if intervals.is_empty() {
            return 1.0;
        }
        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        let variance = intervals.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
        let cv = variance.sqrt() / mean;
        if cv < 0.5 {
            0.5
        } else {
            1.0
        }
    }

    pub fn base_reputation(&self, now: Timestamp) -> i16 {
        if self.total_trades == 0 {
            return 50;
        }
        let mut score = 0.0f64;
        let success_rate = self.successful_trades as f64 / self.total_trades as f64;
        score += success_rate * 40.0;

        let account_age = (now - self.account_creation).max(0) as f64;
        let age_years = account_age / SECS_PER_YEAR;
        score += (age_years / 2.0).min(1.0) * 20.0;

        score += self.volume_score() * 15.0;

        let inactive = (now - self.last_activity).max(0) as f64;
        let activity_score = (-inactive / (90.0 * 24.0 * 3600.0)).exp();
        score += activity_score * 15.0;

        let social_score = (self.unique_partners.len() as f64 / 100.0).min(1.0);
        score += social_score * 10.0;

        if self.total_trades > 0 {
            let dispute_rate = self.disputed_trades as f64 / self.total_trades as f64;
            score *= 1.0 - dispute_rate;
        }
        score.clamp(0.0, 100.0) as i16
    }

    /// Per-fraud penalty bands (`0.7/0.5/0.3/0.0`) with a time decay that
    /// improves the score back up by up to 2x as blocks pass without a
    /// repeat offense.
    pub fn fraud_score(&self, now: Timestamp) -> f64 {
        if self.fraud_count == 0 {
            return 1.0;
        }
        let mut base_penalty = match self.fraud_count {
            1 => 0.7,
            2 => 0.5,
            3 | 4 => 0.3,
            _ => 0.0,
        };
        if self.last_fraud_timestamp > 0 {
            let time_since = (now - self.last_fraud_timestamp).max(0);
            let blocks_since = time_since / BLOCK_TIME_SECS;
            let decay_factor = (1.0 + (blocks_since as f64 / 10_000.0) * 0.1).min(2.0);
            base_penalty = (base_penalty * decay_factor).min(1.0);
        }
        base_penalty
    }

    /// `clamp(base · diversity · volume · pattern · fraud, 0, 100)`.
    pub fn final_reputation(&self, now: Timestamp) -> i16 {
        let base = self.base_reputation(now) as f64;
        let score = base * self.diversity_score() * self.volume_score() * self.pattern_score() * self.fraud_score(now);
        score.clamp(0.0, 100.0) as i16
    }
}

fn metrics_key(addr: &Addr) -> Vec<u8> {
    format!("behavior_{}", addr.to_hex()).into_bytes()
}

/// Persisted store of per-address behavior metrics.
pub struct BehaviorMetricsStore {
    kv: KvStore,
}

impl BehaviorMetricsStore {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    pub fn load_or_new(&self, addr: Addr, now: Timestamp) -> Result<BehaviorMetrics> {
        Ok(self.kv.get_json(metrics_key(&addr))?.unwrap_or_else(|| BehaviorMetrics::new(addr, now)))
    }

    pub fn save(&self, metrics: &BehaviorMetrics) -> Result<()> {
        self.kv.put_json(metrics_key(&metrics.address), metrics)?;
        Ok(())
    }

    pub fn record_trade(&self, addr: Addr, trade: TradeRecord, now: Timestamp) -> Result<BehaviorMetrics> {
        let mut metrics = self.load_or_new(addr, now)?;
        metrics.add_trade(trade);
        self.save(&metrics)?;
        Ok(metrics)
    }

    pub fn record_fraud(&self, addr: Addr, tx_hash: Hash256, penalty: i32, now: Timestamp) -> Result<BehaviorMetrics> {
        let mut metrics = self.load_or_new(addr, now)?;
        metrics.add_fraud_record(tx_hash, penalty, now);
        self.save(&metrics)?;
        Ok(metrics)
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
    fn new_account_is_neutral() {
        let m = BehaviorMetrics::new(addr(1), 0);
        assert_eq!(m.base_reputation(0), 50);
        assert_eq!(m.final_reputation(0), 0); // diversity/volume both 0 for no trades
    }

    #[test]
    fn diversity_caps_at_one() {
        let mut m = BehaviorMetrics::new(addr(1), 0);
        for i in 0..4u8 {
            m.add_trade(TradeRecord { partner: addr(100 + i), volume: 1, success: true, disputed: false, timestamp: i as i64 });
        }
        // 4 partners / sqrt(4) = 2.0 -> capped to 1.0
        assert_eq!(m.diversity_score(), 1.0);
    }

    #[test]
    fn fraud_score_bands_and_decay() {
        let mut m = BehaviorMetrics::new(addr(1), 0);
        m.add_fraud_record(Hash256::of(b"f1"), 10, 1_000_000);
        assert!((m.fraud_score(1_000_000) - 0.7).abs() < 1e-9);
        // far in the future: decay capped at 2x, penalty capped at 1.0 (full recovery floor 0.7*2=1.4->1.0)
        assert!((m.fraud_score(1_000_000 + 10_000 * BLOCK_TIME_SECS * 100) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn pattern_score_flags_regular_trading() {
        let mut m = BehaviorMetrics::new(addr(1), 0);
        for i in 0..12 {
            m.add_trade(TradeRecord { partner: addr(i), volume: 1, success: true, disputed: false, timestamp: i as i64 * 100 });
        }
        assert_eq!(m.pattern_score(), 0.5);
    }

    #[test]
    fn store_roundtrips() {
        let store = BehaviorMetricsStore::new(KvStore::temporary("bm").unwrap());
        let a = addr(7);
        store.record_trade(a, TradeRecord { partner: addr(8), volume: 100, success: true, disputed: false, timestamp: 10 }, 10).unwrap();
        let loaded = store.load_or_new(a, 10).unwrap();
        assert_eq!(loaded.total_trades, 1);
    }
}
