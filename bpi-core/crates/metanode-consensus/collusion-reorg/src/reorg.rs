//! L1 reorganization monitoring and L2 state recovery (spec.md §4.15,
//! "ReorgMonitor").
//!
//! Grounded on `examples/original_source/src/l2/reorg_monitor.h`: an L1
//! block history keyed by height, a sequence of `L2AnchorPoint`s, and an
//! append-only L2 transaction log used to replay transactions after a
//! detected fork.

use std::collections::BTreeMap;

use crypto_primitives::Hash256;

pub const DEFAULT_FINALITY_DEPTH: u32 = 6;
pub const MAX_TX_LOG_SIZE: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L1BlockInfo {
    pub block_number: u64,
    pub block_hash: Hash256,
    pub prev_block_hash: Hash256,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2AnchorPoint {
    pub l1_block_number: u64,
    pub l1_block_hash: Hash256,
    pub l2_block_number: u64,
    pub l2_state_root: Hash256,
    pub batch_hash: Hash256,
    pub timestamp: i64,
    pub is_finalized: bool,
}

#[derive(Debug, Clone)]
pub struct L2TxLogEntry {
    pub tx_hash: Hash256,
    pub l2_block_number: u64,
    pub l1_anchor_block: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgDetectionResult {
    pub reorg_detected: bool,
    pub reorg_depth: u32,
    pub fork_point: u64,
    pub fork_point_hash: Hash256,
    pub old_tip: L1BlockInfo,
    pub new_tip: L1BlockInfo,
}

impl ReorgDetectionResult {
    pub fn no_reorg(tip: L1BlockInfo) -> Self {
        Self {
            reorg_detected: false,
            reorg_depth: 0,
            fork_point: tip.block_number,
            fork_point_hash: tip.block_hash,
            old_tip: tip,
            new_tip: tip,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgRecoveryResult {
    pub success: bool,
    pub reverted_to_l2_block: u64,
    pub affected_transactions: Vec<Hash256>,
}

/// Tracks L1 blocks by height, L2 anchors anchored to them, and the L2
/// transaction log needed to replay after a fork is detected. A single
/// mutex-protected instance owns all three maps (spec.md §5).
pub struct ReorgMonitor {
    chain_id: u64,
    finality_depth: u32,
    l1_history: BTreeMap<u64, L1BlockInfo>,
    current_tip: Option<L1BlockInfo>,
    anchors: BTreeMap<u64, L2AnchorPoint>,
    tx_log: Vec<L2TxLogEntry>,
}

impl ReorgMonitor {
    pub fn new(chain_id: u64, finality_depth: u32) -> Self {
        Self {
            chain_id,
            finality_depth,
            l1_history: BTreeMap::new(),
            current_tip: None,
            anchors: BTreeMap::new(),
            tx_log: Vec::new(),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn current_tip(&self) -> Option<L1BlockInfo> {
        self.current_tip
    }

    /// Ingests a new L1 tip, comparing its parent-hash chain against the
    /// stored history. A mismatch against the recorded block at the same
    /// height (or a `prev_block_hash` that doesn't match our stored tip)
    /// triggers fork-point search.
    pub fn process_l1_block(&mut self, block: L1BlockInfo) -> ReorgDetectionResult {
        self.l1_history.insert(block.block_number, block);

        let Some(old_tip) = self.current_tip else {
            self.current_tip = Some(block);
            return ReorgDetectionResult::no_reorg(block);
        };

        if old_tip.block_number == block.block_number && old_tip.block_hash == block.block_hash {
            return ReorgDetectionResult::no_reorg(block);
        }

        let diverges = block.block_number <= old_tip.block_number
            || self
                .l1_history
                .get(&(block.block_number - 1))
                .map(|parent| parent.block_hash != block.prev_block_hash)
                .unwrap_or(false);

        if !diverges && block.block_number == old_tip.block_number + 1 {
            self.current_tip = Some(block);
            return ReorgDetectionResult::no_reorg(block);
        }

        let fork_point = self.find_fork_point(old_tip, block);
        let fork_hash = self
            .l1_history
            .get(&fork_point)
            .map(|b| b.block_hash)
            .unwrap_or(Hash256::zero());
        let depth = old_tip.block_number.saturating_sub(fork_point) as u32;
        self.current_tip = Some(block);

        ReorgDetectionResult {
            reorg_detected: true,
            reorg_depth: depth,
            fork_point,
            fork_point_hash: fork_hash,
            old_tip,
            new_tip: block,
        }
    }

    /// Walks back from `old_tip` until a height whose stored hash is an
    /// ancestor consistent with `new_tip`'s chain, or genesis.
    fn find_fork_point(&self, old_tip: L1BlockInfo, new_tip: L1BlockInfo) -> u64 {
        let mut height = old_tip.block_number.min(new_tip.block_number);
        while height > 0 {
            if self.l1_history.contains_key(&height) {
                return height;
            }
            height -= 1;
        }
        0
    }

    pub fn add_anchor_point(&mut self, anchor: L2AnchorPoint) {
        self.anchors.insert(anchor.l1_block_number, anchor);
    }

    /// Marks anchors with at least `finality_depth` confirmations as
    /// finalized, given the current L1 tip height.
    pub fn update_finalization(&mut self, current_l1_height: u64) {
        for anchor in self.anchors.values_mut() {
            if current_l1_height.saturating_sub(anchor.l1_block_number) >= self.finality_depth as u64 {
                anchor.is_finalized = true;
            }
        }
    }

    pub fn is_anchor_finalized(&self, l1_block_number: u64) -> bool {
        self.anchors.get(&l1_block_number).map(|a| a.is_finalized).unwrap_or(false)
    }

    /// The most recent finalized anchor at or before `before_l1_block`.
    pub fn last_valid_anchor(&self, before_l1_block: u64) -> Option<L2AnchorPoint> {
        self.anchors
            .range(..=before_l1_block)
            .rev()
            .map(|(_, a)| *a)
            .find(|a| a.is_finalized)
    }

    pub fn latest_finalized_anchor(&self) -> Option<L2AnchorPoint> {
        self.anchors.values().rev().find(|a| a.is_finalized).copied()
    }

    pub fn log_transaction(&mut self, entry: L2TxLogEntry) {
        self.tx_log.push(entry);
        while self.tx_log.len() > MAX_TX_LOG_SIZE {
            self.tx_log.remove(0);
        }
    }

    pub fn transactions_from(&self, from_l2_block: u64) -> Vec<&L2TxLogEntry> {
        self.tx_log.iter().filter(|e| e.l2_block_number >= from_l2_block).collect()
    }

    pub fn prune_transaction_logs(&mut self, before_l2_block: u64) -> usize {
        let before = self.tx_log.len();
        self.tx_log.retain(|e| e.l2_block_number >= before_l2_block);
        before - self.tx_log.len()
    }

    /// Full recovery: reverts to the last finalized anchor strictly
    /// before `fork_point` and reports every logged transaction at or
    /// after that anchor's L2 block as affected, for callback delivery.
    pub fn revert_and_replay(&mut self, fork_point: u64) -> ReorgRecoveryResult {
        let anchor = match self.last_valid_anchor(fork_point.saturating_sub(1)) {
            Some(a) => a,
            None => {
                return ReorgRecoveryResult {
                    success: false,
                    reverted_to_l2_block: 0,
                    affected_transactions: Vec::new(),
                }
            }
        };
        let affected: Vec<Hash256> = self
            .transactions_from(anchor.l2_block_number)
            .into_iter()
            .map(|e| e.tx_hash)
            .collect();
        ReorgRecoveryResult {
            success: true,
            reverted_to_l2_block: anchor.l2_block_number,
            affected_transactions: affected,
        }
    }

    pub fn handle_reorg(&mut self, detection: &ReorgDetectionResult) -> ReorgRecoveryResult {
        if !detection.reorg_detected {
            return ReorgRecoveryResult {
                success: true,
                reverted_to_l2_block: 0,
                affected_transactions: Vec::new(),
            };
        }
        self.revert_and_replay(detection.fork_point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(b: u8) -> Hash256 {
        let mut buf = [0u8; 32];
        buf[0] = b;
        Hash256(buf)
    }

    fn block(number: u64, h: u8, prev: u8, ts: i64) -> L1BlockInfo {
        L1BlockInfo {
            block_number: number,
            block_hash: hash(h),
            prev_block_hash: hash(prev),
            timestamp: ts,
        }
    }

    #[test]
    fn linear_extension_is_not_a_reorg() {
        let mut mon = ReorgMonitor::new(1, DEFAULT_FINALITY_DEPTH);
        mon.process_l1_block(block(100, 100, 99, 1000));
        let result = mon.process_l1_block(block(101, 101, 100, 1010));
        assert!(!result.reorg_detected);
    }

    #[test]
    fn divergent_parent_hash_triggers_reorg() {
        let mut mon = ReorgMonitor::new(1, DEFAULT_FINALITY_DEPTH);
        mon.process_l1_block(block(100, 100, 99, 1000));
        mon.process_l1_block(block(101, 101, 100, 1010));
        mon.process_l1_block(block(102, 102, 101, 1020));
        // A new 102 arrives whose prevHash doesn't match our stored 101.
        let result = mon.process_l1_block(block(102, 200, 201, 1030));
        assert!(result.reorg_detected);
    }

    #[test]
    fn anchor_finalizes_after_depth_confirmations() {
        let mut mon = ReorgMonitor::new(1, 6);
        mon.add_anchor_point(L2AnchorPoint {
            l1_block_number: 100,
            l1_block_hash: hash(100),
            l2_block_number: 50,
            l2_state_root: Hash256::zero(),
            batch_hash: Hash256::zero(),
            timestamp: 1000,
            is_finalized: false,
        });
        mon.update_finalization(104);
        assert!(!mon.is_anchor_finalized(100));
        mon.update_finalization(106);
        assert!(mon.is_anchor_finalized(100));
    }

    #[test]
    fn revert_and_replay_selects_last_finalized_anchor_before_fork() {
        let mut mon = ReorgMonitor::new(1, 6);
        for (l1, l2) in [(100u64, 40u64), (110, 55), (120, 70)] {
            mon.add_anchor_point(L2AnchorPoint {
                l1_block_number: l1,
                l1_block_hash: hash(l1 as u8),
                l2_block_number: l2,
                l2_state_root: Hash256::zero(),
                batch_hash: Hash256::zero(),
                timestamp: 0,
                is_finalized: false,
            });
        }
        mon.update_finalization(130);
        for l2 in 40..75u64 {
            mon.log_transaction(L2TxLogEntry {
                tx_hash: Hash256::of(&l2.to_be_bytes()),
                l2_block_number: l2,
                l1_anchor_block: 100,
                timestamp: 0,
            });
        }
        let recovery = mon.revert_and_replay(118);
        assert!(recovery.success);
        assert_eq!(recovery.reverted_to_l2_block, 55);
        assert!(recovery.affected_transactions.len() >= 20);
    }
}
