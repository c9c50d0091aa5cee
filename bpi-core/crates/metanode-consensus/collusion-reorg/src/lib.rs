//! Sequencer collusion detection and L1 reorg monitoring (spec.md §4.15).
//!
//! Two independent subsystems, each owning its own state under a single
//! mutex in the caller per the concurrency model (spec.md §5): the
//! `CollusionDetector` watches for coordinated sequencer behavior, and
//! the `ReorgMonitor` watches the base chain for reorganizations and
//! drives L2 state recovery. Neither calls into the other or into
//! `sequencer-consensus` directly; callers wire detection results and
//! recovered transaction hashes back out through their own callbacks.

pub mod collusion;
pub mod reorg;

pub use collusion::{
    CollusionDetectionResult, CollusionDetector, CollusionError, CollusionSeverity, CollusionType,
    SequencerAction, TimingCorrelationStats, VotingPatternStats, WhistleblowerReport,
};
pub use reorg::{
    L1BlockInfo, L2AnchorPoint, L2TxLogEntry, ReorgDetectionResult, ReorgMonitor, ReorgRecoveryResult,
};
