//! L2 transaction and block types (spec.md §3 `L2Transaction`/`L2Block`).
//!
//! Grounded on `examples/original_source/src/l2/l2_transaction.h` and
//! `l2_block_validator.cpp`: the transaction type tag, the header
//! invariants checked by `L2Block::IsValid`, and the deterministic
//! hash-over-all-fields transaction id.

use std::collections::{HashMap, HashSet};

use crypto_primitives::{Addr, Amount, Hash256, Timestamp};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const MAX_EXTRA_DATA_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum L2TxType {
    Transfer,
    Deploy,
    Call,
    Deposit,
    BurnMint,
    ForcedInclusion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L2Transaction {
    pub from: Addr,
    pub to: Option<Addr>,
    pub value: Amount,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u64,
    pub data: Vec<u8>,
    pub tx_type: L2TxType,
    pub l2_chain_id: u64,
    pub access_list: Vec<Addr>,
    pub signature: [u8; 64],
}

impl L2Transaction {
    /// Deterministic hash over every field except the signature itself;
    /// the signature covers this hash (spec.md §3).
    pub fn signing_hash(&self) -> Hash256 {
        let mut hasher = Sha256::new();
        hasher.update(self.from.0);
        if let Some(to) = self.to {
            hasher.update([1u8]);
            hasher.update(to.0);
        } else {
            hasher.update([0u8]);
        }
        hasher.update(self.value.to_be_bytes());
        hasher.update(self.nonce.to_be_bytes());
        hasher.update(self.gas_limit.to_be_bytes());
        hasher.update(self.gas_price.to_be_bytes());
        hasher.update(&self.data);
        hasher.update([tx_type_tag(self.tx_type)]);
        hasher.update(self.l2_chain_id.to_be_bytes());
        for a in &self.access_list {
            hasher.update(a.0);
        }
        let out: [u8; 32] = hasher.finalize().into();
        Hash256(out)
    }

    /// Hash identifying this transaction including its signature.
    pub fn hash(&self) -> Hash256 {
        let mut hasher = Sha256::new();
        hasher.update(self.signing_hash().0);
        hasher.update(self.signature);
        let out: [u8; 32] = hasher.finalize().into();
        Hash256(out)
    }
}

fn tx_type_tag(t: L2TxType) -> u8 {
    match t {
        L2TxType::Transfer => 0,
        L2TxType::Deploy => 1,
        L2TxType::Call => 2,
        L2TxType::Deposit => 3,
        L2TxType::BurnMint => 4,
        L2TxType::ForcedInclusion => 5,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L2BlockHeader {
    pub number: u64,
    pub parent_hash: Hash256,
    pub state_root: Hash256,
    pub tx_root: Hash256,
    pub sequencer: Addr,
    pub timestamp: Timestamp,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub extra_data: Vec<u8>,
    pub slot: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerSignature {
    pub signer: Addr,
    pub signature: [u8; 64],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L2Block {
    pub header: L2BlockHeader,
    pub transactions: Vec<L2Transaction>,
    pub signatures: Vec<SequencerSignature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BlockValidationError {
    #[error("extra_data exceeds {MAX_EXTRA_DATA_BYTES} bytes")]
    ExtraDataTooLarge,
    #[error("block number must be parent.number + 1")]
    BadNumber,
    #[error("block timestamp must be strictly greater than the parent's")]
    NonMonotonicTimestamp,
    #[error("block timestamp is more than 15s in the future")]
    TimestampTooFarFuture,
    #[error("gasLimit moved by more than parent.gasLimit/1024")]
    GasLimitDelta,
    #[error("gasUsed exceeds gasLimit")]
    GasUsedExceedsLimit,
    #[error("sum of per-tx gasLimit exceeds block gasLimit")]
    TxGasOversubscribed,
    #[error("duplicate transaction hash in block")]
    DuplicateTxHash,
    #[error("per-sender nonces are not strictly sequential")]
    NonSequentialNonce,
    #[error("duplicate signer in block signatures")]
    DuplicateSigner,
}

impl L2Block {
    pub fn hash(&self) -> Hash256 {
        let mut hasher = Sha256::new();
        hasher.update(self.header.number.to_be_bytes());
        hasher.update(self.header.parent_hash.0);
        hasher.update(self.header.state_root.0);
        hasher.update(self.header.tx_root.0);
        hasher.update(self.header.sequencer.0);
        hasher.update(self.header.timestamp.to_be_bytes());
        hasher.update(self.header.gas_limit.to_be_bytes());
        hasher.update(self.header.gas_used.to_be_bytes());
        hasher.update(&self.header.extra_data);
        hasher.update(self.header.slot.to_be_bytes());
        let out: [u8; 32] = hasher.finalize().into();
        Hash256(out)
    }

    /// Checks every invariant in spec.md §3/§8 for a block at height >= 1
    /// against its immediate parent.
    pub fn validate(&self, parent: &L2Block, now: Timestamp) -> Result<(), BlockValidationError> {
        if self.header.extra_data.len() > MAX_EXTRA_DATA_BYTES {
            return Err(BlockValidationError::ExtraDataTooLarge);
        }
        if self.header.number != parent.header.number + 1 {
            return Err(BlockValidationError::BadNumber);
        }
        if self.header.timestamp <= parent.header.timestamp {
            return Err(BlockValidationError::NonMonotonicTimestamp);
        }
        if self.header.timestamp > now + 15 {
            return Err(BlockValidationError::TimestampTooFarFuture);
        }
        let delta = (self.header.gas_limit as i128 - parent.header.gas_limit as i128).unsigned_abs();
        if delta > (parent.header.gas_limit / 1024) as u128 {
            return Err(BlockValidationError::GasLimitDelta);
        }
        if self.header.gas_used > self.header.gas_limit {
            return Err(BlockValidationError::GasUsedExceedsLimit);
        }
        let tx_gas_sum: u128 = self.transactions.iter().map(|t| t.gas_limit as u128).sum();
        if tx_gas_sum > self.header.gas_limit as u128 {
            return Err(BlockValidationError::TxGasOversubscribed);
        }
        let mut seen_hashes = HashSet::new();
        for tx in &self.transactions {
            if !seen_hashes.insert(tx.hash()) {
                return Err(BlockValidationError::DuplicateTxHash);
            }
        }
        let mut per_sender: HashMap<Addr, Vec<u64>> = HashMap::new();
        for tx in &self.transactions {
            per_sender.entry(tx.from).or_default().push(tx.nonce);
        }
        for nonces in per_sender.values_mut() {
            nonces.sort_unstable();
            for (i, n) in nonces.iter().enumerate().skip(1) {
                if *n != nonces[i - 1] + 1 {
                    return Err(BlockValidationError::NonSequentialNonce);
                }
            }
        }
        let mut signers = HashSet::new();
        for sig in &self.signatures {
            if !signers.insert(sig.signer) {
                return Err(BlockValidationError::DuplicateSigner);
            }
        }
        Ok(())
    }
}
