//! Deterministic stack machine over 256-bit words (spec.md §4.7).
//!
//! Grounded on `examples/original_source/src/cvm/cvm.cpp`: gas is charged
//! before an operation is attempted, an invalid opcode fails fast, and
//! `DIV`/`MOD` by zero return zero rather than trapping. The storage opcodes
//! (`SLOAD`/`SSTORE`) are dispatched through the `ContractStorage` trait so
//! that `enhanced-storage` (spec.md §4.8) can plug in reputation-weighted
//! costs and quotas without this crate depending on it.

pub mod opcodes;
pub mod u256;

use std::fmt;

use crypto_primitives::{Addr, Hash256};
use opcodes::OpCode;
use thiserror::Error;
use u256::U256;

pub const MAX_CODE_SIZE: usize = 24 * 1024;
pub const MAX_STACK: usize = 1024;
pub const MAX_MEMORY: usize = 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("invalid opcode {0:#04x} at pc {1}")]
    InvalidOpcode(u8, usize),
    #[error("out of gas")]
    OutOfGas,
    #[error("stack overflow")]
    StackOverflow,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("invalid jump target")]
    InvalidJump,
    #[error("code size {0} exceeds MAX_CODE_SIZE")]
    CodeTooLarge(usize),
    #[error("empty bytecode")]
    EmptyCode,
    #[error("push: truncated immediate at pc {0}")]
    TruncatedPush(usize),
    #[error("push: invalid immediate size {0} at pc {1}")]
    InvalidPushSize(u8, usize),
    #[error("no storage backend configured")]
    NoStorage,
    #[error("reverted")]
    Reverted,
}

pub type Result<T> = std::result::Result<T, VmError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Stopped,
    Returned,
    Reverted,
    OutOfGas,
    InvalidOp,
    InvalidJump,
    StackOver,
    StackUnder,
    Error,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Running)
    }

    /// Terminal statuses under which the call's storage writes are rolled
    /// back (spec.md §4.7 "REVERT ... leaves the call's state changes
    /// logically rolled back").
    pub fn rolls_back(self) -> bool {
        matches!(
            self,
            Status::Reverted
                | Status::OutOfGas
                | Status::InvalidOp
                | Status::InvalidJump
                | Status::StackOver
                | Status::StackUnder
                | Status::Error
        )
    }
}

/// Read/write access to contract-scoped persistent storage, implemented by
/// `enhanced-storage` (spec.md §4.8). Values default to zero when absent.
pub trait ContractStorage {
    fn sload(&mut self, contract: Addr, key: Hash256) -> Hash256;
    /// Returns `Err` (e.g. quota exceeded, reputation gate) to abort the
    /// running call with `ResourceError` semantics.
    fn sstore(&mut self, contract: Addr, key: Hash256, value: Hash256) -> std::result::Result<(), String>;
}

/// Execution context: everything the CONTEXT opcodes read.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub contract: Addr,
    pub caller: Addr,
    pub call_value: u64,
    pub block_height: i32,
    pub block_hash: Hash256,
    pub timestamp: i64,
    pub gas_limit: u64,
}

#[derive(Debug, Clone, Default)]
pub struct LogEntry {
    pub topics: Vec<U256>,
    pub data: Vec<u8>,
}

pub struct VmState {
    pub stack: Vec<U256>,
    pub memory: Vec<u8>,
    pub pc: usize,
    pub gas_remaining: u64,
    pub gas_used: u64,
    pub logs: Vec<LogEntry>,
    pub return_data: Vec<u8>,
    pub status: Status,
    pub ctx: ExecutionContext,
}

impl VmState {
    pub fn new(ctx: ExecutionContext, gas_limit: u64) -> Self {
        Self {
            stack: Vec::new(),
            memory: Vec::new(),
            pc: 0,
            gas_remaining: gas_limit,
            gas_used: 0,
            logs: Vec::new(),
            return_data: Vec::new(),
            status: Status::Running,
            ctx,
        }
    }

    fn push(&mut self, v: U256) -> Result<()> {
        if self.stack.len() >= MAX_STACK {
            self.status = Status::StackOver;
            return Err(VmError::StackOverflow);
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> Result<U256> {
        self.stack.pop().ok_or_else(|| {
            self.status = Status::StackUnder;
            VmError::StackUnderflow
        })
    }

    fn charge(&mut self, gas: u64) -> Result<()> {
        if self.gas_remaining < gas {
            self.gas_remaining = 0;
            self.status = Status::OutOfGas;
            return Err(VmError::OutOfGas);
        }
        self.gas_remaining -= gas;
        self.gas_used += gas;
        Ok(())
    }
}

/// Result returned to the caller (fee accounting, tx receipt).
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub status: Status,
    pub gas_used: u64,
    pub return_data: Vec<u8>,
    pub logs: Vec<LogEntry>,
    pub error: Option<VmError>,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Single opcode scan validating PUSH immediate-size boundaries
/// (spec.md §4.7 "Bytecode verification scans opcodes once").
pub fn verify_bytecode(code: &[u8]) -> Result<()> {
    if code.is_empty() {
        return Err(VmError::EmptyCode);
    }
    if code.len() > MAX_CODE_SIZE {
        return Err(VmError::CodeTooLarge(code.len()));
    }
    let mut i = 0usize;
    while i < code.len() {
        let byte = code[i];
        let op = OpCode::from_byte(byte).ok_or(VmError::InvalidOpcode(byte, i))?;
        if op == OpCode::Push {
            if i + 1 >= code.len() {
                return Err(VmError::TruncatedPush(i));
            }
            let size = code[i + 1];
            if size == 0 || size > 32 {
                return Err(VmError::InvalidPushSize(size, i));
            }
            if i + 2 + size as usize > code.len() {
                return Err(VmError::TruncatedPush(i));
            }
            i += 2 + size as usize;
        } else {
            i += 1;
        }
    }
    Ok(())
}

/// Execute `code` to completion (or failure) against `storage`.
pub fn execute(code: &[u8], mut state: VmState, storage: &mut dyn ContractStorage) -> ExecutionResult {
    if let Err(e) = run(code, &mut state, storage) {
        let status = match state.status {
            Status::Running => Status::Error,
            s => s,
        };
        return ExecutionResult {
            success: false,
            status,
            gas_used: state.gas_used,
            return_data: state.return_data,
            logs: state.logs,
            error: Some(e),
        };
    }
    ExecutionResult {
        success: matches!(state.status, Status::Stopped | Status::Returned),
        status: state.status,
        gas_used: state.gas_used,
        return_data: state.return_data,
        logs: state.logs,
        error: None,
    }
}

fn run(code: &[u8], state: &mut VmState, storage: &mut dyn ContractStorage) -> Result<()> {
    if code.is_empty() {
        state.status = Status::Error;
        return Err(VmError::EmptyCode);
    }
    if code.len() > MAX_CODE_SIZE {
        state.status = Status::Error;
        return Err(VmError::CodeTooLarge(code.len()));
    }

    while state.status == Status::Running && state.pc < code.len() {
        let byte = code[state.pc];
        let op = match OpCode::from_byte(byte) {
            Some(op) => op,
            None => {
                state.status = Status::InvalidOp;
                return Err(VmError::InvalidOpcode(byte, state.pc));
            }
        };

        state.charge(op.gas_cost())?;

        let advanced = dispatch(op, code, state, storage)?;
        if !advanced && !op.is_jump() {
            state.pc += 1;
        }
    }
    Ok(())
}

/// Returns `Ok(true)` if the opcode already set `pc` itself (PUSH, JUMP,
/// JUMPI); the caller advances by one otherwise.
fn dispatch(op: OpCode, code: &[u8], state: &mut VmState, storage: &mut dyn ContractStorage) -> Result<bool> {
    use OpCode::*;
    match op {
        Stop => {
            state.status = Status::Stopped;
            Ok(false)
        }
        Push => {
            let pc = state.pc;
            if pc + 1 >= code.len() {
                state.status = Status::Error;
                return Err(VmError::TruncatedPush(pc));
            }
            let size = code[pc + 1];
            if size == 0 || size > 32 {
                state.status = Status::Error;
                return Err(VmError::InvalidPushSize(size, pc));
            }
            if pc + 2 + size as usize > code.len() {
                state.status = Status::Error;
                return Err(VmError::TruncatedPush(pc));
            }
            let bytes = &code[pc + 2..pc + 2 + size as usize];
            state.push(U256::from_be_bytes(bytes))?;
            state.pc = pc + 2 + size as usize;
            Ok(true)
        }
        Pop => {
            state.pop()?;
            Ok(false)
        }
        Dup => {
            let top = *state.stack.last().ok_or_else(|| {
                state.status = Status::StackUnder;
                VmError::StackUnderflow
            })?;
            state.push(top)?;
            Ok(false)
        }
        Swap => {
            let len = state.stack.len();
            if len < 2 {
                state.status = Status::StackUnder;
                return Err(VmError::StackUnderflow);
            }
            state.stack.swap(len - 1, len - 2);
            Ok(false)
        }
        Add | Sub | Mul | Div | Mod => {
            let b = state.pop()?;
            let a = state.pop()?;
            let result = match op {
                Add => a.wrapping_add(&b),
                Sub => a.wrapping_sub(&b),
                Mul => a.wrapping_mul(&b),
                Div => a.div_rem(&b).0,
                Mod => a.div_rem(&b).1,
                _ => unreachable!(),
            };
            state.push(result)?;
            Ok(false)
        }
        And | Or | Xor => {
            let b = state.pop()?;
            let a = state.pop()?;
            let result = match op {
                And => a.bitand(&b),
                Or => a.bitor(&b),
                Xor => a.bitxor(&b),
                _ => unreachable!(),
            };
            state.push(result)?;
            Ok(false)
        }
        Not => {
            let a = state.pop()?;
            state.push(a.bitnot())?;
            Ok(false)
        }
        Eq | Ne | Lt | Gt | Le | Ge => {
            let b = state.pop()?;
            let a = state.pop()?;
            let ord = a.cmp(&b);
            let result = match op {
                Eq => ord == std::cmp::Ordering::Equal,
                Ne => ord != std::cmp::Ordering::Equal,
                Lt => ord == std::cmp::Ordering::Less,
                Gt => ord == std::cmp::Ordering::Greater,
                Le => ord != std::cmp::Ordering::Greater,
                Ge => ord != std::cmp::Ordering::Less,
                _ => unreachable!(),
            };
            state.push(if result { U256::ONE } else { U256::ZERO })?;
            Ok(false)
        }
        Jump | Jumpi => {
            let target = state.pop()?;
            if op == Jumpi {
                let cond = state.pop()?;
                if cond.is_zero() {
                    return Ok(false);
                }
            }
            let target = target.low_u64() as usize;
            if target >= code.len() || OpCode::from_byte(code[target]).is_none() {
                state.status = Status::InvalidJump;
                return Err(VmError::InvalidJump);
            }
            state.pc = target;
            Ok(true)
        }
        Call => {
            state.status = Status::Error;
            Err(VmError::NoStorage)
        }
        Return => {
            state.status = Status::Returned;
            Ok(false)
        }
        Revert => {
            state.status = Status::Reverted;
            Err(VmError::Reverted)
        }
        Sload => {
            let key = state.pop()?;
            let value = storage.sload(state.ctx.contract, Hash256(key.to_be_bytes()));
            state.push(U256::from_be_bytes(&value.0))?;
            Ok(false)
        }
        Sstore => {
            let key = state.pop()?;
            let value = state.pop()?;
            storage
                .sstore(state.ctx.contract, Hash256(key.to_be_bytes()), Hash256(value.to_be_bytes()))
                .map_err(|_| {
                    state.status = Status::Error;
                    VmError::NoStorage
                })?;
            Ok(false)
        }
        Sha256 => {
            let input = state.pop()?;
            let digest = Hash256::sha256_of(&input.to_be_bytes());
            state.push(U256::from_be_bytes(&digest.0))?;
            Ok(false)
        }
        VerifySig => {
            // Placeholder per spec.md §4.7 "treated as an external oracle";
            // open question in spec.md §9 whether this becomes a real check.
            state.pop()?;
            state.pop()?;
            state.pop()?;
            state.push(U256::ONE)?;
            Ok(false)
        }
        Pubkey => {
            state.push(U256::ZERO)?;
            Ok(false)
        }
        Address => {
            state.push(addr_to_u256(&state.ctx.contract))?;
            Ok(false)
        }
        Caller => {
            state.push(addr_to_u256(&state.ctx.caller))?;
            Ok(false)
        }
        Callvalue => {
            state.push(U256::from_u64(state.ctx.call_value))?;
            Ok(false)
        }
        Timestamp => {
            state.push(U256::from_u64(state.ctx.timestamp as u64))?;
            Ok(false)
        }
        Blockheight => {
            state.push(U256::from_u64(state.ctx.block_height as u64))?;
            Ok(false)
        }
        Blockhash => {
            state.push(U256::from_be_bytes(&state.ctx.block_hash.0))?;
            Ok(false)
        }
        Gas => {
            state.push(U256::from_u64(state.gas_remaining))?;
            Ok(false)
        }
        Balance => {
            state.push(U256::ZERO)?;
            Ok(false)
        }
        Log => {
            let topic_count = state.pop()?.low_u64() as usize;
            let mut topics = Vec::with_capacity(topic_count.min(MAX_STACK));
            for _ in 0..topic_count {
                topics.push(state.pop()?);
            }
            state.logs.push(LogEntry { topics, data: Vec::new() });
            Ok(false)
        }
    }
}

fn addr_to_u256(addr: &Addr) -> U256 {
    let mut bytes = [0u8; 32];
    bytes[12..].copy_from_slice(&addr.0);
    U256::from_be_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullStorage;
    impl ContractStorage for NullStorage {
        fn sload(&mut self, _c: Addr, _k: Hash256) -> Hash256 {
            Hash256::zero()
        }
        fn sstore(&mut self, _c: Addr, _k: Hash256, _v: Hash256) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            contract: Addr([1u8; 20]),
            caller: Addr([2u8; 20]),
            call_value: 0,
            block_height: 1,
            block_hash: Hash256::zero(),
            timestamp: 0,
            gas_limit: 1_000_000,
        }
    }

    fn push_code(values: &[u64]) -> Vec<u8> {
        let mut code = Vec::new();
        for v in values {
            code.push(OpCode::Push as u8);
            code.push(8);
            code.extend_from_slice(&v.to_be_bytes());
        }
        code
    }

    #[test]
    fn add_two_values_and_stop() {
        let mut code = push_code(&[2, 3]);
        code.push(OpCode::Add as u8);
        code.push(OpCode::Stop as u8);
        let state = VmState::new(ctx(), 100_000);
        let mut storage = NullStorage;
        let result = execute(&code, state, &mut storage);
        assert_eq!(result.status, Status::Stopped);
        assert!(result.success);
    }

    #[test]
    fn invalid_opcode_fails_fast() {
        let code = vec![0xFF];
        let state = VmState::new(ctx(), 100_000);
        let mut storage = NullStorage;
        let result = execute(&code, state, &mut storage);
        assert_eq!(result.status, Status::InvalidOp);
        assert!(!result.success);
    }

    #[test]
    fn out_of_gas_on_underflow() {
        let code = vec![OpCode::Add as u8];
        let state = VmState::new(ctx(), 1);
        let mut storage = NullStorage;
        let result = execute(&code, state, &mut storage);
        // gas charged before dispatch: Add costs 3 > 1 remaining
        assert_eq!(result.status, Status::OutOfGas);
    }

    #[test]
    fn div_by_zero_returns_zero() {
        let mut code = push_code(&[10, 0]);
        code.push(OpCode::Div as u8);
        code.push(OpCode::Stop as u8);
        let state = VmState::new(ctx(), 100_000);
        let mut storage = NullStorage;
        let result = execute(&code, state, &mut storage);
        assert_eq!(result.status, Status::Stopped);
    }

    #[test]
    fn jump_to_invalid_target_is_rejected() {
        let mut code = push_code(&[99]);
        code.push(OpCode::Jump as u8);
        let state = VmState::new(ctx(), 100_000);
        let mut storage = NullStorage;
        let result = execute(&code, state, &mut storage);
        assert_eq!(result.status, Status::InvalidJump);
    }

    #[test]
    fn stack_overflow_is_detected() {
        let mut code = Vec::new();
        for _ in 0..(MAX_STACK + 1) {
            code.push(OpCode::Push as u8);
            code.push(1);
            code.push(1);
        }
        let state = VmState::new(ctx(), 10_000_000);
        let mut storage = NullStorage;
        let result = execute(&code, state, &mut storage);
        assert_eq!(result.status, Status::StackOver);
    }

    #[test]
    fn bytecode_verification_catches_truncated_push() {
        let code = vec![OpCode::Push as u8, 4, 1, 2];
        assert!(verify_bytecode(&code).is_err());
    }

    #[test]
    fn revert_rolls_back_status() {
        let code = vec![OpCode::Revert as u8];
        let state = VmState::new(ctx(), 100_000);
        let mut storage = NullStorage;
        let result = execute(&code, state, &mut storage);
        assert_eq!(result.status, Status::Reverted);
        assert!(result.status.rolls_back());
    }
}
