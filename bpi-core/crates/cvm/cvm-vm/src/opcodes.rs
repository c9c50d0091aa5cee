//! Opcode table: byte encoding, static gas cost, and validity checks.
//!
//! Grounded on `examples/original_source/src/cvm/cvm.cpp`'s `OpCode` switch
//! and its externally-declared (but not carried into the retrieval pack)
//! `GetOpCodeGasCost`/`IsValidOpCode` helpers. Costs below follow the same
//! tiering the source uses: cheap stack/arithmetic ops, mid control flow,
//! expensive storage and crypto ops.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Stop = 0x00,
    Push = 0x01,
    Pop = 0x02,
    Dup = 0x03,
    Swap = 0x04,
    Add = 0x10,
    Sub = 0x11,
    Mul = 0x12,
    Div = 0x13,
    Mod = 0x14,
    And = 0x20,
    Or = 0x21,
    Xor = 0x22,
    Not = 0x23,
    Eq = 0x30,
    Ne = 0x31,
    Lt = 0x32,
    Gt = 0x33,
    Le = 0x34,
    Ge = 0x35,
    Jump = 0x40,
    Jumpi = 0x41,
    Call = 0x42,
    Return = 0x43,
    Revert = 0x44,
    Sload = 0x50,
    Sstore = 0x51,
    Sha256 = 0x60,
    VerifySig = 0x61,
    Pubkey = 0x62,
    Address = 0x70,
    Balance = 0x71,
    Caller = 0x72,
    Callvalue = 0x73,
    Timestamp = 0x74,
    Blockheight = 0x75,
    Blockhash = 0x76,
    Gas = 0x77,
    Log = 0x80,
}

impl OpCode {
    pub fn from_byte(b: u8) -> Option<OpCode> {
        use OpCode::*;
        Some(match b {
            0x00 => Stop,
            0x01 => Push,
            0x02 => Pop,
            0x03 => Dup,
            0x04 => Swap,
            0x10 => Add,
            0x11 => Sub,
            0x12 => Mul,
            0x13 => Div,
            0x14 => Mod,
            0x20 => And,
            0x21 => Or,
            0x22 => Xor,
            0x23 => Not,
            0x30 => Eq,
            0x31 => Ne,
            0x32 => Lt,
            0x33 => Gt,
            0x34 => Le,
            0x35 => Ge,
            0x40 => Jump,
            0x41 => Jumpi,
            0x42 => Call,
            0x43 => Return,
            0x44 => Revert,
            0x50 => Sload,
            0x51 => Sstore,
            0x60 => Sha256,
            0x61 => VerifySig,
            0x62 => Pubkey,
            0x70 => Address,
            0x71 => Balance,
            0x72 => Caller,
            0x73 => Callvalue,
            0x74 => Timestamp,
            0x75 => Blockheight,
            0x76 => Blockhash,
            0x77 => Gas,
            0x80 => Log,
            _ => return None,
        })
    }

    /// Static per-opcode gas cost, charged before the operation is
    /// attempted (spec.md §4.7 "charges gas before attempting").
    pub fn gas_cost(self) -> u64 {
        use OpCode::*;
        match self {
            Stop => 0,
            Push => 3,
            Pop => 2,
            Dup => 3,
            Swap => 3,
            Add | Sub => 3,
            Mul | Div | Mod => 5,
            And | Or | Xor | Not => 3,
            Eq | Ne | Lt | Gt | Le | Ge => 3,
            Jump => 8,
            Jumpi => 10,
            Call => 700,
            Return | Revert => 0,
            Sload => 200,
            Sstore => 5000,
            Sha256 => 60,
            VerifySig => 3000,
            Pubkey => 100,
            Address | Caller | Callvalue | Timestamp | Blockheight | Blockhash | Gas | Balance => 2,
            Log => 375,
        }
    }

    pub fn is_jump(self) -> bool {
        matches!(self, OpCode::Jump | OpCode::Jumpi)
    }
}
