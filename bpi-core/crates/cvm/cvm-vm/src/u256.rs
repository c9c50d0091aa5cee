//! Minimal 256-bit unsigned integer: four little-endian `u64` limbs, wrapping
//! arithmetic mod 2²⁵⁶, matching the stack word type spec.md §4.7 requires.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct U256(pub [u64; 4]);

impl U256 {
    pub const ZERO: U256 = U256([0, 0, 0, 0]);
    pub const ONE: U256 = U256([1, 0, 0, 0]);

    pub fn from_u64(v: u64) -> Self {
        U256([v, 0, 0, 0])
    }

    /// Low 64 bits, used for jump targets (matches `arith_uint256::GetLow64`).
    pub fn low_u64(&self) -> u64 {
        self.0[0]
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0, 0, 0, 0]
    }

    /// Big-endian bytes -> value, left-padded (or truncated from the left
    /// beyond 32 bytes, which callers never produce).
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        let mut padded = [0u8; 32];
        let start = 32usize.saturating_sub(bytes.len());
        let take = bytes.len().min(32);
        padded[start..].copy_from_slice(&bytes[bytes.len() - take..]);
        let mut limbs = [0u64; 4];
        for i in 0..4 {
            let chunk = &padded[i * 8..i * 8 + 8];
            limbs[3 - i] = u64::from_be_bytes(chunk.try_into().unwrap());
        }
        U256(limbs)
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        for i in 0..4 {
            out[i * 8..i * 8 + 8].copy_from_slice(&self.0[3 - i].to_be_bytes());
        }
        out
    }

    pub fn wrapping_add(&self, other: &U256) -> U256 {
        let mut result = [0u64; 4];
        let mut carry = 0u128;
        for i in 0..4 {
            let sum = self.0[i] as u128 + other.0[i] as u128 + carry;
            result[i] = sum as u64;
            carry = sum >> 64;
        }
        U256(result)
    }

    pub fn wrapping_sub(&self, other: &U256) -> U256 {
        let not_other = other.not();
        self.wrapping_add(&not_other).wrapping_add(&U256::ONE)
    }

    pub fn wrapping_mul(&self, other: &U256) -> U256 {
        let mut wide = [0u128; 8];
        for i in 0..4 {
            for j in 0..4 {
                if i + j < 8 {
                    wide[i + j] += self.0[i] as u128 * other.0[j] as u128;
                }
            }
        }
        // Propagate carries across the 8 double-width limbs, keeping only
        // the low 4 (the product wraps mod 2^256).
        let mut carry = 0u128;
        let mut limbs64 = [0u64; 8];
        for i in 0..8 {
            let v = wide[i] + carry;
            limbs64[i] = v as u64;
            carry = v >> 64;
        }
        U256([limbs64[0], limbs64[1], limbs64[2], limbs64[3]])
    }

    fn not(&self) -> U256 {
        U256([!self.0[0], !self.0[1], !self.0[2], !self.0[3]])
    }

    pub fn bitand(&self, other: &U256) -> U256 {
        U256([self.0[0] & other.0[0], self.0[1] & other.0[1], self.0[2] & other.0[2], self.0[3] & other.0[3]])
    }

    pub fn bitor(&self, other: &U256) -> U256 {
        U256([self.0[0] | other.0[0], self.0[1] | other.0[1], self.0[2] | other.0[2], self.0[3] | other.0[3]])
    }

    pub fn bitxor(&self, other: &U256) -> U256 {
        U256([self.0[0] ^ other.0[0], self.0[1] ^ other.0[1], self.0[2] ^ other.0[2], self.0[3] ^ other.0[3]])
    }

    pub fn bitnot(&self) -> U256 {
        self.not()
    }

    fn bit(&self, i: u32) -> bool {
        (self.0[(i / 64) as usize] >> (i % 64)) & 1 == 1
    }

    fn shl1(&mut self) -> bool {
        let mut carry = 0u64;
        for i in 0..4 {
            let new_carry = self.0[i] >> 63;
            self.0[i] = (self.0[i] << 1) | carry;
            carry = new_carry;
        }
        carry != 0
    }

    /// Returns (quotient, remainder). Division by zero returns (0, 0),
    /// matching `arith_uint256` behaviour the original engine relies on at
    /// the DIV/MOD opcodes (spec.md §4.7 "div/mod return 0 on divisor 0").
    pub fn div_rem(&self, divisor: &U256) -> (U256, U256) {
        if divisor.is_zero() {
            return (U256::ZERO, U256::ZERO);
        }
        let mut quotient = U256::ZERO;
        let mut remainder = U256::ZERO;
        for i in (0..256).rev() {
            remainder.shl1();
            if self.bit(i) {
                remainder.0[0] |= 1;
            }
            if remainder.cmp(divisor) != std::cmp::Ordering::Less {
                remainder = remainder.wrapping_sub(divisor);
                quotient.0[(i / 64) as usize] |= 1 << (i % 64);
            }
        }
        (quotient, remainder)
    }

    pub fn cmp(&self, other: &U256) -> std::cmp::Ordering {
        for i in (0..4).rev() {
            match self.0[i].cmp(&other.0[i]) {
                std::cmp::Ordering::Equal => continue,
                ord => return ord,
            }
        }
        std::cmp::Ordering::Equal
    }
}

impl fmt::Display for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.to_be_bytes()))
    }
}
