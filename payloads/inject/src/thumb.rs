//! Thumb-2 branch encoding.
//!
//! All offsets are relative to the branch address plus 4 (the Thumb PC).
//! Wide encodings are returned in memory order: the first halfword sits at
//! the lower address, so as a little-endian word it is `hw1 | hw2 << 16`.

use derive_more::IsVariant;
use fpb_shared::strip_thumb;

use crate::{Result, err::Error};

/// `b` (T2): imm11:'0'
const B_RANGE: (i32, i32) = (-2048, 2046);
/// `b.w` (T4) and `bl`: S:I1:I2:imm10:imm11:'0'
const BW_RANGE: (i32, i32) = (-(1 << 24), (1 << 24) - 2);

const B_OPCODE: u16 = 0xE000;
const WIDE_HW1: u16 = 0xF000;
const BW_HW2: u16 = 0x9000;
const BL_HW2: u16 = 0xD000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum BranchKind {
    /// 16-bit unconditional branch
    B,
    /// 32-bit unconditional branch
    BW,
    /// 32-bit branch with link
    BL,
}

/// An encoded branch instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch {
    bytes: [u8; 4],
    len: usize,
}

impl Branch {
    fn narrow(hw: u16) -> Self {
        let [a, b] = hw.to_le_bytes();
        Self {
            bytes: [a, b, 0, 0],
            len: 2,
        }
    }

    fn wide(hw1: u16, hw2: u16) -> Self {
        let [a, b] = hw1.to_le_bytes();
        let [c, d] = hw2.to_le_bytes();
        Self {
            bytes: [a, b, c, d],
            len: 4,
        }
    }

    /// Instruction bytes in memory order
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// 2 or 4
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_wide(&self) -> bool {
        self.len == 4
    }

    /// The instruction as it reads from a word-aligned location.
    ///
    /// A narrow branch occupies the lower halfword.
    pub fn as_word(&self) -> u32 {
        u32::from_le_bytes(self.bytes)
    }
}

/// A branch recovered from instruction bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub kind: BranchKind,
    /// Destination, Thumb bit clear
    pub target: u32,
    pub len: usize,
}

fn offset(from: u32, to: u32) -> i32 {
    strip_thumb(to).wrapping_sub(strip_thumb(from).wrapping_add(4)) as i32
}

fn check_range(from: u32, to: u32, (min, max): (i32, i32)) -> Result<i32> {
    let off = offset(from, to);
    if (min..=max).contains(&off) {
        Ok(off)
    } else {
        Err(Error::BranchOutOfRange { from, to })
    }
}

/// Pack a T4-family offset. `hw2_base` selects `b.w` or `bl`.
const fn pack_wide(off: i32, hw2_base: u16) -> (u16, u16) {
    let imm = off as u32;

    let s = (imm >> 24) & 1;
    let i1 = (imm >> 23) & 1;
    let i2 = (imm >> 22) & 1;
    let imm10 = (imm >> 12) & 0x3FF;
    let imm11 = (imm >> 1) & 0x7FF;

    // I1 = NOT(J1 XOR S), so J1 = NOT(I1 XOR S)
    let j1 = !(i1 ^ s) & 1;
    let j2 = !(i2 ^ s) & 1;

    let hw1 = WIDE_HW1 as u32 | (s << 10) | imm10;
    let hw2 = hw2_base as u32 | (j1 << 13) | (j2 << 11) | imm11;

    (hw1 as u16, hw2 as u16)
}

const fn unpack_wide(hw1: u16, hw2: u16) -> i32 {
    let imm11 = (hw2 & 0x7FF) as u32;
    let imm10 = (hw1 & 0x3FF) as u32;
    let s = ((hw1 >> 10) & 1) as u32;
    let j1 = ((hw2 >> 13) & 1) as u32;
    let j2 = ((hw2 >> 11) & 1) as u32;

    let i1 = !(j1 ^ s) & 1;
    let i2 = !(j2 ^ s) & 1;

    let imm = (s << 24) | (i1 << 23) | (i2 << 22) | (imm10 << 12) | (imm11 << 1);

    ((imm << 7) as i32) >> 7
}

/// Encode `b` (16-bit)
pub fn encode_b(from: u32, to: u32) -> Result<u16> {
    let off = check_range(from, to, B_RANGE)?;
    Ok(B_OPCODE | ((off >> 1) as u16 & 0x7FF))
}

/// Encode `b.w`
pub fn encode_b_w(from: u32, to: u32) -> Result<Branch> {
    let off = check_range(from, to, BW_RANGE)?;
    let (hw1, hw2) = pack_wide(off, BW_HW2);
    Ok(Branch::wide(hw1, hw2))
}

/// Encode `bl`
pub fn encode_bl(from: u32, to: u32) -> Result<Branch> {
    let off = check_range(from, to, BW_RANGE)?;
    let (hw1, hw2) = pack_wide(off, BL_HW2);
    Ok(Branch::wide(hw1, hw2))
}

/// Shortest unconditional branch from `from` to `to`.
pub fn encode_branch(from: u32, to: u32) -> Result<Branch> {
    match encode_b(from, to) {
        Ok(hw) => Ok(Branch::narrow(hw)),
        Err(_) => encode_b_w(from, to),
    }
}

/// Call from `from` to `to`, always `bl`.
pub fn encode_call(from: u32, to: u32) -> Result<Branch> {
    encode_bl(from, to)
}

/// Guess if the halfword starts a 32-bit instruction
pub fn is_32bit(hw: u16) -> bool {
    let v = hw >> 11;
    v == 0b11101 || v == 0b11110 || v == 0b11111
}

/// Decode an unconditional `b`, `b.w` or `bl` located at `address`.
pub fn decode(address: u32, bytes: &[u8]) -> Option<Decoded> {
    let hw1 = u16::from_le_bytes([*bytes.first()?, *bytes.get(1)?]);
    let address = strip_thumb(address);

    if !is_32bit(hw1) {
        if hw1 & 0xF800 != B_OPCODE {
            return None;
        }

        let off = (((hw1 & 0x7FF) as i32) << 21) >> 20;
        return Some(Decoded {
            kind: BranchKind::B,
            target: address.wrapping_add(4).wrapping_add(off as u32),
            len: 2,
        });
    }

    let hw2 = u16::from_le_bytes([*bytes.get(2)?, *bytes.get(3)?]);
    if hw1 & 0xF800 != WIDE_HW1 {
        return None;
    }

    let kind = match hw2 & 0xD000 {
        BW_HW2 => BranchKind::BW,
        BL_HW2 => BranchKind::BL,
        _ => return None,
    };

    let off = unpack_wide(hw1, hw2);
    Some(Decoded {
        kind,
        target: address.wrapping_add(4).wrapping_add(off as u32),
        len: 4,
    })
}
