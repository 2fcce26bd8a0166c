use crate::types::ValType;
use crate::types::ValType::*;

// ---------------- Control ----------------
pub const UNREACHABLE: u8 = 0x00;
pub const NOP: u8 = 0x01;
pub const BLOCK: u8 = 0x02;
pub const LOOP: u8 = 0x03;
pub const IF: u8 = 0x04;
pub const ELSE: u8 = 0x05;
pub const END: u8 = 0x0b;
pub const BR: u8 = 0x0c;
pub const BR_IF: u8 = 0x0d;
pub const BR_TABLE: u8 = 0x0e;
pub const RETURN: u8 = 0x0f;
pub const CALL: u8 = 0x10;
pub const CALL_INDIRECT: u8 = 0x11;

// ---------------- Parametric / variable ----------------
pub const DROP: u8 = 0x1a;
pub const SELECT: u8 = 0x1b;
pub const LOCAL_GET: u8 = 0x20;
pub const LOCAL_SET: u8 = 0x21;
pub const LOCAL_TEE: u8 = 0x22;
pub const GLOBAL_GET: u8 = 0x23;
pub const GLOBAL_SET: u8 = 0x24;

// ---------------- Memory ----------------
pub const I32_LOAD: u8 = 0x28;
pub const I64_STORE32: u8 = 0x3e;
pub const MEMORY_SIZE: u8 = 0x3f;
pub const MEMORY_GROW: u8 = 0x40;

// ---------------- Constants ----------------
pub const I32_CONST: u8 = 0x41;
pub const I64_CONST: u8 = 0x42;
pub const F32_CONST: u8 = 0x43;
pub const F64_CONST: u8 = 0x44;

// ---------------- Numeric ----------------
pub const I32_MUL: u8 = 0x6c;

pub const PREFIX_FC: u8 = 0xfc;

/// Shape of a load or store: the value type moved and the natural alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemArg {
    pub ty: ValType,
    pub width: u32,
    pub store: bool,
}

pub fn mem_op(op: u8) -> Option<MemArg> {
    let (ty, width, store) = match op {
        0x28 => (I32, 4, false), 0x29 => (I64, 8, false),
        0x2a => (F32, 4, false), 0x2b => (F64, 8, false),
        0x2c | 0x2d => (I32, 1, false), 0x2e | 0x2f => (I32, 2, false),
        0x30 | 0x31 => (I64, 1, false), 0x32 | 0x33 => (I64, 2, false),
        0x34 | 0x35 => (I64, 4, false),
        0x36 => (I32, 4, true), 0x37 => (I64, 8, true),
        0x38 => (F32, 4, true), 0x39 => (F64, 8, true),
        0x3a => (I32, 1, true), 0x3b => (I32, 2, true),
        0x3c => (I64, 1, true), 0x3d => (I64, 2, true), 0x3e => (I64, 4, true),
        _ => return None,
    };
    Some(MemArg { ty, width, store })
}

pub type OpSig = (&'static [ValType], &'static [ValType]);

const I32_I32: OpSig = (&[I32], &[I32]);
const I64_I64: OpSig = (&[I64], &[I64]);
const F32_F32: OpSig = (&[F32], &[F32]);
const F64_F64: OpSig = (&[F64], &[F64]);
const I32I32_I32: OpSig = (&[I32, I32], &[I32]);
const I64I64_I64: OpSig = (&[I64, I64], &[I64]);
const F32F32_F32: OpSig = (&[F32, F32], &[F32]);
const F64F64_F64: OpSig = (&[F64, F64], &[F64]);
const I64_I32: OpSig = (&[I64], &[I32]);
const I64I64_I32: OpSig = (&[I64, I64], &[I32]);
const F32F32_I32: OpSig = (&[F32, F32], &[I32]);
const F64F64_I32: OpSig = (&[F64, F64], &[I32]);
const F32_I32: OpSig = (&[F32], &[I32]);
const F64_I32: OpSig = (&[F64], &[I32]);
const I32_I64: OpSig = (&[I32], &[I64]);
const F32_I64: OpSig = (&[F32], &[I64]);
const F64_I64: OpSig = (&[F64], &[I64]);
const I32_F32: OpSig = (&[I32], &[F32]);
const I64_F32: OpSig = (&[I64], &[F32]);
const F64_F32: OpSig = (&[F64], &[F32]);
const I32_F64: OpSig = (&[I32], &[F64]);
const I64_F64: OpSig = (&[I64], &[F64]);
const F32_F64: OpSig = (&[F32], &[F64]);

/// Operand and result types of the numeric instructions 0x45..=0xc4.
/// The validator type-checks against this table and CSP replay moves its
/// shadow stack pointer by it, so both agree on every numeric opcode.
pub fn numeric_sig(op: u8) -> Option<OpSig> {
    Some(match op {
        0x45 => I32_I32,
        0x46..=0x4f => I32I32_I32,
        0x50 => I64_I32,
        0x51..=0x5a => I64I64_I32,
        0x5b..=0x60 => F32F32_I32,
        0x61..=0x66 => F64F64_I32,
        0x67..=0x69 => I32_I32,
        0x6a..=0x78 => I32I32_I32,
        0x79..=0x7b => I64_I64,
        0x7c..=0x8a => I64I64_I64,
        0x8b..=0x91 => F32_F32,
        0x92..=0x98 => F32F32_F32,
        0x99..=0x9f => F64_F64,
        0xa0..=0xa6 => F64F64_F64,
        0xa7 => I64_I32,
        0xa8 | 0xa9 => F32_I32,
        0xaa | 0xab => F64_I32,
        0xac | 0xad => I32_I64,
        0xae | 0xaf => F32_I64,
        0xb0 | 0xb1 => F64_I64,
        0xb2 | 0xb3 => I32_F32,
        0xb4 | 0xb5 => I64_F32,
        0xb6 => F64_F32,
        0xb7 | 0xb8 => I32_F64,
        0xb9 | 0xba => I64_F64,
        0xbb => F32_F64,
        0xbc => F32_I32,
        0xbd => F64_I64,
        0xbe => I32_F32,
        0xbf => I64_F64,
        0xc0 | 0xc1 => I32_I32,
        0xc2..=0xc4 => I64_I64,
        _ => return None,
    })
}

/// Saturating truncations behind the 0xfc prefix (sub-opcodes 0..=7).
pub fn sat_trunc_sig(sub: u32) -> Option<OpSig> {
    Some(match sub {
        0 | 1 => F32_I32,
        2 | 3 => F64_I32,
        4 | 5 => F32_I64,
        6 | 7 => F64_I64,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_table_covers_mvp_range() {
        for op in 0x45u8..=0xc4 {
            assert!(numeric_sig(op).is_some(), "missing numeric op {op:#x}");
        }
        assert!(numeric_sig(0x44).is_none());
        assert!(numeric_sig(0xc5).is_none());
    }

    #[test]
    fn mem_ops() {
        assert_eq!(mem_op(I32_LOAD), Some(MemArg { ty: I32, width: 4, store: false }));
        assert_eq!(mem_op(I64_STORE32), Some(MemArg { ty: I64, width: 4, store: true }));
        assert_eq!(mem_op(MEMORY_SIZE), None);
    }
}
