use serde::{Deserialize, Serialize};

use crate::error::*;
use crate::leb128::*;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValType {
    I32 = 0x7f,
    I64 = 0x7e,
    F32 = 0x7d,
    F64 = 0x7c,
    /// Placeholder produced by a stack-polymorphic pop.
    Any = 0xff,
}

impl ValType {
    #[inline]
    pub fn from_byte(byte: u8) -> Option<ValType> {
        match byte {
            0x7f => Some(ValType::I32),
            0x7e => Some(ValType::I64),
            0x7d => Some(ValType::F32),
            0x7c => Some(ValType::F64),
            _ => None,
        }
    }

    /// Number of 32-bit stack cells a value of this type occupies.
    #[inline(always)]
    pub fn cell_num(self) -> u32 {
        match self {
            ValType::I64 | ValType::F64 => 2,
            _ => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
            ValType::Any => "any",
        }
    }
}

#[inline]
pub fn cell_num_of(types: &[ValType]) -> u32 {
    types.iter().map(|t| t.cell_num()).sum()
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FuncType {
    #[inline]
    pub fn param_cell_num(&self) -> u32 { cell_num_of(&self.params) }
    #[inline]
    pub fn ret_cell_num(&self) -> u32 { cell_num_of(&self.results) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Empty,
    Value(ValType),
    Func(u32),
}

impl BlockType {
    const VOID: u8 = 0x40;

    /// Decode a block type in code that has already been validated.
    #[inline]
    pub fn read(bytes: &[u8], pc: &mut usize) -> Result<BlockType, Error> {
        let byte = *bytes.get(*pc).ok_or(Error::Malformed(UNEXPECTED_END))?;
        if byte == Self::VOID {
            *pc += 1;
            Ok(BlockType::Empty)
        } else if let Some(vt) = ValType::from_byte(byte) {
            *pc += 1;
            Ok(BlockType::Value(vt))
        } else {
            let idx: i64 = read_sleb128(bytes, pc)?;
            Ok(BlockType::Func(idx as u32))
        }
    }

    pub fn read_checked(bytes: &[u8], pc: &mut usize, n_types: usize) -> Result<BlockType, Error> {
        let byte = *bytes.get(*pc).ok_or(Error::Malformed(UNEXPECTED_END))?;
        if byte == Self::VOID || ValType::from_byte(byte).is_some() {
            return Self::read(bytes, pc);
        }
        let idx: i64 = safe_read_sleb128(bytes, pc, 33)?;
        if idx < 0 || idx as usize >= n_types {
            return Err(Error::Validation(UNKNOWN_TYPE));
        }
        Ok(BlockType::Func(idx as u32))
    }

    pub fn params(&self, types: &[FuncType]) -> Vec<ValType> {
        match self {
            BlockType::Func(i) => types[*i as usize].params.clone(),
            _ => Vec::new(),
        }
    }

    pub fn results(&self, types: &[FuncType]) -> Vec<ValType> {
        match self {
            BlockType::Empty => Vec::new(),
            BlockType::Value(vt) => vec![*vt],
            BlockType::Func(i) => types[*i as usize].results.clone(),
        }
    }

    /// `(param cells, result cells)` without allocating.
    #[inline]
    pub fn cells(&self, types: &[FuncType]) -> (u32, u32) {
        match self {
            BlockType::Empty => (0, 0),
            BlockType::Value(vt) => (0, vt.cell_num()),
            BlockType::Func(i) => {
                let ty = &types[*i as usize];
                (ty.param_cell_num(), ty.ret_cell_num())
            }
        }
    }
}

/// Untyped value as handed across the host boundary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WasmValue(pub u64);

impl WasmValue {
    #[inline] pub fn from_i32(v: i32) -> Self { Self(v as u32 as u64) }
    #[inline] pub fn as_i32(self) -> i32 { self.0 as u32 as i32 }
    #[inline] pub fn from_u32(v: u32) -> Self { Self(v as u64) }
    #[inline] pub fn as_u32(self) -> u32 { self.0 as u32 }
    #[inline] pub fn from_i64(v: i64) -> Self { Self(v as u64) }
    #[inline] pub fn as_i64(self) -> i64 { self.0 as i64 }
    #[inline] pub fn from_u64(v: u64) -> Self { Self(v) }
    #[inline] pub fn as_u64(self) -> u64 { self.0 }
    #[inline] pub fn from_f32(v: f32) -> Self { Self(v.to_bits() as u64) }
    #[inline] pub fn as_f32(self) -> f32 { f32::from_bits(self.0 as u32) }
    #[inline] pub fn from_f64(v: f64) -> Self { Self(v.to_bits()) }
    #[inline] pub fn as_f64(self) -> f64 { f64::from_bits(self.0) }

    /// Append this value to `cells` using the layout of `ty` (low word first).
    pub fn write_cells(self, ty: ValType, cells: &mut Vec<u32>) {
        cells.push(self.0 as u32);
        if ty.cell_num() == 2 {
            cells.push((self.0 >> 32) as u32);
        }
    }

    pub fn read_cells(ty: ValType, cells: &[u32]) -> Self {
        match ty.cell_num() {
            2 => Self(cells[0] as u64 | (cells[1] as u64) << 32),
            _ => Self(cells[0] as u64),
        }
    }

    pub fn display(self, ty: ValType) -> String {
        match ty {
            ValType::I32 => format!("{}:i32", self.as_i32()),
            ValType::I64 => format!("{}:i64", self.as_i64()),
            ValType::F32 => format!("{}:f32", self.as_f32()),
            ValType::F64 => format!("{}:f64", self.as_f64()),
            ValType::Any => format!("{:#x}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_counts() {
        let ty = FuncType { params: vec![ValType::I32, ValType::I64, ValType::F64], results: vec![ValType::F32] };
        assert_eq!(ty.param_cell_num(), 5);
        assert_eq!(ty.ret_cell_num(), 1);
    }

    #[test]
    fn block_type_decoding() {
        let types = vec![FuncType { params: vec![ValType::I64], results: vec![ValType::I32, ValType::I32] }];
        let mut pc = 0;
        assert_eq!(BlockType::read(&[0x40], &mut pc).unwrap(), BlockType::Empty);
        let mut pc = 0;
        let bt = BlockType::read(&[0x7e], &mut pc).unwrap();
        assert_eq!(bt.cells(&types), (0, 2));
        let mut pc = 0;
        let bt = BlockType::read_checked(&[0x00], &mut pc, types.len()).unwrap();
        assert_eq!(bt, BlockType::Func(0));
        assert_eq!(bt.cells(&types), (2, 2));
        let mut pc = 0;
        assert!(BlockType::read_checked(&[0x05], &mut pc, types.len()).is_err());
    }

    #[test]
    fn value_cells() {
        let mut cells = Vec::new();
        WasmValue::from_i64(-2).write_cells(ValType::I64, &mut cells);
        WasmValue::from_i32(7).write_cells(ValType::I32, &mut cells);
        assert_eq!(cells.len(), 3);
        assert_eq!(WasmValue::read_cells(ValType::I64, &cells[0..2]).as_i64(), -2);
        assert_eq!(WasmValue::read_cells(ValType::I32, &cells[2..]).as_i32(), 7);
    }
}
