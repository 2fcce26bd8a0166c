use crate::byte_iter::ByteIter;
use crate::debug_println;
use crate::error::*;
use crate::leb128::*;
use crate::module::*;
use crate::opcodes::{self, mem_op, numeric_sig, sat_trunc_sig, PREFIX_FC};
use crate::types::*;

// ---------------- Control Flow Structures ----------------
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlType {
    Function,
    Block,
    Loop,
    If,
    IfElse,
}

#[derive(Clone, Debug)]
pub struct ControlFrame {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
    pub height: usize,
    pub unreachable: bool,
    pub control_type: ControlType,
    /// Position of the opening `block`/`loop`/`if` opcode.
    pub op_pos: usize,
    pub else_pos: Option<usize>,
}

impl ControlFrame {
    fn label_types(&self) -> &[ValType] {
        if self.control_type == ControlType::Loop { &self.params } else { &self.results }
    }
}

/// What the interpreter and CSP replay need to know about one body.
#[derive(Debug, Default)]
pub struct FuncInfo {
    pub max_stack_cell_num: u32,
    pub max_block_num: u32,
    pub blocks: Vec<(usize, BlockAddr)>,
    pub wide: Vec<usize>,
}

// ---------------- ValidatorStack for Type Checking ----------------
#[derive(Default)]
pub struct ValidatorStack {
    vals: Vec<ValType>,
    cells: u32,
    max_cells: u32,
}

impl ValidatorStack {
    fn push(&mut self, ty: ValType) {
        self.vals.push(ty);
        self.cells += ty.cell_num();
        self.max_cells = self.max_cells.max(self.cells);
    }

    fn pop(&mut self) -> Option<ValType> {
        let ty = self.vals.pop()?;
        self.cells -= ty.cell_num();
        Some(ty)
    }

    fn truncate(&mut self, height: usize) {
        while self.vals.len() > height {
            self.pop();
        }
    }

    fn len(&self) -> usize { self.vals.len() }
}

// ---------------- Function Validation ----------------
pub struct Validator<'a> {
    module: &'a Module,
}

struct FuncCtx<'a> {
    m: &'a Module,
    f: &'a Function,
    it: ByteIter<'a>,
    vs: ValidatorStack,
    cs: Vec<ControlFrame>,
    info: FuncInfo,
    op_pos: usize,
    done: bool,
}

impl<'a> Validator<'a> {
    pub fn new(module: &'a Module) -> Self {
        Self { module }
    }

    pub fn validate_function(&self, fn_index: usize) -> Result<FuncInfo, Error> {
        let m = self.module;
        let f = &m.functions[fn_index];
        let mut ctx = FuncCtx {
            m,
            f,
            it: ByteIter::new(&m.bytes[..f.body.end], f.body.start),
            vs: ValidatorStack::default(),
            cs: Vec::with_capacity(16),
            info: FuncInfo::default(),
            op_pos: f.body.start,
            done: false,
        };
        ctx.push_ctrl(ControlType::Function, Vec::new(), f.ty.results.clone());

        let validators = get_validators();
        while !ctx.done {
            if ctx.it.empty() {
                return Err(Error::Malformed(END_EXPECTED));
            }
            ctx.op_pos = ctx.it.cur();
            let op = ctx.it.read_u8()?;
            validators[op as usize](&mut ctx, op)?;
        }
        if ctx.it.cur() != f.body.end {
            return Err(Error::Malformed(SECTION_SIZE_MISMATCH));
        }

        ctx.info.max_stack_cell_num = ctx.vs.max_cells;
        debug_println!(
            "[val] func {} max_stack_cells={} max_blocks={}",
            fn_index, ctx.info.max_stack_cell_num, ctx.info.max_block_num
        );
        Ok(ctx.info)
    }
}

impl FuncCtx<'_> {
    fn push_val(&mut self, ty: ValType) { self.vs.push(ty); }

    fn push_vals(&mut self, types: &[ValType]) {
        for &t in types { self.vs.push(t); }
    }

    fn pop_val(&mut self) -> Result<ValType, Error> {
        let frame = self.cs.last().ok_or(Error::Validation(TYPE_MISMATCH))?;
        if self.vs.len() == frame.height {
            return if frame.unreachable { Ok(ValType::Any) } else { Err(Error::Validation(TYPE_MISMATCH)) };
        }
        self.vs.pop().ok_or(Error::Validation(TYPE_MISMATCH))
    }

    fn pop_expect(&mut self, expect: ValType) -> Result<ValType, Error> {
        let actual = self.pop_val()?;
        if actual != expect && actual != ValType::Any && expect != ValType::Any {
            return Err(Error::Validation(TYPE_MISMATCH));
        }
        Ok(if actual == ValType::Any { expect } else { actual })
    }

    fn pop_vals(&mut self, types: &[ValType]) -> Result<(), Error> {
        for &t in types.iter().rev() {
            self.pop_expect(t)?;
        }
        Ok(())
    }

    fn push_ctrl(&mut self, control_type: ControlType, params: Vec<ValType>, results: Vec<ValType>) {
        self.push_vals(&params);
        let height = self.vs.len() - params.len();
        self.cs.push(ControlFrame {
            params,
            results,
            height,
            unreachable: false,
            control_type,
            op_pos: self.op_pos,
            else_pos: None,
        });
        self.info.max_block_num = self.info.max_block_num.max(self.cs.len() as u32);
    }

    fn pop_ctrl(&mut self) -> Result<ControlFrame, Error> {
        let results = self.cs.last().ok_or(Error::Validation(TYPE_MISMATCH))?.results.clone();
        self.pop_vals(&results)?;
        let frame = self.cs.pop().ok_or(Error::Validation(TYPE_MISMATCH))?;
        if self.vs.len() != frame.height {
            return Err(Error::Validation(TYPE_MISMATCH));
        }
        Ok(frame)
    }

    fn polymorphize(&mut self) {
        if let Some(frame) = self.cs.last_mut() {
            self.vs.truncate(frame.height);
            frame.unreachable = true;
        }
    }

    fn label(&self, depth: u32) -> Result<Vec<ValType>, Error> {
        let idx = self.cs.len().checked_sub(depth as usize + 1).ok_or(Error::Validation(UNKNOWN_LABEL))?;
        Ok(self.cs[idx].label_types().to_vec())
    }

    fn read_block_type(&mut self) -> Result<BlockType, Error> {
        BlockType::read_checked(self.it.bytes, &mut self.it.idx, self.m.types.len())
    }

    fn local_type(&mut self) -> Result<ValType, Error> {
        let idx = self.it.read_u32()?;
        self.f.locals.get(idx as usize).copied().ok_or(Error::Validation(UNKNOWN_LOCAL))
    }

    fn global(&mut self) -> Result<&Global, Error> {
        let idx = self.it.read_u32()?;
        self.m.globals.get(idx as usize).ok_or(Error::Validation(UNKNOWN_GLOBAL))
    }

    fn require_memory(&self) -> Result<(), Error> {
        if self.m.memory.is_none() { Err(Error::Validation(UNKNOWN_MEMORY)) } else { Ok(()) }
    }
}

// ---------------- Validator Function Type ----------------
type ValidatorFn = fn(&mut FuncCtx, u8) -> Result<(), Error>;

fn validate_missing(_: &mut FuncCtx, _: u8) -> Result<(), Error> {
    Err(Error::Malformed(UNKNOWN_INSTRUCTION))
}

// ---------------- Control Flow Validators ----------------
fn validate_unreachable(c: &mut FuncCtx, _: u8) -> Result<(), Error> {
    c.polymorphize();
    Ok(())
}

fn validate_nop(_: &mut FuncCtx, _: u8) -> Result<(), Error> { Ok(()) }

fn validate_block(c: &mut FuncCtx, op: u8) -> Result<(), Error> {
    let bt = c.read_block_type()?;
    if op == opcodes::IF {
        c.pop_expect(ValType::I32)?;
    }
    let params = bt.params(&c.m.types);
    let results = bt.results(&c.m.types);
    c.pop_vals(&params)?;
    let control_type = match op {
        opcodes::LOOP => ControlType::Loop,
        opcodes::IF => ControlType::If,
        _ => ControlType::Block,
    };
    debug_println!("[val] {:?} at {:#x}", control_type, c.op_pos);
    c.push_ctrl(control_type, params, results);
    Ok(())
}

fn validate_else(c: &mut FuncCtx, _: u8) -> Result<(), Error> {
    if c.cs.last().map(|f| f.control_type) != Some(ControlType::If) {
        return Err(Error::Validation(ELSE_MUST_CLOSE_IF));
    }
    let frame = c.pop_ctrl()?;
    let else_pos = c.op_pos;
    c.op_pos = frame.op_pos;
    c.push_ctrl(ControlType::IfElse, frame.params, frame.results);
    c.op_pos = else_pos;
    if let Some(top) = c.cs.last_mut() {
        top.else_pos = Some(else_pos);
    }
    Ok(())
}

fn validate_end(c: &mut FuncCtx, _: u8) -> Result<(), Error> {
    let frame = c.pop_ctrl()?;
    match frame.control_type {
        ControlType::Function => {
            c.done = true;
            return Ok(());
        }
        ControlType::If if frame.params != frame.results => {
            return Err(Error::Validation(TYPE_MISMATCH));
        }
        _ => {}
    }
    debug_println!("[val] block {:#x} -> else={:?} end={:#x}", frame.op_pos, frame.else_pos, c.op_pos);
    c.info.blocks.push((frame.op_pos, BlockAddr { else_addr: frame.else_pos, end_addr: c.op_pos }));
    c.push_vals(&frame.results);
    Ok(())
}

fn validate_br(c: &mut FuncCtx, op: u8) -> Result<(), Error> {
    let depth = c.it.read_u32()?;
    if op == opcodes::BR_IF {
        c.pop_expect(ValType::I32)?;
    }
    let label = c.label(depth)?;
    c.pop_vals(&label)?;
    if op == opcodes::BR_IF {
        c.push_vals(&label);
    } else {
        c.polymorphize();
    }
    Ok(())
}

fn validate_br_table(c: &mut FuncCtx, _: u8) -> Result<(), Error> {
    let n_targets = c.it.read_u32()?;
    let mut targets = Vec::with_capacity(n_targets.min(1024) as usize);
    for _ in 0..n_targets {
        targets.push(c.it.read_u32()?);
    }
    let default_depth = c.it.read_u32()?;
    c.pop_expect(ValType::I32)?;

    let default_label = c.label(default_depth)?;
    for depth in targets {
        let label = c.label(depth)?;
        if label.len() != default_label.len() {
            return Err(Error::Validation(TYPE_MISMATCH));
        }
        // Check without consuming: pop, then put the checked types back.
        let height = c.vs.len();
        c.pop_vals(&label)?;
        let popped = height - c.vs.len();
        c.push_vals(&label[label.len() - popped..]);
    }
    c.pop_vals(&default_label)?;
    c.polymorphize();
    Ok(())
}

fn validate_return(c: &mut FuncCtx, _: u8) -> Result<(), Error> {
    let results = c.f.ty.results.clone();
    c.pop_vals(&results)?;
    c.polymorphize();
    Ok(())
}

// ---------------- Call Instructions ----------------
fn validate_call(c: &mut FuncCtx, _: u8) -> Result<(), Error> {
    let func_idx = c.it.read_u32()?;
    let callee = c.m.functions.get(func_idx as usize).ok_or(Error::Validation(UNKNOWN_FUNC))?;
    c.pop_vals(&callee.ty.params)?;
    c.push_vals(&callee.ty.results);
    Ok(())
}

fn validate_call_indirect(c: &mut FuncCtx, _: u8) -> Result<(), Error> {
    let type_idx = c.it.read_u32()?;
    let ty = c.m.types.get(type_idx as usize).ok_or(Error::Validation(UNKNOWN_TYPE))?;
    if c.it.read_u8()? != 0 {
        return Err(Error::Malformed(ZERO_FLAG_EXPECTED));
    }
    if c.m.table.is_none() {
        return Err(Error::Validation(UNKNOWN_TABLE));
    }
    c.pop_expect(ValType::I32)?;
    c.pop_vals(&ty.params)?;
    c.push_vals(&ty.results);
    Ok(())
}

// ---------------- Stack Manipulation ----------------
fn validate_drop(c: &mut FuncCtx, _: u8) -> Result<(), Error> {
    if c.pop_val()?.cell_num() == 2 {
        c.info.wide.push(c.op_pos);
    }
    Ok(())
}

fn validate_select(c: &mut FuncCtx, _: u8) -> Result<(), Error> {
    c.pop_expect(ValType::I32)?;
    let t1 = c.pop_val()?;
    let t2 = c.pop_val()?;
    if t1 != t2 && t1 != ValType::Any && t2 != ValType::Any {
        return Err(Error::Validation(TYPE_MISMATCH));
    }
    let ty = if t1 == ValType::Any { t2 } else { t1 };
    if ty.cell_num() == 2 {
        c.info.wide.push(c.op_pos);
    }
    c.push_val(ty);
    Ok(())
}

// ---------------- Variable Instructions ----------------
fn validate_local(c: &mut FuncCtx, op: u8) -> Result<(), Error> {
    let ty = c.local_type()?;
    match op {
        opcodes::LOCAL_GET => c.push_val(ty),
        opcodes::LOCAL_SET => { c.pop_expect(ty)?; }
        _ => {
            c.pop_expect(ty)?;
            c.push_val(ty);
        }
    }
    Ok(())
}

fn validate_global(c: &mut FuncCtx, op: u8) -> Result<(), Error> {
    let (ty, is_mutable) = {
        let g = c.global()?;
        (g.ty, g.is_mutable)
    };
    if op == opcodes::GLOBAL_GET {
        c.push_val(ty);
    } else {
        if !is_mutable {
            return Err(Error::Validation(GLOBAL_IS_IMMUTABLE));
        }
        c.pop_expect(ty)?;
    }
    Ok(())
}

// ---------------- Memory Instructions ----------------
fn validate_memory_access(c: &mut FuncCtx, op: u8) -> Result<(), Error> {
    let arg = mem_op(op).ok_or(Error::Malformed(UNKNOWN_INSTRUCTION))?;
    let align_bits = c.it.read_u32()?;
    c.require_memory()?;
    if align_bits >= 32 {
        return Err(Error::Malformed(INT_TOO_LARGE));
    }
    let _offset = c.it.read_u32()?;
    if (1u64 << align_bits) > arg.width as u64 {
        return Err(Error::Validation(ALIGNMENT_TOO_LARGE));
    }
    if arg.store {
        c.pop_expect(arg.ty)?;
        c.pop_expect(ValType::I32)?;
    } else {
        c.pop_expect(ValType::I32)?;
        c.push_val(arg.ty);
    }
    Ok(())
}

fn validate_memory_size_grow(c: &mut FuncCtx, op: u8) -> Result<(), Error> {
    if c.it.read_u8()? != 0 {
        return Err(Error::Malformed(ZERO_FLAG_EXPECTED));
    }
    c.require_memory()?;
    if op == opcodes::MEMORY_GROW {
        c.pop_expect(ValType::I32)?;
    }
    c.push_val(ValType::I32);
    Ok(())
}

// ---------------- Constant Instructions ----------------
fn validate_const(c: &mut FuncCtx, op: u8) -> Result<(), Error> {
    let ty = match op {
        opcodes::I32_CONST => {
            let _: i32 = safe_read_sleb128(c.it.bytes, &mut c.it.idx, 32)?;
            ValType::I32
        }
        opcodes::I64_CONST => {
            let _: i64 = safe_read_sleb128(c.it.bytes, &mut c.it.idx, 64)?;
            ValType::I64
        }
        opcodes::F32_CONST => {
            c.it.read_bytes(4)?;
            ValType::F32
        }
        _ => {
            c.it.read_bytes(8)?;
            ValType::F64
        }
    };
    c.push_val(ty);
    Ok(())
}

// ---------------- Numeric Operations ----------------
fn validate_numeric(c: &mut FuncCtx, op: u8) -> Result<(), Error> {
    let (ins, outs) = numeric_sig(op).ok_or(Error::Malformed(UNKNOWN_INSTRUCTION))?;
    c.pop_vals(ins)?;
    c.push_vals(outs);
    Ok(())
}

fn validate_prefix_fc(c: &mut FuncCtx, _: u8) -> Result<(), Error> {
    let sub = c.it.read_u32()?;
    let (ins, outs) = sat_trunc_sig(sub).ok_or(Error::Malformed(UNKNOWN_INSTRUCTION))?;
    c.pop_vals(ins)?;
    c.push_vals(outs);
    Ok(())
}

// ---------------- Validator Table ----------------
fn build_validators_table() -> [ValidatorFn; 256] {
    let mut t: [ValidatorFn; 256] = [validate_missing; 256];
        // Control flow
        t[0x00] = validate_unreachable; t[0x01] = validate_nop;
        t[0x02] = validate_block; t[0x03] = validate_block;
        t[0x04] = validate_block; t[0x05] = validate_else;
        t[0x0b] = validate_end; t[0x0c] = validate_br;
        t[0x0d] = validate_br; t[0x0e] = validate_br_table;
        t[0x0f] = validate_return;
        // Call instructions
        t[0x10] = validate_call; t[0x11] = validate_call_indirect;
        // Stack manipulation
        t[0x1a] = validate_drop; t[0x1b] = validate_select;
        // Variable instructions
        for i in 0x20..=0x22 { t[i] = validate_local; }
        t[0x23] = validate_global; t[0x24] = validate_global;
        // Memory loads and stores
        for i in 0x28..=0x3e { t[i] = validate_memory_access; }
        t[0x3f] = validate_memory_size_grow; t[0x40] = validate_memory_size_grow;
        // Constants
        for i in 0x41..=0x44 { t[i] = validate_const; }
        // Numeric, conversions, sign extension
        for i in 0x45..=0xc4 { t[i] = validate_numeric; }
        t[PREFIX_FC as usize] = validate_prefix_fc;
    t
}

fn get_validators() -> &'static [ValidatorFn; 256] {
    static VALIDATORS: std::sync::LazyLock<Box<[ValidatorFn; 256]>> = std::sync::LazyLock::new(|| {
        Box::new(build_validators_table())
    });
    &**VALIDATORS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str) -> Result<Module, Error> {
        Module::compile(wat::parse_str(src).unwrap())
    }

    #[test]
    fn computes_stack_and_block_maxima() {
        let m = compile(r#"
            (module
              (func (param i32) (result i64)
                (block (result i64)
                  (loop
                    (if (local.get 0) (then (nop))))
                  (i64.const 1)
                  (i64.const 2)
                  (i64.add))))
        "#).unwrap();
        let f = &m.functions[0];
        assert_eq!(f.max_block_num, 4);
        assert_eq!(f.max_stack_cell_num, 4);
    }

    #[test]
    fn records_block_addresses() {
        let m = compile(r#"
            (module
              (func (param i32)
                (if (local.get 0) (then (nop)) (else (nop)))))
        "#).unwrap();
        let f = &m.functions[0];
        let if_pos = (f.body.start..f.body.end).find(|&p| m.bytes[p] == opcodes::IF).unwrap();
        let addr = m.side_table.find_block_addr(if_pos).unwrap();
        assert_eq!(m.bytes[addr.else_addr.unwrap()], opcodes::ELSE);
        assert_eq!(m.bytes[addr.end_addr], opcodes::END);
        assert!(addr.end_addr < f.code_end());
    }

    #[test]
    fn marks_wide_drops() {
        let m = compile(r#"
            (module
              (func
                (drop (i64.const 1))
                (drop (i32.const 1))))
        "#).unwrap();
        let f = &m.functions[0];
        let drops: Vec<usize> = (f.body.start..f.body.end).filter(|&p| m.bytes[p] == opcodes::DROP).collect();
        assert_eq!(drops.len(), 2);
        assert!(m.side_table.is_wide(drops[0]));
        assert!(!m.side_table.is_wide(drops[1]));
    }

    #[test]
    fn rejects_type_mismatch() {
        let res = compile(r#"(module (func (result i32) (i64.const 1)))"#);
        assert!(matches!(res, Err(Error::Validation(TYPE_MISMATCH))));
    }

    #[test]
    fn unreachable_code_is_polymorphic() {
        compile(r#"(module (func (result i32) (unreachable) (i32.add)))"#).unwrap();
        compile(r#"(module (func (result i64) (block (br 0)) (i64.const 0) (return) (drop)))"#).unwrap();
    }
}
