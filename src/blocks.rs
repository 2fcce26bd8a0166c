//! Live branch-block (label) records and the CSP replay that rebuilds them.
//!
//! The interpreter pushes labels through [`BranchBlock::for_function`] and
//! [`BranchBlock::for_construct`]; [`compute_block_stack_at`] re-derives the
//! same stack by scanning a body from its first instruction, using the same
//! side table and opcode signature table the validator produced.

use crate::debug_println;
use crate::error::*;
use crate::leb128::*;
use crate::module::{BlockAddr, Function, Module};
use crate::opcodes::{self, mem_op, numeric_sig, sat_trunc_sig};
use crate::types::{cell_num_of, BlockType};

/// One entry of a frame's label stack. Addresses are absolute positions in
/// the module bytes; `frame_sp` indexes the frame's cell window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BranchBlock {
    pub begin_addr: Option<usize>,
    pub target_addr: Option<usize>,
    pub frame_sp: Option<usize>,
    pub cell_num: u32,
}

impl BranchBlock {
    /// The outermost label of every frame: branching to it returns.
    pub fn for_function(func: &Function) -> Self {
        Self {
            begin_addr: Some(func.code_start()),
            target_addr: Some(func.code_end()),
            frame_sp: Some((func.param_cell_num + func.local_cell_num) as usize),
            cell_num: func.ret_cell_num,
        }
    }

    /// Label for a `block`, `loop` or `if` whose block type ends at `body`.
    /// `sp` is the stack pointer with the block params still on the stack.
    pub fn for_construct(op: u8, body: usize, sp: usize, cells: (u32, u32), addr: BlockAddr) -> Self {
        let (param_cells, result_cells) = cells;
        let frame_sp = sp.saturating_sub(param_cells as usize);
        if op == opcodes::LOOP {
            Self { begin_addr: Some(body), target_addr: Some(body), frame_sp: Some(frame_sp), cell_num: param_cells }
        } else {
            Self { begin_addr: Some(body), target_addr: Some(addr.end_addr), frame_sp: Some(frame_sp), cell_num: result_cells }
        }
    }
}

/// Rebuild the label stack that exists when execution of `func` reaches
/// `target_ip`, outermost label first.
///
/// Only control-flow effects are modelled: a shadow stack pointer follows
/// every instruction's cell delta so that each label's `frame_sp` matches a
/// live run. Scanning past `target_ip`, reaching the function's final `end`,
/// or meeting an opcode outside the supported set is an error.
pub fn compute_block_stack_at(module: &Module, func: &Function, target_ip: usize) -> Result<Vec<BranchBlock>, Error> {
    if func.is_import() {
        return Err(Error::restore(format!("cannot replay imported function {}", func.name)));
    }
    let bytes = &module.bytes[..func.body.end];
    let side = &module.side_table;
    let types = &module.types;

    let sp_bottom = (func.param_cell_num + func.local_cell_num) as usize;
    let mut blocks = Vec::with_capacity(func.max_block_num as usize);
    // Stack height each open construct leaves behind at its `end`.
    let mut end_heights = Vec::with_capacity(func.max_block_num as usize);
    blocks.push(BranchBlock::for_function(func));
    end_heights.push(sp_bottom + func.ret_cell_num as usize);

    let mut ip = func.code_start();
    let mut sp = sp_bottom;
    // Set after br, br_table, return and unreachable until the next end or
    // else. The operand stack is polymorphic there, so pops may run dry.
    let mut unreachable = false;
    macro_rules! pop {
        ($n:expr) => {{
            let n = $n as usize;
            let floor = blocks.last().and_then(|b| b.frame_sp).unwrap_or(sp_bottom);
            match sp.checked_sub(n).filter(|&s| s >= floor) {
                Some(s) => sp = s,
                None if unreachable => sp = floor,
                None => {
                    return Err(Error::restore(format!(
                        "replay of {} underflows the operand stack before {:#x}", func.name, ip
                    )));
                }
            }
        }};
    }
    macro_rules! push { ($n:expr) => { sp += $n as usize } }

    loop {
        if ip == target_ip {
            debug_println!("[csp] {} reached {:#x} with {} labels", func.name, ip, blocks.len());
            return Ok(blocks);
        }
        if ip > target_ip || ip >= func.code_end() {
            return Err(Error::restore(format!(
                "replay of {} passed ip {:#x} without reaching it", func.name, target_ip
            )));
        }
        let op_pos = ip;
        let op = bytes[ip];
        ip += 1;
        match op {
            opcodes::NOP => {}
            opcodes::UNREACHABLE | opcodes::RETURN => unreachable = true,
            opcodes::BLOCK | opcodes::LOOP => {
                let cells = BlockType::read(bytes, &mut ip)?.cells(types);
                let addr = side.find_block_addr(op_pos)?;
                let label = BranchBlock::for_construct(op, ip, sp, cells, addr);
                end_heights.push(label.frame_sp.unwrap_or(sp) + cells.1 as usize);
                blocks.push(label);
            }
            opcodes::IF => {
                let cells = BlockType::read(bytes, &mut ip)?.cells(types);
                let addr = side.find_block_addr(op_pos)?;
                pop!(1);
                let label = BranchBlock::for_construct(op, ip, sp, cells, addr);
                let end_height = label.frame_sp.unwrap_or(sp) + cells.1 as usize;
                match addr.else_addr {
                    Some(else_addr) => {
                        end_heights.push(end_height);
                        blocks.push(label);
                        if target_ip > else_addr {
                            ip = else_addr + 1;
                        }
                    }
                    None if target_ip <= addr.end_addr => {
                        end_heights.push(end_height);
                        blocks.push(label);
                    }
                    None => {
                        ip = addr.end_addr + 1;
                        sp = end_height;
                    }
                }
            }
            opcodes::ELSE => {
                let top = blocks.last().ok_or(Error::restore("else without enclosing if"))?;
                ip = top.target_addr.ok_or(Error::restore("if label without target"))?;
                unreachable = false;
            }
            opcodes::END => {
                if blocks.len() == 1 {
                    return Err(Error::restore(format!(
                        "replay of {} reached the function end before ip {:#x}", func.name, target_ip
                    )));
                }
                blocks.pop();
                sp = end_heights.pop().unwrap_or(sp_bottom);
                unreachable = false;
            }
            opcodes::BR => {
                skip_leb128(bytes, &mut ip)?;
                unreachable = true;
            }
            opcodes::BR_IF => {
                skip_leb128(bytes, &mut ip)?;
                pop!(1);
            }
            opcodes::BR_TABLE => {
                let n: u32 = read_leb128(bytes, &mut ip)?;
                for _ in 0..=n {
                    skip_leb128(bytes, &mut ip)?;
                }
                pop!(1);
                unreachable = true;
            }
            opcodes::CALL => {
                let idx: u32 = read_leb128(bytes, &mut ip)?;
                let callee = module.functions.get(idx as usize)
                    .ok_or(Error::restore(format!("call to unknown function {idx}")))?;
                pop!(callee.param_cell_num);
                push!(callee.ret_cell_num);
            }
            opcodes::CALL_INDIRECT => {
                let idx: u32 = read_leb128(bytes, &mut ip)?;
                ip += 1;
                let ty = types.get(idx as usize)
                    .ok_or(Error::restore(format!("call_indirect with unknown type {idx}")))?;
                pop!(1);
                pop!(ty.param_cell_num());
                push!(ty.ret_cell_num());
            }
            opcodes::DROP => pop!(if side.is_wide(op_pos) { 2 } else { 1 }),
            opcodes::SELECT => pop!(if side.is_wide(op_pos) { 3 } else { 2 }),
            opcodes::LOCAL_GET | opcodes::LOCAL_SET | opcodes::LOCAL_TEE => {
                let idx: u32 = read_leb128(bytes, &mut ip)?;
                let ty = func.locals.get(idx as usize)
                    .ok_or(Error::restore(format!("unknown local {idx}")))?;
                match op {
                    opcodes::LOCAL_GET => push!(ty.cell_num()),
                    opcodes::LOCAL_SET => pop!(ty.cell_num()),
                    _ => {}
                }
            }
            opcodes::GLOBAL_GET | opcodes::GLOBAL_SET => {
                let idx: u32 = read_leb128(bytes, &mut ip)?;
                let g = module.globals.get(idx as usize)
                    .ok_or(Error::restore(format!("unknown global {idx}")))?;
                if op == opcodes::GLOBAL_GET { push!(g.ty.cell_num()) } else { pop!(g.ty.cell_num()) }
            }
            opcodes::MEMORY_SIZE => {
                ip += 1;
                push!(1);
            }
            opcodes::MEMORY_GROW => ip += 1,
            opcodes::I32_CONST | opcodes::I64_CONST => {
                skip_leb128(bytes, &mut ip)?;
                push!(if op == opcodes::I32_CONST { 1 } else { 2 });
            }
            opcodes::F32_CONST => {
                ip += 4;
                push!(1);
            }
            opcodes::F64_CONST => {
                ip += 8;
                push!(2);
            }
            opcodes::PREFIX_FC => {
                let sub: u32 = read_leb128(bytes, &mut ip)?;
                let (ins, outs) = sat_trunc_sig(sub)
                    .ok_or(Error::restore(format!("unsupported 0xfc sub-opcode {sub} at {op_pos:#x}")))?;
                pop!(cell_num_of(ins));
                push!(cell_num_of(outs));
            }
            _ => {
                if let Some(arg) = mem_op(op) {
                    skip_leb128(bytes, &mut ip)?;
                    skip_leb128(bytes, &mut ip)?;
                    if arg.store {
                        pop!(1 + arg.ty.cell_num());
                    } else {
                        pop!(1);
                        push!(arg.ty.cell_num());
                    }
                } else if let Some((ins, outs)) = numeric_sig(op) {
                    pop!(cell_num_of(ins));
                    push!(cell_num_of(outs));
                } else {
                    return Err(Error::restore(format!("unknown opcode {op:#04x} at {op_pos:#x}")));
                }
            }
        }
    }
}
