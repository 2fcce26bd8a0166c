//! Cell-stack bytecode interpreter.
//!
//! Frames live in [`ExecEnv::frames`]; the frame being executed is taken out
//! of the chain while it runs and put back on a call, a host call or a
//! suspension. A suspended environment can be captured as is and later
//! continued with [`resume`], in this process or in a restored one.

use paste::paste;

use crate::blocks::BranchBlock;
use crate::debug_println;
use crate::error::*;
use crate::exec_env::{ExecEnv, InterpFrame, SUSPEND_FLAG};
use crate::leb128::{read_leb128, read_sleb128};
use crate::lock;
use crate::module::Function;
use crate::opcodes;
use crate::types::{BlockType, WasmValue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Returned(Vec<WasmValue>),
    Suspended,
}

/// Callbacks at the interpreter's safepoints.
pub trait ExecHooks {
    /// Polled before every call and after every taken branch.
    fn should_suspend(&mut self) -> bool { false }
    /// Called before a host function runs. Returning true suspends the
    /// environment with the call still pending.
    fn on_host_call(&mut self, _env: &ExecEnv) -> bool { false }
    fn enter_host(&mut self, _env: &ExecEnv) {}
    fn leave_host(&mut self, _env: &ExecEnv) {}
}

pub struct NoHooks;

impl ExecHooks for NoHooks {}

enum Step {
    Call(InterpFrame),
    /// `extra` operand cells sit above the arguments and are dropped with them.
    Host { func: u32, resume_at: usize, extra: usize },
    Return,
    Suspend,
}

/// Start `func_idx` on an idle environment.
pub fn invoke(env: &mut ExecEnv, func_idx: u32, args: &[WasmValue], hooks: &mut dyn ExecHooks) -> Result<Outcome, Error> {
    let module = env.module_inst.module.clone();
    let func = module.functions.get(func_idx as usize).ok_or(Error::Link(UNKNOWN_FUNC))?;
    if func.ty.params.len() != args.len() {
        return Err(Error::Trap(INVALID_NUM_ARG));
    }
    if func.is_import() {
        let host = env.module_inst.host_func(func_idx).ok_or(Error::Link(UNKNOWN_IMPORT))?.clone();
        return Ok(Outcome::Returned((host.func)(&env.module_inst, args)?));
    }

    env.unwind();
    let dummy = env.alloc_dummy_frame(func.ret_cell_num)?;
    env.frames.push(dummy);
    let mut frame = env.alloc_frame(func)?;
    let mut params = Vec::with_capacity(func.param_cell_num as usize);
    for (v, ty) in args.iter().zip(&func.ty.params) {
        v.write_cells(*ty, &mut params);
    }
    frame.cells[..params.len()].copy_from_slice(&params);
    frame.blocks.push(BranchBlock::for_function(func));
    frame.ip = Some(func.code_start());
    env.frames.push(frame);
    run(env, hooks)
}

/// Continue a suspended environment from its innermost frame.
pub fn resume(env: &mut ExecEnv, hooks: &mut dyn ExecHooks) -> Result<Outcome, Error> {
    if env.frames.len() < 2 {
        return Err(Error::Trap(NOT_SUSPENDED));
    }
    env.suspend_flags &= !SUSPEND_FLAG;
    run(env, hooks)
}

fn run(env: &mut ExecEnv, hooks: &mut dyn ExecHooks) -> Result<Outcome, Error> {
    let res = drive(env, hooks);
    if res.is_err() {
        env.unwind();
    }
    res
}

fn drive(env: &mut ExecEnv, hooks: &mut dyn ExecHooks) -> Result<Outcome, Error> {
    let module = env.module_inst.module.clone();
    loop {
        let mut frame = env.frames.pop().ok_or(Error::Trap(NOT_SUSPENDED))?;
        match execute(env, &mut frame, hooks)? {
            Step::Call(callee) => {
                env.frames.push(frame);
                env.frames.push(callee);
            }
            Step::Suspend => {
                env.frames.push(frame);
                env.suspend_flags |= SUSPEND_FLAG;
                return Ok(Outcome::Suspended);
            }
            Step::Host { func, resume_at, extra } => {
                env.frames.push(frame);
                if hooks.on_host_call(env) {
                    env.suspend_flags |= SUSPEND_FLAG;
                    return Ok(Outcome::Suspended);
                }
                call_host(env, func, resume_at, extra, hooks)?;
            }
            Step::Return => {
                let idx = frame.function.ok_or(Error::Trap(STACK_UNDERFLOW))?;
                let func = &module.functions[idx as usize];
                let ret = func.ret_cell_num as usize;
                let results = frame.cells[frame.sp - ret..frame.sp].to_vec();
                env.free_frame(&frame);
                let caller = env.frames.last_mut().ok_or(Error::Trap(STACK_UNDERFLOW))?;
                caller.cells[caller.sp..caller.sp + ret].copy_from_slice(&results);
                caller.sp += ret;
                if caller.function.is_none() {
                    let mut values = Vec::with_capacity(func.ty.results.len());
                    let mut off = 0;
                    for ty in &func.ty.results {
                        values.push(WasmValue::read_cells(*ty, &results[off..]));
                        off += ty.cell_num() as usize;
                    }
                    env.unwind();
                    return Ok(Outcome::Returned(values));
                }
            }
        }
    }
}

fn call_host(env: &mut ExecEnv, func_idx: u32, resume_at: usize, extra: usize, hooks: &mut dyn ExecHooks) -> Result<(), Error> {
    let inst = env.module_inst.clone();
    let host = inst.host_func(func_idx).ok_or(Error::Link(UNKNOWN_IMPORT))?;
    hooks.enter_host(env);
    let frame = env.frames.last_mut().ok_or(Error::Trap(STACK_UNDERFLOW))?;
    let base = frame.sp
        .checked_sub(host.ty.param_cell_num() as usize + extra)
        .ok_or(Error::Trap(STACK_UNDERFLOW))?;
    let mut args = Vec::with_capacity(host.ty.params.len());
    let mut off = base;
    for ty in &host.ty.params {
        args.push(WasmValue::read_cells(*ty, &frame.cells[off..]));
        off += ty.cell_num() as usize;
    }
    let results = (host.func)(&inst, &args);
    hooks.leave_host(env);
    let results = results?;
    if results.len() != host.ty.results.len() {
        return Err(Error::Trap(INVALID_NUM_ARG));
    }
    let frame = env.frames.last_mut().ok_or(Error::Trap(STACK_UNDERFLOW))?;
    frame.sp = base;
    for (v, ty) in results.iter().zip(&host.ty.results) {
        frame.push_raw(v.0, ty.cell_num() as usize)?;
    }
    frame.ip = Some(resume_at);
    Ok(())
}

fn execute(env: &mut ExecEnv, frame: &mut InterpFrame, hooks: &mut dyn ExecHooks) -> Result<Step, Error> {
    let inst = env.module_inst.clone();
    let module = inst.module.clone();
    let bytes = &module.bytes;
    let func_idx = frame.function.ok_or(Error::Trap(STACK_UNDERFLOW))?;
    let func: &Function = &module.functions[func_idx as usize];
    let code_start = func.code_start();
    let mem = inst.memory(0);
    let mut ip = frame.ip.ok_or(Error::Trap(NOT_SUSPENDED))?;
    let mut op_pos;

    macro_rules! pop { ($type:ident) => { paste! { frame.[<pop_ $type>]()? } } }
    macro_rules! push { ($type:ident, $v:expr) => { paste! { frame.[<push_ $type>]($v)? } } }
    macro_rules! safepoint { ($at:expr) => {
        if hooks.should_suspend() {
            frame.ip = Some($at);
            return Ok(Step::Suspend);
        }
    } }
    macro_rules! branch { ($depth:expr) => {{
        let keep = frame.blocks.len().checked_sub($depth as usize).ok_or(Error::Validation(UNKNOWN_LABEL))?;
        frame.blocks.truncate(keep);
        if keep <= 1 {
            return Ok(Step::Return);
        }
        let label = frame.blocks[keep - 1];
        let n = label.cell_num as usize;
        let dst = label.frame_sp.ok_or(Error::Trap(STACK_UNDERFLOW))?;
        frame.cells.copy_within(frame.sp - n..frame.sp, dst);
        frame.sp = dst + n;
        ip = label.target_addr.ok_or(Error::Trap(STACK_UNDERFLOW))?;
        safepoint!(ip);
    }}}
    macro_rules! call { ($callee:expr) => {{
        let callee: &Function = $callee;
        if callee.is_import() {
            frame.ip = Some(op_pos);
            return Ok(Step::Host { func: callee.index, resume_at: ip, extra: 0 });
        }
        let mut next = env.alloc_frame(callee)?;
        let n = callee.param_cell_num as usize;
        let base = frame.sp.checked_sub(n).ok_or(Error::Trap(STACK_UNDERFLOW))?;
        next.cells[..n].copy_from_slice(&frame.cells[base..frame.sp]);
        next.blocks.push(BranchBlock::for_function(callee));
        next.ip = Some(callee.code_start());
        frame.sp = base;
        frame.ip = Some(ip);
        return Ok(Step::Call(next));
    }}}
    macro_rules! binary {
        ($type:ident, $op:tt) => {{
            let b = pop!($type);
            let a = pop!($type);
            push!($type, a $op b);
        }};
        ($type:ident, .$method:ident) => {{
            let b = pop!($type);
            let a = pop!($type);
            push!($type, a.$method(b));
        }};
    }
    macro_rules! compare { ($type:ident, $op:tt) => {{
        let b = pop!($type);
        let a = pop!($type);
        push!(u32, (a $op b) as u32);
    }}}
    macro_rules! shift {
        (u32, $op:tt) => {{
            let b = pop!(u32) % 32;
            let a = pop!(u32);
            push!(u32, a $op b);
        }};
        (u64, $op:tt) => {{
            let b = pop!(u64) % 64;
            let a = pop!(u64);
            push!(u64, a $op b);
        }};
    }
    macro_rules! shr_s { ($int_type:ident, $uint_type:ident, $bits:literal) => {{
        let b = pop!($uint_type) % $bits;
        let a = pop!($int_type);
        push!($int_type, a >> b);
    }}}
    macro_rules! rotate {
        (u32, $dir:ident) => {{
            let b = pop!(u32);
            let a = pop!(u32);
            paste! { push!(u32, a.[<rotate_ $dir>](b % 32)); }
        }};
        (u64, $dir:ident) => {{
            let b = pop!(u64);
            let a = pop!(u64);
            paste! { push!(u64, a.[<rotate_ $dir>]((b % 64) as u32)); }
        }};
    }
    macro_rules! unary { ($type:ident, $f:expr) => {{
        let a = pop!($type);
        push!($type, $f(a));
    }}}
    macro_rules! minmax {
        ($type:ident, min) => {{ minmax!(@impl $type, min, true) }};
        ($type:ident, max) => {{ minmax!(@impl $type, max, false) }};
        (@impl $type:ident, $op:ident, $want_negative:literal) => {{
            let b = pop!($type);
            let a = pop!($type);
            let result = if a.is_nan() {
                a
            } else if b.is_nan() {
                b
            } else if a == b && a == 0.0 {
                const SIGN_BIT_SHIFT: usize = std::mem::size_of::<$type>() * 8 - 1;
                let a_has_sign = a.to_bits() >> SIGN_BIT_SHIFT != 0;
                if a_has_sign == $want_negative { a } else { b }
            } else {
                a.$op(b)
            };
            push!($type, result);
        }};
    }
    macro_rules! copysign { ($type:ident) => {{
        let b = pop!($type);
        let a = pop!($type);
        push!($type, a.copysign(b));
    }}}
    macro_rules! nearest { ($type:ident) => {{
        let x = pop!($type);
        let y = if x.is_nan() || x.is_infinite() {
            x
        } else {
            let lower = x.floor();
            let upper = x.ceil();
            let dl = x - lower;
            let du = upper - x;
            if dl < du {
                lower
            } else if dl > du {
                upper
            } else if lower % 2.0 == 0.0 {
                lower
            } else {
                upper
            }
        };
        push!($type, y.copysign(x));
    }}}
    macro_rules! convert { ($src_type:ident -> $dst_type:ident) => {{
        let v = pop!($src_type);
        push!($dst_type, v as $dst_type);
    }}}
    macro_rules! trunc { ($src_type:ident -> $dst_type:ident : $min:expr, $max:expr) => {{
        let x = pop!($src_type);
        if x.is_nan() {
            return Err(Error::Trap(INVALID_CONV_TO_INT));
        }
        if !x.is_finite() || x <= $min || x >= $max {
            return Err(Error::Trap(INTEGER_OVERFLOW));
        }
        push!($dst_type, x as $dst_type);
    }}}
    // `as` saturates and maps NaN to zero, which is exactly trunc_sat.
    macro_rules! trunc_sat { ($src_type:ident -> $dst_type:ident) => {{
        let x = pop!($src_type);
        push!($dst_type, x as $dst_type);
    }}}
    macro_rules! extend { ($type:ident, $narrow:ident) => {{
        let x = pop!($type);
        push!($type, x as $narrow as $type);
    }}}
    macro_rules! div_s { ($int_type:ident) => {{
        let b = pop!($int_type);
        let a = pop!($int_type);
        if b == 0 { return Err(Error::Trap(DIVIDE_BY_ZERO)); }
        if a == $int_type::MIN && b == -1 { return Err(Error::Trap(INTEGER_OVERFLOW)); }
        push!($int_type, a / b);
    }}}
    macro_rules! div_u { ($uint_type:ident) => {{
        let b = pop!($uint_type);
        let a = pop!($uint_type);
        if b == 0 { return Err(Error::Trap(DIVIDE_BY_ZERO)); }
        push!($uint_type, a / b);
    }}}
    macro_rules! rem_s { ($int_type:ident) => {{
        let b = pop!($int_type);
        let a = pop!($int_type);
        if b == 0 { return Err(Error::Trap(DIVIDE_BY_ZERO)); }
        push!($int_type, if a == $int_type::MIN && b == -1 { 0 } else { a % b });
    }}}
    macro_rules! rem_u { ($uint_type:ident) => {{
        let b = pop!($uint_type);
        let a = pop!($uint_type);
        if b == 0 { return Err(Error::Trap(DIVIDE_BY_ZERO)); }
        push!($uint_type, a % b);
    }}}
    macro_rules! memory { () => {
        mem.as_ref().ok_or(Error::Validation(UNKNOWN_MEMORY))?
    } }
    macro_rules! load { ($method:ident, $dst:ident) => {{
        let _align: u32 = read_leb128(bytes, &mut ip)?;
        let offset: u32 = read_leb128(bytes, &mut ip)?;
        let addr = pop!(u32);
        let v = lock(memory!()).$method(addr, offset)?;
        push!($dst, v as $dst);
    }}}
    macro_rules! store { ($method:ident, $src:ident, $narrow:ty) => {{
        let _align: u32 = read_leb128(bytes, &mut ip)?;
        let offset: u32 = read_leb128(bytes, &mut ip)?;
        let v = pop!($src);
        let addr = pop!(u32);
        lock(memory!()).$method(addr, offset, v as $narrow)?;
    }}}

    loop {
        if let Some((bp_func, bp_off)) = env.breakpoint {
            if bp_func == func_idx && ip == code_start + bp_off as usize {
                debug_println!("[interp] breakpoint hit in {} at {:#x}", func.name, ip);
                env.breakpoint = None;
                frame.ip = Some(ip);
                return Ok(Step::Suspend);
            }
        }
        op_pos = ip;
        let op = *bytes.get(ip).ok_or(Error::Malformed(UNEXPECTED_END))?;
        ip += 1;
        match op {
            opcodes::UNREACHABLE => return Err(Error::Trap(UNREACHABLE)),
            opcodes::NOP | 0xbc..=0xbf => {} // reinterprets keep the raw bits
            opcodes::BLOCK | opcodes::LOOP => {
                let cells = BlockType::read(bytes, &mut ip)?.cells(&module.types);
                let addr = module.side_table.find_block_addr(op_pos)?;
                frame.blocks.push(BranchBlock::for_construct(op, ip, frame.sp, cells, addr));
            }
            opcodes::IF => {
                let cells = BlockType::read(bytes, &mut ip)?.cells(&module.types);
                let addr = module.side_table.find_block_addr(op_pos)?;
                let cond = pop!(u32);
                if cond != 0 {
                    frame.blocks.push(BranchBlock::for_construct(op, ip, frame.sp, cells, addr));
                } else if let Some(else_addr) = addr.else_addr {
                    frame.blocks.push(BranchBlock::for_construct(op, ip, frame.sp, cells, addr));
                    ip = else_addr + 1;
                } else {
                    ip = addr.end_addr + 1;
                }
            }
            opcodes::ELSE => {
                let top = frame.blocks.last().ok_or(Error::Validation(ELSE_MUST_CLOSE_IF))?;
                ip = top.target_addr.ok_or(Error::Validation(ELSE_MUST_CLOSE_IF))?;
            }
            opcodes::END => {
                if frame.blocks.len() <= 1 {
                    return Ok(Step::Return);
                }
                frame.blocks.pop();
            }
            opcodes::BR => {
                let depth: u32 = read_leb128(bytes, &mut ip)?;
                branch!(depth);
            }
            opcodes::BR_IF => {
                let depth: u32 = read_leb128(bytes, &mut ip)?;
                if pop!(u32) != 0 {
                    branch!(depth);
                }
            }
            opcodes::BR_TABLE => {
                let v = pop!(u32);
                let n_targets: u32 = read_leb128(bytes, &mut ip)?;
                let mut depth = None;
                for i in 0..n_targets {
                    let t: u32 = read_leb128(bytes, &mut ip)?;
                    if i == v { depth = Some(t); }
                }
                let default_t: u32 = read_leb128(bytes, &mut ip)?;
                branch!(depth.unwrap_or(default_t));
            }
            opcodes::RETURN => return Ok(Step::Return),
            opcodes::CALL => {
                safepoint!(op_pos);
                let idx: u32 = read_leb128(bytes, &mut ip)?;
                let callee = module.functions.get(idx as usize).ok_or(Error::Validation(UNKNOWN_FUNC))?;
                call!(callee);
            }
            opcodes::CALL_INDIRECT => {
                safepoint!(op_pos);
                let type_idx: u32 = read_leb128(bytes, &mut ip)?;
                ip += 1; // table index
                let elem_idx = pop!(u32);
                let target = inst.table_get(0, elem_idx)?;
                let callee = module.functions.get(target as usize).ok_or(Error::Trap(UNDEF_ELEM))?;
                if module.types.get(type_idx as usize) != Some(&callee.ty) {
                    return Err(Error::Trap(INDIRECT_CALL_MISMATCH));
                }
                if callee.is_import() {
                    // Leave the element index in place so a suspension can
                    // re-execute the whole call_indirect.
                    frame.sp += 1;
                    frame.ip = Some(op_pos);
                    return Ok(Step::Host { func: callee.index, resume_at: ip, extra: 1 });
                }
                call!(callee);
            }
            opcodes::DROP => {
                let n = if module.side_table.is_wide(op_pos) { 2 } else { 1 };
                frame.pop_raw(n)?;
            }
            opcodes::SELECT => {
                let n = if module.side_table.is_wide(op_pos) { 2 } else { 1 };
                let cond = pop!(u32);
                let v2 = frame.pop_raw(n)?;
                let v1 = frame.pop_raw(n)?;
                frame.push_raw(if cond != 0 { v1 } else { v2 }, n)?;
            }
            opcodes::LOCAL_GET | opcodes::LOCAL_SET | opcodes::LOCAL_TEE => {
                let idx: u32 = read_leb128(bytes, &mut ip)?;
                let ty = *func.locals.get(idx as usize).ok_or(Error::Validation(UNKNOWN_LOCAL))?;
                let off = func.local_offsets[idx as usize] as usize;
                let n = ty.cell_num() as usize;
                match op {
                    opcodes::LOCAL_GET => {
                        let raw = WasmValue::read_cells(ty, &frame.cells[off..off + n]).0;
                        frame.push_raw(raw, n)?;
                    }
                    opcodes::LOCAL_SET => {
                        let raw = frame.pop_raw(n)?;
                        frame.cells[off] = raw as u32;
                        if n == 2 { frame.cells[off + 1] = (raw >> 32) as u32; }
                    }
                    _ => {
                        let top = frame.sp.checked_sub(n).ok_or(Error::Trap(STACK_UNDERFLOW))?;
                        frame.cells.copy_within(top..frame.sp, off);
                    }
                }
            }
            opcodes::GLOBAL_GET => {
                let idx: u32 = read_leb128(bytes, &mut ip)?;
                let n = module.globals.get(idx as usize).ok_or(Error::Validation(UNKNOWN_GLOBAL))?.ty.cell_num();
                let v = inst.get_global(idx)?;
                frame.push_raw(v.0, n as usize)?;
            }
            opcodes::GLOBAL_SET => {
                let idx: u32 = read_leb128(bytes, &mut ip)?;
                let n = module.globals.get(idx as usize).ok_or(Error::Validation(UNKNOWN_GLOBAL))?.ty.cell_num();
                let v = frame.pop_raw(n as usize)?;
                inst.set_global(idx, WasmValue(v))?;
            }
            // Loads
            0x28 => load!(load_u32, u32),
            0x29 => load!(load_u64, u64),
            0x2a => load!(load_f32, f32),
            0x2b => load!(load_f64, f64),
            0x2c => load!(load_i8, i32),
            0x2d => load!(load_u8, u32),
            0x2e => load!(load_i16, i32),
            0x2f => load!(load_u16, u32),
            0x30 => load!(load_i8, i64),
            0x31 => load!(load_u8, u64),
            0x32 => load!(load_i16, i64),
            0x33 => load!(load_u16, u64),
            0x34 => load!(load_i32, i64),
            0x35 => load!(load_u32, u64),
            // Stores
            0x36 => store!(store_u32, u32, u32),
            0x37 => store!(store_u64, u64, u64),
            0x38 => store!(store_f32, f32, f32),
            0x39 => store!(store_f64, f64, f64),
            0x3a => store!(store_u8, u32, u8),
            0x3b => store!(store_u16, u32, u16),
            0x3c => store!(store_u8, u64, u8),
            0x3d => store!(store_u16, u64, u16),
            0x3e => store!(store_u32, u64, u32),
            opcodes::MEMORY_SIZE => {
                ip += 1;
                let size = lock(memory!()).size();
                push!(u32, size);
            }
            opcodes::MEMORY_GROW => {
                ip += 1;
                let delta = pop!(u32);
                let old = lock(memory!()).grow(delta);
                push!(u32, old);
            }
            opcodes::I32_CONST => {
                let v: i32 = read_sleb128(bytes, &mut ip)?;
                push!(i32, v);
            }
            opcodes::I64_CONST => {
                let v: i64 = read_sleb128(bytes, &mut ip)?;
                push!(i64, v);
            }
            opcodes::F32_CONST => {
                let raw = bytes.get(ip..ip + 4).ok_or(Error::Malformed(UNEXPECTED_END))?;
                frame.push_raw(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64, 1)?;
                ip += 4;
            }
            opcodes::F64_CONST => {
                let raw = bytes.get(ip..ip + 8).ok_or(Error::Malformed(UNEXPECTED_END))?;
                let mut b = [0u8; 8];
                b.copy_from_slice(raw);
                frame.push_raw(u64::from_le_bytes(b), 2)?;
                ip += 8;
            }
            // i32 comparison
            0x45 => { let x = pop!(u32); push!(u32, (x == 0) as u32); } // i32.eqz
            0x46 => compare!(u32, ==),
            0x47 => compare!(u32, !=),
            0x48 => compare!(i32, <),
            0x49 => compare!(u32, <),
            0x4a => compare!(i32, >),
            0x4b => compare!(u32, >),
            0x4c => compare!(i32, <=),
            0x4d => compare!(u32, <=),
            0x4e => compare!(i32, >=),
            0x4f => compare!(u32, >=),
            // i64 comparison
            0x50 => { let x = pop!(u64); push!(u32, (x == 0) as u32); } // i64.eqz
            0x51 => compare!(u64, ==),
            0x52 => compare!(u64, !=),
            0x53 => compare!(i64, <),
            0x54 => compare!(u64, <),
            0x55 => compare!(i64, >),
            0x56 => compare!(u64, >),
            0x57 => compare!(i64, <=),
            0x58 => compare!(u64, <=),
            0x59 => compare!(i64, >=),
            0x5a => compare!(u64, >=),
            // f32 / f64 comparison
            0x5b => compare!(f32, ==),
            0x5c => compare!(f32, !=),
            0x5d => compare!(f32, <),
            0x5e => compare!(f32, >),
            0x5f => compare!(f32, <=),
            0x60 => compare!(f32, >=),
            0x61 => compare!(f64, ==),
            0x62 => compare!(f64, !=),
            0x63 => compare!(f64, <),
            0x64 => compare!(f64, >),
            0x65 => compare!(f64, <=),
            0x66 => compare!(f64, >=),
            // i32 arithmetic
            0x67 => unary!(u32, |x: u32| x.leading_zeros()),
            0x68 => unary!(u32, |x: u32| x.trailing_zeros()),
            0x69 => unary!(u32, |x: u32| x.count_ones()),
            0x6a => binary!(u32, .wrapping_add),
            0x6b => binary!(u32, .wrapping_sub),
            0x6c => binary!(u32, .wrapping_mul),
            0x6d => div_s!(i32),
            0x6e => div_u!(u32),
            0x6f => rem_s!(i32),
            0x70 => rem_u!(u32),
            0x71 => binary!(u32, &),
            0x72 => binary!(u32, |),
            0x73 => binary!(u32, ^),
            0x74 => shift!(u32, <<),
            0x75 => shr_s!(i32, u32, 32),
            0x76 => shift!(u32, >>),
            0x77 => rotate!(u32, left),
            0x78 => rotate!(u32, right),
            // i64 arithmetic
            0x79 => unary!(u64, |x: u64| x.leading_zeros() as u64),
            0x7a => unary!(u64, |x: u64| x.trailing_zeros() as u64),
            0x7b => unary!(u64, |x: u64| x.count_ones() as u64),
            0x7c => binary!(u64, .wrapping_add),
            0x7d => binary!(u64, .wrapping_sub),
            0x7e => binary!(u64, .wrapping_mul),
            0x7f => div_s!(i64),
            0x80 => div_u!(u64),
            0x81 => rem_s!(i64),
            0x82 => rem_u!(u64),
            0x83 => binary!(u64, &),
            0x84 => binary!(u64, |),
            0x85 => binary!(u64, ^),
            0x86 => shift!(u64, <<),
            0x87 => shr_s!(i64, u64, 64),
            0x88 => shift!(u64, >>),
            0x89 => rotate!(u64, left),
            0x8a => rotate!(u64, right),
            // f32 arithmetic
            0x8b => unary!(f32, |x: f32| x.abs()),
            0x8c => unary!(f32, |x: f32| -x),
            0x8d => unary!(f32, |x: f32| x.ceil()),
            0x8e => unary!(f32, |x: f32| x.floor()),
            0x8f => unary!(f32, |x: f32| x.trunc()),
            0x90 => nearest!(f32),
            0x91 => unary!(f32, |x: f32| x.sqrt()),
            0x92 => binary!(f32, +),
            0x93 => binary!(f32, -),
            0x94 => binary!(f32, *),
            0x95 => binary!(f32, /),
            0x96 => minmax!(f32, min),
            0x97 => minmax!(f32, max),
            0x98 => copysign!(f32),
            // f64 arithmetic
            0x99 => unary!(f64, |x: f64| x.abs()),
            0x9a => unary!(f64, |x: f64| -x),
            0x9b => unary!(f64, |x: f64| x.ceil()),
            0x9c => unary!(f64, |x: f64| x.floor()),
            0x9d => unary!(f64, |x: f64| x.trunc()),
            0x9e => nearest!(f64),
            0x9f => unary!(f64, |x: f64| x.sqrt()),
            0xa0 => binary!(f64, +),
            0xa1 => binary!(f64, -),
            0xa2 => binary!(f64, *),
            0xa3 => binary!(f64, /),
            0xa4 => minmax!(f64, min),
            0xa5 => minmax!(f64, max),
            0xa6 => copysign!(f64),
            // conversions
            0xa7 => convert!(u64 -> u32),
            0xa8 => trunc!(f32 -> i32 : -2147483777.0, 2147483648.0),
            0xa9 => trunc!(f32 -> u32 : -1.0, 4294967296.0),
            0xaa => trunc!(f64 -> i32 : -2147483649.0, 2147483648.0),
            0xab => trunc!(f64 -> u32 : -1.0, 4294967296.0),
            0xac => convert!(i32 -> i64),
            0xad => convert!(u32 -> u64),
            0xae => trunc!(f32 -> i64 : -9223373136366404000.0, 9223372036854776000.0),
            0xaf => trunc!(f32 -> u64 : -1.0, 18446744073709552000.0),
            0xb0 => trunc!(f64 -> i64 : -9223372036854777856.0, 9223372036854776000.0),
            0xb1 => trunc!(f64 -> u64 : -1.0, 18446744073709552000.0),
            0xb2 => convert!(i32 -> f32),
            0xb3 => convert!(u32 -> f32),
            0xb4 => convert!(i64 -> f32),
            0xb5 => convert!(u64 -> f32),
            0xb6 => convert!(f64 -> f32),
            0xb7 => convert!(i32 -> f64),
            0xb8 => convert!(u32 -> f64),
            0xb9 => convert!(i64 -> f64),
            0xba => convert!(u64 -> f64),
            0xbb => convert!(f32 -> f64),
            // sign extension
            0xc0 => extend!(i32, i8),
            0xc1 => extend!(i32, i16),
            0xc2 => extend!(i64, i8),
            0xc3 => extend!(i64, i16),
            0xc4 => extend!(i64, i32),
            opcodes::PREFIX_FC => {
                let sub: u32 = read_leb128(bytes, &mut ip)?;
                match sub {
                    0 => trunc_sat!(f32 -> i32),
                    1 => trunc_sat!(f32 -> u32),
                    2 => trunc_sat!(f64 -> i32),
                    3 => trunc_sat!(f64 -> u32),
                    4 => trunc_sat!(f32 -> i64),
                    5 => trunc_sat!(f32 -> u64),
                    6 => trunc_sat!(f64 -> i64),
                    7 => trunc_sat!(f64 -> u64),
                    _ => return Err(Error::Malformed(UNKNOWN_INSTRUCTION)),
                }
            }
            _ => return Err(Error::Malformed(UNKNOWN_INSTRUCTION)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use crate::instance::{instantiate, Imports, InstanceOptions};
    use crate::module::Module;
    use crate::types::ValType;

    fn env_with(src: &str, imports: &Imports) -> ExecEnv {
        let m = Arc::new(Module::compile(wat::parse_str(src).unwrap()).unwrap());
        let opts = InstanceOptions { stack_size: 1 << 16, ..Default::default() };
        let inst = instantiate(m, imports, opts).unwrap();
        ExecEnv::new(inst, 1 << 16)
    }

    fn call(env: &mut ExecEnv, name: &str, args: &[WasmValue]) -> Result<Vec<WasmValue>, Error> {
        let idx = env.module_inst.module.export_func(name)?;
        match invoke(env, idx, args, &mut NoHooks)? {
            Outcome::Returned(v) => Ok(v),
            Outcome::Suspended => panic!("unexpected suspension"),
        }
    }

    const FIB: &str = r#"
        (module
          (func $fib (export "fib") (param i64) (result i64)
            (if (result i64) (i64.lt_u (local.get 0) (i64.const 2))
              (then (local.get 0))
              (else (i64.add
                (call $fib (i64.sub (local.get 0) (i64.const 1)))
                (call $fib (i64.sub (local.get 0) (i64.const 2)))))))
          (func (export "sum") (param i32) (result i32) (local i32)
            (block
              (loop
                (br_if 1 (i32.eqz (local.get 0)))
                (local.set 1 (i32.add (local.get 1) (local.get 0)))
                (local.set 0 (i32.sub (local.get 0) (i32.const 1)))
                (br 0)))
            (local.get 1)))
    "#;

    #[test]
    fn recursion_and_loops() {
        let mut env = env_with(FIB, &Imports::new());
        assert_eq!(call(&mut env, "fib", &[WasmValue::from_i64(20)]).unwrap(), vec![WasmValue::from_i64(6765)]);
        assert_eq!(call(&mut env, "sum", &[WasmValue::from_i32(100)]).unwrap(), vec![WasmValue::from_i32(5050)]);
        assert_eq!(env.stack_used(), 0);
        assert!(env.frames.is_empty());
    }

    #[test]
    fn traps_unwind_the_environment() {
        let mut env = env_with(r#"
            (module
              (memory 1)
              (func (export "div") (param i32 i32) (result i32) (i32.div_s (local.get 0) (local.get 1)))
              (func (export "oob") (result i32) (i32.load (i32.const 65535)))
              (func $down (export "deep") (call $down)))
        "#, &Imports::new());
        let args = [WasmValue::from_i32(1), WasmValue::from_i32(0)];
        assert!(matches!(call(&mut env, "div", &args), Err(Error::Trap(DIVIDE_BY_ZERO))));
        assert!(matches!(call(&mut env, "oob", &[]), Err(Error::Trap(OOB_MEMORY_ACCESS))));
        assert!(matches!(call(&mut env, "deep", &[]), Err(Error::Trap(STACK_EXHAUSTED))));
        assert!(env.frames.is_empty());
        assert_eq!(env.stack_used(), 0);
    }

    #[test]
    fn numeric_corner_cases() {
        let mut env = env_with(r#"
            (module
              (func (export "sat") (param f64) (result i32) (i32.trunc_sat_f64_s (local.get 0)))
              (func (export "ext") (param i32) (result i64) (i64.extend32_s (i64.extend_i32_u (local.get 0))))
              (func (export "sel") (param i32) (result i64)
                (select (i64.const 11) (i64.const 22) (local.get 0)))
              (func (export "near") (param f32) (result f32) (f32.nearest (local.get 0))))
        "#, &Imports::new());
        assert_eq!(call(&mut env, "sat", &[WasmValue::from_f64(1e20)]).unwrap()[0].as_i32(), i32::MAX);
        assert_eq!(call(&mut env, "sat", &[WasmValue::from_f64(f64::NAN)]).unwrap()[0].as_i32(), 0);
        assert_eq!(call(&mut env, "ext", &[WasmValue::from_i32(-1)]).unwrap()[0].as_i64(), -1);
        assert_eq!(call(&mut env, "sel", &[WasmValue::from_i32(0)]).unwrap()[0].as_i64(), 22);
        assert_eq!(call(&mut env, "near", &[WasmValue::from_f32(2.5)]).unwrap()[0].as_f32(), 2.0);
        assert_eq!(call(&mut env, "near", &[WasmValue::from_f32(-0.5)]).unwrap()[0].as_f32().to_bits(), (-0.0f32).to_bits());
    }

    #[test]
    fn host_calls_see_memory() {
        let imports = Imports::new().func("env", "peek", vec![ValType::I32], vec![ValType::I32], |inst, args| {
            let mem = inst.memory(0).ok_or(Error::Validation(UNKNOWN_MEMORY))?;
            let v = lock(&mem).load_u8(args[0].as_u32(), 0)?;
            Ok(vec![WasmValue::from_u32(v as u32 + 1)])
        });
        let mut env = env_with(r#"
            (module
              (import "env" "peek" (func $peek (param i32) (result i32)))
              (memory 1)
              (data (i32.const 3) "\29")
              (func (export "run") (result i32) (call $peek (i32.const 3))))
        "#, &imports);
        assert_eq!(call(&mut env, "run", &[]).unwrap()[0].as_i32(), 42);
    }

    struct SuspendAfter(u32);

    impl ExecHooks for SuspendAfter {
        fn should_suspend(&mut self) -> bool {
            if self.0 == 0 { return false; }
            self.0 -= 1;
            self.0 == 0
        }
    }

    #[test]
    fn suspend_and_resume_in_place() {
        let mut env = env_with(FIB, &Imports::new());
        let fib = env.module_inst.module.export_func("fib").unwrap();
        let out = invoke(&mut env, fib, &[WasmValue::from_i64(15)], &mut SuspendAfter(40)).unwrap();
        assert_eq!(out, Outcome::Suspended);
        assert!(env.is_suspended());
        assert!(env.frames.len() > 2);
        let out = resume(&mut env, &mut NoHooks).unwrap();
        assert_eq!(out, Outcome::Returned(vec![WasmValue::from_i64(610)]));
        assert!(matches!(resume(&mut env, &mut NoHooks), Err(Error::Trap(NOT_SUSPENDED))));
    }

    struct CountHost(Arc<AtomicU32>, u32);

    impl ExecHooks for CountHost {
        fn on_host_call(&mut self, _env: &ExecEnv) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst) + 1 == self.1
        }
    }

    #[test]
    fn host_call_suspension_reexecutes_the_call() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let imports = Imports::new().func("env", "tick", vec![], vec![ValType::I32], move |_, _| {
            Ok(vec![WasmValue::from_u32(seen.load(Ordering::SeqCst))])
        });
        let mut env = env_with(r#"
            (module
              (import "env" "tick" (func $tick (result i32)))
              (func (export "run") (result i32)
                (i32.add (call $tick) (i32.mul (call $tick) (i32.const 10)))))
        "#, &imports);
        let run = env.module_inst.module.export_func("run").unwrap();
        let mut hooks = CountHost(calls.clone(), 2);
        assert_eq!(invoke(&mut env, run, &[], &mut hooks).unwrap(), Outcome::Suspended);
        let frame = env.cur_frame().unwrap();
        assert_eq!(env.module_inst.module.bytes[frame.ip.unwrap()], opcodes::CALL);
        // first tick saw 1, the pending one will see 3
        let out = resume(&mut env, &mut hooks).unwrap();
        assert_eq!(out, Outcome::Returned(vec![WasmValue::from_i32(31)]));
    }

    #[test]
    fn breakpoint_stops_before_the_instruction() {
        let mut env = env_with(FIB, &Imports::new());
        let sum = env.module_inst.module.export_func("sum").unwrap();
        let func = &env.module_inst.module.functions[sum as usize];
        let target = (func.body.start..func.body.end)
            .find(|&p| env.module_inst.module.bytes[p] == opcodes::LOCAL_SET)
            .unwrap();
        env.breakpoint = Some((sum, (target - func.code_start()) as u32));
        let out = invoke(&mut env, sum, &[WasmValue::from_i32(4)], &mut NoHooks).unwrap();
        assert_eq!(out, Outcome::Suspended);
        let frame = env.cur_frame().unwrap();
        assert_eq!(frame.ip, Some(target));
        assert_eq!(frame.blocks.len(), 3);
        assert_eq!(resume(&mut env, &mut NoHooks).unwrap(), Outcome::Returned(vec![WasmValue::from_i32(10)]));
    }
}
