//! The tree-walking virtual machine (§4.H, §5, §6).
//!
//! `Vm` owns its `Module` by value rather than borrowing it: the spec's
//! "a VM owns a Module" is honored in the architectural sense, but a
//! borrowed `&'m Module` would tie every frame, every `HandlerFn`, and
//! every dispatch strategy to a lifetime parameter, which buys nothing
//! at this granularity and fights the borrow checker at every call
//! boundary. See DESIGN.md.

use std::collections::HashMap;

use log::{debug, warn};
use viper_ir::{Function, Instruction, Module, Type, Value};

use crate::dispatch::DispatchKind;
use crate::frame::Frame;
use crate::ops::HandlerFn;
use crate::pool::RegisterPool;
use crate::slot::Slot;
use crate::tracer::Tracer;
use crate::trap::{Trap, TrapKind};

/// Mirrors the teacher interpreter's own recursion guard (`seen_interpreter`'s
/// `Runtime::max_recursion_depth`): a runaway recursive program fails with a
/// trap instead of exhausting the host process's own stack or growing
/// `Vm::frames` without bound.
const MAX_CALL_DEPTH: usize = 1000;

/// What happened after executing one instruction, read by `Vm::step`'s
/// dispatch loop. Not part of the public API — callers only see
/// `step`'s `Result<Option<i64>, Trap>`.
pub enum StepSignal {
    Next,
    Jumped,
    Returned(Option<Slot>),
}

pub(crate) type VmResult = StepSignal;

#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    #[error("function '{0}' is not defined in this module")]
    UnknownFunction(String),
    #[error("function '{name}' expects {expected} argument(s), got {actual}")]
    ArgumentCountMismatch { name: String, expected: usize, actual: usize },
}

/// Tags the high bit of a `PayloadPtr` to mark it as a logical address
/// into some frame's `BumpRegion` rather than a real heap pointer. The
/// remaining bits pack a frame index and a byte offset; see
/// `encode_stack_ptr`/`decode_stack_ptr`.
const STACK_TAG: usize = 1 << 63;
const FRAME_BITS: u32 = 23;
const FRAME_SHIFT: u32 = 40;
const OFFSET_MASK: usize = (1 << FRAME_SHIFT) - 1;

pub fn encode_stack_ptr(frame_index: usize, offset: usize) -> viper_heap::PayloadPtr {
    let packed = STACK_TAG | ((frame_index & ((1 << FRAME_BITS) - 1)) << FRAME_SHIFT) | (offset & OFFSET_MASK);
    packed as viper_heap::PayloadPtr
}

pub fn decode_stack_ptr(ptr: viper_heap::PayloadPtr) -> Option<(usize, usize)> {
    let bits = ptr as usize;
    if bits & STACK_TAG == 0 {
        return None;
    }
    let frame_index = (bits >> FRAME_SHIFT) & ((1 << FRAME_BITS) - 1);
    let offset = bits & OFFSET_MASK;
    Some((frame_index, offset))
}

/// Every scalar `Slot` round-trips through memory as 8 bytes, regardless
/// of its IL-declared width: `Store` always writes a full slot, and
/// `Load`'s declared result type only narrows/reinterprets what comes
/// back out. This sidesteps `Store` carrying no type of its own in the
/// verifier's contract (it only checks the pointer operand) and keeps a
/// single natural alignment of 8 for every `Alloca` slot, matching the
/// 0/8 byte layout a two-`i64`-field record would use. See DESIGN.md.
pub fn encode_slot(slot: Slot) -> [u8; 8] {
    match slot {
        Slot::I64(v) => v.to_ne_bytes(),
        Slot::F64(v) => v.to_ne_bytes(),
        Slot::Ptr(p) => (p as usize as u64).to_ne_bytes(),
    }
}

pub fn decode_slot(ty: Type, bytes: &[u8]) -> Slot {
    let raw = i64::from_ne_bytes(bytes.try_into().expect("memory ops always move 8-byte slots"));
    match ty {
        Type::F64 => Slot::F64(f64::from_bits(raw as u64)),
        Type::Ptr | Type::Str | Type::Error | Type::ResumeTok => Slot::Ptr(raw as usize as viper_heap::PayloadPtr),
        Type::I1 => Slot::I64(raw & 1),
        Type::I16 => Slot::I64(raw as i16 as i64),
        Type::I32 => Slot::I64(raw as i32 as i64),
        Type::I64 | Type::Void => Slot::I64(raw),
    }
}

pub struct Vm {
    module: Module,
    frames: Vec<Frame>,
    pool: RegisterPool,
    tracer: Tracer,
    dispatch: DispatchKind,
    table: Option<HashMap<viper_ir::Opcode, HandlerFn>>,
    thread_cache: HashMap<String, Vec<Vec<HandlerFn>>>,
    register_counts: HashMap<String, usize>,
    global_cache: HashMap<String, viper_heap::PayloadPtr>,
    pub breakpoints: std::collections::HashSet<(String, usize)>,
    pub single_step: bool,
    paused: bool,
}

impl Vm {
    pub fn new(module: Module) -> Self {
        Vm::with_dispatch(module, DispatchKind::from_env())
    }

    pub fn with_dispatch(module: Module, dispatch: DispatchKind) -> Self {
        let table = matches!(dispatch, DispatchKind::Table).then(crate::dispatch::build_table);
        Vm {
            module,
            frames: Vec::new(),
            pool: RegisterPool::new(),
            tracer: Tracer::off(),
            dispatch,
            table,
            thread_cache: HashMap::new(),
            register_counts: HashMap::new(),
            global_cache: HashMap::new(),
            breakpoints: std::collections::HashSet::new(),
            single_step: false,
            paused: false,
        }
    }

    pub fn set_tracer(&mut self, tracer: Tracer) {
        self.tracer = tracer;
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Resets execution state and positions the VM at `function_name`'s
    /// entry block with `args` bound to its parameters.
    pub fn prepare(&mut self, function_name: &str, args: &[Slot]) -> Result<(), PrepareError> {
        let (param_count, params) = {
            let func = self
                .module
                .function(function_name)
                .ok_or_else(|| PrepareError::UnknownFunction(function_name.to_string()))?;
            (func.params.len(), func.params.clone())
        };
        if param_count != args.len() {
            return Err(PrepareError::ArgumentCountMismatch {
                name: function_name.to_string(),
                expected: param_count,
                actual: args.len(),
            });
        }
        self.frames.clear();
        let reg_count = self.register_count(function_name);
        let mut frame = Frame::new(function_name, reg_count.max(1));
        frame.registers = self.pool.acquire(reg_count.max(1));
        for (p, a) in params.iter().zip(args.iter()) {
            frame.set(p.temp, *a);
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Runs `@main` to completion, returning its `i64` result or the
    /// first trap that escapes every frame (§6).
    pub fn run(&mut self) -> Result<i64, Trap> {
        if let Err(e) = self.prepare("main", &[]) {
            warn!("failed to prepare entrypoint: {}", e);
            return Err(Trap::new(TrapKind::InvalidOperation, "main", 0, 0, 0, e.to_string()));
        }
        debug!("running with {:?} dispatch", self.dispatch);
        loop {
            if let Some(value) = self.step()? {
                return Ok(value);
            }
        }
    }

    /// Executes exactly one instruction. Returns `Ok(Some(value))` once
    /// the outermost frame returns, `Ok(None)` after ordinary progress
    /// or a debug pause, `Err(trap)` if a trap escapes every frame.
    /// `run()` is a convenience loop around this that ignores pauses —
    /// a host that wants real single-stepping should call `step`
    /// directly instead of `run`.
    pub fn step(&mut self) -> Result<Option<i64>, Trap> {
        let frame_idx = match self.frames.len() {
            0 => return Ok(Some(0)),
            n => n - 1,
        };
        let (func_name, block, ip) = {
            let f = &self.frames[frame_idx];
            (f.function_name.clone(), f.block, f.ip)
        };

        if self.should_pause(&func_name, block, ip) {
            return Ok(None);
        }

        let instr = {
            let func = self.module.function(&func_name).expect("frame names a live function");
            func.blocks[block].instructions[ip].clone()
        };

        {
            let func = self.module.function(&func_name).expect("frame names a live function");
            let mut stdout = std::io::stdout();
            self.tracer.trace(&mut stdout, func, block, &instr);
        }

        match self.dispatch_step(&instr) {
            Ok(StepSignal::Next) => {
                self.frames[frame_idx].ip += 1;
                Ok(None)
            }
            Ok(StepSignal::Jumped) => Ok(None),
            Ok(StepSignal::Returned(value)) => self.handle_return(value),
            Err(trap) => match self.unwind(trap) {
                Ok(()) => Ok(None),
                Err(trap) => Err(trap),
            },
        }
    }

    fn dispatch_step(&mut self, instr: &Instruction) -> Result<StepSignal, Trap> {
        match self.dispatch {
            DispatchKind::Switch => crate::ops::exec_switch(self, instr),
            DispatchKind::Table => {
                let handler = *self.table.as_ref().expect("table dispatch built its table").get(&instr.opcode).expect("every opcode has a table entry");
                handler(self, instr)
            }
            DispatchKind::Threaded => self.exec_threaded(instr),
        }
    }

    fn exec_threaded(&mut self, instr: &Instruction) -> Result<StepSignal, Trap> {
        let frame = self.frames.last().expect("a frame is active during dispatch");
        let (func_name, block, ip) = (frame.function_name.clone(), frame.block, frame.ip);
        if !self.thread_cache.contains_key(&func_name) {
            let func = self.module.function(&func_name).expect("frame names a live function");
            let per_block: Vec<Vec<HandlerFn>> = func
                .blocks
                .iter()
                .map(|b| b.instructions.iter().map(|i| crate::ops::handler_for(i.opcode)).collect())
                .collect();
            self.thread_cache.insert(func_name.clone(), per_block);
        }
        let handler = self.thread_cache[&func_name][block][ip];
        handler(self, instr)
    }

    fn handle_return(&mut self, value: Option<Slot>) -> Result<Option<i64>, Trap> {
        let popped = self.frames.pop().expect("a frame just returned");
        self.pool.release(popped.registers);
        match self.frames.last_mut() {
            None => Ok(Some(value.map(|s| s.as_i64()).unwrap_or(0))),
            Some(caller) => {
                let result_slot = {
                    let func = self.module.function(&caller.function_name).expect("caller names a live function");
                    func.blocks[caller.block].instructions[caller.ip].result
                };
                if let (Some((id, _)), Some(v)) = (result_slot, value) {
                    caller.set(id, v);
                }
                caller.ip += 1;
                Ok(None)
            }
        }
    }

    /// Pops the innermost handler off the top frame and jumps into it,
    /// escalating to the caller's frame (and its own handler stack) when
    /// the current frame has none left, all the way out of the VM if no
    /// frame has a handler.
    fn unwind(&mut self, trap: Trap) -> Result<(), Trap> {
        loop {
            let handler_label = match self.frames.last_mut() {
                Some(frame) => frame.eh_stack.pop(),
                None => return Err(trap),
            };
            match handler_label {
                Some(handler) => {
                    let func_name = self.frames.last().unwrap().function_name.clone();
                    let target = self.module.function(&func_name).and_then(|f| f.block_index(&handler.label));
                    match target {
                        Some(target) => {
                            let frame = self.frames.last_mut().unwrap();
                            frame.caught = Some(trap);
                            frame.block = target;
                            frame.ip = 0;
                            return Ok(());
                        }
                        None => continue,
                    }
                }
                None => {
                    let popped = self.frames.pop().unwrap();
                    self.pool.release(popped.registers);
                    if self.frames.is_empty() {
                        warn!("uncaught trap: {}", trap);
                        return Err(trap);
                    }
                }
            }
        }
    }

    /// `ResumeNext` escalates past the current frame's own handler chain
    /// entirely, by popping the frame before unwinding resumes from its
    /// caller — distinguishing it from `ResumeSame`, which re-enters the
    /// current frame's remaining handlers first.
    pub(crate) fn pop_frame_for_resume_next(&mut self) {
        if let Some(popped) = self.frames.pop() {
            self.pool.release(popped.registers);
        }
    }

    fn should_pause(&mut self, func_name: &str, block: usize, ip: usize) -> bool {
        if self.paused {
            self.paused = false;
            return false;
        }
        let hit_breakpoint = ip == 0 && self.breakpoints.contains(&(func_name.to_string(), block));
        if self.single_step || hit_breakpoint {
            self.paused = true;
            return true;
        }
        false
    }

    pub(crate) fn current_frame(&self) -> &Frame {
        self.frames.last().expect("a frame is always active during dispatch")
    }

    pub(crate) fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("a frame is always active during dispatch")
    }

    pub(crate) fn make_trap(&self, kind: TrapKind, instr: &Instruction, message: impl Into<String>) -> Trap {
        let frame = self.current_frame();
        Trap::new(kind, frame.function_name.clone(), frame.block, frame.ip, instr.loc.line, message)
    }

    pub(crate) fn eval_operand(&mut self, instr: &Instruction, v: &Value) -> Result<Slot, Trap> {
        match v {
            Value::Temp(id) => self
                .current_frame()
                .get(*id)
                .ok_or_else(|| self.make_trap(TrapKind::InvalidOperation, instr, format!("read of unset register %t{}", id))),
            Value::ConstInt(n, _) => Ok(Slot::I64(*n)),
            Value::ConstFloat(f) => Ok(Slot::F64(*f)),
            Value::ConstStr(bytes) => Ok(Slot::Ptr(viper_heap::Str::from_bytes(bytes).into_raw())),
            Value::GlobalAddr(name) => Ok(Slot::Ptr(self.global_ptr(name).unwrap_or(std::ptr::null_mut()))),
            Value::NullPtr => Ok(Slot::Ptr(std::ptr::null_mut())),
        }
    }

    /// Returns a retained handle to `name`'s data, minting and caching a
    /// fresh `Str` the first time it's referenced. The cache itself
    /// holds one reference for the VM's lifetime; each call retains one
    /// more for the caller. `Vm::drop` releases the cache's own share.
    pub(crate) fn global_ptr(&mut self, name: &str) -> Option<viper_heap::PayloadPtr> {
        if let Some(&p) = self.global_cache.get(name) {
            viper_heap::retain(p);
            return Some(p);
        }
        let global = self.module.global_by_name(name)?;
        let p = viper_heap::Str::from_bytes(global.data.as_bytes()).into_raw();
        self.global_cache.insert(name.to_string(), p);
        viper_heap::retain(p);
        Some(p)
    }

    pub(crate) fn has_function(&self, name: &str) -> bool {
        self.module.function(name).is_some()
    }

    pub(crate) fn function_name_at(&self, index: usize) -> Option<String> {
        self.module.functions.get_index(index).map(|(name, _)| name.clone())
    }

    fn register_count(&mut self, name: &str) -> usize {
        if let Some(&n) = self.register_counts.get(name) {
            return n;
        }
        let func = self.module.function(name).expect("register_count called on a live function");
        let n = max_temp_id(func) as usize + 1;
        self.register_counts.insert(name.to_string(), n);
        n
    }

    pub(crate) fn push_call_frame(&mut self, callee_name: &str, args: &[Slot], instr: &Instruction) -> Result<StepSignal, Trap> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            warn!("call stack depth exceeded calling '{}'", callee_name);
            return Err(self.make_trap(TrapKind::Overflow, instr, "call stack depth exceeded"));
        }
        let reg_count = self.register_count(callee_name);
        let params = self.module.function(callee_name).expect("callee resolved by caller").params.clone();
        let mut frame = Frame::new(callee_name, reg_count.max(1));
        frame.registers = self.pool.acquire(reg_count.max(1));
        for (p, a) in params.iter().zip(args.iter()) {
            frame.set(p.temp, *a);
        }
        self.frames.push(frame);
        Ok(StepSignal::Jumped)
    }

    pub(crate) fn call_helper(&mut self, name: &str, args: &[Slot], instr: &Instruction) -> Result<Slot, Trap> {
        use viper_runtime::ops;
        match name {
            "rt_len" => Ok(Slot::I64(ops::rt_len(args[0].as_ptr()))),
            "rt_str_eq" => Ok(Slot::I64(ops::rt_str_eq(args[0].as_ptr(), args[1].as_ptr()))),
            "rt_sqrt" => Ok(Slot::F64(ops::rt_sqrt(args[0].as_f64()))),
            "rt_floor" => Ok(Slot::F64(ops::rt_floor(args[0].as_f64()))),
            "rt_instr2" => Ok(Slot::I64(ops::rt_instr2(args[0].as_ptr(), args[1].as_ptr()))),
            "rt_instr3" => Ok(Slot::I64(ops::rt_instr3(args[0].as_ptr(), args[1].as_ptr(), args[2].as_i64()))),
            "rt_abs_f64" => Ok(Slot::F64(ops::rt_abs_f64(args[0].as_f64()))),
            "rt_round_even" => Ok(Slot::F64(ops::rt_round_even(args[0].as_f64()))),
            "rt_cdbl_from_any" => Ok(Slot::F64(ops::rt_cdbl_from_any(args[0].as_i64(), args[1].as_i64()))),
            "rt_print_str" => {
                ops::rt_print_str(args[0].as_ptr());
                Ok(Slot::I64(0))
            }
            "rt_print_i64" => {
                ops::rt_print_i64(args[0].as_i64());
                Ok(Slot::I64(0))
            }
            "rt_print_f64" => {
                ops::rt_print_f64(args[0].as_f64());
                Ok(Slot::I64(0))
            }
            "rt_str_concat" => Ok(Slot::Ptr(ops::rt_str_concat(args[0].as_ptr(), args[1].as_ptr()))),
            "rt_array_new_i64" => Ok(Slot::Ptr(ops::rt_array_new_i64(args[0].as_i64()))),
            "rt_array_get_i64" => Ok(Slot::I64(ops::rt_array_get_i64(args[0].as_ptr(), args[1].as_i64()))),
            "rt_array_set_i64" => {
                ops::rt_array_set_i64(args[0].as_ptr(), args[1].as_i64(), args[2].as_i64());
                Ok(Slot::I64(0))
            }
            other => Err(self.make_trap(TrapKind::InvalidOperation, instr, format!("unknown runtime helper '{}'", other))),
        }
    }

    pub(crate) fn stack_alloc(&mut self, size: usize) -> viper_heap::PayloadPtr {
        let frame_index = self.frames.len() - 1;
        let offset = self.current_frame_mut().bump.alloc(size, 8);
        encode_stack_ptr(frame_index, offset)
    }

    /// Reads 8 bytes through `ptr`, tracing it back to a stack slot when
    /// it carries the stack tag and treating it as a raw heap address
    /// otherwise.
    pub(crate) fn memory_read(&self, ptr: viper_heap::PayloadPtr, instr: &Instruction) -> Result<[u8; 8], Trap> {
        if ptr.is_null() {
            return Err(self.make_trap(TrapKind::InvalidOperation, instr, "null load"));
        }
        match decode_stack_ptr(ptr) {
            Some((frame_index, offset)) => {
                if offset % 8 != 0 {
                    return Err(self.make_trap(TrapKind::InvalidOperation, instr, "misaligned load"));
                }
                let frame = self
                    .frames
                    .get(frame_index)
                    .ok_or_else(|| self.make_trap(TrapKind::InvalidOperation, instr, "load from a dead frame"))?;
                let bytes = frame
                    .bump
                    .read(offset, 8)
                    .ok_or_else(|| self.make_trap(TrapKind::IndexOutOfBounds, instr, "load past the end of its stack allocation"))?;
                Ok(bytes.try_into().expect("bump region read returned 8 bytes"))
            }
            None => {
                if (ptr as usize) % 8 != 0 {
                    return Err(self.make_trap(TrapKind::InvalidOperation, instr, "misaligned load"));
                }
                // SAFETY: the IL's own `Gep`/verifier discipline is the
                // only guarantee this address is valid; a tree-walking
                // VM has no hardware fault to fall back on for an
                // out-of-range heap offset.
                let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, 8) };
                Ok(bytes.try_into().expect("heap read returned 8 bytes"))
            }
        }
    }

    pub(crate) fn memory_write(&mut self, ptr: viper_heap::PayloadPtr, bytes: [u8; 8], instr: &Instruction) -> Result<(), Trap> {
        if ptr.is_null() {
            return Err(self.make_trap(TrapKind::InvalidOperation, instr, "null store"));
        }
        match decode_stack_ptr(ptr) {
            Some((frame_index, offset)) => {
                if offset % 8 != 0 {
                    return Err(self.make_trap(TrapKind::InvalidOperation, instr, "misaligned store"));
                }
                let frame = self
                    .frames
                    .get_mut(frame_index)
                    .ok_or_else(|| Trap::new(TrapKind::InvalidOperation, "?", 0, 0, instr.loc.line, "store to a dead frame"))?;
                if !frame.bump.write(offset, &bytes) {
                    return Err(self.make_trap(TrapKind::IndexOutOfBounds, instr, "store past the end of its stack allocation"));
                }
                Ok(())
            }
            None => {
                if (ptr as usize) % 8 != 0 {
                    return Err(self.make_trap(TrapKind::InvalidOperation, instr, "misaligned store"));
                }
                // SAFETY: see memory_read; the same discipline applies.
                unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, 8) };
                Ok(())
            }
        }
    }

    /// Resolves a branch's target block (caching the resolution on the
    /// current frame, §4.H "Branching"), binds `args` to its block
    /// params, and repositions the frame there.
    pub(crate) fn take_branch(&mut self, instr: &Instruction, successor_index: usize, label: &str, args: &[Value]) -> Result<StepSignal, Trap> {
        let values: Vec<Slot> = args.iter().map(|v| self.eval_operand(instr, v)).collect::<Result<_, _>>()?;
        let frame_idx = self.frames.len() - 1;
        let cur_block = self.frames[frame_idx].block;
        let target = match self.frames[frame_idx].branch_cache.get(&(cur_block, successor_index)) {
            Some(&t) => t,
            None => {
                let func_name = self.frames[frame_idx].function_name.clone();
                let func = self.module.function(&func_name).expect("frame names a live function");
                let t = func.block_index(label).expect("verified module: branch target exists");
                self.frames[frame_idx].branch_cache.insert((cur_block, successor_index), t);
                t
            }
        };
        let func_name = self.frames[frame_idx].function_name.clone();
        let params = self.module.function(&func_name).expect("frame names a live function").blocks[target].params.clone();
        let frame = &mut self.frames[frame_idx];
        for (param, val) in params.iter().zip(values.iter()) {
            frame.set(param.temp, *val);
        }
        frame.block = target;
        frame.ip = 0;
        Ok(StepSignal::Jumped)
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // Releases the cache's own share of every materialized global.
        // Handles still live in registers at teardown are not walked and
        // released here — a documented simplification shared with
        // `viper_heap`'s single-threaded, non-atomic refcounting model;
        // see DESIGN.md.
        for (_, ptr) in self.global_cache.drain() {
            viper_heap::release(ptr);
        }
    }
}

fn max_temp_id(func: &Function) -> u32 {
    let mut max_id = 0u32;
    for p in &func.params {
        max_id = max_id.max(p.temp);
    }
    for block in &func.blocks {
        for p in &block.params {
            max_id = max_id.max(p.temp);
        }
        for instr in &block.instructions {
            if let Some((id, _)) = instr.result {
                max_id = max_id.max(id);
            }
        }
    }
    max_id
}
