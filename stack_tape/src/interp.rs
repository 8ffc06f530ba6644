// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The execution engine: a switch-dispatched stack machine.
//!
//! The interpreter runs verified modules and relies on the verifier's proofs
//! to skip per-instruction shape checks (stack depth, immediate sanity, jump
//! legality, varspec ranges). Value *type* checks stay dynamic in every
//! build: the verifier does not track value types, so indexing, calling, and
//! arithmetic validate their operands at runtime.
//!
//! With the `dynamic-checks` feature the same opcode handlers re-verify
//! every operation instead, which lets the interpreter accept modules the
//! static verifier rejects and diagnose miscompiled input.
//!
//! Execution is single-threaded and synchronous; the only blocking point is
//! the `Lread` built-in. The virtual stack layout is: globals at the bottom,
//! then per-frame arguments, an optional closure slot one below the
//! arguments, locals, and operands. A frame's `base` is the index of its
//! first local.

use core::fmt;
use std::io::{BufRead, Write};

use crate::decode::{VarKind, read_u32_at};
use crate::module::Module;
use crate::opcode::Opcode;
use crate::runtime::Runtime;
use crate::value::{Value, ValueType};
use crate::verifier::{MAX_MEMBERS, MAX_PARAMS, ModuleInfo};

/// Execution limits for one interpreter run.
#[derive(Copy, Clone, Debug)]
pub struct Limits {
    /// Maximum number of virtual-stack cells.
    pub max_stack_values: u32,
    /// Maximum rendering depth for `stringify` (match-failure messages and
    /// the `Lstring` built-in).
    pub max_render_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_stack_values: 0x7fff_ffff,
            max_render_depth: 64,
        }
    }
}

/// A runtime fault.
#[derive(Debug)]
pub enum Fault {
    /// A binary operation received operands it cannot work on.
    BinopType {
        /// The verb used in the diagnostic ("add", "compare", …).
        verb: &'static str,
        /// The left operand's type.
        lhs: ValueType,
        /// The right operand's type.
        rhs: ValueType,
    },
    /// `/` or `%` with a zero divisor.
    DivisionByZero,
    /// An indexing operation on a non-aggregate.
    NotIndexable {
        /// The scrutinized value's type.
        actual: ValueType,
    },
    /// An index operand was not an integer.
    IndexNotInteger {
        /// The index operand's type.
        actual: ValueType,
    },
    /// An index was negative or past the aggregate's length.
    IndexOutOfRange {
        /// The index.
        index: isize,
        /// The aggregate's length.
        len: usize,
    },
    /// A non-integer was stored into a string element.
    StringStoreNotInt {
        /// The stored value's type.
        actual: ValueType,
    },
    /// A string element store does not fit into a byte.
    StringByteRange {
        /// The stored value.
        value: isize,
        /// The target index.
        index: isize,
    },
    /// `CALLC` on a value that is not a closure.
    NotCallable {
        /// The called value's type.
        actual: ValueType,
    },
    /// A call's argument count differs from the target's parameter count.
    ArityMismatch {
        /// The target's parameter count.
        expected: u32,
        /// The provided argument count.
        actual: u32,
    },
    /// A conditional jump's condition was not an integer.
    BranchCondType {
        /// The condition's type.
        actual: ValueType,
    },
    /// `Lwrite` on a non-integer.
    WriteNotInt {
        /// The written value's type.
        actual: ValueType,
    },
    /// `Llength` on a non-aggregate.
    LengthOfNonAggregate {
        /// The value's type.
        actual: ValueType,
    },
    /// A `FAIL` instruction fired.
    MatchFailure {
        /// The rendered scrutinee.
        scrutinee: String,
        /// Source line from the instruction.
        line: u32,
        /// Source column from the instruction.
        col: u32,
    },
    /// The virtual stack exceeded [`Limits::max_stack_values`].
    StackOverflow,
    /// A second interpreter instance was started while one is live.
    Reentrance,
    /// `Lread` received input that does not parse as an integer.
    InvalidInput {
        /// The rejected input line.
        input: String,
    },
    /// An I/O error from a built-in.
    Io(std::io::Error),
    /// A reserved or undecodable instruction was reached.
    IllegalInstr {
        /// The instruction's address.
        addr: u32,
        /// The raw opcode byte.
        opcode: u8,
    },
    /// A call target has no verified procedure metadata.
    UnknownProcedure {
        /// The target address.
        addr: u32,
    },
    /// The program counter left the bytecode section.
    PcOutOfBounds {
        /// The errant program counter.
        pc: u32,
    },
    /// An operand-stack access past the live region (dynamic-checks build).
    StackUnderflow {
        /// The accessed depth.
        depth: usize,
        /// The live stack size.
        size: usize,
    },
    /// A count immediate had its top bit set (dynamic-checks build).
    NegativeImmediate {
        /// The immediate's address.
        addr: u32,
        /// The raw value.
        value: u32,
    },
    /// A string-table reference is invalid (dynamic-checks build).
    StrtabOutOfRange {
        /// The errant table offset.
        offset: u32,
    },
    /// A jump target is invalid (dynamic-checks build).
    JumpTargetInvalid {
        /// The target address.
        target: u32,
    },
    /// A call target is not a procedure start (dynamic-checks build).
    NotProcStart {
        /// The target address.
        addr: u32,
    },
    /// A direct call targets a `CBEGIN` procedure (dynamic-checks build).
    CallToClosureProc {
        /// The target address.
        addr: u32,
    },
    /// A procedure declares too many parameters (dynamic-checks build).
    TooManyParams {
        /// The declared count.
        params: u32,
    },
    /// The entry procedure has the wrong parameter count
    /// (dynamic-checks build).
    MainParamCount {
        /// The declared count.
        params: u32,
    },
    /// The entry procedure is declared with `CBEGIN`
    /// (dynamic-checks build).
    MainIsClosure,
    /// A member count exceeds the implementation limit
    /// (dynamic-checks build).
    TooManyMembers {
        /// The requested count.
        count: u32,
    },
    /// A global index is out of range (dynamic-checks build).
    GlobalOutOfRange {
        /// The index.
        idx: u32,
        /// The module's global count.
        count: u32,
    },
    /// A local index is out of range (dynamic-checks build).
    LocalOutOfRange {
        /// The index.
        idx: u32,
        /// The frame's local count.
        count: u32,
    },
    /// A parameter index is out of range (dynamic-checks build).
    ParamOutOfRange {
        /// The index.
        idx: u32,
        /// The frame's argument count.
        count: u32,
    },
    /// A capture index is out of range (dynamic-checks build).
    CaptureOutOfRange {
        /// The index.
        idx: u32,
        /// The closure's capture count.
        len: usize,
    },
    /// A capture was accessed from a frame with no closure
    /// (dynamic-checks build).
    NoClosureFrame,
    /// A varspec kind byte is invalid (dynamic-checks build).
    BadVarKind {
        /// The kind byte's address.
        addr: u32,
        /// The raw kind byte.
        kind: u8,
    },
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BinopType { verb, lhs, rhs } => write!(f, "cannot {verb} {lhs} and {rhs}"),
            Self::DivisionByZero => write!(f, "division by zero"),
            Self::NotIndexable { actual } => write!(f, "cannot index {actual}"),
            Self::IndexNotInteger { actual } => {
                write!(f, "index must be an integer, got {actual}")
            }
            Self::IndexOutOfRange { index, len } => {
                write!(f, "index {index} out of range for an aggregate of length {len}")
            }
            Self::StringStoreNotInt { actual } => {
                write!(f, "cannot assign {actual} into a string (expected integer)")
            }
            Self::StringByteRange { value, index } => write!(
                f,
                "cannot assign {value} at index {index} into a string: does not fit into a byte"
            ),
            Self::NotCallable { actual } => write!(f, "cannot call {actual}"),
            Self::ArityMismatch { expected, actual } => {
                write!(f, "the function expected {expected} arguments, got {actual}")
            }
            Self::BranchCondType { actual } => write!(
                f,
                "wrong branch condition type: expected integer, got {actual}"
            ),
            Self::WriteNotInt { actual } => {
                write!(f, "cannot write {actual} (expected integer)")
            }
            Self::LengthOfNonAggregate { actual } => {
                write!(f, "cannot get the length of {actual}")
            }
            Self::MatchFailure {
                scrutinee,
                line,
                col,
            } => write!(f, "match failure for {scrutinee} at L{line}:{col}"),
            Self::StackOverflow => write!(f, "stack overflow"),
            Self::Reentrance => write!(f, "detected multiple concurrent interpreter instances"),
            Self::InvalidInput { input } => {
                write!(f, "cannot parse `{input}` as an integer")
            }
            Self::Io(e) => write!(f, "i/o failure: {e}"),
            Self::IllegalInstr { addr, opcode } => {
                write!(f, "illegal operation at {addr:#x}: {opcode:#04x}")
            }
            Self::UnknownProcedure { addr } => {
                write!(f, "no procedure is defined at {addr:#x}")
            }
            Self::PcOutOfBounds { pc } => {
                write!(f, "the program counter {pc:#x} left the bytecode section")
            }
            Self::StackUnderflow { depth, size } => write!(
                f,
                "stack access at depth {depth} is out of range for the stack of size {size}"
            ),
            Self::NegativeImmediate { addr, value } => {
                write!(f, "the 32-bit immediate {value:#x} at {addr:#x} is too large")
            }
            Self::StrtabOutOfRange { offset } => write!(
                f,
                "the string table offset {offset:#x} does not begin a NUL-terminated string"
            ),
            Self::JumpTargetInvalid { target } => {
                write!(f, "the jump target {target:#x} is invalid")
            }
            Self::NotProcStart { addr } => {
                write!(f, "address {addr:#x} must point to a procedure declaration")
            }
            Self::CallToClosureProc { addr } => write!(
                f,
                "cannot call the procedure at {addr:#x} without creating a closure first"
            ),
            Self::TooManyParams { params } => {
                write!(f, "too many parameters: expected at most {MAX_PARAMS}, got {params}")
            }
            Self::MainParamCount { params } => {
                write!(f, "the entry procedure must have 2 parameters, got {params}")
            }
            Self::MainIsClosure => {
                write!(f, "the entry procedure must be declared with BEGIN")
            }
            Self::TooManyMembers { count } => {
                write!(f, "too many members: expected at most {MAX_MEMBERS}, got {count}")
            }
            Self::GlobalOutOfRange { idx, count } => write!(
                f,
                "trying to access global #{idx}, but there are only {count} globals declared"
            ),
            Self::LocalOutOfRange { idx, count } => write!(
                f,
                "trying to access local #{idx}, but there are only {count} locals declared"
            ),
            Self::ParamOutOfRange { idx, count } => write!(
                f,
                "trying to access argument #{idx}, but there are only {count} arguments"
            ),
            Self::CaptureOutOfRange { idx, len } => write!(
                f,
                "trying to access capture #{idx}, but the closure only captures {len} variables"
            ),
            Self::NoClosureFrame => write!(
                f,
                "trying to access a captured variable when there's no closure associated with the frame"
            ),
            Self::BadVarKind { addr, kind } => write!(
                f,
                "unrecognized variable kind encoding {kind:#04x} at {addr:#x}"
            ),
        }
    }
}

impl std::error::Error for Fault {}

/// One entry of a runtime backtrace, innermost first.
#[derive(Clone, Debug)]
pub struct BacktraceFrame {
    /// The frame's procedure address.
    pub proc_addr: u32,
    /// The procedure's public name, when the symbol table has one.
    pub proc_name: Option<String>,
    /// The most recent `LINE` value observed in the frame.
    pub line: u32,
    /// The program counter inside the frame.
    pub pc: u32,
}

/// A runtime backtrace, from the most recent frame outward.
#[derive(Clone, Debug, Default)]
pub struct Backtrace {
    /// The module name.
    pub module: String,
    /// The frames, innermost first.
    pub frames: Vec<BacktraceFrame>,
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "stack backtrace (most recent frame first):")?;
        for (i, frame) in self.frames.iter().enumerate() {
            match &frame.proc_name {
                Some(name) => write!(f, "  {i}: {name}")?,
                None => write!(f, "  {i}: proc {:#x}", frame.proc_addr)?,
            }
            writeln!(
                f,
                " at {}:{} (pc {:#x})",
                self.module, frame.line, frame.pc
            )?;
        }
        Ok(())
    }
}

/// A runtime fault annotated with the backtrace at the point of failure.
#[derive(Debug)]
pub struct RuntimeError {
    /// The active frames when the fault fired.
    pub backtrace: Backtrace,
    /// The fault itself.
    pub fault: Fault,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.fault)?;
        write!(f, "{}", self.backtrace)
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.fault)
    }
}

/// An active procedure invocation.
#[derive(Copy, Clone, Debug)]
struct Frame {
    /// The procedure this frame executes.
    proc_addr: u32,
    /// The caller's program counter; `None` marks the sentinel entry frame.
    saved_pc: Option<u32>,
    /// The caller's base.
    saved_base: u32,
    /// The caller's argument count.
    saved_args: u32,
    /// The caller's local count.
    saved_locals: u32,
    /// The most recent `LINE` value.
    line: u32,
    /// True when a closure object lives one slot below the arguments.
    is_closure: bool,
}

/// The interpreter for one module.
pub struct Interpreter<'m, R, W> {
    module: &'m Module,
    info: Option<&'m ModuleInfo>,
    input: R,
    output: W,
    limits: Limits,
}

impl<'m, R: BufRead, W: Write> Interpreter<'m, R, W> {
    /// Creates an interpreter over a verified module.
    #[cfg(not(feature = "dynamic-checks"))]
    pub fn new(module: &'m Module, info: &'m ModuleInfo, input: R, output: W) -> Self {
        Self {
            module,
            info: Some(info),
            input,
            output,
            limits: Limits::default(),
        }
    }

    /// Creates an interpreter that re-validates every operation at runtime;
    /// the module need not pass the static verifier.
    #[cfg(feature = "dynamic-checks")]
    pub fn new(module: &'m Module, input: R, output: W) -> Self {
        Self {
            module,
            info: None,
            input,
            output,
            limits: Limits::default(),
        }
    }

    /// Replaces the execution limits.
    #[must_use]
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Runs the module's entry procedure to completion.
    ///
    /// The entry frame receives two placeholder arguments. Output ordering
    /// observed by the outside world is exactly the order of executed
    /// `Lwrite`/`Lread` calls.
    pub fn run(self) -> Result<(), RuntimeError> {
        let root_cells = self.module.global_count as usize + 2;
        let rt = match Runtime::init(root_cells) {
            Ok(rt) => rt,
            Err(_) => {
                return Err(RuntimeError {
                    backtrace: Backtrace {
                        module: self.module.name.clone(),
                        frames: Vec::new(),
                    },
                    fault: Fault::Reentrance,
                });
            }
        };

        let mut machine = Machine {
            module: self.module,
            bc: &self.module.bytecode,
            info: self.info,
            limits: self.limits,
            input: self.input,
            output: self.output,
            rt,
            frames: Vec::new(),
            pc: 0,
            base: self.module.global_count + 2,
            args: 2,
            locals: 0,
            is_main: true,
        };
        machine.enter_frame(0, false, None)?;
        machine.dispatch()
    }
}

const DYNAMIC: bool = cfg!(feature = "dynamic-checks");

struct Machine<'m, R, W> {
    module: &'m Module,
    bc: &'m [u8],
    info: Option<&'m ModuleInfo>,
    limits: Limits,
    input: R,
    output: W,
    rt: Runtime,
    frames: Vec<Frame>,
    /// Byte offset of the next instruction.
    pc: u32,
    /// Index of the current frame's first local.
    base: u32,
    /// The current frame's argument count.
    args: u32,
    /// The current frame's local count.
    locals: u32,
    /// True until the first call leaves the entry procedure.
    is_main: bool,
}

impl<'m, R: BufRead, W: Write> Machine<'m, R, W> {
    fn fault(&self, fault: Fault) -> RuntimeError {
        RuntimeError {
            backtrace: self.backtrace(),
            fault,
        }
    }

    fn backtrace(&self) -> Backtrace {
        let mut frames = Vec::with_capacity(self.frames.len());
        let mut pc = self.pc;
        for frame in self.frames.iter().rev() {
            frames.push(BacktraceFrame {
                proc_addr: frame.proc_addr,
                proc_name: self.proc_name(frame.proc_addr),
                line: frame.line,
                pc,
            });
            pc = frame.saved_pc.unwrap_or(0);
        }
        Backtrace {
            module: self.module.name.clone(),
            frames,
        }
    }

    fn proc_name(&self, addr: u32) -> Option<String> {
        self.module
            .symtab
            .iter()
            .find(|sym| sym.addr == addr)
            .and_then(|sym| self.module.str_at(sym.name_offset))
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    fn type_of(&self, v: Value) -> ValueType {
        self.rt.heap.type_of(v)
    }

    fn read_imm(&mut self, allow_negative: bool) -> Result<u32, RuntimeError> {
        let addr = self.pc;
        let Some(value) = read_u32_at(self.bc, addr) else {
            return Err(self.fault(Fault::PcOutOfBounds { pc: addr }));
        };
        if DYNAMIC && !allow_negative && value >> 31 != 0 {
            return Err(self.fault(Fault::NegativeImmediate { addr, value }));
        }
        self.pc = addr + 4;
        Ok(value)
    }

    fn str_at_checked(&self, offset: u32) -> Result<&'m [u8], RuntimeError> {
        self.module
            .str_at(offset)
            .ok_or_else(|| self.fault(Fault::StrtabOutOfRange { offset }))
    }

    fn top_nth(&self, n: u32) -> Result<Value, RuntimeError> {
        let depth = n as usize;
        if DYNAMIC && depth >= self.rt.bottom {
            return Err(self.fault(Fault::StackUnderflow {
                depth,
                size: self.rt.bottom,
            }));
        }
        Ok(self.rt.stack[self.rt.bottom - 1 - depth])
    }

    fn pop_n(&mut self, n: usize) -> Result<(), RuntimeError> {
        if DYNAMIC && n > self.rt.bottom {
            return Err(self.fault(Fault::StackUnderflow {
                depth: n,
                size: self.rt.bottom,
            }));
        }
        self.rt.bottom -= n;
        Ok(())
    }

    fn push(&mut self, v: Value) -> Result<(), RuntimeError> {
        if DYNAMIC {
            let new_size = self.rt.bottom + 1;
            if new_size > self.limits.max_stack_values as usize {
                return Err(self.fault(Fault::StackOverflow));
            }
            if new_size > self.rt.stack.len() {
                self.rt.stack.push(v);
                self.rt.bottom = new_size;
                return Ok(());
            }
        }
        self.rt.stack[self.rt.bottom] = v;
        self.rt.bottom += 1;
        Ok(())
    }

    fn load_var(&self, kind: VarKind, m: u32) -> Result<Value, RuntimeError> {
        match kind {
            VarKind::Global => {
                if DYNAMIC && m >= self.module.global_count {
                    return Err(self.fault(Fault::GlobalOutOfRange {
                        idx: m,
                        count: self.module.global_count,
                    }));
                }
                Ok(self.rt.stack[m as usize])
            }
            VarKind::Local => {
                if DYNAMIC && m >= self.locals {
                    return Err(self.fault(Fault::LocalOutOfRange {
                        idx: m,
                        count: self.locals,
                    }));
                }
                Ok(self.rt.stack[self.base as usize + m as usize])
            }
            VarKind::Param => {
                if DYNAMIC && m >= self.args {
                    return Err(self.fault(Fault::ParamOutOfRange {
                        idx: m,
                        count: self.args,
                    }));
                }
                Ok(self.rt.stack[self.base as usize - self.args as usize + m as usize])
            }
            VarKind::Capture => {
                let closure = self.closure_slot()?;
                if DYNAMIC {
                    let len = self.rt.heap.len(closure) - 1;
                    if m as usize >= len {
                        return Err(self.fault(Fault::CaptureOutOfRange { idx: m, len }));
                    }
                }
                Ok(self.rt.heap.field(closure, m as usize + 1))
            }
        }
    }

    fn store_var(&mut self, kind: VarKind, m: u32, v: Value) -> Result<(), RuntimeError> {
        match kind {
            VarKind::Global => {
                if DYNAMIC && m >= self.module.global_count {
                    return Err(self.fault(Fault::GlobalOutOfRange {
                        idx: m,
                        count: self.module.global_count,
                    }));
                }
                self.rt.stack[m as usize] = v;
            }
            VarKind::Local => {
                if DYNAMIC && m >= self.locals {
                    return Err(self.fault(Fault::LocalOutOfRange {
                        idx: m,
                        count: self.locals,
                    }));
                }
                self.rt.stack[self.base as usize + m as usize] = v;
            }
            VarKind::Param => {
                if DYNAMIC && m >= self.args {
                    return Err(self.fault(Fault::ParamOutOfRange {
                        idx: m,
                        count: self.args,
                    }));
                }
                self.rt.stack[self.base as usize - self.args as usize + m as usize] = v;
            }
            VarKind::Capture => {
                let closure = self.closure_slot()?;
                if DYNAMIC {
                    let len = self.rt.heap.len(closure) - 1;
                    if m as usize >= len {
                        return Err(self.fault(Fault::CaptureOutOfRange { idx: m, len }));
                    }
                }
                self.rt.heap.set_field(closure, m as usize + 1, v);
            }
        }
        Ok(())
    }

    fn closure_slot(&self) -> Result<Value, RuntimeError> {
        if DYNAMIC && !self.frames.last().is_some_and(|f| f.is_closure) {
            return Err(self.fault(Fault::NoClosureFrame));
        }
        Ok(self.rt.stack[self.base as usize - self.args as usize - 1])
    }

    /// Validates that `addr` points at a complete `BEGIN`/`CBEGIN`
    /// declaration (dynamic-checks build only).
    fn check_begin(&self, addr: u32) -> Result<(), RuntimeError> {
        let valid = match self.bc.get(addr as usize) {
            Some(&b) if b == Opcode::Begin.byte() || b == Opcode::Cbegin.byte() => {
                u64::from(addr) + 9 <= self.bc.len() as u64
            }
            _ => false,
        };
        if valid {
            Ok(())
        } else {
            Err(self.fault(Fault::NotProcStart { addr }))
        }
    }

    fn check_jmp(&self, target: u32) -> Result<(), RuntimeError> {
        match self.bc.get(target as usize) {
            Some(&b) if b != Opcode::Begin.byte() && b != Opcode::Cbegin.byte() => Ok(()),
            _ => Err(self.fault(Fault::JumpTargetInvalid { target })),
        }
    }

    fn enter_frame(
        &mut self,
        target: u32,
        is_closure: bool,
        saved_pc: Option<u32>,
    ) -> Result<(), RuntimeError> {
        if DYNAMIC {
            self.check_begin(target)?;
        }
        self.frames.push(Frame {
            proc_addr: target,
            saved_pc,
            saved_base: self.base,
            saved_args: self.args,
            saved_locals: self.locals,
            line: 0,
            is_closure,
        });
        self.pc = target;
        Ok(())
    }

    fn binop(&mut self, op: Opcode) -> Result<(), RuntimeError> {
        let v1 = self.top_nth(1)?;
        let v0 = self.top_nth(0)?;

        let type_fault = |machine: &Self| {
            let verb = match op {
                Opcode::Add => "add",
                Opcode::Sub => "subtract",
                Opcode::Mul => "multiply",
                Opcode::Div => "divide",
                Opcode::Mod => "take the remainder of",
                Opcode::And => "perform boolean AND for",
                Opcode::Or => "perform boolean OR for",
                _ => "compare",
            };
            machine.fault(Fault::BinopType {
                verb,
                lhs: machine.type_of(v1),
                rhs: machine.type_of(v0),
            })
        };

        let result = if op == Opcode::Eq {
            if v1.is_int() && v0.is_int() {
                Value::from_bool(v1.as_int() == v0.as_int())
            } else if v1.is_int() || v0.is_int() {
                // An integer never equals a heap value.
                Value::from_bool(false)
            } else {
                return Err(type_fault(self));
            }
        } else {
            if !(v1.is_int() && v0.is_int()) {
                return Err(type_fault(self));
            }
            let lhs = v1.as_int();
            let rhs = v0.as_int();
            match op {
                Opcode::Add => Value::from_int(lhs.wrapping_add(rhs)),
                Opcode::Sub => Value::from_int(lhs.wrapping_sub(rhs)),
                Opcode::Mul => Value::from_int(lhs.wrapping_mul(rhs)),
                Opcode::Div => {
                    if rhs == 0 {
                        return Err(self.fault(Fault::DivisionByZero));
                    }
                    Value::from_int(lhs.wrapping_div(rhs))
                }
                Opcode::Mod => {
                    if rhs == 0 {
                        return Err(self.fault(Fault::DivisionByZero));
                    }
                    Value::from_int(lhs.wrapping_rem(rhs))
                }
                Opcode::Lt => Value::from_bool(lhs < rhs),
                Opcode::Le => Value::from_bool(lhs <= rhs),
                Opcode::Gt => Value::from_bool(lhs > rhs),
                Opcode::Ge => Value::from_bool(lhs >= rhs),
                Opcode::Ne => Value::from_bool(lhs != rhs),
                Opcode::And => Value::from_bool(lhs != 0 && rhs != 0),
                Opcode::Or => Value::from_bool(lhs != 0 || rhs != 0),
                _ => unreachable!("non-binop opcode in binop handler"),
            }
        };

        self.pop_n(2)?;
        self.push(result)
    }

    fn index_checked(&self, agg: Value, idx_v: Value) -> Result<usize, RuntimeError> {
        if !self.rt.heap.is_aggregate(agg) {
            return Err(self.fault(Fault::NotIndexable {
                actual: self.type_of(agg),
            }));
        }
        if !idx_v.is_int() {
            return Err(self.fault(Fault::IndexNotInteger {
                actual: self.type_of(idx_v),
            }));
        }
        let idx = idx_v.as_int();
        let len = self.rt.heap.len(agg);
        if idx < 0 || idx as usize >= len {
            return Err(self.fault(Fault::IndexOutOfRange { index: idx, len }));
        }
        Ok(idx as usize)
    }

    fn dispatch(&mut self) -> Result<(), RuntimeError> {
        loop {
            let op_addr = self.pc;
            let Some(&byte) = self.bc.get(op_addr as usize) else {
                return Err(self.fault(Fault::PcOutOfBounds { pc: op_addr }));
            };
            self.pc = op_addr + 1;
            let Some(op) = Opcode::from_byte(byte) else {
                return Err(self.fault(Fault::IllegalInstr {
                    addr: op_addr,
                    opcode: byte,
                }));
            };

            match op {
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::Lt
                | Opcode::Le
                | Opcode::Gt
                | Opcode::Ge
                | Opcode::Eq
                | Opcode::Ne
                | Opcode::And
                | Opcode::Or => self.binop(op)?,

                Opcode::Const => {
                    let k = self.read_imm(true)?;
                    self.push(Value::from_int(k as i32 as isize))?;
                }

                Opcode::String => {
                    let s = self.read_imm(false)?;
                    let bytes = self.str_at_checked(s)?;
                    let v = self.rt.alloc_string(bytes);
                    self.push(v)?;
                }

                Opcode::Sexp => {
                    let s = self.read_imm(false)?;
                    let n = self.read_imm(false)?;
                    if DYNAMIC {
                        self.str_at_checked(s)?;
                        if n > MAX_MEMBERS {
                            return Err(self.fault(Fault::TooManyMembers { count: n }));
                        }
                    }
                    let v = self.rt.alloc_sexp(s, n as usize);
                    for i in 0..n {
                        let elem = self.top_nth(n - 1 - i)?;
                        self.rt.heap.set_field(v, i as usize, elem);
                    }
                    self.pop_n(n as usize)?;
                    self.push(v)?;
                }

                Opcode::Sta => {
                    let agg = self.top_nth(2)?;
                    let idx_v = self.top_nth(1)?;
                    let v = self.top_nth(0)?;
                    let idx = self.index_checked(agg, idx_v)?;
                    match self.type_of(agg) {
                        ValueType::Array | ValueType::Sexp => {
                            self.rt.heap.set_field(agg, idx, v);
                        }
                        ValueType::String => {
                            if !v.is_int() {
                                return Err(self.fault(Fault::StringStoreNotInt {
                                    actual: self.type_of(v),
                                }));
                            }
                            let c = v.as_int();
                            if !(0..=0xff).contains(&c) {
                                return Err(self.fault(Fault::StringByteRange {
                                    value: c,
                                    index: idx as isize,
                                }));
                            }
                            self.rt.heap.set_str_byte(agg, idx, c as u8);
                        }
                        ValueType::Int | ValueType::Closure => {
                            unreachable!("index_checked admits aggregates only")
                        }
                    }
                    self.pop_n(3)?;
                    self.push(v)?;
                }

                Opcode::Jmp => {
                    let l = self.read_imm(false)?;
                    if DYNAMIC {
                        self.check_jmp(l)?;
                    }
                    self.pc = l;
                }

                Opcode::End | Opcode::Ret => {
                    let v = self.top_nth(0)?;
                    let Some(frame) = self.frames.last().copied() else {
                        return Err(self.fault(Fault::PcOutOfBounds { pc: op_addr }));
                    };
                    self.rt.bottom =
                        self.base as usize - self.args as usize - usize::from(frame.is_closure);
                    let Some(saved_pc) = frame.saved_pc else {
                        // The sentinel frame exits cleanly.
                        return Ok(());
                    };
                    self.pc = saved_pc;
                    self.base = frame.saved_base;
                    self.args = frame.saved_args;
                    self.locals = frame.saved_locals;
                    self.frames.pop();
                    self.push(v)?;
                }

                Opcode::Drop => self.pop_n(1)?,

                Opcode::Dup => {
                    let v = self.top_nth(0)?;
                    self.push(v)?;
                }

                Opcode::Swap => {
                    let lhs = self.top_nth(1)?;
                    let rhs = self.top_nth(0)?;
                    self.pop_n(2)?;
                    self.push(rhs)?;
                    self.push(lhs)?;
                }

                Opcode::Elem => {
                    let agg = self.top_nth(1)?;
                    let idx_v = self.top_nth(0)?;
                    let idx = self.index_checked(agg, idx_v)?;
                    let elem = match self.type_of(agg) {
                        ValueType::Array | ValueType::Sexp => self.rt.heap.field(agg, idx),
                        ValueType::String => {
                            Value::from_int(self.rt.heap.str_bytes(agg)[idx] as isize)
                        }
                        ValueType::Int | ValueType::Closure => {
                            unreachable!("index_checked admits aggregates only")
                        }
                    };
                    self.pop_n(2)?;
                    self.push(elem)?;
                }

                Opcode::LdG | Opcode::LdL | Opcode::LdA | Opcode::LdC => {
                    let kind = varspec_kind_of(op);
                    let m = self.read_imm(false)?;
                    let v = self.load_var(kind, m)?;
                    self.push(v)?;
                }

                Opcode::StG | Opcode::StL | Opcode::StA | Opcode::StC => {
                    let kind = varspec_kind_of(op);
                    let m = self.read_imm(false)?;
                    let v = self.top_nth(0)?;
                    self.store_var(kind, m, v)?;
                }

                Opcode::CjmpZ | Opcode::CjmpNz => {
                    let l = self.read_imm(false)?;
                    if DYNAMIC {
                        self.check_jmp(l)?;
                    }
                    let cond = self.top_nth(0)?;
                    if !cond.is_int() {
                        return Err(self.fault(Fault::BranchCondType {
                            actual: self.type_of(cond),
                        }));
                    }
                    let zero = cond.as_int() == 0;
                    if zero == (op == Opcode::CjmpZ) {
                        self.pc = l;
                    }
                    self.pop_n(1)?;
                }

                Opcode::Begin | Opcode::Cbegin => {
                    let params = self.read_imm(false)?;
                    let locals = self.read_imm(false)?;
                    if DYNAMIC {
                        if params > MAX_PARAMS {
                            return Err(self.fault(Fault::TooManyParams { params }));
                        }
                        if self.is_main {
                            if params != 2 {
                                return Err(self.fault(Fault::MainParamCount { params }));
                            }
                            if op == Opcode::Cbegin {
                                return Err(self.fault(Fault::MainIsClosure));
                            }
                        }
                    }

                    let stack_size = match self.info {
                        Some(info) => {
                            let proc_addr =
                                self.frames.last().map_or(op_addr, |f| f.proc_addr);
                            let Some(proc) = info.procs.get(&proc_addr) else {
                                return Err(
                                    self.fault(Fault::UnknownProcedure { addr: proc_addr })
                                );
                            };
                            proc.stack_size
                        }
                        None => 0,
                    };

                    let base = self.rt.bottom as u64;
                    let new_size = base + u64::from(locals) + u64::from(stack_size);
                    if new_size > u64::from(self.limits.max_stack_values) {
                        return Err(self.fault(Fault::StackOverflow));
                    }
                    if (self.rt.stack.len() as u64) < new_size {
                        self.rt.stack.resize(new_size as usize, Value::default());
                    }
                    self.base = base as u32;
                    self.args = params;
                    self.locals = locals;
                    for slot in &mut self.rt.stack[base as usize..(base as usize + locals as usize)]
                    {
                        *slot = Value::default();
                    }
                    self.rt.bottom = base as usize + locals as usize;
                }

                Opcode::Closure => {
                    let l = self.read_imm(false)?;
                    if DYNAMIC {
                        self.check_begin(l)?;
                    }
                    let n = self.read_imm(false)?;
                    if DYNAMIC && n > MAX_MEMBERS {
                        return Err(self.fault(Fault::TooManyMembers { count: n }));
                    }
                    let closure = self.rt.alloc_closure(l, n as usize);
                    self.push(closure)?;
                    for i in 0..n {
                        let kind_addr = self.pc;
                        let Some(&kind_byte) = self.bc.get(kind_addr as usize) else {
                            return Err(self.fault(Fault::PcOutOfBounds { pc: kind_addr }));
                        };
                        self.pc = kind_addr + 1;
                        let m = self.read_imm(false)?;
                        let Some(kind) = VarKind::from_byte(kind_byte) else {
                            return Err(self.fault(Fault::BadVarKind {
                                addr: kind_addr,
                                kind: kind_byte,
                            }));
                        };
                        let v = self.load_var(kind, m)?;
                        self.rt.heap.set_field(closure, i as usize + 1, v);
                    }
                }

                Opcode::CallC => {
                    let n = self.read_imm(false)?;
                    let closure = self.top_nth(n)?;
                    if !self.rt.heap.is_closure(closure) {
                        return Err(self.fault(Fault::NotCallable {
                            actual: self.type_of(closure),
                        }));
                    }
                    let l = self.rt.heap.closure_entry(closure);
                    let params = match self.info {
                        Some(info) => {
                            let Some(proc) = info.procs.get(&l) else {
                                return Err(self.fault(Fault::UnknownProcedure { addr: l }));
                            };
                            proc.params
                        }
                        None => {
                            self.check_begin(l)?;
                            let Some(raw) = read_u32_at(self.bc, l + 1) else {
                                return Err(self.fault(Fault::PcOutOfBounds { pc: l + 1 }));
                            };
                            raw & 0xffff
                        }
                    };
                    if params != n {
                        return Err(self.fault(Fault::ArityMismatch {
                            expected: params,
                            actual: n,
                        }));
                    }
                    self.is_main = false;
                    let saved_pc = self.pc;
                    self.enter_frame(l, true, Some(saved_pc))?;
                }

                Opcode::Call => {
                    let l = self.read_imm(false)?;
                    let n = self.read_imm(false)?;
                    if DYNAMIC {
                        self.check_begin(l)?;
                        if self.bc[l as usize] == Opcode::Cbegin.byte() {
                            return Err(self.fault(Fault::CallToClosureProc { addr: l }));
                        }
                        let Some(raw) = read_u32_at(self.bc, l + 1) else {
                            return Err(self.fault(Fault::PcOutOfBounds { pc: l + 1 }));
                        };
                        let params = raw & 0xffff;
                        if params != n {
                            return Err(self.fault(Fault::ArityMismatch {
                                expected: params,
                                actual: n,
                            }));
                        }
                    }
                    self.is_main = false;
                    let saved_pc = self.pc;
                    self.enter_frame(l, false, Some(saved_pc))?;
                }

                Opcode::Tag => {
                    let s = self.read_imm(false)?;
                    let n = self.read_imm(false)?;
                    let v = self.top_nth(0)?;
                    let expected = self.str_at_checked(s)?;
                    self.pop_n(1)?;
                    let matches = self.rt.heap.is_sexp(v)
                        && self.rt.heap.len(v) == n as usize
                        && self.module.str_at(self.rt.heap.sexp_tag(v)) == Some(expected);
                    self.push(Value::from_bool(matches))?;
                }

                Opcode::Array => {
                    let n = self.read_imm(false)?;
                    let v = self.top_nth(0)?;
                    self.pop_n(1)?;
                    let matches =
                        self.rt.heap.is_array(v) && self.rt.heap.len(v) == n as usize;
                    self.push(Value::from_bool(matches))?;
                }

                Opcode::Fail => {
                    let line = self.read_imm(false)?;
                    let col = self.read_imm(false)?;
                    let v = self.top_nth(0)?;
                    self.pop_n(1)?;
                    let scrutinee =
                        self.rt
                            .heap
                            .stringify(v, self.module, self.limits.max_render_depth);
                    return Err(self.fault(Fault::MatchFailure {
                        scrutinee,
                        line,
                        col,
                    }));
                }

                Opcode::Line => {
                    let line = self.read_imm(false)?;
                    if let Some(frame) = self.frames.last_mut() {
                        frame.line = line;
                    }
                }

                Opcode::PattEqStr => {
                    let lhs = self.top_nth(1)?;
                    let rhs = self.top_nth(0)?;
                    self.pop_n(2)?;
                    let matches = self.rt.heap.is_string(lhs)
                        && self.rt.heap.is_string(rhs)
                        && self.rt.heap.str_bytes(lhs) == self.rt.heap.str_bytes(rhs);
                    self.push(Value::from_bool(matches))?;
                }

                Opcode::PattString
                | Opcode::PattArray
                | Opcode::PattSexp
                | Opcode::PattRef
                | Opcode::PattVal
                | Opcode::PattFun => {
                    let v = self.top_nth(0)?;
                    self.pop_n(1)?;
                    let matches = match op {
                        Opcode::PattString => self.rt.heap.is_string(v),
                        Opcode::PattArray => self.rt.heap.is_array(v),
                        Opcode::PattSexp => self.rt.heap.is_sexp(v),
                        Opcode::PattRef => v.is_boxed(),
                        Opcode::PattVal => v.is_int(),
                        Opcode::PattFun => self.rt.heap.is_closure(v),
                        _ => unreachable!("non-pattern opcode in pattern handler"),
                    };
                    self.push(Value::from_bool(matches))?;
                }

                Opcode::CallLread => {
                    write!(self.output, " > ").map_err(|e| self.fault(Fault::Io(e)))?;
                    self.output.flush().map_err(|e| self.fault(Fault::Io(e)))?;
                    let mut line = String::new();
                    self.input
                        .read_line(&mut line)
                        .map_err(|e| self.fault(Fault::Io(e)))?;
                    let trimmed = line.trim();
                    let Ok(v) = trimmed.parse::<isize>() else {
                        return Err(self.fault(Fault::InvalidInput {
                            input: trimmed.to_string(),
                        }));
                    };
                    self.push(Value::from_int(v))?;
                }

                Opcode::CallLwrite => {
                    let v = self.top_nth(0)?;
                    if !v.is_int() {
                        return Err(self.fault(Fault::WriteNotInt {
                            actual: self.type_of(v),
                        }));
                    }
                    self.pop_n(1)?;
                    writeln!(self.output, "{}", v.as_int())
                        .map_err(|e| self.fault(Fault::Io(e)))?;
                    self.push(Value::default())?;
                }

                Opcode::CallLlength => {
                    let v = self.top_nth(0)?;
                    if !self.rt.heap.is_aggregate(v) {
                        return Err(self.fault(Fault::LengthOfNonAggregate {
                            actual: self.type_of(v),
                        }));
                    }
                    let len = self.rt.heap.len(v);
                    self.pop_n(1)?;
                    self.push(Value::from_int(len as isize))?;
                }

                Opcode::CallLstring => {
                    let v = self.top_nth(0)?;
                    let rendered =
                        self.rt
                            .heap
                            .stringify(v, self.module, self.limits.max_render_depth);
                    self.pop_n(1)?;
                    let s = self.rt.alloc_string(rendered.as_bytes());
                    self.push(s)?;
                }

                Opcode::CallBarray => {
                    let n = self.read_imm(false)?;
                    if DYNAMIC && n > MAX_MEMBERS {
                        return Err(self.fault(Fault::TooManyMembers { count: n }));
                    }
                    let arr = self.rt.alloc_array(n as usize);
                    for i in 0..n {
                        let elem = self.top_nth(n - 1 - i)?;
                        self.rt.heap.set_field(arr, i as usize, elem);
                    }
                    self.pop_n(n as usize)?;
                    self.push(arr)?;
                }

                Opcode::Sti
                | Opcode::LdaG
                | Opcode::LdaL
                | Opcode::LdaA
                | Opcode::LdaC
                | Opcode::Eof => {
                    return Err(self.fault(Fault::IllegalInstr {
                        addr: op_addr,
                        opcode: byte,
                    }));
                }
            }
        }
    }
}

fn varspec_kind_of(op: Opcode) -> VarKind {
    match op {
        Opcode::LdG | Opcode::StG => VarKind::Global,
        Opcode::LdL | Opcode::StL => VarKind::Local,
        Opcode::LdA | Opcode::StA => VarKind::Param,
        Opcode::LdC | Opcode::StC => VarKind::Capture,
        _ => unreachable!("opcode carries no varspec kind"),
    }
}

#[cfg(all(test, not(feature = "dynamic-checks")))]
mod tests {
    use super::*;
    use crate::asm::ModuleBuilder;
    use crate::runtime::test_guard;
    use crate::verifier::verify;

    fn run(module: &Module, input: &str) -> Result<String, RuntimeError> {
        let _guard = test_guard();
        let info = verify(module).unwrap();
        let mut out = Vec::new();
        Interpreter::new(module, &info, input.as_bytes(), &mut out).run()?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn arithmetic_wraps_and_prints() {
        let mut b = ModuleBuilder::new("arith");
        let a = b.asm();
        a.begin(2, 0);
        a.const_(40);
        a.const_(2);
        a.add();
        a.call_lwrite();
        a.drop_();
        a.const_(0);
        a.end();
        let m = b.build().unwrap();
        assert_eq!(run(&m, "").unwrap(), "42\n");
    }

    #[test]
    fn lread_parses_and_lwrite_echoes() {
        let mut b = ModuleBuilder::new("echo");
        let a = b.asm();
        a.begin(2, 0);
        a.call_lread();
        a.call_lwrite();
        a.end();
        let m = b.build().unwrap();
        assert_eq!(run(&m, "37\n").unwrap(), " > 37\n");
    }

    #[test]
    fn lread_rejects_junk_input() {
        let mut b = ModuleBuilder::new("badread");
        let a = b.asm();
        a.begin(2, 0);
        a.call_lread();
        a.end();
        let m = b.build().unwrap();
        let err = run(&m, "not-a-number\n").unwrap_err();
        assert!(matches!(err.fault, Fault::InvalidInput { .. }));
    }

    #[test]
    fn negative_constants_sign_extend() {
        let mut b = ModuleBuilder::new("neg");
        let a = b.asm();
        a.begin(2, 0);
        a.const_(-5);
        a.const_(3);
        a.mul();
        a.call_lwrite();
        a.end();
        let m = b.build().unwrap();
        assert_eq!(run(&m, "").unwrap(), "-15\n");
    }

    #[test]
    fn division_by_zero_faults() {
        let mut b = ModuleBuilder::new("div0");
        let a = b.asm();
        a.begin(2, 0);
        a.const_(1);
        a.const_(0);
        a.div();
        a.end();
        let m = b.build().unwrap();
        let err = run(&m, "").unwrap_err();
        assert!(matches!(err.fault, Fault::DivisionByZero));
        assert_eq!(err.backtrace.frames.len(), 1);
    }

    #[test]
    fn store_and_load_locals() {
        let mut b = ModuleBuilder::new("locals");
        let a = b.asm();
        a.begin(2, 2);
        a.const_(7);
        a.st(VarKind::Local, 0);
        a.drop_();
        a.ld(VarKind::Local, 0);
        a.ld(VarKind::Local, 1); // untouched locals read as 0
        a.add();
        a.call_lwrite();
        a.end();
        let m = b.build().unwrap();
        assert_eq!(run(&m, "").unwrap(), "7\n");
    }

    #[test]
    fn swap_and_dup_shuffle_operands() {
        let mut b = ModuleBuilder::new("shuffle");
        let a = b.asm();
        a.begin(2, 0);
        a.const_(1);
        a.const_(2);
        a.swap();
        a.sub(); // 2 - 1
        a.dup();
        a.add(); // 1 + 1
        a.call_lwrite();
        a.end();
        let m = b.build().unwrap();
        assert_eq!(run(&m, "").unwrap(), "2\n");
    }
}
