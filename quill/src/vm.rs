/// Stack-based virtual machine.
///
/// ARCHITECTURE:
///   • Value stack (Vec) plus a call-frame stack capped at 64 frames; each
///     frame records its closure, instruction pointer and base slot
///   • Dispatch is a fetch/switch loop; constant operands decode the
///     self-describing short/long width inline, jumps are 16-bit big-endian
///   • Open upvalues live in a list sorted by descending stack slot; frame
///     returns and CLOSE_UPVALUE close them in place
///   • No process-wide state: the Vm owns stack, frames, globals, heap and
///     open upvalues, and hands the whole root set to the collector at
///     every allocation site
///   • Runtime errors unwind with an innermost-first frame trace and reset
///     the stack
///
/// `print` output goes through an injectable writer so embedders and tests
/// can capture it; diagnostics always go to stderr.

use std::io::{self, Write};
use std::time::Instant;

use crate::chunk::OpCode;
use crate::compiler::compile_with_roots;
use crate::errors::{InterpretError, RuntimeError, TraceFrame};
use crate::heap::{GcConfig, GcScope, Heap, ObjRef};
use crate::natives::{NativeCtx, NATIVES};
use crate::object::{BoundMethod, Class, Closure, HeapObj, Instance, ListObj, NativeObj, Upvalue};
use crate::table::{Table, FLAG_IMMUTABLE};
use crate::value::{values_equal, Value};

pub const FRAMES_MAX: usize = 64;

pub struct CallFrame {
    pub closure: ObjRef,
    /// The closure's function, cached to keep instruction fetch short.
    pub function: ObjRef,
    pub ip: usize,
    pub base: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VmOptions {
    /// Disassemble each instruction to stderr as it executes.
    pub trace: bool,
    /// Collect on every allocation.
    pub stress_gc: bool,
    /// Log collections to stderr.
    pub log_gc: bool,
}

/// Mark the VM root set: the value stack, every frame's closure, the
/// globals table (keys and values), the open-upvalue list and the interned
/// "init" name.
pub(crate) fn mark_vm_roots(
    gc: &mut GcScope,
    stack: &[Value],
    frames: &[CallFrame],
    globals: &Table,
    open_upvalues: &[ObjRef],
    init_string: ObjRef,
) {
    for &value in stack {
        gc.mark_value(value);
    }
    for frame in frames {
        gc.mark_object(frame.closure);
    }
    gc.mark_table(globals);
    for &upvalue in open_upvalues {
        gc.mark_object(upvalue);
    }
    gc.mark_object(init_string);
}

pub struct Vm {
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Vec<ObjRef>,
    init_string: ObjRef,
    started: Instant,
    out: Box<dyn Write>,
    trace: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Vm::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Self {
        Vm::with_writer(Box::new(io::stdout()), options)
    }

    pub fn with_writer(out: Box<dyn Write>, options: VmOptions) -> Self {
        let mut heap = Heap::new(GcConfig { stress: options.stress_gc, log: options.log_gc });
        let init_string = heap.intern("init", |_| {});
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            started: Instant::now(),
            out,
            trace: options.trace,
        };
        vm.install_natives();
        vm
    }

    fn install_natives(&mut self) {
        for def in NATIVES {
            let name = self.intern_rooted(def.name);
            // Pin name and native on the stack across the allocations.
            self.stack.push(Value::Obj(name));
            let native = self.alloc_rooted(HeapObj::Native(NativeObj {
                name: def.name,
                arity: def.arity,
                func: def.func,
            }));
            self.stack.push(Value::Obj(native));
            let hash = self.heap.str_hash(name);
            self.globals.set(name, hash, Value::Obj(native));
            self.stack.pop();
            self.stack.pop();
        }
    }

    /// Number of values currently on the stack. Zero between statements of
    /// a well-formed program; exposed for balance assertions in tests.
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    // ── Entry point ──────────────────────────────────────────────────────────

    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = {
            let stack = &self.stack;
            let frames = &self.frames;
            let globals = &self.globals;
            let open = &self.open_upvalues;
            let init = self.init_string;
            let vm_roots =
                move |gc: &mut GcScope| mark_vm_roots(gc, stack, frames, globals, open, init);
            compile_with_roots(source, &mut self.heap, &vm_roots)
        }
        .ok_or(InterpretError::Compile)?;

        self.stack.push(Value::Obj(function));
        let closure =
            self.alloc_rooted(HeapObj::Closure(Closure { function, upvalues: Vec::new() }));
        self.stack.pop();
        self.stack.push(Value::Obj(closure));

        let result = self.call_closure(closure, 0).and_then(|_| self.run());
        let _ = self.out.flush();
        match result {
            Ok(()) => Ok(()),
            Err(error) => {
                eprintln!("{}", error.report());
                self.reset_stack();
                Err(error.into())
            }
        }
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // ── Heap access with the VM root set ─────────────────────────────────────

    fn intern_rooted(&mut self, text: &str) -> ObjRef {
        let stack = &self.stack;
        let frames = &self.frames;
        let globals = &self.globals;
        let open = &self.open_upvalues;
        let init = self.init_string;
        self.heap.intern(text, |gc| mark_vm_roots(gc, stack, frames, globals, open, init))
    }

    fn alloc_rooted(&mut self, obj: HeapObj) -> ObjRef {
        let stack = &self.stack;
        let frames = &self.frames;
        let globals = &self.globals;
        let open = &self.open_upvalues;
        let init = self.init_string;
        self.heap.alloc(obj, |gc| mark_vm_roots(gc, stack, frames, globals, open, init))
    }

    // ── Errors ───────────────────────────────────────────────────────────────

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            let line = function.chunk.get_line(frame.ip.saturating_sub(1));
            let name = function.name.map(|n| self.heap.str_chars(n).to_string());
            trace.push(TraceFrame { line, function: name });
        }
        RuntimeError { message: message.into(), trace }
    }

    // ── Stack and decoding ───────────────────────────────────────────────────

    #[inline]
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    #[inline]
    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    #[inline]
    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let ip = frame.ip;
        frame.ip += 1;
        let function = frame.function;
        self.heap.function(function).chunk.code[ip]
    }

    #[inline]
    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    /// Decode a short/long constant index: the high bit of the first
    /// operand byte selects the width.
    #[inline]
    fn read_index(&mut self) -> usize {
        let b0 = self.read_byte() as usize;
        if b0 & 0x80 == 0 {
            b0
        } else {
            let b1 = self.read_byte() as usize;
            let b2 = self.read_byte() as usize;
            ((b0 & 0x7F) << 16) | (b1 << 8) | b2
        }
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_index();
        let frame = self.frame();
        self.heap.function(frame.function).chunk.constants[index]
    }

    fn read_string(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Obj(r) => r,
            other => panic!("name constant is not a string: {:?}", other),
        }
    }

    // ── Object kind views ────────────────────────────────────────────────────

    fn as_string(&self, value: Value) -> Option<ObjRef> {
        match value {
            Value::Obj(r) if matches!(self.heap.get(r), HeapObj::Str(_)) => Some(r),
            _ => None,
        }
    }

    fn as_list(&self, value: Value) -> Option<ObjRef> {
        match value {
            Value::Obj(r) if matches!(self.heap.get(r), HeapObj::List(_)) => Some(r),
            _ => None,
        }
    }

    fn as_instance(&self, value: Value) -> Option<ObjRef> {
        match value {
            Value::Obj(r) if matches!(self.heap.get(r), HeapObj::Instance(_)) => Some(r),
            _ => None,
        }
    }

    fn as_class(&self, value: Value) -> Option<ObjRef> {
        match value {
            Value::Obj(r) if matches!(self.heap.get(r), HeapObj::Class(_)) => Some(r),
            _ => None,
        }
    }

    // ── Calls ────────────────────────────────────────────────────────────────

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        enum Kind {
            Closure,
            Class,
            Bound(Value, ObjRef),
            Native,
            Other,
        }

        if let Value::Obj(r) = callee {
            let kind = match self.heap.get(r) {
                HeapObj::Closure(_) => Kind::Closure,
                HeapObj::Class(_) => Kind::Class,
                HeapObj::Bound(b) => Kind::Bound(b.receiver, b.method),
                HeapObj::Native(_) => Kind::Native,
                _ => Kind::Other,
            };
            match kind {
                Kind::Closure => return self.call_closure(r, arg_count),
                Kind::Class => return self.call_class(r, arg_count),
                Kind::Bound(receiver, method) => {
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = receiver;
                    return self.call_closure(method, arg_count);
                }
                Kind::Native => return self.call_native(r, arg_count),
                Kind::Other => {}
            }
        }
        Err(self.runtime_error("Can only call functions and classes."))
    }

    fn call_closure(&mut self, closure: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if arg_count != arity {
            return Err(
                self.runtime_error(format!("Expected {} arguments but got {}.", arity, arg_count))
            );
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let base = self.stack.len() - arg_count - 1;
        self.frames.push(CallFrame { closure, function, ip: 0, base });
        Ok(())
    }

    fn call_class(&mut self, class: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let initializer = self.heap.class(class).initializer;
        let slot = self.stack.len() - arg_count - 1;
        // The class sits in the callee slot, rooting itself until the
        // instance replaces it.
        let instance =
            self.alloc_rooted(HeapObj::Instance(Instance { class, fields: Table::new() }));
        self.stack[slot] = Value::Obj(instance);

        match initializer {
            Some(init) => self.call_closure(init, arg_count),
            None if arg_count != 0 => {
                Err(self.runtime_error(format!("Expected 0 arguments but got {}.", arg_count)))
            }
            None => Ok(()),
        }
    }

    fn call_native(&mut self, native: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let (arity, func) = {
            let n = self.heap.native(native);
            (n.arity, n.func)
        };
        if arg_count != arity {
            return Err(
                self.runtime_error(format!("Expected {} arguments but got {}.", arity, arg_count))
            );
        }

        let base = self.stack.len() - arg_count;
        // The canonical argument slots stay on the stack (rooted) for the
        // duration of the call; the native sees a copied window.
        let args: Vec<Value> = self.stack[base..].to_vec();
        let result = {
            let mut ctx = NativeCtx {
                heap: &mut self.heap,
                stack: &self.stack,
                frames: &self.frames,
                globals: &self.globals,
                open_upvalues: &self.open_upvalues,
                init_string: self.init_string,
                started: self.started,
            };
            func(&mut ctx, &args)
        };

        match result {
            Ok(value) => {
                self.stack.truncate(base - 1);
                self.push(value);
                Ok(())
            }
            Err(error) => Err(self.runtime_error(error.0)),
        }
    }

    fn invoke(&mut self, name: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count);
        let Some(instance) = self.as_instance(receiver) else {
            return Err(self.runtime_error("Only instances have methods."));
        };

        let hash = self.heap.str_hash(name);
        let (class, field) = {
            let inst = self.heap.instance(instance);
            (inst.class, inst.fields.get(name, hash))
        };

        // A field shadowing a method is called as an ordinary value.
        if let Some(value) = field {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = value;
            return self.call_value(value, arg_count);
        }
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let hash = self.heap.str_hash(name);
        match self.heap.class(class).methods.get(name, hash) {
            Some(Value::Obj(method)) => self.call_closure(method, arg_count),
            _ => Err(self
                .runtime_error(format!("Undefined property '{}'.", self.heap.str_chars(name)))),
        }
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), RuntimeError> {
        let hash = self.heap.str_hash(name);
        let Some(Value::Obj(method)) = self.heap.class(class).methods.get(name, hash) else {
            return Err(
                self.runtime_error(format!("Undefined property '{}'.", self.heap.str_chars(name)))
            );
        };

        let receiver = self.peek(0);
        let bound = self.alloc_rooted(HeapObj::Bound(BoundMethod { receiver, method }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    fn define_method(&mut self, name: ObjRef) {
        let method = self.peek(0);
        let class = match self.peek(1) {
            Value::Obj(r) => r,
            other => panic!("method target is not a class: {:?}", other),
        };
        let hash = self.heap.str_hash(name);
        self.heap.class_mut(class).methods.set(name, hash, method);
        if name == self.init_string {
            if let Value::Obj(m) = method {
                self.heap.class_mut(class).initializer = Some(m);
            }
        }
        self.pop();
    }

    // ── Upvalues ─────────────────────────────────────────────────────────────

    /// Find or create the open upvalue for an absolute stack slot. The list
    /// is kept sorted by descending slot, one upvalue per slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let r = self.open_upvalues[i];
            match self.heap.upvalue(r).open_slot() {
                Some(s) if s == slot => return r,
                Some(s) if s < slot => break,
                _ => i += 1,
            }
        }
        let upvalue = self.alloc_rooted(HeapObj::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.insert(i, upvalue);
        upvalue
    }

    /// Close every open upvalue at or above `from`: copy the stack value
    /// into the cell and drop it from the open list.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&r) = self.open_upvalues.first() {
            let slot = match self.heap.upvalue(r).open_slot() {
                Some(s) => s,
                None => {
                    self.open_upvalues.remove(0);
                    continue;
                }
            };
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(r) = Upvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // ── Arithmetic ───────────────────────────────────────────────────────────

    /// Subtract, multiply, divide and the comparisons. Int stays Int (with
    /// two's-complement wrap, truncating division); any Num operand
    /// promotes.
    fn binary_op(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);

        let result = match (a, b) {
            (Value::Int(x), Value::Int(y)) => match op {
                OpCode::Subtract => Value::Int(x.wrapping_sub(y)),
                OpCode::Multiply => Value::Int(x.wrapping_mul(y)),
                OpCode::Divide => {
                    if y == 0 {
                        return Err(self.runtime_error("Division by zero."));
                    }
                    Value::Int(x.wrapping_div(y))
                }
                OpCode::Greater => Value::Bool(x > y),
                OpCode::Less => Value::Bool(x < y),
                _ => unreachable!("binary_op on non-binary opcode"),
            },
            _ if a.is_number() && b.is_number() => {
                let x = a.as_f64();
                let y = b.as_f64();
                match op {
                    OpCode::Subtract => Value::Num(x - y),
                    OpCode::Multiply => Value::Num(x * y),
                    OpCode::Divide => Value::Num(x / y),
                    OpCode::Greater => Value::Bool(x > y),
                    OpCode::Less => Value::Bool(x < y),
                    _ => unreachable!("binary_op on non-binary opcode"),
                }
            }
            _ => return Err(self.runtime_error("Operands must be numbers.")),
        };

        self.pop();
        self.pop();
        self.push(result);
        Ok(())
    }

    fn add_values(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);

        if let (Some(x), Some(y)) = (self.as_string(a), self.as_string(b)) {
            // Sizes are known up front: one buffer, one intern. Operands
            // stay on the stack until the result exists.
            let mut text = String::with_capacity(
                self.heap.str_chars(x).len() + self.heap.str_chars(y).len(),
            );
            text.push_str(self.heap.str_chars(x));
            text.push_str(self.heap.str_chars(y));
            let result = self.intern_rooted(&text);
            self.pop();
            self.pop();
            self.push(Value::Obj(result));
            return Ok(());
        }

        let result = match (a, b) {
            (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_add(y)),
            _ if a.is_number() && b.is_number() => Value::Num(a.as_f64() + b.as_f64()),
            _ => return Err(self.runtime_error("Operands must be two numbers or two strings.")),
        };
        self.pop();
        self.pop();
        self.push(result);
        Ok(())
    }

    // ── Subscripts ───────────────────────────────────────────────────────────

    fn check_index(&self, value: Value, len: usize) -> Result<usize, RuntimeError> {
        let index = match value {
            Value::Int(n) => n,
            Value::Num(n) if n.fract() == 0.0 && n.is_finite() => n as i64,
            _ => return Err(self.runtime_error("Index must be a non-negative integer.")),
        };
        if index < 0 || index as usize >= len {
            return Err(self.runtime_error(format!("Invalid index {}", index)));
        }
        Ok(index as usize)
    }

    fn index_subscr(&mut self) -> Result<(), RuntimeError> {
        let index_val = self.peek(0);
        let target = self.peek(1);

        if let Some(list) = self.as_list(target) {
            let index = self.check_index(index_val, self.heap.list(list).items.len())?;
            let value = self.heap.list(list).items[index];
            self.pop();
            self.pop();
            self.push(value);
            return Ok(());
        }

        if let Some(string) = self.as_string(target) {
            let bytes = self.heap.str_chars(string).as_bytes();
            let index = self.check_index(index_val, bytes.len())?;
            let piece = String::from_utf8_lossy(&[bytes[index]]).into_owned();
            let result = self.intern_rooted(&piece);
            self.pop();
            self.pop();
            self.push(Value::Obj(result));
            return Ok(());
        }

        Err(self.runtime_error("Only lists and strings can be indexed."))
    }

    fn store_subscr(&mut self) -> Result<(), RuntimeError> {
        let value = self.peek(0);
        let index_val = self.peek(1);
        let target = self.peek(2);

        let Some(list) = self.as_list(target) else {
            return Err(self.runtime_error("Only lists support index assignment."));
        };
        let index = self.check_index(index_val, self.heap.list(list).items.len())?;
        self.heap.list_mut(list).items[index] = value;

        self.pop();
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    // ── Tracing ──────────────────────────────────────────────────────────────

    fn trace_instruction(&self) {
        let mut repr = String::from("          ");
        for value in &self.stack {
            repr.push_str(&format!("[ {} ]", value.display(&self.heap)));
        }
        eprintln!("{}", repr);
        let frame = self.frame();
        let chunk = &self.heap.function(frame.function).chunk;
        let (text, _) = crate::debug::disassemble_instruction(&self.heap, chunk, frame.ip);
        eprintln!("{}", text);
    }

    // ── Dispatch loop ────────────────────────────────────────────────────────

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.trace {
                self.trace_instruction();
            }

            let byte = self.read_byte();
            let op = OpCode::try_from(byte)
                .map_err(|_| self.runtime_error(format!("Unknown opcode {}.", byte)))?;

            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.stack[base + slot] = self.peek(0);
                }

                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.str_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            return Err(self.runtime_error(format!(
                                "Undefined variable '{}'.",
                                self.heap.str_chars(name)
                            )));
                        }
                    }
                }
                OpCode::DefineGlobal | OpCode::DefineIGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.str_hash(name);
                    let flags = if op == OpCode::DefineIGlobal { FLAG_IMMUTABLE } else { 0 };
                    let value = self.peek(0);
                    self.globals.set_with_flags(name, hash, value, flags);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.str_hash(name);
                    if self.globals.has_flag(name, hash, FLAG_IMMUTABLE) {
                        return Err(self.runtime_error(format!(
                            "Cannot reassign immutable variable '{}'.",
                            self.heap.str_chars(name)
                        )));
                    }
                    let value = self.peek(0);
                    if !self.globals.replace(name, hash, value) {
                        return Err(self.runtime_error(format!(
                            "Undefined variable '{}'.",
                            self.heap.str_chars(name)
                        )));
                    }
                }

                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot];
                    let value = match *self.heap.upvalue(upvalue) {
                        Upvalue::Open(index) => self.stack[index],
                        Upvalue::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot];
                    let value = self.peek(0);
                    match *self.heap.upvalue(upvalue) {
                        Upvalue::Open(index) => self.stack[index] = value,
                        Upvalue::Closed(_) => {
                            *self.heap.upvalue_mut(upvalue) = Upvalue::Closed(value);
                        }
                    }
                }

                OpCode::GetProperty => {
                    let name = self.read_string();
                    let target = self.peek(0);
                    let Some(instance) = self.as_instance(target) else {
                        return Err(self.runtime_error("Only instances have properties."));
                    };
                    let hash = self.heap.str_hash(name);
                    let (class, field) = {
                        let inst = self.heap.instance(instance);
                        (inst.class, inst.fields.get(name, hash))
                    };
                    if let Some(value) = field {
                        self.pop();
                        self.push(value);
                    } else {
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let target = self.peek(1);
                    let Some(instance) = self.as_instance(target) else {
                        return Err(self.runtime_error("Only instances have fields."));
                    };
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    self.heap.instance_mut(instance).fields.set(name, hash, value);
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = match self.pop() {
                        Value::Obj(r) => r,
                        other => panic!("'super' slot is not a class: {:?}", other),
                    };
                    self.bind_method(superclass, name)?;
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(values_equal(a, b)));
                }
                OpCode::EqualNoPop => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    self.push(Value::Bool(values_equal(a, b)));
                }
                OpCode::Greater | OpCode::Less | OpCode::Subtract | OpCode::Multiply
                | OpCode::Divide => {
                    self.binary_op(op)?;
                }
                OpCode::Add => {
                    self.add_values()?;
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => match self.peek(0) {
                    Value::Int(n) => {
                        self.pop();
                        self.push(Value::Int(n.wrapping_neg()));
                    }
                    Value::Num(n) => {
                        self.pop();
                        self.push(Value::Num(-n));
                    }
                    _ => return Err(self.runtime_error("Operand must be a number.")),
                },

                OpCode::Print => {
                    let value = self.pop();
                    let text = value.display(&self.heap);
                    let _ = writeln!(self.out, "{}", text);
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    let superclass = match self.pop() {
                        Value::Obj(r) => r,
                        other => panic!("'super' slot is not a class: {:?}", other),
                    };
                    self.invoke_from_class(superclass, name, arg_count)?;
                }

                OpCode::Closure => {
                    let function = match self.read_constant() {
                        Value::Obj(r) => r,
                        other => panic!("closure constant is not a function: {:?}", other),
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let closure = self.alloc_rooted(HeapObj::Closure(Closure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    // On the stack before capturing, so the upvalue
                    // allocations below see it as a root.
                    self.push(Value::Obj(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.frame().base;
                            self.capture_upvalue(base + index)
                        } else {
                            let enclosing = self.frame().closure;
                            self.heap.closure(enclosing).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }

                OpCode::Return => {
                    let result = self.pop();
                    let base = self.frame().base;
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        // Pop the script closure and finish.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(result);
                }

                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.alloc_rooted(HeapObj::Class(Class {
                        name,
                        initializer: None,
                        methods: Table::new(),
                    }));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let superclass_val = self.peek(1);
                    let Some(superclass) = self.as_class(superclass_val) else {
                        return Err(self.runtime_error("Superclass must be a class."));
                    };
                    let subclass = match self.peek(0) {
                        Value::Obj(r) => r,
                        other => panic!("inherit target is not a class: {:?}", other),
                    };
                    let (methods, initializer) = {
                        let sup = self.heap.class(superclass);
                        let entries: Vec<(ObjRef, Value)> = sup.methods.iter().collect();
                        (entries, sup.initializer)
                    };
                    for (name, method) in methods {
                        let hash = self.heap.str_hash(name);
                        self.heap.class_mut(subclass).methods.set(name, hash, method);
                    }
                    self.heap.class_mut(subclass).initializer = initializer;
                    self.pop(); // subclass
                }
                OpCode::Method => {
                    let name = self.read_string();
                    self.define_method(name);
                }

                OpCode::BuildList => {
                    let count = self.read_index();
                    let start = self.stack.len() - count;
                    // Items stay on the stack across the allocation.
                    let list = self.alloc_rooted(HeapObj::List(ListObj {
                        items: Vec::with_capacity(count),
                    }));
                    let items: Vec<Value> = self.stack[start..].to_vec();
                    self.heap.list_mut(list).items = items;
                    self.stack.truncate(start);
                    self.push(Value::Obj(list));
                }
                OpCode::IndexSubscr => self.index_subscr()?,
                OpCode::StoreSubscr => self.store_subscr()?,
                OpCode::AppendTo => {
                    let value = self.peek(0);
                    let target = self.peek(1);
                    let Some(list) = self.as_list(target) else {
                        return Err(self.runtime_error("Expected a list as first argument."));
                    };
                    self.heap.list_mut(list).items.push(value);
                    self.pop();
                    self.pop();
                    self.push(Value::Nil);
                }
                OpCode::DeleteFrom => {
                    let index_val = self.peek(0);
                    let target = self.peek(1);
                    let Some(list) = self.as_list(target) else {
                        return Err(self.runtime_error("Expected a list as first argument."));
                    };
                    let index = self.check_index(index_val, self.heap.list(list).items.len())?;
                    let removed = self.heap.list_mut(list).items.remove(index);
                    self.pop();
                    self.pop();
                    self.push(removed);
                }
            }
        }
    }
}
