/// Built-in native functions.
///
/// Natives are installed as globals when the VM boots, each with a fixed
/// arity the VM checks before the call. A native receives a context (heap
/// access plus the VM root set, so allocations inside a native survive a
/// collection) and a view of its argument window. The canonical argument
/// slots stay on the VM stack for the duration of the call, so the values a
/// native sees are always rooted.
///
/// Registry: clock, toString, list, get, len, slice. The list mutators
/// `append` and `delete` are reserved words compiled straight to the
/// APPEND_TO / DELETE_FROM opcodes instead of going through this table.

use std::time::Instant;

use crate::errors::NativeError;
use crate::heap::{Heap, ObjRef};
use crate::object::{HeapObj, ListObj};
use crate::table::Table;
use crate::value::{format_num, Value};
use crate::vm::{mark_vm_roots, CallFrame};

pub type NativeFn = fn(&mut NativeCtx, &[Value]) -> Result<Value, NativeError>;

pub struct NativeDef {
    pub name: &'static str,
    pub arity: usize,
    pub func: NativeFn,
}

pub static NATIVES: &[NativeDef] = &[
    NativeDef { name: "clock", arity: 0, func: native_clock },
    NativeDef { name: "toString", arity: 1, func: native_to_string },
    NativeDef { name: "list", arity: 0, func: native_list },
    NativeDef { name: "get", arity: 2, func: native_get },
    NativeDef { name: "len", arity: 1, func: native_len },
    NativeDef { name: "slice", arity: 4, func: native_slice },
];

/// Execution context handed to a native: mutable heap access plus borrows
/// of every VM root so heap allocations can describe the live set.
pub struct NativeCtx<'vm> {
    pub heap: &'vm mut Heap,
    pub stack: &'vm [Value],
    pub frames: &'vm [CallFrame],
    pub globals: &'vm Table,
    pub open_upvalues: &'vm [ObjRef],
    pub init_string: ObjRef,
    pub started: Instant,
}

impl NativeCtx<'_> {
    pub fn intern(&mut self, text: &str) -> ObjRef {
        let stack = self.stack;
        let frames = self.frames;
        let globals = self.globals;
        let open = self.open_upvalues;
        let init = self.init_string;
        self.heap.intern(text, |gc| mark_vm_roots(gc, stack, frames, globals, open, init))
    }

    pub fn alloc(&mut self, obj: HeapObj) -> ObjRef {
        let stack = self.stack;
        let frames = self.frames;
        let globals = self.globals;
        let open = self.open_upvalues;
        let init = self.init_string;
        self.heap.alloc(obj, |gc| mark_vm_roots(gc, stack, frames, globals, open, init))
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn as_list(ctx: &NativeCtx, value: Value) -> Result<ObjRef, NativeError> {
    if let Value::Obj(r) = value {
        if matches!(ctx.heap.get(r), HeapObj::List(_)) {
            return Ok(r);
        }
    }
    Err(NativeError::new("Expected a list as first argument."))
}

/// Integral view of a value: Int directly, or a Num with no fraction.
fn as_index(value: Value) -> Option<i64> {
    match value {
        Value::Int(n) => Some(n),
        Value::Num(n) if n.fract() == 0.0 && n.is_finite() => Some(n as i64),
        _ => None,
    }
}

// ─── Natives ─────────────────────────────────────────────────────────────────

/// Seconds since the VM started, as a float.
fn native_clock(ctx: &mut NativeCtx, _args: &[Value]) -> Result<Value, NativeError> {
    Ok(Value::Num(ctx.started.elapsed().as_secs_f64()))
}

fn native_to_string(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, NativeError> {
    let text = match args[0] {
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) => "false".to_string(),
        Value::Nil => "nil".to_string(),
        Value::Int(n) => n.to_string(),
        Value::Num(n) => format_num(n),
        Value::Obj(_) => {
            return Err(NativeError::new("toString accepts only numbers or booleans."));
        }
    };
    let r = ctx.intern(&text);
    Ok(Value::Obj(r))
}

fn native_list(ctx: &mut NativeCtx, _args: &[Value]) -> Result<Value, NativeError> {
    let r = ctx.alloc(HeapObj::List(ListObj { items: Vec::new() }));
    Ok(Value::Obj(r))
}

fn native_get(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, NativeError> {
    let list = as_list(ctx, args[0])?;
    let index = match as_index(args[1]) {
        Some(i) if i >= 0 => i as usize,
        _ => return Err(NativeError::new("Expected a non-negative integer as second argument.")),
    };

    let items = &ctx.heap.list(list).items;
    items
        .get(index)
        .copied()
        .ok_or_else(|| NativeError::new(format!("Invalid index {}", index)))
}

fn native_len(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, NativeError> {
    let list = as_list(ctx, args[0])?;
    Ok(Value::Int(ctx.heap.list(list).items.len() as i64))
}

fn native_slice(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, NativeError> {
    let list = as_list(ctx, args[0])?;
    let start = match as_index(args[1]) {
        Some(i) if i >= 0 => i as usize,
        _ => return Err(NativeError::new("Expected a non-negative integer as second argument.")),
    };
    let stop = match as_index(args[2]) {
        Some(i) if i >= 0 => i as usize,
        _ => return Err(NativeError::new("Expected a non-negative integer as third argument.")),
    };
    let step = match as_index(args[3]) {
        Some(i) if i >= 1 => i as usize,
        _ => return Err(NativeError::new("Expected a positive integer as fourth argument.")),
    };

    let items = &ctx.heap.list(list).items;
    let stop = stop.min(items.len());
    let picked: Vec<Value> = if start >= stop {
        Vec::new()
    } else {
        items[start..stop].iter().copied().step_by(step).collect()
    };

    let r = ctx.alloc(HeapObj::List(ListObj { items: picked }));
    Ok(Value::Obj(r))
}
