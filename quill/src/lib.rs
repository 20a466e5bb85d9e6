/// Quill Language Library
///
/// A single-pass bytecode compiler and stack-based virtual machine for the
/// Quill scripting language (.ql).
///
/// Module layout:
///   - scanner   — byte-slice tokenizer, one token of lookahead
///   - value     — tagged runtime values (nil, bool, int, num, object)
///   - object    — heap object kinds (string, function, closure, upvalue,
///                 class, instance, bound method, list, native)
///   - table     — open-addressed hash table keyed by interned strings
///   - chunk     — opcodes, bytecode buffer, constant pool, line table
///   - heap      — handle arena + mark-sweep garbage collector + interner
///   - compiler  — Pratt parser emitting bytecode, no AST
///   - vm        — call-frame interpreter and root-set wiring
///   - natives   — built-in function registry
///   - debug     — bytecode disassembler
///   - errors    — compile/runtime/native error types

// ── Core runtime ─────────────────────────────────────────────────────────────
pub mod chunk;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;
pub mod vm;

// ── Front-end ────────────────────────────────────────────────────────────────
pub mod compiler;
pub mod scanner;

// ── Support ──────────────────────────────────────────────────────────────────
pub mod debug;
pub mod errors;
pub mod natives;

// ── Re-exports for convenience ───────────────────────────────────────────────
pub use chunk::{Chunk, OpCode};
pub use compiler::{compile, compile_with_roots};
pub use debug::{disassemble_chunk, disassemble_function, disassemble_instruction};
pub use errors::{InterpretError, NativeError, RuntimeError};
pub use heap::{GcConfig, GcScope, Heap, ObjRef};
pub use scanner::{Scanner, Token, TokenKind};
pub use value::Value;
pub use vm::{Vm, VmOptions};
