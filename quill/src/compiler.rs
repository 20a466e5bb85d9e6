/// Single-pass Pratt compiler: source text straight to bytecode, no AST.
///
/// STRUCTURE:
///   • `Parser` is the whole compilation context: scanner, one token of
///     lookahead, a stack of `CompilerFrame`s (one per function being
///     compiled, the outermost being the script) and a stack of class
///     contexts tracking `this`/`super` validity
///   • The grammar lives in `RULES`, a static table of (prefix, infix,
///     precedence) triples indexed by token kind; rule handlers are free
///     functions so the table has no hidden state
///   • Locals resolve newest-first inside a frame; names missing there walk
///     enclosing frames and become upvalues, marking the captured local on
///     the way; names missing everywhere compile to global accesses
///   • Mutability: `val` locals and upvalues are rejected at the assignment
///     site here; `val` globals carry the IMMUTABLE table flag and are
///     rejected by the VM on OP_SET_GLOBAL
///   • Errors print immediately in `[line N] Error at '<lexeme>': <msg>`
///     form; panic mode swallows the cascade until a statement boundary

use crate::chunk::{Chunk, OpCode, MAX_CONSTANTS};
use crate::heap::{GcScope, Heap, ObjRef};
use crate::object::{Function, HeapObj};
use crate::scanner::{Scanner, Token, TokenKind, TOKEN_KINDS};
use crate::value::Value;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARITY: usize = 255;
const MAX_CASES: usize = 255;
const MAX_JUMP: usize = u16::MAX as usize;

// ─── Precedence ──────────────────────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Ternary,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Subscript,
    Primary,
}

impl Precedence {
    const LADDER: [Precedence; 13] = [
        Precedence::None,
        Precedence::Assignment,
        Precedence::Ternary,
        Precedence::Or,
        Precedence::And,
        Precedence::Equality,
        Precedence::Comparison,
        Precedence::Term,
        Precedence::Factor,
        Precedence::Unary,
        Precedence::Call,
        Precedence::Subscript,
        Precedence::Primary,
    ];

    fn next(self) -> Precedence {
        Self::LADDER[(self as usize + 1).min(Self::LADDER.len() - 1)]
    }
}

// ─── Compilation state ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while the initializer is still being compiled.
    depth: i32,
    is_captured: bool,
    is_mutable: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct LoopContext {
    start: usize,
    depth: i32,
    breaks: Vec<usize>,
}

/// The function under construction. Becomes a heap `Function` when its
/// frame is popped.
struct FunctionBuilder {
    arity: usize,
    upvalue_count: usize,
    name: Option<ObjRef>,
    chunk: Chunk,
}

struct CompilerFrame<'src> {
    func: FunctionBuilder,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    loops: Vec<LoopContext>,
}

impl<'src> CompilerFrame<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        // Slot 0 is reserved: the receiver in methods and initializers,
        // unnameable otherwise.
        let slot_zero = Local {
            name: if kind == FunctionKind::Method || kind == FunctionKind::Initializer {
                "this"
            } else {
                ""
            },
            depth: 0,
            is_captured: false,
            is_mutable: false,
        };
        CompilerFrame {
            func: FunctionBuilder { arity: 0, upvalue_count: 0, name, chunk: Chunk::new() },
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

struct ClassContext {
    has_superclass: bool,
}

pub struct Parser<'src, 'h> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    heap: &'h mut Heap,
    /// Additional roots owned by the embedder (the VM's globals, stack and
    /// interned names); marked alongside the compiler's own roots whenever
    /// an allocation here triggers a collection.
    extra_roots: &'h dyn Fn(&mut GcScope),
    frames: Vec<CompilerFrame<'src>>,
    classes: Vec<ClassContext>,
}

/// Roots during compilation: every open frame's function name and constant
/// pool (finished inner functions are constants of their parent, so the
/// whole chain is reachable from here).
fn mark_compiler_roots(gc: &mut GcScope, frames: &[CompilerFrame<'_>]) {
    for frame in frames {
        if let Some(name) = frame.func.name {
            gc.mark_object(name);
        }
        for &constant in &frame.func.chunk.constants {
            gc.mark_value(constant);
        }
    }
}

/// Compile a script. Diagnostics go to stderr as they are found; returns
/// None if any were reported.
pub fn compile(source: &str, heap: &mut Heap) -> Option<ObjRef> {
    compile_with_roots(source, heap, &|_| {})
}

/// Compile with embedder-supplied extra GC roots. The VM passes its own
/// root set here so a collection mid-compile cannot sweep already-installed
/// globals out from under it.
pub fn compile_with_roots(
    source: &str,
    heap: &mut Heap,
    extra_roots: &dyn Fn(&mut GcScope),
) -> Option<ObjRef> {
    let mut parser = Parser::new(source, heap, extra_roots);
    parser.advance();
    while !parser.matches(TokenKind::Eof) {
        parser.declaration();
    }
    let (function, _) = parser.pop_function();
    if parser.had_error {
        None
    } else {
        Some(function)
    }
}

impl<'src, 'h> Parser<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap, extra_roots: &'h dyn Fn(&mut GcScope)) -> Self {
        Parser {
            scanner: Scanner::new(source),
            current: Token::synthetic(""),
            previous: Token::synthetic(""),
            had_error: false,
            panic_mode: false,
            heap,
            extra_roots,
            frames: vec![CompilerFrame::new(FunctionKind::Script, None)],
            classes: Vec::new(),
        }
    }

    // ── Token plumbing ───────────────────────────────────────────────────────

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at(self.current, message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at(self.current, message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // ── Diagnostics ──────────────────────────────────────────────────────────

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        eprint!("[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => eprint!(" at end"),
            TokenKind::Error => {}
            _ => eprint!(" at '{}'", token.lexeme),
        }
        eprintln!(": {}", message);
        self.had_error = true;
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::Val
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return
                | TokenKind::Switch => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ── Heap access ──────────────────────────────────────────────────────────

    fn intern(&mut self, text: &str) -> ObjRef {
        let frames = &self.frames;
        let extra = self.extra_roots;
        self.heap.intern(text, |gc| {
            mark_compiler_roots(gc, frames);
            extra(gc);
        })
    }

    // ── Emission ─────────────────────────────────────────────────────────────

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.frames.last_mut().expect("compiler frame stack empty").func.chunk
    }

    fn chunk_len(&self) -> usize {
        self.frames.last().expect("compiler frame stack empty").func.chunk.code.len()
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.into());
    }

    fn emit_ops(&mut self, a: OpCode, b: OpCode) {
        self.emit_op(a);
        self.emit_op(b);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk_len() - loop_start + 2;
        if offset > MAX_JUMP {
            self.error("Loop body too large.");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the operand bytes of the jump itself.
        let jump = self.chunk_len() - offset - 2;
        if jump > MAX_JUMP {
            self.error("Too much code to jump over.");
        }
        let chunk = self.current_chunk();
        chunk.code[offset] = (jump >> 8) as u8;
        chunk.code[offset + 1] = jump as u8;
    }

    fn emit_return(&mut self) {
        if self.frames.last().expect("compiler frame stack empty").kind
            == FunctionKind::Initializer
        {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> usize {
        let index = self.current_chunk().add_constant(value);
        if index >= MAX_CONSTANTS {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index
    }

    fn emit_constant_op(&mut self, op: OpCode, index: usize) {
        let line = self.previous.line;
        self.current_chunk().write_constant_op(op, index, line);
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_constant_op(OpCode::Constant, index);
    }

    // ── Frames ───────────────────────────────────────────────────────────────

    fn push_frame(&mut self, kind: FunctionKind) {
        let name = if kind == FunctionKind::Script {
            None
        } else {
            Some(self.intern(self.previous.lexeme))
        };
        self.frames.push(CompilerFrame::new(kind, name));
    }

    /// Finish the current function: emit the implicit return, allocate the
    /// heap object and move the built chunk into it. The shell is allocated
    /// while the builder is still rooted through the frame, and filled in
    /// with no intervening allocation.
    fn pop_function(&mut self) -> (ObjRef, Vec<UpvalueDesc>) {
        self.emit_return();
        let name = self.frames.last().expect("compiler frame stack empty").func.name;
        let shell = {
            let frames = &self.frames;
            let extra = self.extra_roots;
            self.heap.alloc(
                HeapObj::Function(Function {
                    arity: 0,
                    upvalue_count: 0,
                    name,
                    chunk: Chunk::new(),
                }),
                |gc| {
                    mark_compiler_roots(gc, frames);
                    extra(gc);
                },
            )
        };
        let frame = self.frames.pop().expect("compiler frame stack empty");
        let builder = frame.func;
        if let HeapObj::Function(f) = self.heap.get_mut(shell) {
            f.arity = builder.arity;
            f.upvalue_count = builder.upvalue_count;
            f.chunk = builder.chunk;
        }
        (shell, frame.upvalues)
    }

    // ── Scopes and variables ─────────────────────────────────────────────────

    fn begin_scope(&mut self) {
        self.frames.last_mut().expect("compiler frame stack empty").scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let frame = self.frames.last_mut().expect("compiler frame stack empty");
        frame.scope_depth -= 1;
        let mut ops = Vec::new();
        while let Some(local) = frame.locals.last() {
            if local.depth <= frame.scope_depth {
                break;
            }
            ops.push(if local.is_captured { OpCode::CloseUpvalue } else { OpCode::Pop });
            frame.locals.pop();
        }
        for op in ops {
            self.emit_op(op);
        }
    }

    fn identifier_constant(&mut self, name: &str) -> usize {
        let string = self.intern(name);
        self.make_constant(Value::Obj(string))
    }

    fn add_local(&mut self, name: &'src str, is_mutable: bool) {
        let frame = self.frames.last().expect("compiler frame stack empty");
        if frame.locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.frames
            .last_mut()
            .expect("compiler frame stack empty")
            .locals
            .push(Local { name, depth: -1, is_captured: false, is_mutable });
    }

    fn declare_variable(&mut self, is_mutable: bool) {
        let frame = self.frames.last().expect("compiler frame stack empty");
        if frame.scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let mut duplicate = false;
        for local in frame.locals.iter().rev() {
            if local.depth != -1 && local.depth < frame.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name, is_mutable);
    }

    fn parse_variable(&mut self, message: &str, is_mutable: bool) -> usize {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable(is_mutable);
        if self.frames.last().expect("compiler frame stack empty").scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        let frame = self.frames.last_mut().expect("compiler frame stack empty");
        if frame.scope_depth == 0 {
            return;
        }
        let depth = frame.scope_depth;
        if let Some(local) = frame.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: usize, is_mutable: bool) {
        if self.frames.last().expect("compiler frame stack empty").scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        let op = if is_mutable { OpCode::DefineGlobal } else { OpCode::DefineIGlobal };
        self.emit_constant_op(op, global);
    }

    /// Find `name` among a frame's locals, newest first. Returns the slot
    /// and its mutability.
    fn resolve_local(&mut self, frame: usize, name: &str) -> Option<(u8, bool)> {
        let locals = &self.frames[frame].locals;
        for i in (0..locals.len()).rev() {
            let local = &locals[i];
            if local.name == name {
                let uninitialized = local.depth == -1;
                let is_mutable = local.is_mutable;
                if uninitialized {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some((i as u8, is_mutable));
            }
        }
        None
    }

    fn add_upvalue(&mut self, frame: usize, index: u8, is_local: bool) -> u8 {
        let desc = UpvalueDesc { index, is_local };
        if let Some(i) = self.frames[frame].upvalues.iter().position(|uv| *uv == desc) {
            return i as u8;
        }
        if self.frames[frame].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        let f = &mut self.frames[frame];
        f.upvalues.push(desc);
        f.func.upvalue_count += 1;
        (f.upvalues.len() - 1) as u8
    }

    /// Resolve `name` against enclosing frames, chaining upvalues inward.
    /// Mutability travels with the binding so `val` captures stay `val`.
    fn resolve_upvalue(&mut self, frame: usize, name: &str) -> Option<(u8, bool)> {
        if frame == 0 {
            return None;
        }
        if let Some((local, is_mutable)) = self.resolve_local(frame - 1, name) {
            self.frames[frame - 1].locals[local as usize].is_captured = true;
            let index = self.add_upvalue(frame, local, true);
            return Some((index, is_mutable));
        }
        if let Some((upvalue, is_mutable)) = self.resolve_upvalue(frame - 1, name) {
            let index = self.add_upvalue(frame, upvalue, false);
            return Some((index, is_mutable));
        }
        None
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        enum Target {
            Local(u8),
            Upvalue(u8),
            Global(usize),
        }

        let top = self.frames.len() - 1;
        let (target, is_mutable) = if let Some((slot, m)) = self.resolve_local(top, name.lexeme) {
            (Target::Local(slot), m)
        } else if let Some((slot, m)) = self.resolve_upvalue(top, name.lexeme) {
            (Target::Upvalue(slot), m)
        } else {
            // Global mutability is a runtime property (the IMMUTABLE flag).
            (Target::Global(self.identifier_constant(name.lexeme)), true)
        };

        if can_assign && self.matches(TokenKind::Equal) {
            if !is_mutable {
                self.error("Can't assign to immutable declaration.");
            }
            self.expression();
            match target {
                Target::Local(slot) => {
                    self.emit_op(OpCode::SetLocal);
                    self.emit_byte(slot);
                }
                Target::Upvalue(slot) => {
                    self.emit_op(OpCode::SetUpvalue);
                    self.emit_byte(slot);
                }
                Target::Global(index) => self.emit_constant_op(OpCode::SetGlobal, index),
            }
        } else {
            match target {
                Target::Local(slot) => {
                    self.emit_op(OpCode::GetLocal);
                    self.emit_byte(slot);
                }
                Target::Upvalue(slot) => {
                    self.emit_op(OpCode::GetUpvalue);
                    self.emit_byte(slot);
                }
                Target::Global(index) => self.emit_constant_op(OpCode::GetGlobal, index),
            }
        }
    }

    fn synthetic(&self, text: &'static str) -> Token<'src> {
        Token { kind: TokenKind::Identifier, lexeme: text, line: self.previous.line }
    }

    // ── Expressions ──────────────────────────────────────────────────────────

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = RULES[self.previous.kind as usize].prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= RULES[self.current.kind as usize].precedence {
            self.advance();
            if let Some(infix) = RULES[self.previous.kind as usize].infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == MAX_ARITY {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(MAX_ARITY) as u8
    }

    // ── Declarations and statements ──────────────────────────────────────────

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration(true);
        } else if self.matches(TokenKind::Val) {
            self.var_declaration(false);
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Switch) {
            self.switch_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn var_declaration(&mut self, is_mutable: bool) {
        let global = self.parse_variable("Expect variable name.", is_mutable);

        if self.matches(TokenKind::Equal) {
            self.expression();
        } else if !is_mutable {
            self.error("Immutable objects need to be assigned at declaration.");
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");

        self.define_variable(global, is_mutable);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.", true);
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global, true);
    }

    fn function(&mut self, kind: FunctionKind) {
        self.push_frame(kind);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = {
                    let frame = self.frames.last_mut().expect("compiler frame stack empty");
                    frame.func.arity += 1;
                    frame.func.arity
                };
                if arity > MAX_ARITY {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.", true);
                self.define_variable(constant, true);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.pop_function();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_constant_op(OpCode::Closure, constant);
        for upvalue in &upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous.lexeme);

        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_constant_op(OpCode::Method, constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(self.previous.lexeme);
        self.declare_variable(true);

        self.emit_constant_op(OpCode::Class, name_constant);
        self.define_variable(name_constant, true);

        self.classes.push(ClassContext { has_superclass: false });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.named_variable(self.previous, false);

            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_local("super", false);
            self.define_variable(0, false);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().expect("class stack empty").has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().expect("class stack empty").has_superclass {
            self.end_scope();
        }

        self.classes.pop();
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn return_statement(&mut self) {
        let kind = self.frames.last().expect("compiler frame stack empty").kind;
        if kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    // ── Loops ────────────────────────────────────────────────────────────────

    fn begin_loop(&mut self, start: usize) {
        let frame = self.frames.last_mut().expect("compiler frame stack empty");
        let depth = frame.scope_depth;
        frame.loops.push(LoopContext { start, depth, breaks: Vec::new() });
    }

    /// Pop the loop context and land its breaks here.
    fn end_loop(&mut self) {
        let context = self
            .frames
            .last_mut()
            .expect("compiler frame stack empty")
            .loops
            .pop()
            .expect("end_loop without begin_loop");
        for jump in context.breaks {
            self.patch_jump(jump);
        }
    }

    /// Pop locals declared inside the loop body before leaving it sideways.
    fn discard_loop_locals(&mut self) {
        let frame = self.frames.last().expect("compiler frame stack empty");
        let depth = frame.loops.last().expect("not inside a loop").depth;
        let count = frame.locals.iter().rev().take_while(|l| l.depth > depth).count();
        for _ in 0..count {
            self.emit_op(OpCode::Pop);
        }
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        if self.frames.last().expect("compiler frame stack empty").loops.is_empty() {
            self.error("Found 'break' outside a loop.");
            return;
        }
        self.discard_loop_locals();
        let jump = self.emit_jump(OpCode::Jump);
        self.frames
            .last_mut()
            .expect("compiler frame stack empty")
            .loops
            .last_mut()
            .expect("not inside a loop")
            .breaks
            .push(jump);
    }

    fn continue_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        if self.frames.last().expect("compiler frame stack empty").loops.is_empty() {
            self.error("Found 'continue' outside a loop.");
            return;
        }
        self.discard_loop_locals();
        let start = self
            .frames
            .last()
            .expect("compiler frame stack empty")
            .loops
            .last()
            .expect("not inside a loop")
            .start;
        self.emit_loop(start);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        self.begin_loop(loop_start);

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        // Breaks land past the condition pop: the break path has no
        // condition value on the stack.
        self.end_loop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // Empty initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration(true);
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            // Continue targets the increment, not the condition.
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.begin_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        self.end_loop();
        self.end_scope();
    }

    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
        self.consume(TokenKind::LeftBrace, "Expect '{' after switch expression.");

        let mut case_ends: Vec<usize> = Vec::new();
        let mut pending_false: Option<usize> = None;
        let mut n_cases = 0usize;
        let mut in_case = false;
        let mut in_default = false;

        while !self.matches(TokenKind::RightBrace) {
            if self.check(TokenKind::Eof) {
                self.error_at_current("Expect '}' after switch cases.");
                break;
            }
            if self.matches(TokenKind::Case) {
                in_case = true;
                if in_default {
                    self.error("Unexpected 'case' after 'default'.");
                } else if n_cases == MAX_CASES {
                    self.error("Too many 'case' clauses in one 'switch'.");
                }
                if let Some(false_jump) = pending_false.take() {
                    case_ends.push(self.emit_jump(OpCode::Jump));
                    self.patch_jump(false_jump);
                    self.emit_ops(OpCode::Pop, OpCode::Pop);
                }

                self.expression();
                self.consume(TokenKind::Colon, "Expect ':' after case expression.");
                // Compare against the subject without consuming it.
                self.emit_op(OpCode::EqualNoPop);
                pending_false = Some(self.emit_jump(OpCode::JumpIfFalse));
                self.emit_ops(OpCode::Pop, OpCode::Pop);
                n_cases += 1;
            } else if self.matches(TokenKind::Default) {
                if in_default {
                    self.error("Duplicate 'default'.");
                }
                in_case = true;
                in_default = true;
                self.consume(TokenKind::Colon, "Expect ':' after 'default'.");
                if let Some(false_jump) = pending_false.take() {
                    case_ends.push(self.emit_jump(OpCode::Jump));
                    self.patch_jump(false_jump);
                    self.emit_ops(OpCode::Pop, OpCode::Pop);
                }
            } else {
                if !in_case {
                    self.error_at_current("Code outside 'case' or 'default' clauses.");
                }
                self.statement();
            }
        }

        if let Some(false_jump) = pending_false.take() {
            case_ends.push(self.emit_jump(OpCode::Jump));
            self.patch_jump(false_jump);
            self.emit_ops(OpCode::Pop, OpCode::Pop);
        }
        for end in case_ends {
            self.patch_jump(end);
        }
        self.emit_op(OpCode::Pop); // the subject
    }
}

// ─── Parse rule handlers ─────────────────────────────────────────────────────
// Free functions so the rule table is a plain static with no captured state.

fn grouping(p: &mut Parser, _can_assign: bool) {
    p.expression();
    p.consume(TokenKind::RightParen, "Expect ')' after expression.");
}

fn number(p: &mut Parser, _can_assign: bool) {
    let lexeme = p.previous.lexeme;
    if p.previous.kind == TokenKind::Integer {
        let parsed = if let Some(hex) = lexeme.strip_prefix("0x") {
            i64::from_str_radix(hex, 16)
        } else if let Some(oct) = lexeme.strip_prefix("0o") {
            i64::from_str_radix(oct, 8)
        } else {
            lexeme.parse()
        };
        match parsed {
            Ok(n) => p.emit_constant(Value::Int(n)),
            Err(_) => p.error("Integer literal too large."),
        }
    } else {
        match lexeme.parse::<f64>() {
            Ok(n) => p.emit_constant(Value::Num(n)),
            Err(_) => p.error("Invalid number literal."),
        }
    }
}

fn string_literal(p: &mut Parser, _can_assign: bool) {
    let lexeme = p.previous.lexeme;
    let contents = &lexeme[1..lexeme.len() - 1];
    let string = p.intern(contents);
    p.emit_constant(Value::Obj(string));
}

fn literal(p: &mut Parser, _can_assign: bool) {
    match p.previous.kind {
        TokenKind::False => p.emit_op(OpCode::False),
        TokenKind::Nil => p.emit_op(OpCode::Nil),
        TokenKind::True => p.emit_op(OpCode::True),
        _ => unreachable!("literal rule on non-literal token"),
    }
}

fn variable(p: &mut Parser, can_assign: bool) {
    p.named_variable(p.previous, can_assign);
}

fn unary(p: &mut Parser, _can_assign: bool) {
    let operator = p.previous.kind;
    p.parse_precedence(Precedence::Unary);
    match operator {
        TokenKind::Bang => p.emit_op(OpCode::Not),
        TokenKind::Minus => p.emit_op(OpCode::Negate),
        _ => unreachable!("unary rule on non-unary token"),
    }
}

fn binary(p: &mut Parser, _can_assign: bool) {
    let operator = p.previous.kind;
    let precedence = RULES[operator as usize].precedence;
    p.parse_precedence(precedence.next());

    match operator {
        TokenKind::BangEqual => p.emit_ops(OpCode::Equal, OpCode::Not),
        TokenKind::EqualEqual => p.emit_op(OpCode::Equal),
        TokenKind::Greater => p.emit_op(OpCode::Greater),
        TokenKind::GreaterEqual => p.emit_ops(OpCode::Less, OpCode::Not),
        TokenKind::Less => p.emit_op(OpCode::Less),
        TokenKind::LessEqual => p.emit_ops(OpCode::Greater, OpCode::Not),
        TokenKind::Plus => p.emit_op(OpCode::Add),
        TokenKind::Minus => p.emit_op(OpCode::Subtract),
        TokenKind::Star => p.emit_op(OpCode::Multiply),
        TokenKind::Slash => p.emit_op(OpCode::Divide),
        _ => unreachable!("binary rule on non-binary token"),
    }
}

fn ternary(p: &mut Parser, _can_assign: bool) {
    let mid_jump = p.emit_jump(OpCode::JumpIfFalse);

    p.emit_op(OpCode::Pop);
    p.parse_precedence(Precedence::Assignment);
    let exit_jump = p.emit_jump(OpCode::Jump);

    p.consume(TokenKind::Colon, "Expect ':' after first ternary expression.");

    p.patch_jump(mid_jump);
    p.emit_op(OpCode::Pop);
    p.parse_precedence(Precedence::Assignment);
    p.patch_jump(exit_jump);
}

fn and_op(p: &mut Parser, _can_assign: bool) {
    let end_jump = p.emit_jump(OpCode::JumpIfFalse);
    p.emit_op(OpCode::Pop);
    p.parse_precedence(Precedence::And);
    p.patch_jump(end_jump);
}

fn or_op(p: &mut Parser, _can_assign: bool) {
    let else_jump = p.emit_jump(OpCode::JumpIfFalse);
    let end_jump = p.emit_jump(OpCode::Jump);

    p.patch_jump(else_jump);
    p.emit_op(OpCode::Pop);

    p.parse_precedence(Precedence::Or);
    p.patch_jump(end_jump);
}

fn call(p: &mut Parser, _can_assign: bool) {
    let arg_count = p.argument_list();
    p.emit_op(OpCode::Call);
    p.emit_byte(arg_count);
}

fn dot(p: &mut Parser, can_assign: bool) {
    p.consume(TokenKind::Identifier, "Expect property name after '.'.");
    let name = p.identifier_constant(p.previous.lexeme);

    if can_assign && p.matches(TokenKind::Equal) {
        p.expression();
        p.emit_constant_op(OpCode::SetProperty, name);
    } else if p.matches(TokenKind::LeftParen) {
        let arg_count = p.argument_list();
        p.emit_constant_op(OpCode::Invoke, name);
        p.emit_byte(arg_count);
    } else {
        p.emit_constant_op(OpCode::GetProperty, name);
    }
}

fn this_expr(p: &mut Parser, _can_assign: bool) {
    if p.classes.is_empty() {
        p.error("Can't use 'this' outside of a class.");
        return;
    }
    variable(p, false);
}

fn super_expr(p: &mut Parser, _can_assign: bool) {
    if p.classes.is_empty() {
        p.error("Can't use 'super' outside of a class.");
    } else if !p.classes.last().expect("class stack empty").has_superclass {
        p.error("Can't use 'super' in a class with no superclass.");
    }

    p.consume(TokenKind::Dot, "Expect '.' after 'super'.");
    p.consume(TokenKind::Identifier, "Expect superclass method name.");
    let name = p.identifier_constant(p.previous.lexeme);

    let this_token = p.synthetic("this");
    let super_token = p.synthetic("super");
    p.named_variable(this_token, false);
    if p.matches(TokenKind::LeftParen) {
        let arg_count = p.argument_list();
        p.named_variable(super_token, false);
        p.emit_constant_op(OpCode::SuperInvoke, name);
        p.emit_byte(arg_count);
    } else {
        p.named_variable(super_token, false);
        p.emit_constant_op(OpCode::GetSuper, name);
    }
}

fn list_literal(p: &mut Parser, _can_assign: bool) {
    let mut item_count: usize = 0;

    if !p.check(TokenKind::RightBracket) {
        loop {
            if p.check(TokenKind::RightBracket) {
                // Trailing comma.
                break;
            }
            p.parse_precedence(Precedence::Ternary);
            item_count += 1;
            if !p.matches(TokenKind::Comma) {
                break;
            }
        }
    }
    p.consume(TokenKind::RightBracket, "Expect ']' after list literal.");

    // The operand is the raw item count, reusing the self-describing
    // short/long encoding rather than the constant pool.
    p.emit_constant_op(OpCode::BuildList, item_count);
}

fn subscript(p: &mut Parser, can_assign: bool) {
    p.parse_precedence(Precedence::Ternary);
    p.consume(TokenKind::RightBracket, "Expect ']' after index.");

    if can_assign && p.matches(TokenKind::Equal) {
        p.expression();
        p.emit_op(OpCode::StoreSubscr);
    } else {
        p.emit_op(OpCode::IndexSubscr);
    }
}

fn append_call(p: &mut Parser, _can_assign: bool) {
    p.consume(TokenKind::LeftParen, "Expect '(' after 'append'.");
    p.expression();
    p.consume(TokenKind::Comma, "Expect ',' after list argument.");
    p.expression();
    p.consume(TokenKind::RightParen, "Expect ')' after arguments.");
    p.emit_op(OpCode::AppendTo);
}

fn delete_call(p: &mut Parser, _can_assign: bool) {
    p.consume(TokenKind::LeftParen, "Expect '(' after 'delete'.");
    p.expression();
    p.consume(TokenKind::Comma, "Expect ',' after list argument.");
    p.expression();
    p.consume(TokenKind::RightParen, "Expect ')' after arguments.");
    p.emit_op(OpCode::DeleteFrom);
}

// ─── Rule table ──────────────────────────────────────────────────────────────

type ParseFn = for<'s, 'h> fn(&mut Parser<'s, 'h>, bool);

struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

const fn rule(
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
) -> ParseRule {
    ParseRule { prefix, infix, precedence }
}

/// Indexed by `TokenKind as usize`; rows follow the TokenKind declaration.
static RULES: [ParseRule; TOKEN_KINDS] = [
    rule(Some(grouping), Some(call), Precedence::Call), // LeftParen
    rule(None, None, Precedence::None),                 // RightParen
    rule(None, None, Precedence::None),                 // LeftBrace
    rule(None, None, Precedence::None),                 // RightBrace
    rule(Some(list_literal), Some(subscript), Precedence::Subscript), // LeftBracket
    rule(None, None, Precedence::None),                 // RightBracket
    rule(None, None, Precedence::None),                 // Comma
    rule(None, Some(dot), Precedence::Call),            // Dot
    rule(Some(unary), Some(binary), Precedence::Term),  // Minus
    rule(None, Some(binary), Precedence::Term),         // Plus
    rule(None, None, Precedence::None),                 // Semicolon
    rule(None, None, Precedence::None),                 // Colon
    rule(None, Some(ternary), Precedence::Ternary),     // Question
    rule(None, Some(binary), Precedence::Factor),       // Slash
    rule(None, Some(binary), Precedence::Factor),       // Star
    rule(Some(unary), None, Precedence::None),          // Bang
    rule(None, Some(binary), Precedence::Equality),     // BangEqual
    rule(None, None, Precedence::None),                 // Equal
    rule(None, Some(binary), Precedence::Equality),     // EqualEqual
    rule(None, Some(binary), Precedence::Comparison),   // Greater
    rule(None, Some(binary), Precedence::Comparison),   // GreaterEqual
    rule(None, Some(binary), Precedence::Comparison),   // Less
    rule(None, Some(binary), Precedence::Comparison),   // LessEqual
    rule(Some(variable), None, Precedence::None),       // Identifier
    rule(Some(string_literal), None, Precedence::None), // String
    rule(Some(number), None, Precedence::None),         // Integer
    rule(Some(number), None, Precedence::None),         // Number
    rule(None, Some(and_op), Precedence::And),          // And
    rule(Some(append_call), None, Precedence::None),    // Append
    rule(None, None, Precedence::None),                 // Break
    rule(None, None, Precedence::None),                 // Case
    rule(None, None, Precedence::None),                 // Class
    rule(None, None, Precedence::None),                 // Continue
    rule(None, None, Precedence::None),                 // Default
    rule(Some(delete_call), None, Precedence::None),    // Delete
    rule(None, None, Precedence::None),                 // Else
    rule(Some(literal), None, Precedence::None),        // False
    rule(None, None, Precedence::None),                 // For
    rule(None, None, Precedence::None),                 // Fun
    rule(None, None, Precedence::None),                 // If
    rule(Some(literal), None, Precedence::None),        // Nil
    rule(None, Some(or_op), Precedence::Or),            // Or
    rule(None, None, Precedence::None),                 // Print
    rule(None, None, Precedence::None),                 // Return
    rule(Some(super_expr), None, Precedence::None),     // Super
    rule(None, None, Precedence::None),                 // Switch
    rule(Some(this_expr), None, Precedence::None),      // This
    rule(Some(literal), None, Precedence::None),        // True
    rule(None, None, Precedence::None),                 // Val
    rule(None, None, Precedence::None),                 // Var
    rule(None, None, Precedence::None),                 // While
    rule(None, None, Precedence::None),                 // Error
    rule(None, None, Precedence::None),                 // Eof
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::GcConfig;

    fn compile_src(source: &str) -> (Heap, Option<ObjRef>) {
        let mut heap = Heap::new(GcConfig::default());
        let function = compile(source, &mut heap);
        (heap, function)
    }

    #[test]
    fn test_simple_arithmetic_bytecode() {
        let (heap, function) = compile_src("print 1 + 2;");
        let function = function.expect("should compile");
        let chunk = &heap.function(function).chunk;
        let expected: Vec<u8> = vec![
            OpCode::Constant.into(),
            0,
            OpCode::Constant.into(),
            1,
            OpCode::Add.into(),
            OpCode::Print.into(),
            OpCode::Nil.into(),
            OpCode::Return.into(),
        ];
        assert_eq!(chunk.code, expected);
        assert_eq!(chunk.constants, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_integer_literal_radixes() {
        let (heap, function) = compile_src("print 0x1F; print 0o17; print 9;");
        let chunk = &heap.function(function.unwrap()).chunk;
        assert_eq!(chunk.constants, vec![Value::Int(31), Value::Int(15), Value::Int(9)]);
    }

    #[test]
    fn test_float_literal() {
        let (heap, function) = compile_src("print 2.5;");
        let chunk = &heap.function(function.unwrap()).chunk;
        assert_eq!(chunk.constants, vec![Value::Num(2.5)]);
    }

    #[test]
    fn test_upvalue_resolution_counts() {
        let source = "
            fun outer() {
                var a = 1;
                fun middle() {
                    fun inner() { return a; }
                    return inner;
                }
                return middle;
            }
        ";
        let (heap, function) = compile_src(source);
        let script = heap.function(function.unwrap());
        let outer = script
            .chunk
            .constants
            .iter()
            .find_map(|v| match v {
                Value::Obj(r) => match heap.get(*r) {
                    HeapObj::Function(f) if f.name.is_some() => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("outer function constant");
        assert_eq!(outer.upvalue_count, 0);

        let middle = outer
            .chunk
            .constants
            .iter()
            .find_map(|v| match v {
                Value::Obj(r) => match heap.get(*r) {
                    HeapObj::Function(f) => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("middle function constant");
        // `middle` forwards `a` from outer's local to inner's upvalue.
        assert_eq!(middle.upvalue_count, 1);
    }

    #[test]
    fn test_compile_errors() {
        let cases = [
            "val x;",
            "var a = 1; a + ;",
            "break;",
            "continue;",
            "return 1;",
            "fun f() { val k = 1; k = 2; }",
            "class A < A {}",
            "{ var a = 1; var a = 2; }",
            "fun f() { var a = a; }",
            "switch (1) { default: default: }",
            "1 = 2;",
        ];
        for source in cases {
            let (_, function) = compile_src(source);
            assert!(function.is_none(), "expected compile error for {:?}", source);
        }
    }

    #[test]
    fn test_captured_val_cannot_be_assigned_through_upvalue() {
        let source = "
            fun outer() {
                val k = 1;
                fun inner() { k = 2; }
            }
        ";
        let (_, function) = compile_src(source);
        assert!(function.is_none());
    }

    #[test]
    fn test_loop_too_large() {
        let mut source = String::from("while (true) {");
        for _ in 0..17000 {
            source.push_str(" print 1;");
        }
        source.push('}');
        let (_, function) = compile_src(&source);
        assert!(function.is_none(), "a 16-bit loop offset must overflow");
    }

    #[test]
    fn test_long_constant_indices_compile() {
        let mut source = String::new();
        for i in 0..200 {
            source.push_str(&format!("var v{} = {};\n", i, i));
        }
        let (heap, function) = compile_src(&source);
        let chunk = &heap.function(function.unwrap()).chunk;
        // 200 names + 200 integer literals pushes the pool past the short
        // index range, so long-form operands must appear.
        assert!(chunk.constants.len() > 128);
        assert!(chunk.code.iter().any(|&b| b & 0x80 != 0));
    }

    #[test]
    fn test_class_with_methods_compiles() {
        let source = "
            class Point {
                init(x) { this.x = x; }
                sum(other) { return this.x + other.x; }
            }
            class Point3 < Point {
                init(x) { super.init(x); }
            }
        ";
        let (_, function) = compile_src(source);
        assert!(function.is_some());
    }
}
