/// End-to-end language tests: source in, stdout out.
///
/// These drive the whole pipeline (scanner → compiler → VM) through the
/// public `Vm::interpret` entry point with a captured output sink, and
/// verify:
///   • Arithmetic with int/float promotion
///   • Closures, upvalue capture and closing
///   • Classes, initializers, inheritance, `super`, bound methods
///   • Control flow: if/else, while, for, break/continue, switch, ternary
///   • Lists, subscripts, and the append/delete/list/get/len/slice surface
///   • Mutability (`var` vs `val`) at local and global scope
///   • Runtime error messages and frame traces

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use quill::{InterpretError, Vm, VmOptions};

#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> (Result<(), InterpretError>, String) {
    let buf = SharedBuf::default();
    let mut vm = Vm::with_writer(Box::new(buf.clone()), VmOptions::default());
    let result = vm.interpret(source);
    let output = String::from_utf8(buf.0.borrow().clone()).unwrap();
    (result, output)
}

fn run_ok(source: &str) -> String {
    let (result, output) = run(source);
    assert!(result.is_ok(), "unexpected failure: {:?}\noutput so far:\n{}", result, output);
    output
}

fn runtime_error(source: &str) -> quill::RuntimeError {
    match run(source).0 {
        Err(InterpretError::Runtime(e)) => e,
        other => panic!("expected runtime error, got {:?}", other),
    }
}

// ─── Basics ───────────────────────────────────────────────────────────────────

#[test]
fn test_globals_and_addition() {
    assert_eq!(run_ok("var a = 1; var b = 2; print a + b;"), "3\n");
}

#[test]
fn test_print_forms() {
    assert_eq!(run_ok("print true; print false; print nil;"), "true\nfalse\nnil\n");
    assert_eq!(run_ok("print 2.0; print 2.5; print \"hi\";"), "2\n2.5\nhi\n");
    assert_eq!(run_ok("print [1, \"two\", nil];"), "[1, two, nil]\n");
}

#[test]
fn test_integer_radix_literals() {
    assert_eq!(run_ok("print 0x10 + 0o10 + 8;"), "32\n");
}

#[test]
fn test_truthiness() {
    assert_eq!(run_ok("print 0 ? \"t\" : \"f\";"), "t\n");
    assert_eq!(run_ok("print \"\" ? \"t\" : \"f\";"), "t\n");
    assert_eq!(run_ok("print [] ? \"t\" : \"f\";"), "t\n");
    assert_eq!(run_ok("print false ? \"t\" : \"f\";"), "f\n");
    assert_eq!(run_ok("print nil ? \"t\" : \"f\";"), "f\n");
}

#[test]
fn test_and_or_short_circuit() {
    assert_eq!(run_ok("print 1 and 2;"), "2\n");
    assert_eq!(run_ok("print nil and 2;"), "nil\n");
    assert_eq!(run_ok("print nil or 3;"), "3\n");
    assert_eq!(run_ok("print 1 or 3;"), "1\n");
    // The right side must not run when short-circuited.
    assert_eq!(
        run_ok("fun boom() { print \"boom\"; return true; } print false and boom();"),
        "false\n"
    );
}

// ─── Functions and closures ──────────────────────────────────────────────────

#[test]
fn test_counter_closure() {
    let source = "
        fun makeCounter() {
            var n = 0;
            fun inc() { n = n + 1; return n; }
            return inc;
        }
        var c = makeCounter();
        print c(); print c(); print c();
    ";
    assert_eq!(run_ok(source), "1\n2\n3\n");
}

#[test]
fn test_independent_counters() {
    let source = "
        fun makeCounter() {
            var n = 0;
            fun inc() { n = n + 1; return n; }
            return inc;
        }
        var a = makeCounter();
        var b = makeCounter();
        print a(); print a(); print b();
    ";
    assert_eq!(run_ok(source), "1\n2\n1\n");
}

#[test]
fn test_three_level_capture() {
    let source = "
        fun outer(a) {
            fun middle(b) {
                fun inner(c) { return a + b + c; }
                return inner;
            }
            return middle;
        }
        print outer(1)(2)(3);
    ";
    assert_eq!(run_ok(source), "6\n");
}

#[test]
fn test_upvalues_close_at_scope_exit() {
    let source = "
        var f = nil;
        {
            var captured = \"inside\";
            fun read() { return captured; }
            f = read;
        }
        print f();
    ";
    assert_eq!(run_ok(source), "inside\n");
}

#[test]
fn test_sibling_closures_share_one_cell() {
    let source = "
        fun pair() {
            var n = 0;
            fun bump() { n = n + 1; }
            fun read() { return n; }
            bump(); bump();
            return read;
        }
        print pair()();
    ";
    assert_eq!(run_ok(source), "2\n");
}

#[test]
fn test_recursion() {
    let source = "
        fun fib(n) {
            if (n < 2) return n;
            return fib(n - 1) + fib(n - 2);
        }
        print fib(15);
    ";
    assert_eq!(run_ok(source), "610\n");
}

// ─── Classes ─────────────────────────────────────────────────────────────────

#[test]
fn test_inheritance_and_super() {
    let source = "
        class A { greet() { print \"A\"; } }
        class B < A { greet() { super.greet(); print \"B\"; } }
        B().greet();
    ";
    assert_eq!(run_ok(source), "A\nB\n");
}

#[test]
fn test_initializer_sets_field() {
    assert_eq!(run_ok("class P { init(x) { this.x = x; } } print P(7).x;"), "7\n");
}

#[test]
fn test_initializer_returns_instance() {
    let source = "
        class P {
            init() { this.x = 1; return; }
        }
        print P().x;
    ";
    assert_eq!(run_ok(source), "1\n");
}

#[test]
fn test_inherited_methods_are_copied() {
    let source = "
        class A { hello() { return \"hello\"; } }
        class B < A {}
        print B().hello();
    ";
    assert_eq!(run_ok(source), "hello\n");
}

#[test]
fn test_inherited_initializer() {
    let source = "
        class A { init(x) { this.x = x; } }
        class B < A {}
        print B(9).x;
    ";
    assert_eq!(run_ok(source), "9\n");
}

#[test]
fn test_super_through_init() {
    let source = "
        class A { init(x) { this.x = x; } }
        class B < A { init(x) { super.init(x + 1); } }
        print B(4).x;
    ";
    assert_eq!(run_ok(source), "5\n");
}

#[test]
fn test_bound_method_carries_receiver() {
    let source = "
        class Cell {
            init(v) { this.v = v; }
            get() { return this.v; }
        }
        var cell = Cell(42);
        var m = cell.get;
        print m();
    ";
    assert_eq!(run_ok(source), "42\n");
}

#[test]
fn test_field_shadows_method_on_invoke() {
    let source = "
        fun shadow() { return \"field\"; }
        class C { speak() { return \"method\"; } }
        var c = C();
        print c.speak();
        c.speak = shadow;
        print c.speak();
    ";
    assert_eq!(run_ok(source), "method\nfield\n");
}

#[test]
fn test_method_invocation_fast_path() {
    let source = "
        class Adder {
            init(base) { this.base = base; }
            add(n) { return this.base + n; }
        }
        var a = Adder(10);
        print a.add(5);
    ";
    assert_eq!(run_ok(source), "15\n");
}

// ─── Control flow ────────────────────────────────────────────────────────────

#[test]
fn test_if_else() {
    assert_eq!(run_ok("if (1 < 2) print \"yes\"; else print \"no\";"), "yes\n");
    assert_eq!(run_ok("if (1 > 2) print \"yes\"; else print \"no\";"), "no\n");
}

#[test]
fn test_while_loop() {
    assert_eq!(run_ok("var i = 0; while (i < 3) { print i; i = i + 1; }"), "0\n1\n2\n");
}

#[test]
fn test_for_break_continue() {
    let source = "
        for (var i = 0; i < 5; i = i + 1) {
            if (i == 1) continue;
            if (i == 3) break;
            print i;
        }
    ";
    assert_eq!(run_ok(source), "0\n2\n");
}

#[test]
fn test_while_break_continue() {
    let source = "
        var i = 0;
        while (true) {
            i = i + 1;
            if (i == 2) continue;
            if (i > 4) break;
            print i;
        }
        print \"done\";
    ";
    assert_eq!(run_ok(source), "1\n3\n4\ndone\n");
}

#[test]
fn test_nested_loop_break_binds_inner() {
    let source = "
        for (var i = 0; i < 2; i = i + 1) {
            for (var j = 0; j < 5; j = j + 1) {
                if (j == 1) break;
                print i * 10 + j;
            }
        }
    ";
    assert_eq!(run_ok(source), "0\n10\n");
}

#[test]
fn test_switch_matches_case() {
    let source = "
        switch (2) {
            case 1: print \"one\";
            case 2: print \"two\";
            case 3: print \"three\";
            default: print \"other\";
        }
    ";
    assert_eq!(run_ok(source), "two\n");
}

#[test]
fn test_switch_default_and_no_match() {
    let source = "
        switch (9) {
            case 1: print \"one\";
            default: print \"other\";
        }
        switch (9) {
            case 1: print \"one\";
        }
        print \"after\";
    ";
    assert_eq!(run_ok(source), "other\nafter\n");
}

#[test]
fn test_switch_on_strings() {
    let source = "
        val who = \"cat\";
        switch (who) {
            case \"dog\": print \"woof\";
            case \"cat\": print \"meow\";
        }
    ";
    assert_eq!(run_ok(source), "meow\n");
}

#[test]
fn test_ternary_nesting() {
    assert_eq!(run_ok("print 1 == 2 ? \"a\" : 3 == 3 ? \"b\" : \"c\";"), "b\n");
}

// ─── Lists ───────────────────────────────────────────────────────────────────

#[test]
fn test_list_natives() {
    let source = "
        var xs = list();
        append(xs, 10);
        append(xs, 20);
        print get(xs, 1);
        print len(xs);
    ";
    assert_eq!(run_ok(source), "20\n2\n");
}

#[test]
fn test_append_returns_nil_delete_returns_element() {
    let source = "
        var xs = [1, 2, 3];
        print append(xs, 4);
        print delete(xs, 0);
        print xs;
    ";
    assert_eq!(run_ok(source), "nil\n1\n[2, 3, 4]\n");
}

#[test]
fn test_slice() {
    let source = "
        var xs = [0, 1, 2, 3, 4, 5];
        print slice(xs, 1, 5, 2);
        print slice(xs, 0, 99, 1);
        print slice(xs, 4, 2, 1);
    ";
    assert_eq!(run_ok(source), "[1, 3]\n[0, 1, 2, 3, 4, 5]\n[]\n");
}

#[test]
fn test_subscript_read_write() {
    let source = "
        var xs = [1, 2, 3];
        xs[1] = xs[1] * 10;
        print xs[1];
        print \"quill\"[0];
    ";
    assert_eq!(run_ok(source), "20\nq\n");
}

#[test]
fn test_list_errors() {
    assert!(runtime_error("append(1, 2);").message.contains("Expected a list"));
    assert!(runtime_error("var xs = [1]; print xs[3];").message.contains("Invalid index"));
    assert!(runtime_error("print get(nil, 0);").message.contains("Expected a list"));
    assert!(runtime_error("var xs = [1]; print delete(xs, 9);").message.contains("Invalid index"));
}

// ─── Mutability ──────────────────────────────────────────────────────────────

#[test]
fn test_immutable_global_rejected_at_runtime() {
    let error = runtime_error("val k = 1; k = 2;");
    assert!(
        error.message.contains("immutable"),
        "message should mention immutability: {}",
        error.message
    );
}

#[test]
fn test_immutable_local_rejected_at_compile_time() {
    let (result, _) = run("{ val k = 1; k = 2; }");
    assert!(matches!(result, Err(InterpretError::Compile)));
}

#[test]
fn test_val_global_is_readable() {
    assert_eq!(run_ok("val k = 6; print k * 7;"), "42\n");
}

// ─── Strings and interning ───────────────────────────────────────────────────

#[test]
fn test_interning_across_identities() {
    assert_eq!(run_ok("print \"ab\" + \"c\" == \"a\" + \"bc\";"), "true\n");
}

#[test]
fn test_to_string_native() {
    let source = "
        print toString(true) + \"|\" + toString(nil) + \"|\" + toString(12) + \"|\" + toString(2.5);
    ";
    assert_eq!(run_ok(source), "true|nil|12|2.5\n");
}

#[test]
fn test_clock_is_numeric() {
    assert_eq!(run_ok("print clock() >= 0;"), "true\n");
}

// ─── Runtime errors ──────────────────────────────────────────────────────────

#[test]
fn test_undefined_variable() {
    assert!(runtime_error("print missing;").message.contains("Undefined variable 'missing'."));
}

#[test]
fn test_type_errors() {
    assert_eq!(runtime_error("print 1 + \"a\";").message, "Operands must be two numbers or two strings.");
    assert_eq!(runtime_error("print -\"a\";").message, "Operand must be a number.");
    assert_eq!(runtime_error("print 1 < \"a\";").message, "Operands must be numbers.");
    assert_eq!(runtime_error("nil();").message, "Can only call functions and classes.");
    assert_eq!(runtime_error("print nil.field;").message, "Only instances have properties.");
}

#[test]
fn test_arity_mismatch() {
    let error = runtime_error("fun f(a, b) { return a; } f(1);");
    assert_eq!(error.message, "Expected 2 arguments but got 1.");
    let error = runtime_error("class C {} C(1);");
    assert_eq!(error.message, "Expected 0 arguments but got 1.");
}

#[test]
fn test_undefined_property_and_method() {
    let source = "
        class C {}
        var c = C();
        c.nope();
    ";
    assert_eq!(runtime_error(source).message, "Undefined property 'nope'.");
}

#[test]
fn test_inherit_from_non_class() {
    let error = runtime_error("var NotAClass = 1; class C < NotAClass {}");
    assert_eq!(error.message, "Superclass must be a class.");
}

#[test]
fn test_stack_overflow_at_frame_limit() {
    let error = runtime_error("fun loop() { return loop(); } loop();");
    assert_eq!(error.message, "Stack overflow.");
    // One trace entry per live frame.
    assert_eq!(error.trace.len(), 64);
}

#[test]
fn test_trace_order_is_innermost_first() {
    let source = "
        fun inner() { return 1 + nil; }
        fun outer() { return inner(); }
        outer();
    ";
    let error = runtime_error(source);
    assert_eq!(error.trace[0].function.as_deref(), Some("inner"));
    assert_eq!(error.trace[1].function.as_deref(), Some("outer"));
    assert_eq!(error.trace.last().unwrap().function, None);
}

// ─── Compile errors ──────────────────────────────────────────────────────────

#[test]
fn test_compile_error_cases() {
    let cases = [
        "return 1;",
        "break;",
        "continue;",
        "val x;",
        "class A < A {}",
        "class A { init() { return 1; } }",
        "print this;",
        "print super.x;",
        "class A { m() { print super.m(); } }",
        "fun f() { var a = a; }",
        "{ var a = 1; var a = 2; }",
        "1 = 2;",
        "switch (1) { print 1; }",
    ];
    for source in cases {
        let (result, _) = run(source);
        assert!(
            matches!(result, Err(InterpretError::Compile)),
            "expected compile error for {:?}",
            source
        );
    }
}

// ─── Constant pool width boundaries ──────────────────────────────────────────

#[test]
fn test_long_constant_indices_end_to_end() {
    // 200 distinct names and literals push the pool past the 127-entry
    // short-index range.
    let mut source = String::new();
    for i in 0..200 {
        source.push_str(&format!("var v{} = {};\n", i, i * 2));
    }
    source.push_str("print v199;\n");
    assert_eq!(run_ok(&source), "398\n");
}

#[test]
fn test_very_long_constant_indices_end_to_end() {
    // Past 65,536 constants, exercising the full 23-bit index path.
    let mut source = String::new();
    for i in 0..33000 {
        source.push_str(&format!("var g{} = {};\n", i, i));
    }
    source.push_str("print g32999;\nprint g0 + g1;\n");
    assert_eq!(run_ok(&source), "32999\n1\n");
}
