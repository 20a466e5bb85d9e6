/// Collector correctness under allocation pressure.
///
/// Every test here runs with stress mode on: the heap collects at every
/// single allocation, so any root the VM or compiler forgets to report
/// turns into a dangling handle and a loud panic. Observable program
/// behavior must be identical to a run without the collector.

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

fn run_stressed(source: &str) -> (Result<(), InterpretError>, String) {
    let buf = SharedBuf::default();
    let options = VmOptions { stress_gc: true, ..VmOptions::default() };
    let mut vm = Vm::with_writer(Box::new(buf.clone()), options);
    let result = vm.interpret(source);
    let output = String::from_utf8(buf.0.borrow().clone()).unwrap();
    (result, output)
}

fn run_stressed_ok(source: &str) -> String {
    let (result, output) = run_stressed(source);
    assert!(result.is_ok(), "unexpected failure under GC stress: {:?}", result);
    output
}

// ─── Programs behave identically under stress ────────────────────────────────

#[test]
fn test_closure_counter_under_stress() {
    let source = "
        fun makeCounter() {
            var n = 0;
            fun inc() { n = n + 1; return n; }
            return inc;
        }
        var c = makeCounter();
        print c(); print c(); print c();
    ";
    assert_eq!(run_stressed_ok(source), "1\n2\n3\n");
}

#[test]
fn test_classes_and_super_under_stress() {
    let source = "
        class A { greet() { print \"A\"; } }
        class B < A { greet() { super.greet(); print \"B\"; } }
        B().greet();
    ";
    assert_eq!(run_stressed_ok(source), "A\nB\n");
}

#[test]
fn test_method_table_survives_collection_mid_definition() {
    // Collections fire between OP_CLASS, each OP_METHOD, and instantiation;
    // the class and its growing method table must stay rooted throughout.
    let source = "
        class Wide {
            a() { return 1; }
            b() { return 2; }
            c() { return 3; }
            d() { return 4; }
        }
        var w = Wide();
        print w.a() + w.b() + w.c() + w.d();
    ";
    assert_eq!(run_stressed_ok(source), "10\n");
}

#[test]
fn test_string_building_in_loop_under_stress() {
    let source = "
        var s = \"\";
        for (var i = 0; i < 50; i = i + 1) {
            s = s + \"x\";
        }
        print s == \"\" + \"xxxxxxxxxx\" + \"xxxxxxxxxx\" + \"xxxxxxxxxx\" + \"xxxxxxxxxx\" + \"xxxxxxxxxx\";
    ";
    assert_eq!(run_stressed_ok(source), "true\n");
}

#[test]
fn test_interning_law_under_stress() {
    assert_eq!(run_stressed_ok("print \"ab\" + \"c\" == \"a\" + \"bc\";"), "true\n");
}

#[test]
fn test_list_growth_under_stress() {
    let source = "
        var xs = list();
        for (var i = 0; i < 40; i = i + 1) {
            append(xs, toString(i));
        }
        print len(xs);
        print get(xs, 39);
    ";
    assert_eq!(run_stressed_ok(source), "40\n39\n");
}

#[test]
fn test_instances_and_fields_under_stress() {
    let source = "
        class Node {
            init(value) { this.value = value; this.next = nil; }
        }
        var head = Node(0);
        var cursor = head;
        for (var i = 1; i < 20; i = i + 1) {
            cursor.next = Node(i);
            cursor = cursor.next;
        }
        var sum = 0;
        cursor = head;
        while (cursor != nil) {
            sum = sum + cursor.value;
            cursor = cursor.next;
        }
        print sum;
    ";
    assert_eq!(run_stressed_ok(source), "190\n");
}

#[test]
fn test_slices_and_deletes_under_stress() {
    let source = "
        var xs = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        var evens = slice(xs, 0, 10, 2);
        print evens;
        delete(evens, 0);
        print evens;
    ";
    assert_eq!(run_stressed_ok(source), "[0, 2, 4, 6, 8]\n[2, 4, 6, 8]\n");
}

#[test]
fn test_runtime_error_still_clean_under_stress() {
    let (result, _) = run_stressed("fun f() { return missing; } f();");
    assert!(matches!(result, Err(InterpretError::Runtime(_))));
}

// ─── Collector bookkeeping ───────────────────────────────────────────────────

#[test]
fn test_stress_mode_actually_collects() {
    let buf = SharedBuf::default();
    let options = VmOptions { stress_gc: true, ..VmOptions::default() };
    let mut vm = Vm::with_writer(Box::new(buf.clone()), options);
    vm.interpret("var s = \"a\" + \"b\"; print s;").unwrap();
    assert!(vm.heap.stats.collections > 0);
}

#[test]
fn test_garbage_is_reclaimed_across_runs() {
    let buf = SharedBuf::default();
    let options = VmOptions { stress_gc: true, ..VmOptions::default() };
    let mut vm = Vm::with_writer(Box::new(buf.clone()), options);
    vm.interpret(
        "for (var i = 0; i < 100; i = i + 1) { var t = toString(i) + \"-suffix\"; }",
    )
    .unwrap();
    assert!(vm.heap.stats.bytes_freed > 0, "transient strings should have been reclaimed");
}
