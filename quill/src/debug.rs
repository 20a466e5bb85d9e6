/// Bytecode disassembler.
///
/// Consumes only public chunk and value data. Drives the `dis` subcommand
/// and the VM's `--trace` mode. Output format:
///
///   == <fn name> ==
///   0000    1 OP_CONSTANT         0 '1'
///   0002    | OP_PRINT
///
/// The line column prints `|` when the instruction shares its source line
/// with the previous one.

use crate::chunk::{Chunk, OpCode};
use crate::heap::{Heap, ObjRef};
use crate::object::HeapObj;
use crate::value::Value;

pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (text, next) = disassemble_instruction(heap, chunk, offset);
        out.push_str(&text);
        out.push('\n');
        offset = next;
    }
    out
}

/// Disassemble a whole function and, recursively, every function in its
/// constant pool.
pub fn disassemble_function(heap: &Heap, function: ObjRef) -> String {
    let f = heap.function(function);
    let name = match f.name {
        Some(n) => format!("<fn {}>", heap.str_chars(n)),
        None => "<script>".to_string(),
    };
    let mut out = disassemble_chunk(heap, &f.chunk, &name);
    for &constant in &f.chunk.constants {
        if let Value::Obj(r) = constant {
            if matches!(heap.get(r), HeapObj::Function(_)) {
                out.push('\n');
                out.push_str(&disassemble_function(heap, r));
            }
        }
    }
    out
}

/// One instruction; returns its text and the offset of the next one.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut text = format!("{:04} ", offset);
    let line = chunk.get_line(offset);
    if offset > 0 && line == chunk.get_line(offset - 1) {
        text.push_str("   | ");
    } else {
        text.push_str(&format!("{:4} ", line));
    }

    let byte = chunk.code[offset];
    let Ok(op) = OpCode::try_from(byte) else {
        text.push_str(&format!("Unknown opcode {}", byte));
        return (text, offset + 1);
    };

    match op {
        OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::Equal
        | OpCode::EqualNoPop
        | OpCode::Greater
        | OpCode::Less
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Not
        | OpCode::Negate
        | OpCode::Print
        | OpCode::CloseUpvalue
        | OpCode::Return
        | OpCode::Inherit
        | OpCode::IndexSubscr
        | OpCode::StoreSubscr
        | OpCode::AppendTo
        | OpCode::DeleteFrom => {
            text.push_str(op.name());
            (text, offset + 1)
        }

        OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue | OpCode::SetUpvalue
        | OpCode::Call => {
            let slot = chunk.code[offset + 1];
            text.push_str(&format!("{:<16} {:4}", op.name(), slot));
            (text, offset + 2)
        }

        OpCode::Jump | OpCode::JumpIfFalse => {
            let jump = ((chunk.code[offset + 1] as usize) << 8) | chunk.code[offset + 2] as usize;
            text.push_str(&format!("{:<16} {:4} -> {}", op.name(), offset, offset + 3 + jump));
            (text, offset + 3)
        }
        OpCode::Loop => {
            let jump = ((chunk.code[offset + 1] as usize) << 8) | chunk.code[offset + 2] as usize;
            text.push_str(&format!("{:<16} {:4} -> {}", op.name(), offset, offset + 3 - jump));
            (text, offset + 3)
        }

        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::DefineIGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => {
            let (index, width) = chunk.read_index(offset + 1);
            let value = chunk.constants[index].display(heap);
            text.push_str(&format!("{:<16} {:9} '{}'", op.name(), index, value));
            (text, offset + 1 + width)
        }

        OpCode::BuildList => {
            let (count, width) = chunk.read_index(offset + 1);
            text.push_str(&format!("{:<16} {:9}", op.name(), count));
            (text, offset + 1 + width)
        }

        OpCode::Invoke | OpCode::SuperInvoke => {
            let (index, width) = chunk.read_index(offset + 1);
            let arg_count = chunk.code[offset + 1 + width];
            let value = chunk.constants[index].display(heap);
            text.push_str(&format!(
                "{:<16} ({} args) {:9} '{}'",
                op.name(),
                arg_count,
                index,
                value
            ));
            (text, offset + 2 + width)
        }

        OpCode::Closure => {
            let (index, width) = chunk.read_index(offset + 1);
            let value = chunk.constants[index];
            text.push_str(&format!("{:<16} {:9} '{}'", op.name(), index, value.display(heap)));
            let mut next = offset + 1 + width;
            if let Value::Obj(r) = value {
                if let HeapObj::Function(f) = heap.get(r) {
                    for _ in 0..f.upvalue_count {
                        let is_local = chunk.code[next];
                        let slot = chunk.code[next + 1];
                        text.push_str(&format!(
                            "\n{:04}      |                     {} {}",
                            next,
                            if is_local != 0 { "local" } else { "upvalue" },
                            slot
                        ));
                        next += 2;
                    }
                }
            }
            (text, next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::heap::GcConfig;

    #[test]
    fn test_disassembles_simple_chunk() {
        let mut heap = Heap::new(GcConfig::default());
        let function = compile("print 1 + 2;", &mut heap).unwrap();
        let listing = disassemble_function(&heap, function);
        assert!(listing.starts_with("== <script> ==\n"));
        assert!(listing.contains("OP_CONSTANT"));
        assert!(listing.contains("OP_ADD"));
        assert!(listing.contains("OP_PRINT"));
        assert!(listing.contains("OP_RETURN"));
    }

    #[test]
    fn test_disassembles_closure_upvalues() {
        let mut heap = Heap::new(GcConfig::default());
        let source = "fun outer() { var a = 1; fun inner() { return a; } return inner; }";
        let function = compile(source, &mut heap).unwrap();
        let listing = disassemble_function(&heap, function);
        assert!(listing.contains("OP_CLOSURE"));
        assert!(listing.contains("local 1"), "inner captures outer's local slot 1");
        assert!(listing.contains("<fn inner>"));
    }

    #[test]
    fn test_walks_every_offset() {
        let mut heap = Heap::new(GcConfig::default());
        let source = "
            var xs = [1, 2, 3];
            if (xs[0] < 2 and true) { print \"small\"; } else { print \"big\"; }
            while (false) { print 0; }
        ";
        let function = compile(source, &mut heap).unwrap();
        // Must terminate and cover the whole chunk without panicking.
        let listing = disassemble_function(&heap, function);
        assert!(listing.contains("OP_JUMP_IF_FALSE"));
        assert!(listing.contains("OP_LOOP"));
        assert!(listing.contains("OP_BUILD_LIST"));
    }
}
