//! Builder tests -- blocks, labels, data pool, linking

use bci::error::{EncodingError, LinkError};
use bci::vm::builder::{Arg, Builder};
use bci::vm::bytecode::{Module, TypeMetadata, HEADER_SIZE};
use bci::vm::opcodes::{decode, Opcode};
use bci::vm::{Value, VM};

// ── Helpers ──────────────────────────────────────────────────────

fn run(module: Module) -> (Value, String) {
    let mut vm = VM::with_output(module, Vec::new());
    let result = vm.run().unwrap();
    (result, String::from_utf8(vm.into_output()).unwrap())
}

// ── 1. Layout ───────────────────────────────────────────────────

#[test]
fn empty_builder_links_to_header_only() {
    let module = Builder::new().link().unwrap();
    assert_eq!(module.as_bytes(), &[4, 0, 0, 0]);
    assert_eq!(module.data_offset(), HEADER_SIZE);
}

#[test]
fn blocks_are_laid_out_in_creation_order() {
    let mut b = Builder::new();
    let first = b.create_block();
    let second = b.create_block();

    b.block(second).emit(Opcode::Ret, &[]).unwrap();
    {
        let mut blk = b.block(first);
        blk.emit(Opcode::Enter, &[Arg::Int(0)]).unwrap();
        blk.emit(Opcode::PushUnit, &[]).unwrap();
    }
    assert_eq!(b.code_len(), 7);

    let module = b.link().unwrap();
    assert_eq!(module.data_offset(), 4 + 7);
    assert_eq!(
        module.code(),
        &[
            Opcode::Enter.byte(),
            0,
            0,
            0,
            0,
            Opcode::PushUnit.byte(),
            Opcode::Ret.byte()
        ]
    );
}

// ── 2. Label relocation ─────────────────────────────────────────

#[test]
fn cross_block_label_resolves_to_block_base() {
    let mut b = Builder::new();
    let main = b.create_block();
    let callee = b.create_block();
    let callee_start = b.start_label(callee);

    {
        let mut blk = b.block(main);
        blk.emit(Opcode::Enter, &[Arg::Int(0)]).unwrap(); // 4..9
        blk.emit(Opcode::PushClosure, &[callee_start.into()]).unwrap(); // 9..14
        blk.emit(Opcode::Ret, &[]).unwrap(); // 14
    }
    {
        let mut blk = b.block(callee);
        blk.emit(Opcode::Enter, &[Arg::Int(1)]).unwrap();
        blk.emit(Opcode::Ret, &[]).unwrap();
    }

    let module = b.link().unwrap();
    assert_eq!(module.read_i32(10).unwrap(), 15);
    let (inst, _) = decode(module.as_bytes(), 15).unwrap();
    assert_eq!(inst.to_string(), "ENTER 1");
}

#[test]
fn forward_label_inside_later_block() {
    let mut b = Builder::new();
    let first = b.create_block();
    let second = b.create_block();

    let target = b.new_label();
    b.block(first).emit(Opcode::Jmp, &[target.into()]).unwrap(); // 4..9
    {
        let mut blk = b.block(second);
        blk.emit(Opcode::PushInt, &[Arg::Int(1)]).unwrap(); // 9..14
        blk.emit(Opcode::Discard, &[]).unwrap(); // 14
        blk.place_label(target).unwrap(); // 15
        blk.emit(Opcode::Ret, &[]).unwrap();
    }

    let module = b.link().unwrap();
    assert_eq!(module.read_i32(5).unwrap(), 15);
}

#[test]
fn mark_label_records_current_offset() {
    let mut b = Builder::new();
    let main = b.create_block();
    let mut blk = b.block(main);
    blk.emit(Opcode::PushTrue, &[]).unwrap();
    assert_eq!(blk.offset(), 1);
    let here = blk.mark_label();
    blk.emit(Opcode::JmpTrue, &[here.into()]).unwrap();
    let module = b.link().unwrap();
    assert_eq!(module.read_i32(6).unwrap(), 5);
}

#[test]
fn jump_table_entries_are_patched() {
    let mut b = Builder::new();
    let main = b.create_block();
    let mut blk = b.block(main);
    let nil = blk.new_label();
    let cons = blk.new_label();
    blk.emit(Opcode::JmpData, &[Arg::Table(vec![nil, cons])]).unwrap(); // 4..17
    blk.place_label(nil).unwrap();
    blk.emit(Opcode::Ret, &[]).unwrap(); // 17
    blk.place_label(cons).unwrap();
    blk.emit(Opcode::Ret, &[]).unwrap(); // 18

    let module = b.link().unwrap();
    let (inst, len) = decode(module.as_bytes(), 4).unwrap();
    assert_eq!(len, 13);
    assert_eq!(inst.to_string(), "JMP_DATA 2 17 18");
}

#[test]
fn unresolved_label_fails_link() {
    let mut b = Builder::new();
    let main = b.create_block();
    let nowhere = b.new_label();
    {
        let mut blk = b.block(main);
        blk.emit(Opcode::PushUnit, &[]).unwrap();
        blk.emit(Opcode::Jmp, &[nowhere.into()]).unwrap();
    }

    match b.link() {
        Err(LinkError::UnresolvedLabel { label, block, offset }) => {
            assert_eq!(label, "L1");
            assert_eq!(block, "L0");
            assert_eq!(offset, 2);
        }
        other => panic!("expected UnresolvedLabel, got {:?}", other),
    }
}

#[test]
fn label_from_another_builder_is_rejected() {
    let mut other = Builder::new();
    other.create_block();
    other.new_label();
    let stray = other.new_label();

    let mut b = Builder::new();
    let main = b.create_block();
    let mut blk = b.block(main);
    match blk.place_label(stray) {
        Err(LinkError::ForeignLabel(label)) => assert_eq!(label, "L2"),
        other => panic!("expected ForeignLabel, got {:?}", other),
    }
}

// ── 3. Data pool ────────────────────────────────────────────────

#[test]
fn data_references_point_past_the_code() {
    let mut b = Builder::new();
    let main = b.create_block();
    let pad = b.write_data(&[9, 9]);
    let meta = b.write_data_int(0);
    assert_eq!(pad.offset(), 0);
    assert_eq!(meta.offset(), 2);
    {
        let mut blk = b.block(main);
        blk.emit(Opcode::PushData, &[meta.into(), Arg::Int(0), Arg::Int(0)]).unwrap(); // 4..17
        blk.emit(Opcode::Ret, &[]).unwrap(); // 17
    }

    let module = b.link().unwrap();
    assert_eq!(module.data_offset(), 18);
    assert_eq!(module.read_i32(5).unwrap(), 20);
    assert_eq!(module.data(), &[9, 9, 0, 0, 0, 0]);
}

#[test]
fn strings_are_nul_terminated() {
    let mut b = Builder::new();
    let hello = b.write_data_str("hello");
    let world = b.write_data_str("world");
    assert_eq!(world.offset(), hello.offset() + 6);
    assert_eq!(b.data_len(), 12);

    let module = b.link().unwrap();
    assert_eq!(module.read_str(module.data_offset() + world.offset()).unwrap(), b"world");
}

#[test]
fn type_metadata_record() {
    let mut b = Builder::new();
    let list = b.write_type_metadata("List", &["Nil", "Cons"]);
    let module = b.link().unwrap();

    let meta = (module.data_offset() + list.offset()) as i32;
    assert_eq!(
        module.type_metadata(meta).unwrap(),
        TypeMetadata {
            type_name: "List".to_string(),
            constructors: vec!["Nil".to_string(), "Cons".to_string()],
        }
    );
    assert_eq!(&module.data()[..4], &[2, 0, 0, 0]);
}

// ── 4. Emission checks ──────────────────────────────────────────

#[test]
fn emit_rejects_wrong_operands_without_writing() {
    let mut b = Builder::new();
    let main = b.create_block();
    let label = b.new_label();
    let mut blk = b.block(main);

    let err = blk.emit(Opcode::PushInt, &[label.into()]).unwrap_err();
    assert!(matches!(err, EncodingError::OperandMismatch { mnemonic: "PUSH_INT", .. }));
    assert_eq!(blk.emit(Opcode::Swap, &[Arg::Int(1)]).unwrap_err().to_string(),
        "SWAP: operands do not match signature []");
    assert_eq!(
        blk.emit(Opcode::PushString, &["a\0b".into()]),
        Err(EncodingError::EmbeddedNul)
    );
    assert_eq!(blk.offset(), 0);
}

// ── 5. Generated print sequences ────────────────────────────────

#[test]
fn hello_world_program() {
    let mut b = Builder::new();
    let main = b.create_block();
    {
        let mut blk = b.block(main);
        blk.emit(Opcode::Enter, &[Arg::Int(0)]).unwrap();
        blk.emit_print_string("hi").unwrap();
        blk.emit_println().unwrap();
        blk.emit(Opcode::PushUnit, &[]).unwrap();
        blk.emit(Opcode::Ret, &[]).unwrap();
    }

    let (result, output) = run(b.link().unwrap());
    assert_eq!(result, Value::Unit);
    assert_eq!(output, "hi\n");
}

#[test]
fn print_literal_of_a_slot() {
    let mut b = Builder::new();
    let main = b.create_block();
    {
        let mut blk = b.block(main);
        blk.emit(Opcode::Enter, &[Arg::Int(1)]).unwrap();
        blk.emit(Opcode::PushString, &["say \"hi\"".into()]).unwrap();
        blk.emit(Opcode::StoreVar, &[Arg::Int(0)]).unwrap();
        blk.emit_print_literal_var(0, 0).unwrap();
        blk.emit_println().unwrap();
        blk.emit(Opcode::PushUnit, &[]).unwrap();
        blk.emit(Opcode::Ret, &[]).unwrap();
    }

    let (_, output) = run(b.link().unwrap());
    assert_eq!(output, "\"say \\\"hi\\\"\"\n");
}

#[test]
fn fatal_error_sequence() {
    let mut b = Builder::new();
    let main = b.create_block();
    {
        let mut blk = b.block(main);
        blk.emit(Opcode::Enter, &[Arg::Int(0)]).unwrap();
        blk.emit_fatal_error("no match", 3).unwrap();
        blk.emit(Opcode::PushUnit, &[]).unwrap();
        blk.emit(Opcode::Ret, &[]).unwrap();
    }

    let mut vm = VM::with_output(b.link().unwrap(), Vec::new());
    let err = vm.run().unwrap_err();
    assert_eq!(err.exit_code(), 3);
    assert_eq!(err.mnemonic, "SWAP_CALL");
}
