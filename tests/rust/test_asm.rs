//! Assembler and disassembler tests -- text form of modules, binary files

use bci::asm::{assemble, disassemble};
use bci::error::{AssemblyError, AssemblyErrorKind, LoadError};
use bci::vm::bytecode::Module;
use bci::vm::opcodes::Operand;
use bci::vm::VM;

// ── Helpers ──────────────────────────────────────────────────────

fn asm_err(source: &str) -> AssemblyError {
    assemble(source).unwrap_err()
}

fn run_output(source: &str) -> String {
    let mut vm = VM::with_output(assemble(source).unwrap(), Vec::new());
    vm.run().unwrap();
    String::from_utf8(vm.into_output()).unwrap()
}

const DISPATCH: &str = "\
# dispatch on a constructor, then call a closure
ENTER 1
PUSH_CLOSURE callee
STORE_VAR 0
PUSH_DATA meta 1 0
JMP_DATA 2 first second
:first
PUSH_INT 1
JMP done
:second
PUSH_STRING two  words
:done
DISCARD
PUSH_VAR 0 0
PUSH_UNIT
SWAP_CALL
RET
:callee
ENTER 0
RET
.data
:meta
0x02 0x00 0x00 0x00
Pair
First
Second
";

// ── 1. Assembling ───────────────────────────────────────────────

#[test]
fn arithmetic_program() {
    let source = "ENTER 0\nPUSH_INT 3\nPUSH_INT 4\nADD\nRET\n";
    let module = assemble(source).unwrap();
    assert_eq!(module.data_offset(), module.len());
    assert_eq!(module.len(), 4 + 5 + 5 + 5 + 1 + 1);
    assert_eq!(run_output(source), "7: Int\n");
}

#[test]
fn comments_and_blank_lines_are_skipped() {
    let source = "# header\n\n   \nENTER 0\n  # indented comment\nPUSH_UNIT\nRET\n";
    let module = assemble(source).unwrap();
    assert_eq!(module.code().len(), 7);
}

#[test]
fn forward_label_is_absolute_position() {
    let module = assemble("JMP end\nPUSH_INT 1\n:end\nPUSH_UNIT\nRET\n").unwrap();
    assert_eq!(module.read_i32(5).unwrap(), 14);
}

#[test]
fn integer_label_operand_is_taken_verbatim() {
    let module = assemble("JMP 4\n").unwrap();
    assert_eq!(module.read_i32(5).unwrap(), 4);
}

#[test]
fn push_string_takes_rest_of_line() {
    let module = assemble("PUSH_STRING hello   world \n").unwrap();
    assert_eq!(module.read_str(5).unwrap(), b"hello   world");
}

#[test]
fn text_data_lines_are_trimmed() {
    let module = assemble(".data\n  padded text \t\n").unwrap();
    assert_eq!(module.data(), b"padded text\0");
}

#[test]
fn data_segment_and_labels() {
    let source = "\
ENTER 0
PUSH_DATA list 0 0
RET
.data
:list
0x02 0x00 0x00 0x00
List
Nil
Cons
";
    let module = assemble(source).unwrap();
    assert_eq!(module.data_offset(), 23);
    assert_eq!(module.read_i32(10).unwrap(), 23);
    assert_eq!(&module.data()[4..], b"List\0Nil\0Cons\0");
    assert_eq!(run_output(source), "Nil: List\n");
}

#[test]
fn builtin_names_are_checked() {
    let module = assemble("PUSH_BUILTIN $$builtin-string-length\n").unwrap();
    assert_eq!(module.read_str(5).unwrap(), b"$$builtin-string-length");
}

// ── 2. Assembly errors ──────────────────────────────────────────

#[test]
fn unknown_mnemonic() {
    let err = asm_err("ENTER 0\n\nPUSH_LONG 5\n");
    assert_eq!(err.line, 3);
    assert_eq!(err.text, "PUSH_LONG 5");
    assert_eq!(err.kind, AssemblyErrorKind::UnknownMnemonic("PUSH_LONG".to_string()));
    assert_eq!(err.to_string(), "line 3: unknown instruction PUSH_LONG: PUSH_LONG 5");
}

#[test]
fn unknown_builtin() {
    let err = asm_err("PUSH_BUILTIN $$builtin-frobnicate\n");
    assert_eq!(err.kind, AssemblyErrorKind::UnknownBuiltin("$$builtin-frobnicate".to_string()));
}

#[test]
fn unknown_label_reports_referencing_line() {
    let err = asm_err("ENTER 0\nJMP nowhere\nRET\n");
    assert_eq!(err.line, 2);
    assert_eq!(err.kind, AssemblyErrorKind::UnknownLabel("nowhere".to_string()));
}

#[test]
fn jump_table_count_must_match() {
    let err = asm_err("JMP_DATA 2 a\n:a\n");
    assert_eq!(
        err.kind,
        AssemblyErrorKind::ArityMismatch {
            mnemonic: "JMP_DATA",
            expected: 2,
            found: 1,
        }
    );
}

#[test]
fn wrong_argument_count() {
    let err = asm_err("PUSH_VAR 1\n");
    assert!(matches!(
        err.kind,
        AssemblyErrorKind::ArityMismatch { mnemonic: "PUSH_VAR", expected: 2, found: 1 }
    ));
    let err = asm_err("RET now\n");
    assert!(matches!(err.kind, AssemblyErrorKind::ArityMismatch { expected: 0, found: 1, .. }));
}

#[test]
fn invalid_integer() {
    let err = asm_err("PUSH_INT three\n");
    assert_eq!(err.kind, AssemblyErrorKind::InvalidInteger("three".to_string()));
}

#[test]
fn invalid_hex_byte() {
    let err = asm_err(".data\n0x01 0x1G\n");
    assert_eq!(err.line, 2);
    assert_eq!(err.kind, AssemblyErrorKind::InvalidHexByte("0x1G".to_string()));
}

#[test]
fn duplicate_label() {
    let err = asm_err(":top\nPUSH_UNIT\n:top\nRET\n");
    assert_eq!(err.line, 3);
    assert_eq!(err.kind, AssemblyErrorKind::DuplicateLabel("top".to_string()));
}

// ── 3. Disassembling ────────────────────────────────────────────

#[test]
fn listing_text() {
    let module = assemble("ENTER 0\nPUSH_STRING hi\nRET\n.data\nab\n0x01 0x02\n").unwrap();
    let listing = disassemble(&module).unwrap();
    assert_eq!(
        listing.to_string(),
        "\
Data segment offset: 14 bytes
4: ENTER 0
9: PUSH_STRING hi
13: RET
Data segment:
14: ab
16: 0x0 0x1 0x2
"
    );
}

#[test]
fn listing_decodes_jump_table() {
    let module = assemble(DISPATCH).unwrap();
    let listing = disassemble(&module).unwrap();
    let table = listing
        .lines()
        .iter()
        .find(|l| l.instruction.opcode.mnemonic() == "JMP_DATA")
        .unwrap();
    assert_eq!(table.offset, 32);
    assert_eq!(table.instruction.operands, vec![Operand::Table(vec![45, 55])]);
}

#[test]
fn reassembly_is_byte_exact() {
    let module = assemble(DISPATCH).unwrap();
    let source = disassemble(&module).unwrap().to_assembly();
    assert!(source.contains(":L45\nPUSH_INT 1\n"));
    assert!(source.contains("PUSH_STRING two  words\n"));

    let again = assemble(&source).unwrap();
    assert_eq!(again.as_bytes(), module.as_bytes());
    assert_eq!(
        disassemble(&again).unwrap().to_string(),
        disassemble(&module).unwrap().to_string()
    );
}

#[test]
fn reassembly_without_data() {
    let module = assemble("ENTER 0\nPUSH_INT 3\nRET\n").unwrap();
    let again = assemble(&disassemble(&module).unwrap().to_assembly()).unwrap();
    assert_eq!(again, module);
}

#[test]
fn json_listing() {
    let module = assemble("ENTER 0\nPUSH_UNIT\nRET\n.data\nok\n").unwrap();
    let listing = disassemble(&module).unwrap();
    let json: serde_json::Value = serde_json::from_str(&listing.to_json().unwrap()).unwrap();

    assert_eq!(json["data_offset"], 11);
    assert_eq!(json["sha256"], module.digest());
    assert_eq!(json["code"][0]["mnemonic"], "ENTER");
    assert_eq!(json["code"][0]["operands"][0], 0);
    assert_eq!(json["code"][2]["offset"], 10);
    assert_eq!(json["data"][0]["kind"], "text");
    assert_eq!(json["data"][0]["text"], "ok");
}

#[test]
fn digest_is_sha256_hex() {
    let module = Module::from_bytes(vec![4, 0, 0, 0]).unwrap();
    let digest = module.digest();
    assert_eq!(digest.len(), 64);
    assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}

// ── 4. Binary modules ───────────────────────────────────────────

#[test]
fn module_too_short() {
    assert!(matches!(Module::from_bytes(vec![1, 2]), Err(LoadError::TooShort(2))));
}

#[test]
fn header_outside_module() {
    assert!(matches!(
        Module::from_bytes(vec![9, 0, 0, 0, 1]),
        Err(LoadError::BadHeader { offset: 9, len: 5 })
    ));
    assert!(matches!(
        Module::from_bytes(vec![2, 0, 0, 0]),
        Err(LoadError::BadHeader { offset: 2, .. })
    ));
}

#[test]
fn save_and_load() {
    let module = assemble(DISPATCH).unwrap();
    let path = std::env::temp_dir().join(format!("bci-test-{}.bin", std::process::id()));
    module.save(&path).unwrap();
    let loaded = Module::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(loaded, module);
}

#[test]
fn load_missing_file() {
    let err = Module::load(std::path::Path::new("/nonexistent/prog.bin")).unwrap_err();
    assert!(matches!(err, LoadError::Io { .. }));
}
