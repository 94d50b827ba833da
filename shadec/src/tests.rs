//! End-to-end tests: hand-assembled source bytecode through both compiler
//! stages, with structural checks over the emitted modules.
use std::collections::{HashMap, HashSet};

use pretty_assertions::assert_eq;
use spirv::{Capability, Decoration, ExecutionModel, Op, StorageClass};

use shadec_core::sir::{self, Instr, Slot};
use shadec_core::spv::SpirvBinary;

use crate::frontend::bytecode::{ArgAnnotation, FnBytecode, PoolConst, SrcOp};
use crate::{compile, frontend, CompileOptions, ShaderError, ShaderStage};

// %% A tiny assembler for CPython 3.7 style bytecode fixtures.

#[derive(Default)]
struct Asm {
    code: Vec<u8>,
    consts: Vec<PoolConst>,
    varnames: Vec<String>,
    names: Vec<String>,
    freevars: Vec<String>,
    annotations: Vec<(String, ArgAnnotation)>,
    argcount: usize,
}

impl Asm {
    fn new() -> Self {
        Self::default()
    }

    fn arg(&mut self, name: &str, kind: &str, slot: Slot, type_name: &str) -> &mut Self {
        self.varnames.push(name.to_string());
        self.annotations.push((
            name.to_string(),
            ArgAnnotation {
                kind: kind.to_string(),
                slot,
                type_name: type_name.to_string(),
            },
        ));
        self.argcount += 1;
        self
    }

    fn var_index(&mut self, name: &str) -> u8 {
        if let Some(i) = self.varnames.iter().position(|n| n == name) {
            return i as u8;
        }
        self.varnames.push(name.to_string());
        (self.varnames.len() - 1) as u8
    }

    fn name_index(&mut self, name: &str) -> u8 {
        if let Some(i) = self.names.iter().position(|n| n == name) {
            return i as u8;
        }
        self.names.push(name.to_string());
        (self.names.len() - 1) as u8
    }

    fn const_index(&mut self, c: PoolConst) -> u8 {
        if let Some(i) = self.consts.iter().position(|x| *x == c) {
            return i as u8;
        }
        self.consts.push(c);
        (self.consts.len() - 1) as u8
    }

    fn op(&mut self, op: SrcOp, arg: u8) -> &mut Self {
        self.code.push(op as u8);
        self.code.push(arg);
        self
    }

    fn load_fast(&mut self, name: &str) -> &mut Self {
        let i = self.var_index(name);
        self.op(SrcOp::LoadFast, i)
    }
    fn store_fast(&mut self, name: &str) -> &mut Self {
        let i = self.var_index(name);
        self.op(SrcOp::StoreFast, i)
    }
    fn load_global(&mut self, name: &str) -> &mut Self {
        let i = self.name_index(name);
        self.op(SrcOp::LoadGlobal, i)
    }
    fn load_method(&mut self, name: &str) -> &mut Self {
        let i = self.name_index(name);
        self.op(SrcOp::LoadMethod, i)
    }
    fn load_attr(&mut self, name: &str) -> &mut Self {
        let i = self.name_index(name);
        self.op(SrcOp::LoadAttr, i)
    }
    fn load_const_f(&mut self, x: f64) -> &mut Self {
        let i = self.const_index(PoolConst::Float(x));
        self.op(SrcOp::LoadConst, i)
    }
    fn load_const_i(&mut self, x: i64) -> &mut Self {
        let i = self.const_index(PoolConst::Int(x));
        self.op(SrcOp::LoadConst, i)
    }
    fn compare(&mut self, cmp: &str) -> &mut Self {
        let i = ["<", "<=", "==", "!=", ">", ">="]
            .iter()
            .position(|c| *c == cmp)
            .expect("relational compare") as u8;
        self.op(SrcOp::CompareOp, i)
    }
    fn ret_none(&mut self) -> &mut Self {
        let i = self.const_index(PoolConst::None);
        self.op(SrcOp::LoadConst, i);
        self.op(SrcOp::ReturnValue, 0)
    }

    fn here(&self) -> usize {
        self.code.len()
    }
    /// Emit a jump with a zeroed argument, returning the position of the
    /// argument byte for later patching.
    fn jump(&mut self, op: SrcOp) -> usize {
        self.op(op, 0);
        self.code.len() - 1
    }
    /// Patch an absolute jump to target the current position.
    fn patch_abs(&mut self, arg_pos: usize) {
        self.code[arg_pos] = self.here() as u8;
    }
    /// Patch a relative jump (delta counts from after the instruction).
    fn patch_fwd(&mut self, arg_pos: usize) {
        self.code[arg_pos] = (self.here() - (arg_pos + 1)) as u8;
    }

    fn build(&mut self) -> FnBytecode {
        FnBytecode {
            code: self.code.clone(),
            consts: self.consts.clone(),
            varnames: self.varnames.clone(),
            names: self.names.clone(),
            freevars: self.freevars.clone(),
            argcount: self.argcount,
            annotations: self.annotations.clone(),
        }
    }
}

// %% Structural checks over emitted modules.

fn result_id_of(op: Op, operands: &[u32]) -> Option<u32> {
    use Op::*;
    match op {
        TypeVoid | TypeBool | TypeInt | TypeFloat | TypeVector | TypeMatrix | TypeArray
        | TypeRuntimeArray | TypeStruct | TypePointer | TypeFunction | TypeImage | TypeSampler
        | TypeSampledImage | ExtInstImport | Label => operands.first().copied(),
        Constant | ConstantTrue | ConstantFalse | ConstantComposite | Variable | Load
        | AccessChain | InBoundsAccessChain | CompositeConstruct | CompositeExtract
        | VectorShuffle | ExtInst | Phi | Select | SampledImage | ImageRead
        | ImageSampleImplicitLod | Function | FAdd | FSub | FMul | FDiv | FMod | IAdd | ISub
        | IMul | SDiv | UDiv | SMod | UMod | FNegate | SNegate | LogicalAnd | LogicalOr
        | LogicalNot | LogicalEqual | LogicalNotEqual | IEqual | INotEqual | SLessThan
        | SLessThanEqual | SGreaterThan | SGreaterThanEqual | ULessThan | ULessThanEqual
        | UGreaterThan | UGreaterThanEqual | FOrdEqual | FOrdNotEqual | FOrdLessThan
        | FOrdLessThanEqual | FOrdGreaterThan | FOrdGreaterThanEqual | FConvert | ConvertSToF
        | ConvertUToF | ConvertFToS | ConvertFToU | SConvert | UConvert | Bitcast => {
            operands.get(1).copied()
        }
        _ => None,
    }
}

/// The §"testable properties" checks: header sanity, single assignment,
/// id bound, type/constant dedup, and merge instructions sitting directly
/// on their branches.
fn validate_module(bin: &SpirvBinary) {
    let header = bin.header().expect("header");
    assert_eq!(header.magic, 0x0723_0203);
    assert_eq!(header.version, 0x0001_0300);

    let mut defined: HashSet<u32> = HashSet::new();
    let mut max_id = 0;
    let mut dedup_keys: HashSet<(u32, Vec<u32>)> = HashSet::new();
    let mut prev_op: Option<Op> = None;
    for instr in bin.instrs().expect("instruction stream") {
        let instr = instr.expect("well-formed instruction");
        let op = instr.op().unwrap_or_else(|| panic!("unknown opcode {}", instr.opcode()));
        let operands = instr.operands().as_slice().to_vec();
        if let Some(id) = result_id_of(op, &operands) {
            assert!(defined.insert(id), "id {} defined twice ({:?})", id, op);
            max_id = max_id.max(id);
        }
        // Structs are nominal; everything else in the types/constants
        // section must be unique.
        let dedup_key = match op {
            Op::TypeVoid | Op::TypeBool | Op::TypeInt | Op::TypeFloat | Op::TypeVector
            | Op::TypeMatrix | Op::TypeArray | Op::TypeRuntimeArray | Op::TypePointer
            | Op::TypeFunction | Op::TypeImage | Op::TypeSampler | Op::TypeSampledImage => {
                Some((op as u32, operands[1..].to_vec()))
            }
            Op::Constant | Op::ConstantTrue | Op::ConstantFalse | Op::ConstantComposite => {
                let mut key = vec![operands[0]];
                key.extend_from_slice(&operands[2..]);
                Some((op as u32, key))
            }
            _ => None,
        };
        if let Some(key) = dedup_key {
            assert!(dedup_keys.insert(key), "duplicate type/constant: {:?}", op);
        }
        match prev_op {
            Some(Op::SelectionMerge) => {
                assert_eq!(op, Op::BranchConditional, "OpSelectionMerge must sit on its branch");
            }
            Some(Op::LoopMerge) => {
                assert_eq!(op, Op::Branch, "OpLoopMerge must sit on its branch");
            }
            _ => {}
        }
        prev_op = Some(op);
    }
    assert_eq!(header.bound, max_id + 1, "bound must be max id + 1");
}

fn ops_of(bin: &SpirvBinary) -> Vec<(Op, Vec<u32>)> {
    bin.instrs()
        .expect("instruction stream")
        .map(|i| {
            let i = i.expect("well-formed instruction");
            (i.op().expect("known op"), i.operands().as_slice().to_vec())
        })
        .collect()
}

fn count_op(bin: &SpirvBinary, op: Op) -> usize {
    ops_of(bin).iter().filter(|(o, _)| *o == op).count()
}

fn constants_by_id(bin: &SpirvBinary) -> HashMap<u32, Vec<u32>> {
    ops_of(bin)
        .iter()
        .filter(|(o, _)| *o == Op::Constant)
        .map(|(_, operands)| (operands[1], operands[2..].to_vec()))
        .collect()
}

/// Every label defined exactly once, every branch target defined.
fn check_sir_labels(prog: &[Instr]) {
    let mut defined = HashSet::new();
    for instr in prog {
        if let Instr::Label(l) = instr {
            assert!(defined.insert(*l), "label {} defined twice", l);
        }
    }
    let mut check = |l: &i32| {
        assert!(defined.contains(l), "branch to undefined label {}", l);
    };
    for instr in prog {
        match instr {
            Instr::Branch(l) => check(l),
            Instr::BranchConditional {
                true_label,
                false_label,
            } => {
                check(true_label);
                check(false_label);
            }
            Instr::BranchLoop {
                iter_label,
                continue_label,
                merge_label,
            } => {
                check(iter_label);
                check(continue_label);
                check(merge_label);
            }
            _ => {}
        }
    }
}

fn compile_ok(func: &FnBytecode, stage: ShaderStage) -> SpirvBinary {
    let _ = env_logger::builder().is_test(true).try_init();
    let options = CompileOptions::default();
    let program = frontend::lower(func, stage, &options).expect("front-end");
    check_sir_labels(&program);
    // The text form round-trips every program the front-end emits.
    assert_eq!(sir::parse(&sir::serialize(&program)).expect("parse"), program);
    let bin = compile(func, stage, &options).expect("compile");
    validate_module(&bin);
    bin
}

// %% Shared fixtures

/// `data2[index] = f32(data1[index])`, the classic per-element copy.
fn cast_shader(src_ty: &str, dst_ty: &str, cast_to: &str) -> FnBytecode {
    let mut a = Asm::new();
    a.arg(
        "index",
        "input",
        Slot::Builtin("GlobalInvocationId".to_string()),
        "i32",
    );
    a.arg("data1", "buffer", Slot::Index(0), src_ty);
    a.arg("data2", "buffer", Slot::Index(1), dst_ty);
    a.load_global(cast_to);
    a.load_fast("data1");
    a.load_fast("index");
    a.op(SrcOp::BinarySubscr, 0);
    a.op(SrcOp::CallFunction, 1);
    a.load_fast("data2");
    a.load_fast("index");
    a.op(SrcOp::StoreSubscr, 0);
    a.ret_none();
    a.build()
}

// %% Scenario 1: trivial vertex shader

#[test]
fn trivial_vertex_shader() {
    let mut a = Asm::new();
    a.arg("index", "input", Slot::Builtin("VertexId".to_string()), "i32");
    a.arg(
        "out_pos",
        "output",
        Slot::Builtin("Position".to_string()),
        "vec4",
    );
    a.arg("out_color", "output", Slot::Index(0), "vec3");
    // positions = [vec2(0.0, -0.5), vec2(0.5, 0.5), vec2(-0.5, 0.7)]
    for (x, y) in &[(0.0, -0.5), (0.5, 0.5), (-0.5, 0.7)] {
        a.load_global("vec2");
        a.load_const_f(*x);
        a.load_const_f(*y);
        a.op(SrcOp::CallFunction, 2);
    }
    a.op(SrcOp::BuildList, 3);
    a.store_fast("positions");
    // p = positions[index]
    a.load_fast("positions");
    a.load_fast("index");
    a.op(SrcOp::BinarySubscr, 0);
    a.store_fast("p");
    // out_pos = vec4(p, 0.0, 1.0)
    a.load_global("vec4");
    a.load_fast("p");
    a.load_const_f(0.0);
    a.load_const_f(1.0);
    a.op(SrcOp::CallFunction, 3);
    a.store_fast("out_pos");
    // out_color = vec3(p, 0.5)
    a.load_global("vec3");
    a.load_fast("p");
    a.load_const_f(0.5);
    a.op(SrcOp::CallFunction, 2);
    a.store_fast("out_color");
    a.ret_none();

    let bin = compile_ok(&a.build(), ShaderStage::Vertex);
    let ops = ops_of(&bin);

    let entry = ops
        .iter()
        .find(|(o, _)| *o == Op::EntryPoint)
        .expect("entry point");
    assert_eq!(entry.1[0], ExecutionModel::Vertex as u32);

    // vec2 of f32
    assert!(ops.iter().any(|(o, operands)| {
        *o == Op::TypeVector && operands.len() == 3 && operands[2] == 2
    }));
    // The three corner positions fold into constant composites.
    assert_eq!(count_op(&bin, Op::ConstantComposite), 3);
    // Array of three vec2s, with a constant length of 3.
    let consts = constants_by_id(&bin);
    let array_ty = ops
        .iter()
        .find(|(o, _)| *o == Op::TypeArray)
        .expect("array type");
    assert_eq!(consts.get(&array_ty.1[2]), Some(&vec![3]));
    // vec4 construction has exactly four constituents.
    assert!(ops.iter().any(|(o, operands)| {
        *o == Op::CompositeConstruct && operands.len() == 2 + 4
    }));
    // The dynamic subscript goes through an access chain.
    assert!(count_op(&bin, Op::AccessChain) > 0);
    // Interface lists both outputs and the input.
    assert_eq!(entry.1.len() - 2 - entry_name_words("main"), 3);

    // The byte image is little-endian words, magic first.
    let bytes = bin.bytes();
    assert_eq!(&bytes[..4], &[0x03, 0x02, 0x23, 0x07]);
    assert_eq!(bytes.len(), bin.words().len() * 4);
}

/// Word count of a null-terminated, padded literal string operand.
fn entry_name_words(name: &str) -> usize {
    (name.len() + 1 + 3) / 4
}

// %% Scenarios 2 and 3: casts

#[test]
fn int_to_float_cast_uses_signed_conversion() {
    let bin = compile_ok(
        &cast_shader("Array(i32)", "Array(f32)", "f32"),
        ShaderStage::Compute,
    );
    assert_eq!(count_op(&bin, Op::ConvertSToF), 1);
    assert_eq!(count_op(&bin, Op::TypeRuntimeArray), 2);
    // Buffers land in BufferBlock-decorated structs with std430 strides.
    let ops = ops_of(&bin);
    assert!(ops.iter().any(|(o, operands)| {
        *o == Op::Decorate && operands.get(1) == Some(&(Decoration::BufferBlock as u32))
    }));
    assert!(ops.iter().any(|(o, operands)| {
        *o == Op::Decorate
            && operands.get(1) == Some(&(Decoration::ArrayStride as u32))
            && operands.get(2) == Some(&4)
    }));
    // Compute shaders default to LocalSize 1 1 1.
    assert!(ops.iter().any(|(o, operands)| {
        *o == Op::ExecutionMode && operands[1..] == [spirv::ExecutionMode::LocalSize as u32, 1, 1, 1]
    }));
}

#[test]
fn float_to_int_cast_truncates() {
    let bin = compile_ok(
        &cast_shader("Array(f32)", "Array(i32)", "i32"),
        ShaderStage::Compute,
    );
    assert_eq!(count_op(&bin, Op::ConvertFToS), 1);
}

#[test]
fn unsigned_cast_uses_unsigned_conversion() {
    let bin = compile_ok(
        &cast_shader("Array(u32)", "Array(f32)", "f32"),
        ShaderStage::Compute,
    );
    assert_eq!(count_op(&bin, Op::ConvertUToF), 1);
}

#[test]
fn widening_casts_extend_by_source_signedness() {
    // u8 -> i32 must zero-extend (u8(200) stays 200, it does not become
    // -56), so the unsigned source picks UConvert regardless of the
    // signed destination.
    let bin = compile_ok(
        &cast_shader("Array(u8)", "Array(i32)", "i32"),
        ShaderStage::Compute,
    );
    assert_eq!(count_op(&bin, Op::UConvert), 1);
    assert_eq!(count_op(&bin, Op::SConvert), 0);
    // A signed source sign-extends.
    let bin = compile_ok(
        &cast_shader("Array(i16)", "Array(i64)", "i64"),
        ShaderStage::Compute,
    );
    assert_eq!(count_op(&bin, Op::SConvert), 1);
    assert_eq!(count_op(&bin, Op::UConvert), 0);
}

#[test]
fn constant_casts_fold() {
    // data2[index] = i32(2.9); no conversion survives to the module.
    let mut a = Asm::new();
    a.arg(
        "index",
        "input",
        Slot::Builtin("GlobalInvocationId".to_string()),
        "i32",
    );
    a.arg("data2", "buffer", Slot::Index(0), "Array(i32)");
    a.load_global("i32");
    a.load_const_f(2.9);
    a.op(SrcOp::CallFunction, 1);
    a.load_fast("data2");
    a.load_fast("index");
    a.op(SrcOp::StoreSubscr, 0);
    a.ret_none();
    let bin = compile_ok(&a.build(), ShaderStage::Compute);
    assert_eq!(count_op(&bin, Op::ConvertFToS), 0);
    // An i32 constant 2 exists.
    let ops = ops_of(&bin);
    let int_ty = ops
        .iter()
        .find(|(o, operands)| *o == Op::TypeInt && operands[1..] == [32, 1])
        .expect("i32 type")
        .1[0];
    assert!(ops.iter().any(|(o, operands)| {
        *o == Op::Constant && operands[0] == int_ty && operands[2] == 2
    }));
}

// %% Scenario 4: ternary to select

fn ternary_shader() -> FnBytecode {
    let mut a = Asm::new();
    a.arg(
        "index",
        "input",
        Slot::Builtin("GlobalInvocationId".to_string()),
        "i32",
    );
    a.arg("data2", "buffer", Slot::Index(1), "Array(f32)");
    a.load_fast("index");
    a.load_const_i(0);
    a.compare("==");
    let jf = a.jump(SrcOp::PopJumpIfFalse);
    a.load_const_f(40.0);
    let fwd = a.jump(SrcOp::JumpForward);
    a.patch_abs(jf);
    a.load_const_f(41.0);
    a.patch_fwd(fwd);
    a.load_fast("data2");
    a.load_fast("index");
    a.op(SrcOp::StoreSubscr, 0);
    a.ret_none();
    a.build()
}

#[test]
fn ternary_compiles_branch_free() {
    let func = ternary_shader();
    let program = frontend::lower(&func, ShaderStage::Compute, &CompileOptions::default())
        .expect("front-end");
    assert!(program.iter().any(|i| *i == Instr::Select));
    assert!(!program
        .iter()
        .any(|i| matches!(i, Instr::BranchConditional { .. })));

    let bin = compile_ok(&func, ShaderStage::Compute);
    assert_eq!(count_op(&bin, Op::Select), 1);
    assert_eq!(count_op(&bin, Op::BranchConditional), 0);
}

#[test]
fn ternary_keeps_branches_when_disabled() {
    let func = ternary_shader();
    let options = CompileOptions {
        convert_ternary_to_select: false,
    };
    let program = frontend::lower(&func, ShaderStage::Compute, &options).expect("front-end");
    assert!(!program.iter().any(|i| *i == Instr::Select));
    let bin = crate::compile(&func, ShaderStage::Compute, &options).expect("compile");
    validate_module(&bin);
    // The merged value arrives through a phi at the join.
    assert_eq!(count_op(&bin, Op::BranchConditional), 1);
    assert_eq!(count_op(&bin, Op::Phi), 1);
    assert_eq!(count_op(&bin, Op::SelectionMerge), 1);
}

// %% Scenario 5: short-circuit or

#[test]
fn short_circuit_or_flattens() {
    // if index < 2 or index > 7 or index == 4: data2[index] = 40.0
    // elif index > 3 and index < 6:            data2[index] = 41.0
    // else:                                    data2[index] = 43.0
    let mut a = Asm::new();
    a.arg(
        "index",
        "input",
        Slot::Builtin("GlobalInvocationId".to_string()),
        "i32",
    );
    a.arg("data2", "buffer", Slot::Index(1), "Array(f32)");

    a.load_fast("index");
    a.load_const_i(2);
    a.compare("<");
    let t1 = a.jump(SrcOp::PopJumpIfTrue);
    a.load_fast("index");
    a.load_const_i(7);
    a.compare(">");
    let t2 = a.jump(SrcOp::PopJumpIfTrue);
    a.load_fast("index");
    a.load_const_i(4);
    a.compare("==");
    let f1 = a.jump(SrcOp::PopJumpIfFalse);
    // then-body, also the target of the two or-jumps
    a.patch_abs(t1);
    a.patch_abs(t2);
    a.load_const_f(40.0);
    a.load_fast("data2");
    a.load_fast("index");
    a.op(SrcOp::StoreSubscr, 0);
    let end1 = a.jump(SrcOp::JumpForward);
    // elif index > 3 and index < 6
    a.patch_abs(f1);
    a.load_fast("index");
    a.load_const_i(3);
    a.compare(">");
    let f2 = a.jump(SrcOp::PopJumpIfFalse);
    a.load_fast("index");
    a.load_const_i(6);
    a.compare("<");
    let f3 = a.jump(SrcOp::PopJumpIfFalse);
    a.load_const_f(41.0);
    a.load_fast("data2");
    a.load_fast("index");
    a.op(SrcOp::StoreSubscr, 0);
    let end2 = a.jump(SrcOp::JumpForward);
    // else
    a.patch_abs(f2);
    a.patch_abs(f3);
    a.load_const_f(43.0);
    a.load_fast("data2");
    a.load_fast("index");
    a.op(SrcOp::StoreSubscr, 0);
    a.patch_fwd(end1);
    a.patch_fwd(end2);
    a.ret_none();
    let func = a.build();

    let program = frontend::lower(&func, ShaderStage::Compute, &CompileOptions::default())
        .expect("front-end");
    check_sir_labels(&program);
    // Two or-combines fold the three-way condition into one branch, and
    // the f/f orientation folds the elif's `and` chain as well: five
    // conditional branches become two.
    let or_count = program
        .iter()
        .filter(|i| **i == Instr::BinaryOp(sir::BinOp::Or))
        .count();
    assert_eq!(or_count, 2);
    let and_count = program
        .iter()
        .filter(|i| **i == Instr::BinaryOp(sir::BinOp::And))
        .count();
    assert_eq!(and_count, 1);
    let cond_count = program
        .iter()
        .filter(|i| matches!(i, Instr::BranchConditional { .. }))
        .count();
    assert_eq!(cond_count, 2);

    // The or-flattening pass is idempotent on its own output.
    let mut again = program.clone();
    frontend::passes::flatten_or_patterns(&mut again);
    assert_eq!(again, program);

    let bin = compile_ok(&func, ShaderStage::Compute);
    assert_eq!(count_op(&bin, Op::LogicalOr), 2);
    assert_eq!(count_op(&bin, Op::LogicalAnd), 1);
    assert_eq!(count_op(&bin, Op::LogicalNot), 1);
    assert_eq!(count_op(&bin, Op::BranchConditional), 2);
}

// %% Scenario 6: loops

#[test]
fn for_loop_with_break() {
    // val = 0.0
    // for k in range(index):
    //     if k == 7: break
    //     val = val + 1.0
    // data2[index] = val
    let mut a = Asm::new();
    a.arg(
        "index",
        "input",
        Slot::Builtin("GlobalInvocationId".to_string()),
        "i32",
    );
    a.arg("data2", "buffer", Slot::Index(1), "Array(f32)");

    a.load_const_f(0.0);
    a.store_fast("val");
    let setup = a.jump(SrcOp::SetupLoop);
    a.load_global("range");
    a.load_fast("index");
    a.op(SrcOp::CallFunction, 1);
    a.op(SrcOp::GetIter, 0);
    let for_iter_at = a.here();
    let fi = a.jump(SrcOp::ForIter);
    a.store_fast("k");
    // if k == 7: break
    a.load_fast("k");
    a.load_const_i(7);
    a.compare("==");
    let skip = a.jump(SrcOp::PopJumpIfFalse);
    a.op(SrcOp::BreakLoop, 0);
    a.patch_abs(skip);
    // val = val + 1.0
    a.load_fast("val");
    a.load_const_f(1.0);
    a.op(SrcOp::BinaryAdd, 0);
    a.store_fast("val");
    a.op(SrcOp::JumpAbsolute, for_iter_at as u8);
    a.patch_fwd(fi);
    a.op(SrcOp::PopBlock, 0);
    a.patch_fwd(setup);
    // data2[index] = val
    a.load_fast("val");
    a.load_fast("data2");
    a.load_fast("index");
    a.op(SrcOp::StoreSubscr, 0);
    a.ret_none();

    let bin = compile_ok(&a.build(), ShaderStage::Compute);
    assert_eq!(count_op(&bin, Op::LoopMerge), 1);
    // The iteration state lives in variables; no phis needed.
    assert_eq!(count_op(&bin, Op::Phi), 0);
    // One selection header (the break test); the loop exit conditional
    // carries none.
    assert_eq!(count_op(&bin, Op::SelectionMerge), 1);
    assert_eq!(count_op(&bin, Op::BranchConditional), 2);
    // Comparison against the range stop bound is signed.
    assert!(count_op(&bin, Op::SLessThan) >= 1);
}

#[test]
fn while_loop_with_condition() {
    // val = 0.0
    // while val < 4.0:
    //     val = val + 1.0
    // data2[index] = val
    let mut a = Asm::new();
    a.arg(
        "index",
        "input",
        Slot::Builtin("GlobalInvocationId".to_string()),
        "i32",
    );
    a.arg("data2", "buffer", Slot::Index(1), "Array(f32)");

    a.load_const_f(0.0);
    a.store_fast("val");
    let setup = a.jump(SrcOp::SetupLoop);
    let test_at = a.here();
    a.load_fast("val");
    a.load_const_f(4.0);
    a.compare("<");
    let exit = a.jump(SrcOp::PopJumpIfFalse);
    a.load_fast("val");
    a.load_const_f(1.0);
    a.op(SrcOp::BinaryAdd, 0);
    a.store_fast("val");
    a.op(SrcOp::JumpAbsolute, test_at as u8);
    a.patch_abs(exit); // the test exits to POP_BLOCK
    a.op(SrcOp::PopBlock, 0);
    a.patch_fwd(setup);
    a.load_fast("val");
    a.load_fast("data2");
    a.load_fast("index");
    a.op(SrcOp::StoreSubscr, 0);
    a.ret_none();

    let bin = compile_ok(&a.build(), ShaderStage::Compute);
    assert_eq!(count_op(&bin, Op::LoopMerge), 1);
    assert_eq!(count_op(&bin, Op::FOrdLessThan), 1);
    // No placeholder `true` constant survives the while-test rewrite.
    assert_eq!(count_op(&bin, Op::ConstantTrue), 0);
}

#[test]
fn while_true_loop_with_break() {
    // val = 0.0
    // while True:
    //     val = val + 1.0
    //     if val > 3.0: break
    // data2[index] = val
    let mut a = Asm::new();
    a.arg(
        "index",
        "input",
        Slot::Builtin("GlobalInvocationId".to_string()),
        "i32",
    );
    a.arg("data2", "buffer", Slot::Index(1), "Array(f32)");

    a.load_const_f(0.0);
    a.store_fast("val");
    let setup = a.jump(SrcOp::SetupLoop);
    let top = a.here();
    a.load_fast("val");
    a.load_const_f(1.0);
    a.op(SrcOp::BinaryAdd, 0);
    a.store_fast("val");
    a.load_fast("val");
    a.load_const_f(3.0);
    a.compare(">");
    let skip = a.jump(SrcOp::PopJumpIfFalse);
    a.op(SrcOp::BreakLoop, 0);
    a.patch_abs(skip);
    a.op(SrcOp::JumpAbsolute, top as u8);
    a.op(SrcOp::PopBlock, 0);
    a.patch_fwd(setup);
    a.load_fast("val");
    a.load_fast("data2");
    a.load_fast("index");
    a.op(SrcOp::StoreSubscr, 0);
    a.ret_none();

    let bin = compile_ok(&a.build(), ShaderStage::Compute);
    assert_eq!(count_op(&bin, Op::LoopMerge), 1);
    // The synthetic `while True` condition stays.
    assert_eq!(count_op(&bin, Op::ConstantTrue), 1);
}

// %% Stdlib and textures

#[test]
fn stdlib_calls_lower_to_extended_instructions() {
    // data2[index] = stdlib.sqrt(data1[index])
    let mut a = Asm::new();
    a.arg(
        "index",
        "input",
        Slot::Builtin("GlobalInvocationId".to_string()),
        "i32",
    );
    a.arg("data1", "buffer", Slot::Index(0), "Array(f32)");
    a.arg("data2", "buffer", Slot::Index(1), "Array(f32)");
    a.load_global("stdlib");
    a.load_method("sqrt");
    a.load_fast("data1");
    a.load_fast("index");
    a.op(SrcOp::BinarySubscr, 0);
    a.op(SrcOp::CallMethod, 1);
    a.load_fast("data2");
    a.load_fast("index");
    a.op(SrcOp::StoreSubscr, 0);
    a.ret_none();

    let bin = compile_ok(&a.build(), ShaderStage::Compute);
    let ops = ops_of(&bin);
    let import = ops
        .iter()
        .find(|(o, _)| *o == Op::ExtInstImport)
        .expect("GLSL.std.450 import");
    let ext = ops
        .iter()
        .find(|(o, _)| *o == Op::ExtInst)
        .expect("extended instruction");
    assert_eq!(ext.1[2], import.1[0]);
    assert_eq!(ext.1[3], crate::stdlib::GLSL_SQRT);
}

#[test]
fn power_of_two_squares_without_pow() {
    // data2[index] = data1[index] ** 2
    let mut a = Asm::new();
    a.arg(
        "index",
        "input",
        Slot::Builtin("GlobalInvocationId".to_string()),
        "i32",
    );
    a.arg("data1", "buffer", Slot::Index(0), "Array(f32)");
    a.arg("data2", "buffer", Slot::Index(1), "Array(f32)");
    a.load_fast("data1");
    a.load_fast("index");
    a.op(SrcOp::BinarySubscr, 0);
    a.load_const_i(2);
    a.op(SrcOp::BinaryPower, 0);
    a.load_fast("data2");
    a.load_fast("index");
    a.op(SrcOp::StoreSubscr, 0);
    a.ret_none();

    let bin = compile_ok(&a.build(), ShaderStage::Compute);
    assert_eq!(count_op(&bin, Op::ExtInst), 0);
    assert_eq!(count_op(&bin, Op::FMul), 1);
}

#[test]
fn texture_read_write_round_trip() {
    // tex2.write(index, tex1.read(index))
    let mut a = Asm::new();
    a.arg(
        "index",
        "input",
        Slot::Builtin("GlobalInvocationId".to_string()),
        "ivec2",
    );
    a.arg("tex1", "texture", Slot::Pair(0, 0), "tex2d r32f");
    a.arg("tex2", "texture", Slot::Pair(0, 1), "tex2d rgba16f");
    a.load_fast("tex2");
    a.load_method("write");
    a.load_fast("index");
    a.load_fast("tex1");
    a.load_method("read");
    a.load_fast("index");
    a.op(SrcOp::CallMethod, 1);
    a.op(SrcOp::CallMethod, 2);
    a.op(SrcOp::PopTop, 0);
    a.ret_none();

    let bin = compile_ok(&a.build(), ShaderStage::Compute);
    assert_eq!(count_op(&bin, Op::ImageRead), 1);
    assert_eq!(count_op(&bin, Op::ImageWrite), 1);
    assert_eq!(count_op(&bin, Op::TypeImage), 2);
    let ops = ops_of(&bin);
    // Texture variables live in UniformConstant storage.
    assert!(ops.iter().any(|(o, operands)| {
        *o == Op::Variable && operands[2] == StorageClass::UniformConstant as u32
    }));
}

// %% Uniforms, matrices, fragment shaders

#[test]
fn uniform_struct_field_access() {
    // out_pos = vec4(pos * u.scale, 0.0, 1.0)
    let mut a = Asm::new();
    a.arg("pos", "input", Slot::Index(0), "vec2");
    a.arg("u", "uniform", Slot::Pair(0, 0), "Struct(scale=f32,offset=vec2)");
    a.arg(
        "out_pos",
        "output",
        Slot::Builtin("Position".to_string()),
        "vec4",
    );
    a.load_global("vec4");
    a.load_fast("pos");
    a.load_fast("u");
    a.load_attr("scale");
    a.op(SrcOp::BinaryMultiply, 0);
    a.load_const_f(0.0);
    a.load_const_f(1.0);
    a.op(SrcOp::CallFunction, 3);
    a.store_fast("out_pos");
    a.ret_none();

    let bin = compile_ok(&a.build(), ShaderStage::Vertex);
    let ops = ops_of(&bin);
    assert_eq!(count_op(&bin, Op::VectorTimesScalar), 1);
    assert!(ops.iter().any(|(o, operands)| {
        *o == Op::Decorate && operands.get(1) == Some(&(Decoration::Block as u32))
    }));
    // Member offsets follow std430: scalar at 0, vec2 at 8.
    assert!(ops.iter().any(|(o, operands)| {
        *o == Op::MemberDecorate
            && operands[1] == 1
            && operands[2] == Decoration::Offset as u32
            && operands[3] == 8
    }));
}

#[test]
fn fragment_early_return_discards() {
    // if in_val < 0.5: return
    // out_color = vec4(in_val, in_val, in_val, 1.0)
    let mut a = Asm::new();
    a.arg("in_val", "input", Slot::Index(0), "f32");
    a.arg("out_color", "output", Slot::Index(0), "vec4");
    a.load_fast("in_val");
    a.load_const_f(0.5);
    a.compare("<");
    let skip = a.jump(SrcOp::PopJumpIfFalse);
    let none = a.const_index(PoolConst::None);
    a.op(SrcOp::LoadConst, none);
    a.op(SrcOp::ReturnValue, 0);
    a.patch_abs(skip);
    a.load_global("vec4");
    a.load_fast("in_val");
    a.load_fast("in_val");
    a.load_fast("in_val");
    a.load_const_f(1.0);
    a.op(SrcOp::CallFunction, 4);
    a.store_fast("out_color");
    a.ret_none();

    let bin = compile_ok(&a.build(), ShaderStage::Fragment);
    assert_eq!(count_op(&bin, Op::Kill), 1);
    let ops = ops_of(&bin);
    // Fragment shaders default to OriginLowerLeft.
    assert!(ops.iter().any(|(o, operands)| {
        *o == Op::ExecutionMode
            && operands.get(1) == Some(&(spirv::ExecutionMode::OriginLowerLeft as u32))
    }));
}

#[test]
fn return_inside_a_bare_loop_does_not_discard() {
    // A return whose innermost open construct is a loop, not a
    // selection, must stay an ordinary return.
    //   val = 0.0
    //   while val < 4.0:
    //       return
    //   out_color = vec4(in_val, in_val, in_val, 1.0)
    let mut a = Asm::new();
    a.arg("in_val", "input", Slot::Index(0), "f32");
    a.arg("out_color", "output", Slot::Index(0), "vec4");
    a.load_const_f(0.0);
    a.store_fast("val");
    let setup = a.jump(SrcOp::SetupLoop);
    let test_at = a.here();
    a.load_fast("val");
    a.load_const_f(4.0);
    a.compare("<");
    let exit = a.jump(SrcOp::PopJumpIfFalse);
    let none = a.const_index(PoolConst::None);
    a.op(SrcOp::LoadConst, none);
    a.op(SrcOp::ReturnValue, 0);
    a.op(SrcOp::JumpAbsolute, test_at as u8);
    a.patch_abs(exit); // the test exits to POP_BLOCK
    a.op(SrcOp::PopBlock, 0);
    a.patch_fwd(setup);
    a.load_global("vec4");
    a.load_fast("in_val");
    a.load_fast("in_val");
    a.load_fast("in_val");
    a.load_const_f(1.0);
    a.op(SrcOp::CallFunction, 4);
    a.store_fast("out_color");
    a.ret_none();

    let bin = compile_ok(&a.build(), ShaderStage::Fragment);
    assert_eq!(count_op(&bin, Op::Kill), 0);
    assert_eq!(count_op(&bin, Op::LoopMerge), 1);
    // The in-loop return plus the one closing the function.
    assert_eq!(count_op(&bin, Op::Return), 2);
}

#[test]
fn matrix_vector_products_check_shapes() {
    // out_pos = mat * in_pos
    let mut a = Asm::new();
    a.arg("in_pos", "input", Slot::Index(0), "vec4");
    a.arg("u", "uniform", Slot::Pair(0, 0), "Struct(m=mat4)");
    a.arg(
        "out_pos",
        "output",
        Slot::Builtin("Position".to_string()),
        "vec4",
    );
    a.load_fast("u");
    a.load_attr("m");
    a.load_fast("in_pos");
    a.op(SrcOp::BinaryMultiply, 0);
    a.store_fast("out_pos");
    a.ret_none();

    let bin = compile_ok(&a.build(), ShaderStage::Vertex);
    assert_eq!(count_op(&bin, Op::MatrixTimesVector), 1);
    let ops = ops_of(&bin);
    assert!(ops.iter().any(|(o, operands)| {
        *o == Op::MemberDecorate && operands[2] == Decoration::MatrixStride as u32
    }));
    assert!(ops.iter().any(|(o, _)| *o == Op::Capability));
    // Matrix capability rides along with the matrix type.
    let caps: Vec<u32> = ops
        .iter()
        .filter(|(o, _)| *o == Op::Capability)
        .map(|(_, operands)| operands[0])
        .collect();
    assert!(caps.contains(&(Capability::Matrix as u32)));
}

#[test]
fn swizzles_compile_to_shuffles_and_extracts() {
    // out_color = vec4(v.zyx, v.x)
    let mut a = Asm::new();
    a.arg("v", "input", Slot::Index(0), "vec3");
    a.arg("out_color", "output", Slot::Index(0), "vec4");
    a.load_global("vec4");
    a.load_fast("v");
    a.load_attr("zyx");
    a.load_fast("v");
    a.load_attr("x");
    a.op(SrcOp::CallFunction, 2);
    a.store_fast("out_color");
    a.ret_none();

    let bin = compile_ok(&a.build(), ShaderStage::Fragment);
    assert_eq!(count_op(&bin, Op::VectorShuffle), 1);
    // .x on a variable defers into its access chain instead of shuffling.
    assert!(count_op(&bin, Op::AccessChain) >= 1);
}

// %% Error paths

fn expect_err(func: &FnBytecode, stage: ShaderStage) -> ShaderError {
    match compile(func, stage, &CompileOptions::default()) {
        Err(err) => err,
        Ok(_) => panic!("expected a compile error"),
    }
}

#[test]
fn duplicate_bindings_are_rejected() {
    let mut a = Asm::new();
    a.arg("data1", "buffer", Slot::Index(0), "Array(f32)");
    a.arg("data2", "buffer", Slot::Index(0), "Array(f32)");
    a.ret_none();
    match expect_err(&a.build(), ShaderStage::Compute) {
        ShaderError::DuplicateSlot { namespace, .. } => assert_eq!(namespace, "bindgroup-0"),
        other => panic!("expected DuplicateSlot, got {:?}", other),
    }
}

#[test]
fn stores_to_inputs_and_uniforms_are_rejected() {
    let mut a = Asm::new();
    a.arg("in_val", "input", Slot::Index(0), "f32");
    a.load_const_f(1.0);
    a.store_fast("in_val");
    a.ret_none();
    match expect_err(&a.build(), ShaderStage::Fragment) {
        ShaderError::IllegalStoreTarget(what) => assert!(what.contains("input")),
        other => panic!("expected IllegalStoreTarget, got {:?}", other),
    }
}

#[test]
fn unknown_builtin_names_are_rejected() {
    let mut a = Asm::new();
    a.arg("x", "input", Slot::Builtin("Narnia".to_string()), "f32");
    a.ret_none();
    match expect_err(&a.build(), ShaderStage::Vertex) {
        ShaderError::UnknownBuiltin(name) => assert_eq!(name, "Narnia"),
        other => panic!("expected UnknownBuiltin, got {:?}", other),
    }
}

#[test]
fn abstract_annotations_are_rejected() {
    let mut a = Asm::new();
    a.arg("x", "input", Slot::Index(0), "Vector");
    a.ret_none();
    match expect_err(&a.build(), ShaderStage::Vertex) {
        ShaderError::AbstractType(name) => assert_eq!(name, "Vector"),
        other => panic!("expected AbstractType, got {:?}", other),
    }
}

#[test]
fn unknown_type_names_are_rejected() {
    let mut a = Asm::new();
    a.arg("x", "input", Slot::Index(0), "quaternion");
    a.ret_none();
    match expect_err(&a.build(), ShaderStage::Vertex) {
        ShaderError::UnknownType(name) => assert_eq!(name, "quaternion"),
        other => panic!("expected UnknownType, got {:?}", other),
    }
}

#[test]
fn unannotated_arguments_are_rejected() {
    let mut a = Asm::new();
    a.varnames.push("mystery".to_string());
    a.argcount = 1;
    a.ret_none();
    match expect_err(&a.build(), ShaderStage::Vertex) {
        ShaderError::UnannotatedArgument(name) => assert_eq!(name, "mystery"),
        other => panic!("expected UnannotatedArgument, got {:?}", other),
    }
}

#[test]
fn unknown_resource_kinds_are_rejected() {
    let mut a = Asm::new();
    a.arg("x", "varying", Slot::Index(0), "f32");
    a.ret_none();
    match expect_err(&a.build(), ShaderStage::Vertex) {
        ShaderError::BadResourceAnnotation { name, .. } => assert_eq!(name, "x"),
        other => panic!("expected BadResourceAnnotation, got {:?}", other),
    }
}

#[test]
fn tuples_dicts_and_closures_are_rejected() {
    let mut a = Asm::new();
    a.load_const_f(1.0);
    a.load_const_f(2.0);
    a.op(SrcOp::BuildTuple, 2);
    a.ret_none();
    assert!(matches!(
        expect_err(&a.build(), ShaderStage::Compute),
        ShaderError::TypeMismatch(_)
    ));

    let mut b = Asm::new();
    b.op(SrcOp::BuildMap, 0);
    b.ret_none();
    assert!(matches!(
        expect_err(&b.build(), ShaderStage::Compute),
        ShaderError::TypeMismatch(_)
    ));

    let mut c = Asm::new();
    c.freevars.push("captured".to_string());
    c.op(SrcOp::LoadDeref, 0);
    c.ret_none();
    assert!(matches!(
        expect_err(&c.build(), ShaderStage::Compute),
        ShaderError::TypeMismatch(_)
    ));
}

#[test]
fn string_constants_are_rejected_when_loaded() {
    let mut a = Asm::new();
    let i = a.const_index(PoolConst::Str("a docstring".to_string()));
    a.op(SrcOp::LoadConst, i);
    a.op(SrcOp::PopTop, 0);
    a.ret_none();
    assert!(matches!(
        expect_err(&a.build(), ShaderStage::Compute),
        ShaderError::UnsupportedConstant { .. }
    ));

    // An unreferenced docstring in the pool is fine.
    let mut b = Asm::new();
    b.const_index(PoolConst::Str("a docstring".to_string()));
    b.ret_none();
    assert!(compile(&b.build(), ShaderStage::Compute, &CompileOptions::default()).is_ok());
}

#[test]
fn unsupported_opcodes_are_reported_with_offsets() {
    let mut a = Asm::new();
    a.code.push(255);
    a.code.push(0);
    a.ret_none();
    match expect_err(&a.build(), ShaderStage::Compute) {
        ShaderError::UnsupportedSourceOp { opcode, offset } => {
            assert_eq!(opcode, "#255");
            assert_eq!(offset, 0);
        }
        other => panic!("expected UnsupportedSourceOp, got {:?}", other),
    }
}

#[test]
fn identity_comparisons_are_rejected() {
    let mut a = Asm::new();
    a.load_const_f(1.0);
    a.load_const_f(2.0);
    a.op(SrcOp::CompareOp, 8); // `is`
    a.ret_none();
    assert!(matches!(
        expect_err(&a.build(), ShaderStage::Compute),
        ShaderError::UnsupportedSourceOp { .. }
    ));
}

#[test]
fn range_outside_a_for_loop_is_rejected() {
    let mut a = Asm::new();
    a.load_global("range");
    a.load_const_i(3);
    a.op(SrcOp::CallFunction, 1);
    a.op(SrcOp::PopTop, 0);
    a.ret_none();
    assert!(matches!(
        expect_err(&a.build(), ShaderStage::Compute),
        ShaderError::UnresolvedControlFlow(_)
    ));
}

#[test]
fn implicit_bool_conversion_is_rejected() {
    let mut a = Asm::new();
    a.load_const_f(1.0);
    a.op(SrcOp::JumpIfTrueOrPop, 0);
    a.ret_none();
    assert!(matches!(
        expect_err(&a.build(), ShaderStage::Compute),
        ShaderError::UnresolvedControlFlow(_)
    ));
}

#[test]
fn mixed_element_arithmetic_is_rejected() {
    // data2[index] = data1[index] + 1  (f32 + i32)
    let mut a = Asm::new();
    a.arg(
        "index",
        "input",
        Slot::Builtin("GlobalInvocationId".to_string()),
        "i32",
    );
    a.arg("data1", "buffer", Slot::Index(0), "Array(f32)");
    a.arg("data2", "buffer", Slot::Index(1), "Array(f32)");
    a.load_fast("data1");
    a.load_fast("index");
    a.op(SrcOp::BinarySubscr, 0);
    a.load_const_i(1);
    a.op(SrcOp::BinaryAdd, 0);
    a.load_fast("data2");
    a.load_fast("index");
    a.op(SrcOp::StoreSubscr, 0);
    a.ret_none();
    assert!(matches!(
        expect_err(&a.build(), ShaderStage::Compute),
        ShaderError::TypeMismatch(_)
    ));
}

#[test]
fn bad_swizzles_are_rejected() {
    let mut a = Asm::new();
    a.arg("v", "input", Slot::Index(0), "vec2");
    a.arg("out_v", "output", Slot::Index(0), "f32");
    a.load_fast("v");
    a.load_attr("z");
    a.store_fast("out_v");
    a.ret_none();
    assert!(matches!(
        expect_err(&a.build(), ShaderStage::Fragment),
        ShaderError::InvalidSwizzle(_)
    ));
}
