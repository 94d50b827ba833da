//! Rewrites over the emitted stack IR: empty-block collapse, ternary
//! flattening into `select`, and short-circuit `or` repair.
use fnv::{FnvHashMap, FnvHashSet};

use shadec_core::sir::{BinOp, Instr, Label, UnOp};

/// The source occasionally produces a block that only jumps elsewhere;
/// some branches go through it and some skip it, which leaves the control
/// flow inconsistent. Remove such blocks and reroute every reference,
/// transitively. Protected (loop iter/continue) labels stay.
pub(crate) fn collapse_empty_blocks(ops: &mut Vec<Instr>, protected: &FnvHashSet<Label>) {
    let mut replace: FnvHashMap<Label, Label> = Default::default();
    for i in (0..ops.len().saturating_sub(1)).rev() {
        if i + 1 >= ops.len() {
            continue;
        }
        let pair = match (&ops[i], &ops[i + 1]) {
            (Instr::Label(l), Instr::Branch(t)) if !protected.contains(l) => Some((*l, *t)),
            _ => None,
        };
        if let Some((l, t)) = pair {
            replace.insert(l, t);
            ops.remove(i);
            ops.remove(i);
        }
    }
    if replace.is_empty() {
        return;
    }
    // Chase chains of removed blocks down to a surviving target.
    let keys: Vec<Label> = replace.keys().copied().collect();
    for key in keys {
        let mut target = replace[&key];
        while let Some(&next) = replace.get(&target) {
            if next == key {
                break;
            }
            target = next;
        }
        replace.insert(key, target);
    }
    let mut patched = 0usize;
    let fix = |l: &mut Label, patched: &mut usize| {
        if let Some(&t) = replace.get(l) {
            *l = t;
            *patched += 1;
        }
    };
    for op in ops.iter_mut() {
        match op {
            Instr::Branch(l) => fix(l, &mut patched),
            Instr::BranchConditional {
                true_label,
                false_label,
            } => {
                fix(true_label, &mut patched);
                fix(false_label, &mut patched);
            }
            Instr::BranchLoop {
                iter_label,
                continue_label,
                merge_label,
            } => {
                fix(iter_label, &mut patched);
                fix(continue_label, &mut patched);
                fix(merge_label, &mut patched);
            }
            _ => {}
        }
    }
    log::debug!(
        "collapsed {} empty blocks, rerouted {} targets",
        replace.len(),
        patched
    );
}

/// Instructions that only produce or shuffle values; a ternary arm made of
/// these can run unconditionally ahead of a `select`. Texture functions
/// are the one callable with side effects, so their name loads disqualify
/// an arm.
fn is_pure_value_op(op: &Instr) -> bool {
    match op {
        Instr::LoadName(name) => !name.starts_with("texture."),
        Instr::LoadConst(_)
        | Instr::LoadAttr(_)
        | Instr::LoadIndex
        | Instr::LoadArray { .. }
        | Instr::BinaryOp(_)
        | Instr::UnaryOp(_)
        | Instr::Compare(_)
        | Instr::Call { .. }
        | Instr::Select
        | Instr::PopTop
        | Instr::DupTop
        | Instr::RotTwo => true,
        _ => false,
    }
}

fn count_refs(ops: &[Instr], label: Label) -> usize {
    ops.iter()
        .map(|op| match op {
            Instr::Branch(l) => (*l == label) as usize,
            Instr::BranchConditional {
                true_label,
                false_label,
            } => (*true_label == label) as usize + (*false_label == label) as usize,
            Instr::BranchLoop {
                iter_label,
                continue_label,
                merge_label,
            } => {
                (*iter_label == label) as usize
                    + (*continue_label == label) as usize
                    + (*merge_label == label) as usize
            }
            _ => 0,
        })
        .sum()
}

/// Find `branch_conditional(T, F); label(T); ..; branch(M); label(F); ..;
/// branch(M); label(M)` where both arms leave one value on the stack and
/// consist of pure value producers, and nothing else targets `T` or `F`.
/// Returns the indices of the conditional branch and the two arm-ending
/// branches.
fn find_ternary(ops: &[Instr], value_leaving: &FnvHashSet<Label>) -> Option<(usize, usize, usize)> {
    for i in 0..ops.len() {
        let (t, f) = match &ops[i] {
            Instr::BranchConditional {
                true_label,
                false_label,
            } => (*true_label, *false_label),
            _ => continue,
        };
        if !value_leaving.contains(&t) || !value_leaving.contains(&f) {
            continue;
        }
        if ops.get(i + 1) != Some(&Instr::Label(t)) {
            continue;
        }
        let mut j = i + 2;
        while j < ops.len() && is_pure_value_op(&ops[j]) {
            j += 1;
        }
        let m1 = match ops.get(j) {
            Some(Instr::Branch(m)) => *m,
            _ => continue,
        };
        if ops.get(j + 1) != Some(&Instr::Label(f)) {
            continue;
        }
        let mut k = j + 2;
        while k < ops.len() && is_pure_value_op(&ops[k]) {
            k += 1;
        }
        let m2 = match ops.get(k) {
            Some(Instr::Branch(m)) => *m,
            _ => continue,
        };
        if m1 != m2 || ops.get(k + 1) != Some(&Instr::Label(m1)) {
            continue;
        }
        if count_refs(ops, t) != 1 || count_refs(ops, f) != 1 {
            continue;
        }
        return Some((i, j, k));
    }
    None
}

/// Convert branch-shaped ternaries into straight-line `select`s. Inner
/// ternaries convert first (an unconverted inner arm still contains
/// labels, which are not pure), so the pass iterates to a fixed point.
pub(crate) fn convert_ternaries(ops: &mut Vec<Instr>, value_leaving: &FnvHashSet<Label>) {
    let mut converted = 0usize;
    while let Some((i, j, k)) = find_ternary(ops, value_leaving) {
        let merge = match ops[k] {
            Instr::Branch(m) => m,
            _ => unreachable!("find_ternary returns a branch index"),
        };
        let mut repl: Vec<Instr> = Vec::with_capacity(k - i);
        repl.extend_from_slice(&ops[i + 2..j]); // then-arm
        repl.extend_from_slice(&ops[j + 2..k]); // else-arm
        repl.push(Instr::Select);
        repl.push(Instr::Branch(merge));
        ops.splice(i..=k, repl);
        converted += 1;
    }
    if converted > 0 {
        log::debug!("converted {} ternaries to select", converted);
    }
}

/// In `a or b` the source only evaluates `b` when `a` is falsy. Its
/// bytecode therefore routes two conditional branches through a shared
/// target, giving that block two predecessors, which structured SPIR-V
/// forbids. Detect the pattern and fold the second condition into the
/// first block, combining the conditions with `or`/`and`/`not` according
/// to the branch orientation. Runs to a fixed point.
pub(crate) fn flatten_or_patterns(ops: &mut Vec<Instr>) {
    let mut flattened = 0usize;
    while let Some((i_ins, i_label, i_cond)) = find_or_block(ops) {
        let (l1t, l1f) = conditional_targets(&ops[i_ins]);
        let (l2t, l2f) = conditional_targets(&ops[i_cond]);
        // The condition-computing body, minus its label and trailing
        // branch.
        let mut selection: Vec<Instr> = ops[i_label + 1..i_cond].to_vec();
        ops.drain(i_label..=i_cond);
        if l1t == l2t {
            // comp1 is true or comp2 is true
            selection.push(Instr::BinaryOp(BinOp::Or));
            selection.push(Instr::BranchConditional {
                true_label: l1t,
                false_label: l2f,
            });
        } else if l1t == l2f {
            // comp1 is true or comp2 is false
            selection.push(Instr::UnaryOp(UnOp::Not));
            selection.push(Instr::BinaryOp(BinOp::Or));
            selection.push(Instr::BranchConditional {
                true_label: l1t,
                false_label: l2t,
            });
        } else if l1f == l2t {
            // comp1 is false or comp2 is true
            selection.insert(0, Instr::UnaryOp(UnOp::Not));
            selection.push(Instr::BinaryOp(BinOp::Or));
            selection.push(Instr::BranchConditional {
                true_label: l1f,
                false_label: l2f,
            });
        } else if l1f == l2f {
            // comp1 is false or comp2 is false
            selection.push(Instr::BinaryOp(BinOp::And));
            selection.push(Instr::UnaryOp(UnOp::Not));
            selection.push(Instr::BranchConditional {
                true_label: l1f,
                false_label: l2t,
            });
        }
        ops.splice(i_ins..=i_ins, selection);
        flattened += 1;
    }
    if flattened > 0 {
        log::debug!("flattened {} short-circuit branches", flattened);
    }
}

fn conditional_targets(op: &Instr) -> (Label, Label) {
    match op {
        Instr::BranchConditional {
            true_label,
            false_label,
        } => (*true_label, *false_label),
        _ => unreachable!("caller guarantees a conditional branch"),
    }
}

/// Locate a conditional branch that shares a target with an earlier one
/// whose other target is the block the later branch sits in. Returns the
/// indices of (earlier branch, intermediate label, later branch).
fn find_or_block(ops: &[Instr]) -> Option<(usize, usize, usize)> {
    let mut conditional: FnvHashMap<Label, (Label, usize)> = Default::default();
    let mut cur_block: Option<Label> = None;
    let mut cur_block_i = 0usize;
    for (i, op) in ops.iter().enumerate() {
        match op {
            Instr::Label(l) => {
                cur_block = Some(*l);
                cur_block_i = i;
            }
            Instr::BranchConditional {
                true_label,
                false_label,
            } => {
                if let Some(&(other, ii)) = conditional.get(true_label) {
                    if Some(other) == cur_block {
                        return Some((ii, cur_block_i, i));
                    }
                } else if let Some(&(other, ii)) = conditional.get(false_label) {
                    if Some(other) == cur_block {
                        return Some((ii, cur_block_i, i));
                    }
                }
                // Registration may overwrite keys, which is fine.
                conditional.insert(*true_label, (*false_label, i));
                conditional.insert(*false_label, (*true_label, i));
            }
            _ => {}
        }
    }
    None
}
