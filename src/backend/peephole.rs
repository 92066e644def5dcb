//! Cleanup of the emitted instruction stream. The rewrites only look at
//! straight-line runs and give up at the first label or jump they can't see
//! past.

use log::debug;

use crate::{
    backend::{
        assembler::AsmItem,
        isa::{Condition, Instruction, Register, Target},
    },
    frontend::intern::Symbol,
};

const MAX_ROUNDS: usize = 5;

type Rule = fn(&mut Vec<AsmItem>, usize) -> bool;

const RULES: &[(&str, Rule)] = &[
    ("self-move", remove_self_move),
    ("double-return", collapse_double_return),
    ("call-clobber", fold_clobbered_pop),
    ("push-pop", remove_push_pop),
    ("branch-over-jump", invert_branch_over_jump),
    ("jump-to-next", remove_jump_to_next),
    ("thread-branch", thread_branch),
];

/// Rewrites `items` in place. Returns whether anything changed.
pub fn optimize_bytecode(items: &mut Vec<AsmItem>) -> bool {
    let before = items.len();
    let mut changed_any = false;

    for _ in 0..MAX_ROUNDS {
        let mut changed = false;
        let mut index = 0;

        while index < items.len() {
            for (name, rule) in RULES {
                if rule(items, index) {
                    debug!("bytecode rule `{name}` fired at {index}");
                    changed = true;
                }
            }
            index += 1;
        }

        if !changed {
            break;
        }
        changed_any = true;
    }

    if changed_any {
        debug!("bytecode peephole: {before} -> {} items", items.len());
    }
    changed_any
}

fn instruction(items: &[AsmItem], index: usize) -> Option<Instruction> {
    match items.get(index)? {
        AsmItem::Instruction(instruction) => Some(*instruction),
        AsmItem::Label(_) => None,
    }
}

fn remove_self_move(items: &mut Vec<AsmItem>, index: usize) -> bool {
    match instruction(items, index) {
        Some(Instruction::Move {
            destination,
            source,
        }) if destination == source => {
            items.remove(index);
            true
        }
        _ => false,
    }
}

fn collapse_double_return(items: &mut Vec<AsmItem>, index: usize) -> bool {
    if instruction(items, index) == Some(Instruction::Return)
        && instruction(items, index + 1) == Some(Instruction::Return)
    {
        items.remove(index + 1);
        return true;
    }

    false
}

/// `push r; call f; pop r; set r, v` -> `call f; set r, v`
fn fold_clobbered_pop(items: &mut Vec<AsmItem>, index: usize) -> bool {
    let (
        Some(Instruction::Push(pushed)),
        Some(Instruction::Call { .. }),
        Some(Instruction::Pop(popped)),
        Some(Instruction::SetImmediate { destination, .. }),
    ) = (
        instruction(items, index),
        instruction(items, index + 1),
        instruction(items, index + 2),
        instruction(items, index + 3),
    )
    else {
        return false;
    };

    if pushed != popped || popped != destination {
        return false;
    }

    items.remove(index + 2);
    items.remove(index);
    true
}

/// Index of the `pop` matching the `push` at `index`, if everything in
/// between is straight-line code that leaves the stack pointer to pushes,
/// pops and calls. The second value says whether `register` may change in
/// between.
fn matching_pop(items: &[AsmItem], index: usize, register: Register) -> Option<(usize, bool)> {
    let mut depth = 0usize;
    let mut clobbered = false;

    for (offset, item) in items.iter().enumerate().skip(index + 1) {
        let AsmItem::Instruction(instruction) = item else {
            return None;
        };

        match *instruction {
            Instruction::Push(_) => depth += 1,
            Instruction::Pop(r) if depth == 0 => return (r == register).then_some((offset, clobbered)),
            Instruction::Pop(r) => {
                depth -= 1;
                clobbered |= r == register;
            }
            Instruction::Call { .. } => clobbered = true,
            Instruction::Jump { .. } | Instruction::ShortJump { .. } | Instruction::Return => {
                return None;
            }
            other => {
                if other.reads().contains(&Register::STACK_POINTER)
                    || other.writes().contains(&Register::STACK_POINTER)
                {
                    return None;
                }
                clobbered |= other.writes().contains(&register);
            }
        }
    }

    None
}

/// Whether `register` is overwritten before anything reads it, looking
/// forward from `index`
fn is_dead_from(items: &[AsmItem], index: usize, register: Register) -> bool {
    for item in &items[index..] {
        let AsmItem::Instruction(instruction) = item else {
            return false;
        };

        if instruction.reads().contains(&register) {
            return false;
        }
        if *instruction == Instruction::Return {
            return register != Register::RETURN;
        }
        if instruction.is_control_transfer() {
            return false;
        }
        if instruction.writes().contains(&register) {
            return true;
        }
    }

    false
}

/// Drops a `push r` / `pop r` pair when `r` holds the same value before and
/// after anyway, or when nothing reads the popped value
fn remove_push_pop(items: &mut Vec<AsmItem>, index: usize) -> bool {
    let Some(Instruction::Push(register)) = instruction(items, index) else {
        return false;
    };
    if register == Register::STACK_POINTER {
        return false;
    }

    let Some((pop, clobbered)) = matching_pop(items, index, register) else {
        return false;
    };

    if clobbered && !is_dead_from(items, pop + 1, register) {
        return false;
    }

    items.remove(pop);
    items.remove(index);
    true
}

/// `jz r, @l; jmp @m; l:` -> `jnz r, @m; l:`
fn invert_branch_over_jump(items: &mut Vec<AsmItem>, index: usize) -> bool {
    let (
        Some(Instruction::Jump {
            condition,
            target: Target::Label(skipped),
        }),
        Some(Instruction::Jump {
            condition: Condition::Always,
            target,
        }),
        Some(AsmItem::Label(label)),
    ) = (
        instruction(items, index),
        instruction(items, index + 1),
        items.get(index + 2),
    )
    else {
        return false;
    };

    let Some(inverted) = condition.inverted() else {
        return false;
    };
    if skipped != *label {
        return false;
    }

    items[index] = AsmItem::Instruction(Instruction::Jump {
        condition: inverted,
        target,
    });
    items.remove(index + 1);
    true
}

/// A jump whose target label directly follows it
fn remove_jump_to_next(items: &mut Vec<AsmItem>, index: usize) -> bool {
    let Some(Instruction::Jump {
        target: Target::Label(target),
        ..
    }) = instruction(items, index)
    else {
        return false;
    };

    let falls_into = items[index + 1..]
        .iter()
        .map_while(|item| match item {
            AsmItem::Label(label) => Some(*label),
            AsmItem::Instruction(_) => None,
        })
        .any(|label| label == target);

    if falls_into {
        items.remove(index);
    }
    falls_into
}

/// The unconditional jump right after `label`, if there is one
fn jump_after(items: &[AsmItem], label: Symbol) -> Option<Target> {
    let position = items
        .iter()
        .position(|item| *item == AsmItem::Label(label))?;

    items[position + 1..]
        .iter()
        .find_map(|item| match item {
            AsmItem::Label(_) => None,
            AsmItem::Instruction(instruction) => Some(Some(*instruction)),
        })
        .flatten()
        .and_then(|instruction| match instruction {
            Instruction::Jump {
                condition: Condition::Always,
                target,
            } => Some(target),
            _ => None,
        })
}

/// Jumps to a label that only jumps on go straight to the final target
fn thread_branch(items: &mut Vec<AsmItem>, index: usize) -> bool {
    let Some(Instruction::Jump {
        condition,
        target: Target::Label(first),
    }) = instruction(items, index)
    else {
        return false;
    };

    let Some(Target::Label(next)) = jump_after(items, first) else {
        return false;
    };
    if next == first {
        return false;
    }

    items[index] = AsmItem::Instruction(Instruction::Jump {
        condition,
        target: Target::Label(next),
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::assembler::parse_assembly;

    fn optimize(text: &str) -> Vec<AsmItem> {
        let mut items = parse_assembly(text).unwrap();
        optimize_bytecode(&mut items);
        items
    }

    fn assert_optimizes(before: &str, after: &str) {
        assert_eq!(optimize(before), parse_assembly(after).unwrap());
    }

    #[test]
    fn removes_moves_and_returns() {
        assert_optimizes("mov r1, r1; ret; ret", "ret");
    }

    #[test]
    fn push_pop_around_unrelated_code() {
        assert_optimizes(
            "push r3; add r1, r1, r2; pop r3; ret",
            "add r1, r1, r2; ret",
        );
        // r3 changes in between and is read afterwards, so the pair stays
        assert_optimizes(
            "push r3; setb r3, 1; pop r3; mov r0, r3; ret",
            "push r3; setb r3, 1; pop r3; mov r0, r3; ret",
        );
    }

    #[test]
    fn popped_value_overwritten_after_call() {
        assert_optimizes("push r4; call @f; pop r4; setb r4, 9", "call @f; setb r4, 9");
        assert_optimizes(
            "push r4; setb r0, 1; call @f; pop r4; mov r4, r0",
            "setb r0, 1; call @f; mov r4, r0",
        );
    }

    #[test]
    fn branch_over_jump_is_inverted() {
        assert_optimizes(
            "jz r1, @skip; jmp @far; skip:\nsetb r0, 1; ret; far:\nret",
            "jnz r1, @far; skip:\nsetb r0, 1; ret; far:\nret",
        );
    }

    #[test]
    fn jumps_are_threaded_and_dropped() {
        assert_optimizes(
            "jnz r1, @a; ret; a:\njmp @b; b:\nsetb r0, 2; ret",
            "jnz r1, @b; ret; a:\nb:\nsetb r0, 2; ret",
        );
    }
}
