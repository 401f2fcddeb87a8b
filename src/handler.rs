// Copyright (c) 2026 Packet Extractor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Static inference of a handler's fixed packet length.
//!
//! The rules are deliberately narrow. A length is reported only when
//!
//! 1. the handler (or the function holding the dispatch) reserves a stack
//!    frame of `N` bytes with `sub esp,N`, `add esp,-N` or `enter N,0`,
//! 2. a `mov` stores a literal in `[min_packet_length, max_packet_length]`
//!    into a slot inside that frame (`[ebp-k]` with `0 < k <= N`, or
//!    `[esp+k]` with `k < N` while the stack pointer is still where the
//!    reservation left it),
//! 3. that slot holds the same literal on every path that leaves the
//!    handler, and no other slot qualifies with a different value.
//!
//! Anything else, including indirect jumps inside the handler, gives
//! [`PacketLength::VARIABLE`]. Returning "unknown" is always preferred over a
//! wrong number.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::debug;
use serde::Serialize;

use crate::instruction::{
    register_family, register_width, signed_at_width, Instruction, MemoryOperand, Operand,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PacketLength {
    pub packet_id: u16,
    /// Body length in bytes, or [`PacketLength::VARIABLE`].
    pub length: i32,
}

impl PacketLength {
    pub const VARIABLE: i32 = -1;

    pub fn fixed(packet_id: u16, length: i32) -> Self {
        Self { packet_id, length }
    }

    pub fn variable(packet_id: u16) -> Self {
        Self {
            packet_id,
            length: Self::VARIABLE,
        }
    }

    pub fn is_variable(&self) -> bool {
        self.length == Self::VARIABLE
    }
}

/// Knobs and facts from outside the handler span.
#[derive(Debug, Clone, Copy)]
pub struct InferenceContext {
    /// Frame of the function containing the dispatch, used by case handlers
    /// that have no prologue of their own.
    pub inherited_frame: Option<u64>,
    pub min_length: i64,
    pub max_length: i64,
}

/// Returns the frame size reserved by `insn`, if it is a stack reservation.
pub fn stack_reservation(insn: &Instruction) -> Option<u64> {
    match insn.opcode() {
        "sub" | "add" => {
            let reg = insn.operand(0)?;
            let reg = reg.as_register()?;
            if register_family(reg) != Some("sp") {
                return None;
            }
            let imm = insn.operand(1)?.as_immediate()?;
            let imm = signed_at_width(imm, register_width(reg).unwrap_or(64));
            let size = if insn.opcode() == "sub" {
                imm
            } else {
                imm.checked_neg()?
            };
            (size > 0).then_some(size as u64)
        }
        "enter" => {
            let size = insn.operand(0)?.as_immediate()?;
            (size > 0).then_some(size as u64)
        }
        _ => None,
    }
}

fn changes_stack_pointer(insn: &Instruction) -> bool {
    match insn.opcode() {
        "push" | "pop" | "pushad" | "popad" | "pushfd" | "popfd" | "enter" | "leave" => true,
        _ => insn
            .destination_register()
            .is_some_and(|reg| register_family(&reg) == Some("sp")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotValue {
    Literal(i64),
    Opaque,
}

/// `(register family, displacement)` of a frame slot.
type Slot = (&'static str, i64);
/// Slots absent from the map have not been written on this path.
type State = BTreeMap<Slot, SlotValue>;

fn join(into: &mut State, other: &State) -> bool {
    let mut changed = false;
    let keys: BTreeSet<Slot> = into.keys().chain(other.keys()).copied().collect();
    for key in keys {
        let merged = match (into.get(&key), other.get(&key)) {
            (Some(a), Some(b)) if a == b => *a,
            _ => SlotValue::Opaque,
        };
        if into.get(&key) != Some(&merged) {
            into.insert(key, merged);
            changed = true;
        }
    }
    changed
}

/// What one instruction does to the frame slots.
enum Effect {
    None,
    Store(Slot, SlotValue),
    /// A literal store through an untrusted stack pointer.
    Unknowable,
}

struct Frame {
    size: i64,
    /// Stack-pointer-relative slots are only meaningful before this index.
    sp_stable_until: usize,
}

impl Frame {
    fn slot_of(&self, mem: &MemoryOperand) -> Option<Slot> {
        if mem.index.is_some() || mem.segment.is_some() {
            return None;
        }
        let family = register_family(mem.base.as_deref()?)?;
        let d = mem.displacement;
        match family {
            "bp" => d
                .checked_neg()
                .is_some_and(|depth| depth > 0 && depth <= self.size)
                .then_some(("bp", d)),
            "sp" => (d >= 0 && d < self.size).then_some(("sp", d)),
            _ => None,
        }
    }
}

fn effect(insn: &Instruction, ix: usize, frame: &Frame, ctx: &InferenceContext) -> Effect {
    if matches!(insn.opcode(), "cmp" | "test" | "push") || insn.is_conditional_jump() {
        return Effect::None;
    }
    // `lea` takes the slot's address; anything may write it from then on.
    // `xchg` and `xadd` write both operands.
    let written: &[usize] = match insn.opcode() {
        "lea" => &[1],
        "xchg" | "xadd" => &[0, 1],
        _ => &[0],
    };
    let Some((mem, slot)) = written.iter().find_map(|&ix| match insn.operand(ix) {
        Some(Operand::Memory(mem)) => frame.slot_of(&mem).map(|slot| (mem, slot)),
        _ => None,
    }) else {
        return Effect::None;
    };

    let literal = match (insn.opcode(), insn.operand(1)) {
        ("mov", Some(Operand::Immediate(imm))) => {
            let bits = mem.width().map(|w| w * 8).unwrap_or(32);
            Some(signed_at_width(imm, bits))
        }
        _ => None,
    };

    if slot.0 == "sp" && ix >= frame.sp_stable_until {
        return if literal.is_some() {
            Effect::Unknowable
        } else {
            Effect::Store(slot, SlotValue::Opaque)
        };
    }

    match literal {
        Some(v) if v >= ctx.min_length && v <= ctx.max_length && v <= i32::MAX as i64 => {
            Effect::Store(slot, SlotValue::Literal(v))
        }
        _ => Effect::Store(slot, SlotValue::Opaque),
    }
}

/// Infers the length of `packet_id` from its handler's instructions.
pub fn infer_length(span: &[Instruction], packet_id: u16, ctx: &InferenceContext) -> PacketLength {
    match infer(span, ctx) {
        Some(len) => PacketLength::fixed(packet_id, len as i32),
        None => PacketLength::variable(packet_id),
    }
}

fn infer(span: &[Instruction], ctx: &InferenceContext) -> Option<i64> {
    if span.is_empty() {
        return None;
    }

    // The prologue is the straight-line code before the first control transfer.
    let mut own: Option<(usize, u64)> = None;
    for (ix, insn) in span.iter().enumerate() {
        if insn.is_conditional_jump()
            || insn.is_unconditional_jump()
            || insn.is_return()
            || insn.is_call()
        {
            break;
        }
        if let Some(size) = stack_reservation(insn) {
            own = Some((ix, size));
            break;
        }
    }

    let frame = match own {
        Some((res_ix, size)) => Frame {
            size: size as i64,
            sp_stable_until: span
                .iter()
                .enumerate()
                .skip(res_ix + 1)
                .find(|(_, insn)| changes_stack_pointer(insn))
                .map(|(ix, _)| ix)
                .unwrap_or(span.len()),
        },
        None => Frame {
            size: ctx.inherited_frame? as i64,
            // Pushes made before the dispatch are unknown.
            sp_stable_until: 0,
        },
    };

    let index_of = |addr: u64| span.iter().position(|insn| insn.address == addr);
    let successors = |ix: usize| -> Option<(Vec<usize>, bool)> {
        let insn = &span[ix];
        let fall = (ix + 1 < span.len()).then_some(ix + 1);
        if insn.is_return() || insn.is_trap() {
            return Some((vec![], true));
        }
        if insn.is_unconditional_jump() {
            let target = insn.branch_target()?;
            return Some(match index_of(target) {
                Some(t) => (vec![t], false),
                None => (vec![], true),
            });
        }
        if insn.is_conditional_jump() {
            let target = insn.branch_target()?;
            let mut succ: Vec<usize> = fall.into_iter().collect();
            let mut exits = fall.is_none();
            match index_of(target) {
                Some(t) => succ.push(t),
                None => exits = true,
            }
            return Some((succ, exits));
        }
        Some(match fall {
            Some(next) => (vec![next], false),
            None => (vec![], true),
        })
    };

    let mut states: Vec<Option<State>> = vec![None; span.len()];
    states[0] = Some(State::new());
    let mut work: VecDeque<usize> = VecDeque::from([0]);
    // Latest state per exiting node; states only grow, so the last one wins.
    let mut exits: BTreeMap<usize, State> = BTreeMap::new();

    while let Some(ix) = work.pop_front() {
        let mut out = states[ix].clone()?;
        match effect(&span[ix], ix, &frame, ctx) {
            Effect::None => {}
            Effect::Store(slot, value) => {
                out.insert(slot, value);
            }
            Effect::Unknowable => {
                debug!(
                    "Literal store through a moved stack pointer at 0x{:x}",
                    span[ix].address
                );
                return None;
            }
        }

        let Some((succ, leaves)) = successors(ix) else {
            debug!("Indirect jump inside handler at 0x{:x}", span[ix].address);
            return None;
        };
        if leaves {
            exits.insert(ix, out.clone());
        }
        for s in succ {
            let changed = match states[s].as_mut() {
                Some(existing) => join(existing, &out),
                None => {
                    states[s] = Some(out.clone());
                    true
                }
            };
            if changed && !work.contains(&s) {
                work.push_back(s);
            }
        }
    }

    if exits.is_empty() {
        return None;
    }
    let all_slots: BTreeSet<Slot> = exits.values().flat_map(|s| s.keys().copied()).collect();
    let mut slots: BTreeMap<Slot, Option<i64>> = BTreeMap::new();
    for slot in all_slots {
        let mut value: Option<i64> = None;
        let mut consistent = true;
        for exit in exits.values() {
            match (exit.get(&slot), value) {
                (Some(SlotValue::Literal(v)), None) => value = Some(*v),
                (Some(SlotValue::Literal(v)), Some(prev)) if *v == prev => {}
                _ => consistent = false,
            }
        }
        slots.insert(slot, if consistent { value } else { None });
    }

    let candidates: BTreeSet<i64> = slots.values().flatten().copied().collect();
    if candidates.len() == 1 {
        candidates.into_iter().next()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn insn(address: u64, text: &str) -> Instruction {
        let (mnemonic, ops) = text.split_once(' ').unwrap_or((text, ""));
        let operands = if ops.is_empty() {
            vec![]
        } else {
            ops.split(',').map(|s| s.trim().to_string()).collect()
        };
        Instruction::new(address, mnemonic, operands, vec![0x90])
    }

    fn span(lines: &[&str]) -> Vec<Instruction> {
        lines
            .iter()
            .enumerate()
            .map(|(i, text)| insn(0x1000 + i as u64, text))
            .collect()
    }

    fn ctx() -> InferenceContext {
        InferenceContext {
            inherited_frame: None,
            min_length: 2,
            max_length: 0xffff,
        }
    }

    #[test]
    fn straight_line_literal_is_the_length() {
        let body = span(&[
            "push ebp",
            "mov ebp,esp",
            "sub esp,0x8",
            "mov DWORD PTR [ebp-0x4],0xa",
            "call 402000",
            "leave",
            "ret",
        ]);
        assert_eq!(infer_length(&body, 0x64, &ctx()), PacketLength::fixed(0x64, 10));
    }

    #[test]
    fn branch_before_literal_is_variable() {
        // 0x1000 ..
        let body = span(&[
            "push ebp",
            "mov ebp,esp",
            "sub esp,0x8",
            "mov eax,DWORD PTR [ebp+0x8]",
            "cmp BYTE PTR [eax],0x0",
            "je 1007",
            "mov DWORD PTR [ebp-0x4],0x1a",
            "leave",
            "ret",
        ]);
        assert!(infer_length(&body, 0x65, &ctx()).is_variable());
    }

    #[test]
    fn different_literals_on_two_paths_are_variable() {
        let body = span(&[
            "sub esp,0x10",                // 1000
            "test eax,eax",                // 1001
            "jne 1005",                    // 1002
            "mov DWORD PTR [esp+0x4],0x6", // 1003
            "jmp 1006",                    // 1004
            "mov DWORD PTR [esp+0x4],0x8", // 1005
            "add esp,0x10",                // 1006
            "ret",                         // 1007
        ]);
        assert!(infer_length(&body, 1, &ctx()).is_variable());
    }

    #[test]
    fn same_literal_on_both_paths_is_fixed() {
        let body = span(&[
            "sub esp,0x10",                // 1000
            "test eax,eax",                // 1001
            "jne 1005",                    // 1002
            "mov DWORD PTR [esp+0x4],0x6", // 1003
            "jmp 1006",                    // 1004
            "mov DWORD PTR [esp+0x4],0x6", // 1005
            "ret",                         // 1006
        ]);
        assert_eq!(infer_length(&body, 1, &ctx()).length, 6);
    }

    #[test]
    fn no_frame_means_variable() {
        let body = span(&["mov DWORD PTR [ebp-0x4],0xa", "ret"]);
        assert!(infer_length(&body, 1, &ctx()).is_variable());

        let inherited = InferenceContext {
            inherited_frame: Some(0x20),
            ..ctx()
        };
        assert_eq!(infer_length(&body, 1, &inherited).length, 10);
    }

    #[test]
    fn slot_outside_frame_is_ignored() {
        let body = span(&[
            "push ebp",
            "mov ebp,esp",
            "sub esp,0x4",
            "mov DWORD PTR [ebp-0x8],0xa",
            "leave",
            "ret",
        ]);
        assert!(infer_length(&body, 1, &ctx()).is_variable());
    }

    #[test]
    fn two_qualifying_literals_are_ambiguous() {
        let body = span(&[
            "push ebp",
            "mov ebp,esp",
            "sub esp,0x8",
            "mov DWORD PTR [ebp-0x8],0x64",
            "mov DWORD PTR [ebp-0x4],0xa",
            "leave",
            "ret",
        ]);
        assert!(infer_length(&body, 0x64, &ctx()).is_variable());
    }

    #[test]
    fn overwritten_slot_is_opaque() {
        let body = span(&[
            "enter 0x8,0x0",
            "mov DWORD PTR [ebp-0x4],0xa",
            "mov DWORD PTR [ebp-0x4],eax",
            "leave",
            "ret",
        ]);
        assert!(infer_length(&body, 1, &ctx()).is_variable());
    }

    #[test]
    fn out_of_range_literal_does_not_count() {
        let body = span(&[
            "sub esp,0x8",
            "mov DWORD PTR [esp+0x0],0x0",
            "mov DWORD PTR [esp+0x4],0x1d",
            "add esp,0x8",
            "ret",
        ]);
        assert_eq!(infer_length(&body, 1, &ctx()).length, 0x1d);
    }

    #[test]
    fn stack_store_after_push_is_unknowable() {
        let body = span(&[
            "sub esp,0x8",
            "push eax",
            "mov DWORD PTR [esp+0x4],0xa",
            "ret",
        ]);
        assert!(infer_length(&body, 1, &ctx()).is_variable());
    }

    #[test]
    fn indirect_jump_is_variable() {
        let body = span(&[
            "sub esp,0x8",
            "mov DWORD PTR [esp+0x4],0xa",
            "jmp eax",
        ]);
        assert!(infer_length(&body, 1, &ctx()).is_variable());
    }

    #[test]
    fn jump_out_of_span_is_an_exit() {
        let body = span(&[
            "sub esp,0x8",
            "mov DWORD PTR [esp+0x4],0xc",
            "jmp 405000 <common_tail>",
        ]);
        assert_eq!(infer_length(&body, 1, &ctx()).length, 12);
    }

    #[test]
    fn loops_reach_a_fixpoint() {
        let body = span(&[
            "sub esp,0x8",                 // 1000
            "mov DWORD PTR [esp+0x4],0x9", // 1001
            "dec ecx",                     // 1002
            "jne 1002",                    // 1003
            "ret",                         // 1004
        ]);
        assert_eq!(infer_length(&body, 1, &ctx()).length, 9);
    }

    #[test]
    fn reservation_forms() {
        assert_eq!(stack_reservation(&insn(0, "sub esp,0x18")), Some(0x18));
        assert_eq!(stack_reservation(&insn(0, "add esp,0xfffffff0")), Some(0x10));
        assert_eq!(stack_reservation(&insn(0, "sub rsp,0x28")), Some(0x28));
        assert_eq!(stack_reservation(&insn(0, "enter 0x20,0x0")), Some(0x20));
        assert_eq!(stack_reservation(&insn(0, "add esp,0x8")), None);
        assert_eq!(stack_reservation(&insn(0, "sub eax,0x8")), None);
        assert_eq!(
            stack_reservation(&insn(0, "add rsp,0x8000000000000000")),
            None
        );
    }

    #[rstest]
    #[case("xchg eax,DWORD PTR [ebp-0x4]")]
    #[case("xchg DWORD PTR [ebp-0x4],eax")]
    #[case("xadd ecx,DWORD PTR [ebp-0x4]")]
    #[case("xadd DWORD PTR [ebp-0x4],ecx")]
    fn exchange_in_either_position_clobbers_the_slot(#[case] exchange: &str) {
        let body = span(&[
            "push ebp",
            "mov ebp,esp",
            "sub esp,0x8",
            "mov DWORD PTR [ebp-0x4],0xa",
            exchange,
            "leave",
            "ret",
        ]);
        assert!(infer_length(&body, 1, &ctx()).is_variable());
    }

    #[test]
    fn extreme_frame_displacement_is_not_a_slot() {
        let body = span(&[
            "push ebp",
            "mov ebp,esp",
            "sub esp,0x8",
            "mov DWORD PTR [ebp-0x8000000000000000],0xa",
            "leave",
            "ret",
        ]);
        assert!(infer_length(&body, 1, &ctx()).is_variable());
    }
}
