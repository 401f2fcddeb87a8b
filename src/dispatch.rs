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

//! Finds the packet-id dispatch in a listing.
//!
//! Two compiler idioms are recognized:
//!
//! ```text
//! ; jump table                           ; compare chain
//! sub    eax,0x64                        cmp    eax,0x64
//! cmp    eax,0x1d3                       je     401200
//! ja     401f00 <default>                cmp    eax,0x65
//! movzx  ecx,BYTE PTR [eax+0x402100]     je     401240
//! jmp    DWORD PTR [ecx*4+0x402000]      sub    eax,0x10 ...
//! ```
//!
//! The rebase and the byte index table are optional. Both shapes resolve to
//! the same sorted list of [`DispatchEntry`] values. The structure with the
//! most packet ids wins; among structures sharing packet ids the one at the
//! lowest address wins. Structures are never merged.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};
use serde::Serialize;

use crate::config::AnalyzerConfig;
use crate::error::AnalysisError;
use crate::handler::stack_reservation;
use crate::instruction::{
    register_family, register_width, same_register, signed_at_width, Instruction, Operand,
};
use crate::listing::DisassemblyListing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DispatchEntry {
    pub packet_id: u16,
    pub handler_address: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchIdiom {
    JumpTable {
        /// First instruction of the idiom (rebase or bounds check).
        start_address: u64,
        jump_address: u64,
        table_address: u64,
        /// Byte table translating packet index to pointer table slot.
        index_table: Option<u64>,
        entry_width: u32,
        /// Packet id of index 0.
        base: u16,
        count: u32,
        /// Where the bounds check sends out-of-range ids.
        default_target: Option<u64>,
    },
    CompareChain {
        start_address: u64,
        register: String,
        /// `(packet id, handler)` in the order the arms appear.
        arms: Vec<(u16, u64)>,
    },
}

impl DispatchIdiom {
    pub fn start_address(&self) -> u64 {
        match self {
            DispatchIdiom::JumpTable { start_address, .. }
            | DispatchIdiom::CompareChain { start_address, .. } => *start_address,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DispatchIdiom::JumpTable { .. } => "jump table",
            DispatchIdiom::CompareChain { .. } => "compare chain",
        }
    }

    /// The single resolution step shared by both idioms.
    pub fn resolve(
        &self,
        listing: &DisassemblyListing,
    ) -> Result<Vec<DispatchEntry>, AnalysisError> {
        let mut by_id: BTreeMap<u16, u64> = BTreeMap::new();
        let mut insert = |packet_id: u16, handler: u64| -> Result<(), AnalysisError> {
            match by_id.get(&packet_id) {
                Some(&first) if first != handler => Err(AnalysisError::DuplicatePacketId {
                    packet_id,
                    first,
                    second: handler,
                }),
                Some(_) => Ok(()),
                None => {
                    by_id.insert(packet_id, handler);
                    Ok(())
                }
            }
        };

        match self {
            DispatchIdiom::JumpTable {
                table_address,
                index_table,
                entry_width,
                base,
                count,
                default_target,
                ..
            } => {
                let unreadable = |addr: u64| {
                    AnalysisError::DispatchNotFound(format!(
                        "jump table bytes at 0x{:x} are not part of the disassembly",
                        addr
                    ))
                };
                let out_of_range = || {
                    AnalysisError::DispatchNotFound(format!(
                        "jump table at 0x{:x} runs past the end of the address space",
                        table_address
                    ))
                };
                for k in 0..*count as u64 {
                    let slot = match index_table {
                        Some(idx_table) => {
                            let addr = idx_table.checked_add(k).ok_or_else(out_of_range)?;
                            listing.read_u8(addr).ok_or_else(|| unreadable(addr))? as u64
                        }
                        None => k,
                    };
                    let entry_addr = slot
                        .checked_mul(*entry_width as u64)
                        .and_then(|offset| table_address.checked_add(offset))
                        .ok_or_else(out_of_range)?;
                    let handler = listing
                        .read_le(entry_addr, *entry_width)
                        .ok_or_else(|| unreadable(entry_addr))?;
                    if Some(handler) == *default_target {
                        continue;
                    }
                    let packet_id = u16::try_from(k)
                        .ok()
                        .and_then(|k| base.checked_add(k))
                        .ok_or_else(|| {
                            AnalysisError::DispatchNotFound(format!(
                                "jump table at 0x{:x} has packet ids above 0xffff",
                                table_address
                            ))
                        })?;
                    insert(packet_id, handler)?;
                }
            }
            DispatchIdiom::CompareChain { arms, .. } => {
                for &(packet_id, handler) in arms {
                    insert(packet_id, handler)?;
                }
            }
        }

        Ok(by_id
            .into_iter()
            .map(|(packet_id, handler_address)| DispatchEntry {
                packet_id,
                handler_address,
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct DispatchTable {
    pub idiom: DispatchIdiom,
    /// Sorted by packet id, one entry per id.
    pub entries: Vec<DispatchEntry>,
    /// Stack reservation of the function containing the dispatch.
    pub frame_reservation: Option<u64>,
}

/// A recognized structure before ranking.
struct Candidate {
    idiom: DispatchIdiom,
    ids: BTreeSet<u16>,
    entries: Result<Vec<DispatchEntry>, AnalysisError>,
}

/// Picks the structure with the most packet ids, ties going to the lower
/// address. Any structure at a lower address that shares a packet id with
/// that pick replaces it.
fn choose(candidates: Vec<Candidate>) -> Option<Candidate> {
    let largest = candidates.iter().max_by(|a, b| {
        a.ids
            .len()
            .cmp(&b.ids.len())
            .then(b.idiom.start_address().cmp(&a.idiom.start_address()))
    })?;
    let chosen = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.ids.is_disjoint(&largest.ids))
        .min_by_key(|(_, c)| c.idiom.start_address())
        .map(|(ix, _)| ix)?;
    candidates.into_iter().nth(chosen)
}

/// Locates the packet dispatch and resolves it.
pub fn locate(
    listing: &DisassemblyListing,
    config: &AnalyzerConfig,
    pointer_width: Option<u32>,
) -> Result<DispatchTable, AnalysisError> {
    let insns = &listing.instructions;

    let tables = (0..insns.len())
        .filter_map(|j| jump_table_at(insns, j, config, pointer_width))
        .filter_map(|idiom| match idiom.resolve(listing) {
            Ok(entries) if !entries.is_empty() => Some(Candidate {
                ids: entries.iter().map(|e| e.packet_id).collect(),
                entries: Ok(entries),
                idiom,
            }),
            Ok(_) => None,
            Err(e) => {
                debug!("Ignoring jump table at 0x{:x}: {}", idiom.start_address(), e);
                None
            }
        });

    // A chain whose ids collide still competes so the collision is reported.
    let chains = (0..insns.len())
        .filter_map(|i| compare_chain_at(insns, i, config))
        .map(|idiom| {
            let ids = match &idiom {
                DispatchIdiom::CompareChain { arms, .. } => arms.iter().map(|a| a.0).collect(),
                DispatchIdiom::JumpTable { .. } => BTreeSet::new(),
            };
            Candidate {
                entries: idiom.resolve(listing),
                ids,
                idiom,
            }
        });

    let candidates: Vec<Candidate> = tables.chain(chains).collect();
    debug!("{} dispatch candidates", candidates.len());
    let Some(Candidate { idiom, entries, .. }) = choose(candidates) else {
        return Err(AnalysisError::DispatchNotFound(format!(
            "no jump table or compare chain among {} instructions",
            insns.len()
        )));
    };

    let entries = entries?;
    let frame_reservation = listing
        .index_of(idiom.start_address())
        .and_then(|ix| enclosing_reservation(insns, ix, config.max_handler_instructions));

    info!(
        "Found {} at 0x{:x} with {} packets",
        idiom.name(),
        idiom.start_address(),
        entries.len()
    );
    Ok(DispatchTable {
        idiom,
        entries,
        frame_reservation,
    })
}

/// Walks back from the dispatch to the function start looking for the frame
/// reservation.
fn enclosing_reservation(insns: &[Instruction], from: usize, limit: usize) -> Option<u64> {
    for insn in insns[..from].iter().rev().take(limit) {
        if insn.is_return() || insn.is_trap() {
            return None;
        }
        if let Some(size) = stack_reservation(insn) {
            return Some(size);
        }
    }
    None
}

fn is_write_to(insn: &Instruction, reg: &str) -> bool {
    if matches!(insn.opcode(), "cmp" | "test" | "push") || insn.is_conditional_jump() {
        return false;
    }
    insn.destination_register()
        .is_some_and(|dest| same_register(&dest, reg))
}

fn register_and_immediate(insn: &Instruction) -> Option<(String, i64)> {
    if insn.operands.len() != 2 {
        return None;
    }
    let reg = insn.operand(0)?.as_register()?.to_string();
    register_family(&reg)?;
    let imm = insn.operand(1)?.as_immediate()?;
    let bits = register_width(&reg).unwrap_or(64);
    Some((reg, signed_at_width(imm, bits)))
}

fn preserves_flags(insn: &Instruction) -> bool {
    let op = insn.opcode();
    matches!(
        op,
        "mov" | "movzx" | "movsx" | "movsxd" | "lea" | "push" | "pop" | "nop" | "xchg" | "not"
            | "bswap"
    ) || op.starts_with("cmov")
        || op.starts_with("set")
        || insn.is_conditional_jump()
}

fn jump_table_at(
    insns: &[Instruction],
    j: usize,
    config: &AnalyzerConfig,
    pointer_width: Option<u32>,
) -> Option<DispatchIdiom> {
    let jmp = &insns[j];
    if !jmp.is_unconditional_jump() {
        return None;
    }
    let mem = match jmp.operand(0)? {
        Operand::Memory(mem) => mem,
        _ => return None,
    };
    let mut selector = mem.index.clone()?;
    if mem.base.is_some() || !matches!(mem.scale, 4 | 8) || mem.displacement <= 0 {
        return None;
    }
    let entry_width = mem.scale as u32;
    if mem.width().is_some_and(|w| w != entry_width)
        || pointer_width.is_some_and(|w| w != entry_width)
    {
        return None;
    }

    let window_start = j.saturating_sub(config.lookback_window);
    let mut index_table = None;
    let mut bound_jump: Option<(bool, Option<u64>)> = None;
    let mut check = None;

    for k in (window_start..j).rev() {
        let insn = &insns[k];
        let op = insn.opcode();
        if bound_jump.is_none() {
            match op {
                "ja" | "jnbe" => {
                    bound_jump = Some((true, insn.branch_target()));
                    continue;
                }
                "jae" | "jnb" | "jnc" => {
                    bound_jump = Some((false, insn.branch_target()));
                    continue;
                }
                "movzx" if index_table.is_none() && is_write_to(insn, &selector) => {
                    let src = insn.operand(1)?;
                    let src = src.as_memory()?;
                    if src.width() != Some(1) || src.index.is_some() || src.displacement <= 0 {
                        return None;
                    }
                    index_table = Some(src.displacement as u64);
                    selector = src.base.clone()?;
                    continue;
                }
                _ => {}
            }
        } else {
            if op == "cmp" {
                if let Some((reg, bound)) = register_and_immediate(insn) {
                    if same_register(&reg, &selector) {
                        check = Some((k, bound));
                        break;
                    }
                }
            }
            // The bound jump reads the flags of the last instruction that set them.
            if !preserves_flags(insn) {
                return None;
            }
        }
        if is_write_to(insn, &selector) || insn.is_return() || insn.is_unconditional_jump() {
            return None;
        }
    }

    let (check_ix, bound) = check?;
    let (inclusive, default_target) = bound_jump?;
    let count = if inclusive { bound.checked_add(1)? } else { bound };

    // Rebase immediately ahead of the bounds check.
    let mut base = 0i64;
    let mut start_ix = check_ix;
    for k in (check_ix.saturating_sub(config.lookback_window)..check_ix).rev() {
        let insn = &insns[k];
        if !is_write_to(insn, &selector) {
            if insn.is_return() || insn.is_unconditional_jump() || insn.is_conditional_jump() {
                break;
            }
            continue;
        }
        match insn.opcode() {
            "sub" => {
                if let Some((_, imm)) = register_and_immediate(insn) {
                    base = imm;
                    start_ix = k;
                }
            }
            "add" => {
                if let Some((_, imm)) = register_and_immediate(insn) {
                    base = imm.checked_neg()?;
                    start_ix = k;
                }
            }
            "lea" => {
                if let Some(src) = insn.operand(1).as_ref().and_then(Operand::as_memory) {
                    if src.index.is_none() && src.base.is_some() {
                        base = src.displacement.checked_neg()?;
                        start_ix = k;
                    }
                }
            }
            _ => {}
        }
        break;
    }

    let in_range = count > 0
        && base >= 0
        && base
            .checked_add(count - 1)
            .is_some_and(|last| last <= u16::MAX as i64);
    if !in_range {
        debug!(
            "Rejecting jump table at 0x{:x}: base {} count {}",
            jmp.address, base, count
        );
        return None;
    }

    Some(DispatchIdiom::JumpTable {
        start_address: insns[start_ix].address,
        jump_address: jmp.address,
        table_address: mem.displacement as u64,
        index_table,
        entry_width,
        base: base as u16,
        count: count as u32,
        default_target,
    })
}

fn compare_chain_at(
    insns: &[Instruction],
    i: usize,
    config: &AnalyzerConfig,
) -> Option<DispatchIdiom> {
    let mut register: Option<String> = None;
    // Amount already subtracted from the selector register.
    let mut delta: i64 = 0;
    // Packet id that makes the current flags report equality.
    let mut equal_id: Option<i64> = None;
    let mut arms: Vec<(u16, u64)> = Vec::new();

    for insn in &insns[i..] {
        let op = insn.opcode();
        let reg = insn.operand(0).and_then(|o| o.as_register().map(str::to_string));

        if let Some(reg) = reg.as_deref() {
            let family = register_family(reg);
            if matches!(family, Some("sp") | Some("bp") | Some("ip") | None) {
                break;
            }
            match register.as_deref() {
                Some(current) if !same_register(current, reg) => break,
                _ => {}
            }
        }

        match op {
            "cmp" | "sub" | "add" => {
                let Some((reg, imm)) = register_and_immediate(insn) else {
                    break;
                };
                let id = match op {
                    "cmp" => delta.checked_add(imm),
                    "sub" => delta.checked_add(imm).inspect(|d| delta = *d),
                    _ => delta.checked_sub(imm).inspect(|d| delta = *d),
                };
                let Some(id) = id else {
                    break;
                };
                equal_id = Some(id);
                register.get_or_insert(reg);
            }
            "dec" | "inc" if insn.operands.len() == 1 && reg.is_some() => {
                let Some(next) = delta.checked_add(if op == "dec" { 1 } else { -1 }) else {
                    break;
                };
                delta = next;
                equal_id = Some(delta);
                register = register.or(reg);
            }
            "test"
                if insn.operands.len() == 2
                    && reg.is_some()
                    && insn.operands[0] == insn.operands[1] =>
            {
                equal_id = Some(delta);
                register = register.or(reg);
            }
            "je" | "jz" => {
                let (Some(id), Some(target)) = (equal_id, insn.branch_target()) else {
                    break;
                };
                let id = u16::try_from(id).ok()?;
                arms.push((id, target));
            }
            _ if insn.is_conditional_jump() && register.is_some() => {}
            _ => break,
        }
    }

    if arms.len() < config.min_chain_entries.max(1) {
        return None;
    }
    Some(DispatchIdiom::CompareChain {
        start_address: insns[i].address,
        register: register?,
        arms,
    })
}
