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

/// The address-ordered instruction listing built from a disassembly stream.
///
/// Besides the instructions themselves the listing doubles as a sparse image
/// of the code section: jump tables that the compiler placed between
/// functions show up as garbage instructions, but their bytes are intact and
/// can be read back with [`DisassemblyListing::read_u8`] and friends.
use std::collections::BTreeMap;

use log::debug;

use crate::instruction::Instruction;
use crate::parser::ParsedLine;

#[derive(Debug, Default)]
pub struct DisassemblyListing {
    pub instructions: Vec<Instruction>,
    pub addr_map: BTreeMap<u64, usize>, // address to index in instructions
}

impl DisassemblyListing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a listing from instructions in any order. Later duplicates of an
    /// address are dropped.
    pub fn from_instructions(instructions: Vec<Instruction>) -> Self {
        let mut builder = ListingBuilder::new();
        for insn in instructions {
            builder.push(insn);
        }
        builder.finish()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn index_of(&self, address: u64) -> Option<usize> {
        self.addr_map.get(&address).copied()
    }

    pub fn get_by_addr(&self, address: u64) -> Option<&Instruction> {
        self.index_of(address).map(|ix| &self.instructions[ix])
    }

    /// Instructions from `start` (inclusive) up to `end` (exclusive), at most
    /// `limit` of them.
    pub fn span(&self, start: u64, end: Option<u64>, limit: usize) -> &[Instruction] {
        let Some(first) = self.index_of(start) else {
            return &[];
        };
        let mut last = first;
        while last < self.instructions.len()
            && last - first < limit
            && end.map_or(true, |end| self.instructions[last].address < end)
        {
            last += 1;
        }
        &self.instructions[first..last]
    }

    /// The instruction whose encoding covers `address`.
    pub fn containing(&self, address: u64) -> Option<&Instruction> {
        let (_, &ix) = self.addr_map.range(..=address).next_back()?;
        let insn = &self.instructions[ix];
        (address < insn.end_address()).then_some(insn)
    }

    pub fn read_u8(&self, address: u64) -> Option<u8> {
        let insn = self.containing(address)?;
        insn.bytes.get((address - insn.address) as usize).copied()
    }

    /// Little-endian read of `width` bytes (1..=8).
    pub fn read_le(&self, address: u64, width: u32) -> Option<u64> {
        let mut value = 0u64;
        for i in 0..width as u64 {
            let byte = self.read_u8(address.checked_add(i)?)?;
            value |= (byte as u64) << (8 * i);
        }
        Some(value)
    }
}

/// Collects parsed lines into a listing. An instruction is only committed
/// once the next line shows that no more continuation bytes follow.
#[derive(Debug, Default)]
pub struct ListingBuilder {
    committed: Vec<Instruction>,
    pending: Option<Instruction>,
}

impl ListingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, line: ParsedLine) {
        match line {
            ParsedLine::Instruction(insn) => self.push(insn),
            ParsedLine::Continuation { address, bytes } => match self.pending.as_mut() {
                Some(pending) if pending.end_address() == address => {
                    pending.bytes.extend_from_slice(&bytes);
                }
                _ => debug!("Dropping stray continuation bytes at 0x{:x}", address),
            },
            ParsedLine::Skipped | ParsedLine::Error(_) => self.commit(),
        }
    }

    pub fn push(&mut self, insn: Instruction) {
        self.commit();
        self.pending = Some(insn);
    }

    fn commit(&mut self) {
        if let Some(insn) = self.pending.take() {
            self.committed.push(insn);
        }
    }

    pub fn instruction_count(&self) -> usize {
        self.committed.len() + usize::from(self.pending.is_some())
    }

    pub fn finish(mut self) -> DisassemblyListing {
        self.commit();
        let mut instructions = self.committed;
        // Sections are listed one after another, keep the within-address order stable.
        instructions.sort_by_key(|insn| insn.address);
        instructions.dedup_by_key(|insn| insn.address);

        let addr_map = instructions
            .iter()
            .enumerate()
            .map(|(ix, insn)| (insn.address, ix))
            .collect();
        DisassemblyListing {
            instructions,
            addr_map,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::LineParser;

    fn listing_from(text: &str) -> DisassemblyListing {
        let mut parser = LineParser::new();
        let mut builder = ListingBuilder::new();
        for line in text.lines() {
            builder.feed(parser.parse_next(line));
        }
        builder.finish()
    }

    const SAMPLE: &str = "\
00401000 <_start>:
  401000:\t55                   \tpush   ebp
  401001:\t8b ec                \tmov    ebp,esp
  401003:\tc7 05 00 20 40 00 0a \tmov    DWORD PTR ds:0x402000,0xa
  40100a:\t00 00 00
  40100d:\tc3                   \tret
";

    #[test]
    fn merges_continuation_bytes() {
        let listing = listing_from(SAMPLE);
        assert_eq!(listing.len(), 4);
        let mov = listing.get_by_addr(0x401003).unwrap();
        assert_eq!(mov.encoded_length(), 10);
        assert_eq!(mov.end_address(), 0x40100d);
    }

    #[test]
    fn reads_bytes_across_instructions() {
        let listing = listing_from(SAMPLE);
        assert_eq!(listing.read_u8(0x401000), Some(0x55));
        // 8b ec | c7 05
        assert_eq!(listing.read_le(0x401001, 4), Some(0x05c7_ec8b));
        assert_eq!(listing.read_u8(0x40100e), None);
        assert_eq!(listing.read_le(0x40100c, 4), None);
    }

    #[test]
    fn span_stops_at_boundary_and_limit() {
        let listing = listing_from(SAMPLE);
        assert_eq!(listing.span(0x401001, Some(0x40100d), 100).len(), 2);
        assert_eq!(listing.span(0x401000, None, 3).len(), 3);
        assert!(listing.span(0x401002, None, 3).is_empty());
    }

    #[test]
    fn sorts_out_of_order_sections() {
        let listing = DisassemblyListing::from_instructions(vec![
            Instruction::new(0x2000, "ret", vec![], vec![0xc3]),
            Instruction::new(0x1000, "nop", vec![], vec![0x90]),
            Instruction::new(0x1000, "int3", vec![], vec![0xcc]),
        ]);
        assert_eq!(listing.len(), 2);
        assert_eq!(listing.instructions[0].mnemonic, "nop");
        assert_eq!(listing.index_of(0x2000), Some(1));
    }
}
