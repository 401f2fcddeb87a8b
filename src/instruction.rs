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

//! Typed model of one disassembled instruction.
//!
//! Instructions keep their operands as the text the disassembler printed. The
//! analysis passes ask for a typed [`Operand`] view on demand; the parser uses
//! the same routine to reject lines whose operand grammar is broken.

use std::fmt;

use crate::error::OperandError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    /// Full mnemonic including any prefixes, e.g. `rep stos`.
    pub mnemonic: String,
    pub operands: Vec<String>,
    /// Raw encoding as printed in the byte column.
    pub bytes: Vec<u8>,
}

impl Instruction {
    pub fn new(address: u64, mnemonic: &str, operands: Vec<String>, bytes: Vec<u8>) -> Self {
        Self {
            address,
            mnemonic: mnemonic.to_string(),
            operands,
            bytes,
        }
    }

    pub fn encoded_length(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Address of the byte following this instruction.
    pub fn end_address(&self) -> u64 {
        self.address + self.encoded_length()
    }

    /// The mnemonic without prefixes (`rep stos` -> `stos`).
    pub fn opcode(&self) -> &str {
        self.mnemonic
            .rsplit(' ')
            .next()
            .unwrap_or(self.mnemonic.as_str())
    }

    pub fn operand(&self, index: usize) -> Option<Operand> {
        self.operands
            .get(index)
            .and_then(|text| Operand::parse(text).ok())
    }

    pub fn is_return(&self) -> bool {
        matches!(self.opcode(), "ret" | "retn" | "retf" | "iret" | "iretd" | "iretq")
    }

    pub fn is_call(&self) -> bool {
        self.opcode() == "call"
    }

    pub fn is_unconditional_jump(&self) -> bool {
        self.opcode() == "jmp"
    }

    pub fn is_conditional_jump(&self) -> bool {
        let op = self.opcode();
        (op.starts_with('j') && op != "jmp") || op.starts_with("loop")
    }

    /// Instructions after which execution never falls through.
    pub fn is_trap(&self) -> bool {
        matches!(self.opcode(), "int3" | "hlt" | "ud2" | "(bad)")
    }

    /// Direct branch destination, if the first operand is one.
    pub fn branch_target(&self) -> Option<u64> {
        match self.operand(0) {
            Some(Operand::Target(addr)) => Some(addr),
            _ => None,
        }
    }

    /// Register written by the first operand, if it is a register.
    pub fn destination_register(&self) -> Option<String> {
        match self.operand(0) {
            Some(Operand::Register(name)) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}: {} {}",
            self.address,
            self.mnemonic,
            self.operands.join(",")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Register(String),
    Immediate(i64),
    Memory(MemoryOperand),
    /// Bare hex address printed for direct branches and calls.
    Target(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemoryOperand {
    /// `BYTE`, `WORD`, `DWORD`, `QWORD`...
    pub size: Option<String>,
    pub segment: Option<String>,
    pub base: Option<String>,
    pub index: Option<String>,
    pub scale: u8,
    pub displacement: i64,
}

impl MemoryOperand {
    /// Width in bytes implied by the size keyword.
    pub fn width(&self) -> Option<u32> {
        match self.size.as_deref()? {
            "BYTE" => Some(1),
            "WORD" => Some(2),
            "DWORD" => Some(4),
            "FWORD" => Some(6),
            "QWORD" => Some(8),
            "TBYTE" => Some(10),
            "XMMWORD" | "OWORD" => Some(16),
            "YMMWORD" => Some(32),
            _ => None,
        }
    }
}

impl Operand {
    pub fn parse(text: &str) -> Result<Operand, OperandError> {
        let s = strip_annotations(text);
        if s.is_empty() {
            return Err(OperandError::Empty);
        }

        if s.contains('[') || s.contains(']') || s.contains(" PTR ") || has_segment_prefix(&s) {
            return parse_memory(&s).map(Operand::Memory);
        }

        if s.starts_with("0x") || s.starts_with("-0x") {
            return parse_number(&s)
                .map(Operand::Immediate)
                .ok_or_else(|| OperandError::BadNumber(s.clone()));
        }

        if s.chars().all(|c| c.is_ascii_hexdigit()) {
            return u64::from_str_radix(&s, 16)
                .map(Operand::Target)
                .map_err(|_| OperandError::BadNumber(s.clone()));
        }

        let register_like = s
            .chars()
            .next()
            .map(|c| c.is_ascii_lowercase())
            .unwrap_or(false)
            && s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '(' || c == ')');
        if register_like {
            return Ok(Operand::Register(s));
        }

        Err(OperandError::Unrecognized(s))
    }

    pub fn as_immediate(&self) -> Option<i64> {
        match self {
            Operand::Immediate(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_register(&self) -> Option<&str> {
        match self {
            Operand::Register(name) => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn as_memory(&self) -> Option<&MemoryOperand> {
        match self {
            Operand::Memory(mem) => Some(mem),
            _ => None,
        }
    }
}

/// Drops `<symbol+0x10>` annotations and `# comment` tails.
fn strip_annotations(text: &str) -> String {
    let without_comment = match text.find('#') {
        Some(idx) => &text[..idx],
        None => text,
    };
    let mut out = String::with_capacity(without_comment.len());
    let mut depth = 0usize;
    for c in without_comment.chars() {
        match c {
            '<' => depth += 1,
            '>' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}

fn has_segment_prefix(s: &str) -> bool {
    ["cs:", "ds:", "es:", "fs:", "gs:", "ss:"]
        .iter()
        .any(|seg| s.starts_with(seg))
}

fn parse_number(s: &str) -> Option<i64> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = match digits.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok()? as i64,
        None => digits.parse::<u64>().ok()? as i64,
    };
    Some(if negative { value.wrapping_neg() } else { value })
}

fn parse_memory(s: &str) -> Result<MemoryOperand, OperandError> {
    let mut mem = MemoryOperand {
        scale: 1,
        ..Default::default()
    };

    let mut rest = s;
    if let Some(idx) = rest.find(" PTR ") {
        mem.size = Some(rest[..idx].trim().to_string());
        rest = rest[idx + " PTR ".len()..].trim();
    }
    if has_segment_prefix(rest) {
        mem.segment = Some(rest[..2].to_string());
        rest = &rest[3..];
    }

    let opens = rest.matches('[').count();
    let closes = rest.matches(']').count();
    if opens != closes || opens > 1 {
        return Err(OperandError::UnbalancedBrackets(s.to_string()));
    }

    if opens == 0 {
        // Absolute form, e.g. `ds:0x401000`.
        mem.displacement =
            parse_number(rest).ok_or_else(|| OperandError::BadNumber(rest.to_string()))?;
        return Ok(mem);
    }

    if !rest.starts_with('[') || !rest.ends_with(']') {
        return Err(OperandError::UnbalancedBrackets(s.to_string()));
    }
    let expr = &rest[1..rest.len() - 1];
    if expr.trim().is_empty() {
        return Err(OperandError::Empty);
    }

    for (negative, term) in split_terms(expr) {
        let term = term.trim();
        if term.is_empty() {
            return Err(OperandError::Unrecognized(expr.to_string()));
        }
        if let Some((reg, scale)) = term.split_once('*') {
            let scale: u8 = scale
                .trim()
                .parse()
                .map_err(|_| OperandError::BadScale(term.to_string()))?;
            if !matches!(scale, 1 | 2 | 4 | 8) || negative || mem.index.is_some() {
                return Err(OperandError::BadScale(term.to_string()));
            }
            mem.index = Some(reg.trim().to_string());
            mem.scale = scale;
        } else if term.starts_with("0x") || term.chars().all(|c| c.is_ascii_digit()) {
            let value =
                parse_number(term).ok_or_else(|| OperandError::BadNumber(term.to_string()))?;
            mem.displacement = if negative {
                mem.displacement.wrapping_sub(value)
            } else {
                mem.displacement.wrapping_add(value)
            };
        } else if term.chars().all(|c| c.is_ascii_alphanumeric()) && !negative {
            if mem.base.is_none() {
                mem.base = Some(term.to_string());
            } else if mem.index.is_none() {
                mem.index = Some(term.to_string());
            } else {
                return Err(OperandError::Unrecognized(expr.to_string()));
            }
        } else {
            return Err(OperandError::Unrecognized(expr.to_string()));
        }
    }
    Ok(mem)
}

/// Splits `ebp-0x8+eax*4` into signed terms.
fn split_terms(expr: &str) -> Vec<(bool, &str)> {
    let mut terms = Vec::new();
    let mut negative = false;
    let mut start = 0;
    for (i, c) in expr.char_indices() {
        if c == '+' || c == '-' {
            if i > 0 {
                terms.push((negative, &expr[start..i]));
            }
            negative = c == '-';
            start = i + 1;
        }
    }
    terms.push((negative, &expr[start..]));
    terms
}

/// Maps any x86 register name onto the name of its full-width family, so
/// that `al`, `ax`, `eax` and `rax` compare equal.
pub fn register_family(name: &str) -> Option<&'static str> {
    let family = match name {
        "al" | "ah" | "ax" | "eax" | "rax" => "ax",
        "bl" | "bh" | "bx" | "ebx" | "rbx" => "bx",
        "cl" | "ch" | "cx" | "ecx" | "rcx" => "cx",
        "dl" | "dh" | "dx" | "edx" | "rdx" => "dx",
        "sil" | "si" | "esi" | "rsi" => "si",
        "dil" | "di" | "edi" | "rdi" => "di",
        "bpl" | "bp" | "ebp" | "rbp" => "bp",
        "spl" | "sp" | "esp" | "rsp" => "sp",
        "ip" | "eip" | "rip" => "ip",
        _ => return extended_family(name),
    };
    Some(family)
}

fn extended_family(name: &str) -> Option<&'static str> {
    const FAMILIES: [&str; 8] = ["r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15"];
    let trimmed = name.trim_end_matches(['b', 'w', 'd', 'l']);
    FAMILIES.iter().copied().find(|f| *f == trimmed)
}

/// Width in bits of a general purpose register.
pub fn register_width(name: &str) -> Option<u32> {
    match name {
        "al" | "ah" | "bl" | "bh" | "cl" | "ch" | "dl" | "dh" | "sil" | "dil" | "bpl"
        | "spl" => Some(8),
        "ax" | "bx" | "cx" | "dx" | "si" | "di" | "bp" | "sp" | "ip" => Some(16),
        "eax" | "ebx" | "ecx" | "edx" | "esi" | "edi" | "ebp" | "esp" | "eip" => Some(32),
        "rax" | "rbx" | "rcx" | "rdx" | "rsi" | "rdi" | "rbp" | "rsp" | "rip" => Some(64),
        _ => {
            extended_family(name)?;
            match name.chars().last() {
                Some('b') | Some('l') => Some(8),
                Some('w') => Some(16),
                Some('d') => Some(32),
                _ => Some(64),
            }
        }
    }
}

pub fn same_register(a: &str, b: &str) -> bool {
    match (register_family(a), register_family(b)) {
        (Some(fa), Some(fb)) => fa == fb,
        _ => a == b,
    }
}

/// Reinterprets an immediate at the width of the register it is combined with.
/// objdump prints `add esp,0xfffffff8` for a sign-extended `-8`.
pub fn signed_at_width(value: i64, bits: u32) -> i64 {
    match bits {
        8 => value as u8 as i8 as i64,
        16 => value as u16 as i16 as i64,
        32 => value as u32 as i32 as i64,
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_frame_slot() {
        let op = Operand::parse("DWORD PTR [ebp-0x8]").unwrap();
        let mem = op.as_memory().unwrap();
        assert_eq!(mem.size.as_deref(), Some("DWORD"));
        assert_eq!(mem.base.as_deref(), Some("ebp"));
        assert_eq!(mem.displacement, -8);
        assert_eq!(mem.width(), Some(4));
    }

    #[test]
    fn parses_scaled_table_reference() {
        let op = Operand::parse("DWORD PTR [eax*4+0x401100]").unwrap();
        let mem = op.as_memory().unwrap();
        assert_eq!(mem.base, None);
        assert_eq!(mem.index.as_deref(), Some("eax"));
        assert_eq!(mem.scale, 4);
        assert_eq!(mem.displacement, 0x401100);
    }

    #[test]
    fn parses_base_index_and_segment() {
        let op = Operand::parse("BYTE PTR ds:[ecx+edx*1+0x10]").unwrap();
        let mem = op.as_memory().unwrap();
        assert_eq!(mem.segment.as_deref(), Some("ds"));
        assert_eq!(mem.base.as_deref(), Some("ecx"));
        assert_eq!(mem.index.as_deref(), Some("edx"));
        assert_eq!(mem.scale, 1);
        assert_eq!(mem.displacement, 0x10);

        let abs = Operand::parse("ds:0x401000").unwrap();
        assert_eq!(abs.as_memory().unwrap().displacement, 0x401000);
    }

    #[test]
    fn parses_immediates_and_targets() {
        assert_eq!(Operand::parse("0xa").unwrap(), Operand::Immediate(10));
        assert_eq!(Operand::parse("-0x10").unwrap(), Operand::Immediate(-16));
        assert_eq!(
            Operand::parse("401234 <handler+0x4>").unwrap(),
            Operand::Target(0x401234)
        );
        assert_eq!(
            Operand::parse("eax").unwrap(),
            Operand::Register("eax".to_string())
        );
    }

    #[test]
    fn strips_trailing_comment() {
        let op = Operand::parse("[rip+0x2e0b]        # 403010 <_edata>").unwrap();
        let mem = op.as_memory().unwrap();
        assert_eq!(mem.base.as_deref(), Some("rip"));
        assert_eq!(mem.displacement, 0x2e0b);
    }

    #[test]
    fn rejects_malformed_memory() {
        assert!(matches!(
            Operand::parse("DWORD PTR [ebp-0x8"),
            Err(OperandError::UnbalancedBrackets(_))
        ));
        assert!(matches!(
            Operand::parse("[eax*3+0x10]"),
            Err(OperandError::BadScale(_))
        ));
        assert!(Operand::parse("[ebp-zz!]").is_err());
    }

    #[test]
    fn register_families_match_across_widths() {
        assert!(same_register("al", "rax"));
        assert!(same_register("r8d", "r8"));
        assert!(!same_register("ecx", "edx"));
        assert_eq!(register_width("r10w"), Some(16));
        assert_eq!(register_width("esp"), Some(32));
    }

    #[test]
    fn sign_extends_by_register_width() {
        assert_eq!(signed_at_width(0xfffffff8, 32), -8);
        assert_eq!(signed_at_width(0x8, 32), 8);
        assert_eq!(signed_at_width(0xfffffffffffffff0u64 as i64, 64), -16);
    }

    #[test]
    fn classifies_control_flow() {
        let ret = Instruction::new(0x10, "ret", vec![], vec![0xc3]);
        assert!(ret.is_return());
        let je = Instruction::new(0x11, "je", vec!["401020 <f+0x20>".into()], vec![0x74, 0x0d]);
        assert!(je.is_conditional_jump());
        assert_eq!(je.branch_target(), Some(0x401020));
        assert_eq!(je.end_address(), 0x13);
        let prefixed = Instruction::new(0x13, "bnd jmp", vec!["401000".into()], vec![0xf2, 0xeb, 0x00]);
        assert!(prefixed.is_unconditional_jump());
    }
}
