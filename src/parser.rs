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

/// Line parser for `objdump -d -z -M intel` style listings.
///
/// One physical line goes in, one [`ParsedLine`] comes out. Instruction lines
/// look like
///
/// ```text
///   401000:	8b 44 24 04          	mov    eax,DWORD PTR [esp+0x4]
/// ```
///
/// and long encodings wrap onto continuation lines that carry only the
/// address and bytes. Everything else (file header, section banners, symbol
/// labels, blank lines) is skipped.
use regex::Regex;

use crate::error::ParseError;
use crate::instruction::{Instruction, Operand};

const PREFIXES: &[&str] = &[
    "rep", "repe", "repz", "repne", "repnz", "lock", "data16", "data32", "addr16", "addr32",
    "bnd", "notrack", "cs", "ds", "es", "fs", "gs", "ss", "rex",
];

/// objdump prints prefixes in mixed case (`rex.W`, `rex.WRB`).
fn is_prefix(word: &str) -> bool {
    PREFIXES.iter().any(|p| p.eq_ignore_ascii_case(word))
        || word
            .get(..4)
            .is_some_and(|head| head.eq_ignore_ascii_case("rex."))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Instruction(Instruction),
    /// Extra bytes of the previous instruction, wrapped onto their own line.
    Continuation { address: u64, bytes: Vec<u8> },
    Skipped,
    Error(ParseError),
}

pub struct LineParser {
    re_line: Regex,
    line_number: u64,
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LineParser {
    pub fn new() -> Self {
        Self {
            re_line: Regex::new(r"^\s*([0-9a-fA-F]+):\t([^\t]*)(?:\t(.*))?$")
                .expect("static instruction line pattern"),
            line_number: 0,
        }
    }

    /// Number of lines seen so far, including skipped ones.
    pub fn lines_seen(&self) -> u64 {
        self.line_number
    }

    pub fn parse_next(&mut self, raw_line: &str) -> ParsedLine {
        self.line_number += 1;
        let line = raw_line.trim_end_matches(['\r', '\n']);

        let Some(caps) = self.re_line.captures(line) else {
            return ParsedLine::Skipped;
        };

        let address = match u64::from_str_radix(&caps[1], 16) {
            Ok(addr) => addr,
            Err(_) => return self.error(line, "address out of range"),
        };

        let bytes = match parse_byte_column(&caps[2]) {
            Some(bytes) if !bytes.is_empty() => bytes,
            // objdump prints `\t...` for elided zero runs; no bytes, no instruction.
            Some(_) => return ParsedLine::Skipped,
            None => return self.error(line, "malformed byte column"),
        };

        let text = caps.get(3).map(|m| m.as_str().trim()).unwrap_or("");
        if text.is_empty() {
            return ParsedLine::Continuation { address, bytes };
        }

        match split_instruction_text(text) {
            Ok((mnemonic, operands)) => {
                ParsedLine::Instruction(Instruction::new(address, &mnemonic, operands, bytes))
            }
            Err(reason) => self.error(line, &reason),
        }
    }

    fn error(&self, line: &str, reason: &str) -> ParsedLine {
        ParsedLine::Error(ParseError {
            line_number: self.line_number,
            line: line.to_string(),
            reason: reason.to_string(),
        })
    }
}

fn parse_byte_column(column: &str) -> Option<Vec<u8>> {
    column
        .split_whitespace()
        .map(|pair| {
            if pair.len() == 2 {
                u8::from_str_radix(pair, 16).ok()
            } else {
                None
            }
        })
        .collect()
}

/// Splits `rep stos DWORD PTR es:[edi],eax` into the mnemonic and its operands,
/// validating each operand's grammar.
fn split_instruction_text(text: &str) -> Result<(String, Vec<String>), String> {
    let text = match text.find('#') {
        Some(idx) => text[..idx].trim_end(),
        None => text,
    };

    let mut words: Vec<&str> = Vec::new();
    let mut rest = text.trim();
    loop {
        let (word, tail) = match rest.find(char::is_whitespace) {
            Some(idx) => (&rest[..idx], rest[idx..].trim_start()),
            None => (rest, ""),
        };
        words.push(word);
        rest = tail;
        if tail.is_empty() || !is_prefix(word) {
            break;
        }
    }
    let mnemonic = words.join(" ");
    if mnemonic.is_empty() {
        return Err("missing mnemonic".to_string());
    }

    let operands = split_operands(rest);
    for op in &operands {
        Operand::parse(op).map_err(|e| e.to_string())?;
    }
    Ok((mnemonic, operands))
}

/// Splits at commas that are not inside `[...]` or `<...>`.
fn split_operands(text: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let mut operands = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '[' | '<' => {
                depth += 1;
                current.push(c);
            }
            ']' | '>' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth <= 0 => {
                operands.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    operands.push(current.trim().to_string());
    operands
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(line: &str) -> ParsedLine {
        LineParser::new().parse_next(line)
    }

    #[test]
    fn parses_instruction_line() {
        let ParsedLine::Instruction(insn) =
            parse("  401000:\t8b 44 24 04          \tmov    eax,DWORD PTR [esp+0x4]")
        else {
            panic!("expected instruction");
        };
        assert_eq!(insn.address, 0x401000);
        assert_eq!(insn.mnemonic, "mov");
        assert_eq!(insn.operands, vec!["eax", "DWORD PTR [esp+0x4]"]);
        assert_eq!(insn.bytes, vec![0x8b, 0x44, 0x24, 0x04]);
        assert_eq!(insn.encoded_length(), 4);
    }

    #[test]
    fn folds_prefixes_into_mnemonic() {
        let ParsedLine::Instruction(insn) =
            parse("  401010:\tf3 ab                \trep stos DWORD PTR es:[edi],eax")
        else {
            panic!("expected instruction");
        };
        assert_eq!(insn.mnemonic, "rep stos");
        assert_eq!(insn.opcode(), "stos");
        assert_eq!(insn.operands.len(), 2);
    }

    #[rstest]
    #[case("  401010:\t48 ff e0             \trex.W jmp rax", "rex.W jmp", "jmp")]
    #[case("  401010:\t4b ff e0             \trex.WXB jmp r8", "rex.WXB jmp", "jmp")]
    #[case("  401010:\tf0 0f c1 03          \tLOCK xadd DWORD PTR [ebx],eax", "LOCK xadd", "xadd")]
    fn prefixes_match_in_any_case(
        #[case] line: &str,
        #[case] mnemonic: &str,
        #[case] opcode: &str,
    ) {
        let ParsedLine::Instruction(insn) = parse(line) else {
            panic!("expected instruction");
        };
        assert_eq!(insn.mnemonic, mnemonic);
        assert_eq!(insn.opcode(), opcode);
    }

    #[test]
    fn keeps_branch_annotation_on_operand() {
        let ParsedLine::Instruction(insn) =
            parse("  401020:\t74 0e                \tje     401030 <_handler+0x10>")
        else {
            panic!("expected instruction");
        };
        assert_eq!(insn.branch_target(), Some(0x401030));
    }

    #[test]
    fn drops_trailing_comment() {
        let ParsedLine::Instruction(insn) =
            parse("  140001000:\t48 8d 05 09 2e 00 00 \tlea    rax,[rip+0x2e09]        # 140003e10 <table>")
        else {
            panic!("expected instruction");
        };
        assert_eq!(insn.operands, vec!["rax", "[rip+0x2e09]"]);
    }

    #[test]
    fn continuation_carries_only_bytes() {
        assert_eq!(
            parse("  401007:\t00 00 00 "),
            ParsedLine::Continuation {
                address: 0x401007,
                bytes: vec![0, 0, 0]
            }
        );
    }

    #[rstest]
    #[case("")]
    #[case("test.exe:     file format pei-i386")]
    #[case("Disassembly of section .text:")]
    #[case("00401000 <_mainCRTStartup>:")]
    #[case("\t...")]
    fn non_instruction_lines_are_skipped(#[case] line: &str) {
        assert_eq!(parse(line), ParsedLine::Skipped);
    }

    #[rstest]
    #[case("  401000:\tzz 44          \tmov    eax,ebx", "malformed byte column")]
    #[case("  401000:\t8b 45 f8       \tmov    eax,DWORD PTR [ebp-0x8", "unbalanced")]
    #[case("  401000:\tff 24 b5 00 11 40 00 \tjmp    DWORD PTR [esi*3+0x401100]", "scale")]
    fn malformed_instruction_lines_are_errors(#[case] line: &str, #[case] reason: &str) {
        match parse(line) {
            ParsedLine::Error(err) => {
                assert_eq!(err.line_number, 1);
                assert!(err.reason.contains(reason), "reason was {}", err.reason);
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn same_malformed_line_gives_equal_errors() {
        let line = "  401000:\t8b 45 f8       \tmov    eax,DWORD PTR [ebp-0x8";
        let first = parse(line);
        assert!(matches!(first, ParsedLine::Error(_)));
        assert_eq!(first, parse(line));
        assert_ne!(first, LineParser::new().parse_next("  401000:\tzz\tnop"));
    }

    #[test]
    fn bad_opcode_is_an_instruction() {
        let ParsedLine::Instruction(insn) = parse("  401100:\tff ff                \t(bad)") else {
            panic!("expected instruction");
        };
        assert!(insn.operands.is_empty());
        assert!(insn.is_trap());
    }

    #[test]
    fn counts_lines() {
        let mut parser = LineParser::new();
        parser.parse_next("");
        parser.parse_next("  401000:\t90                   \tnop");
        assert_eq!(parser.lines_seen(), 2);
    }
}
