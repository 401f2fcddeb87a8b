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

/// Run configuration. Everything the engine needs is passed in explicitly;
/// nothing is looked up from the environment.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What to do with the disassembler's standard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    #[default]
    Discard,
    Inherit,
    /// Drain on a helper thread and forward each line to the debug log.
    Log,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisassemblerConfig {
    pub path: PathBuf,
    /// Arguments placed before the target path.
    pub args: Vec<String>,
    pub stderr: StderrMode,
}

impl Default for DisassemblerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("objdump"),
            args: vec!["-d".into(), "-z".into(), "-M".into(), "intel".into()],
            stderr: StderrMode::Discard,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub disassembler: DisassemblerConfig,
    /// How many instructions before a dispatch jump are searched for the
    /// bounds check, index table load and rebase.
    pub lookback_window: usize,
    /// Fewest `je` arms before a compare chain counts as a dispatch.
    pub min_chain_entries: usize,
    pub max_handler_instructions: usize,
    pub min_packet_length: i64,
    pub max_packet_length: i64,
    /// Rough objdump text bytes produced per byte of machine code.
    pub output_bytes_per_code_byte: u64,
    pub max_recorded_parse_issues: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            disassembler: DisassemblerConfig::default(),
            lookback_window: 12,
            min_chain_entries: 3,
            max_handler_instructions: 256,
            min_packet_length: 2,
            max_packet_length: 0xffff,
            output_bytes_per_code_byte: 14,
            max_recorded_parse_issues: 100,
        }
    }
}

impl AnalyzerConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn with_disassembler(mut self, path: impl Into<PathBuf>) -> Self {
        self.disassembler.path = path.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disassembler.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_request_intel_listing() {
        let cfg = AnalyzerConfig::default();
        assert_eq!(cfg.disassembler.path, PathBuf::from("objdump"));
        assert_eq!(cfg.disassembler.args, vec!["-d", "-z", "-M", "intel"]);
        assert_eq!(cfg.disassembler.stderr, StderrMode::Discard);
        // Zero runs inside jump tables must be listed, not elided as `...`.
        assert!(cfg.disassembler.args.iter().any(|a| a == "-z"));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = AnalyzerConfig::from_json(
            r#"{ "disassembler": { "path": "/opt/binutils/objdump", "stderr": "log" },
                 "min_chain_entries": 5 }"#,
        )
        .unwrap();
        assert_eq!(cfg.disassembler.path, PathBuf::from("/opt/binutils/objdump"));
        assert_eq!(cfg.disassembler.args, vec!["-d", "-z", "-M", "intel"]);
        assert_eq!(cfg.disassembler.stderr, StderrMode::Log);
        assert_eq!(cfg.min_chain_entries, 5);
        assert_eq!(cfg.lookback_window, 12);
    }

    #[test]
    fn builder_overrides() {
        let cfg = AnalyzerConfig::default()
            .with_disassembler("/bin/sh")
            .with_args(["-c", "cat \"$0\""]);
        assert_eq!(cfg.disassembler.path, PathBuf::from("/bin/sh"));
        assert_eq!(cfg.disassembler.args.len(), 2);
    }
}
