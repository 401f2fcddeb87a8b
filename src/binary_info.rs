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

//! What we know about the target executable before the disassembler runs.
//! Used to size the progress estimate and to pick the jump table entry width.

use std::fs;
use std::path::Path;

use log::debug;
use memmap2::Mmap;
use object::{Object, ObjectSection, SectionKind};

/// Used when the target cannot even be stat'ed.
const FALLBACK_CODE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryInfo {
    /// Sum of executable section sizes, or the file size if unknown.
    pub code_bytes: u64,
    /// 4 or 8 when the format was recognized.
    pub pointer_width: Option<u32>,
    /// Whether `code_bytes` came from real section headers.
    pub parsed: bool,
}

impl BinaryInfo {
    pub fn inspect(path: &Path) -> Self {
        match Self::from_object(path) {
            Ok(info) => info,
            Err(e) => {
                debug!("Could not parse {} as an object file: {}", path.display(), e);
                let code_bytes = fs::metadata(path)
                    .map(|m| m.len())
                    .unwrap_or(FALLBACK_CODE_BYTES);
                Self {
                    code_bytes,
                    pointer_width: None,
                    parsed: false,
                }
            }
        }
    }

    fn from_object(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let file = fs::File::open(path)?;
        // SAFETY: the mapping is read-only and dropped before this returns.
        let data = unsafe { Mmap::map(&file)? };
        let obj = object::File::parse(&*data)?;

        let code_bytes = obj
            .sections()
            .filter(|s| s.kind() == SectionKind::Text)
            .map(|s| s.size())
            .sum();

        Ok(Self {
            code_bytes,
            pointer_width: Some(if obj.is_64() { 8 } else { 4 }),
            parsed: true,
        })
    }

    /// Expected number of bytes of disassembler output.
    pub fn estimated_output_bytes(&self, bytes_per_code_byte: u64) -> u64 {
        self.code_bytes.saturating_mul(bytes_per_code_byte).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn unparseable_file_falls_back_to_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 300]).unwrap();
        let info = BinaryInfo::inspect(file.path());
        assert!(!info.parsed);
        assert_eq!(info.code_bytes, 300);
        assert_eq!(info.pointer_width, None);
        assert_eq!(info.estimated_output_bytes(14), 4200);
    }

    #[test]
    fn missing_file_uses_fixed_guess() {
        let info = BinaryInfo::inspect(Path::new("/definitely/not/here.exe"));
        assert!(!info.parsed);
        assert_eq!(info.code_bytes, FALLBACK_CODE_BYTES);
    }

    #[test]
    fn own_test_binary_has_code() {
        let exe = std::env::current_exe().unwrap();
        let info = BinaryInfo::inspect(&exe);
        assert!(info.parsed);
        assert!(info.code_bytes > 0);
        assert!(matches!(info.pointer_width, Some(4) | Some(8)));
    }
}
