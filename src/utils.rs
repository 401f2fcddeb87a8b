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

use std::env;
use std::path::Path;

/// Absolute, forward-slashed form of `path` for log lines and output headers.
/// Falls back to the path as given when it does not exist.
pub fn display_path(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().unwrap_or_default().join(path)
    };

    // dunce strips the \\?\ prefix std::fs::canonicalize adds on Windows
    let canonical = dunce::canonicalize(&absolute).unwrap_or(absolute);
    let mut display = canonical.to_string_lossy().replace('\\', "/");

    // C:/ not c:/
    if cfg!(windows) && display.chars().nth(1) == Some(':') {
        if let Some(drive) = display.chars().next() {
            display = format!("{}{}", drive.to_ascii_uppercase(), &display[1..]);
        }
    }
    display
}
