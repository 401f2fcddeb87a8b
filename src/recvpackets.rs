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

/// Output formats for a finished analysis.
///
/// The text form is the `recvpackets.txt` table emulators read:
/// ```text
/// # client.exe
/// 0064 10
/// 0065 -1
/// default -1
/// ```
use std::fmt::Write;

use serde_json::{json, Value};

use crate::handler::PacketLength;

pub fn render_recvpackets(results: &[PacketLength], source: &str) -> String {
    let mut sorted = results.to_vec();
    sorted.sort();

    let mut out = String::with_capacity(16 * (sorted.len() + 2));
    let _ = writeln!(out, "# {}", source);
    for p in &sorted {
        let _ = writeln!(out, "{:04X} {}", p.packet_id, p.length);
    }
    let _ = writeln!(out, "default {}", PacketLength::VARIABLE);
    out
}

/// JSON form, `length` is `null` for variable-length packets.
pub fn serialize_results(results: &[PacketLength], source: &str, idiom: Option<&str>) -> Value {
    let packets: Vec<Value> = results
        .iter()
        .map(|p| {
            json!({
                "id": format!("0x{:04x}", p.packet_id),
                "length": (!p.is_variable()).then_some(p.length),
            })
        })
        .collect();

    json!({
        "source": source,
        "dispatch": idiom,
        "packets": Value::Array(packets),
    })
}
