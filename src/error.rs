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

//! Error taxonomy for an analysis run.
//!
//! Only [`AnalysisError`] ends a run. [`ParseError`] is recorded per line and
//! the line is skipped; an undeterminable handler length is a result value,
//! not an error at all.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OperandError {
    #[error("empty operand")]
    Empty,
    #[error("unbalanced brackets in `{0}`")]
    UnbalancedBrackets(String),
    #[error("invalid scale in `{0}`")]
    BadScale(String),
    #[error("invalid number `{0}`")]
    BadNumber(String),
    #[error("unrecognized operand `{0}`")]
    Unrecognized(String),
}

/// A line that looked like an instruction but could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line_number}: {reason}: {line}")]
pub struct ParseError {
    pub line_number: u64,
    pub line: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("disassembler not found at {}", .0.display())]
    NotFound(PathBuf),
    #[error("permission denied launching {}", .0.display())]
    PermissionDenied(PathBuf),
    #[error("unable to launch the disassembler {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("disassembler {} produced no readable output stream", .0.display())]
    NoOutput(PathBuf),
}

impl LaunchError {
    pub fn from_spawn(path: PathBuf, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => LaunchError::NotFound(path),
            io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied(path),
            _ => LaunchError::Spawn { path, source },
        }
    }
}

/// Coarse classification callers use to pick a message or suppress a dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ErrorKind {
    Launch,
    DispatchNotFound,
    ProcessFailed,
    Cancelled,
    Io,
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("could not find the packet dispatch table: {0}")]
    DispatchNotFound(String),
    #[error(
        "malformed dispatch table: packet {packet_id:#06x} maps to both {first:#x} and {second:#x}"
    )]
    DuplicatePacketId {
        packet_id: u16,
        first: u64,
        second: u64,
    },
    #[error("disassembler failed: {0}")]
    ProcessFailed(String),
    #[error("cancelled by user")]
    Cancelled,
    #[error("i/o error while reading disassembly: {0}")]
    Io(#[from] io::Error),
}

impl AnalysisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::Launch(_) => ErrorKind::Launch,
            AnalysisError::DispatchNotFound(_) | AnalysisError::DuplicatePacketId { .. } => {
                ErrorKind::DispatchNotFound
            }
            AnalysisError::ProcessFailed(_) => ErrorKind::ProcessFailed,
            AnalysisError::Cancelled => ErrorKind::Cancelled,
            AnalysisError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AnalysisError::Cancelled)
    }
}
