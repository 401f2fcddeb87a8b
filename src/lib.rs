// Crate root: declare modules and control visibility
pub mod binary_info;
pub mod config;
pub mod debug;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod handler;
pub mod instruction;
pub mod listing;
pub mod parser;
pub mod process;
pub mod recvpackets;
pub mod utils;

// Re-export commonly used API from the library for binaries/tests
pub use config::{AnalyzerConfig, DisassemblerConfig, StderrMode};
pub use engine::{analyze_listing, start_analysis, Analysis, AnalysisHandle, RunState};
pub use error::{AnalysisError, ErrorKind, LaunchError, ParseError};
pub use handler::PacketLength;
