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

//! Command line front end: runs one analysis, polls it like an interactive
//! client would, and writes the packet table.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use packet_extractor::debug::init_logging;
use packet_extractor::recvpackets::{render_recvpackets, serialize_results};
use packet_extractor::utils::display_path;
use packet_extractor::{AnalysisHandle, AnalyzerConfig, RunState};

#[derive(Parser, Debug)]
#[command(version, about = "Extract packet lengths from a client executable")]
struct Cli {
    /// Executable to analyze
    target: PathBuf,

    /// Disassembler to run instead of `objdump` from PATH
    #[arg(long = "objdump")]
    objdump: Option<PathBuf>,

    /// Disassembler argument placed before the target (repeatable, replaces the defaults)
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// JSON analyzer configuration
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Write the result here instead of stdout
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Print JSON instead of the recvpackets table
    #[arg(long = "json", default_value_t = false)]
    json: bool,

    /// Enable debug output
    #[arg(short = 'd', long = "debug", default_value_t = false)]
    debug: bool,

    /// How often to poll the running analysis, in milliseconds
    #[arg(long = "poll-ms", default_value_t = 100)]
    poll_ms: u64,
}

fn load_config(cli: &Cli) -> Result<AnalyzerConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            AnalyzerConfig::from_json(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => AnalyzerConfig::default(),
    };
    if let Some(objdump) = &cli.objdump {
        config = config.with_disassembler(objdump.clone());
    }
    if !cli.args.is_empty() {
        config = config.with_args(cli.args.iter().cloned());
    }
    Ok(config)
}

/// Fails before the disassembler is spawned when the target is missing.
fn check_target(target: &Path) -> Result<()> {
    if !target.is_file() {
        bail!("target {} does not exist or is not a file", target.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _logger = init_logging(cli.debug).context("starting logger")?;
    let config = load_config(&cli)?;
    check_target(&cli.target)?;

    let handle = AnalysisHandle::new(config, cli.target.clone());
    handle.start();

    let poll = Duration::from_millis(cli.poll_ms.max(1));
    let mut shown = 0u8;
    while handle.state() == RunState::Running {
        let progress = handle.progress();
        if progress >= shown.saturating_add(10) {
            info!("{}%", progress);
            shown = progress;
        }
        thread::sleep(poll);
    }

    let issues = handle.parse_issues();
    if !issues.is_empty() {
        warn!("{} lines of disassembly could not be parsed", issues.len());
    }

    match handle.wait() {
        RunState::Done => {}
        _ => match handle.error() {
            Some(e) => bail!("analysis failed: {}", e),
            None => bail!("analysis ended without a result"),
        },
    }

    let results = handle.results().unwrap_or_default();
    let source = display_path(&cli.target);
    let text = if cli.json {
        let value = serialize_results(&results, &source, handle.idiom());
        serde_json::to_string_pretty(&value)? + "\n"
    } else {
        render_recvpackets(&results, &source)
    };

    match &cli.output {
        Some(path) => {
            fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
            info!("Saved {} packets to {}", results.len(), display_path(path));
        }
        None => print!("{}", text),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_target_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("client.exe");
        let err = check_target(&missing).unwrap_err();
        assert!(err.to_string().contains("client.exe"), "{}", err);
        assert!(check_target(dir.path()).is_err());

        let present = tempfile::NamedTempFile::new().unwrap();
        assert!(check_target(present.path()).is_ok());
    }
}
