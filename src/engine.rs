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

//! Analysis run: drives the disassembler on a worker thread and exposes
//! pollable state, progress and results.
//!
//! ```text
//! NotStarted --start--> Running --+--> Done
//!                                 +--> Failed
//! ```
//!
//! All fields a caller can observe live behind one mutex. The worker is the
//! only writer; once the run is terminal nothing changes any more.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, info, warn};
use serde::Serialize;

use crate::binary_info::BinaryInfo;
use crate::config::AnalyzerConfig;
use crate::dispatch::locate;
use crate::error::{AnalysisError, ErrorKind, ParseError};
use crate::handler::{infer_length, InferenceContext, PacketLength};
use crate::listing::{DisassemblyListing, ListingBuilder};
use crate::parser::{LineParser, ParsedLine};
use crate::process::{DisassemblerProcess, OutputChunk, StopHandle};
use crate::utils::display_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum RunState {
    #[default]
    NotStarted,
    Running,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

/// Outcome of locating the dispatch and inferring every handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    /// `"jump table"` or `"compare chain"`.
    pub idiom: &'static str,
    pub lengths: Vec<PacketLength>,
}

#[derive(Default)]
struct RunInner {
    state: RunState,
    progress: u8,
    results: Vec<PacketLength>,
    error: Option<Arc<AnalysisError>>,
    parse_issues: Vec<ParseError>,
    idiom: Option<&'static str>,
    cancel_requested: bool,
    stop: Option<StopHandle>,
}

/// Shared state of one run. Callers hold it through an [`AnalysisHandle`].
pub struct AnalysisRun {
    config: AnalyzerConfig,
    target: PathBuf,
    inner: Mutex<RunInner>,
}

impl AnalysisRun {
    fn new(config: AnalyzerConfig, target: PathBuf) -> Self {
        Self {
            config,
            target,
            inner: Mutex::new(RunInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn state(&self) -> RunState {
        self.lock().state
    }

    pub fn progress(&self) -> u8 {
        self.lock().progress
    }

    fn cancel_requested(&self) -> bool {
        self.lock().cancel_requested
    }

    /// Progress only moves forward, and only reaches 100 in [`Self::finish`].
    fn advance_progress(&self, percent: u8) {
        let mut inner = self.lock();
        inner.progress = inner.progress.max(percent.min(99));
    }

    fn record_issue(&self, issue: ParseError) {
        let mut inner = self.lock();
        if inner.parse_issues.len() < self.config.max_recorded_parse_issues {
            debug!("Skipping unparseable {}", issue);
            inner.parse_issues.push(issue);
        }
    }

    /// Installs the stop handle, honouring a cancel that arrived before the
    /// child existed.
    fn attach(&self, stop: StopHandle) {
        let mut inner = self.lock();
        if inner.cancel_requested {
            stop.request_stop();
        }
        inner.stop = Some(stop);
    }

    fn finish(&self, outcome: Result<Analysis, AnalysisError>) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.stop = None;
        let outcome = if inner.cancel_requested {
            Err(AnalysisError::Cancelled)
        } else {
            outcome
        };
        match outcome {
            Ok(analysis) => {
                info!(
                    "Analysis of {} done: {} packets via {}",
                    display_path(&self.target),
                    analysis.lengths.len(),
                    analysis.idiom
                );
                inner.results = analysis.lengths;
                inner.idiom = Some(analysis.idiom);
                inner.progress = 100;
                inner.state = RunState::Done;
            }
            Err(e) => {
                if e.is_cancelled() {
                    info!("Analysis of {} cancelled", display_path(&self.target));
                } else {
                    warn!("Analysis of {} failed: {}", display_path(&self.target), e);
                }
                inner.error = Some(Arc::new(e));
                inner.state = RunState::Failed;
            }
        }
    }
}

/// Caller side of a run. Dropping the handle cancels a still running worker
/// and waits for it.
pub struct AnalysisHandle {
    run: Arc<AnalysisRun>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AnalysisHandle {
    pub fn new(config: AnalyzerConfig, target: impl Into<PathBuf>) -> Self {
        Self {
            run: Arc::new(AnalysisRun::new(config, target.into())),
            worker: Mutex::new(None),
        }
    }

    /// Moves the run to `Running` and spawns the worker. Returns false if the
    /// run was already started.
    pub fn start(&self) -> bool {
        {
            let mut inner = self.run.lock();
            if inner.state != RunState::NotStarted {
                return false;
            }
            inner.state = RunState::Running;
        }

        let run = self.run.clone();
        let spawned = thread::Builder::new()
            .name("analysis".into())
            .spawn(move || run_guarded(&run, drive));
        match spawned {
            Ok(worker) => {
                *self.lock_worker() = Some(worker);
            }
            Err(e) => self.run.finish(Err(AnalysisError::Io(e))),
        }
        true
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> RunState {
        self.run.state()
    }

    pub fn progress(&self) -> u8 {
        self.run.progress()
    }

    /// Results sorted by packet id; only available once the run is done.
    pub fn results(&self) -> Option<Vec<PacketLength>> {
        let inner = self.run.lock();
        (inner.state == RunState::Done).then(|| inner.results.clone())
    }

    pub fn error(&self) -> Option<Arc<AnalysisError>> {
        let inner = self.run.lock();
        if inner.state == RunState::Failed {
            inner.error.clone()
        } else {
            None
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error().map(|e| e.kind())
    }

    /// Which dispatch structure the results came from.
    pub fn idiom(&self) -> Option<&'static str> {
        self.run.lock().idiom
    }

    pub fn parse_issues(&self) -> Vec<ParseError> {
        self.run.lock().parse_issues.clone()
    }

    pub fn target(&self) -> &Path {
        self.run.target()
    }

    /// Asks a running analysis to stop. Has no effect in any other state.
    pub fn cancel(&self) {
        let mut inner = self.run.lock();
        if inner.state != RunState::Running || inner.cancel_requested {
            return;
        }
        debug!("Cancel requested for {}", display_path(&self.run.target));
        inner.cancel_requested = true;
        if let Some(stop) = inner.stop.as_ref() {
            stop.request_stop();
        }
    }

    /// Blocks until the worker has finished and returns the final state.
    pub fn wait(&self) -> RunState {
        let worker = self.lock_worker().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                self.run.finish(Err(AnalysisError::ProcessFailed(
                    "analysis worker panicked".into(),
                )));
            }
        }
        self.state()
    }
}

impl Drop for AnalysisHandle {
    fn drop(&mut self) {
        self.cancel();
        self.wait();
    }
}

/// Runs `body` and records its outcome. A panic in `body` still leaves the
/// run terminal, so callers that only poll never see `Running` forever.
fn run_guarded(
    run: &AnalysisRun,
    body: impl FnOnce(&AnalysisRun) -> Result<Analysis, AnalysisError>,
) {
    let outcome = catch_unwind(AssertUnwindSafe(|| body(run))).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(AnalysisError::ProcessFailed(format!(
            "analysis worker panicked: {}",
            message
        )))
    });
    run.finish(outcome);
}

/// Creates a handle for `target` and starts it.
pub fn start_analysis(config: AnalyzerConfig, target: impl Into<PathBuf>) -> AnalysisHandle {
    let handle = AnalysisHandle::new(config, target);
    handle.start();
    handle
}

/// Locates the dispatch in an already built listing and infers every handler.
pub fn analyze_listing(
    listing: &DisassemblyListing,
    config: &AnalyzerConfig,
) -> Result<Analysis, AnalysisError> {
    analyze(listing, config, None, &|| false)
}

fn analyze(
    listing: &DisassemblyListing,
    config: &AnalyzerConfig,
    pointer_width: Option<u32>,
    cancelled: &dyn Fn() -> bool,
) -> Result<Analysis, AnalysisError> {
    let table = locate(listing, config, pointer_width)?;

    // A handler runs until the next handler or the dispatch itself.
    let boundaries: BTreeSet<u64> = table
        .entries
        .iter()
        .map(|e| e.handler_address)
        .chain([table.idiom.start_address()])
        .collect();
    let ctx = InferenceContext {
        inherited_frame: table.frame_reservation,
        min_length: config.min_packet_length,
        max_length: config.max_packet_length,
    };

    let mut by_handler: HashMap<u64, i32> = HashMap::new();
    let mut lengths = Vec::with_capacity(table.entries.len());
    for entry in &table.entries {
        if cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        let length = *by_handler.entry(entry.handler_address).or_insert_with(|| {
            let end = boundaries
                .range((Bound::Excluded(entry.handler_address), Bound::Unbounded))
                .next()
                .copied();
            let span = listing.span(entry.handler_address, end, config.max_handler_instructions);
            let length = infer_length(span, entry.packet_id, &ctx).length;
            debug!(
                "Handler 0x{:x} ({} instructions): {}",
                entry.handler_address,
                span.len(),
                length
            );
            length
        });
        lengths.push(PacketLength::fixed(entry.packet_id, length));
    }
    lengths.sort();

    Ok(Analysis {
        idiom: table.idiom.name(),
        lengths,
    })
}

/// Worker body: stream, parse, then analyze.
fn drive(run: &AnalysisRun) -> Result<Analysis, AnalysisError> {
    let config = &run.config;
    let started = Instant::now();

    let binary = BinaryInfo::inspect(&run.target);
    let estimated = binary.estimated_output_bytes(config.output_bytes_per_code_byte);
    debug!(
        "{}: {} code bytes (parsed: {}), expecting ~{} bytes of listing",
        display_path(&run.target),
        binary.code_bytes,
        binary.parsed,
        estimated
    );

    let mut process = DisassemblerProcess::start(&config.disassembler, &run.target)?;
    run.attach(process.stop_handle());

    let mut parser = LineParser::new();
    let mut builder = ListingBuilder::new();
    let mut buf = Vec::with_capacity(256);
    let mut bytes_read = 0u64;
    let mut last_percent = 0u8;

    loop {
        let chunk = match process.read_output_chunk(&mut buf) {
            Ok(chunk) => chunk,
            Err(_) if run.cancel_requested() => return Err(AnalysisError::Cancelled),
            Err(e) => return Err(e.into()),
        };
        let OutputChunk::Line(n) = chunk else {
            break;
        };

        bytes_read += n as u64;
        let text = String::from_utf8_lossy(&buf);
        match parser.parse_next(text.trim_end_matches(['\r', '\n'])) {
            ParsedLine::Error(issue) => {
                run.record_issue(issue.clone());
                builder.feed(ParsedLine::Error(issue));
            }
            parsed => builder.feed(parsed),
        }

        let percent = (bytes_read.saturating_mul(100) / estimated).min(99) as u8;
        if percent > last_percent {
            last_percent = percent;
            run.advance_progress(percent);
        }
    }

    let status = process.wait()?;
    if run.cancel_requested() {
        return Err(AnalysisError::Cancelled);
    }
    if !status.success() {
        return Err(AnalysisError::ProcessFailed(format!(
            "{} exited with {}",
            display_path(process.program()),
            status
        )));
    }
    drop(process);

    let listing = builder.finish();
    info!(
        "Read {} lines ({} bytes), {} instructions in {:.2?}",
        parser.lines_seen(),
        bytes_read,
        listing.len(),
        started.elapsed()
    );

    analyze(&listing, config, binary.pointer_width, &|| run.cancel_requested())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;

    fn insn(address: u64, text: &str, len: usize) -> Instruction {
        let (mnemonic, ops) = text.split_once(' ').unwrap_or((text, ""));
        let operands = if ops.is_empty() {
            vec![]
        } else {
            ops.split(',').map(|s| s.trim().to_string()).collect()
        };
        Instruction::new(address, mnemonic, operands, vec![0x90; len])
    }

    /// Compare-chain dispatch with one handler shared by two ids.
    fn chain_listing() -> DisassemblyListing {
        DisassemblyListing::from_instructions(vec![
            insn(0x401000, "push ebp", 1),
            insn(0x401001, "mov ebp,esp", 2),
            insn(0x401003, "sub esp,0x10", 3),
            insn(0x401006, "cmp eax,0x64", 3),
            insn(0x401009, "je 401100", 2),
            insn(0x40100b, "cmp eax,0x65", 3),
            insn(0x40100e, "je 401200", 2),
            insn(0x401010, "cmp eax,0x66", 3),
            insn(0x401013, "je 401100", 2),
            insn(0x401015, "leave", 1),
            insn(0x401016, "ret", 1),
            // 0x64 / 0x66
            insn(0x401100, "mov DWORD PTR [ebp-0x4],0x6", 7),
            insn(0x401107, "jmp 401015", 2),
            // 0x65
            insn(0x401200, "mov eax,DWORD PTR [ebp+0x8]", 3),
            insn(0x401203, "mov DWORD PTR [ebp-0x4],eax", 3),
            insn(0x401206, "jmp 401015", 2),
        ])
    }

    #[test]
    fn shared_handler_gives_identical_lengths() {
        let analysis = analyze_listing(&chain_listing(), &AnalyzerConfig::default()).unwrap();
        assert_eq!(analysis.idiom, "compare chain");
        assert_eq!(
            analysis.lengths,
            vec![
                PacketLength::fixed(0x64, 6),
                PacketLength::variable(0x65),
                PacketLength::fixed(0x66, 6),
            ]
        );
    }

    #[test]
    fn analysis_is_repeatable() {
        let listing = chain_listing();
        let config = AnalyzerConfig::default();
        assert_eq!(
            analyze_listing(&listing, &config).unwrap(),
            analyze_listing(&listing, &config).unwrap()
        );
    }

    #[test]
    fn empty_listing_has_no_dispatch() {
        let err = analyze_listing(&DisassemblyListing::new(), &AnalyzerConfig::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DispatchNotFound);
    }

    #[test]
    fn cancellation_is_checked_between_handlers() {
        let err = analyze(&chain_listing(), &AnalyzerConfig::default(), None, &|| true)
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn fresh_handle_is_inert() {
        let handle = AnalysisHandle::new(AnalyzerConfig::default(), "client.exe");
        assert_eq!(handle.state(), RunState::NotStarted);
        assert_eq!(handle.progress(), 0);
        assert!(handle.results().is_none());
        assert!(handle.error().is_none());
        handle.cancel();
        assert_eq!(handle.wait(), RunState::NotStarted);
    }

    #[test]
    fn progress_never_moves_backwards() {
        let run = AnalysisRun::new(AnalyzerConfig::default(), PathBuf::from("x"));
        run.advance_progress(40);
        run.advance_progress(20);
        assert_eq!(run.progress(), 40);
        run.advance_progress(250);
        assert_eq!(run.progress(), 99);
    }

    #[test]
    fn panicking_worker_still_fails_the_run() {
        let run = AnalysisRun::new(AnalyzerConfig::default(), PathBuf::from("x"));
        run.lock().state = RunState::Running;
        run_guarded(&run, |_| panic!("offset overflow"));

        assert_eq!(run.state(), RunState::Failed);
        let inner = run.lock();
        let error = inner.error.as_ref().expect("error recorded");
        assert_eq!(error.kind(), ErrorKind::ProcessFailed);
        assert!(error.to_string().contains("offset overflow"), "{}", error);
    }

    #[test]
    fn parse_issues_are_capped() {
        let config = AnalyzerConfig {
            max_recorded_parse_issues: 2,
            ..Default::default()
        };
        let run = AnalysisRun::new(config, PathBuf::from("x"));
        for n in 0..5 {
            run.record_issue(ParseError {
                line_number: n,
                line: "bad".into(),
                reason: "test".into(),
            });
        }
        assert_eq!(run.lock().parse_issues.len(), 2);
    }
}
