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

/// Owns the external disassembler child process.
///
/// stdout is streamed line by line so nothing is buffered wholesale. The
/// child sits behind an `Arc<Mutex<_>>` so a [`StopHandle`] on another thread
/// can kill it while the worker is blocked reading its output; the kill makes
/// that read return end-of-stream.
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info};

use crate::config::{DisassemblerConfig, StderrMode};
use crate::error::LaunchError;

const WAIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputChunk {
    /// A line (including its terminator) of this many bytes was read.
    Line(usize),
    EndOfStream,
}

/// Cloneable, thread-safe way to terminate the child.
#[derive(Clone)]
pub struct StopHandle {
    child: Arc<Mutex<Child>>,
    stop_requested: Arc<AtomicBool>,
}

impl StopHandle {
    /// Kills the child. Never blocks on I/O; safe before the first line of
    /// output, while streaming, and after the child has exited.
    pub fn request_stop(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut child = lock_child(&self.child);
        match child.kill() {
            Ok(()) => debug!("Sent kill to disassembler pid {}", child.id()),
            // Already exited and reaped.
            Err(e) => debug!("Kill of pid {} ignored: {}", child.id(), e),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

pub struct DisassemblerProcess {
    program: PathBuf,
    child: Arc<Mutex<Child>>,
    reader: BufReader<ChildStdout>,
    stop: StopHandle,
    stderr_drain: Option<JoinHandle<()>>,
}

impl DisassemblerProcess {
    /// Spawns `<path> <args...> <target>` with stdout captured.
    pub fn start(config: &DisassemblerConfig, target: &Path) -> Result<Self, LaunchError> {
        let mut command = Command::new(&config.path);
        command
            .args(&config.args)
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(match config.stderr {
                StderrMode::Discard => Stdio::null(),
                StderrMode::Inherit => Stdio::inherit(),
                StderrMode::Log => Stdio::piped(),
            });

        let mut child = command
            .spawn()
            .map_err(|e| LaunchError::from_spawn(config.path.clone(), e))?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(LaunchError::NoOutput(config.path.clone()));
        };

        let stderr_drain = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) => debug!("disassembler stderr: {}", line),
                        Err(_) => break,
                    }
                }
            })
        });

        info!(
            "Launched {} (pid {}) on {}",
            config.path.display(),
            child.id(),
            target.display()
        );

        let child = Arc::new(Mutex::new(child));
        Ok(Self {
            program: config.path.clone(),
            stop: StopHandle {
                child: child.clone(),
                stop_requested: Arc::new(AtomicBool::new(false)),
            },
            child,
            reader: BufReader::with_capacity(64 * 1024, stdout),
            stderr_drain,
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Reads the next line of output into `buf` (cleared first). Blocks until
    /// a full line, end of stream, or the child being killed.
    pub fn read_output_chunk(&mut self, buf: &mut Vec<u8>) -> io::Result<OutputChunk> {
        buf.clear();
        let n = self.reader.read_until(b'\n', buf)?;
        if n == 0 {
            return Ok(OutputChunk::EndOfStream);
        }
        Ok(OutputChunk::Line(n))
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    pub fn is_alive(&self) -> bool {
        matches!(lock_child(&self.child).try_wait(), Ok(None))
    }

    /// Waits for the child to exit. The lock is released between polls so
    /// that a concurrent `request_stop` never waits on us.
    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        loop {
            if let Some(status) = lock_child(&self.child).try_wait()? {
                return Ok(status);
            }
            thread::sleep(WAIT_POLL);
        }
    }
}

impl Drop for DisassemblerProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            self.request_stop();
        }
        if let Err(e) = self.wait() {
            debug!("Failed to reap {}: {}", self.program.display(), e);
        }
        if let Some(drain) = self.stderr_drain.take() {
            let _ = drain.join();
        }
    }
}

fn lock_child(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}
