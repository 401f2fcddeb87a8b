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

/// Logger setup for the command line tool. The library itself only uses the
/// `log` macros and never installs a logger.
use flexi_logger::{FlexiLoggerError, Logger, LoggerHandle};

/// Starts logging to stderr. `RUST_LOG` wins over the default level; the
/// returned handle must be kept alive for the life of the program.
pub fn init_logging(debug: bool) -> Result<LoggerHandle, FlexiLoggerError> {
    let default_spec = if debug { "debug" } else { "info" };
    Logger::try_with_env_or_str(default_spec)?
        .log_to_stderr()
        .format(flexi_logger::default_format)
        .start()
}
