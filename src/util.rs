// Testbed Dispatch: Automation of Repeatable Network Experiments on Shared Embedded Testbeds
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Utility module collection of functions

use std::{env, path::Path};

/// Logging configuration read from the working directory, if present.
pub const LOG_CONFIG: &str = "log4rs.yml";

/// Initialize logging from [`LOG_CONFIG`], or log to stderr filtered by `RUST_LOG` (default
/// `info`) if that file does not exist.
pub fn init_logging() {
    if Path::new(LOG_CONFIG).exists() {
        match log4rs::init_file(LOG_CONFIG, Default::default()) {
            Ok(()) => return,
            Err(e) => eprintln!("cannot initialize logging from {LOG_CONFIG}: {e}"),
        }
    }
    let filters = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let _ = pretty_env_logger::formatted_builder()
        .parse_filters(&filters)
        .try_init();
}
