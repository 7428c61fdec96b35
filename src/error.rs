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
//! Error taxonomy of the dispatcher and how far each kind of error propagates.

use thiserror::Error;

/// How far an error is allowed to propagate before it is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Only the current run is aborted. The experiment stays in the store untouched so that the
    /// operator can fix the input and restart.
    Run,
    /// The owning experiment is aborted and removed from the store.
    Experiment,
    /// The whole process must stop.
    Process,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Malformed or incomplete descriptor or run.
    #[error("Configuration error: {0}")]
    Config(String),
    /// A reserved node is not part of the active set.
    #[error("Topology error: {0}")]
    Topology(String),
    /// The remote testbed failed to schedule, build, flash or reset.
    #[error("Reservation error: {0}")]
    Reservation(String),
    /// The persisted state is corrupt.
    #[error("Parse error: {0}")]
    Parse(String),
    /// The remote session or command channel failed.
    #[error("Channel error: {0}")]
    Channel(String),
    #[error("Timeout while waiting for {0}")]
    Timeout(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DispatchError {
    pub fn scope(&self) -> ErrorScope {
        match self {
            Self::Config(_) => ErrorScope::Run,
            Self::Topology(_) | Self::Reservation(_) | Self::Channel(_) | Self::Timeout(_) => {
                ErrorScope::Experiment
            }
            Self::Parse(_) | Self::Io(_) => ErrorScope::Process,
        }
    }
}

impl From<csv::Error> for DispatchError {
    fn from(e: csv::Error) -> Self {
        match e.into_kind() {
            csv::ErrorKind::Io(e) => Self::Io(e),
            kind => Self::Parse(format!("{kind:?}")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scopes() {
        assert_eq!(DispatchError::Config("x".into()).scope(), ErrorScope::Run);
        assert_eq!(DispatchError::Topology("x".into()).scope(), ErrorScope::Experiment);
        assert_eq!(DispatchError::Reservation("x".into()).scope(), ErrorScope::Experiment);
        assert_eq!(DispatchError::Timeout("x".into()).scope(), ErrorScope::Experiment);
        assert_eq!(DispatchError::Parse("x".into()).scope(), ErrorScope::Process);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert_eq!(DispatchError::from(io).scope(), ErrorScope::Process);
    }
}
