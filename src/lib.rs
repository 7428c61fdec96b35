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
//! Library for dispatching repeatable network experiments onto a shared testbed of embedded
//! nodes: a durable queue of experiment descriptors, reservation and firmware handling, and the
//! per-run controller driving the nodes over their serial control channel.

pub mod config;
pub mod control;
pub mod controller;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod expect;
pub mod firmware;
pub mod identity;
pub mod injection;
pub mod node;
pub mod protocol;
pub mod run_params;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod testbed;
pub mod util;

#[cfg(test)]
mod test;

pub mod prelude {
    pub use super::{
        config::{DispatchConfig, Defaults, Timing},
        control::{ChannelFactory, ControlChannel, TmuxFactory},
        descriptor::{ExperimentDescriptor, Mode, QueueEntry, Run, SfrParams},
        dispatch::{DispatchSummary, Dispatcher},
        error::{DispatchError, ErrorScope},
        firmware::{FirmwareBuilder, RiotBuilder},
        store::DescriptorStore,
        testbed::{IotLabCli, Testbed},
    };
}
