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
//! Immutable configuration of the dispatcher, passed by reference into the scheduler, the run
//! controller and the dispatch loop.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Component, Path, PathBuf},
    time::Duration,
};

use crate::{
    descriptor::{Mode, SfrParams},
    error::DispatchError,
};

/// Defaults applied to queue entries and runs that do not specify a value themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct Defaults {
    pub site: String,
    pub channel: u8,
    /// Reservation duration in minutes.
    pub duration: u32,
    pub mode: Mode,
    pub vrep: bool,
    pub sfr_params: SfrParams,
    /// Delay between two requests of the consumer, in milliseconds.
    pub delay: u64,
    /// Number of requests issued by the consumer per producer name.
    pub count: u64,
    /// Format of generated experiment names, `{channel}` is replaced with the zero-padded
    /// channel.
    pub name_format: String,
    pub firmware_path: PathBuf,
    pub board: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            site: "grenoble".to_string(),
            channel: 20,
            duration: 6,
            mode: Mode::Sfr,
            vrep: true,
            sfr_params: SfrParams::default(),
            delay: 1000,
            count: 300,
            name_format: "icnlowpan_comp_cr_c{channel}".to_string(),
            firmware_path: PathBuf::from("app"),
            board: "iotlab-m3".to_string(),
        }
    }
}

impl Defaults {
    /// Render the default experiment name for the given channel.
    pub fn experiment_name(&self, channel: u8) -> Result<String, DispatchError> {
        let vars = HashMap::from([("channel".to_string(), format!("{channel:02}"))]);
        strfmt::strfmt(&self.name_format, &vars).map_err(|e| {
            DispatchError::Config(format!("invalid name format {:?}: {e}", self.name_format))
        })
    }
}

/// Fixed waits of the run controller and the identity probe.
#[derive(Debug, Clone, PartialEq)]
pub struct Timing {
    /// Extra wait after the nominal traffic window to absorb packets still in flight.
    pub drain_margin: Duration,
    /// Pause between two statistics commands so that the serial log stays in sync.
    pub stats_pause: Duration,
    /// Pause after clearing stale commands before the controller starts.
    pub interrupt_pause: Duration,
    /// How long to wait for the serial aggregator to come up.
    pub probe_start_timeout: Duration,
    /// How long to wait for a single node's response while probing identities.
    pub probe_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            drain_margin: Duration::from_secs(60),
            stats_pause: Duration::from_secs(1),
            interrupt_pause: Duration::from_millis(100),
            probe_start_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// The durable queue of experiment descriptors.
    pub descs_path: PathBuf,
    /// Side-channel file polled for additional runs.
    pub inject_path: PathBuf,
    /// Directory for logs, captures and the identity caches.
    pub data_path: PathBuf,
    /// `session[:window[.pane]]` of the control session, defaults to the experiment name.
    pub tmux_target: Option<String>,
    /// Login on the testbed frontends.
    pub user: String,
    /// Domain of the testbed frontends, e.g. `iot-lab.info`.
    pub domain: String,
    /// Node architecture used for reservations and profiles.
    pub archi: String,
    /// Name of the firmware binary produced by the build.
    pub firmware_name: String,
    /// Variables exported into every control session, e.g. to forward the ssh agent.
    pub session_env: BTreeMap<String, String>,
    pub defaults: Defaults,
    pub timing: Timing,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            descs_path: PathBuf::from("descs.yaml"),
            inject_path: PathBuf::from("inject.yaml"),
            data_path: PathBuf::from("results"),
            tmux_target: None,
            user: String::new(),
            domain: "iot-lab.info".to_string(),
            archi: "m3".to_string(),
            firmware_name: "icn20-icnlowpan-sfr".to_string(),
            session_env: BTreeMap::new(),
            defaults: Defaults::default(),
            timing: Timing::default(),
        }
    }
}

impl DispatchConfig {
    /// Hostname of the frontend of the given site.
    pub fn frontend(&self, site: &str) -> String {
        format!("{}.{}", site, self.domain)
    }

    /// `user@site.domain` as used for ssh.
    pub fn ssh_host(&self, site: &str) -> String {
        format!("{}@{}", self.user, self.frontend(site))
    }

    /// Resolve all paths against the current directory. Paths are typed into control sessions
    /// with their own working directory and persisted into the descriptor store.
    pub fn with_absolute_paths(mut self) -> Result<Self, DispatchError> {
        self.descs_path = absolute(&self.descs_path)?;
        self.inject_path = absolute(&self.inject_path)?;
        self.data_path = absolute(&self.data_path)?;
        self.defaults.firmware_path = absolute(&self.defaults.firmware_path)?;
        Ok(self)
    }
}

/// `path` joined onto the current directory if relative, without `.` components. The path does
/// not need to exist.
pub fn absolute(path: &Path) -> Result<PathBuf, DispatchError> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(path
        .components()
        .filter(|c| *c != Component::CurDir)
        .collect())
}

/// The ssh agent of this process, if both `SSH_AUTH_SOCK` and `SSH_AGENT_PID` are set.
pub fn ssh_agent_env() -> BTreeMap<String, String> {
    let vars = ["SSH_AUTH_SOCK", "SSH_AGENT_PID"]
        .into_iter()
        .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
        .collect::<BTreeMap<_, _>>();
    if vars.len() == 2 {
        vars
    } else {
        BTreeMap::new()
    }
}
