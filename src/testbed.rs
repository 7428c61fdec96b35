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
//! Remote testbed API: reservations, profiles, flashing and the per-reservation sessions.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;

use crate::{
    config::DispatchConfig,
    error::DispatchError,
    identity::IdentityProbe,
    node::NodeSet,
    scheduler::ReservationRequest,
    session::{AggregatorProbe, Capture, CaptureProcess},
};

/// State of a reservation as reported by the testbed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum_macros::EnumString,
)]
pub enum ExperimentState {
    Waiting,
    #[strum(serialize = "toLaunch")]
    ToLaunch,
    Launching,
    Running,
    Finishing,
    Terminated,
    Stopped,
    Hold,
    #[strum(serialize = "toError")]
    ToError,
    Error,
}

impl ExperimentState {
    /// The reservation is over and cannot become active anymore.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Self::Finishing | Self::Terminated | Self::Stopped | Self::ToError | Self::Error
        )
    }
}

/// Radio configuration of a profile.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RadioConfig {
    pub mode: String,
    #[serde(default)]
    pub channels: Vec<u8>,
}

/// Measurement profile applied to the nodes of a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Profile {
    #[serde(rename = "profilename")]
    pub name: String,
    #[serde(rename = "nodearch")]
    pub archi: String,
    pub power: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radio: Option<RadioConfig>,
}

impl Profile {
    /// Whether this profile sniffs on `channel`.
    pub fn sniffs(&self, channel: u8) -> bool {
        self.radio
            .as_ref()
            .map(|r| r.mode == "sniffer" && r.channels.contains(&channel))
            .unwrap_or(false)
    }
}

#[async_trait]
pub trait Testbed: Send + Sync {
    /// Request a reservation running `firmware` on all nodes, returning its id.
    async fn submit(&self, request: &ReservationRequest, firmware: &Path)
        -> Result<u64, DispatchError>;

    async fn state(&self, id: u64) -> Result<ExperimentState, DispatchError>;

    /// Block until the reservation is running.
    async fn wait_running(&self, id: u64) -> Result<(), DispatchError>;

    /// All profiles of the user for the given node architecture.
    async fn profiles(&self, archi: &str) -> Result<Vec<Profile>, DispatchError>;

    async fn add_profile(&self, profile: &Profile) -> Result<(), DispatchError>;

    async fn flash(&self, id: u64, nodes: &NodeSet, firmware: &Path) -> Result<(), DispatchError>;

    async fn reset(&self, id: u64, nodes: &NodeSet) -> Result<(), DispatchError>;

    /// Start a serial aggregator on the site to probe node identities.
    async fn open_probe(&self, id: u64, site: &str) -> Result<Box<dyn IdentityProbe>, DispatchError>;

    /// Start capturing all radio frames of the reservation into `path`.
    async fn start_capture(
        &self,
        id: u64,
        site: &str,
        path: &Path,
    ) -> Result<Box<dyn Capture>, DispatchError>;
}

/// [`Testbed`] implemented with the FIT IoT-LAB command line tools and `ssh` to the site
/// frontends.
#[derive(Debug, Clone)]
pub struct IotLabCli {
    config: DispatchConfig,
}

impl IotLabCli {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    async fn cli(&self, program: &str, args: &[String]) -> Result<String, DispatchError> {
        log::debug!("[testbed] {program} {}", args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| DispatchError::Reservation(format!("cannot run {program}: {e}")))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        log::trace!("[testbed] {stdout}");
        if !output.status.success() {
            return Err(DispatchError::Reservation(format!(
                "{program} {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim_end()
            )));
        }
        Ok(stdout)
    }

    fn ssh(&self, site: &str, remote: &[String]) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg(self.config.ssh_host(site)).args(remote);
        cmd
    }

    fn node_list(&self, nodes: &NodeSet) -> String {
        nodes.testbed_list(&self.config.archi)
    }

    async fn node_command(
        &self,
        action: &[String],
        id: u64,
        nodes: &NodeSet,
    ) -> Result<(), DispatchError> {
        let mut args = action.to_vec();
        args.extend([
            "-l".to_string(),
            self.node_list(nodes),
            "-i".to_string(),
            id.to_string(),
        ]);
        let output = self.cli("iotlab-node", &args).await?;
        check_node_result(&output)
    }
}

fn parse_json(output: &str) -> Result<Value, DispatchError> {
    serde_json::from_str(output)
        .map_err(|e| DispatchError::Reservation(format!("unexpected testbed output {output:?}: {e}")))
}

/// Extract the id of a submitted reservation.
pub(crate) fn parse_submit(output: &str) -> Result<u64, DispatchError> {
    parse_json(output)?
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| DispatchError::Reservation(format!("no reservation id in {output:?}")))
}

pub(crate) fn parse_state(output: &str) -> Result<ExperimentState, DispatchError> {
    let json = parse_json(output)?;
    let state = json
        .get("state")
        .and_then(Value::as_str)
        .ok_or_else(|| DispatchError::Reservation(format!("no state in {output:?}")))?;
    state
        .parse()
        .map_err(|_| DispatchError::Reservation(format!("unknown reservation state {state:?}")))
}

/// Node commands report the nodes on which they failed under the key `"1"`.
pub(crate) fn check_node_result(output: &str) -> Result<(), DispatchError> {
    let json = parse_json(output)?;
    match json.get("1").and_then(Value::as_array) {
        Some(failed) if !failed.is_empty() => Err(DispatchError::Reservation(format!(
            "node command failed on {}",
            failed
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        ))),
        _ => Ok(()),
    }
}

#[async_trait]
impl Testbed for IotLabCli {
    async fn submit(
        &self,
        request: &ReservationRequest,
        firmware: &Path,
    ) -> Result<u64, DispatchError> {
        let mut resources = format!("{},{}", self.node_list(&request.nodes), firmware.display());
        if let Some(profile) = &request.profile {
            resources.push(',');
            resources.push_str(profile);
        }
        let args = [
            "submit",
            "-n",
            request.name.as_str(),
            "-d",
            request.duration.to_string().as_str(),
            "-l",
            resources.as_str(),
        ]
        .map(String::from);
        let id = parse_submit(&self.cli("iotlab-experiment", &args).await?)?;
        log::info!("[testbed] submitted {} as reservation {id}", request.name);
        Ok(id)
    }

    async fn state(&self, id: u64) -> Result<ExperimentState, DispatchError> {
        let args = ["get", "-i", id.to_string().as_str(), "-s"].map(String::from);
        parse_state(&self.cli("iotlab-experiment", &args).await?)
    }

    async fn wait_running(&self, id: u64) -> Result<(), DispatchError> {
        log::info!("[testbed] waiting for reservation {id} to start");
        let args = ["wait", "-i", id.to_string().as_str(), "--state", "Running"].map(String::from);
        self.cli("iotlab-experiment", &args).await?;
        Ok(())
    }

    async fn profiles(&self, archi: &str) -> Result<Vec<Profile>, DispatchError> {
        let args = ["get", "-l"].map(String::from);
        let output = self.cli("iotlab-profile", &args).await?;
        let profiles: Vec<Profile> = serde_json::from_str(&output)
            .map_err(|e| DispatchError::Reservation(format!("unexpected profile list: {e}")))?;
        Ok(profiles.into_iter().filter(|p| p.archi == archi).collect())
    }

    async fn add_profile(&self, profile: &Profile) -> Result<(), DispatchError> {
        let mut args = vec![
            format!("add{}", profile.archi),
            "-n".to_string(),
            profile.name.clone(),
            "-p".to_string(),
            profile.power.clone(),
        ];
        if let Some(radio) = &profile.radio {
            args.push(format!("--{}", radio.mode));
            args.push("--channels".to_string());
            args.extend(radio.channels.iter().map(u8::to_string));
        }
        self.cli("iotlab-profile", &args).await?;
        Ok(())
    }

    async fn flash(&self, id: u64, nodes: &NodeSet, firmware: &Path) -> Result<(), DispatchError> {
        log::info!("[testbed] flashing {} onto reservation {id}", firmware.display());
        let action = ["--flash".to_string(), firmware.display().to_string()];
        self.node_command(&action, id, nodes).await
    }

    async fn reset(&self, id: u64, nodes: &NodeSet) -> Result<(), DispatchError> {
        log::info!("[testbed] resetting nodes of reservation {id}");
        self.node_command(&["--reset".to_string()], id, nodes).await
    }

    async fn open_probe(&self, id: u64, site: &str) -> Result<Box<dyn IdentityProbe>, DispatchError> {
        let cmd = self.ssh(
            site,
            &["serial_aggregator".to_string(), "-i".to_string(), id.to_string()],
        );
        let probe = AggregatorProbe::start(
            cmd,
            self.config.timing.probe_start_timeout,
            self.config.timing.probe_timeout,
        )
        .await?;
        Ok(Box::new(probe))
    }

    async fn start_capture(
        &self,
        id: u64,
        site: &str,
        path: &Path,
    ) -> Result<Box<dyn Capture>, DispatchError> {
        let cmd = self.ssh(
            site,
            &["sniffer_aggregator", "-o", "-", "-i", id.to_string().as_str()].map(String::from),
        );
        Ok(Box::new(CaptureProcess::start(cmd, path)?))
    }
}
