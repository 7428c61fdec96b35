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
//! Experiment descriptors and runs as they are persisted in the descriptor file.
//!
//! Entries in the `unscheduled` bucket are user-authored [`QueueEntry`]s where almost everything
//! is optional. Once scheduled, an entry is completed with the configured defaults and persisted
//! as an [`ExperimentDescriptor`] under its reservation id, so that restarts do not depend on the
//! defaults of the process that picks the experiment up again.

use std::path::PathBuf;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{config::Defaults, error::DispatchError};

/// Firmware mode, i.e., how 6LoWPAN fragments are handled on forwarders.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
    /// Hop-wise reassembly
    Reass,
    /// Selective fragment recovery
    Sfr,
}

/// Protocol parameters of selective fragment recovery. Missing fields take their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(default)]
pub struct SfrParams {
    /// window size
    pub win: u32,
    /// inter-frame gap
    pub ifg: u32,
    /// ARQ timeout
    pub arq: u32,
    /// fragment retries
    pub frag: u32,
    /// datagram retries
    pub dg: u32,
}

impl Default for SfrParams {
    fn default() -> Self {
        Self {
            win: 1,
            ifg: 100,
            arq: 150,
            frag: 4,
            dg: 0,
        }
    }
}

/// Firmware state that was last flashed onto the nodes of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct AppliedFirmware {
    pub mode: Mode,
    pub vrep: bool,
}

/// One timed trial. Every field overrides the experiment's value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Run {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vrep: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sfr_params: Option<SfrParams>,
    /// milliseconds between two requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_len: Option<u32>,
    /// Force rebuilding and flashing the firmware before this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflash: Option<bool>,
    /// Duration of the traffic window in minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// A queue entry as written by the user into the `unscheduled` bucket.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QueueEntry {
    pub consumer: String,
    pub producers: Vec<String>,
    pub forwarders: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iotlab_site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vrep: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sfr_params: Option<SfrParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_len: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sniff: Option<bool>,
    #[serde(default)]
    pub runs: Vec<Run>,
}

impl QueueEntry {
    /// Fill in every missing value from `defaults`.
    pub fn complete(self, defaults: &Defaults) -> Result<ExperimentDescriptor, DispatchError> {
        let channel = self.channel.unwrap_or(defaults.channel);
        let name = match self.name {
            Some(name) => name,
            None => defaults.experiment_name(channel)?,
        };
        let desc = ExperimentDescriptor {
            name,
            consumer: self.consumer,
            producers: self.producers,
            forwarders: self.forwarders,
            iotlab_site: self.iotlab_site.unwrap_or_else(|| defaults.site.clone()),
            duration: self.duration.unwrap_or(defaults.duration),
            firmware_path: self
                .firmware_path
                .unwrap_or_else(|| defaults.firmware_path.clone()),
            board: self.board.unwrap_or_else(|| defaults.board.clone()),
            mode: self.mode.unwrap_or(defaults.mode),
            vrep: self.vrep.unwrap_or(defaults.vrep),
            sfr_params: self.sfr_params.unwrap_or(defaults.sfr_params),
            channel,
            prefix: self.prefix,
            data_len: self.data_len,
            sniff: self.sniff.unwrap_or(false),
            runs: self.runs,
            applied: None,
        };
        desc.validate()?;
        Ok(desc)
    }
}

/// A scheduled experiment, persisted under its reservation id.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExperimentDescriptor {
    pub name: String,
    pub consumer: String,
    pub producers: Vec<String>,
    pub forwarders: Vec<String>,
    pub iotlab_site: String,
    /// Reservation duration in minutes.
    pub duration: u32,
    pub firmware_path: PathBuf,
    pub board: String,
    pub mode: Mode,
    pub vrep: bool,
    pub sfr_params: SfrParams,
    pub channel: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_len: Option<u32>,
    #[serde(default)]
    pub sniff: bool,
    #[serde(default)]
    pub runs: Vec<Run>,
    /// Firmware last flashed by the run controller. `None` until the first reflash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<AppliedFirmware>,
}

impl ExperimentDescriptor {
    /// Check the topology roles.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.producers.is_empty() {
            return Err(DispatchError::Config(format!(
                "experiment {} has no producers",
                self.name
            )));
        }
        let roles = self.roles().collect_vec();
        let unique = roles.iter().unique().count();
        if unique != roles.len() {
            return Err(DispatchError::Config(format!(
                "experiment {} assigns a node to more than one role: {}",
                self.name,
                roles.iter().join(", ")
            )));
        }
        Ok(())
    }

    /// All node names in the order consumer, producers, forwarders.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.consumer.as_str())
            .chain(self.producers.iter().map(String::as_str))
            .chain(self.forwarders.iter().map(String::as_str))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const ENTRY: &str = r#"
consumer: m3-1
producers: [m3-2]
forwarders: [m3-3, m3-4]
mode: sfr
sfr_params: {win: 1, ifg: 100, arq: 150, frag: 4, dg: 0}
prefix: /test
data_len: 50
runs:
  - {delay: 1000, count: 10}
"#;

    #[test]
    fn complete_with_defaults() {
        let entry: QueueEntry = serde_yaml::from_str(ENTRY).unwrap();
        let desc = entry.complete(&Defaults::default()).unwrap();
        assert_eq!(desc.name, "icnlowpan_comp_cr_c20");
        assert_eq!(desc.iotlab_site, "grenoble");
        assert_eq!(desc.duration, 6);
        assert_eq!(desc.mode, Mode::Sfr);
        assert!(desc.vrep);
        assert!(!desc.sniff);
        assert_eq!(desc.applied, None);
        assert_eq!(desc.runs.len(), 1);
        assert_eq!(desc.runs[0].delay, Some(1000));
        assert_eq!(
            desc.roles().collect_vec(),
            vec!["m3-1", "m3-2", "m3-3", "m3-4"]
        );
    }

    #[test]
    fn partial_sfr_params() {
        let params: SfrParams = serde_yaml::from_str("{win: 5}").unwrap();
        assert_eq!(
            params,
            SfrParams {
                win: 5,
                ..Default::default()
            }
        );
    }

    #[test]
    fn unknown_run_field() {
        assert!(serde_yaml::from_str::<Run>("{delay: 10, cout: 3}").is_err());
    }

    #[test]
    fn mode_strings() {
        assert_eq!(Mode::Reass.to_string(), "reass");
        assert_eq!("sfr".parse::<Mode>().unwrap(), Mode::Sfr);
        assert_eq!(serde_yaml::to_string(&Mode::Sfr).unwrap().trim(), "sfr");
    }

    #[test]
    fn duplicate_role() {
        let mut entry: QueueEntry = serde_yaml::from_str(ENTRY).unwrap();
        entry.forwarders.push("m3-2".to_string());
        assert!(matches!(
            entry.complete(&Defaults::default()),
            Err(DispatchError::Config(_))
        ));
    }

    #[test]
    fn descriptor_roundtrip_is_stable() {
        let entry: QueueEntry = serde_yaml::from_str(ENTRY).unwrap();
        let desc = entry.complete(&Defaults::default()).unwrap();
        let first = serde_yaml::to_string(&desc).unwrap();
        let reloaded: ExperimentDescriptor = serde_yaml::from_str(&first).unwrap();
        assert_eq!(reloaded, desc);
        assert_eq!(serde_yaml::to_string(&reloaded).unwrap(), first);
    }
}
