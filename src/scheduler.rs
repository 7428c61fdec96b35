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
//! Turns queue entries into reservations on the testbed.

use crate::{
    config::DispatchConfig,
    descriptor::{ExperimentDescriptor, QueueEntry},
    error::DispatchError,
    firmware::{Firmware, FirmwareBuilder},
    node::NodeSet,
    testbed::{Profile, RadioConfig, Testbed},
};

/// Everything the testbed needs to know to reserve the nodes of an experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub name: String,
    pub nodes: NodeSet,
    /// minutes
    pub duration: u32,
    pub firmware: Firmware,
    pub profile: Option<String>,
}

/// A reservation that exists on the testbed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: u64,
    pub name: String,
    pub nodes: NodeSet,
}

pub struct Scheduler<'a> {
    config: &'a DispatchConfig,
    testbed: &'a dyn Testbed,
    builder: &'a dyn FirmwareBuilder,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        config: &'a DispatchConfig,
        testbed: &'a dyn Testbed,
        builder: &'a dyn FirmwareBuilder,
    ) -> Self {
        Self {
            config,
            testbed,
            builder,
        }
    }

    /// Firmware configured with the experiment's mode, protocol parameters and channel.
    pub fn firmware(&self, desc: &ExperimentDescriptor) -> Firmware {
        Firmware::new(
            &desc.firmware_path,
            &desc.board,
            &self.config.firmware_name,
            Firmware::env_for(desc.mode, desc.vrep, &desc.sfr_params, desc.channel),
        )
    }

    fn nodes(&self, desc: &ExperimentDescriptor) -> Result<NodeSet, DispatchError> {
        NodeSet::new(&desc.iotlab_site, desc.roles())
    }

    /// Build the reservation request of an experiment. Looks up (or creates) the sniffer profile
    /// if the experiment captures frames.
    pub async fn request(
        &self,
        desc: &ExperimentDescriptor,
    ) -> Result<ReservationRequest, DispatchError> {
        let profile = if desc.sniff {
            let profile = self.sniffer_profile(desc.channel).await?;
            log::info!("[scheduler] selected sniffing profile {profile}");
            Some(profile)
        } else {
            None
        };
        Ok(ReservationRequest {
            name: desc.name.clone(),
            nodes: self.nodes(desc)?,
            duration: desc.duration,
            firmware: self.firmware(desc),
            profile,
        })
    }

    /// Name of a profile sniffing on `channel`, registering a new one if none exists.
    pub async fn sniffer_profile(&self, channel: u8) -> Result<String, DispatchError> {
        let profiles = self.testbed.profiles(&self.config.archi).await?;
        if let Some(profile) = profiles.into_iter().find(|p| p.sniffs(channel)) {
            return Ok(profile.name);
        }
        let profile = Profile {
            name: format!("sniffer{channel}"),
            archi: self.config.archi.clone(),
            power: "dc".to_string(),
            radio: Some(RadioConfig {
                mode: "sniffer".to_string(),
                channels: vec![channel],
            }),
        };
        log::info!("[scheduler] registering profile {}", profile.name);
        self.testbed.add_profile(&profile).await?;
        Ok(profile.name)
    }

    /// Complete the entry, build its firmware and reserve its nodes.
    pub async fn schedule(
        &self,
        entry: QueueEntry,
    ) -> Result<(Reservation, ExperimentDescriptor), DispatchError> {
        let desc = entry.complete(&self.config.defaults)?;
        let request = self.request(&desc).await?;
        let elf = self.builder.build(&request.firmware).await?;
        let id = self.testbed.submit(&request, &elf).await?;
        log::info!(
            "[scheduler] scheduled {} on {} as {id}",
            desc.name,
            request.nodes.testbed_list(&self.config.archi)
        );
        Ok((
            Reservation {
                id,
                name: request.name,
                nodes: request.nodes,
            },
            desc,
        ))
    }

    /// Reconstruct the reservation of an experiment persisted under `id`. Fails if the testbed no
    /// longer knows the reservation or it is over.
    pub async fn reattach(
        &self,
        id: u64,
        desc: &ExperimentDescriptor,
    ) -> Result<Reservation, DispatchError> {
        let state = self.testbed.state(id).await?;
        if state.is_finished() {
            return Err(DispatchError::Reservation(format!(
                "reservation {id} of {} is {state}",
                desc.name
            )));
        }
        log::info!("[scheduler] reattached to {} ({id}, {state})", desc.name);
        Ok(Reservation {
            id,
            name: desc.name.clone(),
            nodes: self.nodes(desc)?,
        })
    }
}
