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
//! The dispatch loop: schedules the queue, then drives every reserved experiment through its runs,
//! one experiment after the other.

use std::fs;

use crate::{
    config::DispatchConfig,
    control::ChannelFactory,
    controller::RunController,
    error::{DispatchError, ErrorScope},
    firmware::FirmwareBuilder,
    scheduler::{Reservation, Scheduler},
    store::{DescriptorStore, StoreKey},
    testbed::Testbed,
};

/// Outcome of a dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Experiments whose runs were all completed.
    pub drained: usize,
    /// Completed runs over all experiments.
    pub runs: usize,
    /// Experiments removed from the store after an error.
    pub dropped: usize,
    /// Experiments left in the store for the operator to fix.
    pub kept: usize,
}

pub struct Dispatcher<'a> {
    config: &'a DispatchConfig,
    testbed: &'a dyn Testbed,
    builder: &'a dyn FirmwareBuilder,
    channels: &'a dyn ChannelFactory,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        config: &'a DispatchConfig,
        testbed: &'a dyn Testbed,
        builder: &'a dyn FirmwareBuilder,
        channels: &'a dyn ChannelFactory,
    ) -> Self {
        Self {
            config,
            testbed,
            builder,
            channels,
        }
    }

    /// Load the store, schedule and reattach everything in it, and run all experiments until
    /// their run lists are empty.
    pub async fn run(&self) -> Result<DispatchSummary, DispatchError> {
        fs::create_dir_all(&self.config.data_path)?;
        let mut store = DescriptorStore::load(&self.config.descs_path)?;

        let existing = store.scheduled_ids();
        let scheduler = Scheduler::new(self.config, self.testbed, self.builder);
        let mut reservations = store.schedule_unscheduled(&scheduler).await?;
        reservations.extend(store.reattach_scheduled(&scheduler, &existing).await?);
        reservations.sort_by_key(|r| r.id);
        log::info!("[dispatch] {} reserved experiments", reservations.len());

        let mut summary = DispatchSummary::default();
        for reservation in reservations {
            let id = reservation.id;
            let name = reservation.name.clone();
            match self.experiment(&mut store, reservation).await {
                Ok(runs) => {
                    log::info!("[dispatch] {name} ({id}) drained after {runs} runs");
                    store.delete(StoreKey::Reservation(id))?;
                    summary.drained += 1;
                    summary.runs += runs;
                }
                Err(e) => match e.scope() {
                    ErrorScope::Process => return Err(e),
                    ErrorScope::Experiment => {
                        log::error!("[dispatch] dropping {name} ({id}): {e}");
                        store.delete(StoreKey::Reservation(id))?;
                        summary.dropped += 1;
                    }
                    ErrorScope::Run => {
                        log::error!("[dispatch] keeping {name} ({id}) in the store: {e}");
                        summary.kept += 1;
                    }
                },
            }
        }

        if !store.is_empty() {
            log::warn!(
                "[dispatch] no reservation left, but {} entries remain in {}",
                store.list().len(),
                store.path().display()
            );
        }
        Ok(summary)
    }

    async fn experiment(
        &self,
        store: &mut DescriptorStore,
        reservation: Reservation,
    ) -> Result<usize, DispatchError> {
        self.testbed.wait_running(reservation.id).await?;
        let mut channel = self.channels.open(&reservation).await?;
        for (key, value) in &self.config.session_env {
            channel.export_env(key, value).await?;
        }
        // clear whatever is still running in the session
        channel.hit_ctrl_c().await?;
        channel.hit_ctrl_c().await?;
        tokio::time::sleep(self.config.timing.interrupt_pause).await;

        let mut controller =
            RunController::new(self.config, self.testbed, self.builder, channel, reservation);
        controller.run(store).await
    }
}
