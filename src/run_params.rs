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
//! Effective parameters of a single run: run overrides merged onto the experiment's values.

use std::time::Duration;

use crate::{
    config::Defaults,
    descriptor::{AppliedFirmware, ExperimentDescriptor, Mode, Run, SfrParams},
    error::DispatchError,
};

/// Maximum number of names the consumer can request from.
pub const MAX_CONSUMER_NAMES: usize = 2;
/// Exclusive upper bound of the producer payload.
pub const MAX_DATA_LEN: u32 = 1024;
/// Maximum number of components of a produced name.
pub const MAX_NAME_COMPONENTS: usize = 3;
/// Maximum length of a single name component.
pub const MAX_COMPONENT_LEN: usize = 10;
/// Maximum length of a requested name (without the sequence number suffix).
pub const MAX_NAME_LEN: usize = 25;
/// Length of the per-producer address component appended to the prefix, e.g. `15:11`.
pub const ADDR_COMPONENT_LEN: usize = 5;
/// Longest traffic window of a single run. Reservations are much shorter.
pub const MAX_RUN_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct RunParams {
    pub mode: Mode,
    pub vrep: bool,
    pub sfr_params: SfrParams,
    /// milliseconds between two requests
    pub delay: u64,
    pub count: u64,
    pub prefix: String,
    pub data_len: u32,
    /// Nominal length of the traffic window (without the drain margin).
    pub duration: Duration,
    /// The run explicitly asks for a reflash.
    pub reflash: bool,
}

impl RunParams {
    /// Merge `run` onto the experiment and the configured defaults. Fails if the prefix or the
    /// payload length is still undefined, or if the values exceed what the firmware accepts.
    pub fn resolve(
        desc: &ExperimentDescriptor,
        run: &Run,
        defaults: &Defaults,
    ) -> Result<Self, DispatchError> {
        let delay = run.delay.unwrap_or(defaults.delay);
        let count = run.count.unwrap_or(defaults.count);
        let Some(prefix) = run.prefix.clone().or_else(|| desc.prefix.clone()) else {
            return Err(DispatchError::Config(format!(
                "no prefix defined for run {run:?} of {}",
                desc.name
            )));
        };
        let Some(data_len) = run.data_len.or(desc.data_len) else {
            return Err(DispatchError::Config(format!(
                "no data_len defined for run {run:?} of {}",
                desc.name
            )));
        };
        let minutes = run
            .duration
            .unwrap_or_else(|| default_duration_minutes(delay, count));
        let duration = Duration::try_from_secs_f64(minutes * 60.0)
            .ok()
            .filter(|d| *d <= MAX_RUN_DURATION)
            .ok_or_else(|| {
                DispatchError::Config(format!("invalid run duration {minutes} minutes"))
            })?;

        let params = Self {
            mode: run.mode.unwrap_or(desc.mode),
            vrep: run.vrep.unwrap_or(desc.vrep),
            sfr_params: run.sfr_params.unwrap_or(desc.sfr_params),
            delay,
            count,
            prefix,
            data_len,
            duration,
            reflash: run.reflash.unwrap_or(false),
        };
        params.check_limits(desc.producers.len())?;
        Ok(params)
    }

    fn check_limits(&self, num_producers: usize) -> Result<(), DispatchError> {
        if num_producers > MAX_CONSUMER_NAMES {
            return Err(DispatchError::Config(format!(
                "the consumer can request from at most {MAX_CONSUMER_NAMES} producers, got {num_producers}"
            )));
        }
        if self.data_len == 0 || self.data_len >= MAX_DATA_LEN {
            return Err(DispatchError::Config(format!(
                "data_len must be within 1..{MAX_DATA_LEN}, got {}",
                self.data_len
            )));
        }
        if self.count == 0 {
            return Err(DispatchError::Config("count must be positive".to_string()));
        }
        let Some(components) = self.prefix.strip_prefix('/') else {
            return Err(DispatchError::Config(format!(
                "prefix {:?} must start with '/'",
                self.prefix
            )));
        };
        let components: Vec<&str> = components.split('/').collect();
        if components.iter().any(|c| c.is_empty() || c.len() > MAX_COMPONENT_LEN) {
            return Err(DispatchError::Config(format!(
                "prefix {:?} contains empty components or components longer than {MAX_COMPONENT_LEN}",
                self.prefix
            )));
        }
        if components.len() + 1 > MAX_NAME_COMPONENTS {
            return Err(DispatchError::Config(format!(
                "prefix {:?} has too many components",
                self.prefix
            )));
        }
        if self.prefix.len() + 1 + ADDR_COMPONENT_LEN > MAX_NAME_LEN {
            return Err(DispatchError::Config(format!(
                "prefix {:?} is too long",
                self.prefix
            )));
        }
        Ok(())
    }

    /// Firmware state required by this run.
    pub fn firmware(&self) -> AppliedFirmware {
        AppliedFirmware {
            mode: self.mode,
            vrep: self.vrep,
        }
    }

    /// Mode description used in artifact names, including the protocol parameters in SFR mode.
    pub fn mode_slug(&self) -> String {
        mode_slug(self.mode, self.vrep, &self.sfr_params)
    }

    /// Common stem of the log and capture file of this run.
    pub fn artifact_stem(&self, exp_name: &str, timestamp: u64) -> String {
        format!(
            "{exp_name}_m{}-{}x{}ms{}B_{timestamp}",
            self.mode_slug(),
            self.count,
            self.delay,
            self.data_len,
        )
    }
}

pub fn mode_slug(mode: Mode, vrep: bool, params: &SfrParams) -> String {
    match mode {
        Mode::Reass => mode.to_string(),
        Mode::Sfr => format!(
            "sfr-win{}ifg{}arq{}r{}dg{}{}",
            params.win,
            params.ifg,
            params.arq,
            params.frag,
            params.dg,
            if vrep { "-vrep" } else { "" }
        ),
    }
}

/// Duration in minutes of a run issuing `count` requests every `delay` milliseconds, plus half a
/// minute.
pub fn default_duration_minutes(delay: u64, count: u64) -> f64 {
    ((delay as f64 / 1000.0) * count as f64) / 60.0 + 0.5
}

/// Whether the nodes must be rebuilt and flashed before running with `params`. Nothing known about
/// the flashed firmware (`applied == None`) always requires a reflash.
pub fn needs_reflash(applied: Option<AppliedFirmware>, params: &RunParams) -> bool {
    params.reflash || applied != Some(params.firmware())
}
