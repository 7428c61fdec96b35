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
//! Firmware of the experiment nodes and how it is built.

use std::{collections::BTreeMap, path::PathBuf};

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::process::Command;

use crate::{
    descriptor::{Mode, SfrParams},
    error::DispatchError,
};

lazy_static! {
    static ref CMAKE_VERSION: Regex = Regex::new(r"cmake version (\d+)\.(\d+)").unwrap();
}

/// Newest toolchain version with which parallel builds are known to work.
const MAX_PARALLEL_TOOLCHAIN: (u32, u32) = (3, 13);

/// A firmware application together with the build environment that configures it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    pub app_path: PathBuf,
    pub board: String,
    pub name: String,
    pub env: BTreeMap<String, String>,
}

impl Firmware {
    pub fn new(
        app_path: impl Into<PathBuf>,
        board: impl Into<String>,
        name: impl Into<String>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            app_path: app_path.into(),
            board: board.into(),
            name: name.into(),
            env,
        }
    }

    /// Build environment selecting the fragment handling mode and its parameters.
    pub fn env_for(
        mode: Mode,
        vrep: bool,
        sfr_params: &SfrParams,
        channel: u8,
    ) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([
            ("MODE".to_string(), mode.to_string()),
            ("VREP".to_string(), if vrep { "1" } else { "0" }.to_string()),
            ("DEFAULT_CHANNEL".to_string(), channel.to_string()),
        ]);
        if mode == Mode::Sfr {
            env.extend(
                [
                    ("WIN_SIZE", sfr_params.win),
                    ("INTER_FRAME_GAP", sfr_params.ifg),
                    ("RETRY_TIMEOUT", sfr_params.arq),
                    ("RETRIES", sfr_params.frag),
                    ("DATAGRAM_RETRIES", sfr_params.dg),
                ]
                .map(|(k, v)| (k.to_string(), v.to_string())),
            );
        }
        env
    }

    /// Path of the binary produced by the build.
    pub fn elf_path(&self) -> PathBuf {
        self.app_path
            .join("bin")
            .join(&self.board)
            .join(format!("{}.elf", self.name))
    }
}

/// Parse the output of `cmake --version`.
pub fn parse_cmake_version(output: &str) -> Option<(u32, u32)> {
    let caps = CMAKE_VERSION.captures(output)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

/// Number of parallel build jobs for the given toolchain version. Parallel builds break with
/// newer toolchains, an unknown version is treated as old.
pub fn threads_for_version(version: Option<(u32, u32)>) -> usize {
    match version {
        Some(v) if v > MAX_PARALLEL_TOOLCHAIN => 1,
        _ => num_cpus::get(),
    }
}

#[async_trait]
pub trait FirmwareBuilder: Send + Sync {
    /// Build the firmware and return the path of the resulting binary.
    async fn build(&self, firmware: &Firmware) -> Result<PathBuf, DispatchError>;
}

/// Builds RIOT applications with `make`.
#[derive(Debug, Default, Clone)]
pub struct RiotBuilder;

impl RiotBuilder {
    async fn cmake_version() -> Option<(u32, u32)> {
        let output = Command::new("cmake").arg("--version").output().await.ok()?;
        if !output.status.success() {
            return None;
        }
        parse_cmake_version(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl FirmwareBuilder for RiotBuilder {
    async fn build(&self, firmware: &Firmware) -> Result<PathBuf, DispatchError> {
        let threads = threads_for_version(Self::cmake_version().await);
        log::info!(
            "[firmware] building {} for {} with {threads} jobs ({})",
            firmware.app_path.display(),
            firmware.board,
            firmware
                .env
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(" ")
        );
        let output = Command::new("make")
            .arg("-C")
            .arg(&firmware.app_path)
            .arg(format!("BOARD={}", firmware.board))
            .arg(format!("-j{threads}"))
            .arg("all")
            .envs(&firmware.env)
            .output()
            .await
            .map_err(|e| DispatchError::Reservation(format!("cannot run make: {e}")))?;
        log::trace!("{}", String::from_utf8_lossy(&output.stdout));
        if !output.status.success() {
            return Err(DispatchError::Reservation(format!(
                "building {} failed: {}",
                firmware.app_path.display(),
                String::from_utf8_lossy(&output.stderr).trim_end()
            )));
        }
        let elf = firmware.elf_path();
        if !elf.exists() {
            return Err(DispatchError::Reservation(format!(
                "build did not produce {}",
                elf.display()
            )));
        }
        Ok(elf)
    }
}
