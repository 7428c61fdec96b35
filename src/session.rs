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
//! Long-running remote processes started by the dispatcher: the serial aggregator used to probe
//! node identities, and packet capture processes.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use nix::{
    sys::signal::{kill, killpg, Signal},
    unistd::Pid,
};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::{
    error::DispatchError,
    expect::ExpectSession,
    identity::IdentityProbe,
    protocol::{self, ProbeReply},
};

/// Time given to a killed process group to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// A child process running in its own process group. The whole group is killed when the guard is
/// terminated or dropped, which also takes down remote commands started through `ssh`.
#[derive(Debug)]
pub struct ProcessGroupGuard {
    name: String,
    child: Option<Child>,
    pgid: Option<Pid>,
}

impl ProcessGroupGuard {
    pub fn spawn(name: impl Into<String>, mut cmd: Command) -> Result<Self, DispatchError> {
        let name = name.into();
        let child = cmd
            .process_group(0)
            .spawn()
            .map_err(|e| DispatchError::Channel(format!("cannot start {name}: {e}")))?;
        let pgid = child.id().map(|id| Pid::from_raw(id as i32));
        log::debug!("[session] started {name} (pgid {pgid:?})");
        Ok(Self {
            name,
            child: Some(child),
            pgid,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the piped stdout and stdin of the child.
    pub fn take_stdio(&mut self) -> Result<(ChildStdout, ChildStdin), DispatchError> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| DispatchError::Channel(format!("{} was already terminated", self.name)))?;
        match (child.stdout.take(), child.stdin.take()) {
            (Some(stdout), Some(stdin)) => Ok((stdout, stdin)),
            _ => Err(DispatchError::Channel(format!(
                "{} was not started with piped stdio",
                self.name
            ))),
        }
    }

    fn kill_group(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                log::debug!("[session] cannot kill {} (pgid {pgid}): {e}", self.name);
            }
        }
    }

    /// Kill the process group and reap the child.
    pub async fn terminate(mut self) {
        self.kill_group();
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => log::debug!("[session] {} exited with {status}", self.name),
                Ok(Err(e)) => log::warn!("[session] cannot reap {}: {e}", self.name),
                Err(_) => log::warn!("[session] {} did not exit after SIGKILL", self.name),
            }
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill_group();
    }
}

/// Interactive serial aggregator session of a reservation, used to probe node identities.
pub struct AggregatorProbe {
    session: ExpectSession<ChildStdout, ChildStdin>,
    guard: ProcessGroupGuard,
    timeout: Duration,
}

impl AggregatorProbe {
    /// Start `cmd` (which must run the serial aggregator) and wait until it is connected.
    pub async fn start(
        cmd: Command,
        start_timeout: Duration,
        timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let mut cmd = cmd;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut guard = ProcessGroupGuard::spawn("serial aggregator", cmd)?;
        let (stdout, stdin) = guard.take_stdio()?;
        let mut session = ExpectSession::new(guard.name().to_string(), stdout, stdin);
        // on error, the guard is dropped and kills the aggregator
        protocol::wait_aggregator_started(&mut session, start_timeout).await?;
        Ok(Self {
            session,
            guard,
            timeout,
        })
    }
}

#[async_trait]
impl IdentityProbe for AggregatorProbe {
    async fn probe(&mut self, node: &str) -> Result<ProbeReply, DispatchError> {
        protocol::probe_identity(&mut self.session, node, self.timeout).await
    }

    async fn close(self: Box<Self>) {
        let Self { session, guard, .. } = *self;
        drop(session);
        guard.terminate().await;
    }
}

/// A running packet capture.
#[async_trait]
pub trait Capture: Send {
    /// File the capture is written to.
    fn path(&self) -> &Path;

    /// Ask the capture to stop. Does not wait for it to finish.
    async fn stop(self: Box<Self>);
}

/// Capture process writing its stdout into a file.
#[derive(Debug)]
pub struct CaptureProcess {
    child: Child,
    path: PathBuf,
}

impl CaptureProcess {
    pub fn start(mut cmd: Command, path: &Path) -> Result<Self, DispatchError> {
        let file = std::fs::File::create(path)?;
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| DispatchError::Channel(format!("cannot start capture: {e}")))?;
        log::info!("[session] capturing into {}", path.display());
        Ok(Self {
            child,
            path: path.to_path_buf(),
        })
    }
}

#[async_trait]
impl Capture for CaptureProcess {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn stop(self: Box<Self>) {
        let Self { mut child, path } = *self;
        match child.id() {
            Some(pid) => {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                    log::warn!("[session] cannot interrupt capture into {}: {e}", path.display());
                }
            }
            None => log::debug!("[session] capture into {} already exited", path.display()),
        }
        // reap in the background
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
    }
}
