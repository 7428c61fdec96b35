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
//! The command channel of a reservation: a terminal session in which the serial aggregator runs
//! and into which node commands are typed.

use std::{fmt, path::Path, str::FromStr};

use async_trait::async_trait;
use tokio::process::Command;

use crate::{config::DispatchConfig, error::DispatchError, protocol::ControlLine, scheduler::Reservation};

#[async_trait]
pub trait ControlChannel: Send {
    /// Type a command line into the session.
    async fn cmd(&mut self, line: &ControlLine) -> Result<(), DispatchError>;

    async fn hit_enter(&mut self) -> Result<(), DispatchError>;

    /// Interrupt whatever runs in the session.
    async fn hit_ctrl_c(&mut self) -> Result<(), DispatchError>;

    /// Make `key=value` available to programs started in the session afterwards.
    async fn export_env(&mut self, key: &str, value: &str) -> Result<(), DispatchError>;

    /// Start the serial aggregator of the reservation, teeing its output into `log`.
    async fn start_serial_aggregator(&mut self, log: &Path) -> Result<(), DispatchError>;

    async fn stop_serial_aggregator(&mut self) -> Result<(), DispatchError>;
}

/// Opens the command channel of a reservation.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open(&self, reservation: &Reservation) -> Result<Box<dyn ControlChannel>, DispatchError>;
}

/// A tmux target of the form `session[:window[.pane]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxTarget {
    pub session: String,
    pub window: Option<String>,
    pub pane: Option<String>,
}

impl TmuxTarget {
    pub fn parse(s: &str) -> Result<Self, DispatchError> {
        let (session, rest) = match s.split_once(':') {
            Some((session, rest)) => (session, Some(rest)),
            None => (s, None),
        };
        let (window, pane) = match rest.map(|r| r.split_once('.').unwrap_or((r, ""))) {
            Some((window, pane)) => (
                Some(window.to_string()).filter(|w| !w.is_empty()),
                Some(pane.to_string()).filter(|p| !p.is_empty()),
            ),
            None => (None, None),
        };
        if session.is_empty() || (pane.is_some() && window.is_none()) {
            return Err(DispatchError::Config(format!("invalid tmux target {s:?}")));
        }
        Ok(Self {
            session: session.to_string(),
            window,
            pane,
        })
    }

    pub fn session(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            window: None,
            pane: None,
        }
    }
}

impl FromStr for TmuxTarget {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TmuxTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.session)?;
        if let Some(window) = &self.window {
            write!(f, ":{window}")?;
            if let Some(pane) = &self.pane {
                write!(f, ".{pane}")?;
            }
        }
        Ok(())
    }
}

/// Single-quote `s` for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Shell command running the serial aggregator of reservation `id` and logging into `log`.
pub fn aggregator_command(ssh_host: &str, id: u64, log: &Path) -> String {
    format!(
        "ssh {ssh_host} serial_aggregator -i {id} | tee {}",
        shell_quote(&log.display().to_string())
    )
}

pub fn export_command(key: &str, value: &str) -> String {
    format!("export {key}={}", shell_quote(value))
}

async fn tmux(args: &[&str]) -> Result<std::process::Output, DispatchError> {
    Command::new("tmux")
        .args(args)
        .output()
        .await
        .map_err(|e| DispatchError::Channel(format!("cannot run tmux: {e}")))
}

/// Command channel in a (possibly new) tmux session.
#[derive(Debug)]
pub struct TmuxChannel {
    target: TmuxTarget,
    ssh_host: String,
    id: u64,
    aggregator_running: bool,
}

impl TmuxChannel {
    /// Attach to `target`, creating the session or window if it does not exist yet.
    pub async fn open(target: TmuxTarget, ssh_host: String, id: u64) -> Result<Self, DispatchError> {
        if !tmux(&["has-session", "-t", &target.session]).await?.status.success() {
            log::info!("[control] creating tmux session {}", target.session);
            let mut args = vec!["new-session", "-d", "-s", target.session.as_str()];
            if let Some(window) = &target.window {
                args.extend(["-n", window.as_str()]);
            }
            let output = tmux(&args).await?;
            if !output.status.success() {
                return Err(DispatchError::Channel(format!(
                    "cannot create tmux session {}: {}",
                    target.session,
                    String::from_utf8_lossy(&output.stderr).trim_end()
                )));
            }
        } else if let Some(window) = &target.window {
            let window_target = format!("{}:{window}", target.session);
            if !tmux(&["select-window", "-t", &window_target]).await?.status.success() {
                log::info!("[control] creating tmux window {window_target}");
                tmux(&["new-window", "-d", "-t", &target.session, "-n", window]).await?;
            }
        }
        Ok(Self {
            target,
            ssh_host,
            id,
            aggregator_running: false,
        })
    }

    async fn send_keys(&self, keys: &[&str], literal: bool) -> Result<(), DispatchError> {
        let target = self.target.to_string();
        let mut args = vec!["send-keys", "-t", target.as_str()];
        if literal {
            args.push("-l");
        }
        args.extend(keys);
        let output = tmux(&args).await?;
        if !output.status.success() {
            return Err(DispatchError::Channel(format!(
                "cannot send keys to {target}: {}",
                String::from_utf8_lossy(&output.stderr).trim_end()
            )));
        }
        Ok(())
    }

    async fn type_line(&self, line: &str) -> Result<(), DispatchError> {
        self.send_keys(&[line], true).await?;
        self.send_keys(&["Enter"], false).await
    }
}

#[async_trait]
impl ControlChannel for TmuxChannel {
    async fn cmd(&mut self, line: &ControlLine) -> Result<(), DispatchError> {
        log::info!("[control] {line}");
        self.type_line(&line.to_string()).await
    }

    async fn hit_enter(&mut self) -> Result<(), DispatchError> {
        self.send_keys(&["Enter"], false).await
    }

    async fn hit_ctrl_c(&mut self) -> Result<(), DispatchError> {
        self.send_keys(&["C-c"], false).await
    }

    async fn export_env(&mut self, key: &str, value: &str) -> Result<(), DispatchError> {
        self.type_line(&export_command(key, value)).await
    }

    async fn start_serial_aggregator(&mut self, log: &Path) -> Result<(), DispatchError> {
        if self.aggregator_running {
            self.stop_serial_aggregator().await?;
        }
        log::info!("[control] logging into {}", log.display());
        self.type_line(&aggregator_command(&self.ssh_host, self.id, log))
            .await?;
        self.aggregator_running = true;
        Ok(())
    }

    async fn stop_serial_aggregator(&mut self) -> Result<(), DispatchError> {
        self.hit_ctrl_c().await?;
        self.aggregator_running = false;
        Ok(())
    }
}

/// Opens a [`TmuxChannel`] per reservation, in the configured target or in a session named after
/// the experiment.
#[derive(Debug, Clone)]
pub struct TmuxFactory {
    config: DispatchConfig,
}

impl TmuxFactory {
    pub fn new(config: &DispatchConfig) -> Result<Self, DispatchError> {
        if let Some(target) = &config.tmux_target {
            TmuxTarget::parse(target)?;
        }
        Ok(Self {
            config: config.clone(),
        })
    }
}

#[async_trait]
impl ChannelFactory for TmuxFactory {
    async fn open(&self, reservation: &Reservation) -> Result<Box<dyn ControlChannel>, DispatchError> {
        let target = match &self.config.tmux_target {
            Some(target) => TmuxTarget::parse(target)?,
            None => TmuxTarget::session(&reservation.name),
        };
        let ssh_host = self.config.ssh_host(reservation.nodes.site());
        let channel = TmuxChannel::open(target, ssh_host, reservation.id).await?;
        Ok(Box::new(channel))
    }
}
