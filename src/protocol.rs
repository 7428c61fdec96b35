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
//! Line protocol of the node control channel: typed commands, and every pattern used to interpret
//! the (aggregated) serial output of the nodes.

use std::{fmt, time::Duration};

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    error::DispatchError,
    expect::ExpectSession,
    node::{Identity, L2Addr},
};

lazy_static! {
    static ref AGGREGATOR_STARTED: Regex = Regex::new(r"Aggregator started").unwrap();
    static ref NOT_MANAGED: Regex = Regex::new(r"Node not managed: ([a-z0-9]+-\d+)").unwrap();
}

/// Command understood by the node shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Version,
    Ifconfig,
    /// Serve `data_len` bytes of content under `name`.
    Produce { name: String, data_len: u32 },
    /// Add a FIB entry forwarding `prefix` to `next_hop`.
    Route { prefix: String, next_hop: L2Addr },
    /// Request `count` chunks of every name, one every `delay` milliseconds.
    Consume {
        delay: u64,
        count: u64,
        names: Vec<String>,
    },
    Pktbuf,
    SixLoFrag,
    CcnlCs,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Version => write!(f, "version"),
            Command::Ifconfig => write!(f, "ifconfig"),
            Command::Produce { name, data_len } => write!(f, "produce {name} {data_len}"),
            Command::Route { prefix, next_hop } => write!(f, "route {prefix} {next_hop}"),
            Command::Consume {
                delay,
                count,
                names,
            } => write!(f, "consume {delay} {count} {}", names.iter().join(" ")),
            Command::Pktbuf => write!(f, "pktbuf"),
            Command::SixLoFrag => write!(f, "6lo_frag"),
            Command::CcnlCs => write!(f, "ccnl_cs"),
        }
    }
}

/// A command addressed to one node, or broadcast to every node of the aggregator if `node` is
/// `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlLine {
    pub node: Option<String>,
    pub command: Command,
}

impl ControlLine {
    pub fn to(node: impl Into<String>, command: Command) -> Self {
        Self {
            node: Some(node.into()),
            command,
        }
    }

    pub fn broadcast(command: Command) -> Self {
        Self {
            node: None,
            command,
        }
    }
}

impl fmt::Display for ControlLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => write!(f, "{node};{}", self.command),
            None => write!(f, "{}", self.command),
        }
    }
}

/// Content name served by the producer with address `addr`, e.g. `/test/15:11`.
pub fn content_name(prefix: &str, addr: &L2Addr) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), addr.prefix())
}

/// Outcome of probing a single node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeReply {
    Identity(Identity),
    /// The aggregator does not manage this node, i.e., it is not part of the reservation anymore.
    NotManaged(String),
}

struct IfconfigPatterns {
    iface: Regex,
    hwaddr: Regex,
}

impl IfconfigPatterns {
    fn for_node(node: &str) -> Result<Self, DispatchError> {
        let node = regex::escape(node);
        let compile = |re: String| {
            Regex::new(&re).map_err(|e| DispatchError::Config(format!("invalid node name: {e}")))
        };
        Ok(Self {
            iface: compile(format!(r"{node};Iface\s+(\d+)"))?,
            hwaddr: compile(format!(r"{node};\s+Long HWaddr: ([0-9A-Fa-f:]+)\s"))?,
        })
    }
}

/// Wait for the serial aggregator to announce that it is connected to all nodes.
pub async fn wait_aggregator_started<R, W>(
    session: &mut ExpectSession<R, W>,
    timeout: Duration,
) -> Result<(), DispatchError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    session.expect(&[&AGGREGATOR_STARTED], timeout).await?;
    Ok(())
}

/// Ask `node` for its interface and long hardware address. Each of the two expected lines must
/// arrive within `timeout`.
pub async fn probe_identity<R, W>(
    session: &mut ExpectSession<R, W>,
    node: &str,
    timeout: Duration,
) -> Result<ProbeReply, DispatchError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let patterns = IfconfigPatterns::for_node(node)?;
    session
        .send_line(ControlLine::to(node, Command::Ifconfig).to_string())
        .await?;

    let m = session
        .expect(&[&patterns.iface, &NOT_MANAGED], timeout)
        .await?;
    if m.index == 1 {
        return Ok(ProbeReply::NotManaged(m.group(1).to_string()));
    }
    let iface: u32 = m
        .group(1)
        .parse()
        .map_err(|_| DispatchError::Channel(format!("invalid interface {:?}", m.group(1))))?;

    let m = session
        .expect(&[&patterns.hwaddr, &NOT_MANAGED], timeout)
        .await?;
    if m.index == 1 {
        return Ok(ProbeReply::NotManaged(m.group(1).to_string()));
    }
    let l2addr: L2Addr = m
        .group(1)
        .parse()
        .map_err(|e| DispatchError::Channel(format!("unexpected ifconfig output of {node}: {e}")))?;

    Ok(ProbeReply::Identity(Identity { iface, l2addr }))
}
