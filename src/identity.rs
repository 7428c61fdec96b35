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
//! Node identity resolution: which interface and link-layer address each reserved node has.
//!
//! Identities are cached in a CSV file keyed by the set of reserved node ids. A cache is only used
//! if it covers every reserved node; otherwise all nodes are probed again through the serial
//! aggregator and the cache is rewritten from scratch, one row per probed node.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use dispatch_utils::serde::L2AddrRecord;
use itertools::Itertools;

use crate::{
    error::DispatchError,
    node::{Identity, L2Addr, NodeSet},
    protocol::ProbeReply,
    testbed::Testbed,
};

/// Interactive session able to ask single nodes for their identity.
#[async_trait]
pub trait IdentityProbe: Send {
    async fn probe(&mut self, node: &str) -> Result<ProbeReply, DispatchError>;

    /// Forcefully end the session.
    async fn close(self: Box<Self>);
}

/// Cache file of a node set, e.g. `<data_path>/l2addrs_3+12+100.csv`.
pub fn cache_path(data_path: &Path, nodes: &NodeSet) -> PathBuf {
    data_path.join(format!("l2addrs_{}.csv", nodes.sorted_ids().iter().join("+")))
}

/// Read the cached identities. A missing file yields an empty map; unreadable rows invalidate the
/// whole cache.
pub fn load_cache(path: &Path) -> Result<HashMap<String, Identity>, DispatchError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let records = rdr.deserialize().collect::<Result<Vec<L2AddrRecord>, _>>()?;
    records
        .into_iter()
        .map(|r| -> Result<(String, Identity), DispatchError> {
            let l2addr: L2Addr = r.l2addr.parse()?;
            Ok((
                r.name,
                Identity {
                    iface: r.iface,
                    l2addr,
                },
            ))
        })
        .collect()
}

pub struct IdentityResolver<'a> {
    testbed: &'a dyn Testbed,
    data_path: &'a Path,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(testbed: &'a dyn Testbed, data_path: &'a Path) -> Self {
        Self { testbed, data_path }
    }

    /// Resolve the identity of every node of reservation `id`. Either all nodes get an identity
    /// or none.
    pub async fn resolve(&self, id: u64, nodes: &mut NodeSet) -> Result<(), DispatchError> {
        if nodes.is_resolved() {
            return Ok(());
        }
        let path = cache_path(self.data_path, nodes);

        let cached = match load_cache(&path) {
            Ok(cached) => cached,
            Err(e) => {
                log::warn!("[identity] ignoring corrupt cache {}: {e}", path.display());
                HashMap::new()
            }
        };
        if nodes.iter().all(|n| cached.contains_key(n.name())) {
            let identities = cached
                .into_iter()
                .filter(|(name, _)| nodes.get(name).is_some())
                .collect();
            nodes.assign(identities)?;
            log::debug!("[identity] using cached identities from {}", path.display());
            return Ok(());
        }

        log::info!("[identity] probing {} nodes of reservation {id}", nodes.len());
        let mut probe = self.testbed.open_probe(id, nodes.site()).await?;
        let result = probe_all(probe.as_mut(), nodes, &path).await;
        probe.close().await;
        nodes.assign(result?)
    }

    /// Forget the identities of the nodes, both in memory and on disk.
    pub fn invalidate(&self, nodes: &mut NodeSet) -> Result<(), DispatchError> {
        let path = cache_path(self.data_path, nodes);
        match fs::remove_file(&path) {
            Ok(()) => log::debug!("[identity] removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        nodes.invalidate();
        Ok(())
    }
}

async fn probe_all(
    probe: &mut dyn IdentityProbe,
    nodes: &NodeSet,
    path: &Path,
) -> Result<HashMap<String, Identity>, DispatchError> {
    let mut csv = csv::WriterBuilder::new().has_headers(true).from_writer(
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?,
    );
    let mut identities = HashMap::new();
    for node in nodes.iter() {
        match probe.probe(node.name()).await? {
            ProbeReply::Identity(identity) => {
                log::debug!(
                    "[identity] {}: iface {} l2addr {}",
                    node.name(),
                    identity.iface,
                    identity.l2addr
                );
                csv.serialize(L2AddrRecord {
                    name: node.name().to_string(),
                    iface: identity.iface,
                    l2addr: identity.l2addr.to_string(),
                })?;
                csv.flush()?;
                identities.insert(node.name().to_string(), identity);
            }
            ProbeReply::NotManaged(name) => {
                return Err(DispatchError::Topology(format!(
                    "{name} is not part of the active nodes"
                )))
            }
        }
    }
    Ok(identities)
}
