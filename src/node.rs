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
//! Reserved nodes and their link-layer identities.

use std::{fmt, str::FromStr};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// Long hardware address of a node, e.g. `15:11:6B:10:65:F8:AC:5A`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct L2Addr(Vec<u8>);

impl L2Addr {
    pub fn octets(&self) -> &[u8] {
        &self.0
    }

    /// The first two octets in text form (e.g. `15:11`), used as the producer-specific name
    /// component.
    pub fn prefix(&self) -> String {
        self.0.iter().take(2).map(|o| format!("{o:02X}")).join(":")
    }
}

impl FromStr for L2Addr {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets = s
            .trim()
            .split(':')
            .map(|o| {
                if o.len() == 2 {
                    u8::from_str_radix(o, 16).ok()
                } else {
                    None
                }
            })
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| DispatchError::Parse(format!("invalid link-layer address {s:?}")))?;
        if !(2..=8).contains(&octets.len()) {
            return Err(DispatchError::Parse(format!(
                "invalid link-layer address length {s:?}"
            )));
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for L2Addr {
    type Error = DispatchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<L2Addr> for String {
    fn from(addr: L2Addr) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for L2Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.iter().map(|o| format!("{o:02X}")).join(":"))
    }
}

/// Resolved identity of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub iface: u32,
    pub l2addr: L2Addr,
}

/// One reserved node, e.g. `m3-12` at `grenoble`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    name: String,
    id: u32,
    pub identity: Option<Identity>,
}

impl Node {
    /// Parse a node name of the form `<archi>-<id>`.
    pub fn new(name: impl Into<String>) -> Result<Self, DispatchError> {
        let name = name.into();
        let id = name
            .rsplit_once('-')
            .and_then(|(_, id)| id.parse().ok())
            .ok_or_else(|| {
                DispatchError::Config(format!("node name {name:?} is not of the form <archi>-<id>"))
            })?;
        Ok(Self {
            name,
            id,
            identity: None,
        })
    }

    /// Name as used on the control channel, e.g. `m3-12`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Numeric id of the node within its site.
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// The nodes of one reservation, in the order consumer, producers, forwarders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSet {
    site: String,
    nodes: Vec<Node>,
}

impl NodeSet {
    pub fn new<'a>(
        site: impl Into<String>,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, DispatchError> {
        let nodes: Vec<Node> = names
            .into_iter()
            .unique()
            .map(Node::new)
            .collect::<Result<_, _>>()?;
        Ok(Self {
            site: site.into(),
            nodes,
        })
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Numeric node ids in increasing order.
    pub fn sorted_ids(&self) -> Vec<u32> {
        self.nodes.iter().map(Node::id).sorted().collect()
    }

    /// Node list as understood by the testbed tools, e.g. `grenoble,m3,1+2+5`.
    pub fn testbed_list(&self, archi: &str) -> String {
        format!(
            "{},{archi},{}",
            self.site,
            self.sorted_ids().iter().join("+")
        )
    }

    /// Link-layer address of a resolved node.
    pub fn l2addr(&self, name: &str) -> Result<&L2Addr, DispatchError> {
        self.get(name)
            .and_then(|n| n.identity.as_ref())
            .map(|i| &i.l2addr)
            .ok_or_else(|| DispatchError::Topology(format!("node {name} has no resolved identity")))
    }

    pub fn is_resolved(&self) -> bool {
        self.nodes.iter().all(|n| n.identity.is_some())
    }

    /// Forget all resolved identities.
    pub fn invalidate(&mut self) {
        self.nodes.iter_mut().for_each(|n| n.identity = None);
    }

    /// Commit identities for all nodes at once. Fails without changing anything if the map does not
    /// contain exactly the reserved nodes.
    pub fn assign(
        &mut self,
        mut identities: std::collections::HashMap<String, Identity>,
    ) -> Result<(), DispatchError> {
        if identities.len() != self.nodes.len()
            || self.nodes.iter().any(|n| !identities.contains_key(&n.name))
        {
            return Err(DispatchError::Topology(format!(
                "resolved identities [{}] do not match the reserved nodes [{}]",
                identities.keys().sorted().join(", "),
                self.nodes.iter().map(Node::name).join(", ")
            )));
        }
        for node in self.nodes.iter_mut() {
            node.identity = identities.remove(&node.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn parse_l2addr() {
        let addr: L2Addr = "15:11:6b:10:65:f8:ac:5a".parse().unwrap();
        assert_eq!(addr.to_string(), "15:11:6B:10:65:F8:AC:5A");
        assert_eq!(addr.prefix(), "15:11");
        assert_eq!(addr.octets().len(), 8);

        let short: L2Addr = "02:00:00:00:00:01".parse().unwrap();
        assert_eq!(short.octets().len(), 6);

        assert!("15:11:6B:1".parse::<L2Addr>().is_err());
        assert!("15".parse::<L2Addr>().is_err());
        assert!("zz:11".parse::<L2Addr>().is_err());
    }

    #[test]
    fn node_names() {
        let node = Node::new("m3-12").unwrap();
        assert_eq!(node.id(), 12);
        assert_eq!(node.name(), "m3-12");
        assert!(Node::new("m3").is_err());
        assert!(Node::new("m3-x").is_err());
    }

    #[test]
    fn node_set() {
        let nodes = NodeSet::new("grenoble", ["m3-12", "m3-3", "m3-100", "m3-3"]).unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes.sorted_ids(), vec![3, 12, 100]);
        assert_eq!(nodes.testbed_list("m3"), "grenoble,m3,3+12+100");
    }

    #[test]
    fn assign_all_or_nothing() {
        let mut nodes = NodeSet::new("grenoble", ["m3-1", "m3-2"]).unwrap();
        let identity = |addr: &str| Identity {
            iface: 6,
            l2addr: addr.parse().unwrap(),
        };

        let partial = HashMap::from([("m3-1".to_string(), identity("00:01"))]);
        assert!(nodes.assign(partial).is_err());
        assert!(!nodes.is_resolved());

        let full = HashMap::from([
            ("m3-1".to_string(), identity("00:01")),
            ("m3-2".to_string(), identity("00:02")),
        ]);
        nodes.assign(full).unwrap();
        assert!(nodes.is_resolved());
        assert_eq!(nodes.l2addr("m3-2").unwrap().to_string(), "00:02");

        nodes.invalidate();
        assert!(!nodes.is_resolved());
        assert!(nodes.l2addr("m3-2").is_err());
    }
}
