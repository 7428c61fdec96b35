//! Utility module for serde of types.

use serde::{Deserialize, Serialize};

/// One row of the node identity cache (`l2addrs_<ids>.csv`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct L2AddrRecord {
    /// Short node name as used on the control channel, e.g. `m3-12`
    pub name: String,
    /// Interface index reported by the node
    pub iface: u32,
    /// Long hardware address, colon-separated hex octets
    pub l2addr: String,
}
