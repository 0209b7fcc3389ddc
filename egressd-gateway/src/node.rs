//
// Copyright (c) The Egressd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use derive_new::new;
use serde::{Deserialize, Serialize};

/// Cluster node view. The address is the one placed into policy map values
/// when the node is selected as an egress gateway.
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct Node {
    pub name: String,
    pub addr: Ipv4Addr,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}
