// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Whether a freshly provisioned connection is driven to `Active` right
/// away or parked until something demands it (`connection_start_state`
/// config key).
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStartState {
    #[serde(rename = "Passive", alias = "passive")]
    Passive,
    #[serde(rename = "Active", alias = "active")]
    Active,
}

impl fmt::Display for ConnectionStartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStartState::Passive => "Passive",
            ConnectionStartState::Active => "Active",
        })
    }
}

impl Default for ConnectionStartState {
    fn default() -> Self {
        ConnectionStartState::Active
    }
}

impl ConnectionStartState {
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionStartState::Active)
    }
}
