// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::id::{ConnectionId, PlayerId};
use std::collections::HashMap;

/// Ephemeral who-is-here record, hash `player:<playerId>`. Created on
/// connect, rewritten on reconnect, deleted on disconnect or on match.
/// Queue scans treat a missing record as "gone" and evict the entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Presence {
    pub player_id: PlayerId,
    pub connection_id: ConnectionId,
    /// Display-rating snapshot at connect time; not authoritative.
    pub rating: u16,
    pub connected: bool,
}

impl Presence {
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("playerId".to_owned(), self.player_id.to_string()),
            ("wsId".to_owned(), self.connection_id.to_string()),
            ("rating".to_owned(), self.rating.to_string()),
            (
                "isPlayerConnected".to_owned(),
                if self.connected { "true" } else { "false" }.to_owned(),
            ),
        ]
    }

    /// Returns [`None`] for an absent or unreadable record; callers evict
    /// rather than error.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            player_id: PlayerId::new(fields.get("playerId")?.as_str()),
            connection_id: ConnectionId::new(fields.get("wsId")?.as_str()),
            rating: fields.get("rating")?.parse().ok()?,
            connected: fields.get("isPlayerConnected").map(String::as_str) == Some("true"),
        })
    }
}
