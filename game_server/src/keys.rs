// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Live-store key layout. Everything the core writes lives under one of
//! these prefixes; nothing else may touch them.

use core_protocol::id::{GameId, PlayerId};

/// LiveGame hash.
pub fn game(game_id: &GameId) -> String {
    format!("game:{}", game_id)
}

/// Presence hash: `{playerId, wsId, rating, isPlayerConnected}`.
pub fn presence(player_id: &PlayerId) -> String {
    format!("player:{}", player_id)
}

/// Search session JSON string, 300 s TTL.
pub fn search_session(player_id: &PlayerId) -> String {
    format!("search_session:{}", player_id)
}

/// Per-game-type ranked queue, score = rating.
pub fn queue(game_type_key: &str) -> String {
    format!("match-making-queue:{}", game_type_key)
}

/// Cross-node pair claim. Ordering the ids makes the key identical on every
/// node that considers the same pair.
pub fn match_lock(a: &PlayerId, b: &PlayerId) -> String {
    let (low, high) = if a.as_str() <= b.as_str() {
        (a, b)
    } else {
        (b, a)
    };
    format!("match_lock:{}:{}", low, high)
}

#[cfg(test)]
mod tests {
    use crate::keys;
    use core_protocol::id::PlayerId;

    #[test]
    fn match_lock_is_order_independent() {
        let a = PlayerId::new("alice");
        let b = PlayerId::new("bob");
        assert_eq!(keys::match_lock(&a, &b), keys::match_lock(&b, &a));
        assert_eq!(keys::match_lock(&a, &b), "match_lock:alice:bob");
    }
}
