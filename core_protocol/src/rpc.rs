// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::dto::*;
use crate::game::{Color, EndReason, GameVariant, Score, TimeControl};
use crate::id::GameId;
use crate::UnixTime;
use serde::{Deserialize, Serialize};

/// Client requests arrive over an authenticated websocket; the transport has
/// already resolved the sender's `PlayerId` before the core sees them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    /// Sent every ~3 s while searching; doubles as the matchmaking tick.
    SearchMatch {
        variant: GameVariant,
        time_control: TimeControl,
    },
    CancelSearch,
    GetSearchStatus,
    /// Join the game's room after `match_found`.
    StartGame {
        game_id: GameId,
    },
    /// Rejoin after a reconnect; resumes the paused clock.
    Rejoin {
        game_id: GameId,
    },
    Move {
        game_id: GameId,
        /// SAN, e.g. `Nf3`.
        #[serde(rename = "move")]
        san: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
    Resign {
        game_id: GameId,
    },
    OfferDraw {
        game_id: GameId,
    },
    AcceptDraw {
        game_id: GameId,
    },
    DeclineDraw {
        game_id: GameId,
    },
    OfferRematch {
        game_id: GameId,
    },
    AcceptRematch {
        game_id: GameId,
    },
    DeclineRematch {
        game_id: GameId,
    },
    /// Client claims the opponent's flag fell; server re-checks authoritatively.
    TimeUp {
        game_id: GameId,
        player_color: Color,
    },
    RequestTimeSync {
        game_id: GameId,
    },
}

/// Updates pushed to one client socket.
#[cfg_attr(feature = "server", derive(actix::Message))]
#[cfg_attr(feature = "server", rtype(result = "()"))]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientUpdate {
    MatchFound {
        game_id: GameId,
        opponent: OpponentDto,
        rating_changes: RatingChangesDto,
        search_duration_ms: u64,
        final_range: u32,
    },
    SearchStatus {
        is_searching: bool,
        current_range: u32,
        search_duration_ms: u64,
    },
    SearchCancelled,
    GameJoined {
        snapshot: GameSnapshotDto,
    },
    Move {
        game_id: GameId,
        player: Color,
        san: String,
        from: String,
        to: String,
        fen: String,
        pgn: String,
        move_number: u32,
        time_left: ClockDto,
    },
    GameOver {
        game_id: GameId,
        winner: Option<Color>,
        reason: EndReason,
        result: Score,
        final_fen: String,
        final_pgn: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        rating_changes: Option<RatingChangesDto>,
    },
    DrawOffered {
        game_id: GameId,
        by: Color,
    },
    DrawDeclined {
        game_id: GameId,
        by: Color,
    },
    RematchOffered {
        game_id: GameId,
        by: Color,
    },
    RematchAccepted {
        game_id: GameId,
        new_game_id: GameId,
    },
    RematchDeclined {
        game_id: GameId,
        by: Color,
    },
    TimeUpdate {
        game_id: GameId,
        white_ms: u64,
        black_ms: u64,
        current_turn: Color,
        now: UnixTime,
    },
    /// The opponent's socket dropped; their clock keeps running.
    OpponentReconnecting {
        game_id: GameId,
    },
    OpponentReconnected {
        game_id: GameId,
    },
    /// Per-socket failure reply; never broadcast to a room.
    CommandRejected {
        message: String,
    },
}
