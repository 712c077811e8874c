// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::game::{Color, GameVariant, TimeControl};
use crate::id::{GameId, PlayerId};
use crate::UnixTime;
use serde::{Deserialize, Serialize};

/// One seat in a game: who sits where, at what strength.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GamePlayerDto {
    pub player_id: PlayerId,
    pub color: Color,
    pub pre_rating: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_rating: Option<u16>,
}

/// Pre-computed rating outcomes for one player, shown before the game ends.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RatingChangeDto {
    pub on_win: i16,
    pub on_loss: i16,
    pub on_draw: i16,
    pub provisional: bool,
}

/// Rating outcomes for both seats of one game.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RatingChangesDto {
    pub white: RatingChangeDto,
    pub black: RatingChangeDto,
}

impl RatingChangesDto {
    pub fn for_color(&self, color: Color) -> RatingChangeDto {
        match color {
            Color::White => self.white,
            Color::Black => self.black,
        }
    }
}

/// One accepted move, as stored and replayed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MoveDto {
    pub san: String,
    pub from: String,
    pub to: String,
    pub timestamp: UnixTime,
}

/// What a searching player learns about the other side of a match.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpponentDto {
    pub player_id: PlayerId,
    pub rating: u16,
    pub provisional: bool,
}

/// Variant and clock parameters of one game.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameInfoDto {
    pub variant: GameVariant,
    pub time_control: TimeControl,
}

/// Authoritative clock values, milliseconds.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClockDto {
    pub white_ms: u64,
    pub black_ms: u64,
}

impl ClockDto {
    pub fn get(&self, color: Color) -> u64 {
        match color {
            Color::White => self.white_ms,
            Color::Black => self.black_ms,
        }
    }

    pub fn set(&mut self, color: Color, ms: u64) {
        match color {
            Color::White => self.white_ms = ms,
            Color::Black => self.black_ms = ms,
        }
    }
}

/// One side of a freshly formed pair, as carried on the matchmaking topic so
/// whichever node holds the player's socket can notify them.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatchSeatDto {
    pub player_id: PlayerId,
    pub opponent: OpponentDto,
    pub search_duration_ms: u64,
    pub final_range: u32,
}

/// Full game snapshot sent on join/rejoin so a client can render mid-game.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshotDto {
    pub game_id: GameId,
    pub players: Vec<GamePlayerDto>,
    pub info: GameInfoDto,
    pub initial_fen: String,
    pub moves: Vec<MoveDto>,
    pub pgn: String,
    pub turn: Color,
    pub time_left: ClockDto,
    pub started_at: UnixTime,
    pub game_over: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<Color>,
}
