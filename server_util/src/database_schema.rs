// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::dto::{GamePlayerDto, MoveDto, RatingChangesDto};
use core_protocol::game::{
    Color, EndReason, GameVariant, Ratings, Score, TimeControl, PROVISIONAL_GAMES,
};
use core_protocol::id::{GameId, PlayerId};
use core_protocol::UnixTime;
use serde::{Deserialize, Serialize};

/// Length of the per-profile completed-game ring buffer, which feeds the
/// matchmaker's color-balance heuristics.
pub const RECENT_GAMES_MAX: usize = 10;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    InProgress,
    Completed,
}

/// Final verdict stored inside a game document.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GameResultItem {
    pub winner: Option<Color>,
    pub reason: EndReason,
    pub score: Score,
}

/// A database row storing one game document. Hash key: `game_id`.
/// `players` is ordered `[white, black]` so rating patches can address a seat
/// by index.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GameItem {
    pub game_id: GameId,
    pub players: Vec<GamePlayerDto>,
    pub variant: GameVariant,
    pub time_control: TimeControl,
    pub initial_fen: String,
    #[serde(default)]
    pub moves: Vec<MoveDto>,
    #[serde(default)]
    pub pgn: String,
    /// Snapshot of the position after every 10th move.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fen_history: Vec<String>,
    pub game_status: GameStatus,
    pub started_at: UnixTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<UnixTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GameResultItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating_changes: Option<RatingChangesDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rematch_of: Option<GameId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rematch_game_id: Option<GameId>,
}

impl GameItem {
    pub fn seat_index(color: Color) -> usize {
        match color {
            Color::White => 0,
            Color::Black => 1,
        }
    }
}

/// One line of a profile's completed-game history, head = most recent.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RecentGameItem {
    pub game_id: GameId,
    pub color: Color,
    pub score: Score,
    pub variant: GameVariant,
    pub ended_at: UnixTime,
}

/// A database row storing one player profile. Hash key: `player_id`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProfileItem {
    pub player_id: PlayerId,
    #[serde(default)]
    pub ratings: Ratings,
    #[serde(default)]
    pub games_played: u32,
    #[serde(default)]
    pub wins: u32,
    #[serde(default)]
    pub losses: u32,
    #[serde(default)]
    pub draws: u32,
    #[serde(default)]
    pub recent_games: Vec<RecentGameItem>,
}

impl ProfileItem {
    pub fn new(player_id: PlayerId) -> Self {
        Self {
            player_id,
            ratings: Ratings::default(),
            games_played: 0,
            wins: 0,
            losses: 0,
            draws: 0,
            recent_games: Vec::new(),
        }
    }

    pub fn rating(&self, variant: GameVariant) -> u16 {
        self.ratings.get(variant)
    }

    pub fn provisional(&self) -> bool {
        self.games_played < PROVISIONAL_GAMES
    }

    /// Folds one finalized game into the profile: counters, rating, history.
    pub fn record_result(
        &mut self,
        game_id: GameId,
        variant: GameVariant,
        color: Color,
        score: Score,
        new_rating: u16,
        ended_at: UnixTime,
    ) {
        self.games_played += 1;
        match score.winner() {
            Some(winner) if winner == color => self.wins += 1,
            Some(_) => self.losses += 1,
            None => self.draws += 1,
        }
        self.ratings.set(variant, new_rating);
        self.recent_games.insert(
            0,
            RecentGameItem {
                game_id,
                color,
                score,
                variant,
                ended_at,
            },
        );
        self.recent_games.truncate(RECENT_GAMES_MAX);
    }

    /// Colors of recent completed games, most recent first.
    pub fn recent_colors(&self) -> Vec<Color> {
        self.recent_games.iter().map(|game| game.color).collect()
    }
}
