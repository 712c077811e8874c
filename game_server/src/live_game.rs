// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::error::CoreError;
use core_protocol::dto::{
    ClockDto, GameInfoDto, GamePlayerDto, GameSnapshotDto, MoveDto, RatingChangesDto,
};
use core_protocol::game::{Color, EndReason, Score, GameType};
use core_protocol::id::{GameId, PlayerId};
use core_protocol::UnixTime;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;

/// Live games evaporate from the store after two hours without refresh.
pub const LIVE_GAME_TTL_SECS: u64 = 7200;

/// The sole authoritative record of a game in play. Stored as a hash whose
/// nested values are JSON-encoded; `to_fields`/`from_fields` are an exact
/// round trip.
#[derive(Clone, Debug, PartialEq)]
pub struct LiveGame {
    pub game_id: GameId,
    /// Ordered `[white, black]`.
    pub players: Vec<GamePlayerDto>,
    pub time_left: ClockDto,
    pub info: GameInfoDto,
    pub initial_fen: String,
    pub moves: Vec<MoveDto>,
    pub pgn: String,
    pub turn: Color,
    pub started_at: UnixTime,
    pub last_move_at: UnixTime,
    pub game_over: bool,
    pub winner: Option<Color>,
    pub result: Option<Score>,
    pub end_reason: Option<EndReason>,
    pub ended_at: Option<UnixTime>,
    pub rating_changes: RatingChangesDto,
    pub draw_offered_by: Option<Color>,
    pub rematch_offered_by: Option<Color>,
    pub rematch_game_id: Option<GameId>,
}

fn json<T: Serialize>(value: &T) -> String {
    // Only fails on non-string map keys; none of ours have any.
    serde_json::to_string(value).unwrap_or_default()
}

fn corrupt(field: &str) -> CoreError {
    CoreError::Internal(format!("corrupt live game field: {}", field))
}

fn parse_json<T: DeserializeOwned>(
    fields: &HashMap<String, String>,
    name: &str,
) -> Result<T, CoreError> {
    let raw = fields.get(name).ok_or_else(|| corrupt(name))?;
    serde_json::from_str(raw).map_err(|_| corrupt(name))
}

fn parse_u64(fields: &HashMap<String, String>, name: &str) -> Result<u64, CoreError> {
    fields
        .get(name)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| corrupt(name))
}

impl LiveGame {
    pub fn new(
        game_id: GameId,
        white: GamePlayerDto,
        black: GamePlayerDto,
        game_type: GameType,
        initial_fen: String,
        rating_changes: RatingChangesDto,
        now: UnixTime,
    ) -> Self {
        let base_ms = game_type.time_control.base_ms();
        Self {
            game_id,
            players: vec![white, black],
            time_left: ClockDto {
                white_ms: base_ms,
                black_ms: base_ms,
            },
            info: GameInfoDto {
                variant: game_type.variant,
                time_control: game_type.time_control,
            },
            initial_fen,
            moves: Vec::new(),
            pgn: String::new(),
            turn: Color::White,
            started_at: now,
            last_move_at: now,
            game_over: false,
            winner: None,
            result: None,
            end_reason: None,
            ended_at: None,
            rating_changes,
            draw_offered_by: None,
            rematch_offered_by: None,
            rematch_game_id: None,
        }
    }

    pub fn seat(&self, color: Color) -> &GamePlayerDto {
        // Invariant: players is always [white, black].
        match color {
            Color::White => &self.players[0],
            Color::Black => &self.players[1],
        }
    }

    pub fn seat_mut(&mut self, color: Color) -> &mut GamePlayerDto {
        match color {
            Color::White => &mut self.players[0],
            Color::Black => &mut self.players[1],
        }
    }

    pub fn player_color(&self, player_id: &PlayerId) -> Option<Color> {
        self.players
            .iter()
            .find(|player| &player.player_id == player_id)
            .map(|player| player.color)
    }

    pub fn opponent(&self, player_id: &PlayerId) -> Option<&GamePlayerDto> {
        self.players
            .iter()
            .find(|player| &player.player_id != player_id)
    }

    pub fn move_sans(&self) -> impl Iterator<Item = &str> {
        self.moves.iter().map(|mv| mv.san.as_str())
    }

    pub fn game_type(&self) -> GameType {
        GameType {
            variant: self.info.variant,
            time_control: self.info.time_control,
        }
    }

    pub fn snapshot(&self) -> GameSnapshotDto {
        GameSnapshotDto {
            game_id: self.game_id.clone(),
            players: self.players.clone(),
            info: self.info,
            initial_fen: self.initial_fen.clone(),
            moves: self.moves.clone(),
            pgn: self.pgn.clone(),
            turn: self.turn,
            time_left: self.time_left,
            started_at: self.started_at,
            game_over: self.game_over,
            winner: self.winner,
        }
    }

    /// Hash representation; field names are part of the persistence contract.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("gameId".to_owned(), self.game_id.to_string()),
            ("players".to_owned(), json(&self.players)),
            ("timeLeftMs".to_owned(), json(&self.time_left)),
            ("gameInfo".to_owned(), json(&self.info)),
            ("initialFEN".to_owned(), self.initial_fen.clone()),
            ("moves".to_owned(), json(&self.moves)),
            ("pgn".to_owned(), self.pgn.clone()),
            ("turn".to_owned(), self.turn.as_str().to_owned()),
            ("startedAt".to_owned(), self.started_at.to_string()),
            ("lastMoveAt".to_owned(), self.last_move_at.to_string()),
            ("ratingChanges".to_owned(), json(&self.rating_changes)),
        ];
        if self.game_over {
            fields.push(("gameOver".to_owned(), "true".to_owned()));
        }
        if let Some(winner) = self.winner {
            fields.push(("winner".to_owned(), winner.as_str().to_owned()));
        }
        if let Some(result) = self.result {
            fields.push(("result".to_owned(), result.as_str().to_owned()));
        }
        if let Some(reason) = self.end_reason {
            fields.push(("endReason".to_owned(), reason.as_str().to_owned()));
        }
        if let Some(ended_at) = self.ended_at {
            fields.push(("endedAt".to_owned(), ended_at.to_string()));
        }
        if let Some(by) = self.draw_offered_by {
            fields.push(("drawOfferedBy".to_owned(), by.as_str().to_owned()));
        }
        if let Some(by) = self.rematch_offered_by {
            fields.push(("rematchOfferedBy".to_owned(), by.as_str().to_owned()));
        }
        if let Some(id) = &self.rematch_game_id {
            fields.push(("rematchGameId".to_owned(), id.to_string()));
        }
        fields
    }

    pub fn from_fields(
        game_id: GameId,
        fields: &HashMap<String, String>,
    ) -> Result<Self, CoreError> {
        let players: Vec<GamePlayerDto> = parse_json(fields, "players")?;
        if players.len() != 2 {
            return Err(corrupt("players"));
        }
        Ok(Self {
            game_id,
            players,
            time_left: parse_json(fields, "timeLeftMs")?,
            info: parse_json(fields, "gameInfo")?,
            initial_fen: fields
                .get("initialFEN")
                .cloned()
                .ok_or_else(|| corrupt("initialFEN"))?,
            moves: parse_json(fields, "moves")?,
            pgn: fields.get("pgn").cloned().unwrap_or_default(),
            turn: fields
                .get("turn")
                .and_then(|raw| raw.parse().ok())
                .ok_or_else(|| corrupt("turn"))?,
            started_at: parse_u64(fields, "startedAt")?,
            last_move_at: parse_u64(fields, "lastMoveAt")?,
            game_over: fields.get("gameOver").map(String::as_str) == Some("true"),
            winner: fields.get("winner").and_then(|raw| raw.parse().ok()),
            result: fields.get("result").and_then(|raw| raw.parse().ok()),
            end_reason: fields.get("endReason").and_then(|raw| raw.parse().ok()),
            ended_at: fields.get("endedAt").and_then(|raw| raw.parse().ok()),
            rating_changes: parse_json(fields, "ratingChanges")?,
            draw_offered_by: fields.get("drawOfferedBy").and_then(|raw| raw.parse().ok()),
            rematch_offered_by: fields
                .get("rematchOfferedBy")
                .and_then(|raw| raw.parse().ok()),
            rematch_game_id: fields.get("rematchGameId").map(|s| GameId::new(s.as_str())),
        })
    }
}
