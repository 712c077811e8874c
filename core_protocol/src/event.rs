// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::dto::{ClockDto, GameInfoDto, GamePlayerDto, MatchSeatDto, RatingChangesDto};
use crate::game::{Color, EndReason, GameVariant, Score};
use crate::id::{GameId, NodeId, PlayerId};
use crate::UnixTime;
use serde::{Deserialize, Serialize};

/// One bus channel per class of event.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Moves,
    StateUpdates,
    Events,
    Time,
    Matchmaking,
    Players,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::Moves,
        Topic::StateUpdates,
        Topic::Events,
        Topic::Time,
        Topic::Matchmaking,
        Topic::Players,
    ];

    pub fn channel(self) -> &'static str {
        match self {
            Self::Moves => "moves",
            Self::StateUpdates => "state_updates",
            Self::Events => "events",
            Self::Time => "time",
            Self::Matchmaking => "matchmaking",
            Self::Players => "players",
        }
    }
}

/// Everything the core publishes, replicated to every node and consumed by the
/// persistence pipeline. Payload shapes are fixed per variant; the
/// `eventType` discriminator is validated at the bus boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum GameEvent {
    GameStarted {
        game_id: GameId,
        players: Vec<GamePlayerDto>,
        info: GameInfoDto,
        initial_fen: String,
        started_at: UnixTime,
        rating_changes: RatingChangesDto,
        #[serde(skip_serializing_if = "Option::is_none")]
        rematch_of: Option<GameId>,
    },
    MoveMade {
        game_id: GameId,
        player_id: PlayerId,
        player: Color,
        san: String,
        from: String,
        to: String,
        fen: String,
        pgn: String,
        move_number: u32,
        time_left: ClockDto,
        /// Set when this move itself ended the game.
        terminal: bool,
    },
    GameEnded {
        game_id: GameId,
        winner: Option<Color>,
        reason: EndReason,
        score: Score,
        final_fen: String,
        final_pgn: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        rating_changes: Option<RatingChangesDto>,
    },
    PlayerResigned {
        game_id: GameId,
        player_id: PlayerId,
        player: Color,
    },
    DrawOffered {
        game_id: GameId,
        by: Color,
    },
    DrawAccepted {
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
    },
    TimeUp {
        game_id: GameId,
        player: Color,
    },
    PlayerConnected {
        player_id: PlayerId,
    },
    PlayerDisconnected {
        player_id: PlayerId,
        #[serde(skip_serializing_if = "Option::is_none")]
        game_id: Option<GameId>,
    },
    PlayerReconnected {
        player_id: PlayerId,
        #[serde(skip_serializing_if = "Option::is_none")]
        game_id: Option<GameId>,
    },
    MatchFound {
        game_id: GameId,
        game_type_key: String,
        rating_changes: RatingChangesDto,
        seats: Vec<MatchSeatDto>,
    },
    RatingUpdated {
        game_id: GameId,
        player_id: PlayerId,
        color: Color,
        variant: GameVariant,
        old_rating: u16,
        new_rating: u16,
    },
}

impl GameEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::MoveMade { .. } => Topic::Moves,
            Self::GameStarted { .. } | Self::GameEnded { .. } => Topic::StateUpdates,
            Self::PlayerResigned { .. }
            | Self::DrawOffered { .. }
            | Self::DrawAccepted { .. }
            | Self::DrawDeclined { .. }
            | Self::RematchOffered { .. }
            | Self::RematchAccepted { .. }
            | Self::RematchDeclined { .. } => Topic::Events,
            Self::TimeUpdate { .. } | Self::TimeUp { .. } => Topic::Time,
            Self::MatchFound { .. } => Topic::Matchmaking,
            Self::PlayerConnected { .. }
            | Self::PlayerDisconnected { .. }
            | Self::PlayerReconnected { .. }
            | Self::RatingUpdated { .. } => Topic::Players,
        }
    }

    /// Partition key. Events without one are not ordered relative to anything.
    pub fn game_id(&self) -> Option<&GameId> {
        match self {
            Self::GameStarted { game_id, .. }
            | Self::MoveMade { game_id, .. }
            | Self::GameEnded { game_id, .. }
            | Self::PlayerResigned { game_id, .. }
            | Self::DrawOffered { game_id, .. }
            | Self::DrawAccepted { game_id, .. }
            | Self::DrawDeclined { game_id, .. }
            | Self::RematchOffered { game_id, .. }
            | Self::RematchAccepted { game_id, .. }
            | Self::RematchDeclined { game_id, .. }
            | Self::TimeUpdate { game_id, .. }
            | Self::TimeUp { game_id, .. }
            | Self::MatchFound { game_id, .. }
            | Self::RatingUpdated { game_id, .. } => Some(game_id),
            Self::PlayerDisconnected { game_id, .. }
            | Self::PlayerReconnected { game_id, .. } => game_id.as_ref(),
            Self::PlayerConnected { .. } => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::GameStarted { .. } => "game_started",
            Self::MoveMade { .. } => "move_made",
            Self::GameEnded { .. } => "game_ended",
            Self::PlayerResigned { .. } => "player_resigned",
            Self::DrawOffered { .. } => "draw_offered",
            Self::DrawAccepted { .. } => "draw_accepted",
            Self::DrawDeclined { .. } => "draw_declined",
            Self::RematchOffered { .. } => "rematch_offered",
            Self::RematchAccepted { .. } => "rematch_accepted",
            Self::RematchDeclined { .. } => "rematch_declined",
            Self::TimeUpdate { .. } => "time_update",
            Self::TimeUp { .. } => "time_up",
            Self::PlayerConnected { .. } => "player_connected",
            Self::PlayerDisconnected { .. } => "player_disconnected",
            Self::PlayerReconnected { .. } => "player_reconnected",
            Self::MatchFound { .. } => "match_found",
            Self::RatingUpdated { .. } => "rating_updated",
        }
    }
}

/// Wire envelope for one bus message.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub origin_node_id: NodeId,
    /// Per-origin monotone sequence number; part of the dedup key.
    pub seq: u64,
    pub timestamp: UnixTime,
    pub channel: Topic,
    #[serde(flatten)]
    pub event: GameEvent,
}

impl EventEnvelope {
    pub fn game_id(&self) -> Option<&GameId> {
        self.event.game_id()
    }

    /// Consumers deduplicate on this.
    pub fn dedup_key(&self) -> (Option<String>, &'static str, UnixTime, u64) {
        (
            self.game_id().map(|id| id.to_string()),
            self.event.event_type(),
            self.timestamp,
            self.seq,
        )
    }
}
