// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::database_schema::{GameItem, GameResultItem, GameStatus, ProfileItem};
use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use core_protocol::dto::MoveDto;
use core_protocol::game::Color;
use core_protocol::id::{GameId, PlayerId};
use core_protocol::UnixTime;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_dynamo::aws_sdk_dynamodb_1::{from_item, to_attribute_value, to_item};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("dynamodb: {0}")]
    Dynamo(String),
    #[error("serde: {0}")]
    Serde(String),
}

/// The durable document store the core consumes: finalized games and player
/// profiles. Writes must be idempotent per game id; at-least-once consumers
/// replay them.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    /// Writes the skeleton document for a new game. Returns false if the
    /// document already existed.
    async fn create_game(&self, game: GameItem) -> Result<bool, DbError>;
    async fn get_game(&self, game_id: &GameId) -> Result<Option<GameItem>, DbError>;
    /// Appends one accepted move and rewrites the PGN; optionally snapshots
    /// the position into `fen_history`.
    async fn append_move(
        &self,
        game_id: &GameId,
        mv: &MoveDto,
        pgn: &str,
        fen_snapshot: Option<&str>,
    ) -> Result<(), DbError>;
    /// Marks a game completed. `final_pgn` is left untouched when [`None`]
    /// (synthetic game-end events don't carry one).
    async fn finalize_game(
        &self,
        game_id: &GameId,
        result: &GameResultItem,
        final_pgn: Option<&str>,
        ended_at: UnixTime,
    ) -> Result<(), DbError>;
    /// Patches one seat's post-game rating inside the game document.
    async fn set_post_rating(
        &self,
        game_id: &GameId,
        color: Color,
        post_rating: u16,
    ) -> Result<(), DbError>;
    /// Cross-links a finished game with the rematch it spawned.
    async fn link_rematch(
        &self,
        game_id: &GameId,
        rematch_game_id: &GameId,
    ) -> Result<(), DbError>;

    async fn get_profile(&self, player_id: &PlayerId) -> Result<Option<ProfileItem>, DbError>;
    async fn get_or_create_profile(&self, player_id: &PlayerId) -> Result<ProfileItem, DbError>;
    async fn put_profile(&self, profile: ProfileItem) -> Result<(), DbError>;
}

/// DynamoDB-backed durable store. Writes are capped at 5 s by the
/// client-level timeout config.
pub struct Database {
    client: Client,
    /// Abort and return [`Ok`] right before writing anything.
    read_only: bool,
}

impl Database {
    const REGION: &'static str = "us-east-1";
    const GAMES_TABLE_NAME: &'static str = "chess_games";
    const PROFILES_TABLE_NAME: &'static str = "chess_profiles";

    pub async fn new(read_only: bool) -> Self {
        let shared_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(Self::REGION))
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(Duration::from_secs(5))
                    .operation_attempt_timeout(Duration::from_secs(5))
                    .build(),
            )
            .load()
            .await;
        Self {
            client: Client::new(&shared_config),
            read_only,
        }
    }

    async fn put<I: Serialize + Send>(
        &self,
        item: I,
        table: &'static str,
    ) -> Result<(), DbError> {
        let ser = to_item(item).map_err(|e| DbError::Serde(e.to_string()))?;

        if self.read_only {
            return Ok(());
        }

        self.client
            .put_item()
            .table_name(table)
            .set_item(Some(ser))
            .send()
            .await
            .map_err(|e| DbError::Dynamo(e.to_string()))?;
        Ok(())
    }

    async fn get<O: DeserializeOwned>(
        &self,
        table: &'static str,
        hash_name: &'static str,
        hash_value: &str,
    ) -> Result<Option<O>, DbError> {
        let output = self
            .client
            .get_item()
            .table_name(table)
            .key(hash_name, AttributeValue::S(hash_value.to_owned()))
            .send()
            .await
            .map_err(|e| DbError::Dynamo(e.to_string()))?;

        match output.item {
            Some(item) => from_item(item)
                .map(Some)
                .map_err(|e| DbError::Serde(e.to_string())),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DurableStore for Database {
    async fn create_game(&self, game: GameItem) -> Result<bool, DbError> {
        let ser = to_item(game).map_err(|e| DbError::Serde(e.to_string()))?;

        if self.read_only {
            return Ok(true);
        }

        let result = self
            .client
            .put_item()
            .table_name(Self::GAMES_TABLE_NAME)
            .set_item(Some(ser))
            .condition_expression("attribute_not_exists(game_id)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_conditional_check_failed_exception() {
                    Ok(false)
                } else {
                    Err(DbError::Dynamo(service_error.to_string()))
                }
            }
        }
    }

    async fn get_game(&self, game_id: &GameId) -> Result<Option<GameItem>, DbError> {
        self.get(Self::GAMES_TABLE_NAME, "game_id", game_id.as_str())
            .await
    }

    async fn append_move(
        &self,
        game_id: &GameId,
        mv: &MoveDto,
        pgn: &str,
        fen_snapshot: Option<&str>,
    ) -> Result<(), DbError> {
        if self.read_only {
            return Ok(());
        }

        let move_value = to_attribute_value(mv).map_err(|e| DbError::Serde(e.to_string()))?;

        let mut expression =
            String::from("SET moves = list_append(if_not_exists(moves, :empty), :mv), pgn = :pgn");
        let mut request = self
            .client
            .update_item()
            .table_name(Self::GAMES_TABLE_NAME)
            .key("game_id", AttributeValue::S(game_id.to_string()))
            .expression_attribute_values(":mv", AttributeValue::L(vec![move_value]))
            .expression_attribute_values(":empty", AttributeValue::L(Vec::new()))
            .expression_attribute_values(":pgn", AttributeValue::S(pgn.to_owned()));

        if let Some(fen) = fen_snapshot {
            expression
                .push_str(", fen_history = list_append(if_not_exists(fen_history, :empty), :fen)");
            request = request.expression_attribute_values(
                ":fen",
                AttributeValue::L(vec![AttributeValue::S(fen.to_owned())]),
            );
        }

        request
            .update_expression(expression)
            .send()
            .await
            .map_err(|e| DbError::Dynamo(e.to_string()))?;
        Ok(())
    }

    async fn finalize_game(
        &self,
        game_id: &GameId,
        result: &GameResultItem,
        final_pgn: Option<&str>,
        ended_at: UnixTime,
    ) -> Result<(), DbError> {
        if self.read_only {
            return Ok(());
        }

        let status_value =
            to_attribute_value(GameStatus::Completed).map_err(|e| DbError::Serde(e.to_string()))?;
        let result_value =
            to_attribute_value(result).map_err(|e| DbError::Serde(e.to_string()))?;

        let mut expression =
            String::from("SET game_status = :status, #result = :result, ended_at = :ended");
        let mut request = self
            .client
            .update_item()
            .table_name(Self::GAMES_TABLE_NAME)
            .key("game_id", AttributeValue::S(game_id.to_string()))
            .expression_attribute_names("#result", "result")
            .expression_attribute_values(":status", status_value)
            .expression_attribute_values(":result", result_value)
            .expression_attribute_values(":ended", AttributeValue::N(ended_at.to_string()));

        if let Some(pgn) = final_pgn {
            expression.push_str(", pgn = :pgn");
            request =
                request.expression_attribute_values(":pgn", AttributeValue::S(pgn.to_owned()));
        }

        request
            .update_expression(expression)
            .send()
            .await
            .map_err(|e| DbError::Dynamo(e.to_string()))?;
        Ok(())
    }

    async fn set_post_rating(
        &self,
        game_id: &GameId,
        color: Color,
        post_rating: u16,
    ) -> Result<(), DbError> {
        if self.read_only {
            return Ok(());
        }

        let seat = GameItem::seat_index(color);
        self.client
            .update_item()
            .table_name(Self::GAMES_TABLE_NAME)
            .key("game_id", AttributeValue::S(game_id.to_string()))
            .update_expression(format!("SET players[{}].post_rating = :rating", seat))
            .expression_attribute_values(":rating", AttributeValue::N(post_rating.to_string()))
            .send()
            .await
            .map_err(|e| DbError::Dynamo(e.to_string()))?;
        Ok(())
    }

    async fn link_rematch(
        &self,
        game_id: &GameId,
        rematch_game_id: &GameId,
    ) -> Result<(), DbError> {
        if self.read_only {
            return Ok(());
        }

        self.client
            .update_item()
            .table_name(Self::GAMES_TABLE_NAME)
            .key("game_id", AttributeValue::S(game_id.to_string()))
            .update_expression("SET rematch_game_id = :next")
            .expression_attribute_values(
                ":next",
                AttributeValue::S(rematch_game_id.to_string()),
            )
            .send()
            .await
            .map_err(|e| DbError::Dynamo(e.to_string()))?;
        Ok(())
    }

    async fn get_profile(&self, player_id: &PlayerId) -> Result<Option<ProfileItem>, DbError> {
        self.get(Self::PROFILES_TABLE_NAME, "player_id", player_id.as_str())
            .await
    }

    async fn get_or_create_profile(&self, player_id: &PlayerId) -> Result<ProfileItem, DbError> {
        match self.get_profile(player_id).await? {
            Some(profile) => Ok(profile),
            None => {
                let profile = ProfileItem::new(player_id.clone());
                self.put_profile(profile.clone()).await?;
                Ok(profile)
            }
        }
    }

    async fn put_profile(&self, profile: ProfileItem) -> Result<(), DbError> {
        self.put(profile, Self::PROFILES_TABLE_NAME).await
    }
}

/// In-process durable store with the same contract, for tests and single-node
/// development.
#[derive(Default)]
pub struct MemoryDurableStore {
    games: Mutex<HashMap<String, GameItem>>,
    profiles: Mutex<HashMap<String, ProfileItem>>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn create_game(&self, game: GameItem) -> Result<bool, DbError> {
        let mut games = self.games.lock().unwrap();
        if games.contains_key(game.game_id.as_str()) {
            return Ok(false);
        }
        games.insert(game.game_id.to_string(), game);
        Ok(true)
    }

    async fn get_game(&self, game_id: &GameId) -> Result<Option<GameItem>, DbError> {
        Ok(self.games.lock().unwrap().get(game_id.as_str()).cloned())
    }

    async fn append_move(
        &self,
        game_id: &GameId,
        mv: &MoveDto,
        pgn: &str,
        fen_snapshot: Option<&str>,
    ) -> Result<(), DbError> {
        let mut games = self.games.lock().unwrap();
        let game = games
            .get_mut(game_id.as_str())
            .ok_or_else(|| DbError::Dynamo("no such game".to_owned()))?;
        game.moves.push(mv.clone());
        game.pgn = pgn.to_owned();
        if let Some(fen) = fen_snapshot {
            game.fen_history.push(fen.to_owned());
        }
        Ok(())
    }

    async fn finalize_game(
        &self,
        game_id: &GameId,
        result: &GameResultItem,
        final_pgn: Option<&str>,
        ended_at: UnixTime,
    ) -> Result<(), DbError> {
        let mut games = self.games.lock().unwrap();
        let game = games
            .get_mut(game_id.as_str())
            .ok_or_else(|| DbError::Dynamo("no such game".to_owned()))?;
        game.game_status = GameStatus::Completed;
        game.result = Some(*result);
        game.ended_at = Some(ended_at);
        if let Some(pgn) = final_pgn {
            game.pgn = pgn.to_owned();
        }
        Ok(())
    }

    async fn set_post_rating(
        &self,
        game_id: &GameId,
        color: Color,
        post_rating: u16,
    ) -> Result<(), DbError> {
        let mut games = self.games.lock().unwrap();
        let game = games
            .get_mut(game_id.as_str())
            .ok_or_else(|| DbError::Dynamo("no such game".to_owned()))?;
        let seat = GameItem::seat_index(color);
        if let Some(player) = game.players.get_mut(seat) {
            player.post_rating = Some(post_rating);
        }
        Ok(())
    }

    async fn link_rematch(
        &self,
        game_id: &GameId,
        rematch_game_id: &GameId,
    ) -> Result<(), DbError> {
        let mut games = self.games.lock().unwrap();
        if let Some(game) = games.get_mut(game_id.as_str()) {
            game.rematch_game_id = Some(rematch_game_id.clone());
        }
        Ok(())
    }

    async fn get_profile(&self, player_id: &PlayerId) -> Result<Option<ProfileItem>, DbError> {
        Ok(self
            .profiles
            .lock()
            .unwrap()
            .get(player_id.as_str())
            .cloned())
    }

    async fn get_or_create_profile(&self, player_id: &PlayerId) -> Result<ProfileItem, DbError> {
        let mut profiles = self.profiles.lock().unwrap();
        Ok(profiles
            .entry(player_id.to_string())
            .or_insert_with(|| ProfileItem::new(player_id.clone()))
            .clone())
    }

    async fn put_profile(&self, profile: ProfileItem) -> Result<(), DbError> {
        self.profiles
            .lock()
            .unwrap()
            .insert(profile.player_id.to_string(), profile);
        Ok(())
    }
}
