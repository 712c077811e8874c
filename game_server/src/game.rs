// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::chess::{ChessEngine, TerminalReason};
use crate::clock::{ClockRepo, TIMEOUT_TOLERANCE_MS};
use crate::error::CoreError;
use crate::keys;
use crate::live_game::{LiveGame, LIVE_GAME_TTL_SECS};
use crate::publisher::EventPublisher;
use crate::rating;
use core_protocol::dto::{GamePlayerDto, MoveDto};
use core_protocol::event::GameEvent;
use core_protocol::game::{Color, EndReason, GameType, Score, STANDARD_START_FEN};
use core_protocol::get_unix_time_now;
use core_protocol::id::{GameId, PlayerId};
use core_protocol::rpc::ClientUpdate;
use log::{error, warn};
use server_util::database::DurableStore;
use server_util::database_schema::{GameItem, GameStatus, ProfileItem};
use server_util::live_store::LiveStore;
use std::sync::Arc;
use std::time::Duration;

/// One retry with this backoff before a live-store write failure becomes the
/// caller's problem.
const WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// The authoritative game state machine: move validation, clock deduction,
/// terminal classification, and exactly-once finalization.
pub struct GameRepo<E: ChessEngine> {
    engine: Arc<E>,
    live: Arc<dyn LiveStore>,
    durable: Arc<dyn DurableStore>,
    clocks: Arc<ClockRepo>,
    publisher: EventPublisher,
}

impl<E: ChessEngine> Clone for GameRepo<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            live: Arc::clone(&self.live),
            durable: Arc::clone(&self.durable),
            clocks: Arc::clone(&self.clocks),
            publisher: self.publisher.clone(),
        }
    }
}

impl<E: ChessEngine> GameRepo<E> {
    pub fn new(
        engine: Arc<E>,
        live: Arc<dyn LiveStore>,
        durable: Arc<dyn DurableStore>,
        clocks: Arc<ClockRepo>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            engine,
            live,
            durable,
            clocks,
            publisher,
        }
    }

    pub fn clocks(&self) -> &Arc<ClockRepo> {
        &self.clocks
    }

    /// Creates a rated game between two profiles, white first. Writes the
    /// durable skeleton, the LiveGame, the clock entry, and publishes
    /// `game_started`.
    pub async fn create_game(
        &self,
        white: &ProfileItem,
        black: &ProfileItem,
        game_type: GameType,
        rematch_of: Option<GameId>,
    ) -> Result<LiveGame, CoreError> {
        let variant = game_type.variant;
        let rating_changes = rating::rating_changes(
            (white.rating(variant), white.games_played),
            (black.rating(variant), black.games_played),
        );
        let now = get_unix_time_now();
        let game = LiveGame::new(
            GameId::generate(),
            GamePlayerDto {
                player_id: white.player_id.clone(),
                color: Color::White,
                pre_rating: white.rating(variant),
                post_rating: None,
            },
            GamePlayerDto {
                player_id: black.player_id.clone(),
                color: Color::Black,
                pre_rating: black.rating(variant),
                post_rating: None,
            },
            game_type,
            STANDARD_START_FEN.to_owned(),
            rating_changes,
            now,
        );

        // The pipeline upserts the same skeleton from game_started, so a
        // failure here only costs immediacy.
        if let Err(e) = self
            .durable
            .create_game(skeleton(&game, rematch_of.clone()))
            .await
        {
            warn!("skeleton write failed for game {}: {}", game.game_id, e);
        }

        self.persist(&game).await?;
        self.clocks.track(&game, now);

        if let Some(previous) = &rematch_of {
            if let Err(e) = self.durable.link_rematch(previous, &game.game_id).await {
                warn!("rematch link failed for game {}: {}", previous, e);
            }
        }

        self.publisher
            .publish(GameEvent::GameStarted {
                game_id: game.game_id.clone(),
                players: game.players.clone(),
                info: game.info,
                initial_fen: game.initial_fen.clone(),
                started_at: game.started_at,
                rating_changes: game.rating_changes,
                rematch_of,
            })
            .await;

        Ok(game)
    }

    pub async fn load(&self, game_id: &GameId) -> Result<LiveGame, CoreError> {
        let fields = self.live.hget_all(&keys::game(game_id)).await?;
        if fields.is_empty() {
            return Err(CoreError::NotFound);
        }
        LiveGame::from_fields(game_id.clone(), &fields)
    }

    /// Validates and applies one move: turn check, legality, clock
    /// deduction with increment, terminal classification.
    pub async fn apply_move(
        &self,
        game_id: &GameId,
        player_id: &PlayerId,
        san: &str,
    ) -> Result<(), CoreError> {
        let mut game = self.load(game_id).await?;
        if game.game_over {
            return Err(CoreError::Finalized);
        }
        let color = game
            .player_color(player_id)
            .ok_or(CoreError::Unauthorized)?;
        if color != game.turn {
            return Err(CoreError::NotYourTurn);
        }

        let state = self
            .engine
            .replay(&game.initial_fen, game.move_sans())
            .map_err(|e| CoreError::Internal(format!("replay failed: {}", e)))?;
        let outcome = self.engine.apply_move(&state, san)?;

        let now = get_unix_time_now();
        let elapsed = now.saturating_sub(game.last_move_at);
        let increment = game.info.time_control.increment_ms();
        let remaining = (game.time_left.get(color) as i64 - elapsed as i64 + increment as i64)
            .max(0) as u64;
        game.time_left.set(color, remaining);

        game.moves.push(MoveDto {
            san: outcome.mv.san.clone(),
            from: outcome.mv.from.clone(),
            to: outcome.mv.to.clone(),
            timestamp: now,
        });
        game.pgn = outcome.pgn.clone();
        game.turn = color.opposite();
        game.last_move_at = now;
        // A move answers any standing draw offer.
        game.draw_offered_by = None;

        let post_state = self
            .engine
            .load_fen(&outcome.fen)
            .map_err(|e| CoreError::Internal(format!("bad engine fen: {}", e)))?;
        let terminal = self.engine.terminal(&post_state);

        self.persist(&game).await?;
        // to_fields can't delete; clear any stale offer field explicitly.
        let _ = self.live.hdel(&keys::game(game_id), "drawOfferedBy").await;
        self.clocks
            .on_move(game_id, now, game.turn, game.time_left);

        // A terminal move publishes game_ended alone; the final move content
        // rides the final PGN and FEN.
        if terminal.over {
            let (winner, reason) = classify(terminal.reason, color);
            match self.finalize(&mut game, winner, reason, Some(outcome.fen)).await {
                Ok(()) | Err(CoreError::Finalized) => {}
                Err(e) => return Err(e),
            }
        } else {
            self.publisher
                .publish(GameEvent::MoveMade {
                    game_id: game_id.clone(),
                    player_id: player_id.clone(),
                    player: color,
                    san: outcome.mv.san,
                    from: outcome.mv.from,
                    to: outcome.mv.to,
                    fen: outcome.fen.clone(),
                    pgn: outcome.pgn,
                    move_number: game.moves.len() as u32,
                    time_left: game.time_left,
                    terminal: false,
                })
                .await;
        }
        Ok(())
    }

    /// Resignation by either player; the opponent wins.
    pub async fn resign(&self, game_id: &GameId, player_id: &PlayerId) -> Result<(), CoreError> {
        let mut game = self.load(game_id).await?;
        if game.game_over {
            return Err(CoreError::Finalized);
        }
        let color = game
            .player_color(player_id)
            .ok_or(CoreError::Unauthorized)?;

        self.finalize(&mut game, Some(color.opposite()), EndReason::Resignation, None)
            .await?;
        self.publisher
            .publish(GameEvent::PlayerResigned {
                game_id: game_id.clone(),
                player_id: player_id.clone(),
                player: color,
            })
            .await;
        Ok(())
    }

    pub async fn offer_draw(&self, game_id: &GameId, player_id: &PlayerId) -> Result<(), CoreError> {
        let game = self.load(game_id).await?;
        if game.game_over {
            return Err(CoreError::Finalized);
        }
        let color = game
            .player_color(player_id)
            .ok_or(CoreError::Unauthorized)?;
        if game.draw_offered_by == Some(color) {
            // Re-offer is idempotent.
            return Ok(());
        }

        self.live
            .hset(
                &keys::game(game_id),
                &[("drawOfferedBy".to_owned(), color.as_str().to_owned())],
            )
            .await?;
        self.publisher
            .publish(GameEvent::DrawOffered {
                game_id: game_id.clone(),
                by: color,
            })
            .await;
        Ok(())
    }

    pub async fn accept_draw(
        &self,
        game_id: &GameId,
        player_id: &PlayerId,
    ) -> Result<(), CoreError> {
        let mut game = self.load(game_id).await?;
        if game.game_over {
            return Err(CoreError::Finalized);
        }
        let color = game
            .player_color(player_id)
            .ok_or(CoreError::Unauthorized)?;
        if game.draw_offered_by != Some(color.opposite()) {
            return Err(CoreError::BadRequest("no draw offer to accept".to_owned()));
        }

        self.finalize(&mut game, None, EndReason::Agreement, None)
            .await?;
        self.publisher
            .publish(GameEvent::DrawAccepted {
                game_id: game_id.clone(),
                by: color,
            })
            .await;
        Ok(())
    }

    pub async fn decline_draw(
        &self,
        game_id: &GameId,
        player_id: &PlayerId,
    ) -> Result<(), CoreError> {
        let game = self.load(game_id).await?;
        if game.game_over {
            return Err(CoreError::Finalized);
        }
        let color = game
            .player_color(player_id)
            .ok_or(CoreError::Unauthorized)?;
        if game.draw_offered_by != Some(color.opposite()) {
            // Nothing standing; declining is idempotent.
            return Ok(());
        }

        self.live.hdel(&keys::game(game_id), "drawOfferedBy").await?;
        self.publisher
            .publish(GameEvent::DrawDeclined {
                game_id: game_id.clone(),
                by: color,
            })
            .await;
        Ok(())
    }

    pub async fn offer_rematch(
        &self,
        game_id: &GameId,
        player_id: &PlayerId,
    ) -> Result<(), CoreError> {
        let game = self.load(game_id).await?;
        if !game.game_over {
            return Err(CoreError::BadRequest(
                "game still in progress".to_owned(),
            ));
        }
        let color = game
            .player_color(player_id)
            .ok_or(CoreError::Unauthorized)?;
        if game.rematch_game_id.is_some() {
            return Err(CoreError::Conflict("rematch already created".to_owned()));
        }
        if game.rematch_offered_by == Some(color) {
            return Ok(());
        }

        self.live
            .hset(
                &keys::game(game_id),
                &[("rematchOfferedBy".to_owned(), color.as_str().to_owned())],
            )
            .await?;
        self.publisher
            .publish(GameEvent::RematchOffered {
                game_id: game_id.clone(),
                by: color,
            })
            .await;
        Ok(())
    }

    /// Accepting a rematch spawns a fresh game with swapped colors and a
    /// fresh clock, cross-linked to this one.
    pub async fn accept_rematch(
        &self,
        game_id: &GameId,
        player_id: &PlayerId,
    ) -> Result<LiveGame, CoreError> {
        let game = self.load(game_id).await?;
        if !game.game_over {
            return Err(CoreError::BadRequest(
                "game still in progress".to_owned(),
            ));
        }
        let color = game
            .player_color(player_id)
            .ok_or(CoreError::Unauthorized)?;
        if game.rematch_offered_by != Some(color.opposite()) {
            return Err(CoreError::BadRequest(
                "no rematch offer to accept".to_owned(),
            ));
        }
        if game.rematch_game_id.is_some() {
            return Err(CoreError::Conflict("rematch already created".to_owned()));
        }

        // Colors swap: the old black seat plays white.
        let new_white = self
            .durable
            .get_or_create_profile(&game.seat(Color::Black).player_id)
            .await?;
        let new_black = self
            .durable
            .get_or_create_profile(&game.seat(Color::White).player_id)
            .await?;
        let rematch = self
            .create_game(
                &new_white,
                &new_black,
                game.game_type(),
                Some(game_id.clone()),
            )
            .await?;

        self.live
            .hset(
                &keys::game(game_id),
                &[("rematchGameId".to_owned(), rematch.game_id.to_string())],
            )
            .await?;
        self.publisher
            .publish(GameEvent::RematchAccepted {
                game_id: game_id.clone(),
                new_game_id: rematch.game_id.clone(),
            })
            .await;
        Ok(rematch)
    }

    pub async fn decline_rematch(
        &self,
        game_id: &GameId,
        player_id: &PlayerId,
    ) -> Result<(), CoreError> {
        let game = self.load(game_id).await?;
        let color = game
            .player_color(player_id)
            .ok_or(CoreError::Unauthorized)?;
        if game.rematch_offered_by != Some(color.opposite()) {
            return Ok(());
        }

        self.live
            .hdel(&keys::game(game_id), "rematchOfferedBy")
            .await?;
        self.publisher
            .publish(GameEvent::RematchDeclined {
                game_id: game_id.clone(),
                by: color,
            })
            .await;
        Ok(())
    }

    /// Invoked by the clock scan (or an honored client report) when the
    /// running side's flag fell.
    pub async fn timeout_forfeit(
        &self,
        game_id: &GameId,
        losing_color: Color,
    ) -> Result<(), CoreError> {
        let mut game = self.load(game_id).await?;
        if game.game_over {
            return Err(CoreError::Finalized);
        }

        self.publisher
            .publish(GameEvent::TimeUp {
                game_id: game_id.clone(),
                player: losing_color,
            })
            .await;
        self.finalize(
            &mut game,
            Some(losing_color.opposite()),
            EndReason::Timeout,
            None,
        )
        .await
    }

    /// A client claims the given color's flag fell. Within tolerance the
    /// forfeit stands; otherwise the reporter alone gets a corrective sync.
    pub async fn handle_time_up(
        &self,
        game_id: &GameId,
        reporter: &PlayerId,
        claimed_color: Color,
    ) -> Result<Option<ClientUpdate>, CoreError> {
        let game = self.load(game_id).await?;
        if game.game_over {
            return Err(CoreError::Finalized);
        }
        game.player_color(reporter).ok_or(CoreError::Unauthorized)?;

        let now = get_unix_time_now();
        if live_remaining(&game, claimed_color, now) <= TIMEOUT_TOLERANCE_MS {
            self.timeout_forfeit(game_id, claimed_color).await?;
            Ok(None)
        } else {
            Ok(Some(time_update_of(&game, now)))
        }
    }

    /// Authoritative clock snapshot for `request_time_sync`.
    pub async fn time_sync(&self, game_id: &GameId) -> Result<ClientUpdate, CoreError> {
        let now = get_unix_time_now();
        if let Some((clock, current_turn)) = self.clocks.sync(game_id, now) {
            return Ok(ClientUpdate::TimeUpdate {
                game_id: game_id.clone(),
                white_ms: clock.white_ms,
                black_ms: clock.black_ms,
                current_turn,
                now,
            });
        }
        let game = self.load(game_id).await?;
        Ok(time_update_of(&game, now))
    }

    /// The single atomic `gameOver` flip serializes termination across
    /// nodes; only the winner of the flip updates ratings.
    async fn finalize(
        &self,
        game: &mut LiveGame,
        winner: Option<Color>,
        reason: EndReason,
        final_fen: Option<String>,
    ) -> Result<(), CoreError> {
        let key = keys::game(&game.game_id);
        if !self.live.hset_nx(&key, "gameOver", "true").await? {
            return Err(CoreError::Finalized);
        }

        debug_assert_eq!(winner.is_some(), reason.decisive());

        let now = get_unix_time_now();
        let score = Score::from_winner(winner);
        game.game_over = true;
        game.winner = winner;
        game.result = Some(score);
        game.end_reason = Some(reason);
        game.ended_at = Some(now);

        let rating_events = self.apply_ratings(game, score, now).await;

        self.persist(game).await?;
        self.clocks.remove(&game.game_id);

        self.publisher
            .publish(GameEvent::GameEnded {
                game_id: game.game_id.clone(),
                winner,
                reason,
                score,
                final_fen: final_fen.unwrap_or_default(),
                final_pgn: game.pgn.clone(),
                rating_changes: Some(game.rating_changes),
            })
            .await;
        for event in rating_events {
            self.publisher.publish(event).await;
        }
        Ok(())
    }

    /// Applies Elo deltas to both profiles. Runs only under the
    /// finalization guard, hence exactly once per game.
    async fn apply_ratings(
        &self,
        game: &mut LiveGame,
        score: Score,
        now: u64,
    ) -> Vec<GameEvent> {
        let variant = game.info.variant;
        let white_pre = game.seat(Color::White).pre_rating;
        let black_pre = game.seat(Color::Black).pre_rating;
        let mut events = Vec::with_capacity(2);

        for color in [Color::White, Color::Black] {
            let (own_pre, opp_pre) = match color {
                Color::White => (white_pre, black_pre),
                Color::Black => (black_pre, white_pre),
            };
            let player_id = game.seat(color).player_id.clone();
            let mut profile = match self.durable.get_or_create_profile(&player_id).await {
                Ok(profile) => profile,
                Err(e) => {
                    error!("profile load failed for {}: {}", player_id, e);
                    continue;
                }
            };
            let old_rating = profile.rating(variant);
            let delta =
                rating::rating_delta(own_pre, opp_pre, profile.games_played, score.points_for(color));
            let new_rating = rating::apply_delta(own_pre, delta);
            profile.record_result(
                game.game_id.clone(),
                variant,
                color,
                score,
                new_rating,
                now,
            );
            if let Err(e) = self.durable.put_profile(profile).await {
                error!("profile write failed for {}: {}", player_id, e);
                continue;
            }
            game.seat_mut(color).post_rating = Some(new_rating);
            events.push(GameEvent::RatingUpdated {
                game_id: game.game_id.clone(),
                player_id,
                color,
                variant,
                old_rating,
                new_rating,
            });
        }
        events
    }

    /// Writes the full hash and refreshes the TTL, retrying once on a store
    /// hiccup before surfacing `Internal` (the client may re-submit).
    async fn persist(&self, game: &LiveGame) -> Result<(), CoreError> {
        let key = keys::game(&game.game_id);
        let fields = game.to_fields();
        if let Err(first) = self.write_once(&key, &fields).await {
            warn!("live write failed for {}, retrying: {}", game.game_id, first);
            tokio::time::sleep(WRITE_RETRY_BACKOFF).await;
            self.write_once(&key, &fields)
                .await
                .map_err(|e| CoreError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    async fn write_once(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), server_util::live_store::StoreError> {
        self.live.hset(key, fields).await?;
        self.live
            .expire(key, Duration::from_secs(LIVE_GAME_TTL_SECS))
            .await
    }
}

pub(crate) fn skeleton(game: &LiveGame, rematch_of: Option<GameId>) -> GameItem {
    GameItem {
        game_id: game.game_id.clone(),
        players: game.players.clone(),
        variant: game.info.variant,
        time_control: game.info.time_control,
        initial_fen: game.initial_fen.clone(),
        moves: Vec::new(),
        pgn: String::new(),
        fen_history: Vec::new(),
        game_status: GameStatus::InProgress,
        started_at: game.started_at,
        ended_at: None,
        result: None,
        rating_changes: Some(game.rating_changes),
        rematch_of,
        rematch_game_id: None,
    }
}

/// Maps an engine verdict onto winner and reason; checkmate credits the
/// side that just moved.
fn classify(reason: Option<TerminalReason>, mover: Color) -> (Option<Color>, EndReason) {
    match reason {
        Some(TerminalReason::Checkmate) => (Some(mover), EndReason::Checkmate),
        Some(TerminalReason::Stalemate) => (None, EndReason::Stalemate),
        Some(TerminalReason::Threefold) => (None, EndReason::Threefold),
        Some(TerminalReason::InsufficientMaterial) => (None, EndReason::InsufficientMaterial),
        Some(TerminalReason::FiftyMove) => (None, EndReason::FiftyMove),
        // Engine said over without a reason; treat as drawn.
        None => (None, EndReason::Agreement),
    }
}

/// Remaining time computed from the authoritative LiveGame alone, so any
/// node can arbitrate a report.
fn live_remaining(game: &LiveGame, color: Color, now: u64) -> u64 {
    let base = game.time_left.get(color);
    if color == game.turn {
        base.saturating_sub(now.saturating_sub(game.last_move_at))
    } else {
        base
    }
}

fn time_update_of(game: &LiveGame, now: u64) -> ClientUpdate {
    ClientUpdate::TimeUpdate {
        game_id: game.game_id.clone(),
        white_ms: live_remaining(game, Color::White, now),
        black_ms: live_remaining(game, Color::Black, now),
        current_turn: game.turn,
        now,
    }
}
