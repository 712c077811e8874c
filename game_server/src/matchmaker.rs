// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::chess::ChessEngine;
use crate::color;
use crate::error::CoreError;
use crate::game::GameRepo;
use crate::keys;
use crate::presence::Presence;
use crate::publisher::EventPublisher;
use core_protocol::dto::{MatchSeatDto, OpponentDto};
use core_protocol::event::GameEvent;
use core_protocol::game::{GameType, GameVariant, TimeControl};
use core_protocol::get_unix_time_now;
use core_protocol::id::{ConnectionId, GameId, PlayerId};
use core_protocol::UnixTime;
use log::{info, warn};
use rand::thread_rng;
use serde::{Deserialize, Serialize};
use server_util::database::DurableStore;
use server_util::database_schema::ProfileItem;
use server_util::live_store::LiveStore;
use server_util::rate_limiter::RateLimiter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const INITIAL_RANGE: u32 = 60;
pub const RANGE_STEP: u32 = 60;
pub const RANGE_MAX: u32 = 600;
/// The window widens one step per this much searching.
pub const RANGE_STEP_MS: u64 = 3000;
pub const SEARCH_SESSION_TTL: Duration = Duration::from_secs(300);
pub const MATCH_LOCK_TTL: Duration = Duration::from_secs(5);
/// Clients tick every ~3 s; anything much faster is shed.
const TICK_MIN_INTERVAL: Duration = Duration::from_secs(2);

/// One player's open matchmaking search. Field names are the stored JSON
/// contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchSession {
    #[serde(rename = "gameType")]
    pub game_type_key: String,
    #[serde(rename = "gameVariant")]
    pub game_variant: GameVariant,
    #[serde(rename = "timeControl")]
    pub time_control: TimeControl,
    #[serde(rename = "initialRating")]
    pub initial_rating: u16,
    #[serde(rename = "currentRange")]
    pub current_range: u32,
    #[serde(rename = "searchStartTime")]
    pub search_start_time: UnixTime,
    #[serde(rename = "connectionId")]
    pub connection_id: ConnectionId,
}

impl SearchSession {
    pub fn game_type(&self) -> GameType {
        GameType {
            variant: self.game_variant,
            time_control: self.time_control,
        }
    }

    pub fn search_duration_ms(&self, now: UnixTime) -> u64 {
        now.saturating_sub(self.search_start_time)
    }
}

/// Rating window as a function of time searched.
pub fn range_at(search_duration_ms: u64) -> u32 {
    let expansion = (search_duration_ms / RANGE_STEP_MS).min(u32::MAX as u64) as u32;
    INITIAL_RANGE
        .saturating_add(RANGE_STEP.saturating_mul(expansion))
        .min(RANGE_MAX)
}

#[derive(Clone, Debug)]
pub enum TickOutcome {
    Found {
        game_id: GameId,
        opponent: OpponentDto,
        current_range: u32,
        search_duration_ms: u64,
    },
    Searching {
        current_range: u32,
        search_duration_ms: u64,
    },
}

/// Expanding-window pairing over the shared ranked queues. Any node may run
/// a tick for any searching player; the `match_lock` claim serializes each
/// candidate pair across the fleet.
pub struct Matchmaker<E: ChessEngine> {
    live: Arc<dyn LiveStore>,
    durable: Arc<dyn DurableStore>,
    publisher: EventPublisher,
    games: GameRepo<E>,
    tick_limiters: Mutex<HashMap<PlayerId, RateLimiter>>,
}

impl<E: ChessEngine> Matchmaker<E> {
    pub fn new(
        live: Arc<dyn LiveStore>,
        durable: Arc<dyn DurableStore>,
        publisher: EventPublisher,
        games: GameRepo<E>,
    ) -> Self {
        Self {
            live,
            durable,
            publisher,
            games,
            tick_limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Opens (or refreshes) a search. Idempotent: repeats refresh the TTL
    /// without resetting `searchStartTime`; switching game type cancels the
    /// old search first.
    pub async fn start_search(
        &self,
        player_id: &PlayerId,
        game_type: GameType,
        connection_id: ConnectionId,
    ) -> Result<(), CoreError> {
        let profile = self.durable.get_or_create_profile(player_id).await?;
        let rating = profile.rating(game_type.variant);
        let session_key = keys::search_session(player_id);
        let queue_key = keys::queue(&game_type.key());

        if let Some(existing) = self.load_session(player_id).await? {
            if existing.game_type_key == game_type.key() {
                let body = serde_json::to_string(&existing)
                    .map_err(|e| CoreError::Internal(e.to_string()))?;
                self.live
                    .set_ex(&session_key, &body, SEARCH_SESSION_TTL)
                    .await?;
                // Membership may have been lost to a crashed pairing.
                self.live
                    .zadd(&queue_key, player_id.as_str(), rating as f64)
                    .await?;
                return Ok(());
            }
            self.cancel(player_id).await?;
        }

        let session = SearchSession {
            game_type_key: game_type.key(),
            game_variant: game_type.variant,
            time_control: game_type.time_control,
            initial_rating: rating,
            current_range: INITIAL_RANGE,
            search_start_time: get_unix_time_now(),
            connection_id,
        };
        let body =
            serde_json::to_string(&session).map_err(|e| CoreError::Internal(e.to_string()))?;
        self.live
            .set_ex(&session_key, &body, SEARCH_SESSION_TTL)
            .await?;
        self.live
            .zadd(&queue_key, player_id.as_str(), rating as f64)
            .await?;
        info!(
            "player {} searching {} at rating {}",
            player_id,
            game_type.key(),
            rating
        );
        Ok(())
    }

    /// One matchmaking step for the given player: widen the window, scan the
    /// queue, try to claim a pair.
    pub async fn tick(&self, player_id: &PlayerId) -> Result<TickOutcome, CoreError> {
        let mut session = self
            .load_session(player_id)
            .await?
            .ok_or(CoreError::NotFound)?;
        let now = get_unix_time_now();
        let search_duration = session.search_duration_ms(now);
        let current_range = range_at(search_duration);

        if self.should_shed_tick(player_id) {
            return Ok(TickOutcome::Searching {
                current_range,
                search_duration_ms: search_duration,
            });
        }

        let session_key = keys::search_session(player_id);
        if current_range > session.current_range {
            session.current_range = current_range;
        }
        // Refreshing also extends the TTL while the client keeps ticking.
        let body =
            serde_json::to_string(&session).map_err(|e| CoreError::Internal(e.to_string()))?;
        self.live
            .set_ex(&session_key, &body, SEARCH_SESSION_TTL)
            .await?;

        let queue_key = keys::queue(&session.game_type_key);
        let rating = session.initial_rating as f64;
        let candidates = self
            .live
            .zrange_by_score(
                &queue_key,
                rating - current_range as f64,
                rating + current_range as f64,
            )
            .await?;

        for (member, candidate_rating) in candidates {
            if member == player_id.as_str() {
                continue;
            }
            let candidate = PlayerId::new(member);

            // Ghost entries (no presence) are evicted as they are found.
            let fields = self.live.hget_all(&keys::presence(&candidate)).await?;
            if Presence::from_fields(&fields).is_none() {
                self.live.zrem(&queue_key, candidate.as_str()).await?;
                continue;
            }
            if self
                .live
                .zscore(&queue_key, candidate.as_str())
                .await?
                .is_none()
            {
                continue;
            }

            let lock_key = keys::match_lock(player_id, &candidate);
            if !self
                .live
                .set_nx_ex(
                    &lock_key,
                    self.publisher.node_id().as_str(),
                    MATCH_LOCK_TTL,
                )
                .await?
            {
                // Another node is pairing these two.
                continue;
            }

            // Double-check after acquisition: either side may have been
            // paired elsewhere between the scan and the claim.
            let self_queued = self
                .live
                .zscore(&queue_key, player_id.as_str())
                .await?
                .is_some();
            let candidate_queued = self
                .live
                .zscore(&queue_key, candidate.as_str())
                .await?
                .is_some();
            if !self_queued || !candidate_queued {
                self.live.del(&lock_key).await?;
                continue;
            }

            if !self
                .live
                .zrem_all_if_members(&queue_key, &[player_id.as_str(), candidate.as_str()])
                .await?
            {
                self.live.del(&lock_key).await?;
                continue;
            }

            let result = self
                .pair(player_id, &candidate, &session, now)
                .await;
            self.live.del(&lock_key).await?;
            return match result {
                Ok(outcome) => Ok(outcome),
                Err(e) => {
                    // Both were already dequeued; put them back so neither
                    // is stranded.
                    warn!("pairing {} with {} failed: {}", player_id, candidate, e);
                    let _ = self
                        .live
                        .zadd(&queue_key, player_id.as_str(), rating)
                        .await;
                    let _ = self
                        .live
                        .zadd(&queue_key, candidate.as_str(), candidate_rating)
                        .await;
                    Err(e)
                }
            };
        }

        Ok(TickOutcome::Searching {
            current_range,
            search_duration_ms: search_duration,
        })
    }

    /// Both players are dequeued and the pair lock is held; create the game
    /// and tear the searches down.
    async fn pair(
        &self,
        player_id: &PlayerId,
        candidate: &PlayerId,
        session: &SearchSession,
        now: UnixTime,
    ) -> Result<TickOutcome, CoreError> {
        let candidate_session = self.load_session(candidate).await.unwrap_or(None);

        let own_profile = self.durable.get_or_create_profile(player_id).await?;
        let candidate_profile = self.durable.get_or_create_profile(candidate).await?;
        let variant = session.game_variant;

        let own_is_white = color::assign_white(
            &mut thread_rng(),
            own_profile.rating(variant),
            candidate_profile.rating(variant),
            &own_profile.recent_colors(),
            &candidate_profile.recent_colors(),
        );
        let (white, black) = if own_is_white {
            (&own_profile, &candidate_profile)
        } else {
            (&candidate_profile, &own_profile)
        };

        let game = self
            .games
            .create_game(white, black, session.game_type(), None)
            .await?;

        // Sessions and presence are done: both players are in a game now.
        self.live.del(&keys::search_session(player_id)).await?;
        self.live.del(&keys::search_session(candidate)).await?;
        self.live.del(&keys::presence(player_id)).await?;
        self.live.del(&keys::presence(candidate)).await?;
        {
            let mut limiters = self.tick_limiters.lock().unwrap();
            limiters.remove(player_id);
            limiters.remove(candidate);
        }

        let own_opponent = opponent_of(&candidate_profile, variant);
        let candidate_opponent = opponent_of(&own_profile, variant);
        let search_duration = session.search_duration_ms(now);
        let seats = vec![
            MatchSeatDto {
                player_id: player_id.clone(),
                opponent: own_opponent.clone(),
                search_duration_ms: search_duration,
                final_range: session.current_range,
            },
            MatchSeatDto {
                player_id: candidate.clone(),
                opponent: candidate_opponent,
                search_duration_ms: candidate_session
                    .as_ref()
                    .map(|s| s.search_duration_ms(now))
                    .unwrap_or(search_duration),
                final_range: candidate_session
                    .as_ref()
                    .map(|s| range_at(s.search_duration_ms(now)))
                    .unwrap_or(session.current_range),
            },
        ];

        info!(
            "matched {} with {} in {} after {} ms",
            player_id, candidate, session.game_type_key, search_duration
        );
        self.publisher
            .publish(GameEvent::MatchFound {
                game_id: game.game_id.clone(),
                game_type_key: session.game_type_key.clone(),
                rating_changes: game.rating_changes,
                seats,
            })
            .await;

        Ok(TickOutcome::Found {
            game_id: game.game_id,
            opponent: own_opponent,
            current_range: session.current_range,
            search_duration_ms: search_duration,
        })
    }

    /// Tears down a search: session, queue membership, presence. Idempotent.
    pub async fn cancel(&self, player_id: &PlayerId) -> Result<(), CoreError> {
        if let Some(session) = self.load_session(player_id).await? {
            self.live
                .zrem(&keys::queue(&session.game_type_key), player_id.as_str())
                .await?;
        }
        self.live.del(&keys::search_session(player_id)).await?;
        self.live.del(&keys::presence(player_id)).await?;
        self.tick_limiters.lock().unwrap().remove(player_id);
        Ok(())
    }

    /// Read-only view of an open search, with the range it has grown to.
    pub async fn status(
        &self,
        player_id: &PlayerId,
    ) -> Result<Option<(u32, u64)>, CoreError> {
        Ok(self.load_session(player_id).await?.map(|session| {
            let duration = session.search_duration_ms(get_unix_time_now());
            (range_at(duration).max(session.current_range), duration)
        }))
    }

    /// Queue depths for the given game types.
    pub async fn stats(
        &self,
        game_types: &[GameType],
    ) -> Result<Vec<(String, u64)>, CoreError> {
        let mut depths = Vec::with_capacity(game_types.len());
        for game_type in game_types {
            let key = game_type.key();
            let depth = self.live.zcard(&keys::queue(&key)).await?;
            depths.push((key, depth));
        }
        Ok(depths)
    }

    async fn load_session(
        &self,
        player_id: &PlayerId,
    ) -> Result<Option<SearchSession>, CoreError> {
        let raw = match self.live.get(&keys::search_session(player_id)).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        match serde_json::from_str(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!("discarding corrupt search session for {}: {}", player_id, e);
                self.live.del(&keys::search_session(player_id)).await?;
                Ok(None)
            }
        }
    }

    fn should_shed_tick(&self, player_id: &PlayerId) -> bool {
        self.tick_limiters
            .lock()
            .unwrap()
            .entry(player_id.clone())
            .or_insert_with(|| RateLimiter::with_burst(TICK_MIN_INTERVAL, 1))
            .should_limit()
    }
}

fn opponent_of(profile: &ProfileItem, variant: GameVariant) -> OpponentDto {
    OpponentDto {
        player_id: profile.player_id.clone(),
        rating: profile.rating(variant),
        provisional: profile.provisional(),
    }
}

#[cfg(test)]
mod tests {
    use crate::matchmaker::{range_at, RANGE_MAX};

    #[test]
    fn range_expands_in_steps() {
        assert_eq!(range_at(0), 60);
        assert_eq!(range_at(2_999), 60);
        assert_eq!(range_at(3_000), 120);
        assert_eq!(range_at(9_000), 240);
    }

    #[test]
    fn range_saturates() {
        assert_eq!(range_at(27_000), RANGE_MAX);
        assert_eq!(range_at(3_600_000), RANGE_MAX);
    }
}
