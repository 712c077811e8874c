// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::chess::ChessEngine;
use crate::client::ClientRepo;
use crate::clock::ClockRepo;
use crate::error::CoreError;
use crate::game::GameRepo;
use crate::keys;
use crate::live_game::LiveGame;
use crate::matchmaker::{Matchmaker, TickOutcome};
use crate::presence::Presence;
use crate::publisher::EventPublisher;
use core_protocol::event::{EventEnvelope, GameEvent};
use core_protocol::game::GameType;
use core_protocol::get_unix_time_now;
use core_protocol::id::{ConnectionId, GameId, NodeId, PlayerId};
use core_protocol::rpc::{ClientRequest, ClientUpdate};
use log::warn;
use server_util::database::DurableStore;
use server_util::event_bus::EventBus;
use server_util::live_store::LiveStore;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events waiting for the persistence pipeline. When full, LOW-priority
/// events drop and HIGH/MEDIUM publishers wait for space instead.
const PERSISTENCE_BACKLOG: usize = 4096;

/// Everything one node's request handlers need, cheaply cloneable into the
/// task spawned per client message. No globals; lifecycle is node start to
/// node stop.
pub struct CoreContext<E: ChessEngine> {
    pub node_id: NodeId,
    pub live: Arc<dyn LiveStore>,
    pub durable: Arc<dyn DurableStore>,
    pub bus: Arc<dyn EventBus>,
    pub clients: Arc<ClientRepo>,
    pub clocks: Arc<ClockRepo>,
    pub publisher: EventPublisher,
    pub games: GameRepo<E>,
    pub matchmaker: Arc<Matchmaker<E>>,
}

impl<E: ChessEngine> Clone for CoreContext<E> {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id.clone(),
            live: Arc::clone(&self.live),
            durable: Arc::clone(&self.durable),
            bus: Arc::clone(&self.bus),
            clients: Arc::clone(&self.clients),
            clocks: Arc::clone(&self.clocks),
            publisher: self.publisher.clone(),
            games: self.games.clone(),
            matchmaker: Arc::clone(&self.matchmaker),
        }
    }
}

impl<E: ChessEngine> CoreContext<E> {
    /// Wires the node's services together. The returned receiver feeds the
    /// persistence pipeline task.
    pub fn new(
        engine: Arc<E>,
        live: Arc<dyn LiveStore>,
        durable: Arc<dyn DurableStore>,
        bus: Arc<dyn EventBus>,
    ) -> (Self, mpsc::Receiver<EventEnvelope>) {
        let node_id = NodeId::generate();
        let clients = Arc::new(ClientRepo::new());
        let clocks = Arc::new(ClockRepo::new());
        let (pipeline_tx, pipeline_rx) = mpsc::channel(PERSISTENCE_BACKLOG);
        let publisher = EventPublisher::new(
            node_id.clone(),
            Arc::clone(&bus),
            pipeline_tx,
            Arc::clone(&clients),
        );
        let games = GameRepo::new(
            engine,
            Arc::clone(&live),
            Arc::clone(&durable),
            Arc::clone(&clocks),
            publisher.clone(),
        );
        let matchmaker = Arc::new(Matchmaker::new(
            Arc::clone(&live),
            Arc::clone(&durable),
            publisher.clone(),
            games.clone(),
        ));
        (
            Self {
                node_id,
                live,
                durable,
                bus,
                clients,
                clocks,
                publisher,
                games,
                matchmaker,
            },
            pipeline_rx,
        )
    }

    /// Socket (re)connected: presence goes up, paused games resume.
    /// The socket itself was already stored synchronously; `rooms` is what
    /// that registration returned.
    pub async fn after_register(
        &self,
        player_id: PlayerId,
        connection_id: ConnectionId,
        rooms: Vec<GameId>,
    ) {
        let rating = match self.durable.get_or_create_profile(&player_id).await {
            Ok(profile) => profile.ratings.rapid,
            Err(e) => {
                warn!("profile load on connect failed for {}: {}", player_id, e);
                return;
            }
        };
        let presence = Presence {
            player_id: player_id.clone(),
            connection_id,
            rating,
            connected: true,
        };
        if let Err(e) = self
            .live
            .hset(&keys::presence(&player_id), &presence.to_fields())
            .await
        {
            warn!("presence write failed for {}: {}", player_id, e);
        }

        if rooms.is_empty() {
            self.publisher
                .publish(GameEvent::PlayerConnected {
                    player_id: player_id.clone(),
                })
                .await;
        } else {
            let now = get_unix_time_now();
            for game_id in rooms {
                self.clocks.resume(&game_id, now);
                self.publisher
                    .publish(GameEvent::PlayerReconnected {
                        player_id: player_id.clone(),
                        game_id: Some(game_id),
                    })
                    .await;
            }
        }
    }

    /// Socket dropped: searches cancel, live games pause and keep running
    /// down on their own.
    pub async fn after_unregister(&self, player_id: PlayerId, rooms: Vec<GameId>) {
        for game_id in &rooms {
            self.clocks.pause(game_id);
        }
        if let Err(e) = self.matchmaker.cancel(&player_id).await {
            warn!("search cleanup failed for {}: {}", player_id, e);
        }
        if rooms.is_empty() {
            self.publisher
                .publish(GameEvent::PlayerDisconnected {
                    player_id: player_id.clone(),
                    game_id: None,
                })
                .await;
        } else {
            for game_id in rooms {
                self.publisher
                    .publish(GameEvent::PlayerDisconnected {
                        player_id: player_id.clone(),
                        game_id: Some(game_id),
                    })
                    .await;
            }
        }
    }

    /// One client message, one call. The returned update (if any) goes back
    /// on the originating socket only; everything room-visible flows through
    /// the publisher's fan-out.
    pub async fn handle_request(
        &self,
        player_id: &PlayerId,
        request: ClientRequest,
    ) -> Result<Option<ClientUpdate>, CoreError> {
        match request {
            ClientRequest::SearchMatch {
                variant,
                time_control,
            } => {
                let connection_id = self
                    .clients
                    .connection_id(player_id)
                    .ok_or(CoreError::Unauthenticated)?;
                let game_type = GameType {
                    variant,
                    time_control,
                };
                self.matchmaker
                    .start_search(player_id, game_type, connection_id)
                    .await?;
                match self.matchmaker.tick(player_id).await? {
                    TickOutcome::Found { .. } => {
                        // match_found was already fanned out to both seats.
                        Ok(None)
                    }
                    TickOutcome::Searching {
                        current_range,
                        search_duration_ms,
                    } => Ok(Some(ClientUpdate::SearchStatus {
                        is_searching: true,
                        current_range,
                        search_duration_ms,
                    })),
                }
            }
            ClientRequest::CancelSearch => {
                self.matchmaker.cancel(player_id).await?;
                Ok(Some(ClientUpdate::SearchCancelled))
            }
            ClientRequest::GetSearchStatus => {
                let status = self.matchmaker.status(player_id).await?;
                Ok(Some(match status {
                    Some((current_range, search_duration_ms)) => ClientUpdate::SearchStatus {
                        is_searching: true,
                        current_range,
                        search_duration_ms,
                    },
                    None => ClientUpdate::SearchStatus {
                        is_searching: false,
                        current_range: 0,
                        search_duration_ms: 0,
                    },
                }))
            }
            ClientRequest::StartGame { game_id } => {
                let game = self.join_game(player_id, &game_id).await?;
                Ok(Some(ClientUpdate::GameJoined {
                    snapshot: game.snapshot(),
                }))
            }
            ClientRequest::Rejoin { game_id } => {
                let game = self.join_game(player_id, &game_id).await?;
                self.publisher
                    .publish(GameEvent::PlayerReconnected {
                        player_id: player_id.clone(),
                        game_id: Some(game_id),
                    })
                    .await;
                Ok(Some(ClientUpdate::GameJoined {
                    snapshot: game.snapshot(),
                }))
            }
            ClientRequest::Move { game_id, san, .. } => {
                self.games.apply_move(&game_id, player_id, &san).await?;
                Ok(None)
            }
            ClientRequest::Resign { game_id } => {
                self.games.resign(&game_id, player_id).await?;
                Ok(None)
            }
            ClientRequest::OfferDraw { game_id } => {
                self.games.offer_draw(&game_id, player_id).await?;
                Ok(None)
            }
            ClientRequest::AcceptDraw { game_id } => {
                self.games.accept_draw(&game_id, player_id).await?;
                Ok(None)
            }
            ClientRequest::DeclineDraw { game_id } => {
                self.games.decline_draw(&game_id, player_id).await?;
                Ok(None)
            }
            ClientRequest::OfferRematch { game_id } => {
                self.games.offer_rematch(&game_id, player_id).await?;
                Ok(None)
            }
            ClientRequest::AcceptRematch { game_id } => {
                self.games.accept_rematch(&game_id, player_id).await?;
                Ok(None)
            }
            ClientRequest::DeclineRematch { game_id } => {
                self.games.decline_rematch(&game_id, player_id).await?;
                Ok(None)
            }
            ClientRequest::TimeUp {
                game_id,
                player_color,
            } => {
                // A corrective sync goes to the reporter alone.
                self.games
                    .handle_time_up(&game_id, player_id, player_color)
                    .await
            }
            ClientRequest::RequestTimeSync { game_id } => {
                if !self.clients.allow_time_sync(player_id) {
                    return Ok(None);
                }
                Ok(Some(self.games.time_sync(&game_id).await?))
            }
        }
    }

    /// Loads the game, checks membership, joins the room, and (re)builds the
    /// node-local clock entry.
    async fn join_game(
        &self,
        player_id: &PlayerId,
        game_id: &GameId,
    ) -> Result<LiveGame, CoreError> {
        let game = self.games.load(game_id).await?;
        if game.player_color(player_id).is_none() {
            return Err(CoreError::Unauthorized);
        }
        self.clients.join_room(game_id.clone(), player_id.clone());
        if !game.game_over {
            self.clocks.track(&game, get_unix_time_now());
        }
        Ok(game)
    }

    /// Cross-node fan-in: applies a bus envelope from another node to this
    /// node's sockets and clock mirrors.
    pub fn apply_remote(&self, envelope: &EventEnvelope) {
        debug_assert!(envelope.origin_node_id != self.node_id);
        match &envelope.event {
            GameEvent::MoveMade {
                game_id,
                player,
                time_left,
                ..
            } => {
                self.clocks
                    .on_move(game_id, envelope.timestamp, player.opposite(), *time_left);
            }
            GameEvent::GameEnded { game_id, .. } => {
                self.clocks.remove(game_id);
            }
            _ => {}
        }
        self.clients.fan_out(&envelope.event);
    }
}
