// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::event::GameEvent;
use core_protocol::get_unix_time_now;
use core_protocol::id::{ConnectionId, GameId, PlayerId};
use core_protocol::rpc::ClientUpdate;
use log::info;
use server_util::observer::{ClientAddr, ObserverUpdate};
use server_util::rate_limiter::RateLimiter;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

/// One connected socket.
struct ClientHandle {
    connection_id: ConnectionId,
    addr: ClientAddr,
    time_sync_limiter: Mutex<RateLimiter>,
}

/// Keeps track of clients a.k.a. real players a.k.a. websockets, and the
/// per-game rooms they join. Room membership survives a disconnect so a
/// reconnecting player finds their game again; the socket does not.
#[derive(Default)]
pub struct ClientRepo {
    sockets: RwLock<HashMap<PlayerId, ClientHandle>>,
    // TODO: Prune rooms of long-finished games that never saw a rematch.
    rooms: RwLock<HashMap<GameId, HashSet<PlayerId>>>,
}

impl ClientRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client websocket (re)connected. Returns the rooms the player was
    /// already a member of (their live games, for clock resume).
    pub fn register(
        &self,
        player_id: PlayerId,
        connection_id: ConnectionId,
        observer: ClientAddr,
    ) -> Vec<GameId> {
        let mut sockets = self.sockets.write().unwrap();
        let handle = ClientHandle {
            connection_id,
            addr: observer,
            time_sync_limiter: Mutex::new(RateLimiter::with_burst(Duration::from_secs(1), 3)),
        };
        if let Some(old) = sockets.insert(player_id.clone(), handle) {
            // If it still exists, the old socket is now retired.
            let _ = old.addr.send(ObserverUpdate::Close);
            info!("player {} replaced connection {}", player_id, old.connection_id);
        }
        drop(sockets);
        self.rooms_of(&player_id)
    }

    /// Client websocket dropped. A stale unregister (after a newer register)
    /// is ignored. Returns the player's rooms when the socket actually went
    /// away, for clock pause.
    pub fn unregister(
        &self,
        player_id: &PlayerId,
        connection_id: &ConnectionId,
    ) -> Option<Vec<GameId>> {
        let mut sockets = self.sockets.write().unwrap();
        match sockets.get(player_id) {
            Some(handle) if &handle.connection_id == connection_id => {
                sockets.remove(player_id);
            }
            _ => return None,
        }
        drop(sockets);

        // Membership stays so a reconnect finds the game again.
        Some(self.rooms_of(player_id))
    }

    pub fn is_connected(&self, player_id: &PlayerId) -> bool {
        self.sockets.read().unwrap().contains_key(player_id)
    }

    pub fn connection_id(&self, player_id: &PlayerId) -> Option<ConnectionId> {
        self.sockets
            .read()
            .unwrap()
            .get(player_id)
            .map(|handle| handle.connection_id.clone())
    }

    pub fn join_room(&self, game_id: GameId, player_id: PlayerId) {
        self.rooms
            .write()
            .unwrap()
            .entry(game_id)
            .or_default()
            .insert(player_id);
    }

    pub fn drop_room(&self, game_id: &GameId) {
        self.rooms.write().unwrap().remove(game_id);
    }

    pub fn rooms_of(&self, player_id: &PlayerId) -> Vec<GameId> {
        self.rooms
            .read()
            .unwrap()
            .iter()
            .filter(|(_, members)| members.contains(player_id))
            .map(|(game_id, _)| game_id.clone())
            .collect()
    }

    /// True if this socket may request another time sync right now.
    pub fn allow_time_sync(&self, player_id: &PlayerId) -> bool {
        let sockets = self.sockets.read().unwrap();
        match sockets.get(player_id) {
            Some(handle) => !handle.time_sync_limiter.lock().unwrap().should_limit(),
            None => false,
        }
    }

    pub fn send_to_player(&self, player_id: &PlayerId, message: ClientUpdate) -> bool {
        let sockets = self.sockets.read().unwrap();
        match sockets.get(player_id) {
            Some(handle) => handle.addr.send(ObserverUpdate::Send { message }).is_ok(),
            None => false,
        }
    }

    pub fn broadcast_room(&self, game_id: &GameId, message: &ClientUpdate) {
        self.broadcast_room_inner(game_id, None, message);
    }

    pub fn broadcast_room_except(
        &self,
        game_id: &GameId,
        except: &PlayerId,
        message: &ClientUpdate,
    ) {
        self.broadcast_room_inner(game_id, Some(except), message);
    }

    fn broadcast_room_inner(
        &self,
        game_id: &GameId,
        except: Option<&PlayerId>,
        message: &ClientUpdate,
    ) {
        let rooms = self.rooms.read().unwrap();
        let members = match rooms.get(game_id) {
            Some(members) => members,
            None => return,
        };
        let sockets = self.sockets.read().unwrap();
        for member in members {
            if Some(member) == except {
                continue;
            }
            if let Some(handle) = sockets.get(member) {
                let _ = handle.addr.send(ObserverUpdate::Send {
                    message: message.clone(),
                });
            }
        }
    }

    /// Applies one event to the sockets this node holds. Runs synchronously
    /// at the origin right after the authoritative write, and again on every
    /// remote node from the bus subscriber (after loop suppression).
    pub fn fan_out(&self, event: &GameEvent) {
        match event {
            GameEvent::GameStarted { .. } => {
                // Room is empty until the players send start_game.
            }
            GameEvent::MoveMade {
                game_id,
                player,
                san,
                from,
                to,
                fen,
                pgn,
                move_number,
                time_left,
                ..
            } => {
                self.broadcast_room(
                    game_id,
                    &ClientUpdate::Move {
                        game_id: game_id.clone(),
                        player: *player,
                        san: san.clone(),
                        from: from.clone(),
                        to: to.clone(),
                        fen: fen.clone(),
                        pgn: pgn.clone(),
                        move_number: *move_number,
                        time_left: *time_left,
                    },
                );
            }
            GameEvent::GameEnded {
                game_id,
                winner,
                reason,
                score,
                final_fen,
                final_pgn,
                rating_changes,
            } => {
                self.broadcast_room(
                    game_id,
                    &ClientUpdate::GameOver {
                        game_id: game_id.clone(),
                        winner: *winner,
                        reason: *reason,
                        result: *score,
                        final_fen: final_fen.clone(),
                        final_pgn: final_pgn.clone(),
                        rating_changes: *rating_changes,
                    },
                );
            }
            GameEvent::DrawOffered { game_id, by } => {
                self.broadcast_room(
                    game_id,
                    &ClientUpdate::DrawOffered {
                        game_id: game_id.clone(),
                        by: *by,
                    },
                );
            }
            GameEvent::DrawDeclined { game_id, by } => {
                self.broadcast_room(
                    game_id,
                    &ClientUpdate::DrawDeclined {
                        game_id: game_id.clone(),
                        by: *by,
                    },
                );
            }
            GameEvent::RematchOffered { game_id, by } => {
                self.broadcast_room(
                    game_id,
                    &ClientUpdate::RematchOffered {
                        game_id: game_id.clone(),
                        by: *by,
                    },
                );
            }
            GameEvent::RematchAccepted {
                game_id,
                new_game_id,
            } => {
                self.broadcast_room(
                    game_id,
                    &ClientUpdate::RematchAccepted {
                        game_id: game_id.clone(),
                        new_game_id: new_game_id.clone(),
                    },
                );
                self.drop_room(game_id);
            }
            GameEvent::RematchDeclined { game_id, by } => {
                self.broadcast_room(
                    game_id,
                    &ClientUpdate::RematchDeclined {
                        game_id: game_id.clone(),
                        by: *by,
                    },
                );
            }
            GameEvent::TimeUpdate {
                game_id,
                white_ms,
                black_ms,
                current_turn,
            } => {
                self.broadcast_room(
                    game_id,
                    &ClientUpdate::TimeUpdate {
                        game_id: game_id.clone(),
                        white_ms: *white_ms,
                        black_ms: *black_ms,
                        current_turn: *current_turn,
                        now: get_unix_time_now(),
                    },
                );
            }
            GameEvent::PlayerDisconnected {
                player_id,
                game_id: Some(game_id),
            } => {
                self.broadcast_room_except(
                    game_id,
                    player_id,
                    &ClientUpdate::OpponentReconnecting {
                        game_id: game_id.clone(),
                    },
                );
            }
            GameEvent::PlayerReconnected {
                player_id,
                game_id: Some(game_id),
            } => {
                self.broadcast_room_except(
                    game_id,
                    player_id,
                    &ClientUpdate::OpponentReconnected {
                        game_id: game_id.clone(),
                    },
                );
            }
            GameEvent::MatchFound {
                game_id,
                rating_changes,
                seats,
                ..
            } => {
                for seat in seats {
                    self.send_to_player(
                        &seat.player_id,
                        ClientUpdate::MatchFound {
                            game_id: game_id.clone(),
                            opponent: seat.opponent.clone(),
                            rating_changes: *rating_changes,
                            search_duration_ms: seat.search_duration_ms,
                            final_range: seat.final_range,
                        },
                    );
                }
            }
            // Nothing socket-visible: persistence or bookkeeping only.
            GameEvent::PlayerResigned { .. }
            | GameEvent::DrawAccepted { .. }
            | GameEvent::TimeUp { .. }
            | GameEvent::PlayerConnected { .. }
            | GameEvent::PlayerDisconnected { .. }
            | GameEvent::PlayerReconnected { .. }
            | GameEvent::RatingUpdated { .. } => {}
        }
    }
}
