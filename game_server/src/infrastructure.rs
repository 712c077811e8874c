// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::chess::ChessEngine;
use crate::context::CoreContext;
use crate::error::CoreError;
use crate::options::Options;
use crate::pipeline::PersistencePipeline;
use actix::{Actor, Addr, AsyncContext, Context as ActorContext, Handler};
use core_protocol::event::GameEvent;
use core_protocol::get_unix_time_now;
use core_protocol::id::GameId;
use core_protocol::rpc::ClientUpdate;
use log::{error, info, warn};
use server_util::database::{Database, DurableStore};
use server_util::database_schema::GameStatus;
use server_util::event_bus::{DedupWindow, EventBus, LocalEventBus, RedisEventBus};
use server_util::live_store::{LiveStore, RedisLiveStore};
use server_util::observer::ObserverMessage;
use std::sync::Arc;
use std::time::Duration;

/// One process-wide clock scan; no per-game timers.
const SCAN_PERIOD: Duration = Duration::from_secs(1);
const REMOTE_DEDUP_WINDOW: usize = 4096;
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(5);

/// An entire game server node: repos, scan ticker, socket routing. One per
/// process, owned by the runtime from start to stop.
pub struct Infrastructure<E: ChessEngine> {
    pub context: CoreContext<E>,
}

impl<E: ChessEngine> Actor for Infrastructure<E> {
    type Context = ActorContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("infrastructure started on node {}", self.context.node_id);
        ctx.run_interval(SCAN_PERIOD, Self::scan);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // A node without this actor should be restarted by its supervisor.
        error!("infrastructure stopped");
    }
}

impl<E: ChessEngine> Infrastructure<E> {
    /// Called once per scan tick: flag falls and bullet time broadcasts.
    fn scan(&mut self, _ctx: &mut ActorContext<Self>) {
        let now = get_unix_time_now();

        for (game_id, color) in self.context.clocks.take_expired(now) {
            let games = self.context.games.clone();
            actix::spawn(async move {
                match games.timeout_forfeit(&game_id, color).await {
                    Ok(()) => info!("game {} forfeited on time by {}", game_id, color),
                    // Another node (or path) finalized first.
                    Err(CoreError::Finalized) | Err(CoreError::NotFound) => {}
                    Err(e) => error!("timeout forfeit failed for {}: {}", game_id, e),
                }
            });
        }

        for (game_id, clock, current_turn) in self.context.clocks.bullet_snapshots(now) {
            let publisher = self.context.publisher.clone();
            actix::spawn(async move {
                publisher
                    .publish(GameEvent::TimeUpdate {
                        game_id,
                        white_ms: clock.white_ms,
                        black_ms: clock.black_ms,
                        current_turn,
                    })
                    .await;
            });
        }
    }
}

impl<E: ChessEngine> Handler<ObserverMessage> for Infrastructure<E> {
    type Result = ();

    fn handle(&mut self, msg: ObserverMessage, _ctx: &mut Self::Context) {
        match msg {
            ObserverMessage::Register {
                player_id,
                connection_id,
                observer,
            } => {
                // Socket registration is synchronous so requests already in
                // the mailbox see it; the store work happens off-actor.
                let rooms = self.context.clients.register(
                    player_id.clone(),
                    connection_id.clone(),
                    observer,
                );
                let context = self.context.clone();
                actix::spawn(async move {
                    context.after_register(player_id, connection_id, rooms).await;
                });
            }
            ObserverMessage::Unregister {
                player_id,
                connection_id,
            } => {
                if let Some(rooms) = self.context.clients.unregister(&player_id, &connection_id)
                {
                    let context = self.context.clone();
                    actix::spawn(async move {
                        context.after_unregister(player_id, rooms).await;
                    });
                }
            }
            ObserverMessage::Request { player_id, request } => {
                // One logical task per incoming client message.
                let context = self.context.clone();
                actix::spawn(async move {
                    match context.handle_request(&player_id, request).await {
                        Ok(Some(update)) => {
                            context.clients.send_to_player(&player_id, update);
                        }
                        Ok(None) => {}
                        // The game was already over; expected race, not an error.
                        Err(CoreError::Finalized) => {}
                        Err(e) => {
                            context.clients.send_to_player(
                                &player_id,
                                ClientUpdate::CommandRejected {
                                    message: e.to_string(),
                                },
                            );
                        }
                    }
                });
            }
        }
    }
}

/// Consumes the bus and applies remote nodes' events locally. Own echoes are
/// suppressed; redelivered envelopes are dropped.
pub async fn run_subscriber<E: ChessEngine>(context: CoreContext<E>) {
    let mut dedup = DedupWindow::new(REMOTE_DEDUP_WINDOW);
    loop {
        let mut rx = match context.bus.subscribe().await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("bus subscribe failed, retrying: {}", e);
                tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
                continue;
            }
        };
        while let Some(envelope) = rx.recv().await {
            if envelope.origin_node_id == context.node_id {
                // This node already fanned out synchronously.
                continue;
            }
            if !dedup.insert(&envelope) {
                continue;
            }
            context.apply_remote(&envelope);
        }
        warn!("bus subscription ended, resubscribing");
    }
}

/// Startup reconciliation: walks the live store for games that finished
/// (the `gameOver` guard flipped) but whose durable record never completed,
/// and re-queues their game-ending events. This is the recovery path behind
/// the pipeline's dead-letter log. Returns how many games were re-queued.
pub async fn reconcile_finished_games<E: ChessEngine>(context: &CoreContext<E>) -> usize {
    let keys = match context.live.scan_keys("game:*").await {
        Ok(keys) => keys,
        Err(e) => {
            warn!("live store rescan failed: {}", e);
            return 0;
        }
    };

    let mut recovered = 0;
    for key in keys {
        let game_id = match key.strip_prefix("game:") {
            Some(id) => GameId::new(id),
            None => continue,
        };
        let game = match context.games.load(&game_id).await {
            Ok(game) => game,
            Err(_) => continue,
        };
        if !game.game_over {
            continue;
        }
        let (reason, score) = match (game.end_reason, game.result) {
            (Some(reason), Some(score)) => (reason, score),
            _ => continue,
        };
        match context.durable.get_game(&game_id).await {
            Ok(Some(item)) if item.game_status == GameStatus::Completed => continue,
            // Store can't answer; leave the game for the next restart.
            Err(_) => continue,
            _ => {}
        }

        context
            .publisher
            .persist_only(GameEvent::GameEnded {
                game_id: game_id.clone(),
                winner: game.winner,
                reason,
                score,
                final_fen: String::new(),
                final_pgn: game.pgn.clone(),
                rating_changes: Some(game.rating_changes),
            })
            .await;
        for seat in &game.players {
            if let Some(post_rating) = seat.post_rating {
                context
                    .publisher
                    .persist_only(GameEvent::RatingUpdated {
                        game_id: game_id.clone(),
                        player_id: seat.player_id.clone(),
                        color: seat.color,
                        variant: game.info.variant,
                        old_rating: seat.pre_rating,
                        new_rating: post_rating,
                    })
                    .await;
            }
        }
        recovered += 1;
    }
    recovered
}

/// Wires a context to its background tasks and starts the actor. Requires a
/// running actix system; the caller keeps the returned address alive.
pub fn start_with<E: ChessEngine>(
    engine: Arc<E>,
    live: Arc<dyn LiveStore>,
    durable: Arc<dyn DurableStore>,
    bus: Arc<dyn EventBus>,
) -> Addr<Infrastructure<E>> {
    let (context, pipeline_rx) = CoreContext::new(engine, live, durable, bus);
    PersistencePipeline::spawn(Arc::clone(&context.durable), pipeline_rx);
    let reconcile_context = context.clone();
    actix::spawn(async move {
        let recovered = reconcile_finished_games(&reconcile_context).await;
        if recovered > 0 {
            info!("re-queued {} finished games for persistence", recovered);
        }
    });
    actix::spawn(run_subscriber(context.clone()));
    Infrastructure { context }.start()
}

/// Production composition root: redis live store and bus, DynamoDB durable
/// store, everything configured from the environment. A bus outage at boot
/// degrades to local-only fan-out rather than refusing to start.
pub async fn start_node<E: ChessEngine>(
    engine: Arc<E>,
    options: &Options,
) -> Result<Addr<Infrastructure<E>>, CoreError> {
    let live: Arc<dyn LiveStore> =
        Arc::new(RedisLiveStore::connect(&options.redis_url).await?);
    let durable: Arc<dyn DurableStore> =
        Arc::new(Database::new(options.database_read_only).await);
    let bus: Arc<dyn EventBus> = match RedisEventBus::connect(&options.redis_url).await {
        Ok(bus) => Arc::new(bus),
        Err(e) => {
            warn!("event bus unavailable at startup, local fan-out only: {}", e);
            Arc::new(LocalEventBus::new())
        }
    };
    Ok(start_with(engine, live, durable, bus))
}
