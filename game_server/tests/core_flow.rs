// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end flows over the in-memory store, local bus, and scripted
//! engine: matchmaking, moves, clocks, endings, ratings.

use core_protocol::event::EventEnvelope;
use core_protocol::game::{Color, EndReason, GameType, GameVariant, Score, TimeControl};
use core_protocol::get_unix_time_now;
use core_protocol::id::{ConnectionId, GameId, PlayerId};
use core_protocol::rpc::{ClientRequest, ClientUpdate};
use game_server::chess::ScriptedEngine;
use game_server::context::CoreContext;
use game_server::error::CoreError;
use game_server::infrastructure::reconcile_finished_games;
use game_server::keys;
use game_server::pipeline::PersistencePipeline;
use server_util::database::{DurableStore, MemoryDurableStore};
use server_util::database_schema::{GameStatus, ProfileItem};
use server_util::event_bus::LocalEventBus;
use server_util::live_store::{LiveStore, MemoryLiveStore};
use server_util::observer::ObserverUpdate;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

struct Harness {
    context: CoreContext<ScriptedEngine>,
    live: Arc<MemoryLiveStore>,
    durable: Arc<MemoryDurableStore>,
    /// Held open so publishers can buffer instead of seeing a closed pipe.
    _pipeline_rx: mpsc::Receiver<EventEnvelope>,
}

fn harness() -> Harness {
    let live = Arc::new(MemoryLiveStore::new());
    let durable = Arc::new(MemoryDurableStore::new());
    let (context, pipeline_rx) = CoreContext::new(
        Arc::new(ScriptedEngine),
        live.clone() as Arc<dyn LiveStore>,
        durable.clone() as Arc<dyn DurableStore>,
        Arc::new(LocalEventBus::new()),
    );
    Harness {
        context,
        live,
        durable,
        _pipeline_rx: pipeline_rx,
    }
}

async fn seed_profile(harness: &Harness, name: &str, rapid: u16) -> ProfileItem {
    let mut profile = ProfileItem::new(PlayerId::new(name));
    profile.ratings.rapid = rapid;
    harness.durable.put_profile(profile.clone()).await.unwrap();
    profile
}

async fn connect(harness: &Harness, name: &str) -> UnboundedReceiver<ObserverUpdate> {
    let (tx, rx) = unbounded_channel();
    let player = PlayerId::new(name);
    let connection = ConnectionId::new(format!("conn-{}", name));
    let rooms = harness
        .context
        .clients
        .register(player.clone(), connection.clone(), tx);
    harness
        .context
        .after_register(player, connection, rooms)
        .await;
    rx
}

fn rapid(time: u32, increment: u32) -> (GameVariant, TimeControl) {
    (GameVariant::Rapid, TimeControl { time, increment })
}

fn drain(rx: &mut UnboundedReceiver<ObserverUpdate>) -> Vec<ClientUpdate> {
    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        if let ObserverUpdate::Send { message } = update {
            updates.push(message);
        }
    }
    updates
}

fn find_match_found(updates: &[ClientUpdate]) -> Option<(GameId, u64, u32)> {
    updates.iter().find_map(|update| match update {
        ClientUpdate::MatchFound {
            game_id,
            search_duration_ms,
            final_range,
            ..
        } => Some((game_id.clone(), *search_duration_ms, *final_range)),
        _ => None,
    })
}

async fn search(
    harness: &Harness,
    name: &str,
    variant: GameVariant,
    time_control: TimeControl,
) -> Option<ClientUpdate> {
    harness
        .context
        .handle_request(
            &PlayerId::new(name),
            ClientRequest::SearchMatch {
                variant,
                time_control,
            },
        )
        .await
        .unwrap()
}

/// Pairs alice (white seat decided by the color draw) with bob and returns
/// the game, with both sockets joined to the room.
async fn pair(
    harness: &Harness,
    a_rx: &mut UnboundedReceiver<ObserverUpdate>,
    b_rx: &mut UnboundedReceiver<ObserverUpdate>,
    time_control: TimeControl,
) -> GameId {
    let first = search(harness, "alice", GameVariant::Rapid, time_control).await;
    assert!(matches!(
        first,
        Some(ClientUpdate::SearchStatus {
            is_searching: true,
            ..
        })
    ));
    let second = search(harness, "bob", GameVariant::Rapid, time_control).await;
    assert!(second.is_none(), "second searcher should pair immediately");

    let (game_id, _, _) = find_match_found(&drain(a_rx)).expect("alice match_found");
    let (game_id_b, _, _) = find_match_found(&drain(b_rx)).expect("bob match_found");
    assert_eq!(game_id, game_id_b);

    for name in ["alice", "bob"] {
        let joined = harness
            .context
            .handle_request(
                &PlayerId::new(name),
                ClientRequest::StartGame {
                    game_id: game_id.clone(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(joined, Some(ClientUpdate::GameJoined { .. })));
    }
    drain(a_rx);
    drain(b_rx);
    game_id
}

fn white_player(game: &game_server::live_game::LiveGame) -> PlayerId {
    game.seat(Color::White).player_id.clone()
}

#[tokio::test]
async fn matchmaking_pairs_within_initial_range() {
    let harness = harness();
    seed_profile(&harness, "alice", 1200).await;
    seed_profile(&harness, "bob", 1240).await;
    let mut a_rx = connect(&harness, "alice").await;
    let mut b_rx = connect(&harness, "bob").await;

    let game_id = pair(&harness, &mut a_rx, &mut b_rx, TimeControl {
        time: 600,
        increment: 0,
    })
    .await;

    let game = harness.context.games.load(&game_id).await.unwrap();
    assert_eq!(game.time_left.white_ms, 600_000);
    assert_eq!(game.time_left.black_ms, 600_000);
    assert_eq!(game.players.len(), 2);
    assert_ne!(game.players[0].player_id, game.players[1].player_id);
    assert_eq!(game.turn, Color::White);

    // Both are out of the queue and their sessions are gone.
    let queue_key = keys::queue("RAPID_10_0");
    assert_eq!(harness.live.zcard(&queue_key).await.unwrap(), 0);
    for name in ["alice", "bob"] {
        assert!(harness
            .live
            .get(&keys::search_session(&PlayerId::new(name)))
            .await
            .unwrap()
            .is_none());
    }
}

#[tokio::test]
async fn range_expansion_reaches_distant_opponent() {
    let harness = harness();
    seed_profile(&harness, "alice", 1200).await;
    seed_profile(&harness, "bob", 1400).await;
    let mut a_rx = connect(&harness, "alice").await;
    let _b_rx = connect(&harness, "bob").await;

    let (variant, tc) = rapid(600, 0);
    search(&harness, "alice", variant, tc).await;
    match search(&harness, "bob", variant, tc).await {
        Some(ClientUpdate::SearchStatus {
            is_searching: true,
            current_range: 60,
            ..
        }) => {}
        other => panic!("expected still-searching at range 60, got {:?}", other),
    }

    // Rewind bob's searchStartTime ~9.5 s so the window has grown to 240,
    // which covers the 200-point gap.
    let session_key = keys::search_session(&PlayerId::new("bob"));
    let raw = harness.live.get(&session_key).await.unwrap().unwrap();
    let mut session: serde_json::Value = serde_json::from_str(&raw).unwrap();
    session["searchStartTime"] =
        serde_json::json!(get_unix_time_now().saturating_sub(9_500));
    harness
        .live
        .set_ex(
            &session_key,
            &session.to_string(),
            std::time::Duration::from_secs(300),
        )
        .await
        .unwrap();

    let outcome = harness
        .context
        .matchmaker
        .tick(&PlayerId::new("bob"))
        .await
        .unwrap();
    match outcome {
        game_server::matchmaker::TickOutcome::Found { current_range, .. } => {
            assert_eq!(current_range, 240);
        }
        other => panic!("expected pairing at range 240, got {:?}", other),
    }
    let (_, _, final_range) = find_match_found(&drain(&mut a_rx)).expect("alice notified");
    assert_eq!(final_range, 60);
}

#[tokio::test]
async fn move_updates_clock_turn_and_pgn() {
    let harness = harness();
    seed_profile(&harness, "alice", 1200).await;
    seed_profile(&harness, "bob", 1200).await;
    let mut a_rx = connect(&harness, "alice").await;
    let mut b_rx = connect(&harness, "bob").await;
    let game_id = pair(&harness, &mut a_rx, &mut b_rx, TimeControl {
        time: 300,
        increment: 2,
    })
    .await;

    let game = harness.context.games.load(&game_id).await.unwrap();
    let white = white_player(&game);

    // Pretend the game has been waiting on white for 4 s.
    let now = get_unix_time_now();
    harness
        .live
        .hset(
            &keys::game(&game_id),
            &[("lastMoveAt".to_owned(), (now - 4_000).to_string())],
        )
        .await
        .unwrap();

    harness
        .context
        .games
        .apply_move(&game_id, &white, "e4")
        .await
        .unwrap();

    let game = harness.context.games.load(&game_id).await.unwrap();
    assert_eq!(game.moves.len(), 1);
    assert_eq!(game.pgn, "1. e4");
    assert_eq!(game.turn, Color::Black);
    // 300000 - ~4000 + 2000, allowing a little test wall-time.
    assert!(
        (297_500..=298_000).contains(&game.time_left.white_ms),
        "white clock {}",
        game.time_left.white_ms
    );
    assert_eq!(game.time_left.black_ms, 300_000);

    // Both room members observed the move.
    for rx in [&mut a_rx, &mut b_rx] {
        let updates = drain(rx);
        assert!(updates.iter().any(|update| matches!(
            update,
            ClientUpdate::Move { san, move_number: 1, .. } if san == "e4"
        )));
    }
}

#[tokio::test]
async fn turn_and_membership_are_enforced() {
    let harness = harness();
    seed_profile(&harness, "alice", 1200).await;
    seed_profile(&harness, "bob", 1200).await;
    let mut a_rx = connect(&harness, "alice").await;
    let mut b_rx = connect(&harness, "bob").await;
    let game_id = pair(&harness, &mut a_rx, &mut b_rx, TimeControl {
        time: 600,
        increment: 0,
    })
    .await;
    let game = harness.context.games.load(&game_id).await.unwrap();
    let black = game.seat(Color::Black).player_id.clone();

    // Not black's turn yet.
    assert!(matches!(
        harness.context.games.apply_move(&game_id, &black, "e5").await,
        Err(CoreError::NotYourTurn)
    ));
    // Strangers can't move at all.
    assert!(matches!(
        harness
            .context
            .games
            .apply_move(&game_id, &PlayerId::new("mallory"), "e4")
            .await,
        Err(CoreError::Unauthorized)
    ));
    // Unknown game.
    assert!(matches!(
        harness
            .context
            .games
            .apply_move(&GameId::new("missing"), &black, "e4")
            .await,
        Err(CoreError::NotFound)
    ));
    // Illegal SAN is rejected without touching state.
    let white = white_player(&game);
    assert!(matches!(
        harness
            .context
            .games
            .apply_move(&game_id, &white, "illegal")
            .await,
        Err(CoreError::IllegalMove(_))
    ));
    let game = harness.context.games.load(&game_id).await.unwrap();
    assert!(game.moves.is_empty());
}

#[tokio::test]
async fn checkmate_finalizes_and_updates_ratings_once() {
    let harness = harness();
    seed_profile(&harness, "alice", 1200).await;
    seed_profile(&harness, "bob", 1200).await;
    let mut a_rx = connect(&harness, "alice").await;
    let mut b_rx = connect(&harness, "bob").await;
    let game_id = pair(&harness, &mut a_rx, &mut b_rx, TimeControl {
        time: 600,
        increment: 0,
    })
    .await;
    let game = harness.context.games.load(&game_id).await.unwrap();
    let white = white_player(&game);
    let black = game.seat(Color::Black).player_id.clone();

    for (player, san) in [
        (&white, "f3"),
        (&black, "e5"),
        (&white, "g4"),
        (&black, "Qh4#"),
    ] {
        harness
            .context
            .games
            .apply_move(&game_id, player, san)
            .await
            .unwrap();
    }

    let game = harness.context.games.load(&game_id).await.unwrap();
    assert!(game.game_over);
    assert_eq!(game.winner, Some(Color::Black));
    assert_eq!(game.end_reason, Some(EndReason::Checkmate));
    assert_eq!(game.result, Some(Score::BlackWin));
    assert_eq!(game.pgn, "1. f3 e5 2. g4 Qh4#");

    // No further moves, resignations, or draws.
    assert!(matches!(
        harness.context.games.apply_move(&game_id, &white, "a3").await,
        Err(CoreError::Finalized)
    ));
    assert!(matches!(
        harness.context.games.resign(&game_id, &white).await,
        Err(CoreError::Finalized)
    ));

    // Ratings applied exactly once, zero-sum within rounding.
    let winner = harness
        .durable
        .get_profile(&black)
        .await
        .unwrap()
        .unwrap();
    let loser = harness
        .durable
        .get_profile(&white)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(winner.games_played, 1);
    assert_eq!(loser.games_played, 1);
    assert_eq!(winner.wins, 1);
    assert_eq!(loser.losses, 1);
    let delta_winner = winner.ratings.rapid as i32 - 1200;
    let delta_loser = loser.ratings.rapid as i32 - 1200;
    assert!(delta_winner > 0);
    assert!((delta_winner + delta_loser).abs() <= 1);

    // Room observed exactly one game_over.
    let updates = drain(&mut b_rx);
    let game_overs: Vec<_> = updates
        .iter()
        .filter(|update| matches!(update, ClientUpdate::GameOver { .. }))
        .collect();
    assert_eq!(game_overs.len(), 1);
}

#[tokio::test]
async fn resignation_is_finalized_exactly_once() {
    let harness = harness();
    seed_profile(&harness, "alice", 1300).await;
    seed_profile(&harness, "bob", 1300).await;
    let mut a_rx = connect(&harness, "alice").await;
    let mut b_rx = connect(&harness, "bob").await;
    let game_id = pair(&harness, &mut a_rx, &mut b_rx, TimeControl {
        time: 600,
        increment: 0,
    })
    .await;
    let game = harness.context.games.load(&game_id).await.unwrap();
    let white = white_player(&game);
    let black = game.seat(Color::Black).player_id.clone();

    harness.context.games.resign(&game_id, &black).await.unwrap();

    let game = harness.context.games.load(&game_id).await.unwrap();
    assert!(game.game_over);
    assert_eq!(game.winner, Some(Color::White));
    assert_eq!(game.end_reason, Some(EndReason::Resignation));
    assert_eq!(game.result, Some(Score::WhiteWin));

    // A second resign (by either side) is a finalization race, not a success.
    assert!(matches!(
        harness.context.games.resign(&game_id, &white).await,
        Err(CoreError::Finalized)
    ));
    let winner = harness.durable.get_profile(&white).await.unwrap().unwrap();
    assert_eq!(winner.games_played, 1);
}

#[tokio::test]
async fn draw_offer_accept_flow() {
    let harness = harness();
    seed_profile(&harness, "alice", 1200).await;
    seed_profile(&harness, "bob", 1200).await;
    let mut a_rx = connect(&harness, "alice").await;
    let mut b_rx = connect(&harness, "bob").await;
    let game_id = pair(&harness, &mut a_rx, &mut b_rx, TimeControl {
        time: 600,
        increment: 0,
    })
    .await;
    let game = harness.context.games.load(&game_id).await.unwrap();
    let white = white_player(&game);
    let black = game.seat(Color::Black).player_id.clone();

    // Accepting with nothing standing is a contract error.
    assert!(matches!(
        harness.context.games.accept_draw(&game_id, &black).await,
        Err(CoreError::BadRequest(_))
    ));

    harness
        .context
        .games
        .offer_draw(&game_id, &white)
        .await
        .unwrap();
    // The offerer can't accept their own offer.
    assert!(matches!(
        harness.context.games.accept_draw(&game_id, &white).await,
        Err(CoreError::BadRequest(_))
    ));
    harness
        .context
        .games
        .accept_draw(&game_id, &black)
        .await
        .unwrap();

    let game = harness.context.games.load(&game_id).await.unwrap();
    assert!(game.game_over);
    assert_eq!(game.winner, None);
    assert_eq!(game.end_reason, Some(EndReason::Agreement));
    assert_eq!(game.result, Some(Score::Draw));

    let profile = harness.durable.get_profile(&white).await.unwrap().unwrap();
    assert_eq!(profile.draws, 1);
}

#[tokio::test]
async fn declined_draw_clears_the_offer() {
    let harness = harness();
    seed_profile(&harness, "alice", 1200).await;
    seed_profile(&harness, "bob", 1200).await;
    let mut a_rx = connect(&harness, "alice").await;
    let mut b_rx = connect(&harness, "bob").await;
    let game_id = pair(&harness, &mut a_rx, &mut b_rx, TimeControl {
        time: 600,
        increment: 0,
    })
    .await;
    let game = harness.context.games.load(&game_id).await.unwrap();
    let white = white_player(&game);
    let black = game.seat(Color::Black).player_id.clone();

    harness
        .context
        .games
        .offer_draw(&game_id, &white)
        .await
        .unwrap();
    harness
        .context
        .games
        .decline_draw(&game_id, &black)
        .await
        .unwrap();

    let game = harness.context.games.load(&game_id).await.unwrap();
    assert_eq!(game.draw_offered_by, None);
    // The offer no longer stands.
    assert!(matches!(
        harness.context.games.accept_draw(&game_id, &black).await,
        Err(CoreError::BadRequest(_))
    ));
}

#[tokio::test]
async fn timeout_forfeit_within_one_scan() {
    let harness = harness();
    seed_profile(&harness, "alice", 1200).await;
    seed_profile(&harness, "bob", 1200).await;
    let _a_rx = connect(&harness, "alice").await;
    let _b_rx = connect(&harness, "bob").await;

    let white = harness
        .durable
        .get_profile(&PlayerId::new("alice"))
        .await
        .unwrap()
        .unwrap();
    let black = harness
        .durable
        .get_profile(&PlayerId::new("bob"))
        .await
        .unwrap()
        .unwrap();
    let game = harness
        .context
        .games
        .create_game(
            &white,
            &black,
            GameType {
                variant: GameVariant::Rapid,
                time_control: TimeControl {
                    time: 1,
                    increment: 0,
                },
            },
            None,
        )
        .await
        .unwrap();

    // One second later white's flag has fallen; the scan picks it up.
    let scan_time = get_unix_time_now() + 1_100;
    let expired = harness.context.clocks.take_expired(scan_time);
    assert_eq!(expired.len(), 1);
    let (game_id, loser) = expired.into_iter().next().unwrap();
    assert_eq!(game_id, game.game_id);
    assert_eq!(loser, Color::White);

    harness
        .context
        .games
        .timeout_forfeit(&game_id, loser)
        .await
        .unwrap();

    let game = harness.context.games.load(&game_id).await.unwrap();
    assert!(game.game_over);
    assert_eq!(game.winner, Some(Color::Black));
    assert_eq!(game.end_reason, Some(EndReason::Timeout));
    assert_eq!(game.result, Some(Score::BlackWin));

    // A duplicate report of the same flag fall is the expected race.
    assert!(matches!(
        harness.context.games.timeout_forfeit(&game_id, loser).await,
        Err(CoreError::Finalized)
    ));
}

#[tokio::test]
async fn bogus_time_up_report_gets_corrective_sync() {
    let harness = harness();
    seed_profile(&harness, "alice", 1200).await;
    seed_profile(&harness, "bob", 1200).await;
    let mut a_rx = connect(&harness, "alice").await;
    let mut b_rx = connect(&harness, "bob").await;
    let game_id = pair(&harness, &mut a_rx, &mut b_rx, TimeControl {
        time: 600,
        increment: 0,
    })
    .await;
    let game = harness.context.games.load(&game_id).await.unwrap();
    let black = game.seat(Color::Black).player_id.clone();

    // White has plenty of time; the reporter alone gets corrected.
    let corrective = harness
        .context
        .games
        .handle_time_up(&game_id, &black, Color::White)
        .await
        .unwrap();
    match corrective {
        Some(ClientUpdate::TimeUpdate {
            white_ms,
            current_turn,
            ..
        }) => {
            assert!(white_ms > 590_000);
            assert_eq!(current_turn, Color::White);
        }
        other => panic!("expected corrective time update, got {:?}", other),
    }
    let game = harness.context.games.load(&game_id).await.unwrap();
    assert!(!game.game_over);
}

#[tokio::test]
async fn search_status_and_queue_stats() {
    let harness = harness();
    seed_profile(&harness, "alice", 1200).await;
    let _a_rx = connect(&harness, "alice").await;
    let (variant, tc) = rapid(600, 0);

    // Nothing open yet.
    let status = harness
        .context
        .handle_request(&PlayerId::new("alice"), ClientRequest::GetSearchStatus)
        .await
        .unwrap();
    assert!(matches!(
        status,
        Some(ClientUpdate::SearchStatus {
            is_searching: false,
            ..
        })
    ));

    search(&harness, "alice", variant, tc).await;
    let status = harness
        .context
        .handle_request(&PlayerId::new("alice"), ClientRequest::GetSearchStatus)
        .await
        .unwrap();
    match status {
        Some(ClientUpdate::SearchStatus {
            is_searching: true,
            current_range,
            ..
        }) => assert_eq!(current_range, 60),
        other => panic!("expected open search, got {:?}", other),
    }

    let game_type = GameType {
        variant,
        time_control: tc,
    };
    let depths = harness
        .context
        .matchmaker
        .stats(&[game_type])
        .await
        .unwrap();
    assert_eq!(depths, vec![("RAPID_10_0".to_owned(), 1)]);

    // Cancel empties the queue and the status flips back.
    let cancelled = harness
        .context
        .handle_request(&PlayerId::new("alice"), ClientRequest::CancelSearch)
        .await
        .unwrap();
    assert!(matches!(cancelled, Some(ClientUpdate::SearchCancelled)));
    let depths = harness
        .context
        .matchmaker
        .stats(&[game_type])
        .await
        .unwrap();
    assert_eq!(depths, vec![("RAPID_10_0".to_owned(), 0)]);
}

#[tokio::test]
async fn time_sync_returns_authoritative_snapshot() {
    let harness = harness();
    seed_profile(&harness, "alice", 1200).await;
    seed_profile(&harness, "bob", 1200).await;
    let mut a_rx = connect(&harness, "alice").await;
    let mut b_rx = connect(&harness, "bob").await;
    let game_id = pair(&harness, &mut a_rx, &mut b_rx, TimeControl {
        time: 300,
        increment: 0,
    })
    .await;

    let sync = harness
        .context
        .handle_request(
            &PlayerId::new("alice"),
            ClientRequest::RequestTimeSync {
                game_id: game_id.clone(),
            },
        )
        .await
        .unwrap();
    match sync {
        Some(ClientUpdate::TimeUpdate {
            white_ms,
            black_ms,
            current_turn,
            ..
        }) => {
            assert!(white_ms <= 300_000);
            assert!(white_ms > 295_000);
            assert_eq!(black_ms, 300_000);
            assert_eq!(current_turn, Color::White);
        }
        other => panic!("expected time update, got {:?}", other),
    }

    // The per-socket limiter eventually sheds the chatter silently.
    let mut shed = false;
    for _ in 0..6 {
        let reply = harness
            .context
            .handle_request(
                &PlayerId::new("alice"),
                ClientRequest::RequestTimeSync {
                    game_id: game_id.clone(),
                },
            )
            .await
            .unwrap();
        if reply.is_none() {
            shed = true;
        }
    }
    assert!(shed);
}

#[tokio::test]
async fn rematch_swaps_colors_and_links_games() {
    let harness = harness();
    seed_profile(&harness, "alice", 1200).await;
    seed_profile(&harness, "bob", 1200).await;
    let mut a_rx = connect(&harness, "alice").await;
    let mut b_rx = connect(&harness, "bob").await;
    let game_id = pair(&harness, &mut a_rx, &mut b_rx, TimeControl {
        time: 600,
        increment: 0,
    })
    .await;
    let game = harness.context.games.load(&game_id).await.unwrap();
    let white = white_player(&game);
    let black = game.seat(Color::Black).player_id.clone();

    // Rematch offers only make sense once the game is over.
    assert!(matches!(
        harness.context.games.offer_rematch(&game_id, &white).await,
        Err(CoreError::BadRequest(_))
    ));

    harness.context.games.resign(&game_id, &black).await.unwrap();
    harness
        .context
        .games
        .offer_rematch(&game_id, &white)
        .await
        .unwrap();
    let rematch = harness
        .context
        .games
        .accept_rematch(&game_id, &black)
        .await
        .unwrap();

    // Colors swapped, clocks fresh.
    assert_eq!(rematch.seat(Color::White).player_id, black);
    assert_eq!(rematch.seat(Color::Black).player_id, white);
    assert_eq!(rematch.time_left.white_ms, 600_000);
    assert!(!rematch.game_over);

    let old = harness.context.games.load(&game_id).await.unwrap();
    assert_eq!(old.rematch_game_id, Some(rematch.game_id.clone()));
    let durable_new = harness
        .durable
        .get_game(&rematch.game_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(durable_new.rematch_of, Some(game_id.clone()));

    // A second accept can't spawn a second game.
    assert!(matches!(
        harness.context.games.accept_rematch(&game_id, &black).await,
        Err(CoreError::Conflict(_))
    ));
}

#[tokio::test]
async fn restart_requeues_unpersisted_game_endings() {
    let harness = harness();
    seed_profile(&harness, "alice", 1200).await;
    seed_profile(&harness, "bob", 1200).await;
    let mut a_rx = connect(&harness, "alice").await;
    let mut b_rx = connect(&harness, "bob").await;
    let game_id = pair(&harness, &mut a_rx, &mut b_rx, TimeControl {
        time: 600,
        increment: 0,
    })
    .await;
    let game = harness.context.games.load(&game_id).await.unwrap();
    let black = game.seat(Color::Black).player_id.clone();

    harness.context.games.resign(&game_id, &black).await.unwrap();

    // The harness pipeline never ran, so the durable record still says
    // in_progress even though the live game finalized (a crashed node).
    let stale = harness.durable.get_game(&game_id).await.unwrap().unwrap();
    assert_eq!(stale.game_status, GameStatus::InProgress);

    // A fresh node over the same stores picks the loss up at startup.
    let (restarted, pipeline_rx) = CoreContext::new(
        Arc::new(ScriptedEngine),
        harness.live.clone() as Arc<dyn LiveStore>,
        harness.durable.clone() as Arc<dyn DurableStore>,
        Arc::new(LocalEventBus::new()),
    );
    let pipeline = PersistencePipeline::spawn(
        harness.durable.clone() as Arc<dyn DurableStore>,
        pipeline_rx,
    );
    assert_eq!(reconcile_finished_games(&restarted).await, 1);
    drop(restarted);
    pipeline.await.unwrap();

    let item = harness.durable.get_game(&game_id).await.unwrap().unwrap();
    assert_eq!(item.game_status, GameStatus::Completed);
    let result = item.result.unwrap();
    assert_eq!(result.winner, Some(Color::White));
    assert_eq!(result.reason, EndReason::Resignation);
    for seat in &item.players {
        assert!(seat.post_rating.is_some());
    }

    // Once persisted, a further restart has nothing to re-queue.
    let (again, _pipeline_rx) = CoreContext::new(
        Arc::new(ScriptedEngine),
        harness.live.clone() as Arc<dyn LiveStore>,
        harness.durable.clone() as Arc<dyn DurableStore>,
        Arc::new(LocalEventBus::new()),
    );
    assert_eq!(reconcile_finished_games(&again).await, 0);
}

#[tokio::test]
async fn disconnect_pauses_and_rejoin_resumes() {
    let harness = harness();
    seed_profile(&harness, "alice", 1200).await;
    seed_profile(&harness, "bob", 1200).await;
    let mut a_rx = connect(&harness, "alice").await;
    let mut b_rx = connect(&harness, "bob").await;
    let game_id = pair(&harness, &mut a_rx, &mut b_rx, TimeControl {
        time: 600,
        increment: 0,
    })
    .await;

    let alice = PlayerId::new("alice");
    let rooms = harness
        .context
        .clients
        .unregister(&alice, &ConnectionId::new("conn-alice"))
        .unwrap();
    assert_eq!(rooms, vec![game_id.clone()]);
    harness
        .context
        .after_unregister(alice.clone(), rooms)
        .await;

    // Paused: the scanner never sees this game expire.
    let far_future = get_unix_time_now() + 3_600_000;
    assert!(harness.context.clocks.take_expired(far_future).is_empty());

    // Opponent heard about the disconnect, and the search session is gone.
    let updates = drain(&mut b_rx);
    assert!(updates
        .iter()
        .any(|update| matches!(update, ClientUpdate::OpponentReconnecting { .. })));

    // Reconnect and rejoin.
    let (tx, _rx) = unbounded_channel();
    let rooms = harness
        .context
        .clients
        .register(alice.clone(), ConnectionId::new("conn-alice-2"), tx);
    assert_eq!(rooms, vec![game_id.clone()]);
    harness
        .context
        .after_register(alice.clone(), ConnectionId::new("conn-alice-2"), rooms)
        .await;

    let rejoined = harness
        .context
        .handle_request(&alice, ClientRequest::Rejoin { game_id: game_id.clone() })
        .await
        .unwrap();
    assert!(matches!(rejoined, Some(ClientUpdate::GameJoined { .. })));
    let updates = drain(&mut b_rx);
    assert!(updates
        .iter()
        .any(|update| matches!(update, ClientUpdate::OpponentReconnected { .. })));
}
