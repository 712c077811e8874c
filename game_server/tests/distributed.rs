// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Two nodes sharing one live store and one bus: claim-lock pairing races
//! and cross-node fan-out.

use core_protocol::game::{GameType, GameVariant, TimeControl};
use core_protocol::id::{ConnectionId, PlayerId};
use core_protocol::rpc::{ClientRequest, ClientUpdate};
use game_server::chess::ScriptedEngine;
use game_server::context::CoreContext;
use game_server::infrastructure::run_subscriber;
use game_server::keys;
use game_server::matchmaker::{TickOutcome, MATCH_LOCK_TTL};
use server_util::database::{DurableStore, MemoryDurableStore};
use server_util::database_schema::ProfileItem;
use server_util::event_bus::LocalEventBus;
use server_util::live_store::{LiveStore, MemoryLiveStore};
use server_util::observer::ObserverUpdate;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

struct Cluster {
    live: Arc<MemoryLiveStore>,
    durable: Arc<MemoryDurableStore>,
    node1: CoreContext<ScriptedEngine>,
    node2: CoreContext<ScriptedEngine>,
}

fn cluster() -> Cluster {
    let live = Arc::new(MemoryLiveStore::new());
    let durable = Arc::new(MemoryDurableStore::new());
    let bus = Arc::new(LocalEventBus::new());
    let (node1, _rx1) = CoreContext::new(
        Arc::new(ScriptedEngine),
        live.clone() as Arc<dyn LiveStore>,
        durable.clone() as Arc<dyn DurableStore>,
        bus.clone(),
    );
    let (node2, _rx2) = CoreContext::new(
        Arc::new(ScriptedEngine),
        live.clone() as Arc<dyn LiveStore>,
        durable.clone() as Arc<dyn DurableStore>,
        bus,
    );
    Cluster {
        live,
        durable,
        node1,
        node2,
    }
}

async fn connect_on(
    node: &CoreContext<ScriptedEngine>,
    durable: &Arc<MemoryDurableStore>,
    name: &str,
    rating: u16,
) -> UnboundedReceiver<ObserverUpdate> {
    let mut profile = ProfileItem::new(PlayerId::new(name));
    profile.ratings.rapid = rating;
    durable.put_profile(profile).await.unwrap();

    let (tx, rx) = unbounded_channel();
    let player = PlayerId::new(name);
    let connection = ConnectionId::new(format!("conn-{}", name));
    let rooms = node.clients.register(player.clone(), connection.clone(), tx);
    node.after_register(player, connection, rooms).await;
    rx
}

fn game_type() -> GameType {
    GameType {
        variant: GameVariant::Rapid,
        time_control: TimeControl {
            time: 600,
            increment: 0,
        },
    }
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

#[tokio::test]
async fn foreign_claim_blocks_pairing_until_released() {
    let cluster = cluster();
    let alice = PlayerId::new("alice");
    let bob = PlayerId::new("bob");
    let _a = connect_on(&cluster.node1, &cluster.durable, "alice", 1200).await;
    let _b = connect_on(&cluster.node2, &cluster.durable, "bob", 1230).await;

    cluster
        .node1
        .matchmaker
        .start_search(&alice, game_type(), ConnectionId::new("conn-alice"))
        .await
        .unwrap();
    cluster
        .node2
        .matchmaker
        .start_search(&bob, game_type(), ConnectionId::new("conn-bob"))
        .await
        .unwrap();

    // Some other node is already pairing this exact pair.
    let lock_key = keys::match_lock(&alice, &bob);
    assert!(cluster
        .live
        .set_nx_ex(&lock_key, "node-elsewhere", MATCH_LOCK_TTL)
        .await
        .unwrap());

    let outcome = cluster.node1.matchmaker.tick(&alice).await.unwrap();
    assert!(
        matches!(outcome, TickOutcome::Searching { .. }),
        "claimed pair must not be re-paired"
    );
    // Nobody was dequeued while the foreign claim stood.
    assert_eq!(
        cluster.live.zcard(&keys::queue("RAPID_10_0")).await.unwrap(),
        2
    );

    cluster.live.del(&lock_key).await.unwrap();
    let outcome = cluster.node1.matchmaker.tick(&alice).await.unwrap();
    assert!(matches!(outcome, TickOutcome::Found { .. }));
    assert_eq!(
        cluster.live.zcard(&keys::queue("RAPID_10_0")).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn concurrent_ticks_create_exactly_one_game() {
    let cluster = cluster();
    let alice = PlayerId::new("alice");
    let bob = PlayerId::new("bob");
    let _a = connect_on(&cluster.node1, &cluster.durable, "alice", 1200).await;
    let _b = connect_on(&cluster.node2, &cluster.durable, "bob", 1230).await;

    cluster
        .node1
        .matchmaker
        .start_search(&alice, game_type(), ConnectionId::new("conn-alice"))
        .await
        .unwrap();
    cluster
        .node2
        .matchmaker
        .start_search(&bob, game_type(), ConnectionId::new("conn-bob"))
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        cluster.node1.matchmaker.tick(&alice),
        cluster.node2.matchmaker.tick(&bob),
    );

    let mut found = Vec::new();
    for outcome in [first, second] {
        match outcome {
            Ok(TickOutcome::Found { game_id, .. }) => found.push(game_id),
            // The loser either kept searching or found its session already
            // consumed by the winner.
            Ok(TickOutcome::Searching { .. }) => {}
            Err(game_server::error::CoreError::NotFound) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(found.len(), 1, "exactly one pairing must win");

    // Invariant: at the instant of matching, neither player is queued.
    assert_eq!(
        cluster.live.zcard(&keys::queue("RAPID_10_0")).await.unwrap(),
        0
    );
    let game = cluster.durable.get_game(&found[0]).await.unwrap().unwrap();
    assert_eq!(game.players.len(), 2);
}

#[tokio::test]
async fn bus_replicates_match_and_moves_to_remote_sockets() {
    let cluster = cluster();
    let alice = PlayerId::new("alice");
    let bob = PlayerId::new("bob");
    let mut a_rx = connect_on(&cluster.node1, &cluster.durable, "alice", 1200).await;
    let mut b_rx = connect_on(&cluster.node2, &cluster.durable, "bob", 1230).await;

    let subscriber1 = tokio::spawn(run_subscriber(cluster.node1.clone()));
    let subscriber2 = tokio::spawn(run_subscriber(cluster.node2.clone()));
    tokio::time::sleep(Duration::from_millis(20)).await;

    cluster
        .node1
        .matchmaker
        .start_search(&alice, game_type(), ConnectionId::new("conn-alice"))
        .await
        .unwrap();
    cluster
        .node2
        .matchmaker
        .start_search(&bob, game_type(), ConnectionId::new("conn-bob"))
        .await
        .unwrap();
    let outcome = cluster.node1.matchmaker.tick(&alice).await.unwrap();
    let game_id = match outcome {
        TickOutcome::Found { game_id, .. } => game_id,
        other => panic!("expected pairing, got {:?}", other),
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    let updates = drain(&mut b_rx);
    assert!(
        updates
            .iter()
            .any(|update| matches!(update, ClientUpdate::MatchFound { .. })),
        "remote seat must learn of the match via the bus"
    );

    // Each player joins the room on their own node.
    cluster
        .node1
        .handle_request(
            &alice,
            ClientRequest::StartGame {
                game_id: game_id.clone(),
            },
        )
        .await
        .unwrap();
    cluster
        .node2
        .handle_request(
            &bob,
            ClientRequest::StartGame {
                game_id: game_id.clone(),
            },
        )
        .await
        .unwrap();
    drain(&mut a_rx);
    drain(&mut b_rx);

    // A move executed on node1 reaches bob's socket on node2.
    let game = cluster.node1.games.load(&game_id).await.unwrap();
    let white = game.seat(core_protocol::game::Color::White).player_id.clone();
    let mover_node = if white == alice {
        &cluster.node1
    } else {
        &cluster.node2
    };
    mover_node
        .games
        .apply_move(&game_id, &white, "e4")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let saw_move = |updates: &[ClientUpdate]| {
        updates
            .iter()
            .any(|update| matches!(update, ClientUpdate::Move { san, .. } if san == "e4"))
    };
    assert!(saw_move(&drain(&mut a_rx)), "move must reach alice's node");
    assert!(saw_move(&drain(&mut b_rx)), "move must reach bob's node");

    subscriber1.abort();
    subscriber2.abort();
}
