// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Batched, prioritized application of bus events to the durable store.
//! Consumes only envelopes this node originated (the bus replicates for
//! fan-out, not for write fan-in) and deduplicates against redelivery.

use core_protocol::dto::MoveDto;
use core_protocol::event::{EventEnvelope, GameEvent};
use core_protocol::game::{EndReason, Score};
use log::{error, info, warn};
use serde_json::json;
use server_util::database::{DbError, DurableStore};
use server_util::database_schema::{GameItem, GameResultItem, GameStatus};
use server_util::event_bus::DedupWindow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const HIGH_BATCH_MAX: usize = 10;
const HIGH_DEADLINE: Duration = Duration::from_secs(1);
const MEDIUM_BATCH_MAX: usize = 100;
const MEDIUM_DEADLINE: Duration = Duration::from_secs(5);
const LOW_DEADLINE: Duration = Duration::from_secs(10);

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_BACKOFF: Duration = Duration::from_millis(250);
/// How many recently applied dedup keys to remember.
const DEDUP_WINDOW: usize = 4096;

/// Clock thresholds that escalate move/time events.
const CLOCK_HIGH_MS: u64 = 30_000;
const TIME_UPDATE_HIGH_MS: u64 = 10_000;
const TIME_UPDATE_MEDIUM_MS: u64 = 60_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    fn batch_max(self) -> usize {
        match self {
            Self::High => HIGH_BATCH_MAX,
            Self::Medium => MEDIUM_BATCH_MAX,
            Self::Low => usize::MAX,
        }
    }

    fn deadline(self) -> Duration {
        match self {
            Self::High => HIGH_DEADLINE,
            Self::Medium => MEDIUM_DEADLINE,
            Self::Low => LOW_DEADLINE,
        }
    }
}

/// Which batch an event lands in, or [`None`] when it has no durable write.
/// The publisher consults this too, so backpressure can never shed a
/// HIGH-priority envelope in place of a LOW one.
pub(crate) fn classify(event: &GameEvent) -> Option<Priority> {
    match event {
        GameEvent::GameEnded { .. }
        | GameEvent::PlayerResigned { .. }
        | GameEvent::DrawAccepted { .. }
        | GameEvent::RatingUpdated { .. } => Some(Priority::High),
        GameEvent::MoveMade {
            terminal,
            time_left,
            ..
        } => {
            if *terminal || time_left.white_ms.min(time_left.black_ms) < CLOCK_HIGH_MS {
                Some(Priority::High)
            } else {
                Some(Priority::Medium)
            }
        }
        GameEvent::GameStarted { .. } => Some(Priority::Medium),
        GameEvent::TimeUpdate {
            white_ms, black_ms, ..
        } => {
            let lowest = (*white_ms).min(*black_ms);
            if lowest < TIME_UPDATE_HIGH_MS {
                Some(Priority::High)
            } else if lowest < TIME_UPDATE_MEDIUM_MS {
                Some(Priority::Medium)
            } else {
                Some(Priority::Low)
            }
        }
        // Socket-visible or bookkeeping-only events; nothing durable.
        GameEvent::DrawOffered { .. }
        | GameEvent::DrawDeclined { .. }
        | GameEvent::RematchOffered { .. }
        | GameEvent::RematchAccepted { .. }
        | GameEvent::RematchDeclined { .. }
        | GameEvent::TimeUp { .. }
        | GameEvent::PlayerConnected { .. }
        | GameEvent::PlayerDisconnected { .. }
        | GameEvent::PlayerReconnected { .. }
        | GameEvent::MatchFound { .. } => None,
    }
}

struct Batch {
    envelopes: Vec<EventEnvelope>,
    deadline: Option<Instant>,
}

impl Batch {
    fn new() -> Self {
        Self {
            envelopes: Vec::new(),
            deadline: None,
        }
    }
}

pub struct PersistencePipeline {
    durable: Arc<dyn DurableStore>,
    rx: mpsc::Receiver<EventEnvelope>,
    batches: [Batch; 3],
    dedup: DedupWindow,
    /// Non-zero while the store is rejecting writes; sheds LOW.
    consecutive_failures: u32,
}

impl PersistencePipeline {
    pub fn new(durable: Arc<dyn DurableStore>, rx: mpsc::Receiver<EventEnvelope>) -> Self {
        Self {
            durable,
            rx,
            batches: [Batch::new(), Batch::new(), Batch::new()],
            dedup: DedupWindow::new(DEDUP_WINDOW),
            consecutive_failures: 0,
        }
    }

    pub fn spawn(
        durable: Arc<dyn DurableStore>,
        rx: mpsc::Receiver<EventEnvelope>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Self::new(durable, rx).run())
    }

    /// Runs until the publisher side closes, then flushes what's left.
    pub async fn run(mut self) {
        loop {
            let next_deadline = self
                .batches
                .iter()
                .filter_map(|batch| batch.deadline)
                .min();

            let received = match next_deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        self.flush_due(Instant::now()).await;
                        continue;
                    }
                },
                None => self.rx.recv().await,
            };

            match received {
                Some(envelope) => {
                    self.enqueue(envelope).await;
                    self.flush_due(Instant::now()).await;
                }
                None => {
                    // Shutdown: drain every batch before exiting.
                    for priority in Priority::ALL {
                        self.flush(priority).await;
                    }
                    info!("persistence pipeline drained");
                    return;
                }
            }
        }
    }

    async fn enqueue(&mut self, envelope: EventEnvelope) {
        let priority = match classify(&envelope.event) {
            Some(priority) => priority,
            None => return,
        };
        if !self.dedup.insert(&envelope) {
            return;
        }
        if priority == Priority::Low && self.consecutive_failures > 0 {
            // Backpressure: the store is struggling, analytics lose.
            return;
        }

        let batch = &mut self.batches[priority as usize];
        if priority == Priority::Low {
            // Coalesce: keep only the newest LOW event per game and type.
            let key = (
                envelope.game_id().map(|id| id.to_string()),
                envelope.event.event_type(),
            );
            batch.envelopes.retain(|existing| {
                (
                    existing.game_id().map(|id| id.to_string()),
                    existing.event.event_type(),
                ) != key
            });
        }
        batch.envelopes.push(envelope);
        if batch.deadline.is_none() {
            batch.deadline = Some(Instant::now() + priority.deadline());
        }
        if batch.envelopes.len() >= priority.batch_max() {
            self.flush(priority).await;
        }
    }

    async fn flush_due(&mut self, now: Instant) {
        for priority in Priority::ALL {
            if matches!(self.batches[priority as usize].deadline, Some(deadline) if deadline <= now)
            {
                self.flush(priority).await;
            }
        }
    }

    async fn flush(&mut self, priority: Priority) {
        let batch = &mut self.batches[priority as usize];
        if batch.envelopes.is_empty() {
            batch.deadline = None;
            return;
        }
        let mut pending = std::mem::take(&mut batch.envelopes);
        batch.deadline = None;

        for attempt in 0..=MAX_RETRIES {
            let mut failed = Vec::new();
            for envelope in pending {
                if let Err(e) = self.apply(&envelope).await {
                    warn!(
                        "durable write failed ({}, attempt {}): {}",
                        envelope.event.event_type(),
                        attempt + 1,
                        e
                    );
                    failed.push(envelope);
                }
            }
            if failed.is_empty() {
                self.consecutive_failures = 0;
                return;
            }
            pending = failed;
            self.consecutive_failures += 1;
            if attempt < MAX_RETRIES {
                tokio::time::sleep(RETRY_BASE_BACKOFF * 2u32.pow(attempt)).await;
            }
        }

        // Game-ending events are recoverable: the startup reconciliation
        // rescan re-queues them from the live store's `gameOver` records.
        for envelope in pending {
            error!(
                "dead-letter: {}",
                json!({
                    "eventType": envelope.event.event_type(),
                    "gameId": envelope.game_id().map(|id| id.to_string()),
                    "seq": envelope.seq,
                    "timestamp": envelope.timestamp,
                })
            );
        }
    }

    async fn apply(&self, envelope: &EventEnvelope) -> Result<(), DbError> {
        match &envelope.event {
            GameEvent::GameStarted {
                game_id,
                players,
                info,
                initial_fen,
                started_at,
                rating_changes,
                rematch_of,
            } => {
                let skeleton = GameItem {
                    game_id: game_id.clone(),
                    players: players.clone(),
                    variant: info.variant,
                    time_control: info.time_control,
                    initial_fen: initial_fen.clone(),
                    moves: Vec::new(),
                    pgn: String::new(),
                    fen_history: Vec::new(),
                    game_status: GameStatus::InProgress,
                    started_at: *started_at,
                    ended_at: None,
                    result: None,
                    rating_changes: Some(*rating_changes),
                    rematch_of: rematch_of.clone(),
                    rematch_game_id: None,
                };
                // False just means the direct write in GameCore won.
                self.durable.create_game(skeleton).await.map(|_| ())
            }
            GameEvent::MoveMade {
                game_id,
                san,
                from,
                to,
                fen,
                pgn,
                move_number,
                ..
            } => {
                let mv = MoveDto {
                    san: san.clone(),
                    from: from.clone(),
                    to: to.clone(),
                    timestamp: envelope.timestamp,
                };
                let fen_snapshot = (move_number % 10 == 0).then_some(fen.as_str());
                self.durable
                    .append_move(game_id, &mv, pgn, fen_snapshot)
                    .await
            }
            GameEvent::GameEnded {
                game_id,
                winner,
                reason,
                score,
                final_pgn,
                ..
            } => {
                // The event's reason is authoritative.
                let result = GameResultItem {
                    winner: *winner,
                    reason: *reason,
                    score: *score,
                };
                self.durable
                    .finalize_game(game_id, &result, Some(final_pgn), envelope.timestamp)
                    .await
            }
            GameEvent::PlayerResigned {
                game_id, player, ..
            } => {
                let winner = player.opposite();
                let result = GameResultItem {
                    winner: Some(winner),
                    reason: EndReason::Resignation,
                    score: Score::from_winner(Some(winner)),
                };
                self.durable
                    .finalize_game(game_id, &result, None, envelope.timestamp)
                    .await
            }
            GameEvent::DrawAccepted { game_id, .. } => {
                let result = GameResultItem {
                    winner: None,
                    reason: EndReason::Agreement,
                    score: Score::Draw,
                };
                self.durable
                    .finalize_game(game_id, &result, None, envelope.timestamp)
                    .await
            }
            GameEvent::RatingUpdated {
                game_id,
                color,
                new_rating,
                ..
            } => {
                self.durable
                    .set_post_rating(game_id, *color, *new_rating)
                    .await
            }
            // Classified for pacing but nothing durable to write.
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::pipeline::{classify, PersistencePipeline, Priority};
    use core_protocol::dto::{ClockDto, GamePlayerDto, RatingChangeDto, RatingChangesDto};
    use core_protocol::event::{EventEnvelope, GameEvent};
    use core_protocol::game::{
        Color, EndReason, GameType, GameVariant, Score, TimeControl, STANDARD_START_FEN,
    };
    use core_protocol::id::{GameId, NodeId, PlayerId};
    use server_util::database::{DurableStore, MemoryDurableStore};
    use server_util::database_schema::GameStatus;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn move_made(white_ms: u64, black_ms: u64, terminal: bool) -> GameEvent {
        GameEvent::MoveMade {
            game_id: GameId::new("g1"),
            player_id: PlayerId::new("alice"),
            player: Color::White,
            san: "e4".to_owned(),
            from: "e2".to_owned(),
            to: "e4".to_owned(),
            fen: "fen".to_owned(),
            pgn: "1. e4".to_owned(),
            move_number: 1,
            time_left: ClockDto { white_ms, black_ms },
            terminal,
        }
    }

    #[test]
    fn move_priority_depends_on_clock_and_terminality() {
        assert_eq!(
            classify(&move_made(600_000, 600_000, false)),
            Some(Priority::Medium)
        );
        assert_eq!(
            classify(&move_made(600_000, 600_000, true)),
            Some(Priority::High)
        );
        assert_eq!(
            classify(&move_made(29_000, 600_000, false)),
            Some(Priority::High)
        );
    }

    #[test]
    fn time_update_tiers() {
        let update = |white_ms| GameEvent::TimeUpdate {
            game_id: GameId::new("g1"),
            white_ms,
            black_ms: 600_000,
            current_turn: Color::White,
        };
        assert_eq!(classify(&update(9_000)), Some(Priority::High));
        assert_eq!(classify(&update(45_000)), Some(Priority::Medium));
        assert_eq!(classify(&update(300_000)), Some(Priority::Low));
    }

    #[test]
    fn chatter_is_not_persisted() {
        let event = GameEvent::DrawOffered {
            game_id: GameId::new("g1"),
            by: Color::White,
        };
        assert_eq!(classify(&event), None);
    }

    fn envelope(seq: u64, event: GameEvent) -> EventEnvelope {
        EventEnvelope {
            origin_node_id: NodeId::generate(),
            seq,
            timestamp: 1_000 + seq,
            channel: event.topic(),
            event,
        }
    }

    async fn seeded_game(durable: &Arc<MemoryDurableStore>) -> GameId {
        let game_id = GameId::new("g1");
        let change = RatingChangeDto {
            on_win: 8,
            on_loss: -8,
            on_draw: 0,
            provisional: false,
        };
        let game = crate::live_game::LiveGame::new(
            game_id.clone(),
            GamePlayerDto {
                player_id: PlayerId::new("alice"),
                color: Color::White,
                pre_rating: 1200,
                post_rating: None,
            },
            GamePlayerDto {
                player_id: PlayerId::new("bob"),
                color: Color::Black,
                pre_rating: 1200,
                post_rating: None,
            },
            GameType {
                variant: GameVariant::Bullet,
                time_control: TimeControl {
                    time: 60,
                    increment: 0,
                },
            },
            STANDARD_START_FEN.to_owned(),
            RatingChangesDto {
                white: change,
                black: change,
            },
            1_000,
        );
        durable
            .create_game(crate::game::skeleton(&game, None))
            .await
            .unwrap();
        game_id
    }

    #[tokio::test]
    async fn drains_writes_on_shutdown_and_dedups_redelivery() {
        let durable = Arc::new(MemoryDurableStore::new());
        let game_id = seeded_game(&durable).await;
        let (tx, rx) = mpsc::channel(64);
        let handle = PersistencePipeline::spawn(durable.clone() as Arc<dyn DurableStore>, rx);

        let mv = envelope(
            1,
            GameEvent::MoveMade {
                game_id: game_id.clone(),
                player_id: PlayerId::new("alice"),
                player: Color::White,
                san: "e4".to_owned(),
                from: "e2".to_owned(),
                to: "e4".to_owned(),
                fen: "fen-after-e4".to_owned(),
                pgn: "1. e4".to_owned(),
                move_number: 1,
                time_left: ClockDto {
                    white_ms: 10_000,
                    black_ms: 60_000,
                },
                terminal: false,
            },
        );
        tx.send(mv.clone()).await.unwrap();
        // At-least-once redelivery of the same envelope.
        tx.send(mv).await.unwrap();
        tx.send(envelope(
            2,
            GameEvent::PlayerResigned {
                game_id: game_id.clone(),
                player_id: PlayerId::new("bob"),
                player: Color::Black,
            },
        ))
        .await
        .unwrap();

        drop(tx);
        handle.await.unwrap();

        let game = durable.get_game(&game_id).await.unwrap().unwrap();
        assert_eq!(game.moves.len(), 1, "duplicate move must not re-append");
        assert_eq!(game.pgn, "1. e4");
        assert_eq!(game.game_status, GameStatus::Completed);
        let result = game.result.unwrap();
        assert_eq!(result.winner, Some(Color::White));
        assert_eq!(result.reason, EndReason::Resignation);
        assert_eq!(result.score, Score::WhiteWin);
    }
}
