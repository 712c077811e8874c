// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Node-local clock bookkeeping. One process-wide 1 Hz scan walks these
//! entries; there are no per-game timers. `timeLeftMs` here mirrors the
//! authoritative LiveGame value so the scan never touches the store.

use crate::live_game::LiveGame;
use core_protocol::dto::ClockDto;
use core_protocol::game::{Color, GameVariant};
use core_protocol::id::GameId;
use core_protocol::UnixTime;
use std::collections::HashMap;
use std::sync::Mutex;

/// Client time-up reports within this of zero are honored.
pub const TIMEOUT_TOLERANCE_MS: u64 = 100;

#[derive(Clone, Debug)]
pub struct ClockState {
    /// Reference instant deductions are measured from.
    pub last_move_time: UnixTime,
    pub current_turn: Color,
    /// False while the game is paused (participant disconnected).
    pub active: bool,
    pub time_left: ClockDto,
    pub variant: GameVariant,
}

impl ClockState {
    fn remaining_ms(&self, color: Color, now: UnixTime) -> u64 {
        let base = self.time_left.get(color);
        if color == self.current_turn && self.active {
            base.saturating_sub(now.saturating_sub(self.last_move_time))
        } else {
            base
        }
    }

    /// Both clocks with the running side's deduction applied.
    fn adjusted(&self, now: UnixTime) -> ClockDto {
        ClockDto {
            white_ms: self.remaining_ms(Color::White, now),
            black_ms: self.remaining_ms(Color::Black, now),
        }
    }
}

#[derive(Default)]
pub struct ClockRepo {
    clocks: Mutex<HashMap<GameId, ClockState>>,
}

impl ClockRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a game, or resumes it if it was paused. Rebuilding
    /// from LiveGame is conservative: the reference instant restarts at
    /// `now`, so no time is deducted for the gap.
    pub fn track(&self, game: &LiveGame, now: UnixTime) {
        let mut clocks = self.clocks.lock().unwrap();
        match clocks.get_mut(&game.game_id) {
            Some(state) => {
                if !state.active {
                    state.active = true;
                    state.last_move_time = now;
                }
            }
            None => {
                clocks.insert(
                    game.game_id.clone(),
                    ClockState {
                        last_move_time: now,
                        current_turn: game.turn,
                        active: true,
                        time_left: game.time_left,
                        variant: game.info.variant,
                    },
                );
            }
        }
    }

    pub fn remove(&self, game_id: &GameId) {
        self.clocks.lock().unwrap().remove(game_id);
    }

    /// Freezes deductions; time is never added back.
    pub fn pause(&self, game_id: &GameId) {
        if let Some(state) = self.clocks.lock().unwrap().get_mut(game_id) {
            state.active = false;
        }
    }

    pub fn resume(&self, game_id: &GameId, now: UnixTime) {
        if let Some(state) = self.clocks.lock().unwrap().get_mut(game_id) {
            if !state.active {
                state.active = true;
                state.last_move_time = now;
            }
        }
    }

    /// GameCore already updated LiveGame's `timeLeftMs`; this moves the
    /// reference instant and flips the running side.
    pub fn on_move(
        &self,
        game_id: &GameId,
        now: UnixTime,
        new_turn: Color,
        time_left: ClockDto,
    ) {
        if let Some(state) = self.clocks.lock().unwrap().get_mut(game_id) {
            state.last_move_time = now;
            state.current_turn = new_turn;
            state.time_left = time_left;
            state.active = true;
        }
    }

    pub fn remaining_ms(&self, game_id: &GameId, color: Color, now: UnixTime) -> Option<u64> {
        self.clocks
            .lock()
            .unwrap()
            .get(game_id)
            .map(|state| state.remaining_ms(color, now))
    }

    /// Authoritative snapshot for time-sync replies.
    pub fn sync(&self, game_id: &GameId, now: UnixTime) -> Option<(ClockDto, Color)> {
        self.clocks
            .lock()
            .unwrap()
            .get(game_id)
            .map(|state| (state.adjusted(now), state.current_turn))
    }

    /// Active games whose running side has hit zero. Entries are removed as
    /// they are returned, so each flag fall is reported once per node.
    pub fn take_expired(&self, now: UnixTime) -> Vec<(GameId, Color)> {
        let mut clocks = self.clocks.lock().unwrap();
        let expired: Vec<GameId> = clocks
            .iter()
            .filter(|(_, state)| state.active && state.remaining_ms(state.current_turn, now) == 0)
            .map(|(game_id, _)| game_id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|game_id| {
                clocks
                    .remove(&game_id)
                    .map(|state| (game_id, state.current_turn))
            })
            .collect()
    }

    /// Per-scan time broadcasts are worth the traffic for bullet only.
    pub fn bullet_snapshots(&self, now: UnixTime) -> Vec<(GameId, ClockDto, Color)> {
        self.clocks
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, state)| state.active && state.variant == GameVariant::Bullet)
            .map(|(game_id, state)| (game_id.clone(), state.adjusted(now), state.current_turn))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clocks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.lock().unwrap().is_empty()
    }
}
