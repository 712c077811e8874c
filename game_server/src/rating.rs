// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Elo arithmetic. Pure; the finalization guard in [`crate::game`] is what
//! makes the application of these numbers exactly-once.

use core_protocol::dto::{RatingChangeDto, RatingChangesDto};
use core_protocol::game::{PROVISIONAL_GAMES, RATING_CEILING, RATING_FLOOR};

pub fn k_factor(rating: u16, games_played: u32) -> u32 {
    if games_played < PROVISIONAL_GAMES {
        40
    } else if rating >= 2400 {
        10
    } else if rating >= 2100 {
        16
    } else {
        32
    }
}

/// Expected score of `rating` against `opponent`.
pub fn expected_score(rating: u16, opponent: u16) -> f64 {
    1.0 / (1.0 + 10f64.powf((opponent as f64 - rating as f64) / 400.0))
}

/// Signed rating change for an actual score `s` in {0, 0.5, 1}, clamped to
/// the K-factor in magnitude.
pub fn rating_delta(rating: u16, opponent: u16, games_played: u32, s: f64) -> i16 {
    let k = k_factor(rating, games_played) as f64;
    let delta = (k * (s - expected_score(rating, opponent))).round();
    delta.clamp(-k, k) as i16
}

/// New rating after applying a delta, clamped to the legal band.
pub fn apply_delta(rating: u16, delta: i16) -> u16 {
    let next = rating as i32 + delta as i32;
    next.clamp(RATING_FLOOR as i32, RATING_CEILING as i32) as u16
}

fn change_for(rating: u16, opponent: u16, games_played: u32) -> RatingChangeDto {
    RatingChangeDto {
        on_win: rating_delta(rating, opponent, games_played, 1.0),
        on_loss: rating_delta(rating, opponent, games_played, 0.0),
        on_draw: rating_delta(rating, opponent, games_played, 0.5),
        provisional: games_played < PROVISIONAL_GAMES,
    }
}

/// Pre-game snapshot of every possible outcome, for display and for the
/// `ratingChanges` persistence field.
pub fn rating_changes(
    white: (u16, u32),
    black: (u16, u32),
) -> RatingChangesDto {
    RatingChangesDto {
        white: change_for(white.0, black.0, white.1),
        black: change_for(black.0, white.0, black.1),
    }
}
