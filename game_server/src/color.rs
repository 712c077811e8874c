// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Color assignment for a fresh pairing. Slightly favors the lower-rated
//! player and corrects same-color streaks, using each player's recent
//! completed games (head = most recent).

use core_protocol::game::Color;
use rand::Rng;

const STREAK_MIN: usize = 2;
const RATING_BIAS_THRESHOLD: u16 = 100;
const RATING_BIAS_MAX: f64 = 0.1;

/// Length of the same-color run at the head of a history.
fn head_streak(history: &[Color], color: Color) -> usize {
    history.iter().take_while(|c| **c == color).count()
}

/// Fraction of games played as white, if any games exist.
fn white_fraction(history: &[Color]) -> Option<f64> {
    if history.is_empty() {
        return None;
    }
    let whites = history.iter().filter(|c| **c == Color::White).count();
    Some(whites as f64 / history.len() as f64)
}

/// Probability that player 1 receives white, in `[0.1, 0.9]`.
pub fn white_probability(
    rating1: u16,
    rating2: u16,
    history1: &[Color],
    history2: &[Color],
) -> f64 {
    let mut p: f64 = 0.5;

    // Lower-rated player leans toward white.
    let diff = rating1.abs_diff(rating2);
    if diff > RATING_BIAS_THRESHOLD {
        let shift = (diff as f64 / 2000.0).min(RATING_BIAS_MAX);
        if rating1 < rating2 {
            p += shift;
        } else {
            p -= shift;
        }
    }

    if head_streak(history1, Color::White) >= STREAK_MIN {
        p -= 0.3;
    }
    if head_streak(history1, Color::Black) >= STREAK_MIN {
        p += 0.3;
    }
    if head_streak(history2, Color::White) >= STREAK_MIN {
        p += 0.2;
    }
    if head_streak(history2, Color::Black) >= STREAK_MIN {
        p -= 0.2;
    }

    if let Some(fraction) = white_fraction(history1) {
        if fraction > 0.7 {
            p -= 0.2;
        } else if fraction < 0.3 {
            p += 0.2;
        }
    }

    p.clamp(0.1, 0.9)
}

/// Draws the assignment: true iff player 1 gets white.
pub fn assign_white<R: Rng>(
    rng: &mut R,
    rating1: u16,
    rating2: u16,
    history1: &[Color],
    history2: &[Color],
) -> bool {
    let p = white_probability(rating1, rating2, history1, history2);
    rng.gen::<f64>() < p
}
