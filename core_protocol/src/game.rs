// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Standard chess starting position.
pub const STANDARD_START_FEN: &str =
    "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// Players with fewer completed rated games use the provisional K-factor.
pub const PROVISIONAL_GAMES: u32 = 30;
/// Ratings never drop below this.
pub const RATING_FLOOR: u16 = 100;
pub const RATING_CEILING: u16 = 4000;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    White,
    Black,
}

impl Color {
    pub fn opposite(self) -> Self {
        match self {
            Self::White => Self::Black,
            Self::Black => Self::White,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::White => "white",
            Self::Black => "black",
        }
    }
}

impl Display for Color {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Color {
    type Err = InvalidColor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "white" => Ok(Self::White),
            "black" => Ok(Self::Black),
            _ => Err(InvalidColor),
        }
    }
}

#[derive(Debug)]
pub struct InvalidColor;

/// Which rating bucket a game counts toward.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GameVariant {
    Rapid,
    Blitz,
    Bullet,
}

impl GameVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rapid => "RAPID",
            Self::Blitz => "BLITZ",
            Self::Bullet => "BULLET",
        }
    }
}

impl Display for GameVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base time and per-move increment, both in seconds.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TimeControl {
    pub time: u32,
    pub increment: u32,
}

impl TimeControl {
    pub fn base_ms(&self) -> u64 {
        self.time as u64 * 1000
    }

    pub fn increment_ms(&self) -> u64 {
        self.increment as u64 * 1000
    }
}

/// A specific time control within a variant, e.g. `RAPID_10_0`.
///
/// The key doubles as the matchmaking-queue discriminator, so two players
/// only ever pair within an identical game type.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct GameType {
    pub variant: GameVariant,
    pub time_control: TimeControl,
}

impl GameType {
    /// Queue key segment, minutes-based: `RAPID_10_0` is 600 s base, 0 s increment.
    pub fn key(&self) -> String {
        format!(
            "{}_{}_{}",
            self.variant,
            self.time_control.time / 60,
            self.time_control.increment
        )
    }
}

impl Display for GameType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Final score from white's perspective.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Score {
    #[serde(rename = "1-0")]
    WhiteWin,
    #[serde(rename = "0-1")]
    BlackWin,
    #[serde(rename = "1/2-1/2")]
    Draw,
}

impl Score {
    pub fn from_winner(winner: Option<Color>) -> Self {
        match winner {
            Some(Color::White) => Self::WhiteWin,
            Some(Color::Black) => Self::BlackWin,
            None => Self::Draw,
        }
    }

    pub fn winner(self) -> Option<Color> {
        match self {
            Self::WhiteWin => Some(Color::White),
            Self::BlackWin => Some(Color::Black),
            Self::Draw => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WhiteWin => "1-0",
            Self::BlackWin => "0-1",
            Self::Draw => "1/2-1/2",
        }
    }

    /// Points earned by the given color: 1, ½ or 0.
    pub fn points_for(self, color: Color) -> f64 {
        match self.winner() {
            Some(w) if w == color => 1.0,
            Some(_) => 0.0,
            None => 0.5,
        }
    }
}

impl Display for Score {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct InvalidScore;

impl FromStr for Score {
    type Err = InvalidScore;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1-0" => Ok(Self::WhiteWin),
            "0-1" => Ok(Self::BlackWin),
            "1/2-1/2" => Ok(Self::Draw),
            _ => Err(InvalidScore),
        }
    }
}

/// Why a game ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Checkmate,
    Resignation,
    Timeout,
    Stalemate,
    Agreement,
    Threefold,
    InsufficientMaterial,
    FiftyMove,
}

impl EndReason {
    /// Whether the reason implies a decisive result (a winner exists).
    pub fn decisive(self) -> bool {
        matches!(self, Self::Checkmate | Self::Resignation | Self::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Checkmate => "checkmate",
            Self::Resignation => "resignation",
            Self::Timeout => "timeout",
            Self::Stalemate => "stalemate",
            Self::Agreement => "agreement",
            Self::Threefold => "threefold",
            Self::InsufficientMaterial => "insufficient_material",
            Self::FiftyMove => "fifty_move",
        }
    }
}

#[derive(Debug)]
pub struct InvalidEndReason;

impl FromStr for EndReason {
    type Err = InvalidEndReason;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checkmate" => Ok(Self::Checkmate),
            "resignation" => Ok(Self::Resignation),
            "timeout" => Ok(Self::Timeout),
            "stalemate" => Ok(Self::Stalemate),
            "agreement" => Ok(Self::Agreement),
            "threefold" => Ok(Self::Threefold),
            "insufficient_material" => Ok(Self::InsufficientMaterial),
            "fifty_move" => Ok(Self::FiftyMove),
            _ => Err(InvalidEndReason),
        }
    }
}

impl Display for EndReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-variant rating triple stored on a profile.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Ratings {
    pub rapid: u16,
    pub blitz: u16,
    pub bullet: u16,
}

impl Ratings {
    pub fn get(&self, variant: GameVariant) -> u16 {
        match variant {
            GameVariant::Rapid => self.rapid,
            GameVariant::Blitz => self.blitz,
            GameVariant::Bullet => self.bullet,
        }
    }

    pub fn set(&mut self, variant: GameVariant, rating: u16) {
        match variant {
            GameVariant::Rapid => self.rapid = rating,
            GameVariant::Blitz => self.blitz = rating,
            GameVariant::Bullet => self.bullet = rating,
        }
    }
}

impl Default for Ratings {
    fn default() -> Self {
        Self {
            rapid: 1200,
            blitz: 1200,
            bullet: 1200,
        }
    }
}
