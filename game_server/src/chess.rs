// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::game::Color;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("illegal move: {0}")]
    IllegalMove(String),
    #[error("malformed fen: {0}")]
    MalformedFen(String),
}

/// One move as reported by the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineMove {
    pub san: String,
    pub from: String,
    pub to: String,
    pub piece: String,
    pub captured: Option<String>,
    pub promotion: Option<String>,
}

/// Result of applying one legal move.
#[derive(Clone, Debug)]
pub struct MoveOutcome {
    pub mv: EngineMove,
    pub fen: String,
    pub pgn: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TerminalReason {
    Checkmate,
    Stalemate,
    Threefold,
    InsufficientMaterial,
    FiftyMove,
}

/// Classification of a position; end-of-game is data, not an error.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Terminal {
    pub over: bool,
    pub reason: Option<TerminalReason>,
    pub in_check: bool,
}

impl Terminal {
    pub const ONGOING: Self = Self {
        over: false,
        reason: None,
        in_check: false,
    };
}

/// The move-legality library the core consumes. Pure and deterministic; the
/// actual rules implementation is supplied by the deployment binary.
pub trait ChessEngine: 'static + Send + Sync {
    type State: Send;

    fn load_fen(&self, fen: &str) -> Result<Self::State, EngineError>;
    fn apply_move(&self, state: &Self::State, san: &str) -> Result<MoveOutcome, EngineError>;
    fn turn(&self, state: &Self::State) -> Color;
    fn legal_moves(&self, state: &Self::State) -> Vec<String>;
    fn terminal(&self, state: &Self::State) -> Terminal;

    /// Folds a recorded move list back into a position.
    fn replay<'a>(
        &self,
        initial_fen: &str,
        moves: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self::State, EngineError> {
        let mut state = self.load_fen(initial_fen)?;
        for san in moves {
            let outcome = self.apply_move(&state, san)?;
            state = self.load_fen(&outcome.fen)?;
        }
        Ok(state)
    }
}

/// Deterministic engine for tests and development.
///
/// It accepts any SAN except the literal `illegal`, alternates turns by ply
/// count, and classifies terminal positions from notation alone: a SAN
/// ending in `#` is checkmate, the literal `stalemate` is stalemate. The
/// "FEN" it produces is `start` followed by the ply list, which is enough to
/// make replays and round trips exact.
pub struct ScriptedEngine;

#[derive(Clone, Debug)]
pub struct ScriptedState {
    initial_turn: Color,
    sans: Vec<String>,
}

impl ScriptedEngine {
    fn encode_fen(state: &ScriptedState) -> String {
        if state.sans.is_empty() {
            "start".to_owned()
        } else {
            format!("start|{}", state.sans.join("|"))
        }
    }

    fn pgn(sans: &[String]) -> String {
        let mut pgn = String::new();
        for (ply, san) in sans.iter().enumerate() {
            if ply % 2 == 0 {
                if ply > 0 {
                    pgn.push(' ');
                }
                pgn.push_str(&format!("{}. ", ply / 2 + 1));
            } else {
                pgn.push(' ');
            }
            pgn.push_str(san);
        }
        pgn
    }
}

impl ChessEngine for ScriptedEngine {
    type State = ScriptedState;

    fn load_fen(&self, fen: &str) -> Result<Self::State, EngineError> {
        let mut parts = fen.split('|');
        let head = parts.next().unwrap_or_default();
        // Accept the scripted encoding or a real FEN string (side to move is
        // the second whitespace field).
        let initial_turn = if head == "start" {
            Color::White
        } else {
            match head.split_whitespace().nth(1) {
                Some("w") | None => Color::White,
                Some("b") => Color::Black,
                Some(_) => return Err(EngineError::MalformedFen(fen.to_owned())),
            }
        };
        let sans = if head == "start" {
            parts.map(str::to_owned).collect()
        } else {
            Vec::new()
        };
        Ok(ScriptedState { initial_turn, sans })
    }

    fn apply_move(&self, state: &Self::State, san: &str) -> Result<MoveOutcome, EngineError> {
        if san == "illegal" || san.is_empty() {
            return Err(EngineError::IllegalMove(san.to_owned()));
        }
        if self.terminal(state).over {
            return Err(EngineError::IllegalMove(san.to_owned()));
        }
        let mut next = state.clone();
        next.sans.push(san.to_owned());
        let ply = state.sans.len();
        Ok(MoveOutcome {
            mv: EngineMove {
                san: san.to_owned(),
                from: format!("sq{}", ply),
                to: format!("sq{}", ply + 1),
                piece: "p".to_owned(),
                captured: None,
                promotion: None,
            },
            fen: Self::encode_fen(&next),
            pgn: Self::pgn(&next.sans),
        })
    }

    fn turn(&self, state: &Self::State) -> Color {
        if state.sans.len() % 2 == 0 {
            state.initial_turn
        } else {
            state.initial_turn.opposite()
        }
    }

    fn legal_moves(&self, state: &Self::State) -> Vec<String> {
        if self.terminal(state).over {
            Vec::new()
        } else {
            vec!["e4".to_owned(), "d4".to_owned(), "Nf3".to_owned()]
        }
    }

    fn terminal(&self, state: &Self::State) -> Terminal {
        match state.sans.last().map(String::as_str) {
            Some(last) if last.ends_with('#') => Terminal {
                over: true,
                reason: Some(TerminalReason::Checkmate),
                in_check: true,
            },
            Some("stalemate") => Terminal {
                over: true,
                reason: Some(TerminalReason::Stalemate),
                in_check: false,
            },
            Some("threefold") => Terminal {
                over: true,
                reason: Some(TerminalReason::Threefold),
                in_check: false,
            },
            Some(last) if last.ends_with('+') => Terminal {
                over: false,
                reason: None,
                in_check: true,
            },
            _ => Terminal::ONGOING,
        }
    }
}
