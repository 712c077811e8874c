// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::chess::EngineError;
use server_util::database::DbError;
use server_util::event_bus::BusError;
use server_util::live_store::StoreError;
use thiserror::Error;

/// The error surface of the core. Per-player contract errors travel back on
/// the originating socket only; infrastructure errors are logged and, where
/// the caller can retry, surfaced as `Internal`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("not your turn")]
    NotYourTurn,
    #[error("illegal move: {0}")]
    IllegalMove(String),
    #[error("game already finalized")]
    Finalized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("live store unavailable")]
    StoreUnavailable,
    #[error("event bus unavailable")]
    BusUnavailable,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for CoreError {
    fn from(_: StoreError) -> Self {
        Self::StoreUnavailable
    }
}

impl From<BusError> for CoreError {
    fn from(_: BusError) -> Self {
        Self::BusUnavailable
    }
}

impl From<DbError> for CoreError {
    fn from(e: DbError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<EngineError> for CoreError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::IllegalMove(san) => Self::IllegalMove(san),
            EngineError::MalformedFen(fen) => Self::Internal(format!("malformed fen: {}", fen)),
        }
    }
}
