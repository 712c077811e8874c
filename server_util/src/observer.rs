// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use actix::prelude::*;
use core_protocol::id::{ConnectionId, PlayerId};
use core_protocol::rpc::{ClientRequest, ClientUpdate};
use tokio::sync::mpsc::UnboundedSender;

/// Directed to the websocket future corresponding to one client connection.
/// The transport owns the receiving half and forwards into its socket.
pub type ClientAddr = UnboundedSender<ObserverUpdate>;

/// What the transport sends the core. The transport has already
/// authenticated `player_id`; the core never sees tokens.
#[derive(Message)]
#[rtype(result = "()")]
pub enum ObserverMessage {
    /// Client websocket (re)connected.
    Register {
        player_id: PlayerId,
        connection_id: ConnectionId,
        observer: ClientAddr,
    },
    /// Client websocket dropped.
    Unregister {
        player_id: PlayerId,
        connection_id: ConnectionId,
    },
    Request {
        player_id: PlayerId,
        request: ClientRequest,
    },
}

/// What the core sends back toward one socket.
#[derive(Message, Debug)]
#[rtype(result = "()")]
pub enum ObserverUpdate {
    Close,
    Send { message: ClientUpdate },
}
