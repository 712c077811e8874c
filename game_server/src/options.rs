// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use structopt::StructOpt;

/// Node configuration, sourced from the environment (the core has no
/// persistent CLI surface; flags exist for development convenience).
#[derive(Debug, StructOpt)]
pub struct Options {
    /// Live store and event bus endpoint.
    #[structopt(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,
    /// Skip all durable-store writes (local development).
    #[structopt(long, env = "DATABASE_READ_ONLY")]
    pub database_read_only: bool,
}
