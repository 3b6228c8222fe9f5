// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! A chassis management agent.
//!
//! The agent answers IPMI requests from sled management controllers on the
//! IPMB, reached through a MUX daemon, and supervises the presence and health
//! of remote BMCs.
//!
//! The IPMB side is a two-thread pipeline. The [`receiver`] thread frames raw
//! bytes from the MUX into [`IpmiMessage`]s and queues them; the [`worker`]
//! thread pulls them off the queue, runs each through the [`dispatcher`], the
//! resulting [`command`], and the [`patcher`], and writes the response back.
//!
//! The BMC side is built on the [`watcher`], a small periodic-task scheduler.
//! Each [`bmc::Bmc`] owns one, and uses it to poll its controller.

pub mod bmc;
pub mod client;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod framer;
pub mod patcher;
pub mod platform;
pub mod queue;
pub mod receiver;
pub mod status;
pub mod watcher;
pub mod worker;

mod agent;
#[cfg(test)]
mod test_utils;

pub use agent::IpmbAgent;
pub use config::Config;
pub use config::ConfigBuilder;
pub use ipmb_messages::IpmiMessage;

#[usdt::provider(provider = "chassis_agent")]
mod probes {
    fn frame__received(dest_addr: u8, n_bytes: u64) {}
    fn frame__sent(dest_addr: u8, n_bytes: u64) {}
    fn bad__frame(n_bytes: u64, reason: String) {}
    fn bmc__transition(bmc: String, event: String, state: String) {}
}

/// An error related to running the chassis agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("IPMB message error")]
    Message(#[from] ipmb_messages::Error),

    #[error("Not connected to the MUX")]
    NotConnected,

    #[error("The MUX closed the connection")]
    Disconnected,

    #[error("MUX registration failed: {0}")]
    Registration(String),

    #[error("Failed to spawn thread '{name}'")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Register the agent's DTrace probes, logging on failure.
pub(crate) fn register_probes(log: &slog::Logger) {
    if let Err(e) = usdt::register_probes() {
        slog::warn!(log, "failed to register DTrace probes"; "reason" => ?e);
    }
}
