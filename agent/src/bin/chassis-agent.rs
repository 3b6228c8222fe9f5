// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use anyhow::Context;
use chassis_agent::bmc::BmcManager;
use chassis_agent::bmc::ConnectionData;
use chassis_agent::bmc::TcpProbe;
use chassis_agent::bmc::Transition;
use chassis_agent::config::default_mux_addr;
use chassis_agent::platform::default_device_id;
use chassis_agent::platform::StaticPlatform;
use chassis_agent::status::StatusManager;
use chassis_agent::ConfigBuilder;
use chassis_agent::IpmbAgent;
use clap::Parser;
use ipmb_messages::SledPresence;
use slog::info;
use slog::o;
use slog::Drain;
use slog::Level;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;

fn parse_log_level(s: &str) -> Result<Level, String> {
    s.parse().map_err(|_| String::from("invalid log level"))
}

fn parse_mac(s: &str) -> Result<[u8; 6], String> {
    let octets = s
        .split(':')
        .map(|o| u8::from_str_radix(o, 16))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;
    octets
        .try_into()
        .map_err(|_| String::from("expected six colon-separated octets"))
}

/// Run the chassis management agent.
///
/// The agent registers with the IPMB MUX as a responder and answers IPMI
/// requests from sled controllers, while supervising a set of BMCs.
#[derive(Parser)]
#[command(version, about, long_about)]
struct Args {
    /// The address of the MUX daemon.
    #[arg(short, long, default_value_t = default_mux_addr())]
    mux: SocketAddr,

    /// The comma-separated list of BMCs to supervise, as `ip:port`.
    #[arg(short, long, use_value_delimiter = true)]
    bmc: Vec<SocketAddr>,

    /// The interval on which BMCs are polled, in milliseconds.
    #[arg(
        long,
        default_value_t = 10_000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    bmc_interval: u64,

    /// The interval on which health is logged, in seconds.
    #[arg(
        long,
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    status_interval: u64,

    /// The comma-separated indices of the sleds reported as present.
    #[arg(short, long, use_value_delimiter = true)]
    sleds: Vec<u8>,

    /// The management IPv4 address reported in LAN configuration.
    #[arg(long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    ip: Ipv4Addr,

    /// The management MAC address reported in LAN configuration.
    #[arg(long, value_parser = parse_mac, default_value = "00:00:00:00:00:00")]
    mac: [u8; 6],

    /// The log-level.
    #[arg(
        short,
        long,
        default_value_t = Level::Info,
        value_parser = parse_log_level
    )]
    log_level: Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, args.log_level).fuse();
    let log = slog::Logger::root(drain, o!());

    let config = ConfigBuilder::new()
        .mux_addr(args.mux)
        .bmc_update_interval(Duration::from_millis(args.bmc_interval))
        .build()
        .context("invalid configuration")?;

    let platform = Arc::new(StaticPlatform::new(default_device_id(), args.ip, args.mac));
    let presence = SledPresence::from_indices(&args.sleds).context("invalid sled index")?;
    platform.set_sled_presence(presence);

    let agent = IpmbAgent::new(&log, config.clone(), platform);
    agent.start().context("failed to start IPMB agent")?;
    let status = StatusManager::new(&log, "ipmb", Box::new(agent.health()));

    let transition_log = log.new(o!("name" => "transition_handler"));
    let handler = move |id: &str, transition: Transition| {
        info!(
            transition_log,
            "BMC transition";
            "bmc" => id,
            "transition" => transition.as_str(),
        );
        true
    };
    let manager = BmcManager::new(
        &log,
        config.bmc_update_interval,
        Arc::new(TcpProbe::new(config.probe_timeout)),
        Arc::new(handler),
    );
    for addr in args.bmc {
        manager
            .add(ConnectionData::from(addr))
            .with_context(|| format!("failed to supervise BMC {addr}"))?;
    }

    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut ticker = tokio::time::interval(Duration::from_secs(args.status_interval));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                info!(
                    log,
                    "agent status";
                    "hw_status" => %status.get_hw_status(),
                    "sw_status" => %status.get_sw_status(),
                    "bmcs" => ?manager.states(),
                );
            }
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
        }
    }

    info!(log, "shutting down");
    // Stopping joins threads, so keep it off the runtime's workers.
    tokio::task::spawn_blocking(move || {
        manager.stop_all();
        agent.stop();
    })
    .await
    .context("shutdown task failed")?;
    Ok(())
}
