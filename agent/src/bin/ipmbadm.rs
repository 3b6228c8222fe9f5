// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use anyhow::Context;
use chassis_agent::bmc::AcceptAll;
use chassis_agent::bmc::Bmc;
use chassis_agent::bmc::ConnectionData;
use chassis_agent::bmc::TcpProbe;
use chassis_agent::command::CommandFactory;
use chassis_agent::command::BMC_LUN;
use chassis_agent::framer::Framed;
use chassis_agent::framer::Framer;
use chassis_agent::platform::StaticPlatform;
use chassis_agent::status::BmcHealth;
use chassis_agent::status::StatusManager;
use clap::Parser;
use clap::Subcommand;
use ipmb_messages::IpmiMessage;
use itertools::Itertools;
use slog::Drain;
use slog::Level;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tabled::settings::Style;
use tabled::Table;
use tabled::Tabled;

fn parse_log_level(s: &str) -> Result<Level, String> {
    s.parse().map_err(|_| String::from("invalid log level"))
}

/// Inspect IPMB traffic and BMCs.
#[derive(Parser)]
#[command(version, about, long_about)]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,

    /// The log-level.
    #[arg(
        short,
        long,
        default_value_t = Level::Warning,
        value_parser = parse_log_level
    )]
    log_level: Level,
}

#[derive(Subcommand)]
enum Cmd {
    /// Decode a captured run of IPMB frames.
    ///
    /// Whitespace and colons in the hex input are ignored.
    Decode { hex: Vec<String> },

    /// Probe a set of BMCs once and print their state.
    Poll {
        /// The comma-separated list of BMCs, as `ip:port`.
        #[arg(short, long, use_value_delimiter = true, required = true)]
        bmc: Vec<SocketAddr>,

        /// The probe timeout, in milliseconds.
        #[arg(
            short,
            long,
            default_value_t = 1000,
            value_parser = clap::value_parser!(u64).range(1..=10000)
        )]
        timeout: u64,
    },
}

#[derive(Tabled)]
struct FrameRow {
    #[tabled(rename = "Dest")]
    dest: String,
    #[tabled(rename = "NetFn")]
    netfn: String,
    #[tabled(rename = "Src")]
    src: String,
    #[tabled(rename = "Seq")]
    seq: u8,
    #[tabled(rename = "Command")]
    command: String,
    #[tabled(rename = "Data")]
    data: String,
}

#[derive(Tabled)]
struct BmcRow {
    #[tabled(rename = "BMC")]
    id: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Hardware")]
    hardware: String,
    #[tabled(rename = "Software")]
    software: String,
}

fn decode_hex(parts: &[String]) -> anyhow::Result<Vec<u8>> {
    let digits: String = parts
        .iter()
        .flat_map(|part| part.chars())
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if !digits.is_ascii() || digits.len() % 2 != 0 {
        anyhow::bail!("expected an even number of hex digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex at offset {i}"))
        })
        .collect()
}

fn frame_row(commands: &CommandFactory, message: &IpmiMessage) -> FrameRow {
    let name = commands
        .get_command(BMC_LUN, message.netfn() & !1, message.cmd())
        .name();
    let kind = if message.is_response() { "rsp" } else { "req" };
    FrameRow {
        dest: format!("0x{:02x}/{}", message.dest_addr(), message.dest_lun()),
        netfn: format!("0x{:02x} ({kind})", message.netfn()),
        src: format!("0x{:02x}/{}", message.src_addr(), message.src_lun()),
        seq: message.seq(),
        command: format!("0x{:02x} {name}", message.cmd()),
        data: message.data().iter().map(|b| format!("{b:02x}")).join(" "),
    }
}

fn decode(hex: &[String]) -> anyhow::Result<()> {
    let bytes = decode_hex(hex)?;
    let commands = CommandFactory::with_defaults(Arc::new(StaticPlatform::default()));
    let mut framer = Framer::new();
    framer.push(&bytes);
    let mut rows = Vec::new();
    for framed in framer.take_all() {
        match framed {
            Framed::Message(message) => rows.push(frame_row(&commands, &message)),
            Framed::Garbage { n_bytes, error } => {
                eprintln!("skipped {n_bytes} bytes: {error}");
            }
        }
    }
    println!("{}", Table::new(rows).with(Style::psql()));
    Ok(())
}

fn poll(log: &slog::Logger, bmcs: Vec<SocketAddr>, timeout: Duration) {
    let probe = Arc::new(TcpProbe::new(timeout));
    let rows = bmcs
        .into_iter()
        .map(|addr| {
            let bmc = Arc::new(Bmc::new(
                log,
                ConnectionData::from(addr),
                timeout,
                probe.clone(),
                Arc::new(AcceptAll),
            ));
            let state = bmc.update_state();
            let status =
                StatusManager::new(log, bmc.id(), Box::new(BmcHealth::cached(bmc.clone())));
            BmcRow {
                id: bmc.id().to_string(),
                state: state.to_string(),
                hardware: status.get_hw_status().to_string(),
                software: status.get_sw_status().to_string(),
            }
        })
        .collect::<Vec<_>>();
    println!("{}", Table::new(rows).with(Style::psql()));
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, args.log_level).fuse();
    let log = slog::Logger::root(drain, slog::o!());

    match args.cmd {
        Cmd::Decode { hex } => decode(&hex)?,
        Cmd::Poll { bmc, timeout } => poll(&log, bmc, Duration::from_millis(timeout)),
    }
    Ok(())
}
