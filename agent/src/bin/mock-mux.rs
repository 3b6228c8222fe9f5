// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Mock IPMB MUX, which registers a responder and fires requests at it.

use anyhow::bail;
use anyhow::Context;
use chassis_agent::client::REGISTER_RESPONDER;
use chassis_agent::client::REGISTRATION_ACK;
use chassis_agent::config::default_mux_addr;
use chassis_agent::framer::Framed;
use chassis_agent::framer::Framer;
use clap::Parser;
use ipmb_messages::netfn;
use ipmb_messages::IpmiMessage;
use ipmb_messages::MAX_FRAME_LEN;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;

// Addresses of the requester and the chassis controller on the bus.
const REQUESTER_ADDR: u8 = 0x10;
const RESPONDER_ADDR: u8 = 0x20;

fn parse_hex(s: &str) -> Result<Vec<u8>, String> {
    if !s.is_ascii() || s.len() % 2 != 0 {
        return Err(String::from("expected an even number of hex digits"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

#[derive(Parser)]
struct Args {
    /// The address on which to accept the responder.
    #[arg(short, long, default_value_t = default_mux_addr())]
    listen: SocketAddr,

    /// The NetFn of the request to send.
    #[arg(short, long, default_value_t = netfn::APP)]
    netfn: u8,

    /// The command of the request to send.
    #[arg(short, long, default_value_t = 0x01)]
    cmd: u8,

    /// The request data, as hex.
    #[arg(short, long, default_value = "")]
    data: String,

    /// The interval between requests, in milliseconds.
    #[arg(short, long, default_value_t = 1000)]
    interval: u64,
}

fn request(args: &Args, data: &[u8], seq: u8) -> anyhow::Result<Vec<u8>> {
    let mut message = IpmiMessage::new();
    message.set_dest_addr(RESPONDER_ADDR);
    message.set_netfn(args.netfn);
    message.set_to_request();
    message.set_src_addr(REQUESTER_ADDR);
    message.set_seq(seq);
    message.set_cmd(args.cmd);
    message.set_data(data)?;
    Ok(message.to_bytes()?)
}

async fn register(stream: &mut TcpStream) -> anyhow::Result<()> {
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await?;
    if buf != REGISTER_RESPONDER {
        bail!("expected responder registration, got {buf:02x?}");
    }
    stream.write_all(REGISTRATION_ACK).await?;
    Ok(())
}

async fn serve(args: &Args, data: &[u8], mut stream: TcpStream) -> anyhow::Result<()> {
    register(&mut stream).await?;
    println!("responder registered");

    let mut framer = Framer::new();
    let mut buf = [0u8; MAX_FRAME_LEN * 2];
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval));
    let mut seq = 0u8;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let frame = request(args, data, seq)?;
                println!("<= {frame:02x?}");
                stream.write_all(&frame).await?;
                seq = (seq + 1) % 64;
            }
            n = stream.read(&mut buf) => {
                let n = n?;
                if n == 0 {
                    println!("responder disconnected");
                    return Ok(());
                }
                framer.push(&buf[..n]);
                for framed in framer.take_frames() {
                    match framed {
                        Framed::Message(message) => println!("=> {message}"),
                        Framed::Garbage { n_bytes, error } => {
                            println!("=> {n_bytes} bad bytes: {error}")
                        }
                    }
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let data = parse_hex(&args.data).map_err(anyhow::Error::msg)?;
    // Fail early on a request which cannot be framed.
    request(&args, &data, 0).context("invalid request")?;

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to listen on {}", args.listen))?;
    println!("listening on {}", args.listen);
    loop {
        let (stream, peer) = listener.accept().await?;
        println!("accepted {peer}");
        if let Err(e) = serve(&args, &data, stream).await {
            println!("{e:?}");
        }
    }
}
