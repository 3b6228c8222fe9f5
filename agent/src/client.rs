// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The byte-stream connection to the IPMB MUX.

use crate::Error;
use slog::debug;
use slog::Logger;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

/// The request a client sends to register with the MUX as a responder.
pub const REGISTER_RESPONDER: &[u8] = b"R";

/// The MUX's acknowledgement of a successful registration.
pub const REGISTRATION_ACK: &[u8] = b"OK";

/// A connection carrying IPMB frames to and from the bus.
///
/// Reads never block: `recv` returns `Ok(None)` when no data is available.
pub trait Transport: Send {
    /// Establish the connection, replacing any existing one.
    fn connect(&mut self) -> Result<(), Error>;

    fn is_connected(&self) -> bool;

    /// Write an entire frame.
    fn send(&mut self, frame: &[u8]) -> Result<(), Error>;

    /// Read whatever data is available into `buf`.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error>;

    fn disconnect(&mut self);
}

/// A transport shared between the receiver and worker threads.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Wrap a transport so that it may be shared between threads.
pub fn shared(transport: Box<dyn Transport>) -> SharedTransport {
    Arc::new(Mutex::new(transport))
}

/// A client of the MUX daemon, registered as the IPMB responder.
#[derive(Debug)]
pub struct MuxClient {
    log: Logger,
    addr: SocketAddr,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl MuxClient {
    /// Create a client for the MUX at `addr`.
    ///
    /// No connection is made until [`Transport::connect`] is called. The
    /// `timeout` bounds connection, registration, and each blocked write.
    pub fn new(log: Logger, addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            log,
            addr,
            timeout,
            stream: None,
        }
    }

    // Perform the registration handshake on a freshly connected stream.
    fn register(&self, stream: &mut TcpStream) -> Result<(), Error> {
        stream.set_read_timeout(Some(self.timeout))?;
        stream.write_all(REGISTER_RESPONDER)?;
        let mut reply = [0u8; REGISTRATION_ACK.len()];
        match stream.read_exact(&mut reply) {
            Ok(()) if reply == REGISTRATION_ACK => Ok(()),
            Ok(()) => Err(Error::Registration(format!(
                "MUX refused registration, replied {reply:02x?}"
            ))),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(Error::Registration(
                String::from("MUX closed the connection during registration"),
            )),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream, Error> {
        self.stream.as_mut().ok_or(Error::NotConnected)
    }
}

impl Transport for MuxClient {
    fn connect(&mut self) -> Result<(), Error> {
        self.disconnect();
        let mut stream = TcpStream::connect_timeout(&self.addr, self.timeout)?;
        stream.set_nodelay(true)?;
        self.register(&mut stream)?;
        stream.set_read_timeout(None)?;
        stream.set_nonblocking(true)?;
        debug!(
            self.log,
            "registered with MUX as responder";
            "mux" => %self.addr,
            "local_addr" => ?stream.local_addr(),
        );
        self.stream = Some(stream);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        let deadline = Instant::now() + self.timeout;
        let mut written = 0;
        while written < frame.len() {
            match self.stream()?.write(&frame[written..]) {
                Ok(0) => {
                    self.disconnect();
                    return Err(Error::Disconnected);
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::Io(e));
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    self.disconnect();
                    return Err(Error::Io(e));
                }
            }
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
        match self.stream()?.read(buf) {
            Ok(0) => {
                self.disconnect();
                Err(Error::Disconnected)
            }
            Ok(n) => Ok(Some(n)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(None)
            }
            Err(e) => {
                self.disconnect();
                Err(Error::Io(e))
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!(self.log, "disconnecting from MUX"; "mux" => %self.addr);
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

impl Drop for MuxClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
