// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Shared helpers for unit tests.

use crate::bmc::BmcProbe;
use crate::bmc::ConnectionData;
use crate::bmc::OnlineStatus;
use crate::bmc::ProbeError;
use crate::client::Transport;
use crate::Error;
use slog::o;
use slog::Logger;
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

pub fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

// Poll `f` until it returns true or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    f()
}

enum Inbound {
    Bytes(Vec<u8>),
    Disconnect,
}

#[derive(Default)]
struct MockState {
    connected: bool,
    n_connects: usize,
    failing_connects: usize,
    inbound: VecDeque<Inbound>,
    sent: Vec<Vec<u8>>,
}

/// A transport which hands out canned data and records everything sent.
///
/// Clones share state, so a test can keep one while the agent owns another.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    // Queue bytes to be returned by one `recv`.
    pub fn push_inbound(&self, bytes: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .inbound
            .push_back(Inbound::Bytes(bytes.to_vec()));
    }

    // Queue a connection loss.
    pub fn push_disconnect(&self) {
        self.state
            .lock()
            .unwrap()
            .inbound
            .push_back(Inbound::Disconnect);
    }

    // Make the next `n` connection attempts fail.
    pub fn fail_connects(&self, n: usize) {
        self.state.lock().unwrap().failing_connects = n;
    }

    pub fn n_connects(&self) -> usize {
        self.state.lock().unwrap().n_connects
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.clone()
    }

    // Wait until at least `n` frames have been sent, returning them all.
    pub fn wait_for_sent(&self, n: usize, timeout: Duration) -> Vec<Vec<u8>> {
        wait_until(timeout, || self.sent().len() >= n);
        self.sent()
    }
}

impl Transport for MockTransport {
    fn connect(&mut self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(Error::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )));
        }
        state.connected = true;
        state.n_connects += 1;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(Error::NotConnected);
        }
        state.sent.push(frame.to_vec());
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(Error::NotConnected);
        }
        match state.inbound.pop_front() {
            None => Ok(None),
            Some(Inbound::Disconnect) => {
                state.connected = false;
                Err(Error::Disconnected)
            }
            Some(Inbound::Bytes(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    state
                        .inbound
                        .push_front(Inbound::Bytes(bytes[n..].to_vec()));
                }
                Ok(Some(n))
            }
        }
    }

    fn disconnect(&mut self) {
        self.state.lock().unwrap().connected = false;
    }
}

/// A BMC probe returning scripted answers and counting calls.
pub struct ScriptedProbe {
    presence: Mutex<Result<bool, ProbeError>>,
    online: Mutex<Result<OnlineStatus, ProbeError>>,
    presence_calls: AtomicUsize,
    online_calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(
        presence: Result<bool, ProbeError>,
        online: Result<OnlineStatus, ProbeError>,
    ) -> Self {
        Self {
            presence: Mutex::new(presence),
            online: Mutex::new(online),
            presence_calls: AtomicUsize::new(0),
            online_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_presence(&self, presence: Result<bool, ProbeError>) {
        *self.presence.lock().unwrap() = presence;
    }

    pub fn set_online(&self, online: Result<OnlineStatus, ProbeError>) {
        *self.online.lock().unwrap() = online;
    }

    pub fn presence_calls(&self) -> usize {
        self.presence_calls.load(Ordering::SeqCst)
    }

    pub fn online_calls(&self) -> usize {
        self.online_calls.load(Ordering::SeqCst)
    }
}

impl BmcProbe for ScriptedProbe {
    fn read_presence(&self, _: &ConnectionData) -> Result<bool, ProbeError> {
        self.presence_calls.fetch_add(1, Ordering::SeqCst);
        self.presence.lock().unwrap().clone()
    }

    fn read_online_status(&self, _: &ConnectionData) -> Result<OnlineStatus, ProbeError> {
        self.online_calls.fetch_add(1, Ordering::SeqCst);
        self.online.lock().unwrap().clone()
    }
}
