// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The thread reading requests from the MUX.

use crate::client::SharedTransport;
use crate::client::Transport;
use crate::framer::Framed;
use crate::framer::Framer;
use crate::probes;
use crate::queue::MessageQueue;
use crate::Config;
use crate::Error;
use ipmb_messages::IpmiMessage;
use ipmb_messages::MAX_FRAME_LEN;
use slog::debug;
use slog::info;
use slog::o;
use slog::trace;
use slog::warn;
use slog::Logger;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

/// The name of the receiver thread.
pub const THREAD_NAME: &str = "ipmb-receiver";

/// Reads bytes from the transport, frames them, and queues the requests.
pub struct Receiver {
    log: Logger,
    transport: SharedTransport,
    queue: Arc<MessageQueue<IpmiMessage>>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    fragment_timeout: Duration,
    reconnect_interval: Duration,
    framer: Framer,
    // When the connection went idle with a partial frame buffered.
    fragment_since: Option<Instant>,
}

impl Receiver {
    pub fn new(
        log: &Logger,
        config: &Config,
        transport: SharedTransport,
        queue: Arc<MessageQueue<IpmiMessage>>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "receiver")),
            transport,
            queue,
            running,
            poll_interval: config.poll_interval,
            fragment_timeout: config.fragment_timeout,
            reconnect_interval: config.reconnect_interval,
            framer: Framer::new(),
            fragment_since: None,
        }
    }

    /// Run the receiver on its own thread.
    pub fn spawn(self) -> Result<JoinHandle<()>, Error> {
        thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || self.run())
            .map_err(|source| Error::Spawn {
                name: THREAD_NAME.to_string(),
                source,
            })
    }

    /// Run until the running flag is cleared.
    pub fn run(mut self) {
        debug!(self.log, "receiver starting");
        let mut buf = [0u8; 2 * MAX_FRAME_LEN];
        while self.is_running() {
            if !self.ensure_connected() {
                self.sleep(self.reconnect_interval);
                continue;
            }

            let result = self.lock_transport().recv(&mut buf);
            match result {
                Ok(Some(n)) => {
                    trace!(self.log, "read from MUX"; "n_bytes" => n);
                    self.framer.push(&buf[..n]);
                    if self.framer.should_flush() {
                        self.flush();
                    }
                }
                Ok(None) => {
                    if self.framer.buffered() > 0 {
                        self.flush_idle();
                    }
                    self.sleep(self.poll_interval);
                }
                Err(e) => {
                    warn!(
                        self.log,
                        "lost connection to MUX";
                        "reason" => ?e,
                    );
                    self.lock_transport().disconnect();
                    self.clear();
                    self.sleep(self.reconnect_interval);
                }
            }
        }
        debug!(self.log, "receiver exiting");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn lock_transport(&self) -> MutexGuard<'_, Box<dyn Transport>> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Connect to the MUX if needed, returning true if connected.
    fn ensure_connected(&mut self) -> bool {
        let mut transport = self.lock_transport();
        if transport.is_connected() {
            return true;
        }
        match transport.connect() {
            Ok(()) => {
                drop(transport);
                info!(self.log, "connected to MUX");
                self.clear();
                true
            }
            Err(e) => {
                drop(transport);
                warn!(
                    self.log,
                    "failed to connect to MUX";
                    "reason" => ?e,
                    "retry_in" => ?self.reconnect_interval,
                );
                false
            }
        }
    }

    fn clear(&mut self) {
        self.framer.clear();
        self.fragment_since = None;
    }

    // Frame what has arrived so far, and drop a partial frame which has waited
    // too long for the rest of its bytes.
    fn flush_idle(&mut self) {
        self.flush();
        if self.framer.buffered() == 0 {
            self.fragment_since = None;
            return;
        }
        let since = *self.fragment_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= self.fragment_timeout {
            debug!(
                self.log,
                "partial frame timed out";
                "n_bytes" => self.framer.buffered(),
            );
            let framed = self.framer.take_all();
            self.handle_framed(framed);
            self.fragment_since = None;
        }
    }

    // Frame the complete frames buffered and queue the requests.
    fn flush(&mut self) {
        let framed = self.framer.take_frames();
        self.handle_framed(framed);
    }

    fn handle_framed(&self, framed: Vec<Framed>) {
        for framed in framed {
            match framed {
                Framed::Message(message) => {
                    probes::frame__received!(|| {
                        (message.dest_addr(), message.length() as u64)
                    });
                    trace!(
                        self.log,
                        "received frame";
                        "message" => %message,
                    );
                    self.queue.push(message);
                }
                Framed::Garbage { n_bytes, error } => {
                    probes::bad__frame!(|| (n_bytes as u64, error.to_string()));
                    warn!(
                        self.log,
                        "discarding bytes which are not a valid frame";
                        "n_bytes" => n_bytes,
                        "reason" => %error,
                    );
                }
            }
        }
    }

    // Sleep for up to `duration`, returning early if stopped.
    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let step = self.poll_interval.min(duration);
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(step.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Receiver;
    use crate::client;
    use crate::queue::MessageQueue;
    use crate::test_utils::test_logger;
    use crate::test_utils::wait_until;
    use crate::test_utils::MockTransport;
    use crate::ConfigBuilder;
    use ipmb_messages::IpmiMessage;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread::JoinHandle;
    use std::time::Duration;

    const GET_DEVICE_ID: [u8; 7] = [0x20, 0x18, 0xc8, 0x10, 0x14, 0x01, 0xdb];
    const GET_SLED_PRESENCE: [u8; 8] = [0x20, 0xc0, 0x20, 0x10, 0x18, 0xa0, 0x00, 0x38];

    type Queue = Arc<MessageQueue<IpmiMessage>>;

    // Start a receiver reading from `mock`.
    fn setup(mock: &MockTransport) -> (Queue, Arc<AtomicBool>, JoinHandle<()>) {
        setup_with_fragment_timeout(mock, Duration::from_secs(1))
    }

    fn setup_with_fragment_timeout(
        mock: &MockTransport,
        fragment_timeout: Duration,
    ) -> (Queue, Arc<AtomicBool>, JoinHandle<()>) {
        let log = test_logger();
        let config = ConfigBuilder::new()
            .poll_interval(Duration::from_millis(1))
            .reconnect_interval(Duration::from_millis(5))
            .fragment_timeout(fragment_timeout)
            .build()
            .unwrap();
        let queue = Arc::new(MessageQueue::new(log.clone(), 8));
        let running = Arc::new(AtomicBool::new(true));
        let receiver = Receiver::new(
            &log,
            &config,
            client::shared(Box::new(mock.clone())),
            queue.clone(),
            running.clone(),
        );
        let handle = receiver.spawn().unwrap();
        (queue, running, handle)
    }

    #[test]
    fn test_receiver_queues_frames() {
        let mock = MockTransport::new();
        mock.push_inbound(&GET_DEVICE_ID[..4]);
        mock.push_inbound(&GET_DEVICE_ID[4..]);
        let (queue, running, handle) = setup(&mock);

        assert!(wait_until(Duration::from_secs(2), || queue.len() == 1));
        let message = queue.pop().unwrap();
        assert_eq!(message.cmd(), 0x01);
        assert_eq!(message.seq(), 5);

        running.store(false, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn test_receiver_joins_frame_split_across_idle_polls() {
        let mock = MockTransport::new();
        mock.push_inbound(&GET_SLED_PRESENCE[..5]);
        let (queue, running, handle) = setup(&mock);

        // Let the receiver see the connection idle a few times.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.len(), 0);
        mock.push_inbound(&GET_SLED_PRESENCE[5..]);

        assert!(wait_until(Duration::from_secs(2), || queue.len() == 1));
        let message = queue.pop().unwrap();
        assert_eq!(message.to_bytes().unwrap(), GET_SLED_PRESENCE);

        running.store(false, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn test_receiver_drops_stale_partial_frame() {
        let mock = MockTransport::new();
        mock.push_inbound(&GET_SLED_PRESENCE[..5]);
        let (queue, running, handle) =
            setup_with_fragment_timeout(&mock, Duration::from_millis(5));

        std::thread::sleep(Duration::from_millis(50));
        mock.push_inbound(&GET_DEVICE_ID);

        assert!(wait_until(Duration::from_secs(2), || queue.len() == 1));
        assert_eq!(queue.pop().unwrap().cmd(), 0x01);

        running.store(false, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn test_receiver_drops_garbage_and_keeps_going() {
        let mock = MockTransport::new();
        mock.push_inbound(&[0xde, 0xad]);
        mock.push_inbound(&GET_DEVICE_ID);
        let (queue, running, handle) = setup(&mock);

        assert!(wait_until(Duration::from_secs(2), || queue.len() == 1));
        running.store(false, Ordering::Release);
        handle.join().unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_receiver_reconnects() {
        let mock = MockTransport::new();
        mock.fail_connects(2);
        mock.push_disconnect();
        mock.push_inbound(&GET_DEVICE_ID);
        let (queue, running, handle) = setup(&mock);

        assert!(wait_until(Duration::from_secs(2), || queue.len() == 1));
        assert_eq!(mock.n_connects(), 2);
        running.store(false, Ordering::Release);
        handle.join().unwrap();
    }
}
