// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The IPMB responder, tying the pipeline together.

use crate::client;
use crate::client::MuxClient;
use crate::client::SharedTransport;
use crate::client::Transport;
use crate::command::CommandFactory;
use crate::dispatcher::Dispatcher;
use crate::platform::ChassisPlatform;
use crate::queue::MessageQueue;
use crate::receiver::Receiver;
use crate::status::IpmbHealth;
use crate::worker::Worker;
use crate::Config;
use crate::Error;
use ipmb_messages::IpmiMessage;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::thread::JoinHandle;

#[derive(Default)]
struct Pipeline {
    queue: Option<Arc<MessageQueue<IpmiMessage>>>,
    threads: Vec<JoinHandle<()>>,
}

/// An agent answering IPMI requests arriving over the IPMB.
///
/// The agent owns a [`Receiver`] and a [`Worker`] thread, connected by a
/// bounded queue. Both share one transport to the MUX.
pub struct IpmbAgent {
    log: Logger,
    config: Config,
    transport: SharedTransport,
    dispatcher: Dispatcher,
    running: Arc<AtomicBool>,
    pipeline: Mutex<Pipeline>,
}

impl IpmbAgent {
    /// Create an agent talking to the MUX described by `config`, answering
    /// the built-in commands from `platform`.
    pub fn new(log: &Logger, config: Config, platform: Arc<dyn ChassisPlatform>) -> Self {
        let mux = MuxClient::new(
            log.new(o!("component" => "mux_client")),
            config.mux_addr,
            config.connect_timeout,
        );
        let factory = Arc::new(CommandFactory::with_defaults(platform));
        Self::with_transport(log, config, Box::new(mux), factory)
    }

    /// Create an agent over any transport, with any set of commands.
    pub fn with_transport(
        log: &Logger,
        config: Config,
        transport: Box<dyn Transport>,
        factory: Arc<CommandFactory>,
    ) -> Self {
        let log = log.new(o!("component" => "ipmb_agent"));
        crate::register_probes(&log);
        let dispatcher = Dispatcher::new(&log, factory);
        Self {
            log,
            config,
            transport: client::shared(transport),
            dispatcher,
            running: Arc::new(AtomicBool::new(false)),
            pipeline: Mutex::new(Pipeline::default()),
        }
    }

    fn pipeline(&self) -> MutexGuard<'_, Pipeline> {
        self.pipeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn factory(&self) -> &Arc<CommandFactory> {
        self.dispatcher.factory()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Return a probe of the agent's health.
    pub fn health(&self) -> IpmbHealth {
        IpmbHealth::new(self.transport.clone(), self.running.clone())
    }

    /// Spawn the receiver and worker threads.
    ///
    /// Starting a running agent does nothing. An agent may be restarted
    /// after it is stopped.
    pub fn start(&self) -> Result<(), Error> {
        let mut pipeline = self.pipeline();
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let queue = Arc::new(MessageQueue::new(
            self.log.new(o!("component" => "queue")),
            self.config.queue_depth,
        ));
        pipeline.queue = Some(queue.clone());

        let worker = Worker::new(
            &self.log,
            self.transport.clone(),
            queue.clone(),
            self.dispatcher.clone(),
        );
        let receiver = Receiver::new(
            &self.log,
            &self.config,
            self.transport.clone(),
            queue,
            self.running.clone(),
        );
        let spawned = worker.spawn().and_then(|w| {
            pipeline.threads.push(w);
            receiver.spawn()
        });
        match spawned {
            Ok(r) => pipeline.threads.push(r),
            Err(e) => {
                drop(pipeline);
                self.stop();
                return Err(e);
            }
        }
        info!(
            self.log,
            "IPMB agent started";
            "mux" => %self.config.mux_addr,
            "n_commands" => self.factory().len(),
        );
        Ok(())
    }

    /// Stop the agent and join its threads.
    ///
    /// This may be called any number of times.
    pub fn stop(&self) {
        let mut pipeline = self.pipeline();
        self.running.store(false, Ordering::Release);
        if let Some(queue) = pipeline.queue.take() {
            queue.stop();
        }
        let threads = std::mem::take(&mut pipeline.threads);
        if threads.is_empty() {
            return;
        }
        for handle in threads {
            let name = handle.thread().name().map(String::from);
            if handle.join().is_err() {
                warn!(self.log, "pipeline thread panicked"; "thread" => ?name);
            }
        }
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .disconnect();
        debug!(self.log, "IPMB agent stopped");
    }
}

impl Drop for IpmbAgent {
    fn drop(&mut self) {
        self.stop();
    }
}
