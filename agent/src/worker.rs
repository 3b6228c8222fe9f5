// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The thread answering queued requests.

use crate::client::SharedTransport;
use crate::command::Command;
use crate::command::CommandError;
use crate::command::ErrorResponse;
use crate::dispatcher::Dispatcher;
use crate::patcher;
use crate::probes;
use crate::queue::MessageQueue;
use crate::Error;
use ipmb_messages::CompletionCode;
use ipmb_messages::IpmiMessage;
use slog::debug;
use slog::error;
use slog::o;
use slog::trace;
use slog::warn;
use slog::Logger;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::PoisonError;
use std::thread;
use std::thread::JoinHandle;

/// The name of the worker thread.
pub const THREAD_NAME: &str = "ipmb-worker";

/// Pops requests off the queue, runs their commands, and sends the responses.
pub struct Worker {
    log: Logger,
    transport: SharedTransport,
    queue: Arc<MessageQueue<IpmiMessage>>,
    dispatcher: Dispatcher,
}

// Take a command through all of its steps.
fn run_command(
    command: &mut dyn Command,
    request: &IpmiMessage,
    response: &mut IpmiMessage,
) -> Result<(), CommandError> {
    command.unpack(request)?;
    command.execute()?;
    command.pack(response)
}

// A response shell, carrying the request's NetFn for the command to flip.
fn response_for(request: &IpmiMessage) -> IpmiMessage {
    let mut response = IpmiMessage::new();
    response.set_netfn(request.netfn());
    response
}

impl Worker {
    pub fn new(
        log: &Logger,
        transport: SharedTransport,
        queue: Arc<MessageQueue<IpmiMessage>>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "worker")),
            transport,
            queue,
            dispatcher,
        }
    }

    /// Run the worker on its own thread.
    pub fn spawn(self) -> Result<JoinHandle<()>, Error> {
        thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || self.run())
            .map_err(|source| Error::Spawn {
                name: THREAD_NAME.to_string(),
                source,
            })
    }

    /// Answer requests until the queue is stopped.
    pub fn run(self) {
        debug!(self.log, "worker starting");
        while let Some(request) = self.queue.pop() {
            if let Some(response) = self.respond(&request) {
                self.send(&response);
            }
        }
        debug!(self.log, "worker exiting");
    }

    /// Build the response to `request`.
    ///
    /// Return `None` if the message should not be answered, because it is
    /// itself a response. A failing or panicking command is answered with an
    /// error completion code.
    pub fn respond(&self, request: &IpmiMessage) -> Option<IpmiMessage> {
        if request.is_response() {
            debug!(
                self.log,
                "ignoring response message";
                "message" => %request,
            );
            return None;
        }

        let mut command = self.dispatcher.dispatch(request);
        let name = command.name();
        let mut response = response_for(request);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            run_command(command.as_mut(), request, &mut response)
        }));
        let mut fallback = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                warn!(
                    self.log,
                    "command failed";
                    "command" => name,
                    "reason" => %e,
                    "request" => %request,
                );
                Some(ErrorResponse::from(&e))
            }
            Err(_) => {
                error!(
                    self.log,
                    "command panicked";
                    "command" => name,
                    "request" => %request,
                );
                Some(ErrorResponse::new(CompletionCode::Unspecified))
            }
        };
        if let Some(error_response) = fallback.as_mut() {
            response = response_for(request);
            if let Err(e) = error_response.pack(&mut response) {
                error!(
                    self.log,
                    "failed to pack error response";
                    "reason" => %e,
                );
                return None;
            }
        }
        patcher::patch(request, &mut response);
        Some(response)
    }

    fn send(&self, response: &IpmiMessage) {
        let bytes = match response.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(
                    self.log,
                    "failed to serialize response";
                    "reason" => %e,
                    "response" => %response,
                );
                return;
            }
        };
        let result = self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(&bytes);
        match result {
            Ok(()) => {
                probes::frame__sent!(|| (response.dest_addr(), bytes.len() as u64));
                trace!(
                    self.log,
                    "sent response";
                    "response" => %response,
                );
            }
            Err(e) => {
                warn!(
                    self.log,
                    "failed to send response, dropping it";
                    "reason" => ?e,
                    "response" => %response,
                );
            }
        }
    }
}
