// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Routing requests to commands.

use crate::command::Command;
use crate::command::CommandFactory;
use ipmb_messages::IpmiMessage;
use slog::debug;
use slog::o;
use slog::Logger;
use std::sync::Arc;

/// Picks the command answering each request.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    log: Logger,
    factory: Arc<CommandFactory>,
}

impl Dispatcher {
    pub fn new(log: &Logger, factory: Arc<CommandFactory>) -> Self {
        Self {
            log: log.new(o!("component" => "dispatcher")),
            factory,
        }
    }

    /// Return the command for `request`.
    ///
    /// Unknown requests are answered too, so this never fails.
    pub fn dispatch(&self, request: &IpmiMessage) -> Box<dyn Command> {
        let command =
            self.factory
                .get_command(request.dest_lun(), request.netfn(), request.cmd());
        debug!(
            self.log,
            "dispatching request";
            "command" => command.name(),
            "message" => %request,
        );
        command
    }

    pub fn factory(&self) -> &Arc<CommandFactory> {
        &self.factory
    }
}

#[cfg(test)]
mod tests {
    use super::Dispatcher;
    use crate::command::CommandFactory;
    use crate::platform::StaticPlatform;
    use crate::test_utils::test_logger;
    use ipmb_messages::IpmiMessage;
    use std::sync::Arc;

    #[test]
    fn test_dispatch_uses_routing_fields() {
        let factory = Arc::new(CommandFactory::with_defaults(Arc::new(
            StaticPlatform::default(),
        )));
        let dispatcher = Dispatcher::new(&test_logger(), factory);

        let req = IpmiMessage::from_bytes(&[0x20, 0x18, 0xc8, 0x10, 0x14, 0x01, 0xdb]).unwrap();
        assert_eq!(dispatcher.dispatch(&req).name(), "get_device_id");

        let mut other_lun = req;
        other_lun.set_dest_lun(2);
        assert_eq!(dispatcher.dispatch(&other_lun).name(), "unknown_command");
    }
}
