// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Building a command for each request.

use super::Command;
use super::GetDeviceId;
use super::GetLanConfiguration;
use super::GetSledPresence;
use super::UnknownCommand;
use crate::platform::ChassisPlatform;
use ipmb_messages::netfn;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// The LUN on which the built-in commands are registered.
pub const BMC_LUN: u8 = 0;

/// The routing key of a request.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct CommandKey {
    pub lun: u8,
    pub netfn: u8,
    pub cmd: u8,
}

impl CommandKey {
    pub const fn new(lun: u8, netfn: u8, cmd: u8) -> Self {
        Self { lun, netfn, cmd }
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lun {} netfn 0x{:02x} cmd 0x{:02x}",
            self.lun, self.netfn, self.cmd
        )
    }
}

/// A function building a fresh command.
pub type Constructor = Box<dyn Fn() -> Box<dyn Command> + Send + Sync>;

/// A table from routing keys to the commands handling them.
///
/// The table is built once at startup and only read afterwards, so it can be
/// shared between threads without locking.
#[derive(Default)]
pub struct CommandFactory {
    table: HashMap<CommandKey, Constructor>,
}

impl fmt::Debug for CommandFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys = self.keys();
        keys.sort();
        f.debug_struct("CommandFactory")
            .field("keys", &keys)
            .finish()
    }
}

impl CommandFactory {
    /// Create a factory with no commands.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a factory with the built-in commands, answering from
    /// `platform`.
    pub fn with_defaults(platform: Arc<dyn ChassisPlatform>) -> Self {
        let mut factory = Self::new();
        let p = platform.clone();
        factory.register(
            CommandKey::new(BMC_LUN, netfn::APP, GetDeviceId::CODE),
            move || Box::new(GetDeviceId::new(p.clone())),
        );
        let p = platform.clone();
        factory.register(
            CommandKey::new(BMC_LUN, netfn::TRANSPORT, GetLanConfiguration::CODE),
            move || Box::new(GetLanConfiguration::new(p.clone())),
        );
        factory.register(
            CommandKey::new(BMC_LUN, netfn::OEM, GetSledPresence::CODE),
            move || Box::new(GetSledPresence::new(platform.clone())),
        );
        factory
    }

    /// Register a command for `key`, returning true if it replaced one.
    pub fn register<F>(&mut self, key: CommandKey, constructor: F) -> bool
    where
        F: Fn() -> Box<dyn Command> + Send + Sync + 'static,
    {
        self.table.insert(key, Box::new(constructor)).is_some()
    }

    /// Build the command for a request.
    ///
    /// This never fails: unknown keys get an [`UnknownCommand`].
    pub fn get_command(&self, lun: u8, netfn: u8, cmd: u8) -> Box<dyn Command> {
        match self.table.get(&CommandKey::new(lun, netfn, cmd)) {
            Some(constructor) => constructor(),
            None => Box::new(UnknownCommand::new()),
        }
    }

    pub fn contains(&self, key: &CommandKey) -> bool {
        self.table.contains_key(key)
    }

    pub fn keys(&self) -> Vec<CommandKey> {
        self.table.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
