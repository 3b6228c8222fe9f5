// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Get Sled Presence, an OEM command reporting which sleds are installed.

use super::pack_error;
use super::pack_response;
use super::Command;
use super::CommandError;
use crate::platform::ChassisPlatform;
use ipmb_messages::check_request_len;
use ipmb_messages::CompletionCode;
use ipmb_messages::IpmiMessage;
use ipmb_messages::SledPresence;
use std::sync::Arc;

pub struct GetSledPresence {
    platform: Arc<dyn ChassisPlatform>,
    unpacked: bool,
    presence: Option<SledPresence>,
}

impl GetSledPresence {
    pub const CODE: u8 = 0xA0;

    /// The request carries one reserved byte, and the response one mask byte.
    pub const CMD_REQUEST_DATA_LENGTH: usize = 1;

    pub fn new(platform: Arc<dyn ChassisPlatform>) -> Self {
        Self {
            platform,
            unpacked: false,
            presence: None,
        }
    }

    // Read the presence mask once per request.
    fn presence(&mut self) -> Result<SledPresence, CommandError> {
        if let Some(presence) = self.presence {
            return Ok(presence);
        }
        if !self.unpacked {
            return Err(CommandError::NotUnpacked);
        }
        let presence = self.platform.sled_presence()?;
        self.presence = Some(presence);
        Ok(presence)
    }
}

impl Command for GetSledPresence {
    fn name(&self) -> &'static str {
        "get_sled_presence"
    }

    fn unpack(&mut self, request: &IpmiMessage) -> Result<(), CommandError> {
        check_request_len(request.data(), Self::CMD_REQUEST_DATA_LENGTH)?;
        self.unpacked = true;
        Ok(())
    }

    fn execute(&mut self) -> Result<(), CommandError> {
        self.presence().map(|_| ())
    }

    fn pack(&mut self, response: &mut IpmiMessage) -> Result<(), CommandError> {
        match self.presence() {
            Ok(presence) => pack_response(response, CompletionCode::Success, &[presence.0]),
            Err(e) => pack_error(response, e),
        }
    }
}
