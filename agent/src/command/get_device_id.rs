// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Get Device ID, from the App NetFn.

use super::pack_error;
use super::pack_response;
use super::Command;
use super::CommandError;
use crate::platform::ChassisPlatform;
use hubpack::SerializedSize;
use ipmb_messages::check_request_len;
use ipmb_messages::CompletionCode;
use ipmb_messages::DeviceId;
use ipmb_messages::IpmiMessage;
use std::sync::Arc;

pub struct GetDeviceId {
    platform: Arc<dyn ChassisPlatform>,
    unpacked: bool,
    response: Option<DeviceId>,
}

impl GetDeviceId {
    pub const CODE: u8 = 0x01;
    pub const CMD_REQUEST_DATA_LENGTH: usize = 0;

    pub fn new(platform: Arc<dyn ChassisPlatform>) -> Self {
        Self {
            platform,
            unpacked: false,
            response: None,
        }
    }

    fn device_id(&mut self) -> Result<DeviceId, CommandError> {
        if !self.unpacked {
            return Err(CommandError::NotUnpacked);
        }
        let platform = &self.platform;
        Ok(*self.response.get_or_insert_with(|| platform.device_id()))
    }

    fn encode(&mut self) -> Result<([u8; DeviceId::MAX_SIZE], usize), CommandError> {
        let id = self.device_id()?;
        let mut buf = [0u8; DeviceId::MAX_SIZE];
        let n = hubpack::serialize(&mut buf, &id)
            .map_err(|e| CommandError::Encode(format!("{e:?}")))?;
        Ok((buf, n))
    }
}

impl Command for GetDeviceId {
    fn name(&self) -> &'static str {
        "get_device_id"
    }

    fn unpack(&mut self, request: &IpmiMessage) -> Result<(), CommandError> {
        check_request_len(request.data(), Self::CMD_REQUEST_DATA_LENGTH)?;
        self.unpacked = true;
        Ok(())
    }

    fn execute(&mut self) -> Result<(), CommandError> {
        self.device_id().map(|_| ())
    }

    fn pack(&mut self, response: &mut IpmiMessage) -> Result<(), CommandError> {
        match self.encode() {
            Ok((buf, n)) => pack_response(response, CompletionCode::Success, &buf[..n]),
            Err(e) => pack_error(response, e),
        }
    }
}
