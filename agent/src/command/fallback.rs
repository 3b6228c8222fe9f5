// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Commands that only ever answer with an error completion code.

use super::pack_response;
use super::Command;
use super::CommandError;
use ipmb_messages::CompletionCode;
use ipmb_messages::IpmiMessage;

/// The reply to a request the agent does not recognize.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UnknownCommand {
    netfn: u8,
    cmd: u8,
}

impl UnknownCommand {
    pub fn new() -> Self {
        Self::default()
    }

    /// The NetFn and command code of the unrecognized request.
    pub fn request(&self) -> (u8, u8) {
        (self.netfn, self.cmd)
    }
}

impl Command for UnknownCommand {
    fn name(&self) -> &'static str {
        "unknown_command"
    }

    fn unpack(&mut self, request: &IpmiMessage) -> Result<(), CommandError> {
        self.netfn = request.netfn();
        self.cmd = request.cmd();
        Ok(())
    }

    fn pack(&mut self, response: &mut IpmiMessage) -> Result<(), CommandError> {
        pack_response(response, CompletionCode::InvalidCommand, &[])
    }
}

/// The reply to a known command asking for a parameter the agent does not
/// support.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidSelector {
    selector: u8,
}

impl InvalidSelector {
    pub fn new(selector: u8) -> Self {
        Self { selector }
    }

    pub fn selector(&self) -> u8 {
        self.selector
    }
}

impl Command for InvalidSelector {
    fn name(&self) -> &'static str {
        "invalid_selector"
    }

    fn unpack(&mut self, _: &IpmiMessage) -> Result<(), CommandError> {
        Ok(())
    }

    fn pack(&mut self, response: &mut IpmiMessage) -> Result<(), CommandError> {
        pack_response(response, CompletionCode::ParameterNotSupported, &[])
    }
}

/// The reply sent when a command fails while handling a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorResponse {
    code: CompletionCode,
}

impl ErrorResponse {
    pub fn new(code: CompletionCode) -> Self {
        Self { code }
    }

    pub fn code(&self) -> CompletionCode {
        self.code
    }
}

impl From<&CommandError> for ErrorResponse {
    fn from(err: &CommandError) -> Self {
        Self::new(err.completion_code())
    }
}

impl Command for ErrorResponse {
    fn name(&self) -> &'static str {
        "error_response"
    }

    fn unpack(&mut self, _: &IpmiMessage) -> Result<(), CommandError> {
        Ok(())
    }

    fn pack(&mut self, response: &mut IpmiMessage) -> Result<(), CommandError> {
        pack_response(response, self.code, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorResponse;
    use super::InvalidSelector;
    use super::UnknownCommand;
    use crate::command::Command;
    use crate::command::CommandError;
    use ipmb_messages::CompletionCode;
    use ipmb_messages::IpmiMessage;

    fn request(netfn: u8, cmd: u8) -> IpmiMessage {
        let mut msg = IpmiMessage::new();
        msg.set_netfn(netfn);
        msg.set_cmd(cmd);
        msg.set_data(&[]).unwrap();
        msg
    }

    #[test]
    fn test_unknown_command() {
        let mut command = UnknownCommand::new();
        command.unpack(&request(0x2e, 0x42)).unwrap();
        assert_eq!(command.request(), (0x2e, 0x42));
        let mut rsp = IpmiMessage::new();
        rsp.set_netfn(0x2e);
        command.pack(&mut rsp).unwrap();
        assert_eq!(rsp.netfn(), 0x2f);
        assert_eq!(rsp.length(), 1);
        assert_eq!(
            CompletionCode::from(rsp.data_mut()[0]),
            CompletionCode::InvalidCommand
        );
    }

    #[test]
    fn test_invalid_selector() {
        let mut command = InvalidSelector::new(0x77);
        command.unpack(&request(0x0c, 0x02)).unwrap();
        let mut rsp = IpmiMessage::new();
        command.pack(&mut rsp).unwrap();
        assert_eq!(rsp.length(), 1);
        assert_eq!(rsp.data_mut()[0], 0x80);
    }

    #[test]
    fn test_error_response_from_error() {
        let err = CommandError::from(ipmb_messages::Error::RequestLength {
            expected: 1,
            actual: 3,
        });
        let mut command = ErrorResponse::from(&err);
        let mut rsp = IpmiMessage::new();
        command.pack(&mut rsp).unwrap();
        assert_eq!(rsp.length(), 1);
        assert_eq!(rsp.data_mut()[0], 0xc7);
    }
}
