// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! IPMI commands answered by the agent.
//!
//! Every command goes through the same three steps on the worker thread:
//! [`Command::unpack`] parses the request, [`Command::execute`] gathers the
//! answer, and [`Command::pack`] writes the response payload. Commands are
//! built per request by the [`CommandFactory`].

mod factory;
mod fallback;
mod get_device_id;
mod get_lan_configuration;
mod get_sled_presence;

pub use factory::CommandFactory;
pub use factory::CommandKey;
pub use factory::Constructor;
pub use factory::BMC_LUN;
pub use fallback::ErrorResponse;
pub use fallback::InvalidSelector;
pub use fallback::UnknownCommand;
pub use get_device_id::GetDeviceId;
pub use get_lan_configuration::GetLanConfiguration;
pub use get_lan_configuration::LanParameter;
pub use get_sled_presence::GetSledPresence;

use crate::platform::PlatformError;
use ipmb_messages::CompletionCode;
use ipmb_messages::IpmiMessage;
use ipmb_messages::MAX_DATA_LEN;
use thiserror::Error;

/// An error handling a single IPMI request.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error(transparent)]
    Message(#[from] ipmb_messages::Error),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("Failed to encode response: {0}")]
    Encode(String),

    #[error("Command used before it was unpacked")]
    NotUnpacked,
}

impl CommandError {
    /// The completion code reported to the requester for this error.
    pub fn completion_code(&self) -> CompletionCode {
        match self {
            CommandError::Message(ipmb_messages::Error::RequestLength { .. }) => {
                CompletionCode::RequestDataLengthInvalid
            }
            _ => CompletionCode::Unspecified,
        }
    }
}

/// A handler for one kind of IPMI request.
pub trait Command: Send {
    /// A short name, used in logs.
    fn name(&self) -> &'static str;

    /// Parse and validate the request.
    fn unpack(&mut self, request: &IpmiMessage) -> Result<(), CommandError>;

    /// Do the work of the command, after a successful unpack.
    fn execute(&mut self) -> Result<(), CommandError> {
        Ok(())
    }

    /// Write the response payload into `response`.
    ///
    /// This marks the message as a response and accounts for the payload in
    /// its length. Addressing and framing are left to the patcher. A command
    /// not yet executed is executed first. On error, the response still
    /// carries the error's completion code.
    fn pack(&mut self, response: &mut IpmiMessage) -> Result<(), CommandError>;
}

/// Write a completion code and `body` as the payload of `response`.
///
/// A body too large for a frame is replaced by the `Unspecified` code alone.
pub fn pack_response(
    response: &mut IpmiMessage,
    code: CompletionCode,
    body: &[u8],
) -> Result<(), CommandError> {
    let len = 1 + body.len();
    if len > MAX_DATA_LEN {
        write_payload(response, CompletionCode::Unspecified, &[]);
        return Err(ipmb_messages::Error::PayloadTooLarge(len).into());
    }
    write_payload(response, code, body);
    Ok(())
}

/// Answer with the completion code of `err` alone, and return `err`.
pub fn pack_error(response: &mut IpmiMessage, err: CommandError) -> Result<(), CommandError> {
    write_payload(response, err.completion_code(), &[]);
    Err(err)
}

fn write_payload(response: &mut IpmiMessage, code: CompletionCode, body: &[u8]) {
    let len = 1 + body.len();
    response.set_to_response();
    let data = response.data_mut();
    data[0] = u8::from(code);
    data[1..len].copy_from_slice(body);
    response.add_len(len);
}

#[cfg(test)]
mod tests {
    use super::pack_error;
    use super::pack_response;
    use super::CommandError;
    use crate::platform::PlatformError;
    use ipmb_messages::netfn;
    use ipmb_messages::CompletionCode;
    use ipmb_messages::IpmiMessage;

    #[test]
    fn test_pack_response() {
        let mut rsp = IpmiMessage::new();
        rsp.set_netfn(netfn::APP);
        pack_response(&mut rsp, CompletionCode::Success, &[1, 2]).unwrap();
        assert!(rsp.is_response());
        assert_eq!(rsp.netfn(), netfn::APP + 1);
        assert_eq!(rsp.length(), 3);
        assert_eq!(&rsp.data_mut()[..3], &[0x00, 1, 2]);
    }

    #[test]
    fn test_pack_response_too_large() {
        let mut rsp = IpmiMessage::new();
        let body = [0u8; 25];
        assert_eq!(
            pack_response(&mut rsp, CompletionCode::Success, &body),
            Err(CommandError::Message(
                ipmb_messages::Error::PayloadTooLarge(26)
            ))
        );
        assert!(rsp.is_response());
        assert_eq!(rsp.length(), 1);
        assert_eq!(rsp.data_mut()[0], 0xff);
    }

    #[test]
    fn test_pack_error() {
        let mut rsp = IpmiMessage::new();
        rsp.set_netfn(netfn::OEM);
        let err = CommandError::from(ipmb_messages::Error::RequestLength {
            expected: 1,
            actual: 0,
        });
        assert_eq!(pack_error(&mut rsp, err.clone()), Err(err));
        assert_eq!(rsp.netfn(), netfn::OEM + 1);
        assert_eq!(rsp.length(), 1);
        assert_eq!(rsp.data_mut()[0], 0xc7);
    }

    #[test]
    fn test_error_completion_codes() {
        let err = CommandError::from(ipmb_messages::Error::RequestLength {
            expected: 1,
            actual: 0,
        });
        assert_eq!(err.completion_code(), CompletionCode::RequestDataLengthInvalid);
        let err = CommandError::from(PlatformError::Read {
            what: "sled presence",
            reason: String::from("bus timeout"),
        });
        assert_eq!(err.completion_code(), CompletionCode::Unspecified);
    }
}
