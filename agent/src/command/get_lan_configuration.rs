// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Get LAN Configuration Parameters, from the Transport NetFn.

use super::pack_error;
use super::pack_response;
use super::Command;
use super::CommandError;
use super::InvalidSelector;
use crate::platform::ChassisPlatform;
use ipmb_messages::check_request_len;
use ipmb_messages::CompletionCode;
use ipmb_messages::IpmiMessage;
use std::sync::Arc;

/// A LAN configuration parameter the agent can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LanParameter {
    IpAddress = 3,
    MacAddress = 5,
}

impl TryFrom<u8> for LanParameter {
    type Error = u8;

    fn try_from(selector: u8) -> Result<Self, Self::Error> {
        match selector {
            3 => Ok(LanParameter::IpAddress),
            5 => Ok(LanParameter::MacAddress),
            x => Err(x),
        }
    }
}

// Set in the channel byte to ask for the parameter revision only.
const REVISION_ONLY: u8 = 0x80;

#[derive(Clone, Copy, Debug)]
enum Request {
    Parameter {
        parameter: LanParameter,
        revision_only: bool,
    },
    Unsupported(InvalidSelector),
}

pub struct GetLanConfiguration {
    platform: Arc<dyn ChassisPlatform>,
    request: Option<Request>,
    data: Option<Vec<u8>>,
}

impl GetLanConfiguration {
    pub const CODE: u8 = 0x02;
    pub const CMD_REQUEST_DATA_LENGTH: usize = 4;
    pub const PARAMETER_REVISION: u8 = 0x11;

    pub fn new(platform: Arc<dyn ChassisPlatform>) -> Self {
        Self {
            platform,
            request: None,
            data: None,
        }
    }
}

impl Command for GetLanConfiguration {
    fn name(&self) -> &'static str {
        "get_lan_configuration"
    }

    fn unpack(&mut self, request: &IpmiMessage) -> Result<(), CommandError> {
        let data = request.data();
        check_request_len(data, Self::CMD_REQUEST_DATA_LENGTH)?;
        let (channel, selector) = (data[0], data[1]);
        self.request = Some(match LanParameter::try_from(selector) {
            Ok(parameter) => Request::Parameter {
                parameter,
                revision_only: channel & REVISION_ONLY != 0,
            },
            Err(selector) => Request::Unsupported(InvalidSelector::new(selector)),
        });
        Ok(())
    }

    fn execute(&mut self) -> Result<(), CommandError> {
        if self.data.is_some() {
            return Ok(());
        }
        let data = match self.request {
            Some(Request::Parameter {
                revision_only: true,
                ..
            })
            | Some(Request::Unsupported(_)) => Vec::new(),
            Some(Request::Parameter {
                parameter: LanParameter::IpAddress,
                ..
            }) => self.platform.ip_address()?.octets().to_vec(),
            Some(Request::Parameter {
                parameter: LanParameter::MacAddress,
                ..
            }) => self.platform.mac_address()?.to_vec(),
            None => return Err(CommandError::NotUnpacked),
        };
        self.data = Some(data);
        Ok(())
    }

    fn pack(&mut self, response: &mut IpmiMessage) -> Result<(), CommandError> {
        match self.request.as_mut() {
            None => return pack_error(response, CommandError::NotUnpacked),
            Some(Request::Unsupported(fallback)) => return fallback.pack(response),
            Some(Request::Parameter { .. }) => {}
        }
        if let Err(e) = self.execute() {
            return pack_error(response, e);
        }
        let data = self.data.as_deref().unwrap_or_default();
        let mut body = Vec::with_capacity(1 + data.len());
        body.push(Self::PARAMETER_REVISION);
        body.extend_from_slice(data);
        pack_response(response, CompletionCode::Success, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::GetLanConfiguration;
    use super::LanParameter;
    use crate::command::Command;
    use crate::command::CommandError;
    use crate::platform::default_device_id;
    use crate::platform::StaticPlatform;
    use ipmb_messages::CompletionCode;
    use ipmb_messages::IpmiMessage;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    const MAC: [u8; 6] = [0xa8, 0x40, 0x25, 0x00, 0x00, 0x01];

    fn command() -> GetLanConfiguration {
        let platform = StaticPlatform::new(default_device_id(), Ipv4Addr::new(10, 0, 0, 2), MAC);
        GetLanConfiguration::new(Arc::new(platform))
    }

    fn request(request_data: &[u8]) -> Result<IpmiMessage, CommandError> {
        let mut request = IpmiMessage::new();
        request.set_netfn(0x0c);
        request.set_cmd(GetLanConfiguration::CODE);
        request.set_data(request_data)?;
        Ok(request)
    }

    fn run(request_data: &[u8]) -> Result<IpmiMessage, CommandError> {
        let mut command = command();
        let request = request(request_data)?;
        command.unpack(&request)?;
        command.execute()?;
        let mut rsp = IpmiMessage::new();
        rsp.set_netfn(request.netfn());
        command.pack(&mut rsp)?;
        Ok(rsp)
    }

    #[test]
    fn test_selector_parsing() {
        assert_eq!(LanParameter::try_from(3), Ok(LanParameter::IpAddress));
        assert_eq!(LanParameter::try_from(5), Ok(LanParameter::MacAddress));
        assert_eq!(LanParameter::try_from(4), Err(4));
    }

    #[test]
    fn test_get_ip_address() {
        let mut rsp = run(&[0x01, 3, 0, 0]).unwrap();
        assert_eq!(rsp.length(), 6);
        assert_eq!(&rsp.data_mut()[..6], &[0x00, 0x11, 10, 0, 0, 2]);
    }

    #[test]
    fn test_get_mac_address() {
        let mut rsp = run(&[0x01, 5, 0, 0]).unwrap();
        assert_eq!(rsp.length(), 8);
        assert_eq!(&rsp.data_mut()[2..8], &MAC);
    }

    #[test]
    fn test_pack_without_execute() {
        let mut command = command();
        command.unpack(&request(&[0x01, 3, 0, 0]).unwrap()).unwrap();
        let mut rsp = IpmiMessage::new();
        rsp.set_netfn(0x0c);
        command.pack(&mut rsp).unwrap();
        assert_eq!(rsp.netfn(), 0x0d);
        assert_eq!(rsp.length(), 6);
        assert_eq!(&rsp.data_mut()[..6], &[0x00, 0x11, 10, 0, 0, 2]);
    }

    #[test]
    fn test_pack_before_unpack() {
        let mut rsp = IpmiMessage::new();
        rsp.set_netfn(0x0c);
        assert_eq!(command().pack(&mut rsp), Err(CommandError::NotUnpacked));
        assert_eq!(rsp.length(), 1);
        assert_eq!(
            CompletionCode::from(rsp.data_mut()[0]),
            CompletionCode::Unspecified
        );
    }

    #[test]
    fn test_revision_only() {
        let mut rsp = run(&[0x81, 5, 0, 0]).unwrap();
        assert_eq!(rsp.length(), 2);
        assert_eq!(&rsp.data_mut()[..2], &[0x00, 0x11]);
    }

    #[test]
    fn test_unsupported_selector() {
        for selector in [0u8, 1, 4, 6, 0x42, 0xff] {
            let mut rsp = run(&[0x01, selector, 0, 0]).unwrap();
            assert_eq!(rsp.length(), 1);
            assert_eq!(
                CompletionCode::from(rsp.data_mut()[0]),
                CompletionCode::ParameterNotSupported
            );
            assert!(rsp.is_response());
        }
    }

    #[test]
    fn test_short_request() {
        assert!(matches!(
            run(&[0x01, 3]),
            Err(CommandError::Message(
                ipmb_messages::Error::RequestLength {
                    expected: 4,
                    actual: 2
                }
            ))
        ));
    }
}
