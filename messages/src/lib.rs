// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Wire formats for IPMI messages carried over the Intelligent Platform
//! Management Bus (IPMB) between the chassis agent and sled management
//! controllers.

pub mod message;

use hubpack::SerializedSize;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub use message::IpmiMessage;

/// Length of the IPMB frame header, from the destination address through the
/// command code, including the header checksum.
pub const IPMB_FRAME_HDR_LEN: usize = 6;

/// Length of the trailing checksum covering the source address through the
/// end of the payload.
pub const IPMB_CHCKSUM_LEN: usize = 1;

/// Fixed framing overhead of every IPMB frame, independent of its payload.
pub const IPMB_FRAME_OVERHEAD: usize = IPMB_FRAME_HDR_LEN + IPMB_CHCKSUM_LEN;

/// The largest frame the MUX will carry.
pub const MAX_FRAME_LEN: usize = 32;

/// The smallest valid frame, one with no payload at all.
pub const MIN_FRAME_LEN: usize = IPMB_FRAME_OVERHEAD;

/// The largest payload that fits in a single frame.
pub const MAX_DATA_LEN: usize = MAX_FRAME_LEN - IPMB_FRAME_OVERHEAD;

/// Network function codes.
///
/// Requests always carry an even NetFn, and the matching response is the next
/// odd value.
pub mod netfn {
    pub const CHASSIS: u8 = 0x00;
    pub const APP: u8 = 0x06;
    pub const TRANSPORT: u8 = 0x0C;
    pub const OEM: u8 = 0x30;

    /// Return true if the NetFn identifies a response.
    pub const fn is_response(netfn: u8) -> bool {
        netfn & 1 == 1
    }
}

// Bit widths of the sub-fields packed next to the NetFn and sequence number.
pub(crate) const LUN_MASK: u8 = 0b11;
pub(crate) const NETFN_MASK: u8 = 0b11_1111;
pub(crate) const SEQ_MASK: u8 = 0b11_1111;

/// Errors decoding or encoding IPMB frames.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Frame of {0} bytes is shorter than the {min}-byte minimum", min = MIN_FRAME_LEN)]
    FrameTooShort(usize),

    #[error("Frame of {0} bytes exceeds the {max}-byte maximum", max = MAX_FRAME_LEN)]
    FrameTooLong(usize),

    #[error("Header checksum mismatch: expected 0x{expected:02x}, found 0x{actual:02x}")]
    HeaderChecksum { expected: u8, actual: u8 },

    #[error("Body checksum mismatch: expected 0x{expected:02x}, found 0x{actual:02x}")]
    BodyChecksum { expected: u8, actual: u8 },

    #[error("Payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),

    #[error("Request data length is {actual}, expected {expected}")]
    RequestLength { expected: usize, actual: usize },

    #[error("Message length {0} does not include the framing overhead")]
    Unframed(usize),

    #[error("Buffer of {actual} bytes cannot hold a {needed}-byte frame")]
    BufferTooSmall { needed: usize, actual: usize },

    #[error("Invalid sled index {0}")]
    InvalidSled(u8),
}

/// Verify that a request carries exactly the expected amount of data.
pub fn check_request_len(data: &[u8], expected: usize) -> Result<(), Error> {
    if data.len() == expected {
        Ok(())
    } else {
        Err(Error::RequestLength {
            expected,
            actual: data.len(),
        })
    }
}

/// The single-byte status at the start of every IPMI response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionCode {
    Success,
    /// The command is known, but the requested parameter selector is not.
    ParameterNotSupported,
    NodeBusy,
    /// The NetFn or command is not recognized.
    InvalidCommand,
    RequestDataLengthInvalid,
    Unspecified,
    Other(u8),
}

impl From<CompletionCode> for u8 {
    fn from(code: CompletionCode) -> u8 {
        match code {
            CompletionCode::Success => 0x00,
            CompletionCode::ParameterNotSupported => 0x80,
            CompletionCode::NodeBusy => 0xC0,
            CompletionCode::InvalidCommand => 0xC1,
            CompletionCode::RequestDataLengthInvalid => 0xC7,
            CompletionCode::Unspecified => 0xFF,
            CompletionCode::Other(x) => x,
        }
    }
}

impl From<u8> for CompletionCode {
    fn from(x: u8) -> Self {
        match x {
            0x00 => CompletionCode::Success,
            0x80 => CompletionCode::ParameterNotSupported,
            0xC0 => CompletionCode::NodeBusy,
            0xC1 => CompletionCode::InvalidCommand,
            0xC7 => CompletionCode::RequestDataLengthInvalid,
            0xFF => CompletionCode::Unspecified,
            x => CompletionCode::Other(x),
        }
    }
}

/// A bitmask of the sleds physically present in a chassis.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize, SerializedSize)]
pub struct SledPresence(pub u8);

impl SledPresence {
    pub const MAX_INDEX: u8 = u8::BITS as u8;

    /// Return true if the sled at `index` is present.
    pub fn is_set(&self, index: u8) -> Result<bool, Error> {
        if index >= Self::MAX_INDEX {
            Err(Error::InvalidSled(index))
        } else {
            Ok((self.0 & (1 << index)) != 0)
        }
    }

    /// Mark the sled at `index` as present.
    pub fn set(&mut self, index: u8) -> Result<(), Error> {
        if index >= Self::MAX_INDEX {
            Err(Error::InvalidSled(index))
        } else {
            self.0 |= 1 << index;
            Ok(())
        }
    }

    /// Mark the sled at `index` as absent.
    pub fn clear(&mut self, index: u8) -> Result<(), Error> {
        if index >= Self::MAX_INDEX {
            Err(Error::InvalidSled(index))
        } else {
            self.0 &= !(1 << index);
            Ok(())
        }
    }

    /// Construct a presence mask from a list of sled indices.
    pub fn from_indices(indices: &[u8]) -> Result<Self, Error> {
        let mut out = Self::default();
        for index in indices.iter().copied() {
            out.set(index)?;
        }
        Ok(out)
    }

    /// Return the indices of the sleds that are present.
    pub fn to_indices(&self) -> impl Iterator<Item = u8> + '_ {
        (0..Self::MAX_INDEX).filter(move |i| self.0 & (1u8 << *i) != 0)
    }

    /// The number of sleds present.
    pub const fn count(&self) -> u32 {
        self.0.count_ones()
    }
}

bitflags::bitflags! {
    /// The "additional device support" byte of a Get Device ID response.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DeviceSupport: u8 {
        const SENSOR                = 0b0000_0001;
        const SDR_REPOSITORY        = 0b0000_0010;
        const SEL                   = 0b0000_0100;
        const FRU_INVENTORY         = 0b0000_1000;
        const IPMB_EVENT_RECEIVER   = 0b0001_0000;
        const IPMB_EVENT_GENERATOR  = 0b0010_0000;
        const BRIDGE                = 0b0100_0000;
        const CHASSIS               = 0b1000_0000;
    }
}

/// The body of a Get Device ID response, following the completion code.
///
/// Multi-byte fields are little-endian, which is also how hubpack encodes
/// integers.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize, SerializedSize)]
pub struct DeviceId {
    pub device_id: u8,
    pub device_revision: u8,
    /// Major firmware revision, in the low 7 bits. The top bit is set while
    /// a firmware update is in progress.
    pub firmware_major: u8,
    /// Minor firmware revision, BCD encoded.
    pub firmware_minor: u8,
    pub ipmi_version: u8,
    pub additional_support: u8,
    pub manufacturer_id: [u8; 3],
    pub product_id: u16,
    pub aux_firmware: [u8; 4],
}

impl DeviceId {
    /// IPMI version 2.0, in the BCD encoding used on the wire.
    pub const IPMI_VERSION_2_0: u8 = 0x02;

    pub fn support(&self) -> DeviceSupport {
        DeviceSupport::from_bits_retain(self.additional_support)
    }
}

#[cfg(test)]
mod tests {
    use super::check_request_len;
    use super::CompletionCode;
    use super::DeviceId;
    use super::DeviceSupport;
    use super::Error;
    use super::SledPresence;
    use hubpack::SerializedSize;

    #[test]
    fn test_completion_code_round_trip_known_values() {
        for raw in [0x00, 0x80, 0xC0, 0xC1, 0xC7, 0xFF] {
            assert_eq!(u8::from(CompletionCode::from(raw)), raw);
        }
        assert_eq!(CompletionCode::from(0xCC), CompletionCode::Other(0xCC));
    }

    #[test]
    fn test_check_request_len() {
        assert!(check_request_len(&[0], 1).is_ok());
        assert_eq!(
            check_request_len(&[], 1),
            Err(Error::RequestLength {
                expected: 1,
                actual: 0
            })
        );
    }

    #[test]
    fn test_sled_presence_set_clear() {
        let mut mask = SledPresence::from_indices(&[0, 3]).unwrap();
        assert_eq!(mask.0, 0b1001);
        assert!(mask.is_set(3).unwrap());
        assert!(!mask.is_set(1).unwrap());

        mask.clear(3).unwrap();
        mask.set(7).unwrap();
        assert_eq!(mask.to_indices().collect::<Vec<_>>(), vec![0, 7]);
        assert_eq!(mask.count(), 2);

        assert_eq!(mask.set(8), Err(Error::InvalidSled(8)));
        assert!(mask.is_set(200).is_err());
    }

    #[test]
    fn test_device_id_wire_layout() {
        let id = DeviceId {
            device_id: 0x20,
            device_revision: 0x01,
            firmware_major: 0x02,
            firmware_minor: 0x10,
            ipmi_version: DeviceId::IPMI_VERSION_2_0,
            additional_support: (DeviceSupport::SENSOR | DeviceSupport::CHASSIS).bits(),
            manufacturer_id: [0x57, 0x01, 0x00],
            product_id: 0x1234,
            aux_firmware: [0; 4],
        };
        assert_eq!(DeviceId::MAX_SIZE, 15);
        let mut buf = [0u8; DeviceId::MAX_SIZE];
        let n = hubpack::serialize(&mut buf, &id).unwrap();
        assert_eq!(n, 15);
        assert_eq!(
            buf,
            [0x20, 0x01, 0x02, 0x10, 0x02, 0x81, 0x57, 0x01, 0x00, 0x34, 0x12, 0, 0, 0, 0]
        );
        assert!(id.support().contains(DeviceSupport::CHASSIS));
    }
}
