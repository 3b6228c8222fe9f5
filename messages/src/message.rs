// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The IPMB frame and its binary encoding.
//!
//! Every frame on the bus has the same layout:
//!
//! ```text
//! +-----------+---------------+------+----------+--------------+-----+--------+------+
//! | dest addr | netfn << 2    | chk1 | src addr | seq << 2     | cmd | data.. | chk2 |
//! |           |   | dest LUN  |      |          |   | src LUN  |     |        |      |
//! +-----------+---------------+------+----------+--------------+-----+--------+------+
//! ```
//!
//! `chk1` covers the first two bytes, and `chk2` covers everything from the
//! source address through the end of the data. Both are two's-complement
//! checksums: a region including its checksum sums to zero, modulo 256.

use crate::Error;
use crate::IPMB_FRAME_HDR_LEN;
use crate::IPMB_FRAME_OVERHEAD;
use crate::LUN_MASK;
use crate::MAX_DATA_LEN;
use crate::MAX_FRAME_LEN;
use crate::MIN_FRAME_LEN;
use crate::NETFN_MASK;
use crate::SEQ_MASK;
use itertools::Itertools;
use std::fmt;

// Offsets of each header field within a frame.
const DEST_ADDR: usize = 0;
const NETFN_LUN: usize = 1;
const HEADER_CHECKSUM: usize = 2;
const SRC_ADDR: usize = 3;
const SEQ_LUN: usize = 4;
const COMMAND: usize = 5;

/// Compute the two's-complement checksum of a region of a frame.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, byte| acc.wrapping_add(*byte))
        .wrapping_neg()
}

/// A single IPMI message, as carried in one IPMB frame.
///
/// The message tracks its length as it is built. A message decoded from the
/// wire carries the full frame length. A response starts out empty: commands
/// write their payload with [`IpmiMessage::data_mut`] and account for it with
/// [`IpmiMessage::add_len`], and the framing overhead is added last, when the
/// response is addressed to the requester.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IpmiMessage {
    dest_addr: u8,
    dest_lun: u8,
    netfn: u8,
    src_addr: u8,
    src_lun: u8,
    seq: u8,
    cmd: u8,
    len: usize,
    data: [u8; MAX_DATA_LEN],
}

impl Default for IpmiMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl IpmiMessage {
    /// Create an empty message, with zero length.
    pub const fn new() -> Self {
        Self {
            dest_addr: 0,
            dest_lun: 0,
            netfn: 0,
            src_addr: 0,
            src_lun: 0,
            seq: 0,
            cmd: 0,
            len: 0,
            data: [0; MAX_DATA_LEN],
        }
    }

    /// Decode a message from a complete frame, validating both checksums.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let n_bytes = bytes.len();
        if n_bytes < MIN_FRAME_LEN {
            return Err(Error::FrameTooShort(n_bytes));
        }
        if n_bytes > MAX_FRAME_LEN {
            return Err(Error::FrameTooLong(n_bytes));
        }

        let expected = checksum(&bytes[..HEADER_CHECKSUM]);
        if expected != bytes[HEADER_CHECKSUM] {
            return Err(Error::HeaderChecksum {
                expected,
                actual: bytes[HEADER_CHECKSUM],
            });
        }
        let body_end = n_bytes - 1;
        let expected = checksum(&bytes[SRC_ADDR..body_end]);
        if expected != bytes[body_end] {
            return Err(Error::BodyChecksum {
                expected,
                actual: bytes[body_end],
            });
        }

        let mut message = Self {
            dest_addr: bytes[DEST_ADDR],
            dest_lun: bytes[NETFN_LUN] & LUN_MASK,
            netfn: bytes[NETFN_LUN] >> 2,
            src_addr: bytes[SRC_ADDR],
            src_lun: bytes[SEQ_LUN] & LUN_MASK,
            seq: bytes[SEQ_LUN] >> 2,
            cmd: bytes[COMMAND],
            len: n_bytes,
            data: [0; MAX_DATA_LEN],
        };
        let payload = &bytes[IPMB_FRAME_HDR_LEN..body_end];
        message.data[..payload.len()].copy_from_slice(payload);
        Ok(message)
    }

    /// Encode the message into `buf`, returning the number of bytes written.
    ///
    /// Both checksums are recomputed. The message must be fully framed, i.e.,
    /// its length must include the framing overhead.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if self.len < IPMB_FRAME_OVERHEAD {
            return Err(Error::Unframed(self.len));
        }
        if self.len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLong(self.len));
        }
        if buf.len() < self.len {
            return Err(Error::BufferTooSmall {
                needed: self.len,
                actual: buf.len(),
            });
        }

        buf[DEST_ADDR] = self.dest_addr;
        buf[NETFN_LUN] = (self.netfn << 2) | self.dest_lun;
        buf[HEADER_CHECKSUM] = checksum(&buf[..HEADER_CHECKSUM]);
        buf[SRC_ADDR] = self.src_addr;
        buf[SEQ_LUN] = (self.seq << 2) | self.src_lun;
        buf[COMMAND] = self.cmd;
        let body_end = self.len - 1;
        buf[IPMB_FRAME_HDR_LEN..body_end].copy_from_slice(self.data());
        buf[body_end] = checksum(&buf[SRC_ADDR..body_end]);
        Ok(self.len)
    }

    /// Encode the message into a freshly allocated frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut buf = [0u8; MAX_FRAME_LEN];
        let n_bytes = self.serialize(&mut buf)?;
        Ok(buf[..n_bytes].to_vec())
    }

    pub fn dest_addr(&self) -> u8 {
        self.dest_addr
    }

    pub fn set_dest_addr(&mut self, addr: u8) {
        self.dest_addr = addr;
    }

    pub fn dest_lun(&self) -> u8 {
        self.dest_lun
    }

    pub fn set_dest_lun(&mut self, lun: u8) {
        self.dest_lun = lun & LUN_MASK;
    }

    pub fn src_addr(&self) -> u8 {
        self.src_addr
    }

    pub fn set_src_addr(&mut self, addr: u8) {
        self.src_addr = addr;
    }

    pub fn src_lun(&self) -> u8 {
        self.src_lun
    }

    pub fn set_src_lun(&mut self, lun: u8) {
        self.src_lun = lun & LUN_MASK;
    }

    pub fn netfn(&self) -> u8 {
        self.netfn
    }

    pub fn set_netfn(&mut self, netfn: u8) {
        self.netfn = netfn & NETFN_MASK;
    }

    /// The sequence number, shared between a request and its response.
    pub fn seq(&self) -> u8 {
        self.seq
    }

    pub fn set_seq(&mut self, seq: u8) {
        self.seq = seq & SEQ_MASK;
    }

    pub fn cmd(&self) -> u8 {
        self.cmd
    }

    pub fn set_cmd(&mut self, cmd: u8) {
        self.cmd = cmd;
    }

    /// Mark the message as a request, by clearing the NetFn parity bit.
    pub fn set_to_request(&mut self) {
        self.netfn &= !1;
    }

    /// Mark the message as a response, by setting the NetFn parity bit.
    pub fn set_to_response(&mut self) {
        self.netfn |= 1;
    }

    pub fn is_response(&self) -> bool {
        crate::netfn::is_response(self.netfn)
    }

    /// The accumulated length of the message.
    pub fn length(&self) -> usize {
        self.len
    }

    /// Account for `n` more bytes of the message.
    ///
    /// The length only ever grows.
    pub fn add_len(&mut self, n: usize) {
        self.len = self.len.saturating_add(n);
    }

    /// The payload length of a framed message.
    ///
    /// This is zero until the framing overhead has been accounted for.
    pub fn payload_len(&self) -> usize {
        self.len
            .saturating_sub(IPMB_FRAME_OVERHEAD)
            .min(MAX_DATA_LEN)
    }

    /// The payload of a framed message.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.payload_len()]
    }

    /// The whole writable payload buffer.
    ///
    /// Commands write their response bytes here, starting with the completion
    /// code at offset zero.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Replace the payload, setting the length to that of a full frame
    /// carrying it.
    pub fn set_data(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() > MAX_DATA_LEN {
            return Err(Error::PayloadTooLarge(data.len()));
        }
        self.data[..data.len()].copy_from_slice(data);
        self.len = IPMB_FRAME_OVERHEAD + data.len();
        Ok(())
    }
}

impl fmt::Debug for IpmiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpmiMessage")
            .field("dest_addr", &self.dest_addr)
            .field("dest_lun", &self.dest_lun)
            .field("netfn", &self.netfn)
            .field("src_addr", &self.src_addr)
            .field("src_lun", &self.src_lun)
            .field("seq", &self.seq)
            .field("cmd", &self.cmd)
            .field("len", &self.len)
            .field("data", &self.data())
            .finish()
    }
}

impl fmt::Display for IpmiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dest=0x{:02x}/{} netfn=0x{:02x} src=0x{:02x}/{} seq=0x{:02x} \
            cmd=0x{:02x} len={} data=[{}]",
            self.dest_addr,
            self.dest_lun,
            self.netfn,
            self.src_addr,
            self.src_lun,
            self.seq,
            self.cmd,
            self.len,
            self.data().iter().map(|byte| format!("{byte:02x}")).join(" "),
        )
    }
}
