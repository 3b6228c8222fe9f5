// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Recovering IPMB frame boundaries from the MUX byte stream.
//!
//! IPMB frames carry no length field. The MUX writes each frame with a single
//! send, so in the common case a burst of bytes followed by an idle socket is
//! exactly one frame. Bursts can still coalesce, or arrive with leading junk
//! after a reconnect, so the framer uses the two checksums to find the
//! boundaries: a candidate frame starts where the header checksum holds, and
//! ends where the body checksum holds and what follows is either another valid
//! header or too short to be a frame. A frame split across reads is held
//! until the rest of it arrives.

use ipmb_messages::message::checksum;
use ipmb_messages::Error as MessageError;
use ipmb_messages::IpmiMessage;
use ipmb_messages::MAX_FRAME_LEN;
use ipmb_messages::MIN_FRAME_LEN;

// Bytes buffered without an idle gap before the framer is flushed anyway.
const FLUSH_THRESHOLD: usize = 4 * MAX_FRAME_LEN;

/// One item recovered from the stream.
#[derive(Clone, Debug, PartialEq)]
pub enum Framed {
    /// A complete, checksum-valid frame.
    Message(IpmiMessage),
    /// Bytes which could not be attributed to any frame.
    Garbage { n_bytes: usize, error: MessageError },
}

// A run of unframeable bytes, and the first reason it could not be framed.
type Skipped = Option<(usize, MessageError)>;

/// Accumulates bytes read from the MUX and splits them into frames.
#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
}

// Return true if `bytes` begins with a valid frame header.
fn header_is_valid(bytes: &[u8]) -> bool {
    bytes.len() >= MIN_FRAME_LEN && checksum(&bytes[..2]) == bytes[2]
}

// Return true if `bytes` could be the start of a frame, as far as it goes.
fn header_prefix_is_valid(bytes: &[u8]) -> bool {
    bytes.len() < 3 || checksum(&bytes[..2]) == bytes[2]
}

// Return true if `frame` ends with a valid body checksum.
fn body_is_valid(frame: &[u8]) -> bool {
    let end = frame.len() - 1;
    checksum(&frame[3..end]) == frame[end]
}

// Find the end of the frame starting at the beginning of `bytes`, which must
// begin with a valid header.
//
// Any run of complete frames also sums to zero, so the shortest candidate
// wins rather than the whole buffer.
fn frame_end(bytes: &[u8]) -> Option<usize> {
    let max_end = bytes.len().min(MAX_FRAME_LEN);
    (MIN_FRAME_LEN..=max_end).find(|&end| {
        let tail = &bytes[end..];
        body_is_valid(&bytes[..end]) && (tail.len() < MIN_FRAME_LEN || header_is_valid(tail))
    })
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The number of bytes waiting to be framed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Return true if enough data is buffered that it should be framed now,
    /// without waiting for the stream to go idle.
    pub fn should_flush(&self) -> bool {
        self.buf.len() >= FLUSH_THRESHOLD
    }

    /// Discard all buffered bytes, e.g., after the connection is lost.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Split the buffered bytes into frames.
    ///
    /// A trailing run which starts with a valid header but does not yet hold a
    /// complete frame is kept, since the rest of it may still be in flight.
    /// Bytes which cannot be framed are reported as [`Framed::Garbage`].
    pub fn take_frames(&mut self) -> Vec<Framed> {
        self.split(false)
    }

    /// Split everything buffered into frames, leaving the buffer empty.
    ///
    /// Used once no more bytes are expected, e.g., when a partial frame has
    /// gone stale or a capture is decoded offline.
    pub fn take_all(&mut self) -> Vec<Framed> {
        self.split(true)
    }

    fn split(&mut self, finish: bool) -> Vec<Framed> {
        let buf = std::mem::take(&mut self.buf);
        let mut out = Vec::new();
        let mut start = 0;

        // Bytes skipped while looking for the start of a frame.
        let mut skipped: Skipped = None;
        let skip = |skipped: &mut Skipped, n: usize, error: MessageError| {
            let (n_bytes, _) = skipped.get_or_insert((0, error));
            *n_bytes += n;
        };
        let flush_skipped = |skipped: &mut Skipped, out: &mut Vec<Framed>| {
            if let Some((n_bytes, error)) = skipped.take() {
                out.push(Framed::Garbage { n_bytes, error });
            }
        };

        while start < buf.len() {
            let rest = &buf[start..];
            if !header_prefix_is_valid(rest) {
                let error = MessageError::HeaderChecksum {
                    expected: checksum(&rest[..2]),
                    actual: rest[2],
                };
                skip(&mut skipped, 1, error);
                start += 1;
                continue;
            }
            if let Some(end) = frame_end(rest) {
                flush_skipped(&mut skipped, &mut out);
                match IpmiMessage::from_bytes(&rest[..end]) {
                    Ok(message) => out.push(Framed::Message(message)),
                    Err(error) => out.push(Framed::Garbage {
                        n_bytes: end,
                        error,
                    }),
                }
                start += end;
                continue;
            }
            if !finish && rest.len() < MAX_FRAME_LEN {
                self.buf = rest.to_vec();
                break;
            }
            if rest.len() < MIN_FRAME_LEN {
                skip(&mut skipped, rest.len(), MessageError::FrameTooShort(rest.len()));
                break;
            }
            // No frame starts here after all, so resync one byte further on.
            let error = match IpmiMessage::from_bytes(&rest[..rest.len().min(MAX_FRAME_LEN)]) {
                Err(e) => e,
                Ok(_) => MessageError::FrameTooLong(rest.len()),
            };
            skip(&mut skipped, 1, error);
            start += 1;
        }
        flush_skipped(&mut skipped, &mut out);
        out
    }
}
