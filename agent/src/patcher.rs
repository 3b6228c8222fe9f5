// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Addressing a response to the request it answers.

use ipmb_messages::IpmiMessage;
use ipmb_messages::IPMB_CHCKSUM_LEN;
use ipmb_messages::IPMB_FRAME_HDR_LEN;

/// Fill in the addressing and framing of `response` from `request`.
///
/// This must run after the command has packed the response payload, and
/// before the response is serialized. Addresses and LUNs swap roles, the
/// sequence number and command code are copied, and the length gains the
/// fixed framing overhead.
///
/// The NetFn family is taken from the request, but the direction bit is
/// left as the command set it.
pub fn patch(request: &IpmiMessage, response: &mut IpmiMessage) {
    response.set_dest_addr(request.src_addr());
    response.set_src_addr(request.dest_addr());
    response.set_dest_lun(request.src_lun());
    response.set_src_lun(request.dest_lun());

    let direction = response.netfn() & 1;
    response.set_netfn((request.netfn() & !1) | direction);

    response.set_seq(request.seq());
    response.set_cmd(request.cmd());
    response.add_len(IPMB_FRAME_HDR_LEN + IPMB_CHCKSUM_LEN);
}

#[cfg(test)]
mod tests {
    use super::patch;
    use crate::command::pack_response;
    use ipmb_messages::netfn;
    use ipmb_messages::CompletionCode;
    use ipmb_messages::IpmiMessage;
    use ipmb_messages::IPMB_CHCKSUM_LEN;
    use ipmb_messages::IPMB_FRAME_HDR_LEN;

    fn request(dest: u8, dlun: u8, src: u8, slun: u8, seq: u8) -> IpmiMessage {
        let mut msg = IpmiMessage::new();
        msg.set_dest_addr(dest);
        msg.set_dest_lun(dlun);
        msg.set_src_addr(src);
        msg.set_src_lun(slun);
        msg.set_seq(seq);
        msg.set_netfn(netfn::OEM);
        msg.set_cmd(0xa0);
        msg.set_data(&[0]).unwrap();
        msg
    }

    #[test]
    fn test_patch_swaps_addressing() {
        for (dest, dlun, src, slun, seq) in [
            (0x20, 0, 0x10, 0, 0),
            (0x20, 1, 0x82, 2, 17),
            (0xfe, 3, 0x00, 1, 63),
        ] {
            let req = request(dest, dlun, src, slun, seq);
            let mut rsp = IpmiMessage::new();
            pack_response(&mut rsp, CompletionCode::Success, &[0x05]).unwrap();
            let before = rsp.length();
            patch(&req, &mut rsp);

            assert_eq!(rsp.dest_addr(), req.src_addr());
            assert_eq!(rsp.src_addr(), req.dest_addr());
            assert_eq!(rsp.dest_lun(), req.src_lun());
            assert_eq!(rsp.src_lun(), req.dest_lun());
            assert_eq!(rsp.seq(), req.seq());
            assert_eq!(rsp.cmd(), req.cmd());
            assert_eq!(
                rsp.length(),
                before + IPMB_FRAME_HDR_LEN + IPMB_CHCKSUM_LEN
            );
        }
    }

    #[test]
    fn test_patch_keeps_response_direction() {
        let req = request(0x20, 0, 0x10, 0, 5);
        let mut rsp = IpmiMessage::new();
        pack_response(&mut rsp, CompletionCode::Success, &[]).unwrap();
        patch(&req, &mut rsp);
        assert_eq!(rsp.netfn(), netfn::OEM + 1);
        assert!(rsp.is_response());
    }

    #[test]
    fn test_patched_response_serializes() {
        // Get Device ID from 0x10 to 0x20, sequence 5.
        let req = IpmiMessage::from_bytes(&[0x20, 0x18, 0xc8, 0x10, 0x14, 0x01, 0xdb]).unwrap();
        let mut rsp = IpmiMessage::new();
        pack_response(&mut rsp, CompletionCode::InvalidCommand, &[]).unwrap();
        patch(&req, &mut rsp);
        let bytes = rsp.to_bytes().unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(bytes[0], 0x10);
        assert_eq!(bytes[1], 0x1c);
        assert_eq!(bytes[3], 0x20);
        assert_eq!(bytes[4], 0x14);
        assert_eq!(bytes[5], 0x01);
        assert_eq!(bytes[6], 0xc1);
        let parsed = IpmiMessage::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.data(), &[0xc1]);
    }
}
