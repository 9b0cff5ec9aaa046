use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

use crate::{
    error::ProtocolError,
    mask::apply_mask,
    proto::{CloseCode, CloseReason, OpCode},
};

/// A parsed data or control frame.
#[derive(Debug)]
pub struct Frame {
    pub fin: bool,
    /// RSV1 bit; meaningful only on the first frame of a message and only
    /// when permessage-deflate was negotiated.
    pub rsv1: bool,
    pub opcode: OpCode,
    pub payload: BytesMut,
}

/// Stateless frame reader/writer.
pub struct Parser;

impl Parser {
    /// parse one frame out of `src`, consuming its bytes. `Ok(None)` means
    /// more input is needed.
    ///
    /// `server` selects the mask direction check: servers require masked
    /// frames, clients reject them.
    pub fn parse(src: &mut BytesMut, server: bool, max_size: usize) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let first = src[0];
        let second = src[1];

        let fin = first & 0x80 != 0;
        let rsv1 = first & 0x40 != 0;
        if first & 0x30 != 0 {
            // no extension ever assigns RSV2 or RSV3.
            return Err(ProtocolError::InvalidRsv);
        }
        let opcode = OpCode::from(first & 0x0f);
        if opcode == OpCode::Bad {
            return Err(ProtocolError::BadOpCode);
        }

        let masked = second & 0x80 != 0;
        if server && !masked {
            return Err(ProtocolError::UnmaskedFrame);
        }
        if !server && masked {
            return Err(ProtocolError::MaskedFrame);
        }

        let mut idx = 2;
        let length = match second & 0x7f {
            126 => {
                if src.len() < idx + 2 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([src[idx], src[idx + 1]]) as u64;
                idx += 2;
                len
            }
            127 => {
                if src.len() < idx + 8 {
                    return Ok(None);
                }
                let len = u64::from_be_bytes(src[idx..idx + 8].try_into().unwrap());
                if len & (1 << 63) != 0 {
                    return Err(ProtocolError::InvalidLength);
                }
                idx += 8;
                len
            }
            len => len as u64,
        };

        if opcode.is_control() {
            if length > 125 {
                return Err(ProtocolError::ControlFrameTooBig);
            }
            if !fin {
                return Err(ProtocolError::FragmentedControlFrame);
            }
        }

        if length > max_size as u64 {
            return Err(ProtocolError::MessageTooBig);
        }
        let length = length as usize;

        let mask = if masked {
            if src.len() < idx + 4 {
                return Ok(None);
            }
            let mask: [u8; 4] = src[idx..idx + 4].try_into().unwrap();
            idx += 4;
            Some(mask)
        } else {
            None
        };

        if src.len() < idx + length {
            // reserve for the rest of the frame so the next socket read can
            // land in one allocation.
            src.reserve(idx + length - src.len());
            return Ok(None);
        }

        src.advance(idx);
        let mut payload = src.split_to(length);
        if let Some(mask) = mask {
            apply_mask(&mut payload, mask);
        }

        trace!(target: "ws_frame", "parsed {opcode} frame, fin {fin}, {length} bytes");
        Ok(Some(Frame {
            fin,
            rsv1,
            opcode,
            payload,
        }))
    }

    /// serialize one frame. `mask` generates and applies a fresh mask key
    /// (the client to server direction).
    pub fn write_message(dst: &mut BytesMut, payload: &[u8], opcode: OpCode, fin: bool, rsv1: bool, mask: bool) {
        let mut first = u8::from(opcode);
        if fin {
            first |= 0x80;
        }
        if rsv1 {
            first |= 0x40;
        }

        let mask_bit = if mask { 0x80 } else { 0 };
        dst.reserve(payload.len() + 14);
        dst.put_u8(first);
        match payload.len() {
            len if len < 126 => dst.put_u8(len as u8 | mask_bit),
            len if len <= u16::MAX as usize => {
                dst.put_u8(126 | mask_bit);
                dst.put_u16(len as u16);
            }
            len => {
                dst.put_u8(127 | mask_bit);
                dst.put_u64(len as u64);
            }
        }

        if mask {
            use rand::Rng;
            let key: [u8; 4] = rand::thread_rng().r#gen();
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(payload);
            apply_mask(&mut dst[start..], key);
        } else {
            dst.put_slice(payload);
        }
    }

    /// serialize a close frame with an optional code and reason.
    pub fn write_close(dst: &mut BytesMut, reason: Option<&CloseReason>, mask: bool) {
        match reason {
            None => Self::write_message(dst, &[], OpCode::Close, true, false, mask),
            Some(reason) => {
                let mut payload = Vec::with_capacity(2 + reason.description.as_ref().map(String::len).unwrap_or(0));
                payload.extend_from_slice(&u16::from(reason.code).to_be_bytes());
                if let Some(description) = &reason.description {
                    payload.extend_from_slice(description.as_bytes());
                }
                Self::write_message(dst, &payload, OpCode::Close, true, false, mask)
            }
        }
    }

    /// decode a close frame payload: 2 byte big-endian code plus UTF-8
    /// reason. an empty payload is a close without status.
    pub fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseReason>, ProtocolError> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(ProtocolError::InvalidClosePayload),
            _ => {
                let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
                let description = if payload.len() > 2 {
                    let text = std::str::from_utf8(&payload[2..]).map_err(|_| ProtocolError::InvalidUtf8)?;
                    Some(text.to_string())
                } else {
                    None
                };
                Ok(Some(CloseReason { code, description }))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse_one(src: &[u8], server: bool) -> Result<Option<Frame>, ProtocolError> {
        let mut buf = BytesMut::from(src);
        Parser::parse(&mut buf, server, 1 << 20)
    }

    #[test]
    fn rfc_single_frame_unmasked_text() {
        // "Hello" from RFC 6455 §5.7.
        let frame = parse_one(&[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f], false).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(&frame.payload[..], b"Hello");
    }

    #[test]
    fn rfc_single_frame_masked_text() {
        let frame = parse_one(
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58],
            true,
        )
        .unwrap()
        .unwrap();
        assert_eq!(&frame.payload[..], b"Hello");
    }

    #[test]
    fn sixteen_bit_length() {
        let payload = vec![0xabu8; 256];
        let mut dst = BytesMut::new();
        Parser::write_message(&mut dst, &payload, OpCode::Binary, true, false, false);
        assert_eq!(dst[1], 126);
        assert_eq!(u16::from_be_bytes([dst[2], dst[3]]), 256);

        let frame = Parser::parse(&mut dst, false, 1 << 20).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 256);
    }

    #[test]
    fn sixty_four_bit_length() {
        let payload = vec![0u8; 70_000];
        let mut dst = BytesMut::new();
        Parser::write_message(&mut dst, &payload, OpCode::Binary, true, false, false);
        assert_eq!(dst[1], 127);
        let frame = Parser::parse(&mut dst, false, 1 << 20).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 70_000);
    }

    #[test]
    fn sixty_four_bit_length_high_bit_rejected() {
        let mut src = vec![0x82, 127];
        src.extend_from_slice(&(1u64 << 63 | 5).to_be_bytes());
        assert!(matches!(parse_one(&src, false), Err(ProtocolError::InvalidLength)));
    }

    #[test]
    fn partial_input_asks_for_more() {
        let mut full = BytesMut::new();
        Parser::write_message(&mut full, b"payload", OpCode::Text, true, false, true);
        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(Parser::parse(&mut partial, true, 1 << 20).unwrap().is_none(), "cut {cut}");
        }
    }

    #[test]
    fn mask_direction_enforced() {
        // unmasked frame at a server.
        assert!(matches!(
            parse_one(&[0x81, 0x01, b'x'], true),
            Err(ProtocolError::UnmaskedFrame)
        ));
        // masked frame at a client.
        assert!(matches!(
            parse_one(&[0x81, 0x81, 1, 2, 3, 4, b'x'], false),
            Err(ProtocolError::MaskedFrame)
        ));
    }

    #[test]
    fn control_frame_rules() {
        // ping with 126 byte payload.
        let mut dst = BytesMut::new();
        Parser::write_message(&mut dst, &[0u8; 126], OpCode::Ping, true, false, false);
        assert!(matches!(
            Parser::parse(&mut dst, false, 1 << 20),
            Err(ProtocolError::ControlFrameTooBig)
        ));

        // fragmented ping.
        let mut dst = BytesMut::new();
        Parser::write_message(&mut dst, b"p", OpCode::Ping, false, false, false);
        assert!(matches!(
            Parser::parse(&mut dst, false, 1 << 20),
            Err(ProtocolError::FragmentedControlFrame)
        ));
    }

    #[test]
    fn reserved_opcode_rejected() {
        assert!(matches!(parse_one(&[0x83, 0x00], false), Err(ProtocolError::BadOpCode)));
    }

    #[test]
    fn rsv23_rejected() {
        assert!(matches!(parse_one(&[0xa1, 0x00], false), Err(ProtocolError::InvalidRsv)));
        assert!(matches!(parse_one(&[0x91, 0x00], false), Err(ProtocolError::InvalidRsv)));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut dst = BytesMut::new();
        Parser::write_message(&mut dst, &[0u8; 200], OpCode::Binary, true, false, false);
        assert!(matches!(
            Parser::parse(&mut dst, false, 100),
            Err(ProtocolError::MessageTooBig)
        ));
    }

    #[test]
    fn close_payload_roundtrip() {
        let reason = CloseReason::from((CloseCode::Normal, "bye"));
        let mut dst = BytesMut::new();
        Parser::write_close(&mut dst, Some(&reason), false);
        let frame = Parser::parse(&mut dst, false, 1 << 20).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
        let parsed = Parser::parse_close_payload(&frame.payload).unwrap().unwrap();
        assert_eq!(parsed, reason);
    }

    #[test]
    fn one_byte_close_payload_rejected() {
        assert!(matches!(
            Parser::parse_close_payload(&[0x03]),
            Err(ProtocolError::InvalidClosePayload)
        ));
    }
}
