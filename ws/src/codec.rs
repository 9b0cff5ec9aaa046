use bytes::{Bytes, BytesMut};

use crate::{
    error::ProtocolError,
    frame::Parser,
    proto::{CloseReason, OpCode},
};

/// A decoded WebSocket event at frame granularity. Fragmented messages
/// surface as [Message::Continuation] items and are assembled by the
/// connection layer.
#[derive(Debug, Eq, PartialEq)]
pub enum Message {
    /// complete text message. UTF-8 validation happens after decompression,
    /// in the connection layer.
    Text { payload: Bytes, compressed: bool },
    /// complete binary message.
    Binary { payload: Bytes, compressed: bool },
    Continuation(Item),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseReason>),
}

/// One fragment of a fragmented message.
#[derive(Debug, Eq, PartialEq)]
pub enum Item {
    FirstText { payload: Bytes, compressed: bool },
    FirstBinary { payload: Bytes, compressed: bool },
    Continue(Bytes),
    Last(Bytes),
}

/// Frame codec tracking fragmentation state and extension negotiation.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    server: bool,
    /// permessage-deflate was negotiated; RSV1 is legal on message heads.
    deflate: bool,
    continuation_started: bool,
    max_size: usize,
}

impl Codec {
    /// new codec in server mode: inbound frames must be masked, outbound
    /// frames are not.
    pub const fn new() -> Self {
        Self {
            server: true,
            deflate: false,
            continuation_started: false,
            max_size: 10 * 1024 * 1024,
        }
    }

    /// flip to client mode: outbound frames are masked.
    pub fn client_mode(mut self) -> Self {
        self.server = false;
        self
    }

    /// allow RSV1 on message heads.
    pub fn with_deflate(mut self) -> Self {
        self.deflate = true;
        self
    }

    /// cap a single message (frame or assembled fragments).
    pub fn max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    pub fn max_message_size(&self) -> usize {
        self.max_size
    }

    /// decode the next frame out of `src`. `Ok(None)` means more input is
    /// needed.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        let frame = match Parser::parse(src, self.server, self.max_size)? {
            Some(frame) => frame,
            None => return Ok(None),
        };

        if frame.rsv1 && (!self.deflate || frame.opcode == OpCode::Continue || frame.opcode.is_control()) {
            // RSV1 is only meaningful on the head frame of a data message
            // under negotiated permessage-deflate.
            return Err(ProtocolError::InvalidRsv);
        }

        let payload = frame.payload.freeze();
        let compressed = frame.rsv1;

        let message = match frame.opcode {
            OpCode::Continue if !self.continuation_started => return Err(ProtocolError::ContinuationNotStarted),
            OpCode::Continue => {
                if frame.fin {
                    self.continuation_started = false;
                    Message::Continuation(Item::Last(payload))
                } else {
                    Message::Continuation(Item::Continue(payload))
                }
            }
            OpCode::Text | OpCode::Binary if self.continuation_started => {
                return Err(ProtocolError::ContinuationStarted);
            }
            OpCode::Text if !frame.fin => {
                self.continuation_started = true;
                Message::Continuation(Item::FirstText { payload, compressed })
            }
            OpCode::Binary if !frame.fin => {
                self.continuation_started = true;
                Message::Continuation(Item::FirstBinary { payload, compressed })
            }
            OpCode::Text => Message::Text { payload, compressed },
            OpCode::Binary => Message::Binary { payload, compressed },
            OpCode::Close => Message::Close(Parser::parse_close_payload(&payload)?),
            OpCode::Ping => Message::Ping(payload),
            OpCode::Pong => Message::Pong(payload),
            OpCode::Bad => return Err(ProtocolError::BadOpCode),
        };

        Ok(Some(message))
    }

    /// encode one message as a single frame.
    pub fn encode(&mut self, message: Message, dst: &mut BytesMut) {
        let mask = !self.server;
        match message {
            Message::Text { payload, compressed } => {
                Parser::write_message(dst, &payload, OpCode::Text, true, compressed, mask)
            }
            Message::Binary { payload, compressed } => {
                Parser::write_message(dst, &payload, OpCode::Binary, true, compressed, mask)
            }
            Message::Ping(payload) => Parser::write_message(dst, &payload, OpCode::Ping, true, false, mask),
            Message::Pong(payload) => Parser::write_message(dst, &payload, OpCode::Pong, true, false, mask),
            Message::Close(reason) => Parser::write_close(dst, reason.as_ref(), mask),
            Message::Continuation(item) => match item {
                Item::FirstText { payload, compressed } => {
                    Parser::write_message(dst, &payload, OpCode::Text, false, compressed, mask)
                }
                Item::FirstBinary { payload, compressed } => {
                    Parser::write_message(dst, &payload, OpCode::Binary, false, compressed, mask)
                }
                Item::Continue(payload) => Parser::write_message(dst, &payload, OpCode::Continue, false, false, mask),
                Item::Last(payload) => Parser::write_message(dst, &payload, OpCode::Continue, true, false, mask),
            },
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(server_to_client: Message) -> Message {
        let mut server = Codec::new();
        let mut client = Codec::new().client_mode();
        let mut wire = BytesMut::new();
        server.encode(server_to_client, &mut wire);
        client.decode(&mut wire).unwrap().unwrap()
    }

    #[test]
    fn text_roundtrip() {
        let msg = roundtrip(Message::Text {
            payload: Bytes::from_static(b"ping"),
            compressed: false,
        });
        assert_eq!(
            msg,
            Message::Text {
                payload: Bytes::from_static(b"ping"),
                compressed: false
            }
        );
    }

    #[test]
    fn client_frames_are_masked_on_the_wire() {
        let mut client = Codec::new().client_mode();
        let mut wire = BytesMut::new();
        client.encode(
            Message::Text {
                payload: Bytes::from_static(b"hello"),
                compressed: false,
            },
            &mut wire,
        );
        assert_eq!(wire[1] & 0x80, 0x80, "mask bit must be set");
        // masked payload differs from the clear text (mask key is random
        // but never all zero in practice; compare via decode instead).
        let mut server = Codec::new();
        let msg = server.decode(&mut wire).unwrap().unwrap();
        assert_eq!(
            msg,
            Message::Text {
                payload: Bytes::from_static(b"hello"),
                compressed: false
            }
        );
    }

    #[test]
    fn fragmented_message_items() {
        let mut server = Codec::new();
        let mut client = Codec::new().client_mode();
        let mut wire = BytesMut::new();

        server.encode(
            Message::Continuation(Item::FirstText {
                payload: Bytes::from_static(b"he"),
                compressed: false,
            }),
            &mut wire,
        );
        server.encode(Message::Continuation(Item::Continue(Bytes::from_static(b"ll"))), &mut wire);
        server.encode(Message::Continuation(Item::Last(Bytes::from_static(b"o"))), &mut wire);

        let mut got = Vec::new();
        while let Some(msg) = client.decode(&mut wire).unwrap() {
            got.push(msg);
        }
        assert_eq!(
            got,
            vec![
                Message::Continuation(Item::FirstText {
                    payload: Bytes::from_static(b"he"),
                    compressed: false
                }),
                Message::Continuation(Item::Continue(Bytes::from_static(b"ll"))),
                Message::Continuation(Item::Last(Bytes::from_static(b"o"))),
            ]
        );
    }

    #[test]
    fn continuation_without_start_rejected() {
        let mut codec = Codec::new().client_mode();
        let mut wire = BytesMut::new();
        Parser::write_message(&mut wire, b"x", OpCode::Continue, true, false, false);
        assert!(matches!(
            codec.decode(&mut wire),
            Err(ProtocolError::ContinuationNotStarted)
        ));
    }

    #[test]
    fn interleaved_data_frame_rejected() {
        let mut codec = Codec::new().client_mode();
        let mut wire = BytesMut::new();
        Parser::write_message(&mut wire, b"a", OpCode::Text, false, false, false);
        codec.decode(&mut wire).unwrap().unwrap();
        Parser::write_message(&mut wire, b"b", OpCode::Text, true, false, false);
        assert!(matches!(codec.decode(&mut wire), Err(ProtocolError::ContinuationStarted)));
    }

    #[test]
    fn rsv1_without_deflate_rejected() {
        let mut codec = Codec::new().client_mode();
        let mut wire = BytesMut::new();
        Parser::write_message(&mut wire, b"x", OpCode::Text, true, true, false);
        assert!(matches!(codec.decode(&mut wire), Err(ProtocolError::InvalidRsv)));
    }

    #[test]
    fn rsv1_with_deflate_accepted_on_head_only() {
        let mut codec = Codec::new().client_mode().with_deflate();
        let mut wire = BytesMut::new();
        Parser::write_message(&mut wire, b"x", OpCode::Text, true, true, false);
        let msg = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(
            msg,
            Message::Text {
                payload: Bytes::from_static(b"x"),
                compressed: true
            }
        );

        // continuation frames must not set RSV1 even under deflate.
        Parser::write_message(&mut wire, b"a", OpCode::Text, false, false, false);
        codec.decode(&mut wire).unwrap().unwrap();
        Parser::write_message(&mut wire, b"b", OpCode::Continue, true, true, false);
        assert!(matches!(codec.decode(&mut wire), Err(ProtocolError::InvalidRsv)));
    }
}
