use core::fmt;

/// Frame operation codes of RFC 6455 §5.2.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum OpCode {
    /// continuation frame of a fragmented message.
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// any reserved opcode value.
    Bad,
}

impl OpCode {
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Continue => "CONTINUE",
            Self::Text => "TEXT",
            Self::Binary => "BINARY",
            Self::Close => "CLOSE",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Bad => "BAD",
        };
        f.write_str(name)
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        match op {
            OpCode::Continue => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
            // never serialized; encoding a Bad opcode is a caller bug and a
            // close frame tears the connection down fastest.
            OpCode::Bad => 8,
        }
    }
}

impl From<u8> for OpCode {
    fn from(byte: u8) -> OpCode {
        match byte {
            0 => OpCode::Continue,
            1 => OpCode::Text,
            2 => OpCode::Binary,
            8 => OpCode::Close,
            9 => OpCode::Ping,
            10 => OpCode::Pong,
            _ => OpCode::Bad,
        }
    }
}

/// Close status codes of RFC 6455 §7.4.1.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum CloseCode {
    Normal,
    Away,
    Protocol,
    Unsupported,
    Abnormal,
    Invalid,
    Policy,
    Size,
    Extension,
    Error,
    Restart,
    Again,
    Other(u16),
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Other(code) => code,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            code => CloseCode::Other(code),
        }
    }
}

/// Close code plus optional UTF-8 reason text.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct CloseReason {
    pub code: CloseCode,
    pub description: Option<String>,
}

impl From<CloseCode> for CloseReason {
    fn from(code: CloseCode) -> Self {
        CloseReason {
            code,
            description: None,
        }
    }
}

impl<T: Into<String>> From<(CloseCode, T)> for CloseReason {
    fn from((code, description): (CloseCode, T)) -> Self {
        CloseReason {
            code,
            description: Some(description.into()),
        }
    }
}

/// The protocol GUID of RFC 6455 §1.3.
const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Hash a `Sec-WebSocket-Key` value into the accept value:
/// `base64(sha1(key ++ GUID))`, always 28 bytes.
pub fn hash_key(key: &[u8]) -> [u8; 28] {
    let hash = {
        use sha1::Digest as _;

        let mut hasher = sha1::Sha1::new();
        hasher.update(key);
        hasher.update(WS_GUID);
        hasher.finalize()
    };

    let mut out = [0; 28];
    let n = base64::engine::Engine::encode_slice(&base64::engine::general_purpose::STANDARD, hash, &mut out).unwrap();
    debug_assert_eq!(n, 28);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn opcode_conversions() {
        for byte in [0u8, 1, 2, 8, 9, 10] {
            let op = OpCode::from(byte);
            assert_ne!(op, OpCode::Bad);
            assert_eq!(u8::from(op), byte);
        }
        for byte in [3u8, 4, 5, 6, 7, 11, 15, 99] {
            assert_eq!(OpCode::from(byte), OpCode::Bad);
        }
    }

    #[test]
    fn control_opcodes() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Continue.is_control());
    }

    #[test]
    fn close_code_roundtrip() {
        for code in [1000u16, 1001, 1002, 1003, 1006, 1007, 1008, 1009, 1010, 1011, 1012, 1013, 4000] {
            assert_eq!(u16::from(CloseCode::from(code)), code);
        }
    }

    #[test]
    fn rfc_sample_key_hash() {
        assert_eq!(&hash_key(b"dGhlIHNhbXBsZSBub25jZQ=="), b"s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }
}
