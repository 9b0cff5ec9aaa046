use core::fmt;

/// Upgrade request validation failures.
#[derive(Debug, Eq, PartialEq)]
pub enum HandshakeError {
    /// only GET requests can upgrade.
    GetMethodRequired,
    /// upgrades require HTTP/1.1.
    WrongHttpVersion,
    /// `Upgrade: websocket` header missing or wrong.
    NoWebsocketUpgrade,
    /// `Connection` header does not contain `upgrade`.
    NoConnectionUpgrade,
    /// `Sec-WebSocket-Version` header missing.
    NoVersionHeader,
    /// only protocol version 13 is served.
    UnsupportedVersion,
    /// `Sec-WebSocket-Key` header missing.
    BadWebsocketKey,
    /// the request origin failed the origin policy.
    OriginRejected,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::GetMethodRequired => "method must be GET",
            Self::WrongHttpVersion => "HTTP/1.1 required",
            Self::NoWebsocketUpgrade => "upgrade header is not websocket",
            Self::NoConnectionUpgrade => "connection header does not include upgrade",
            Self::NoVersionHeader => "sec-websocket-version header missing",
            Self::UnsupportedVersion => "only websocket version 13 is supported",
            Self::BadWebsocketKey => "sec-websocket-key header missing",
            Self::OriginRejected => "origin not allowed",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for HandshakeError {}

/// Frame and message level protocol violations.
#[derive(Debug)]
pub enum ProtocolError {
    /// reserved opcode received.
    BadOpCode,
    /// control frame longer than 125 bytes.
    ControlFrameTooBig,
    /// control frame with the fin bit clear.
    FragmentedControlFrame,
    /// 64 bit length with the high bit set, or length fields lying.
    InvalidLength,
    /// RSV bit set outside a negotiated extension.
    InvalidRsv,
    /// client to server frame without a mask.
    UnmaskedFrame,
    /// server to client frame with a mask.
    MaskedFrame,
    /// continuation frame without an open message.
    ContinuationNotStarted,
    /// new data frame while a fragmented message is open.
    ContinuationStarted,
    /// message (or its decompressed form) exceeds `max_message_size`.
    MessageTooBig,
    /// text message that is not valid UTF-8.
    InvalidUtf8,
    /// close frame payload of one byte, or an invalid close code.
    InvalidClosePayload,
    /// permessage-deflate processing failed.
    Deflate(std::io::Error),
    /// operation on a closed websocket.
    Closed,
    /// the underlying stream failed.
    Stream(gale_io::StreamError),
}

impl ProtocolError {
    /// close code a conforming endpoint sends for this violation.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::MessageTooBig => 1009,
            Self::InvalidUtf8 => 1007,
            _ => 1002,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadOpCode => f.write_str("reserved opcode"),
            Self::ControlFrameTooBig => f.write_str("control frame payload over 125 bytes"),
            Self::FragmentedControlFrame => f.write_str("fragmented control frame"),
            Self::InvalidLength => f.write_str("invalid payload length"),
            Self::InvalidRsv => f.write_str("reserved bits set without negotiated extension"),
            Self::UnmaskedFrame => f.write_str("client frame without mask"),
            Self::MaskedFrame => f.write_str("masked server frame"),
            Self::ContinuationNotStarted => f.write_str("continuation without started message"),
            Self::ContinuationStarted => f.write_str("data frame interleaved into fragmented message"),
            Self::MessageTooBig => f.write_str("message exceeds size limit"),
            Self::InvalidUtf8 => f.write_str("text message is not valid utf-8"),
            Self::InvalidClosePayload => f.write_str("malformed close frame payload"),
            Self::Deflate(e) => write!(f, "permessage-deflate failed: {e}"),
            Self::Closed => f.write_str("websocket is closed"),
            Self::Stream(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<gale_io::StreamError> for ProtocolError {
    fn from(e: gale_io::StreamError) -> Self {
        Self::Stream(e)
    }
}
