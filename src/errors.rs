use thiserror::Error;

/// errors that can terminate a connection, from handshake through the read loop
#[derive(Debug, Error)]
pub enum WsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("allocation failed: requested {requested} bytes")]
    AllocFailed { requested: usize },

    #[error("handler rejected connection: {0}")]
    HandlerInit(String),
}

/// failures recognizing or validating the opening handshake request (§4.2)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed handshake request")]
    Invalid,

    #[error("handshake request exceeded handshake_max_size")]
    TooLarge,

    #[error("timed out waiting for handshake request")]
    Timeout,

    #[error("missing or invalid header: {0}")]
    MissingHeader(&'static str),
}

/// RFC 6455 invariant violations discovered while decoding frames (§4.3, §7)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("reserved bit set in frame header")]
    ReservedFlags,

    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("control frame payload exceeds 125 bytes")]
    LargeControl,

    #[error("control frame was fragmented (fin=0)")]
    FragmentedControl,

    #[error("client frame was not masked")]
    UnmaskedFrame,

    #[error("continuation frame received with no fragmented message in progress")]
    UnexpectedContinuation,

    #[error("data frame received while a fragmented message is already in progress")]
    NestedFragmentation,

    #[error("message exceeded max_size")]
    TooLarge,

    #[error("close frame payload of length 1 is invalid")]
    InvalidCloseFramePayload,

    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),

    #[error("close reason is not valid UTF-8")]
    InvalidUtf8,

    #[error("text message is not valid UTF-8")]
    InvalidTextUtf8,
}

impl ProtocolError {
    /// whether this error should trigger a best-effort CLOSE 1002 reply before
    /// the connection is torn down (§7: protocol errors vs. silent resource limits)
    pub fn should_reply_close(&self) -> bool {
        !matches!(self, ProtocolError::TooLarge)
    }
}
