use bytes::Bytes;

/// Transport-neutral websocket frame type.
///
/// This is the wire surface of the crate: transports convert their native frame
/// representation into/from `WsFrame`, and the connection manager never sees anything else.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsFrame {
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<WsCloseFrame>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WsCloseFrame {
    pub code: u16,
    pub reason: Bytes,
}

/// Close code sent when the client ends the session on purpose.
pub const CLOSE_NORMAL: u16 = 1000;

impl WsFrame {
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(Bytes::from(s.into()))
    }

    #[inline]
    pub fn text_static(s: &'static str) -> Self {
        Self::Text(Bytes::from_static(s.as_bytes()))
    }

    #[inline]
    pub fn close(code: u16, reason: Bytes) -> Self {
        Self::Close(Some(WsCloseFrame { code, reason }))
    }

    /// Close frame emitted by an explicit `disconnect()`.
    pub fn client_close() -> Self {
        Self::close(CLOSE_NORMAL, Bytes::from_static(b"client disconnect"))
    }

    /// Application payload of a data frame. Control frames carry none.
    #[inline]
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            WsFrame::Text(bytes) | WsFrame::Binary(bytes) => Some(bytes.as_ref()),
            _ => None,
        }
    }
}
