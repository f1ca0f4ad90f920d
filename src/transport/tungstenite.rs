use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, accept_async as tungstenite_accept,
    connect_async_tls_with_config as tungstenite_connect,
    tungstenite::{
        Message as TungsteniteMessage, Utf8Bytes,
        protocol::{CloseFrame as TungCloseFrame, WebSocketConfig},
    },
};

use super::{WsTransport, WsTransportConnectFuture};
use crate::core::{StreamError, StreamResult, WebSocketBufferConfig, WsCloseFrame, WsFrame};
use crate::tls::install_rustls_crypto_provider;

fn map_ws_error(context: &'static str, err: impl ToString) -> StreamError {
    StreamError::TransportError {
        context,
        error: err.to_string(),
    }
}

fn close_to_core(frame: Option<TungCloseFrame>) -> Option<WsCloseFrame> {
    frame.map(|f| WsCloseFrame {
        code: u16::from(f.code),
        reason: AsRef::<Bytes>::as_ref(&f.reason).clone(),
    })
}

fn core_to_close(frame: WsCloseFrame) -> TungCloseFrame {
    let reason = match std::str::from_utf8(frame.reason.as_ref()) {
        // SAFETY: validated as UTF-8 just above.
        Ok(_) => unsafe { Utf8Bytes::from_bytes_unchecked(frame.reason) },
        Err(_) => Utf8Bytes::from_static(""),
    };
    TungCloseFrame {
        code: frame.code.into(),
        reason,
    }
}

fn msg_to_frame(msg: TungsteniteMessage) -> WsFrame {
    match msg {
        TungsteniteMessage::Text(text) => WsFrame::Text(AsRef::<Bytes>::as_ref(&text).clone()),
        TungsteniteMessage::Binary(bytes) => WsFrame::Binary(bytes),
        TungsteniteMessage::Ping(bytes) => WsFrame::Ping(bytes),
        TungsteniteMessage::Pong(bytes) => WsFrame::Pong(bytes),
        TungsteniteMessage::Close(frame) => WsFrame::Close(close_to_core(frame)),
        TungsteniteMessage::Frame(_) => WsFrame::Binary(Bytes::new()),
    }
}

fn frame_to_msg(frame: WsFrame) -> TungsteniteMessage {
    match frame {
        WsFrame::Text(bytes) => match std::str::from_utf8(bytes.as_ref()) {
            // SAFETY: validated as UTF-8 just above.
            Ok(_) => TungsteniteMessage::Text(unsafe { Utf8Bytes::from_bytes_unchecked(bytes) }),
            Err(_) => TungsteniteMessage::Binary(bytes),
        },
        WsFrame::Binary(bytes) => TungsteniteMessage::Binary(bytes),
        WsFrame::Ping(bytes) => TungsteniteMessage::Ping(bytes),
        WsFrame::Pong(bytes) => TungsteniteMessage::Pong(bytes),
        WsFrame::Close(frame) => TungsteniteMessage::Close(frame.map(core_to_close)),
    }
}

fn socket_config(buffers: WebSocketBufferConfig) -> WebSocketConfig {
    WebSocketConfig::default()
        .read_buffer_size(buffers.read_buffer_bytes)
        .write_buffer_size(buffers.write_buffer_bytes)
        .max_write_buffer_size(buffers.max_write_buffer_bytes)
        .max_message_size(Some(buffers.max_message_bytes))
        .max_frame_size(Some(buffers.max_frame_bytes))
}

/// tokio-tungstenite transport for `ws://` and `wss://` endpoints.
///
/// Without an explicit connector, `wss://` uses rustls with the webpki root store.
#[derive(Clone, Default)]
pub struct TungsteniteTransport {
    connector: Option<Connector>,
}

impl TungsteniteTransport {
    pub fn with_connector(connector: Connector) -> Self {
        Self {
            connector: Some(connector),
        }
    }

    pub fn rustls(config: Arc<rustls::ClientConfig>) -> Self {
        Self::with_connector(Connector::Rustls(config))
    }
}

pub struct TungsteniteReader {
    inner: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl Stream for TungsteniteReader {
    type Item = Result<WsFrame, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(msg))) => Poll::Ready(Some(Ok(msg_to_frame(msg)))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(map_ws_error("read", err)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct TungsteniteWriter {
    inner: futures_util::stream::SplitSink<
        WebSocketStream<MaybeTlsStream<TcpStream>>,
        TungsteniteMessage,
    >,
}

impl Sink<WsFrame> for TungsteniteWriter {
    type Error = StreamError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_ready(cx)
            .map_err(|e| map_ws_error("write", e))
    }

    fn start_send(mut self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        Pin::new(&mut self.inner)
            .start_send(frame_to_msg(item))
            .map_err(|e| map_ws_error("write", e))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| map_ws_error("write", e))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(|e| map_ws_error("close", e))
    }
}

impl WsTransport for TungsteniteTransport {
    type Reader = TungsteniteReader;
    type Writer = TungsteniteWriter;

    fn connect(
        &self,
        url: String,
        buffers: WebSocketBufferConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer> {
        let connector = self.connector.clone();
        Box::pin(async move {
            buffers.validate()?;
            install_rustls_crypto_provider();

            // Nagle off: samples are small and latency-sensitive.
            let (stream, _response) =
                tungstenite_connect(url, Some(socket_config(buffers)), true, connector)
                    .await
                    .map_err(|e| map_ws_error("connect", e))?;

            let (write, read) = stream.split();
            Ok((
                TungsteniteReader { inner: read },
                TungsteniteWriter { inner: write },
            ))
        })
    }

    /// tungstenite queues a Pong for every Ping it reads.
    fn replies_to_pings(&self) -> bool {
        true
    }
}

/// Server side of an accepted websocket, used by local test servers and demos.
pub struct WsPeer {
    inner: WebSocketStream<TcpStream>,
}

impl WsPeer {
    pub async fn send(&mut self, frame: WsFrame) -> StreamResult<()> {
        self.inner
            .send(frame_to_msg(frame))
            .await
            .map_err(|e| map_ws_error("write", e))
    }

    /// Next frame from the client; `None` once the socket is closed.
    pub async fn next_frame(&mut self) -> Option<StreamResult<WsFrame>> {
        self.inner
            .next()
            .await
            .map(|res| res.map(msg_to_frame).map_err(|e| map_ws_error("read", e)))
    }

    pub async fn close(&mut self) -> StreamResult<()> {
        self.inner
            .close(None)
            .await
            .map_err(|e| map_ws_error("close", e))
    }
}

/// Accept an incoming websocket handshake on `stream`.
pub async fn accept_async(stream: TcpStream) -> StreamResult<WsPeer> {
    let inner = tungstenite_accept(stream)
        .await
        .map_err(|e| map_ws_error("accept", e))?;
    Ok(WsPeer { inner })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_frame_keeps_code_and_reason() {
        let msg = frame_to_msg(WsFrame::client_close());
        assert_eq!(msg_to_frame(msg), WsFrame::client_close());
    }

    #[test]
    fn invalid_utf8_text_is_sent_as_binary() {
        let msg = frame_to_msg(WsFrame::Text(Bytes::from_static(&[0xff, 0xfe])));
        assert!(matches!(msg, TungsteniteMessage::Binary(_)));
    }

    #[test]
    fn buffer_limits_map_onto_socket_config() {
        let buffers = WebSocketBufferConfig::default();
        let config = socket_config(buffers);
        assert_eq!(config.max_message_size, Some(buffers.max_message_bytes));
        assert_eq!(config.max_frame_size, Some(buffers.max_frame_bytes));
        assert_eq!(config.write_buffer_size, buffers.write_buffer_bytes);
    }

    #[tokio::test]
    async fn connect_rejects_write_limit_below_buffer_size() {
        let buffers = WebSocketBufferConfig {
            max_write_buffer_bytes: 64 << 10,
            ..WebSocketBufferConfig::default()
        };
        let result = TungsteniteTransport::default()
            .connect("ws://127.0.0.1:9/ws".to_string(), buffers)
            .await;
        assert!(matches!(result, Err(StreamError::InvalidState(_))));
    }

    #[test]
    fn answers_pings_itself() {
        assert!(TungsteniteTransport::default().replies_to_pings());
    }
}
