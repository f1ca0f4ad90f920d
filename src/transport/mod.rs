use std::future::Future;
use std::pin::Pin;

use futures_util::{Sink, Stream};

use crate::core::{StreamError, WebSocketBufferConfig, WsFrame};

pub mod tungstenite;

pub use self::tungstenite::{TungsteniteTransport, WsPeer, accept_async};

/// Future returned by [`WsTransport::connect`].
pub type WsTransportConnectFuture<R, W> =
    Pin<Box<dyn Future<Output = Result<(R, W), StreamError>> + Send>>;

/// Transport boundary for the metrics stream.
///
/// The read half is driven by a task outside the actor; the write half is owned by the
/// connection manager. Keeping this seam small lets tests swap in an in-memory transport
/// while the manager's state machine stays unchanged.
pub trait WsTransport: Clone + Send + Sync + 'static {
    type Reader: Stream<Item = Result<WsFrame, StreamError>> + Send + Unpin + 'static;
    type Writer: Sink<WsFrame, Error = StreamError> + Send + Sync + Unpin + 'static;

    fn connect(
        &self,
        url: String,
        buffers: WebSocketBufferConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer>;

    /// Whether the transport queues the Pong for an inbound Ping on its own.
    fn replies_to_pings(&self) -> bool {
        false
    }
}
