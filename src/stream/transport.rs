//! Socket seam between the connection worker and the network.
//!
//! A [`Connector`] opens one duplex text channel per call and hands it back as
//! a [`SocketHandle`]: a sender for outbound frames and a receiver for inbound
//! frames. The receiver yielding `None` means the socket closed. Dropping the
//! outbound sender asks the transport to close the socket.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::stream::client::RoomClientError;

/// Future returned by [`Connector::connect`].
pub type ConnectFuture = BoxFuture<'static, Result<SocketHandle, RoomClientError>>;

/// Opens transport sockets for the connection worker.
pub trait Connector: Send + Sync + 'static {
    /// Opens a socket to `url`.
    ///
    /// Errors are reported to the worker, which treats them like a closure
    /// and schedules a reconnect.
    fn connect(&self, url: &str) -> ConnectFuture;
}

/// Text channel pair for one open socket.
#[derive(Debug)]
pub struct SocketHandle {
    /// Outbound frames. Dropping the sender closes the socket.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Inbound frames. `None` signals closure.
    pub inbound: mpsc::UnboundedReceiver<String>,
}

impl SocketHandle {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self { outbound, inbound }
    }
}

/// Websocket connector backed by `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> ConnectFuture {
        let url = url.to_string();
        Box::pin(async move {
            let request = url.as_str().into_client_request()?;
            let (socket, _) = connect_async(request).await?;

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            tokio::spawn(pump_socket(socket, outbound_rx, inbound_tx));

            Ok(SocketHandle::new(outbound_tx, inbound_rx))
        })
    }
}

async fn pump_socket<S>(
    mut socket: tokio_tungstenite::WebSocketStream<S>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    inbound_tx: mpsc::UnboundedSender<String>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        break;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(text).is_err() {
                            let _ = socket.close(None).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(event = "socket_close_frame", frame = ?frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(event = "socket_read_failed", error = %err);
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}
