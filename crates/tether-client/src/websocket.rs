//! WebSocket transport built on tokio-tungstenite.

use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::transport::{
    close_code, ConnectTarget, Connector, OutboundFrame, TransportEvent, TransportLink,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket connections (`ws://` or `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(&self, target: ConnectTarget) -> BoxFuture<'_, Result<TransportLink, ClientError>> {
        Box::pin(async move {
            let mut request = target
                .url
                .as_str()
                .into_client_request()
                .map_err(|e| ClientError::Config(format!("invalid gateway url: {e}")))?;

            if let Some(token) = &target.auth_token {
                let value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| ClientError::Config(format!("invalid auth token: {e}")))?;
                request.headers_mut().insert(AUTHORIZATION, value);
            }

            debug!(url = %target.url, "opening websocket");
            let (ws_stream, _) = timeout(
                target.connect_timeout,
                tokio_tungstenite::connect_async(request),
            )
            .await
            .map_err(|_| ClientError::Transport("connection timeout".to_string()))?
            .map_err(|e| ClientError::Transport(format!("failed to connect: {e}")))?;

            let (write, read) = ws_stream.split();
            let buffer = target.buffer.max(1);
            let (out_tx, out_rx) = mpsc::channel::<OutboundFrame>(buffer);
            let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(buffer);

            tokio::spawn(reader_task(read, in_tx));
            tokio::spawn(writer_task(write, out_rx));

            Ok(TransportLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}

async fn reader_task(mut read: SplitStream<WsStream>, tx: mpsc::Sender<TransportEvent>) {
    while let Some(msg) = read.next().await {
        let event = match msg {
            Ok(Message::Text(text)) => TransportEvent::Text(text.as_str().to_owned()),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => TransportEvent::Text(text),
                Err(_) => {
                    warn!("dropping non-utf8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                let (code, reason) = frame.map_or_else(
                    || (close_code::NORMAL, String::new()),
                    |f| (u16::from(f.code), f.reason.as_str().to_owned()),
                );
                let _ = tx.send(TransportEvent::Closed { code, reason }).await;
                return;
            }
            // Ping/Pong are answered by tungstenite itself.
            Ok(_) => continue,
            Err(e) => {
                let reason = e.to_string();
                let _ = tx.send(TransportEvent::Error(reason.clone())).await;
                let _ = tx
                    .send(TransportEvent::Closed {
                        code: close_code::ABNORMAL,
                        reason,
                    })
                    .await;
                return;
            }
        };

        if tx.send(event).await.is_err() {
            return;
        }
    }

    let _ = tx
        .send(TransportEvent::Closed {
            code: close_code::ABNORMAL,
            reason: "connection closed".to_string(),
        })
        .await;
}

async fn writer_task(
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<OutboundFrame>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            OutboundFrame::Text(json) => {
                if let Err(e) = write.send(Message::Text(json.into())).await {
                    debug!(error = %e, "websocket write failed");
                    break;
                }
            }
            OutboundFrame::Close { code, reason } => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                let _ = write.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }

    let _ = write.close().await;
}
